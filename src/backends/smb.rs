//! SMB
//!
//! `smb://[user:pass@]host/share/path`. The first path component is the
//! share and the root lists shares; connectors enumerate them over `IPC$`
//! when the session connects.

use crate::backends::remote::{RemoteConnector, RemoteFilesystem, RemoteProfile};
use crate::error::Result;
use crate::url::Url;
use crate::vfs::{Filesystem, VFile, Vfs};
use std::sync::Arc;

pub const SMB_PORT: u16 = 445;

pub const SMB: RemoteProfile = RemoteProfile {
    scheme: "smb",
    default_port: SMB_PORT,
    rooted: true,
    wildcards: false,
    skip_hidden: false,
};

pub struct SmbFilesystem {
    inner: RemoteFilesystem,
}

impl SmbFilesystem {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            inner: RemoteFilesystem::new(SMB, connector),
        }
    }
}

impl Filesystem for SmbFilesystem {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handles(&self, url: &Url) -> bool {
        self.inner.handles(url)
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        self.inner.get_file(vfs, url)
    }
}

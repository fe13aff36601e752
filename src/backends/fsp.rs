//! FSP (File Service Protocol)
//!
//! Keep-alive is a `stat("/")`, which is what [`RemoteClient::ping`] does
//! unless a client overrides it.
//!
//! [`RemoteClient::ping`]: crate::backends::remote::RemoteClient::ping

use crate::backends::remote::{RemoteConnector, RemoteFilesystem, RemoteProfile};
use crate::error::Result;
use crate::url::Url;
use crate::vfs::{Filesystem, VFile, Vfs};
use std::sync::Arc;

pub const FSP_PORT: u16 = 21;

pub const FSP: RemoteProfile = RemoteProfile {
    scheme: "fsp",
    default_port: FSP_PORT,
    rooted: false,
    wildcards: false,
    skip_hidden: true,
};

pub struct FspFilesystem {
    inner: RemoteFilesystem,
}

impl FspFilesystem {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            inner: RemoteFilesystem::new(FSP, connector),
        }
    }
}

impl Filesystem for FspFilesystem {
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

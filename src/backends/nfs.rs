//! NFS
//!
//! The first path component names the export: `nfs://nas/exports/games/x.d64`
//! opens `/games/x.d64` on export `exports`. The root lists the exports. A
//! wildcard file name (`nfs://nas/share/*.d64`) resolves to the first match
//! in its directory.

use crate::backends::remote::{RemoteConnector, RemoteFilesystem, RemoteProfile};
use crate::error::Result;
use crate::url::Url;
use crate::vfs::{Filesystem, VFile, Vfs};
use std::sync::Arc;

pub const NFS_PORT: u16 = 2049;

pub const NFS: RemoteProfile = RemoteProfile {
    scheme: "nfs",
    default_port: NFS_PORT,
    rooted: true,
    wildcards: true,
    skip_hidden: false,
};

/// NFS client filesystem; the connector supplies per-export mounts
pub struct NfsFilesystem {
    inner: RemoteFilesystem,
}

impl NfsFilesystem {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            inner: RemoteFilesystem::new(NFS, connector),
        }
    }
}

impl Filesystem for NfsFilesystem {
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

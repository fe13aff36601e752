use crate::archive::ArchiveFilesystem;
use crate::backends::digest::DigestFilesystem;
use crate::backends::ftp::FtpFilesystem;
use crate::backends::http::HttpFilesystem;
use crate::backends::irc::IrcFilesystem;
use crate::backends::link::LinkFilesystem;
use crate::backends::local::LocalFilesystem;
#[cfg(feature = "mdns")]
use crate::backends::mdns::{MdnsFilesystem, MdnsSdBrowser};
use crate::backends::mqtt::MqttFilesystem;
#[cfg(feature = "sftp")]
use crate::backends::sftp::SftpFilesystem;
use crate::backends::tcp::TcpFilesystem;
use crate::backends::tnfs::TnfsFilesystem;
use crate::backends::webdav::WebDavFilesystem;
use crate::cache::CachePolicy;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::session::SessionBroker;
use crate::url::Url;
use crate::vfs::{OpenMode, VFile, VStream};
use std::sync::Arc;
use tracing::{debug, trace};

/// A backend reachable through the registry
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;

    /// True when this filesystem serves `url`
    fn handles(&self, url: &Url) -> bool;

    /// Extension-matched filesystems (containers, links) are consulted
    /// before scheme-matched ones and skipped when resolving the raw bytes
    /// of a container.
    fn by_extension(&self) -> bool {
        false
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>>;
}

/// True when `name` ends with one of `extensions` (case-insensitive).
///
/// Hidden names and names without a dot never match.
pub fn by_extension(extensions: &[&str], name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') || !name.contains('.') {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    extensions.iter().any(|ext| lower.ends_with(ext))
}

/// Ordered dispatch table; the first filesystem that handles a URL wins
#[derive(Default)]
pub struct FilesystemRegistry {
    filesystems: Vec<Arc<dyn Filesystem>>,
    fallback: Option<Arc<dyn Filesystem>>,
}

impl FilesystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filesystem; extension-matched ones stay ahead of the rest.
    /// A filesystem with the name of one already registered replaces it.
    pub fn register(&mut self, fs: Arc<dyn Filesystem>) {
        if let Some(at) = self.filesystems.iter().position(|existing| existing.name() == fs.name()) {
            debug!(name = fs.name(), "filesystem replaced");
            self.filesystems[at] = fs;
            return;
        }
        if fs.by_extension() {
            let at = self
                .filesystems
                .iter()
                .position(|existing| !existing.by_extension())
                .unwrap_or(self.filesystems.len());
            self.filesystems.insert(at, fs);
        } else {
            self.filesystems.push(fs);
        }
    }

    /// Filesystem used for bare paths and `file:` URLs
    pub fn set_fallback(&mut self, fs: Arc<dyn Filesystem>) {
        self.fallback = Some(fs);
    }

    pub fn names(&self) -> Vec<String> {
        self.filesystems.iter().map(|fs| fs.name().to_string()).collect()
    }

    pub fn find(&self, url: &Url) -> Option<&Arc<dyn Filesystem>> {
        self.select(url, true)
    }

    /// Like `find`, ignoring extension-matched filesystems
    pub fn find_direct(&self, url: &Url) -> Option<&Arc<dyn Filesystem>> {
        self.select(url, false)
    }

    fn select(&self, url: &Url, with_extensions: bool) -> Option<&Arc<dyn Filesystem>> {
        let found = self
            .filesystems
            .iter()
            .filter(|fs| with_extensions || !fs.by_extension())
            .find(|fs| fs.handles(url));
        if found.is_some() {
            return found;
        }
        match url.scheme() {
            "" | "file" => self.fallback.as_ref(),
            _ => None,
        }
    }
}

struct VfsInner {
    config: RelayConfig,
    broker: Arc<SessionBroker>,
    registry: FilesystemRegistry,
    cache: CachePolicy,
}

/// Entry point: the registry, the session broker and the cache policy
///
/// Cloning is cheap; files keep a clone to reach sessions and nested
/// sources.
#[derive(Clone)]
pub struct Vfs {
    inner: Arc<VfsInner>,
}

impl Vfs {
    /// Vfs with every built-in filesystem
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::builder(config).standard_filesystems().build()
    }

    pub fn builder(config: RelayConfig) -> VfsBuilder {
        VfsBuilder {
            config,
            registry: FilesystemRegistry::new(),
            cache: None,
            fallback: true,
        }
    }

    /// Resolve a URL to a file of the first filesystem that handles it
    pub fn get_file(&self, url: &str) -> Result<Box<dyn VFile>> {
        let url = Url::parse(url)?;
        self.get_file_url(&url)
    }

    pub fn get_file_url(&self, url: &Url) -> Result<Box<dyn VFile>> {
        let fs = self
            .inner
            .registry
            .find(url)
            .ok_or_else(|| RelayError::UnsupportedScheme(url.to_string()))?;
        trace!(url = %url, fs = fs.name(), "dispatch");
        fs.get_file(self, url)
    }

    /// Resolve without extension-matched filesystems, used to reach the raw
    /// bytes behind a container or link
    pub fn get_direct_file(&self, url: &Url) -> Result<Box<dyn VFile>> {
        let fs = self
            .inner
            .registry
            .find_direct(url)
            .ok_or_else(|| RelayError::UnsupportedScheme(url.to_string()))?;
        fs.get_file(self, url)
    }

    /// Open a stream in one step
    pub fn open(&self, url: &str, mode: OpenMode) -> Result<Box<dyn VStream>> {
        self.get_file(url)?.source_stream(mode)
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.inner.broker
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.inner.cache
    }

    pub fn registry(&self) -> &FilesystemRegistry {
        &self.inner.registry
    }

    /// Stop the sweep thread and drop all sessions
    pub fn shutdown(&self) {
        self.inner.broker.shutdown();
    }
}

/// Assembles a [`Vfs`]
pub struct VfsBuilder {
    config: RelayConfig,
    registry: FilesystemRegistry,
    cache: Option<CachePolicy>,
    fallback: bool,
}

impl VfsBuilder {
    /// Built-in filesystems. SFTP and mDNS come with the `sftp` and `mdns`
    /// features; NFS, SMB and FSP need a host-supplied connector.
    pub fn standard_filesystems(mut self) -> Self {
        let http = self.config.http.clone();
        let network = self.config.network.clone();
        self.registry.register(Arc::new(ArchiveFilesystem::new()));
        self.registry.register(Arc::new(LinkFilesystem::new()));
        self.registry.register(Arc::new(DigestFilesystem::new()));
        self.registry.register(Arc::new(HttpFilesystem::new(http.clone())));
        self.registry.register(Arc::new(WebDavFilesystem::new(http)));
        self.registry.register(Arc::new(FtpFilesystem::new(network.clone())));
        self.registry.register(Arc::new(TnfsFilesystem::new(network.clone())));
        self.registry.register(Arc::new(TcpFilesystem::new(network.clone())));
        self.registry.register(Arc::new(MqttFilesystem::new(network.clone())));
        #[cfg(feature = "sftp")]
        self.registry.register(Arc::new(SftpFilesystem::ssh2(network.clone())));
        #[cfg(feature = "mdns")]
        self.registry.register(Arc::new(MdnsFilesystem::new(Arc::new(MdnsSdBrowser::new(
            network.mdns_browse(),
        )))));
        self.registry.register(Arc::new(IrcFilesystem::new(network)));
        self
    }

    pub fn filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.registry.register(fs);
        self
    }

    /// Override the cache policy derived from configuration
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Leave bare paths unresolved instead of using the local filesystem
    pub fn without_local(mut self) -> Self {
        self.fallback = false;
        self
    }

    pub fn build(mut self) -> Result<Vfs> {
        self.config.validate()?;
        if self.fallback {
            self.registry.set_fallback(Arc::new(LocalFilesystem::new()));
        }
        let broker = Arc::new(SessionBroker::new(self.config.broker.clone()));
        broker.init()?;
        let cache = self
            .cache
            .unwrap_or_else(|| CachePolicy::from_config(&self.config.cache));
        debug!(filesystems = ?self.registry.names(), "vfs ready");
        Ok(Vfs {
            inner: Arc::new(VfsInner {
                config: self.config,
                broker,
                registry: self.registry,
                cache,
            }),
        })
    }
}

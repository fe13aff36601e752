use crate::archive::container::ArchiveContainer;
use crate::archive::reader::ArchiveEntry;
use crate::archive::ARCHIVE_EXTENSIONS;
use crate::cache::CachedFile;
use crate::error::{Errno, RelayError, Result};
use crate::session::{Session, SessionKey, SessionState};
use crate::url::Url;
use crate::vfs::{by_extension, DirCursor, Filesystem, OpenMode, StreamCore, VFile, VStream, Vfs};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Extracted entries and the listing of one container
///
/// Keyed `archive://<container-url>`. Nothing is probed: the keep-alive
/// interval is zero and disposal only drops the cached entries.
pub struct ArchiveSession {
    state: SessionState,
    container: Url,
    listing: Mutex<Option<Arc<Vec<ArchiveEntry>>>>,
}

impl ArchiveSession {
    pub fn key_for(container: &Url) -> SessionKey {
        SessionKey::resource("archive", &container.to_string())
    }

    pub fn new(key: SessionKey, container: Url) -> Self {
        Self {
            state: SessionState::new(key).with_keep_alive(Duration::ZERO),
            container,
            listing: Mutex::new(None),
        }
    }

    pub fn container(&self) -> &Url {
        &self.container
    }

    /// Regular files of the container, read once per session
    pub fn entries(&self, vfs: &Vfs) -> Result<Arc<Vec<ArchiveEntry>>> {
        let mut listing = self.listing.lock();
        if let Some(entries) = listing.as_ref() {
            return Ok(entries.clone());
        }
        let _io = self.state.begin_io();
        let mut source = open_source(vfs, &self.container)?;
        let entries = {
            let mut container =
                ArchiveContainer::new(source.as_mut(), self.container.to_string(), &vfs.config().archive);
            container.open()?;
            container.list()?
        };
        source.close();
        debug!(container = %self.container, entries = entries.len(), "container listed");
        let entries = Arc::new(entries);
        *listing = Some(entries.clone());
        Ok(entries)
    }

    /// Extract the first entry matching `pattern`, or reuse the cached copy
    pub fn materialise(&self, vfs: &Vfs, pattern: &str) -> Result<Arc<CachedFile>> {
        if let Some(file) = self.state.cached_file(pattern) {
            trace!(entry = pattern, "cached entry");
            return Ok(file);
        }
        let _io = self.state.begin_io();
        let mut source = open_source(vfs, &self.container)?;
        let extracted = {
            let mut container =
                ArchiveContainer::new(source.as_mut(), self.container.to_string(), &vfs.config().archive);
            container.open()?;
            if !container.seek_entry_name(pattern)? {
                return Err(RelayError::EntryNotFound(format!("{} in {}", pattern, self.container)));
            }
            let name = container
                .entry()
                .map(|entry| entry.name.clone())
                .unwrap_or_else(|| pattern.to_string());
            let buffer = container.extract(vfs.cache_policy())?;
            CachedFile::new(name, buffer)
        };
        source.close();

        let file = Arc::new(extracted);
        self.state.cache_file(pattern, file.clone());
        Ok(file)
    }
}

impl Session for ArchiveSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set_connected(false);
        self.state.clear_files();
        *self.listing.lock() = None;
    }

    fn keep_alive(&self) -> bool {
        true
    }
}

/// Serves paths inside containers: `<container-url>/<path in archive>`
#[derive(Debug, Default)]
pub struct ArchiveFilesystem;

impl ArchiveFilesystem {
    pub fn new() -> Self {
        Self
    }
}

impl Filesystem for ArchiveFilesystem {
    fn name(&self) -> &str {
        "archive"
    }

    fn handles(&self, url: &Url) -> bool {
        url.is_hierarchical() && split_container(url).is_some()
    }

    fn by_extension(&self) -> bool {
        true
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        Ok(Box::new(ArchiveFile::new(vfs.clone(), url.clone())?))
    }
}

/// Split at the last path segment naming a container
pub fn split_container(url: &Url) -> Option<(Url, String)> {
    let segments = url.segments();
    let at = segments
        .iter()
        .rposition(|segment| by_extension(ARCHIVE_EXTENSIONS, segment))?;
    let lead = if url.path().starts_with('/') { "/" } else { "" };
    let container = url.with_path(&format!("{}{}", lead, segments[..=at].join("/")));
    Some((container, segments[at + 1..].join("/")))
}

/// Raw bytes of a container: through an enclosing container when nested,
/// otherwise straight from the transport
fn open_source(vfs: &Vfs, container: &Url) -> Result<Box<dyn VStream>> {
    let segments = container.segments();
    let nested = segments
        .iter()
        .take(segments.len().saturating_sub(1))
        .any(|segment| by_extension(ARCHIVE_EXTENSIONS, segment));
    let mut file = if nested {
        vfs.get_file_url(container)?
    } else {
        vfs.get_direct_file(container)?
    };
    file.source_stream(OpenMode::IN)
}

#[derive(Debug, Clone)]
struct Child {
    name: String,
    directory: bool,
}

/// A container, a directory inside one, or one of its entries
pub struct ArchiveFile {
    vfs: Vfs,
    url: Url,
    container: Url,
    inner: String,
    session: Option<Arc<ArchiveSession>>,
    children: DirCursor<Child>,
}

impl ArchiveFile {
    pub fn new(vfs: Vfs, url: Url) -> Result<Self> {
        let (container, inner) = split_container(&url)
            .ok_or_else(|| RelayError::InvalidUrl(format!("no container in {}", url)))?;
        Ok(Self {
            vfs,
            url,
            container,
            inner,
            session: None,
            children: DirCursor::new(),
        })
    }

    pub fn container(&self) -> &Url {
        &self.container
    }

    /// Path inside the container, empty for the container itself
    pub fn inner_path(&self) -> &str {
        &self.inner
    }

    fn session(&mut self) -> Result<Arc<ArchiveSession>> {
        if let Some(session) = &self.session {
            if session.is_connected() {
                return Ok(session.clone());
            }
        }
        let container = self.container.clone();
        let session = self
            .vfs
            .broker()
            .obtain(ArchiveSession::key_for(&container), move |key| ArchiveSession::new(key, container))?;
        self.session = Some(session.clone());
        Ok(session)
    }

    fn entries(&mut self) -> Result<Arc<Vec<ArchiveEntry>>> {
        let session = self.session()?;
        session.entries(&self.vfs)
    }

    fn lookup(&mut self) -> Option<Lookup> {
        if self.inner.is_empty() {
            return Some(Lookup::Directory);
        }
        let entries = self.entries().ok()?;
        let prefix = format!("{}/", self.inner);
        if let Some(entry) = entries.iter().find(|e| e.name == self.inner) {
            return Some(Lookup::File(entry.size));
        }
        if entries.iter().any(|e| e.name.starts_with(&prefix)) {
            return Some(Lookup::Directory);
        }
        None
    }
}

enum Lookup {
    File(u64),
    Directory,
}

impl VFile for ArchiveFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        if self.inner.is_empty() {
            return self.entries().is_ok();
        }
        self.lookup().is_some()
    }

    fn is_directory(&mut self) -> bool {
        matches!(self.lookup(), Some(Lookup::Directory))
    }

    fn size(&mut self) -> u64 {
        match self.lookup() {
            Some(Lookup::File(size)) => size,
            _ => 0,
        }
    }

    fn rewind_directory(&mut self) -> Result<()> {
        if !self.is_directory() {
            return Err(RelayError::errno(Errno::ENOTDIR, self.url.to_string()));
        }
        let entries = self.entries()?;
        let prefix = if self.inner.is_empty() {
            String::new()
        } else {
            format!("{}/", self.inner)
        };

        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for entry in entries.iter() {
            let Some(rest) = entry.name.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_string(), true);
                }
                None if !rest.is_empty() => {
                    children.entry(rest.to_string()).or_insert(false);
                }
                None => {}
            }
        }
        self.children.reset(
            children
                .into_iter()
                .map(|(name, directory)| Child { name, directory })
                .collect(),
        );
        Ok(())
    }

    fn next_in_dir(&mut self) -> Option<Box<dyn VFile>> {
        if !self.children.is_loaded() {
            self.rewind_directory().ok()?;
        }
        let child = self.children.next_entry()?.clone();
        trace!(name = %child.name, directory = child.directory, "archive child");
        let url = self.url.join(&child.name);
        let file = ArchiveFile::new(self.vfs.clone(), url).ok()?;
        Some(Box::new(file))
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        if self.inner.is_empty() {
            return Err(RelayError::errno(Errno::EISDIR, self.url.to_string()));
        }
        let session = self.session()?;
        let file = session.materialise(&self.vfs, &self.inner)?;
        let mut stream = ArchiveStream::new(self.url.clone(), session, file);
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

/// Random-access stream over an extracted entry
///
/// Writes land in the cached copy only and cannot grow the entry.
pub struct ArchiveStream {
    core: StreamCore,
    session: Arc<ArchiveSession>,
    file: Arc<CachedFile>,
}

impl ArchiveStream {
    pub fn new(url: Url, session: Arc<ArchiveSession>, file: Arc<CachedFile>) -> Self {
        Self {
            core: StreamCore::new(url),
            session,
            file,
        }
    }

    fn check(&mut self) -> Result<()> {
        self.core.require_open()?;
        if !self.session.is_connected() {
            return self.core.fail(RelayError::NotConnected(self.session.key().to_string()));
        }
        Ok(())
    }
}

impl VStream for ArchiveStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        if mode.is_truncate() || mode.is_append() {
            return self.core.fail(RelayError::errno(
                Errno::EROFS,
                format!("{} cannot be resized", self.core.url),
            ));
        }
        self.core.mode = mode;
        self.core.size = self.file.size();
        self.core.position = 0;
        self.core.error = Errno::NONE;
        self.core.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let _io = self.session.state().begin_io();
        let result = self.file.read_at(self.core.position, buf);
        let n = self.core.track(result)?;
        self.core.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check()?;
        if !self.core.mode.is_write() {
            return self.core.fail(RelayError::errno(Errno::EBADF, "stream not open for writing"));
        }
        let result = self.file.write_at(self.core.position, buf);
        let n = self.core.track(result)?;
        if n == 0 && !buf.is_empty() {
            return self.core.fail(RelayError::errno(Errno::ENOSPC, "write past end of entry"));
        }
        self.core.advance(n);
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.check()?;
        if pos > self.core.size {
            return self.core.fail(RelayError::errno(
                Errno::EINVAL,
                format!("seek to {} past size {}", pos, self.core.size),
            ));
        }
        self.core.position = pos;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.core.size
    }

    fn position(&self) -> u64 {
        self.core.position
    }

    fn error(&self) -> Errno {
        self.core.error
    }

    fn is_random_access(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_container() {
        let url = Url::parse("http://host/a/pack.tar.zst/dir/file.txt").unwrap();
        let (container, inner) = split_container(&url).unwrap();
        assert_eq!(container.to_string(), "http://host/a/pack.tar.zst");
        assert_eq!(inner, "dir/file.txt");

        let nested = Url::parse("/sd/outer.tar/inner.tar/x.prg").unwrap();
        let (container, inner) = split_container(&nested).unwrap();
        assert_eq!(container.path(), "/sd/outer.tar/inner.tar");
        assert_eq!(inner, "x.prg");

        assert!(split_container(&Url::parse("http://host/plain/file.txt").unwrap()).is_none());
    }

    #[test]
    fn test_container_root_has_empty_inner_path() {
        let url = Url::parse("ftp://h/games.TAR").unwrap();
        let (container, inner) = split_container(&url).unwrap();
        assert_eq!(container, url.with_path("/games.TAR"));
        assert!(inner.is_empty());
    }
}

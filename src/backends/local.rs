use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use crate::vfs::{DirCursor, Filesystem, OpenMode, StreamCore, VFile, VStream, Vfs};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, trace};

/// Host filesystem for bare paths and `file:` URLs
#[derive(Debug, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn new() -> Self {
        Self
    }
}

impl Filesystem for LocalFilesystem {
    fn name(&self) -> &str {
        "local"
    }

    fn handles(&self, url: &Url) -> bool {
        matches!(url.scheme(), "" | "file")
    }

    fn get_file(&self, _vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        Ok(Box::new(LocalFile::new(url.clone())))
    }
}

pub struct LocalFile {
    url: Url,
    path: PathBuf,
    children: DirCursor<String>,
}

impl LocalFile {
    pub fn new(url: Url) -> Self {
        let path = PathBuf::from(url.decoded_path());
        Self {
            url,
            path,
            children: DirCursor::new(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn metadata_time(&self, pick: fn(&fs::Metadata) -> std::io::Result<SystemTime>) -> Option<SystemTime> {
        fs::metadata(&self.path).ok().and_then(|m| pick(&m).ok())
    }
}

impl VFile for LocalFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        self.path.exists()
    }

    fn is_directory(&mut self) -> bool {
        self.path.is_dir()
    }

    fn size(&mut self) -> u64 {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        }
    }

    fn last_write(&mut self) -> Option<SystemTime> {
        self.metadata_time(fs::Metadata::modified)
    }

    fn creation_time(&mut self) -> Option<SystemTime> {
        self.metadata_time(fs::Metadata::created)
    }

    fn mkdir(&mut self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        if self.path.is_dir() {
            fs::remove_dir(&self.path)?;
        } else {
            fs::remove_file(&self.path)?;
        }
        debug!(path = %self.path.display(), "removed");
        Ok(())
    }

    fn rename(&mut self, dest: &str) -> Result<()> {
        let target = Url::parse(dest)?;
        fs::rename(&self.path, target.decoded_path())?;
        Ok(())
    }

    fn rewind_directory(&mut self) -> Result<()> {
        if !self.path.is_dir() {
            return Err(RelayError::errno(Errno::ENOTDIR, self.url.to_string()));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        self.children.reset(names);
        Ok(())
    }

    fn next_in_dir(&mut self) -> Option<Box<dyn VFile>> {
        if !self.children.is_loaded() {
            self.rewind_directory().ok()?;
        }
        let name = self.children.next_entry()?.clone();
        Some(Box::new(LocalFile::new(self.url.join(&name))))
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        if self.path.is_dir() {
            return Err(RelayError::errno(Errno::EISDIR, self.url.to_string()));
        }
        let mut stream = LocalStream::new(self.url.clone(), self.path.clone());
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

pub struct LocalStream {
    core: StreamCore,
    path: PathBuf,
    file: Option<File>,
}

impl LocalStream {
    pub fn new(url: Url, path: PathBuf) -> Self {
        Self {
            core: StreamCore::new(url),
            path,
            file: None,
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.core.require_open()?;
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(RelayError::errno(Errno::EBADF, self.path.display().to_string())),
        }
    }
}

impl VStream for LocalStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        let mut options = OpenOptions::new();
        options.read(mode.is_read() || !mode.is_write());
        if mode.is_write() {
            options.write(true).create(true);
        }
        if mode.is_truncate() {
            options.truncate(true);
        }
        if mode.is_append() {
            options.append(true);
        }
        let file = match options.open(&self.path) {
            Ok(file) => file,
            Err(err) => return self.core.fail(err.into()),
        };
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        self.core.mode = mode;
        self.core.size = size;
        self.core.position = if mode.is_append() { size } else { 0 };
        self.core.error = Errno::NONE;
        self.core.open = true;
        self.file = Some(file);
        trace!(path = %self.path.display(), size, "local open");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.file()?.read(buf).map_err(RelayError::from);
        let n = self.core.track(result)?;
        self.core.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.core.mode.is_write() {
            return self.core.fail(RelayError::errno(Errno::EBADF, "stream not open for writing"));
        }
        let result = self.file()?.write(buf).map_err(RelayError::from);
        let n = self.core.track(result)?;
        self.core.advance(n);
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let result = self.file()?.seek(SeekFrom::Start(pos)).map_err(RelayError::from);
        let reached = self.core.track(result)?;
        self.core.position = reached;
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

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.close();
    }
}

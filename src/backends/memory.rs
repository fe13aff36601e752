//! In-process server for the handle-based backends
//!
//! [`MemoryServer`] is a [`RemoteConnector`] over a tree held in memory. It
//! stands in for an NFS export, an SMB share or an SFTP home when no server
//! is reachable, and it lets tests take the server offline.

use crate::backends::remote::{OpenFlags, RemoteClient, RemoteConnector, RemoteEntry, RemoteStat, RemoteTarget};
use crate::error::{Errno, RelayError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Vec<u8>, modified: SystemTime },
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    roots: Vec<String>,
    credentials: Option<(String, String)>,
}

struct Shared {
    tree: Mutex<Tree>,
    online: AtomicBool,
    connects: AtomicUsize,
    pings: AtomicUsize,
}

/// Shared in-memory file tree; clones serve the same tree
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Shared>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree {
                    nodes,
                    roots: Vec::new(),
                    credentials: None,
                }),
                online: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
            }),
        }
    }

    /// Top-level directories advertised as exports or shares
    pub fn with_roots(self, roots: &[&str]) -> Self {
        {
            let mut tree = self.shared.tree.lock();
            for root in roots {
                let path = normalize(root);
                tree.nodes.insert(path, Node::Dir);
                tree.roots.push(root.trim_matches('/').to_string());
            }
        }
        self
    }

    /// Require a login
    pub fn with_credentials(self, user: &str, password: &str) -> Self {
        self.shared.tree.lock().credentials = Some((user.to_string(), password.to_string()));
        self
    }

    /// Add a file, creating parent directories
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = normalize(path);
        let mut tree = self.shared.tree.lock();
        make_parents(&mut tree.nodes, &path);
        tree.nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
    }

    pub fn put_dir(&self, path: &str) {
        let path = normalize(path);
        let mut tree = self.shared.tree.lock();
        make_parents(&mut tree.nodes, &path);
        tree.nodes.insert(path, Node::Dir);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.shared.tree.lock().nodes.get(&normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(&normalize(path))
    }

    /// Take the server down; clients fail with `ENOTCONN` until it returns
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::Acquire)
    }

    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::Acquire)
    }
}

impl RemoteConnector for MemoryServer {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteClient>> {
        if !self.shared.online.load(Ordering::Acquire) {
            return Err(RelayError::ConnectionFailed(format!("{}:{}", target.host, target.port)));
        }
        if let Some((user, password)) = &self.shared.tree.lock().credentials {
            let accepted = target.user.as_deref() == Some(user.as_str())
                && target.password.as_deref() == Some(password.as_str());
            if !accepted {
                return Err(RelayError::errno(Errno::EACCES, format!("login to {}", target.host)));
            }
        }
        self.shared.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryClient {
            shared: self.shared.clone(),
            handles: HashMap::new(),
            next_handle: 1,
        }))
    }
}

struct OpenHandle {
    path: String,
    flags: OpenFlags,
}

struct MemoryClient {
    shared: Arc<Shared>,
    handles: HashMap<u64, OpenHandle>,
    next_handle: u64,
}

impl MemoryClient {
    fn online(&self) -> Result<()> {
        if self.shared.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RelayError::errno(Errno::ENOTCONN, "server offline"))
        }
    }

    fn handle(&self, handle: u64) -> Result<&OpenHandle> {
        self.handles
            .get(&handle)
            .ok_or_else(|| RelayError::errno(Errno::EBADF, format!("handle {}", handle)))
    }
}

impl RemoteClient for MemoryClient {
    fn stat(&mut self, path: &str) -> Result<RemoteStat> {
        self.online()?;
        match self.shared.tree.lock().nodes.get(&normalize(path)) {
            Some(Node::Dir) => Ok(RemoteStat {
                size: 0,
                is_dir: true,
                modified: None,
            }),
            Some(Node::File { data, modified }) => Ok(RemoteStat {
                size: data.len() as u64,
                is_dir: false,
                modified: Some(*modified),
            }),
            None => Err(RelayError::errno(Errno::ENOENT, path.to_string())),
        }
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.online()?;
        let dir = normalize(path);
        let tree = self.shared.tree.lock();
        match tree.nodes.get(&dir) {
            Some(Node::Dir) => {}
            Some(_) => return Err(RelayError::errno(Errno::ENOTDIR, dir)),
            None => return Err(RelayError::errno(Errno::ENOENT, dir)),
        }
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let mut entries = vec![
            RemoteEntry {
                name: ".".to_string(),
                is_dir: true,
                size: 0,
            },
            RemoteEntry {
                name: "..".to_string(),
                is_dir: true,
                size: 0,
            },
        ];
        for (child, node) in tree.nodes.range(prefix.clone()..) {
            let Some(name) = child.strip_prefix(&prefix) else {
                break;
            };
            if name.is_empty() || name.contains('/') {
                continue;
            }
            entries.push(match node {
                Node::Dir => RemoteEntry {
                    name: name.to_string(),
                    is_dir: true,
                    size: 0,
                },
                Node::File { data, .. } => RemoteEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size: data.len() as u64,
                },
            });
        }
        Ok(entries)
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<u64> {
        self.online()?;
        let path = normalize(path);
        {
            let mut tree = self.shared.tree.lock();
            let parent_ok = matches!(tree.nodes.get(&parent_of(&path)), Some(Node::Dir));
            match tree.nodes.get_mut(&path) {
                Some(Node::Dir) => return Err(RelayError::errno(Errno::EISDIR, path)),
                Some(Node::File { data, modified }) => {
                    if flags.has(OpenFlags::TRUNC) {
                        data.clear();
                        *modified = SystemTime::now();
                    }
                }
                None if flags.has(OpenFlags::CREAT) && parent_ok => {
                    tree.nodes.insert(
                        path.clone(),
                        Node::File {
                            data: Vec::new(),
                            modified: SystemTime::now(),
                        },
                    );
                }
                None => return Err(RelayError::errno(Errno::ENOENT, path)),
            }
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, OpenHandle { path, flags });
        Ok(handle)
    }

    fn read(&mut self, handle: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.online()?;
        let open = self.handle(handle)?;
        if !open.flags.readable() {
            return Err(RelayError::errno(Errno::EBADF, "handle not readable"));
        }
        let tree = self.shared.tree.lock();
        let Some(Node::File { data, .. }) = tree.nodes.get(&open.path) else {
            return Err(RelayError::errno(Errno::ENOENT, open.path.clone()));
        };
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&mut self, handle: u64, offset: u64, bytes: &[u8]) -> Result<usize> {
        self.online()?;
        let open = self.handle(handle)?;
        if !open.flags.writable() {
            return Err(RelayError::errno(Errno::EBADF, "handle not writable"));
        }
        let append = open.flags.has(OpenFlags::APPEND);
        let path = open.path.clone();
        let mut tree = self.shared.tree.lock();
        let Some(Node::File { data, modified }) = tree.nodes.get_mut(&path) else {
            return Err(RelayError::errno(Errno::ENOENT, path));
        };
        let start = if append { data.len() } else { offset as usize };
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        *modified = SystemTime::now();
        Ok(bytes.len())
    }

    fn close(&mut self, handle: u64) -> Result<()> {
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| RelayError::errno(Errno::EBADF, format!("handle {}", handle)))
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.online()?;
        let path = normalize(path);
        let mut tree = self.shared.tree.lock();
        if tree.nodes.contains_key(&path) {
            return Err(RelayError::errno(Errno::EEXIST, path));
        }
        if !matches!(tree.nodes.get(&parent_of(&path)), Some(Node::Dir)) {
            return Err(RelayError::errno(Errno::ENOENT, path));
        }
        tree.nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        self.online()?;
        let path = normalize(path);
        let mut tree = self.shared.tree.lock();
        match tree.nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(_) => return Err(RelayError::errno(Errno::ENOTDIR, path)),
            None => return Err(RelayError::errno(Errno::ENOENT, path)),
        }
        let prefix = format!("{}/", path);
        if tree.nodes.keys().any(|key| key.starts_with(&prefix)) {
            return Err(RelayError::errno(Errno::ENOTEMPTY, path));
        }
        tree.nodes.remove(&path);
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.online()?;
        let path = normalize(path);
        let mut tree = self.shared.tree.lock();
        match tree.nodes.get(&path) {
            Some(Node::File { .. }) => {
                tree.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(RelayError::errno(Errno::EISDIR, path)),
            None => Err(RelayError::errno(Errno::ENOENT, path)),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.online()?;
        let (from, to) = (normalize(from), normalize(to));
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .remove(&from)
            .ok_or_else(|| RelayError::errno(Errno::ENOENT, from.clone()))?;
        let prefix = format!("{}/", from);
        let moved: Vec<String> = tree.nodes.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
        for key in moved {
            if let Some(child) = tree.nodes.remove(&key) {
                tree.nodes.insert(format!("{}{}", to, &key[from.len()..]), child);
            }
        }
        tree.nodes.insert(to, node);
        Ok(())
    }

    fn roots(&mut self) -> Result<Vec<String>> {
        self.online()?;
        Ok(self.shared.tree.lock().roots.clone())
    }

    fn ping(&mut self) -> bool {
        self.shared.pings.fetch_add(1, Ordering::AcqRel);
        self.shared.online.load(Ordering::Acquire)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn make_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut parent = parent_of(path);
    let mut missing = Vec::new();
    while parent != "/" && !nodes.contains_key(&parent) {
        missing.push(parent.clone());
        parent = parent_of(&parent);
    }
    for dir in missing {
        nodes.insert(dir, Node::Dir);
    }
}

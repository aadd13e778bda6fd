//! In-memory remote store implementing [`Transport`].
//!
//! Behaves like a strict file server: parents must exist before children are
//! written, `rmdir` only removes empty directories and deleting a missing
//! file fails. Failures, resets, hangs and dropped connections can be
//! injected so every error path of the engine can be exercised without a
//! network.

use super::transport::{Credentials, Endpoint, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What the next `connect` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    /// Fail with a transient connection reset
    Reset,
    /// Fail with an authentication error
    Reject(String),
    /// Never complete
    Hang,
}

/// All mutable state behind a single lock.
#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    connect_script: VecDeque<ConnectBehavior>,
    /// remote path -> failures left to inject (`usize::MAX` never runs out)
    failures: HashMap<String, usize>,
    /// successful operations left before the connection drops
    disconnect_after: Option<usize>,
    /// paths whose next operation sees the connection reset
    resets: HashSet<String>,
    attempts: HashMap<String, usize>,
    log: Vec<String>,
    connected: bool,
    connects: usize,
    logouts: usize,
}

impl MemoryState {
    fn dir_exists(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.keys().any(|k| k.starts_with(&prefix)) || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    /// Bookkeeping shared by every primitive, including injected failures.
    fn begin(&mut self, op: &str, path: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected("not connected".into()));
        }

        self.log.push(format!("{} {}", op, path));
        *self.attempts.entry(path.to_string()).or_insert(0) += 1;

        if let Some(left) = self.disconnect_after.as_mut() {
            if *left == 0 {
                self.connected = false;
                return Err(TransportError::Disconnected("connection dropped".into()));
            }
            *left -= 1;
        }

        if self.resets.remove(path) {
            self.connected = false;
            return Err(TransportError::ConnectionReset("read ECONNRESET".into()));
        }

        if let Some(left) = self.failures.get_mut(path) {
            if *left > 0 {
                if *left != usize::MAX {
                    *left -= 1;
                }
                return Err(TransportError::Protocol(format!("550 {}: permission denied", path)));
            }
        }

        Ok(())
    }
}

/// Cloneable handle; clones share the same remote tree.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// An empty store containing only the filesystem root.
    pub fn new() -> Self {
        let transport = Self::default();
        transport.add_dir("/");
        transport
    }

    /// A store where `root` and all of its ancestors already exist.
    pub fn with_root(root: &str) -> Self {
        let transport = Self::new();
        transport.add_dir(root);
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a directory and its ancestors.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.lock();
        let mut current = path.trim_end_matches('/');
        while !current.is_empty() {
            state.dirs.insert(current.to_string());
            current = match current.rfind('/') {
                Some(i) => &current[..i],
                None => "",
            };
        }
        state.dirs.insert(String::new());
        state.dirs.insert("/".to_string());
    }

    /// Place a file; its parent directories are created.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.add_dir(&parent_of(path));
        self.lock().files.insert(path.to_string(), content.into());
    }

    /// Queue connect outcomes; once exhausted, connects succeed.
    pub fn script_connect(&self, behaviors: Vec<ConnectBehavior>) {
        self.lock().connect_script.extend(behaviors);
    }

    /// Fail the next `times` operations on `path`.
    pub fn fail(&self, path: &str, times: usize) {
        self.lock().failures.insert(path.to_string(), times);
    }

    /// Fail every operation on `path`.
    pub fn fail_always(&self, path: &str) {
        self.fail(path, usize::MAX);
    }

    /// Drop the connection after `operations` successful primitive calls.
    pub fn disconnect_after(&self, operations: usize) {
        self.lock().disconnect_after = Some(operations);
    }

    /// Reset the connection on the next operation touching `path`.
    pub fn reset_on(&self, path: &str) {
        self.lock().resets.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dir_exists(path)
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Every primitive call as `"<op> <path>"`, in order.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Number of primitive calls made against `path`.
    pub fn attempts(&self, path: &str) -> usize {
        self.lock().attempts.get(path).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn logouts(&self) -> usize {
        self.lock().logouts
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, _endpoint: &Endpoint, _credentials: &Credentials) -> Result<(), TransportError> {
        let behavior = {
            let mut state = self.lock();
            state.connects += 1;
            state.connect_script.pop_front().unwrap_or(ConnectBehavior::Accept)
        };

        match behavior {
            ConnectBehavior::Accept => {
                self.lock().connected = true;
                Ok(())
            }
            ConnectBehavior::Reset => Err(TransportError::ConnectionReset("read ECONNRESET".into())),
            ConnectBehavior::Reject(reason) => Err(TransportError::Authentication(reason)),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn get(&mut self, remote: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.begin("get", remote)?;
        state
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))
    }

    async fn put_bytes(&mut self, data: Vec<u8>, remote: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.begin("put", remote)?;

        let parent = parent_of(remote);
        if !state.dir_exists(&parent) {
            return Err(TransportError::NotFound(parent));
        }
        if state.dir_exists(remote) {
            return Err(TransportError::Protocol(format!("{} is a directory", remote)));
        }

        state.files.insert(remote.to_string(), data);
        Ok(())
    }

    async fn mkdir(&mut self, remote: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.begin("mkdir", remote)?;

        let parent = parent_of(remote);
        if !state.dir_exists(&parent) {
            return Err(TransportError::NotFound(parent));
        }
        if state.files.contains_key(remote) {
            return Err(TransportError::Protocol(format!("{} is a file", remote)));
        }

        state.dirs.insert(remote.to_string());
        Ok(())
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.begin("delete", remote)?;
        state
            .files
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))
    }

    async fn rmdir(&mut self, remote: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.begin("rmdir", remote)?;

        if !state.dir_exists(remote) {
            return Err(TransportError::NotFound(remote.to_string()));
        }
        if state.has_children(remote) {
            return Err(TransportError::Protocol(format!("{}: directory not empty", remote)));
        }

        state.dirs.remove(remote);
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.logouts += 1;
        state.connected = false;
        Ok(())
    }

    fn destroy(&mut self) {
        self.lock().connected = false;
    }
}

//! Scripted in-memory transport.
//!
//! Hosts are keyed by address. Each address can be made unreachable,
//! reject authentication, or connect slowly. Commands are answered from a
//! table; file operations act on a per-address in-memory filesystem with
//! optional denied path prefixes.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sshfleet::registry::HostRecord;
use sshfleet::session::{
    Connection, ConnectionError, ExecOutput, FileChannel, RemoteStat, Transport,
};
use sshfleet::transfer::{ProgressTracker, TransferError};

/// Chunk size used when streaming through the mock.
const CHUNK: usize = 4;

#[derive(Debug, Clone, Default)]
struct Behavior {
    unreachable: bool,
    reject_auth: bool,
    connect_delay: Duration,
}

#[derive(Debug, Default)]
struct RemoteFs {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    behaviors: Mutex<HashMap<String, Behavior>>,
    commands: Mutex<HashMap<String, ExecOutput>>,
    filesystems: Mutex<HashMap<String, RemoteFs>>,
    denied: Mutex<Vec<String>>,
    connects: AtomicUsize,
    open: AtomicUsize,
}

impl Inner {
    fn is_denied(&self, path: &str) -> bool {
        self.denied
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Scripted transport; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn behavior(&self, address: &str, f: impl FnOnce(&mut Behavior)) {
        let mut behaviors = self.inner.behaviors.lock().unwrap();
        f(behaviors.entry(address.to_string()).or_default());
    }

    /// Connections to `address` are refused.
    pub fn unreachable(self, address: &str) -> Self {
        self.behavior(address, |b| b.unreachable = true);
        self
    }

    /// `address` rejects every credential.
    pub fn reject_auth(self, address: &str) -> Self {
        self.behavior(address, |b| b.reject_auth = true);
        self
    }

    /// Connecting to `address` takes `delay`.
    pub fn slow(self, address: &str, delay: Duration) -> Self {
        self.behavior(address, |b| b.connect_delay = delay);
        self
    }

    /// Scripts the output of `command` on every host.
    pub fn command(self, command: &str, stdout: &str, stderr: &str, exit_code: i32) -> Self {
        self.inner.commands.lock().unwrap().insert(
            command.to_string(),
            ExecOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                exit_code,
            },
        );
        self
    }

    /// Writes under any path starting with `prefix` fail with permission
    /// denied.
    pub fn deny(self, prefix: &str) -> Self {
        self.inner.denied.lock().unwrap().push(prefix.to_string());
        self
    }

    /// Seeds a remote file.
    pub fn put_remote(&self, address: &str, path: &str, contents: &[u8]) {
        let mut filesystems = self.inner.filesystems.lock().unwrap();
        filesystems
            .entry(address.to_string())
            .or_default()
            .files
            .insert(path.to_string(), contents.to_vec());
    }

    /// Contents of a remote file.
    pub fn remote_file(&self, address: &str, path: &str) -> Option<Vec<u8>> {
        let filesystems = self.inner.filesystems.lock().unwrap();
        filesystems.get(address)?.files.get(path).cloned()
    }

    /// Sorted remote file paths on `address`.
    pub fn remote_files(&self, address: &str) -> Vec<String> {
        let filesystems = self.inner.filesystems.lock().unwrap();
        let mut files: Vec<String> = filesystems
            .get(address)
            .map(|fs| fs.files.keys().cloned().collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Returns true if `path` was created as a directory on `address`.
    pub fn remote_dir_exists(&self, address: &str, path: &str) -> bool {
        let filesystems = self.inner.filesystems.lock().unwrap();
        filesystems
            .get(address)
            .is_some_and(|fs| fs.dirs.contains(path))
    }

    /// Successful connects so far.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections not yet closed.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        host: &HostRecord,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let behavior = self
            .inner
            .behaviors
            .lock()
            .unwrap()
            .get(&host.address)
            .cloned()
            .unwrap_or_default();

        if !behavior.connect_delay.is_zero() {
            thread::sleep(behavior.connect_delay);
        }
        if behavior.unreachable {
            return Err(ConnectionError::Network(format!(
                "connect to {}:{}: connection refused",
                host.address, host.port
            )));
        }
        if behavior.reject_auth {
            return Err(ConnectionError::AuthRejected(format!(
                "{} rejected password for {}",
                host.address, host.login
            )));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            inner: Arc::clone(&self.inner),
            address: host.address.clone(),
            closed: false,
        }))
    }
}

struct MockConnection {
    inner: Arc<Inner>,
    address: String,
    closed: bool,
}

impl Connection for MockConnection {
    fn execute(&mut self, command: &str, _timeout: Duration) -> Result<ExecOutput, ConnectionError> {
        match command {
            "drop-connection" => {
                return Err(ConnectionError::Network("connection reset by peer".into()));
            }
            "panic" => panic!("scripted panic on {}", self.address),
            "hostname" => {
                return Ok(ExecOutput {
                    stdout: format!("{}\n", self.address).into_bytes(),
                    ..ExecOutput::default()
                });
            }
            _ => {}
        }

        if let Some(output) = self.inner.commands.lock().unwrap().get(command) {
            return Ok(output.clone());
        }

        Ok(match command {
            "true" => ExecOutput::default(),
            "false" => ExecOutput {
                exit_code: 1,
                ..ExecOutput::default()
            },
            _ => ExecOutput {
                stdout: Vec::new(),
                stderr: format!("sh: {}: command not found\n", command).into_bytes(),
                exit_code: 127,
            },
        })
    }

    fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, ConnectionError> {
        Ok(Box::new(MockFileChannel {
            inner: Arc::clone(&self.inner),
            address: self.address.clone(),
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MockFileChannel {
    inner: Arc<Inner>,
    address: String,
}

impl MockFileChannel {
    fn with_fs<R>(&self, f: impl FnOnce(&mut RemoteFs) -> R) -> R {
        let mut filesystems = self.inner.filesystems.lock().unwrap();
        f(filesystems.entry(self.address.clone()).or_default())
    }
}

impl FileChannel for MockFileChannel {
    fn stat(&mut self, remote: &str) -> Result<Option<RemoteStat>, TransferError> {
        Ok(self.with_fs(|fs| {
            if fs.dirs.contains(remote) {
                Some(RemoteStat {
                    size: 0,
                    is_dir: true,
                })
            } else {
                fs.files.get(remote).map(|data| RemoteStat {
                    size: data.len() as u64,
                    is_dir: false,
                })
            }
        }))
    }

    fn mkdir(&mut self, remote: &str) -> Result<(), TransferError> {
        if self.inner.is_denied(remote) {
            return Err(TransferError::PermissionDenied(remote.to_string()));
        }
        self.with_fs(|fs| fs.dirs.insert(remote.to_string()));
        Ok(())
    }

    fn put(
        &mut self,
        source: &mut dyn Read,
        remote: &str,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, TransferError> {
        if self.inner.is_denied(remote) {
            return Err(TransferError::PermissionDenied(remote.to_string()));
        }

        let mut data = Vec::new();
        let mut buf = [0u8; CHUNK];
        loop {
            let n = source
                .read(&mut buf)
                .map_err(|e| TransferError::LocalIo(e.to_string()))?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            progress.advance(n as u64);
        }

        let written = data.len() as u64;
        self.with_fs(|fs| fs.files.insert(remote.to_string(), data));
        Ok(written)
    }

    fn get(
        &mut self,
        remote: &str,
        sink: &mut dyn Write,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, TransferError> {
        if self.inner.is_denied(remote) {
            return Err(TransferError::PermissionDenied(remote.to_string()));
        }

        let data = self
            .with_fs(|fs| fs.files.get(remote).cloned())
            .ok_or_else(|| TransferError::RemoteNotFound(remote.to_string()))?;

        for chunk in data.chunks(CHUNK) {
            sink.write_all(chunk)
                .map_err(|e| TransferError::LocalIo(e.to_string()))?;
            progress.advance(chunk.len() as u64);
        }
        Ok(data.len() as u64)
    }
}

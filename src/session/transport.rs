//! Transport capability consumed by sessions.
//!
//! The wire protocol lives behind these traits. [`super::ssh::SshTransport`]
//! is the production implementation; tests plug in scripted ones.

use std::io::{Read, Write};
use std::time::Duration;

use super::ConnectionError;
use crate::registry::HostRecord;
use crate::transfer::{ProgressTracker, TransferError};

/// Raw output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output bytes.
    pub stdout: Vec<u8>,
    /// Standard error bytes.
    pub stderr: Vec<u8>,
    /// Exit status.
    pub exit_code: i32,
}

/// Remote file metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// True for directories.
    pub is_dir: bool,
}

/// Opens authenticated connections.
pub trait Transport: Send + Sync {
    /// Connects and authenticates to `host` with its login and secret.
    fn connect(
        &self,
        host: &HostRecord,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// One authenticated connection.
pub trait Connection: Send {
    /// Runs `command` on a fresh channel and captures both streams fully
    /// before returning the exit status.
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, ConnectionError>;

    /// Opens a file-transfer channel on this connection.
    fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, ConnectionError>;

    /// Releases the connection. Must not fail.
    fn close(&mut self);
}

/// Remote file operations on an open connection.
pub trait FileChannel: Send {
    /// Returns metadata, or `None` if the path does not exist.
    fn stat(&mut self, remote: &str) -> Result<Option<RemoteStat>, TransferError>;

    /// Creates one directory level.
    fn mkdir(&mut self, remote: &str) -> Result<(), TransferError>;

    /// Streams `source` into `remote`, reporting through `progress`.
    /// Returns bytes written.
    fn put(
        &mut self,
        source: &mut dyn Read,
        remote: &str,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, TransferError>;

    /// Streams `remote` into `sink`, reporting through `progress`.
    /// Returns bytes read.
    fn get(
        &mut self,
        remote: &str,
        sink: &mut dyn Write,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, TransferError>;
}

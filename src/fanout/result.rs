//! Per-host operation results.
//!
//! An `OperationResult` is created once by the worker that ran the
//! operation and never mutated afterwards.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::registry::{HostId, HostRecord};
use crate::session::ConnectionError;
use crate::transfer::TransferError;

/// Identity of the host a result belongs to.
///
/// Carries no secret, so results can be logged and displayed freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostRef {
    /// Host id.
    pub id: HostId,
    /// Display label.
    pub label: String,
    /// Hostname or IP address.
    pub address: String,
    /// SSH port.
    pub port: u16,
}

impl From<&HostRecord> for HostRef {
    fn from(host: &HostRecord) -> Self {
        Self {
            id: host.id(),
            label: host.label().to_string(),
            address: host.address.clone(),
            port: host.port,
        }
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.label, self.address, self.port)
    }
}

/// What was asked of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    /// Run a shell command.
    Command {
        /// Command line.
        command: String,
    },
    /// Push a local file (or directory or pattern) to the host.
    Upload {
        /// Local path or pattern.
        local: PathBuf,
        /// Remote destination.
        remote: String,
    },
    /// Pull a remote file to local storage.
    Download {
        /// Remote source.
        remote: String,
        /// Local destination.
        local: PathBuf,
    },
}

impl OperationRequest {
    /// Creates a command request.
    #[must_use]
    pub fn command(command: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
        }
    }

    /// Creates an upload request.
    #[must_use]
    pub fn upload(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self::Upload {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Creates a download request.
    #[must_use]
    pub fn download(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self::Download {
            remote: remote.into(),
            local: local.into(),
        }
    }
}

impl fmt::Display for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { command } => write!(f, "exec `{}`", command),
            Self::Upload { local, remote } => {
                write!(f, "upload {} -> {}", local.display(), remote)
            }
            Self::Download { remote, local } => {
                write!(f, "download {} -> {}", remote, local.display())
            }
        }
    }
}

/// Captured command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Remote exit status.
    pub exit_code: i32,
}

/// Completed transfer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes moved.
    pub bytes: u64,
    /// Time spent streaming.
    pub elapsed: Duration,
}

impl TransferStats {
    /// Average throughput in bytes per second.
    #[must_use]
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Operation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The operation never produced output.
    None,
    /// Command output.
    Command(CommandOutput),
    /// Transfer statistics.
    Transfer(TransferStats),
}

/// Why an operation did not complete.
///
/// A command that ran and exited non-zero is not a failure in this sense;
/// its result carries the exit status and captured streams instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// Could not connect, or the connection broke.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// File transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Host has no open pooled session.
    #[error("Not connected")]
    NotConnected,

    /// Worker thread could not be started.
    #[error("Could not start worker: {0}")]
    Spawn(String),

    /// Operation panicked inside its worker.
    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// Outcome of one operation against one host.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    host: HostRef,
    request: OperationRequest,
    success: bool,
    payload: Payload,
    failure: Option<Failure>,
    elapsed: Duration,
}

impl OperationResult {
    /// A command that ran to completion; success follows the exit status.
    #[must_use]
    pub fn command(
        host: HostRef,
        request: OperationRequest,
        output: CommandOutput,
        elapsed: Duration,
    ) -> Self {
        Self {
            host,
            request,
            success: output.exit_code == 0,
            payload: Payload::Command(output),
            failure: None,
            elapsed,
        }
    }

    /// A transfer that completed.
    #[must_use]
    pub fn transferred(host: HostRef, request: OperationRequest, stats: TransferStats) -> Self {
        Self {
            host,
            request,
            success: true,
            payload: Payload::Transfer(stats),
            failure: None,
            elapsed: stats.elapsed,
        }
    }

    /// An operation that could not complete.
    #[must_use]
    pub fn failed(
        host: HostRef,
        request: OperationRequest,
        failure: impl Into<Failure>,
        elapsed: Duration,
    ) -> Self {
        Self {
            host,
            request,
            success: false,
            payload: Payload::None,
            failure: Some(failure.into()),
            elapsed,
        }
    }

    /// Originating host.
    #[must_use]
    pub fn host(&self) -> &HostRef {
        &self.host
    }

    /// Request that produced this result.
    #[must_use]
    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    /// True when the operation completed and, for commands, exited 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// Payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Failure reason, if the operation did not complete.
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Failure reason as text.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    /// Wall time spent on the operation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Command output, if this was a command that ran.
    #[must_use]
    pub fn command_output(&self) -> Option<&CommandOutput> {
        match &self.payload {
            Payload::Command(output) => Some(output),
            _ => None,
        }
    }

    /// Remote exit status, if this was a command that ran.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.command_output().map(|o| o.exit_code)
    }

    /// Transfer statistics, if this was a completed transfer.
    #[must_use]
    pub fn transfer_stats(&self) -> Option<&TransferStats> {
        match &self.payload {
            Payload::Transfer(stats) => Some(stats),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostRef {
        HostRef::from(&HostRecord::new("h1", "u", "p"))
    }

    #[test]
    fn test_nonzero_exit_is_completed_not_failure() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 1,
        };
        let result = OperationResult::command(
            host(),
            OperationRequest::command("false"),
            output,
            Duration::from_millis(5),
        );

        assert!(!result.success());
        assert_eq!(result.exit_code(), Some(1));
        assert!(result.failure().is_none());
        assert!(result.error_message().is_none());
    }

    #[test]
    fn test_failed_carries_reason() {
        let result = OperationResult::failed(
            host(),
            OperationRequest::command("uptime"),
            ConnectionError::Network("refused".into()),
            Duration::ZERO,
        );

        assert!(!result.success());
        assert_eq!(result.payload(), &Payload::None);
        assert!(result.error_message().unwrap().contains("refused"));
    }

    #[test]
    fn test_transfer_speed() {
        let stats = TransferStats {
            bytes: 2048,
            elapsed: Duration::from_secs(2),
        };
        assert!((stats.bytes_per_sec() - 1024.0).abs() < f64::EPSILON);
        assert_eq!(
            TransferStats {
                bytes: 1,
                elapsed: Duration::ZERO
            }
            .bytes_per_sec(),
            0.0
        );
    }

    #[test]
    fn test_host_ref_has_no_secret() {
        let record = HostRecord::new("h1", "u", "sekrit").with_label("web");
        let host = HostRef::from(&record);
        assert_eq!(host.label, "web");
        assert!(!format!("{:?}", host).contains("sekrit"));
    }
}

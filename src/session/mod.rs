//! SSH sessions.
//!
//! A [`Session`] is one authenticated connection to one host with its own
//! lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                     \-> Failed(reason)
//! ```
//!
//! Sessions never retry on their own. Dropping a session closes it.

pub mod pool;
pub mod ssh;
pub mod transport;

pub use pool::SessionPool;
pub use ssh::SshTransport;
pub use transport::{Connection, ExecOutput, FileChannel, RemoteStat, Transport};

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fanout::{CommandOutput, HostRef, OperationRequest, OperationResult};
use crate::registry::HostRecord;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Broad class of a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Remote rejected the credentials.
    Authentication,
    /// Unreachable, refused, reset or timed out.
    Network,
    /// SSH-level error (handshake, channel).
    Protocol,
    /// Anything else.
    Unknown,
}

impl FailureKind {
    /// Returns a display string for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Unknown => "unknown",
        }
    }
}

/// Connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Credentials rejected by the remote.
    #[error("Authentication failed: {0}")]
    AuthRejected(String),

    /// TCP-level failure.
    #[error("Connection failed: {0}")]
    Network(String),

    /// Connect or I/O timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// SSH protocol error.
    #[error("SSH error: {0}")]
    Protocol(String),

    /// Unclassified failure.
    #[error("{0}")]
    Unknown(String),
}

impl ConnectionError {
    /// Returns the failure class.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AuthRejected(_) => FailureKind::Authentication,
            Self::Network(_) | Self::Timeout(_) => FailureKind::Network,
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Unknown(_) => FailureKind::Unknown,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Connect in progress.
    Connecting,
    /// Authenticated and usable.
    Connected,
    /// Last connect attempt failed.
    Failed(ConnectionError),
}

impl SessionState {
    /// Returns a display string for the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Failed(_) => "Failed",
        }
    }
}

/// One connection to one host.
///
/// Not shareable across threads for concurrent use; operations take
/// `&mut self`, so one session runs one operation at a time.
pub struct Session {
    /// Host snapshot this session talks to.
    host: HostRecord,
    /// Transport capability.
    transport: Arc<dyn Transport>,
    /// Lifecycle state.
    state: SessionState,
    /// Live connection while `Connected`.
    connection: Option<Box<dyn Connection>>,
    /// Timeout for implicit connects.
    connect_timeout: Duration,
}

impl Session {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(host: HostRecord, transport: Arc<dyn Transport>) -> Self {
        Self {
            host,
            transport,
            state: SessionState::Disconnected,
            connection: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Sets the timeout used when an operation connects implicitly.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the host record.
    #[must_use]
    pub fn host(&self) -> &HostRecord {
        &self.host
    }

    /// Returns a secret-free host reference.
    #[must_use]
    pub fn host_ref(&self) -> HostRef {
        HostRef::from(&self.host)
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && self.connection.is_some()
    }

    /// Connects and authenticates.
    ///
    /// A no-op when already connected. From `Disconnected` or `Failed` it
    /// makes one fresh attempt.
    pub fn connect(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = SessionState::Connecting;
        debug!(
            "Connecting to {} as {} (timeout {:?})",
            self.host.connection_string(),
            self.host.login,
            timeout
        );

        match self.transport.connect(&self.host, timeout) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = SessionState::Connected;
                info!("Connected to {}", self.host.label());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Connection to {} failed ({}): {}",
                    self.host.label(),
                    e.kind().as_str(),
                    e
                );
                self.connection = None;
                self.state = SessionState::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Runs a command on a fresh channel, connecting first if needed.
    ///
    /// Connection failures become failed results. A non-zero exit status
    /// is a completed result with `success == false`.
    pub fn execute(&mut self, command: &str, timeout: Duration) -> OperationResult {
        let started = Instant::now();
        let request = OperationRequest::command(command);

        if let Err(e) = self.connect(self.connect_timeout) {
            return OperationResult::failed(self.host_ref(), request, e, started.elapsed());
        }

        let Some(connection) = self.connection.as_mut() else {
            let e = ConnectionError::Unknown("connection unavailable".to_string());
            return OperationResult::failed(self.host_ref(), request, e, started.elapsed());
        };

        debug!("Executing on {}: {}", self.host.label(), command);
        match connection.execute(command, timeout) {
            Ok(raw) => {
                let output = CommandOutput {
                    stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
                    exit_code: raw.exit_code,
                };
                debug!(
                    "{} exited with {} ({} bytes stdout)",
                    self.host.label(),
                    output.exit_code,
                    output.stdout.len()
                );
                OperationResult::command(self.host_ref(), request, output, started.elapsed())
            }
            Err(e) => {
                warn!("Execution on {} failed: {}", self.host.label(), e);
                self.disconnect();
                OperationResult::failed(self.host_ref(), request, e, started.elapsed())
            }
        }
    }

    /// Opens a file-transfer channel, connecting first if needed.
    pub fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, ConnectionError> {
        self.connect(self.connect_timeout)?;

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| ConnectionError::Unknown("connection unavailable".to_string()))?;

        connection.open_file_channel().inspect_err(|e| {
            warn!("File channel on {} failed: {}", self.host.label(), e);
        })
    }

    /// Closes the connection. Safe in any state.
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            debug!("Disconnected from {}", self.host.label());
        }
        if !matches!(self.state, SessionState::Failed(_)) {
            self.state = SessionState::Disconnected;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

//! File transfer orchestration.
//!
//! Uploads and downloads over a session's file channel: single files,
//! whole directory trees, wildcard sets, and multi-host broadcasts of an
//! upload through the fan-out engine.

pub mod expand;
pub mod progress;

pub use expand::{Expansion, LocalSelection, expand_local, is_pattern};
pub use progress::{
    DEFAULT_PROGRESS_INTERVAL, ProgressSink, ProgressTracker, TransferProgress, format_size,
    format_speed,
};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fanout::{
    FanOut, OperationRequest, OperationResult, ResultCallback, TransferStats,
};
use crate::registry::HostRecord;
use crate::session::{DEFAULT_CONNECT_TIMEOUT_SECS, FileChannel, Session, Transport};

/// Transfer failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Local source does not exist.
    #[error("Local path not found: {}", .0.display())]
    LocalNotFound(PathBuf),

    /// Remote source does not exist.
    #[error("Remote path not found: {0}")]
    RemoteNotFound(String),

    /// Remote refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Directory or pattern selected no files.
    #[error("Nothing to transfer: {0} matched no files")]
    NothingToTransfer(String),

    /// Local read/write failure.
    #[error("Local I/O error: {0}")]
    LocalIo(String),

    /// Remote read/write failure.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Malformed wildcard pattern.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

/// Transfer entry points.
pub struct TransferOrchestrator {
    transport: Arc<dyn Transport>,
    engine: FanOut,
    connect_timeout: Duration,
    progress_interval: Duration,
}

impl TransferOrchestrator {
    /// Creates an orchestrator with default timeouts.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            engine: FanOut::new(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Uses `engine` for broadcasts.
    #[must_use]
    pub fn with_engine(mut self, engine: FanOut) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the connect timeout for sessions this orchestrator opens.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the minimum spacing between progress reports.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Uploads one local file.
    ///
    /// A `remote` ending in `/` is treated as a directory and receives the
    /// local file name. Missing remote parent directories are created.
    pub fn upload(
        &self,
        session: &mut Session,
        local: &Path,
        remote: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> OperationResult {
        let started = Instant::now();
        let remote = resolve_remote(local, remote);
        let request = OperationRequest::upload(local, remote.as_str());

        let mut channel = match session.open_file_channel() {
            Ok(channel) => channel,
            Err(e) => return OperationResult::failed(session.host_ref(), request, e, started.elapsed()),
        };

        match self.put_file(session, channel.as_mut(), local, &remote, progress) {
            Ok(stats) => OperationResult::transferred(session.host_ref(), request, stats),
            Err(e) => OperationResult::failed(session.host_ref(), request, e, started.elapsed()),
        }
    }

    /// Uploads a file, directory tree or wildcard set under `remote_root`.
    ///
    /// Returns one result per file, including a failed one for each entry
    /// that could not be read locally. A source that selects nothing
    /// returns a single failed result.
    pub fn upload_path(
        &self,
        session: &mut Session,
        source: &str,
        remote_root: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Vec<OperationResult> {
        let started = Instant::now();

        let expansion = match expand_local(source) {
            Ok(LocalSelection::Single(file)) => {
                return vec![self.upload(session, &file, remote_root, progress)];
            }
            Ok(LocalSelection::Many(expansion)) => expansion,
            Err(e) => {
                warn!("Nothing uploaded for {}: {}", source, e);
                return vec![OperationResult::failed(
                    session.host_ref(),
                    OperationRequest::upload(source, remote_root),
                    e,
                    started.elapsed(),
                )];
            }
        };

        info!(
            "Uploading {} file(s) from {} to {}:{}",
            expansion.files.len(),
            expansion.root.display(),
            session.host().label(),
            remote_root
        );

        let mut results: Vec<OperationResult> = expansion
            .unreadable
            .iter()
            .map(|(path, e)| {
                OperationResult::failed(
                    session.host_ref(),
                    OperationRequest::upload(path, expansion.remote_path(path, remote_root)),
                    e.clone(),
                    Duration::ZERO,
                )
            })
            .collect();

        let mut channel = match session.open_file_channel() {
            Ok(channel) => channel,
            Err(e) => {
                results.extend(expansion.files.iter().map(|file| {
                    OperationResult::failed(
                        session.host_ref(),
                        OperationRequest::upload(file, expansion.remote_path(file, remote_root)),
                        e.clone(),
                        started.elapsed(),
                    )
                }));
                return results;
            }
        };
        let session = &*session;

        results.extend(expansion.files.iter().map(|file| {
            let file_started = Instant::now();
            let remote = expansion.remote_path(file, remote_root);
            let request = OperationRequest::upload(file, remote.as_str());
            match self.put_file(session, channel.as_mut(), file, &remote, progress) {
                Ok(stats) => OperationResult::transferred(session.host_ref(), request, stats),
                Err(e) => {
                    warn!("Upload of {} failed: {}", file.display(), e);
                    OperationResult::failed(session.host_ref(), request, e, file_started.elapsed())
                }
            }
        }));
        results
    }

    /// Downloads one remote file to `local`.
    ///
    /// Local parent directories are created. Data lands in a sibling
    /// `.part` file that replaces `local` only once complete, so a failed
    /// transfer leaves any existing `local` untouched.
    pub fn download(
        &self,
        session: &mut Session,
        remote: &str,
        local: &Path,
        progress: Option<&dyn ProgressSink>,
    ) -> OperationResult {
        let started = Instant::now();
        let request = OperationRequest::download(remote, local);

        let mut channel = match session.open_file_channel() {
            Ok(channel) => channel,
            Err(e) => return OperationResult::failed(session.host_ref(), request, e, started.elapsed()),
        };

        match self.get_file(session, channel.as_mut(), remote, local, progress) {
            Ok(stats) => OperationResult::transferred(session.host_ref(), request, stats),
            Err(e) => {
                warn!("Download of {} failed: {}", remote, e);
                OperationResult::failed(session.host_ref(), request, e, started.elapsed())
            }
        }
    }

    /// Opens a session to `host`, downloads, and closes it.
    pub fn download_from(
        &self,
        host: &HostRecord,
        remote: &str,
        local: &Path,
        progress: Option<&dyn ProgressSink>,
    ) -> OperationResult {
        let mut session = Session::new(host.clone(), Arc::clone(&self.transport))
            .with_connect_timeout(self.connect_timeout);
        let result = self.download(&mut session, remote, local, progress);
        session.disconnect();
        result
    }

    /// Uploads `source` to every host concurrently.
    ///
    /// Each host expands `source` on its own and gets its own session;
    /// results are one per (host, file).
    pub fn broadcast_upload(
        &self,
        hosts: &[HostRecord],
        source: &str,
        remote_root: &str,
        progress: Option<&dyn ProgressSink>,
        on_result: Option<&ResultCallback<'_>>,
    ) -> Vec<OperationResult> {
        let request = OperationRequest::upload(source, remote_root);
        self.engine.run(
            hosts,
            &request,
            |host| {
                let mut session = Session::new(host.clone(), Arc::clone(&self.transport))
                    .with_connect_timeout(self.connect_timeout);
                self.upload_path(&mut session, source, remote_root, progress)
            },
            on_result,
        )
    }

    fn put_file(
        &self,
        session: &Session,
        channel: &mut dyn FileChannel,
        local: &Path,
        remote: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<TransferStats, TransferError> {
        let mut source = fs::File::open(local).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransferError::LocalNotFound(local.to_path_buf()),
            _ => TransferError::LocalIo(format!("{}: {}", local.display(), e)),
        })?;
        let total = source
            .metadata()
            .map_err(|e| TransferError::LocalIo(e.to_string()))?
            .len();

        if let Some(parent) = expand::remote_parent(remote) {
            ensure_remote_dir(channel, parent)?;
        }

        let started = Instant::now();
        let mut tracker = ProgressTracker::new(
            session.host_ref(),
            local.display().to_string(),
            total,
            progress,
        )
        .with_interval(self.progress_interval);

        let bytes = channel.put(&mut source, remote, &mut tracker)?;
        tracker.finish();

        debug!(
            "Uploaded {} ({}) to {}:{}",
            local.display(),
            format_size(bytes),
            session.host().label(),
            remote
        );
        Ok(TransferStats {
            bytes,
            elapsed: started.elapsed(),
        })
    }

    fn get_file(
        &self,
        session: &Session,
        channel: &mut dyn FileChannel,
        remote: &str,
        local: &Path,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<TransferStats, TransferError> {
        let stat = channel
            .stat(remote)?
            .ok_or_else(|| TransferError::RemoteNotFound(remote.to_string()))?;
        if stat.is_dir {
            return Err(TransferError::Remote(format!("{} is a directory", remote)));
        }

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| TransferError::LocalIo(format!("{}: {}", parent.display(), e)))?;
        }

        let partial = partial_path(local);
        let mut sink = fs::File::create(&partial)
            .map_err(|e| TransferError::LocalIo(format!("{}: {}", partial.display(), e)))?;

        let started = Instant::now();
        let mut tracker = ProgressTracker::new(session.host_ref(), remote, stat.size, progress)
            .with_interval(self.progress_interval);

        let outcome = channel.get(remote, &mut sink, &mut tracker).and_then(|bytes| {
            sink.sync_all()
                .and_then(|()| fs::rename(&partial, local))
                .map_err(|e| TransferError::LocalIo(format!("{}: {}", local.display(), e)))?;
            Ok(bytes)
        });
        drop(sink);
        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        tracker.finish();

        debug!(
            "Downloaded {}:{} ({}) to {}",
            session.host().label(),
            remote,
            format_size(bytes),
            local.display()
        );
        Ok(TransferStats {
            bytes,
            elapsed: started.elapsed(),
        })
    }
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("engine", &self.engine)
            .field("connect_timeout", &self.connect_timeout)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}

/// Appends the local file name when `remote` names a directory.
fn resolve_remote(local: &Path, remote: &str) -> String {
    if !remote.ends_with('/') {
        return remote.to_string();
    }
    match local.file_name() {
        Some(name) => format!("{}{}", remote, name.to_string_lossy()),
        None => remote.to_string(),
    }
}

/// Creates `dir` and any missing ancestors on the remote.
///
/// A directory that already exists, including one created concurrently
/// between the check and the create, counts as success.
fn ensure_remote_dir(channel: &mut dyn FileChannel, dir: &str) -> Result<(), TransferError> {
    let mut missing = Vec::new();
    let mut current = Some(dir);

    while let Some(path) = current {
        match channel.stat(path)? {
            Some(stat) if stat.is_dir => break,
            Some(_) => return Err(TransferError::Remote(format!("{} is not a directory", path))),
            None => {
                missing.push(path);
                current = expand::remote_parent(path);
            }
        }
    }

    for path in missing.into_iter().rev() {
        if let Err(e) = channel.mkdir(path) {
            match channel.stat(path) {
                Ok(Some(stat)) if stat.is_dir => {}
                _ => return Err(e),
            }
        }
    }
    Ok(())
}

/// Sibling file a download is written to before it is complete.
fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    local.with_file_name(name)
}

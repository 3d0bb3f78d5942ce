//! Multi-host fan-out.
//!
//! Runs one operation against many hosts concurrently and gathers exactly
//! one result per (host, unit of work). Hosts are isolated from each other:
//! a slow, failing or panicking host never prevents the others from
//! producing their results.

pub mod result;

pub use result::{
    CommandOutput, Failure, HostRef, OperationRequest, OperationResult, Payload, TransferStats,
};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::registry::HostRecord;
use crate::session::{DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, Session, Transport};

/// Callback invoked once per result as soon as it is available.
///
/// Runs on the worker thread that produced the result, so it must be
/// thread-safe.
pub type ResultCallback<'a> = dyn Fn(&OperationResult) + Send + Sync + 'a;

/// Anything the fan-out engine can target.
pub trait FanOutTarget {
    /// Host identity used to attribute results, including synthesized
    /// failure results.
    fn host_ref(&self) -> HostRef;
}

impl FanOutTarget for HostRecord {
    fn host_ref(&self) -> HostRef {
        HostRef::from(self)
    }
}

/// Concurrent execution engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanOut {
    /// Worker cap. Zero means one worker per target.
    max_workers: usize,
}

impl FanOut {
    /// One worker per target.
    #[must_use]
    pub fn new() -> Self {
        Self { max_workers: 0 }
    }

    /// At most `max_workers` concurrent workers. Zero means unbounded.
    #[must_use]
    pub fn bounded(max_workers: usize) -> Self {
        Self { max_workers }
    }

    /// Returns the worker cap (zero for unbounded).
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs `op` against every target and collects the results.
    ///
    /// `op` returns the results for one target (one per unit of work; an
    /// empty return is treated as a single failed result). Results arrive
    /// in completion order. The call returns only after every target has
    /// produced its results; an empty `targets` returns immediately.
    pub fn run<T, F>(
        &self,
        targets: &[T],
        request: &OperationRequest,
        op: F,
        on_result: Option<&ResultCallback<'_>>,
    ) -> Vec<OperationResult>
    where
        T: FanOutTarget + Sync,
        F: Fn(&T) -> Vec<OperationResult> + Sync,
    {
        if targets.is_empty() {
            return Vec::new();
        }

        let workers = match self.max_workers {
            0 => targets.len(),
            n => n.min(targets.len()),
        };
        debug!(
            "Fan-out: {} across {} target(s) with {} worker(s)",
            request,
            targets.len(),
            workers
        );

        let (tx, rx) = mpsc::channel::<OperationResult>();
        let next = AtomicUsize::new(0);
        let op = &op;
        let next = &next;

        thread::scope(|scope| {
            let mut spawned = 0usize;

            for worker in 0..workers {
                let tx = tx.clone();
                let spawn = thread::Builder::new()
                    .name(format!("fanout-{}", worker))
                    .spawn_scoped(scope, move || {
                        loop {
                            let index = next.fetch_add(1, Ordering::SeqCst);
                            let Some(target) = targets.get(index) else {
                                break;
                            };
                            for result in run_one(target, request, op) {
                                deliver(&tx, result, on_result);
                            }
                        }
                    });

                match spawn {
                    Ok(_) => spawned += 1,
                    Err(e) => warn!("Could not start fan-out worker {}: {}", worker, e),
                }
            }

            // Without any worker the queue is never drained; fail every
            // target instead of losing it.
            if spawned == 0 {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(target) = targets.get(index) else {
                        break;
                    };
                    let result = OperationResult::failed(
                        target.host_ref(),
                        request.clone(),
                        Failure::Spawn("no worker threads available".to_string()),
                        Duration::ZERO,
                    );
                    deliver(&tx, result, on_result);
                }
            }
        });

        drop(tx);
        let results: Vec<OperationResult> = rx.into_iter().collect();
        debug!(
            "Fan-out finished: {} result(s), {} failed",
            results.len(),
            results.iter().filter(|r| !r.success()).count()
        );
        results
    }
}

/// Runs `op` for one target, turning a panic into a failed result.
fn run_one<T, F>(target: &T, request: &OperationRequest, op: &F) -> Vec<OperationResult>
where
    T: FanOutTarget,
    F: Fn(&T) -> Vec<OperationResult>,
{
    let started = Instant::now();
    match panic::catch_unwind(AssertUnwindSafe(|| op(target))) {
        Ok(results) if !results.is_empty() => results,
        Ok(_) => vec![OperationResult::failed(
            target.host_ref(),
            request.clone(),
            Failure::Panicked("operation produced no result".to_string()),
            started.elapsed(),
        )],
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("Operation on {} panicked: {}", target.host_ref(), message);
            vec![OperationResult::failed(
                target.host_ref(),
                request.clone(),
                Failure::Panicked(message),
                started.elapsed(),
            )]
        }
    }
}

/// Records a result and notifies the callback.
fn deliver(
    tx: &mpsc::Sender<OperationResult>,
    result: OperationResult,
    on_result: Option<&ResultCallback<'_>>,
) {
    if let Some(callback) = on_result {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
            warn!("Result callback panicked for {}", result.host());
        }
    }
    // The receiver outlives every worker inside the scope.
    let _ = tx.send(result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one command on many hosts, each through its own fresh session.
pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    engine: FanOut,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Broadcaster {
    /// Creates a broadcaster with default timeouts and unbounded workers.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            engine: FanOut::new(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Uses `engine` for scheduling.
    #[must_use]
    pub fn with_engine(mut self, engine: FanOut) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the per-host connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-host command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Executes `command` on every host; one result per host.
    ///
    /// Sessions are opened per host and closed when the host's worker
    /// finishes.
    pub fn run(
        &self,
        hosts: &[HostRecord],
        command: &str,
        on_result: Option<&ResultCallback<'_>>,
    ) -> Vec<OperationResult> {
        let request = OperationRequest::command(command);
        self.engine.run(
            hosts,
            &request,
            |host| {
                let mut session = Session::new(host.clone(), Arc::clone(&self.transport))
                    .with_connect_timeout(self.connect_timeout);
                vec![session.execute(command, self.command_timeout)]
            },
            on_result,
        )
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("engine", &self.engine)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

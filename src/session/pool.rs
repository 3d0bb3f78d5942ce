//! Long-lived sessions keyed by host.
//!
//! Keeps connections open across commands so repeated fan-outs to the
//! same hosts skip the handshake. Each pooled session sits behind its own
//! lock; different hosts run in parallel, one host runs one command at a
//! time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{ConnectionError, DEFAULT_CONNECT_TIMEOUT_SECS, Session, Transport};
use crate::fanout::{
    FanOut, FanOutTarget, Failure, HostRef, OperationRequest, OperationResult, ResultCallback,
};
use crate::registry::{HostId, HostRecord};

type SharedSession = Arc<Mutex<Session>>;

/// Fan-out target for a pooled host.
struct PoolTarget {
    host: HostRef,
    session: Option<SharedSession>,
}

impl FanOutTarget for PoolTarget {
    fn host_ref(&self) -> HostRef {
        self.host.clone()
    }
}

/// Pool of open sessions.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<HostId, SharedSession>>,
    engine: FanOut,
    connect_timeout: Duration,
}

impl SessionPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: Mutex::new(HashMap::new()),
            engine: FanOut::new(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Uses `engine` for `execute_on`.
    #[must_use]
    pub fn with_engine(mut self, engine: FanOut) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Opens a session to `host` and keeps it.
    ///
    /// A no-op if the host already has a live session. A failed attempt
    /// leaves nothing in the pool.
    pub fn connect(&self, host: &HostRecord) -> Result<(), ConnectionError> {
        if let Some(existing) = self.lookup(host.id()) {
            if lock(&existing).is_connected() {
                return Ok(());
            }
        }

        let mut session = Session::new(host.clone(), Arc::clone(&self.transport))
            .with_connect_timeout(self.connect_timeout);
        session.connect(self.connect_timeout)?;

        self.sessions()
            .insert(host.id(), Arc::new(Mutex::new(session)));
        info!("Pooled session for {}", host.label());
        Ok(())
    }

    /// Closes and forgets one host's session. Returns false if none.
    pub fn disconnect(&self, id: HostId) -> bool {
        let removed = self.sessions().remove(&id);
        match removed {
            Some(session) => {
                lock(&session).disconnect();
                debug!("Released pooled session {}", id);
                true
            }
            None => false,
        }
    }

    /// Closes every pooled session.
    pub fn disconnect_all(&self) {
        let drained: Vec<SharedSession> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in &drained {
            lock(session).disconnect();
        }
        if !drained.is_empty() {
            info!("Closed {} pooled session(s)", drained.len());
        }
    }

    /// Ids of hosts with a live session.
    #[must_use]
    pub fn connected_hosts(&self) -> Vec<HostId> {
        let sessions: Vec<(HostId, SharedSession)> = self
            .sessions()
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        sessions
            .into_iter()
            .filter(|(_, s)| lock(s).is_connected())
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of pooled sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Returns true if the pool holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `command` on the pooled sessions for `ids`.
    ///
    /// Ids without a pooled session produce a `NotConnected` result rather
    /// than being skipped.
    pub fn execute_on(
        &self,
        ids: &[HostId],
        command: &str,
        timeout: Duration,
        on_result: Option<&ResultCallback<'_>>,
    ) -> Vec<OperationResult> {
        let targets: Vec<PoolTarget> = ids
            .iter()
            .map(|id| {
                let session = self.lookup(*id);
                let host = match &session {
                    Some(s) => lock(s).host_ref(),
                    None => HostRef {
                        id: *id,
                        label: id.short(),
                        address: String::new(),
                        port: 0,
                    },
                };
                PoolTarget { host, session }
            })
            .collect();

        let request = OperationRequest::command(command);
        self.engine.run(
            &targets,
            &request,
            |target| match &target.session {
                Some(session) => vec![lock(session).execute(command, timeout)],
                None => vec![OperationResult::failed(
                    target.host.clone(),
                    OperationRequest::command(command),
                    Failure::NotConnected,
                    Duration::ZERO,
                )],
            },
            on_result,
        )
    }

    /// Runs `command` on every pooled session.
    pub fn execute_on_all(
        &self,
        command: &str,
        timeout: Duration,
        on_result: Option<&ResultCallback<'_>>,
    ) -> Vec<OperationResult> {
        let ids: Vec<HostId> = self.sessions().keys().copied().collect();
        let started = Instant::now();
        let results = self.execute_on(&ids, command, timeout, on_result);
        debug!(
            "Pooled broadcast to {} host(s) took {:?}",
            ids.len(),
            started.elapsed()
        );
        results
    }

    fn lookup(&self, id: HostId) -> Option<SharedSession> {
        self.sessions().get(&id).cloned()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<HostId, SharedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// Locks a session, recovering from a poisoned lock.
fn lock(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

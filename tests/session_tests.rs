//! Session and session pool tests.
//!
//! Tests cover: the connection state machine, command results, explicit
//! reconnects, guaranteed close on drop, and pooled fan-out.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::host;
use helpers::mock_transport::MockTransport;
use pretty_assertions::assert_eq;
use sshfleet::fanout::Failure;
use sshfleet::registry::HostId;
use sshfleet::session::{ConnectionError, FailureKind, Session, SessionPool, SessionState};

const TIMEOUT: Duration = Duration::from_secs(5);

fn session(transport: &MockTransport, address: &str) -> Session {
    Session::new(host(address), Arc::new(transport.clone()))
}

#[test]
fn test_connect_transitions() {
    let transport = MockTransport::new();
    let mut session = session(&transport, "web1");
    assert_eq!(session.state(), &SessionState::Disconnected);

    session.connect(TIMEOUT).unwrap();
    assert_eq!(session.state(), &SessionState::Connected);

    // Already connected: no second handshake.
    session.connect(TIMEOUT).unwrap();
    assert_eq!(transport.connects(), 1);

    session.disconnect();
    assert_eq!(session.state(), &SessionState::Disconnected);
    assert_eq!(transport.open_connections(), 0);
}

#[test]
fn test_failed_connect_then_explicit_retry() {
    let transport = MockTransport::new().reject_auth("web1");
    let mut session = session(&transport, "web1");

    let err = session.connect(TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Authentication);
    assert!(matches!(
        session.state(),
        SessionState::Failed(ConnectionError::AuthRejected(_))
    ));

    // Still failing; the second attempt is fresh, not cached.
    assert!(session.connect(TIMEOUT).is_err());
    assert_eq!(transport.connects(), 0);
}

#[test]
fn test_nonzero_exit_is_a_completed_result() {
    let transport = MockTransport::new().command("cat /missing", "", "No such file\n", 1);
    let mut session = session(&transport, "web1");

    let result = session.execute("false", TIMEOUT);
    assert!(!result.success());
    assert_eq!(result.exit_code(), Some(1));
    assert!(result.failure().is_none());

    let result = session.execute("cat /missing", TIMEOUT);
    let output = result.command_output().unwrap();
    assert_eq!(output.stderr, "No such file\n");
    assert_eq!(output.exit_code, 1);
}

#[test]
fn test_execute_captures_stdout() {
    let transport = MockTransport::new().command("uptime", " 10:00 up 3 days\n", "", 0);
    let mut session = session(&transport, "web1");

    let result = session.execute("uptime", TIMEOUT);
    assert!(result.success());
    assert_eq!(result.command_output().unwrap().stdout, " 10:00 up 3 days\n");
    assert_eq!(result.host().label, "web1");
}

#[test]
fn test_execute_on_unreachable_host_fails_without_panicking() {
    let transport = MockTransport::new().unreachable("web1");
    let mut session = session(&transport, "web1");

    let result = session.execute("uptime", TIMEOUT);
    assert!(!result.success());
    assert!(matches!(
        result.failure(),
        Some(Failure::Connection(ConnectionError::Network(_)))
    ));
}

#[test]
fn test_broken_connection_disconnects() {
    let transport = MockTransport::new();
    let mut session = session(&transport, "web1");

    let result = session.execute("drop-connection", TIMEOUT);
    assert!(!result.success());
    assert_eq!(session.state(), &SessionState::Disconnected);
    assert_eq!(transport.open_connections(), 0);

    // Next operation reconnects.
    assert!(session.execute("true", TIMEOUT).success());
    assert_eq!(transport.connects(), 2);
}

#[test]
fn test_drop_closes_connection() {
    let transport = MockTransport::new();
    {
        let mut session = session(&transport, "web1");
        session.connect(TIMEOUT).unwrap();
        assert_eq!(transport.open_connections(), 1);
    }
    assert_eq!(transport.open_connections(), 0);
}

#[test]
fn test_pool_connect_and_execute() {
    let transport = MockTransport::new();
    let pool = SessionPool::new(Arc::new(transport.clone()));
    let web = host("web1");
    let db = host("db1");

    pool.connect(&web).unwrap();
    pool.connect(&db).unwrap();
    pool.connect(&web).unwrap();
    assert_eq!(transport.connects(), 2);
    assert_eq!(pool.len(), 2);

    let results = pool.execute_on(&[web.id(), db.id()], "hostname", TIMEOUT, None);
    assert_eq!(results.len(), 2);
    for result in &results {
        let stdout = &result.command_output().unwrap().stdout;
        assert_eq!(stdout.trim(), result.host().address);
    }

    // Second fan-out reuses the pooled connections.
    pool.execute_on_all("true", TIMEOUT, None);
    assert_eq!(transport.connects(), 2);
}

#[test]
fn test_pool_unknown_id_reports_not_connected() {
    let transport = MockTransport::new();
    let pool = SessionPool::new(Arc::new(transport));
    let web = host("web1");
    pool.connect(&web).unwrap();

    let stranger = HostId::generate();
    let results = pool.execute_on(&[web.id(), stranger], "true", TIMEOUT, None);

    assert_eq!(results.len(), 2);
    let missing = results.iter().find(|r| r.host().id == stranger).unwrap();
    assert_eq!(missing.failure(), Some(&Failure::NotConnected));
    assert!(results.iter().find(|r| r.host().id == web.id()).unwrap().success());
}

#[test]
fn test_pool_failed_connect_is_not_kept() {
    let transport = MockTransport::new().unreachable("web1");
    let pool = SessionPool::new(Arc::new(transport));

    assert!(pool.connect(&host("web1")).is_err());
    assert!(pool.is_empty());
}

#[test]
fn test_pool_survives_panicking_command() {
    let transport = MockTransport::new();
    let pool = SessionPool::new(Arc::new(transport.clone()));
    let web = host("web1");
    pool.connect(&web).unwrap();

    let results = pool.execute_on(&[web.id()], "panic", TIMEOUT, None);
    assert!(matches!(results[0].failure(), Some(Failure::Panicked(_))));

    let results = pool.execute_on(&[web.id()], "true", TIMEOUT, None);
    assert!(results[0].success());
}

#[test]
fn test_pool_disconnect_and_drop() {
    let transport = MockTransport::new();
    let web = host("web1");
    let db = host("db1");
    {
        let pool = SessionPool::new(Arc::new(transport.clone()));
        pool.connect(&web).unwrap();
        pool.connect(&db).unwrap();

        assert!(pool.disconnect(web.id()));
        assert!(!pool.disconnect(web.id()));
        assert_eq!(pool.connected_hosts(), vec![db.id()]);
        assert_eq!(transport.open_connections(), 1);
    }
    assert_eq!(transport.open_connections(), 0);
}

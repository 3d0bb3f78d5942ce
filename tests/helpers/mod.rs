//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

pub mod mock_transport;

use std::path::Path;

use sshfleet::registry::{HostRecord, HostRegistry};

/// KDF rounds used by tests; production uses the full count.
pub const TEST_ROUNDS: u32 = 1_000;

/// Opens a registry in `dir` with the reduced round count.
pub fn open_registry(dir: &Path, secret: &str) -> HostRegistry {
    HostRegistry::open_with_iterations(dir, secret, TEST_ROUNDS).expect("open registry")
}

/// Host whose label equals its address.
pub fn host(address: &str) -> HostRecord {
    HostRecord::new(address, "deploy", "hunter2")
}

//! sshfleet
//!
//! Encrypted SSH host vault with concurrent multi-host command execution
//! and file transfer.
//!
//! # Architecture
//!
//! - **Vault**: master-secret key derivation and authenticated encryption
//! - **Registry**: persistent host records with encrypted secrets
//! - **Session**: one connection to one host, plus a pool of long-lived ones
//! - **Fan-out**: the same operation on many hosts concurrently
//! - **Transfer**: uploads and downloads over a session's file channel
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use sshfleet::fanout::Broadcaster;
//! use sshfleet::registry::HostRegistry;
//! use sshfleet::session::SshTransport;
//!
//! let registry = HostRegistry::open_or_create(Path::new("/tmp/fleet"), "master")
//!     .expect("Failed to open registry");
//! let broadcaster = Broadcaster::new(Arc::new(SshTransport::new()));
//! for result in broadcaster.run(&registry.list(None), "uptime", None) {
//!     println!("{}: {}", result.host(), result.success());
//! }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod fanout;
pub mod logging;
pub mod prompt;
pub mod registry;
pub mod session;
pub mod transfer;
pub mod vault;

// Re-export main types
pub use config::Config;
pub use fanout::{Broadcaster, FanOut, OperationRequest, OperationResult};
pub use registry::{HostRecord, HostRegistry};
pub use session::{Session, SessionPool, SshTransport};
pub use transfer::TransferOrchestrator;
pub use vault::Vault;

//! Host registry.
//!
//! CRUD store of host records, persisted as a single vault-encrypted
//! document. Every mutation rewrites the whole document; writers are
//! serialized behind a lock while readers see consistent snapshots.

pub mod host;
pub mod storage;

pub use host::{ChangeError, DEFAULT_GROUP, DEFAULT_PORT, HostChange, HostId, HostRecord};
pub use storage::{DOCUMENT_FILE_NAME, DocumentError, RegistryDocument, StoredHost};

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vault::{KDF_ITERATIONS, Vault, VaultError};

/// Master secret check failed.
///
/// A wrong secret and a tampered store look the same under authenticated
/// encryption, so there is exactly one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Verification token did not open to the expected text.
    #[error("Wrong master secret or corrupted store")]
    InvalidMasterSecret,
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Master secret rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Document exists but its salt file is gone.
    #[error("Salt file missing at {0}; stored secrets cannot be decrypted")]
    MissingSalt(PathBuf),

    /// Vault failure.
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// Document read/write failure.
    #[error("Storage error: {0}")]
    Document(#[from] DocumentError),

    /// Rejected host change.
    #[error("Invalid change: {0}")]
    InvalidChange(#[from] ChangeError),

    /// Internal lock poisoned by a panicking writer.
    #[error("Registry lock poisoned")]
    Poisoned,
}

/// Persistent host registry.
#[derive(Debug)]
pub struct HostRegistry {
    /// Path to the registry document.
    path: PathBuf,
    /// Initialized vault.
    vault: Vault,
    /// In-memory host list.
    hosts: RwLock<Vec<HostRecord>>,
}

impl HostRegistry {
    /// Returns true if no registry document exists in `data_dir` yet.
    #[must_use]
    pub fn is_first_run(data_dir: &Path) -> bool {
        !data_dir.join(DOCUMENT_FILE_NAME).exists()
    }

    /// Opens the registry in `data_dir`, creating it on first run.
    ///
    /// On an existing store the verification token is the only password
    /// check; a mismatch returns [`AuthError::InvalidMasterSecret`].
    pub fn open_or_create(data_dir: &Path, master_secret: &str) -> Result<Self, RegistryError> {
        Self::open_with_iterations(data_dir, master_secret, KDF_ITERATIONS)
    }

    /// Opens the registry with a custom KDF round count.
    ///
    /// Intended for tests.
    pub fn open_with_iterations(
        data_dir: &Path,
        master_secret: &str,
        iterations: u32,
    ) -> Result<Self, RegistryError> {
        let path = data_dir.join(DOCUMENT_FILE_NAME);
        let mut vault = Vault::with_iterations(data_dir, iterations);

        if path.exists() && vault.is_first_run() {
            return Err(RegistryError::MissingSalt(vault.salt_path().to_path_buf()));
        }

        vault.initialize(master_secret)?;

        if !path.exists() {
            info!("Creating new host registry at {}", path.display());
            RegistryDocument::seal(&[], &vault)?.write(&path)?;
            return Ok(Self {
                path,
                vault,
                hosts: RwLock::new(Vec::new()),
            });
        }

        let document = RegistryDocument::read(&path)?;
        if !document.verify(&vault) {
            warn!("Registry verification failed for {}", path.display());
            return Err(AuthError::InvalidMasterSecret.into());
        }

        let hosts = document.open(&vault).map_err(|e| match e {
            DocumentError::Vault(VaultError::InvalidCiphertext) => {
                RegistryError::Auth(AuthError::InvalidMasterSecret)
            }
            other => other.into(),
        })?;

        info!("Loaded {} host(s) from {}", hosts.len(), path.display());
        Ok(Self {
            path,
            vault,
            hosts: RwLock::new(hosts),
        })
    }

    /// Returns the registry document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of saved hosts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().map(|hosts| hosts.len()).unwrap_or(0)
    }

    /// Returns true if there are no saved hosts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a host and persists. Returns its id.
    pub fn add(&self, record: HostRecord) -> Result<HostId, RegistryError> {
        let id = record.id();
        self.mutate(|hosts| {
            hosts.push(record);
            true
        })?;
        info!("Added host {}", id);
        Ok(id)
    }

    /// Removes a host and persists. Returns false if `id` is unknown.
    pub fn remove(&self, id: HostId) -> Result<bool, RegistryError> {
        let removed = self.mutate(|hosts| {
            let before = hosts.len();
            hosts.retain(|h| h.id() != id);
            hosts.len() < before
        })?;
        if removed {
            info!("Removed host {}", id);
        }
        Ok(removed)
    }

    /// Applies typed changes to a host and persists.
    ///
    /// Returns false if `id` is unknown. Invalid changes are rejected
    /// before anything is written.
    pub fn update(&self, id: HostId, changes: &[HostChange]) -> Result<bool, RegistryError> {
        for change in changes {
            change.validate()?;
        }

        let mut outcome = Ok(());
        let updated = self.mutate(|hosts| match hosts.iter_mut().find(|h| h.id() == id) {
            Some(host) => {
                outcome = host.apply(changes);
                outcome.is_ok()
            }
            None => false,
        })?;
        outcome?;

        if updated {
            debug!(
                "Updated host {} ({:?})",
                id,
                changes.iter().map(HostChange::field).collect::<Vec<_>>()
            );
        }
        Ok(updated)
    }

    /// Returns a snapshot of a host by id.
    #[must_use]
    pub fn get(&self, id: HostId) -> Option<HostRecord> {
        self.read().ok()?.iter().find(|h| h.id() == id).cloned()
    }

    /// Returns the first host with exactly this label.
    #[must_use]
    pub fn find_by_label(&self, label: &str) -> Option<HostRecord> {
        self.read()
            .ok()?
            .iter()
            .find(|h| h.label() == label)
            .cloned()
    }

    /// Lists hosts, optionally restricted to one group.
    #[must_use]
    pub fn list(&self, group: Option<&str>) -> Vec<HostRecord> {
        let Ok(hosts) = self.read() else {
            return Vec::new();
        };
        hosts
            .iter()
            .filter(|h| group.is_none_or(|g| h.group == g))
            .cloned()
            .collect()
    }

    /// Case-insensitive search over label, address and description.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<HostRecord> {
        let query = query.to_lowercase();
        let Ok(hosts) = self.read() else {
            return Vec::new();
        };
        hosts
            .iter()
            .filter(|h| h.matches_lowercase(&query))
            .cloned()
            .collect()
    }

    /// Returns sorted distinct group names.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        let Ok(hosts) = self.read() else {
            return Vec::new();
        };
        let mut groups: Vec<String> = hosts.iter().map(|h| h.group.clone()).collect();
        groups.sort();
        groups.dedup();
        groups
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<HostRecord>>, RegistryError> {
        self.hosts.read().map_err(|_| RegistryError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<HostRecord>>, RegistryError> {
        self.hosts.write().map_err(|_| RegistryError::Poisoned)
    }

    /// Runs `f` on a copy of the host list; if it reports a change, the
    /// copy is persisted and then published.
    ///
    /// The write lock is held across the rewrite, so mutations are
    /// serialized and a failed write leaves memory and disk unchanged.
    fn mutate<F>(&self, f: F) -> Result<bool, RegistryError>
    where
        F: FnOnce(&mut Vec<HostRecord>) -> bool,
    {
        let mut guard = self.write()?;
        let mut next = guard.clone();
        if !f(&mut next) {
            return Ok(false);
        }

        RegistryDocument::seal(&next, &self.vault)?.write(&self.path)?;
        *guard = next;
        Ok(true)
    }
}

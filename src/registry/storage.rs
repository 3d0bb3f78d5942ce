//! On-disk registry document.
//!
//! The whole host list is one JSON document. Secrets and the verification
//! token are vault ciphertext; everything else is plain for searching.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::host::{DEFAULT_GROUP, DEFAULT_PORT, HostId, HostRecord};
use crate::vault::{Vault, VaultError};

/// Current document format version.
pub const DOCUMENT_VERSION: u32 = 1;

/// Maximum document size accepted on load (4MB).
pub const MAX_DOCUMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Registry document file name inside the data directory.
pub const DOCUMENT_FILE_NAME: &str = "hosts.json";

/// Known plaintext sealed as the verification token.
pub(crate) const VERIFICATION_TEXT: &str = "sshfleet-verification-v1";

/// Complete persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Format version.
    pub version: u32,
    /// Verification token ciphertext.
    pub verification: String,
    /// Host entries, secrets encrypted.
    #[serde(default)]
    pub hosts: Vec<StoredHost>,
}

/// One persisted host entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredHost {
    /// Host id (UUID string).
    pub id: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Hostname or IP address.
    pub address: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login name.
    #[serde(default)]
    pub login: String,
    /// Secret ciphertext; empty when the host has no secret.
    #[serde(default)]
    pub secret: String,
    /// Group tag.
    #[serde(default = "default_group")]
    pub group: String,
    /// Description.
    #[serde(default)]
    pub description: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Errors from reading or writing the document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// File too large.
    #[error("Registry file too large (max {MAX_DOCUMENT_SIZE} bytes)")]
    FileTooLarge,

    /// Vault failure while sealing or opening fields.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Stored id is not a UUID.
    #[error("Invalid host id in registry: {0}")]
    InvalidId(String),
}

impl RegistryDocument {
    /// Builds a document from in-memory hosts, encrypting every secret and
    /// a fresh verification token.
    pub fn seal(hosts: &[HostRecord], vault: &Vault) -> Result<Self, DocumentError> {
        let hosts = hosts
            .iter()
            .map(|host| StoredHost::seal(host, vault))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: DOCUMENT_VERSION,
            verification: vault.encrypt(VERIFICATION_TEXT)?,
            hosts,
        })
    }

    /// Returns true if the verification token opens to the known text.
    #[must_use]
    pub fn verify(&self, vault: &Vault) -> bool {
        matches!(vault.decrypt(&self.verification), Ok(text) if text == VERIFICATION_TEXT)
    }

    /// Decrypts every host entry.
    pub fn open(&self, vault: &Vault) -> Result<Vec<HostRecord>, DocumentError> {
        self.hosts.iter().map(|stored| stored.open(vault)).collect()
    }

    /// Reads a document from disk.
    pub fn read(path: &Path) -> Result<Self, DocumentError> {
        let metadata = fs::metadata(path)?;
        if metadata.len() > MAX_DOCUMENT_SIZE {
            return Err(DocumentError::FileTooLarge);
        }

        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the document atomically with owner-only permissions.
    ///
    /// Content goes to a sibling temp file which is then renamed over the
    /// target, so a failed write leaves the previous document intact.
    pub fn write(&self, path: &Path) -> Result<(), DocumentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = temp_path_for(path);
        if temp_path.exists() {
            fs::remove_file(&temp_path)?;
        }

        let result = (|| -> io::Result<()> {
            let mut file = crate::vault::create_private_file(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

impl StoredHost {
    fn seal(host: &HostRecord, vault: &Vault) -> Result<Self, DocumentError> {
        let secret = if host.secret.is_empty() {
            String::new()
        } else {
            vault.encrypt(&host.secret)?
        };

        Ok(Self {
            id: host.id().to_string(),
            label: host.label().to_string(),
            address: host.address.clone(),
            port: host.port,
            login: host.login.clone(),
            secret,
            group: host.group.clone(),
            description: host.description.clone(),
        })
    }

    fn open(&self, vault: &Vault) -> Result<HostRecord, DocumentError> {
        let id = HostId::parse(&self.id).ok_or_else(|| DocumentError::InvalidId(self.id.clone()))?;

        let mut host = HostRecord::restore(id, self.address.clone(), self.label.clone());
        host.port = self.port;
        host.login.clone_from(&self.login);
        host.group.clone_from(&self.group);
        host.description.clone_from(&self.description);
        if !self.secret.is_empty() {
            host.secret = vault.decrypt(&self.secret)?;
        }
        Ok(host)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

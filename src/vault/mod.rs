//! Credential vault.
//!
//! Derives an AES-256-GCM key from a master secret with PBKDF2-HMAC-SHA256
//! and a per-installation salt, then encrypts individual string fields.
//!
//! # Ciphertext format
//!
//! `base64(nonce || ciphertext || tag)` with a 96-bit random nonce per call,
//! so every ciphertext is self-contained apart from the key.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// PBKDF2 iteration count for key derivation.
pub const KDF_ITERATIONS: u32 = 480_000;

/// Salt length in bytes (128 bits).
pub const SALT_LEN: usize = 16;

/// Derived key length in bytes.
const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Salt file name inside the data directory.
pub const SALT_FILE_NAME: &str = ".salt";

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Encrypt or decrypt was called before `initialize`.
    #[error("Vault not initialized")]
    NotInitialized,

    /// Authentication failed: wrong key, tampering, or malformed input.
    #[error("Invalid ciphertext (wrong master secret or corrupted data)")]
    InvalidCiphertext,

    /// Key derivation failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Salt file exists but is not a valid salt.
    #[error("Salt file is corrupted ({0} bytes, expected {SALT_LEN})")]
    CorruptSalt(usize),

    /// Salt file I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Key-derivation and authenticated-encryption subsystem.
///
/// Starts uninitialized; `initialize` derives the key and keeps it in
/// memory for the lifetime of the value. The key is wiped on drop.
pub struct Vault {
    /// Path to the salt file.
    salt_path: PathBuf,
    /// PBKDF2 rounds.
    iterations: u32,
    /// Derived key, present once initialized.
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
}

impl Vault {
    /// Creates an uninitialized vault whose salt lives in `data_dir`.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self::with_iterations(data_dir, KDF_ITERATIONS)
    }

    /// Creates a vault with a custom PBKDF2 round count.
    ///
    /// Intended for tests; a different count derives a different key, so
    /// stores written with one count cannot be opened with another.
    #[must_use]
    pub fn with_iterations(data_dir: &Path, iterations: u32) -> Self {
        assert!(iterations > 0, "iterations must be positive");

        Self {
            salt_path: data_dir.join(SALT_FILE_NAME),
            iterations,
            key: None,
        }
    }

    /// Returns the salt file path.
    #[must_use]
    pub fn salt_path(&self) -> &Path {
        &self.salt_path
    }

    /// Returns true once a key has been derived.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.key.is_some()
    }

    /// Returns true if no salt has been created yet.
    #[must_use]
    pub fn is_first_run(&self) -> bool {
        !self.salt_path.exists()
    }

    /// Derives the key from `master_secret` and the installation salt.
    ///
    /// Creates the salt on first call. Does not check the secret against
    /// stored data; callers do that with a verification token.
    pub fn initialize(&mut self, master_secret: &str) -> Result<(), VaultError> {
        let salt = self.load_or_create_salt()?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(
            master_secret.as_bytes(),
            salt.as_slice(),
            self.iterations,
            key.as_mut_slice(),
        );

        self.key = Some(key);
        debug!("Vault key derived ({} rounds)", self.iterations);
        Ok(())
    }

    /// Encrypts a string field.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::InvalidCiphertext)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    /// Decrypts a field produced by [`Vault::encrypt`].
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let cipher = self.cipher()?;

        let blob = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| VaultError::InvalidCiphertext)?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::InvalidCiphertext);
        }

        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| VaultError::InvalidCiphertext)?;

        String::from_utf8(plain).map_err(|_| VaultError::InvalidCiphertext)
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        let key = self.key.as_ref().ok_or(VaultError::NotInitialized)?;
        Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))
    }

    /// Reads the salt, generating and persisting it if absent.
    ///
    /// An existing salt is never replaced.
    fn load_or_create_salt(&self) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if self.salt_path.exists() {
            let salt = Zeroizing::new(fs::read(&self.salt_path)?);
            if salt.len() != SALT_LEN {
                return Err(VaultError::CorruptSalt(salt.len()));
            }
            return Ok(salt);
        }

        if let Some(parent) = self.salt_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut salt = Zeroizing::new(vec![0u8; SALT_LEN]);
        OsRng.fill_bytes(salt.as_mut_slice());

        let mut file = create_private_file(&self.salt_path)?;
        file.write_all(salt.as_slice())?;
        file.sync_all()?;

        info!("Created new vault salt at {}", self.salt_path.display());
        Ok(salt)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("salt_path", &self.salt_path)
            .field("iterations", &self.iterations)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Creates a new file readable and writable only by its owner.
///
/// Fails if the file already exists.
pub(crate) fn create_private_file(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(path)
}

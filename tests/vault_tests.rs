//! Vault integration tests.
//!
//! Tests cover: encrypt/decrypt round trips, nonce freshness, rejection of
//! a wrong master secret, and salt persistence across instances.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod helpers;

use helpers::TEST_ROUNDS;
use proptest::prelude::*;
use sshfleet::vault::{SALT_LEN, Vault, VaultError};

fn vault(dir: &std::path::Path, secret: &str) -> Vault {
    let mut vault = Vault::with_iterations(dir, TEST_ROUNDS);
    vault.initialize(secret).unwrap();
    vault
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_roundtrip_and_fresh_nonce(plaintext in ".*") {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path(), "master");

        let first = vault.encrypt(&plaintext).unwrap();
        let second = vault.encrypt(&plaintext).unwrap();

        prop_assert_ne!(&first, &second);
        prop_assert_eq!(vault.decrypt(&first).unwrap(), plaintext.clone());
        prop_assert_eq!(vault.decrypt(&second).unwrap(), plaintext);
    }

    #[test]
    fn prop_wrong_secret_never_decrypts(
        right in "[a-zA-Z0-9]{1,16}",
        wrong in "[a-zA-Z0-9]{1,16}",
        plaintext in ".{0,64}",
    ) {
        prop_assume!(right != wrong);
        let dir = tempfile::tempdir().unwrap();

        let token = vault(dir.path(), &right).encrypt(&plaintext).unwrap();
        let result = vault(dir.path(), &wrong).decrypt(&token);

        prop_assert!(matches!(result, Err(VaultError::InvalidCiphertext)));
    }
}

#[test]
fn test_same_secret_and_salt_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let token = vault(dir.path(), "master").encrypt("s3cret").unwrap();

    let reopened = vault(dir.path(), "master");
    assert_eq!(reopened.decrypt(&token).unwrap(), "s3cret");

    let salt = std::fs::read(reopened.salt_path()).unwrap();
    assert_eq!(salt.len(), SALT_LEN);
}

#[test]
fn test_uninitialized_vault_refuses_work() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Vault::with_iterations(dir.path(), TEST_ROUNDS);

    assert!(!vault.is_initialized());
    assert!(matches!(vault.encrypt("x"), Err(VaultError::NotInitialized)));
    assert!(matches!(vault.decrypt("x"), Err(VaultError::NotInitialized)));
}

#[test]
fn test_garbage_ciphertext_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault(dir.path(), "master");

    for input in ["", "not base64!!", "AAAA", "QUJD"] {
        assert!(
            matches!(vault.decrypt(input), Err(VaultError::InvalidCiphertext)),
            "input {:?} must be rejected",
            input
        );
    }
}

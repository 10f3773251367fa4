use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bundle::{BundleError, CredentialBundle},
    secret::SecretString,
};

/// Errors produced by credential vault implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// No strong cipher could be used and weak fallback was not accepted.
    #[error("strong encryption is unavailable and weak fallback was not accepted")]
    EncryptionUnavailable,
    /// Wrong password, or the stored record was corrupted or tampered with.
    #[error("decryption failed: wrong password or corrupted credential record")]
    DecryptionFailed,
    /// Nothing has been stored yet (or it was cleared).
    #[error("no credentials stored at {location}")]
    NoCredentialsStored { location: String },
    /// The bundle cannot be used as session material.
    #[error("invalid credential bundle: {0}")]
    InvalidBundle(#[from] BundleError),
    /// The record was written by a newer, unknown format.
    #[error("unsupported credential record version {found}")]
    UnsupportedVersion { found: u32 },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// How a stored record is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    /// AES-256-GCM under a password-derived key.
    Strong,
    /// Reversible obfuscation; NOT encryption.
    Fallback,
}

/// Advisory raised whenever credentials are, or were just, stored without
/// strong encryption. Never an error and never silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeakProtectionWarning {
    pub reason: String,
}

impl fmt::Display for WeakProtectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "credentials are obfuscated, not encrypted ({}); re-store them once strong encryption is available",
            self.reason
        )
    }
}

/// Result of a successful `store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    pub protection: Protection,
    pub warning: Option<WeakProtectionWarning>,
}

impl StoreReport {
    pub fn strong() -> Self {
        Self {
            protection: Protection::Strong,
            warning: None,
        }
    }
}

/// Result of a successful `load`.
#[derive(Debug)]
pub struct LoadedBundle {
    pub bundle: CredentialBundle,
    pub protection: Protection,
    pub warning: Option<WeakProtectionWarning>,
}

/// Contract for password-protected credential storage.
///
/// Callers must not run `store` concurrently with `load`/`clear` on the
/// same backing location without serializing them.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Encrypt and persist `bundle`, replacing any previous record. The
    /// bundle is consumed so its secrets are wiped once encrypted.
    async fn store(
        &self,
        bundle: CredentialBundle,
        password: &SecretString,
    ) -> Result<StoreReport, VaultError>;

    /// Decrypt the stored bundle.
    async fn load(&self, password: &SecretString) -> Result<LoadedBundle, VaultError>;

    /// Destroy the stored record (idempotent).
    async fn clear(&self) -> Result<(), VaultError>;

    /// Whether a record is currently stored.
    async fn exists(&self) -> bool;
}

/// In-memory vault that simulates encryption for tests and smoke runs.
/// This is not cryptographically secure; production code uses `FileVault`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVault {
    inner: Arc<Mutex<Option<MaskedEntry>>>,
}

#[derive(Debug)]
struct MaskedEntry {
    password: SecretString,
    masked: Vec<u8>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<MaskedEntry>>, VaultError> {
        self.inner.lock().map_err(|err| VaultError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl CredentialVault for InMemoryVault {
    async fn store(
        &self,
        bundle: CredentialBundle,
        password: &SecretString,
    ) -> Result<StoreReport, VaultError> {
        bundle.validate()?;
        let json = serde_json::to_vec(&bundle).map_err(|e| VaultError::Storage {
            reason: e.to_string(),
        })?;
        *self.lock()? = Some(MaskedEntry {
            password: password.clone(),
            masked: mask(&json),
        });
        Ok(StoreReport::strong())
    }

    async fn load(&self, password: &SecretString) -> Result<LoadedBundle, VaultError> {
        let guard = self.lock()?;
        let entry = guard.as_ref().ok_or_else(|| VaultError::NoCredentialsStored {
            location: "memory".to_string(),
        })?;
        if entry.password != *password {
            return Err(VaultError::DecryptionFailed);
        }
        let bundle: CredentialBundle =
            serde_json::from_slice(&mask(&entry.masked)).map_err(|_| VaultError::DecryptionFailed)?;
        Ok(LoadedBundle {
            bundle,
            protection: Protection::Strong,
            warning: None,
        })
    }

    async fn clear(&self) -> Result<(), VaultError> {
        self.lock()?.take();
        Ok(())
    }

    async fn exists(&self) -> bool {
        self.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }
}

const MASK_BYTE: u8 = 0xA5;

fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_masks_and_checks_password() {
        let vault = InMemoryVault::new();
        let bundle = CredentialBundle::new([("token", "abc")]);
        vault
            .store(bundle.clone(), &SecretString::from("correct"))
            .await
            .expect("store");

        {
            let inner = vault.inner.lock().expect("lock");
            let entry = inner.as_ref().expect("entry");
            let plain = serde_json::to_vec(&bundle).expect("json");
            assert_ne!(entry.masked, plain);
        }

        let err = vault
            .load(&SecretString::from("wrong"))
            .await
            .expect_err("wrong password");
        assert_eq!(err, VaultError::DecryptionFailed);

        let loaded = vault
            .load(&SecretString::from("correct"))
            .await
            .expect("load");
        assert_eq!(loaded.bundle, bundle);
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let vault = InMemoryVault::new();
        vault
            .store(CredentialBundle::new([("k", "v")]), &SecretString::from("pw"))
            .await
            .expect("store");
        assert!(vault.exists().await);
        vault.clear().await.expect("clear");
        vault.clear().await.expect("clear again");
        assert!(!vault.exists().await);

        let err = vault
            .load(&SecretString::from("pw"))
            .await
            .expect_err("nothing stored");
        assert!(matches!(err, VaultError::NoCredentialsStored { .. }));
    }

    #[test]
    fn warning_mentions_obfuscation() {
        let warning = WeakProtectionWarning {
            reason: "AES-GCM self-test failed".into(),
        };
        assert!(warning.to_string().contains("obfuscated, not encrypted"));
    }
}

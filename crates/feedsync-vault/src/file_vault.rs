use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::{
    bundle::CredentialBundle,
    secret::SecretString,
    vault::{
        CredentialVault, LoadedBundle, Protection, StoreReport, VaultError,
        WeakProtectionWarning,
    },
};
use rand::{rngs::OsRng, RngCore};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    kdf::MIN_ITERATIONS,
    record::{self, EncryptedRecord},
};

/// Tuning knobs for [`FileVault`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultOptions {
    /// PBKDF2 iterations for new records (raised to the 100k floor).
    pub kdf_iterations: u32,
    /// Write an obfuscated record when strong encryption is unavailable,
    /// instead of failing with `EncryptionUnavailable`.
    pub allow_weak_fallback: bool,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_ITERATIONS.get(),
            allow_weak_fallback: false,
        }
    }
}

/// Metadata about the credential file, readable without the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFileInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Unix permission bits (e.g. `0o600`), when the platform has them.
    pub mode: Option<u32>,
    pub protection: Option<Protection>,
}

/// Checks whether a strong cipher is usable before each write.
pub type CipherSelfTest = fn() -> Result<(), String>;

/// Password-protected credential record stored in a single owner-only file.
pub struct FileVault {
    path: PathBuf,
    options: VaultOptions,
    self_test: CipherSelfTest,
}

impl FileVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, VaultOptions::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, options: VaultOptions) -> Self {
        Self {
            path: path.into(),
            options,
            self_test: record::strong_cipher_self_test,
        }
    }

    /// Replace the strong-cipher availability check.
    pub fn with_cipher_self_test(mut self, self_test: CipherSelfTest) -> Self {
        self.self_test = self_test;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inspect the credential file without decrypting it.
    pub fn info(&self) -> Result<CredentialFileInfo, VaultError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFileInfo {
                    path: self.path.clone(),
                    exists: false,
                    size: None,
                    modified: None,
                    mode: None,
                    protection: None,
                });
            }
            Err(err) => return Err(storage_err(err)),
        };

        let protection = read_record(&self.path).ok().map(|r| r.protection());
        Ok(CredentialFileInfo {
            path: self.path.clone(),
            exists: true,
            size: Some(meta.len()),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            mode: file_mode(&meta),
            protection,
        })
    }

    fn seal(
        &self,
        plaintext: &[u8],
        password: &SecretString,
    ) -> Result<(EncryptedRecord, Option<WeakProtectionWarning>), VaultError> {
        let unavailable = match (self.self_test)() {
            Ok(()) => match record::seal_strong(plaintext, password, self.options.kdf_iterations) {
                Ok(record) => return Ok((record, None)),
                Err(VaultError::EncryptionUnavailable) => "AES-256-GCM rejected the derived key".to_string(),
                Err(err) => return Err(err),
            },
            Err(reason) => reason,
        };

        if !self.options.allow_weak_fallback {
            warn!(reason = %unavailable, "strong encryption unavailable; refusing weak fallback");
            return Err(VaultError::EncryptionUnavailable);
        }

        let warning = WeakProtectionWarning {
            reason: unavailable,
        };
        warn!(%warning, "storing credentials with weak protection");
        let record = record::seal_fallback(
            plaintext,
            password,
            self.options.kdf_iterations,
            warning.clone(),
        );
        Ok((record, Some(warning)))
    }
}

#[async_trait]
impl CredentialVault for FileVault {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn store(
        &self,
        bundle: CredentialBundle,
        password: &SecretString,
    ) -> Result<StoreReport, VaultError> {
        bundle.validate()?;
        let plaintext = Zeroizing::new(serde_json::to_vec(&bundle).map_err(storage_err)?);
        drop(bundle);

        let (record, warning) = self.seal(&plaintext, password)?;
        let protection = record.protection();
        write_record(&self.path, &record)?;
        debug!(?protection, "credential record written");

        Ok(StoreReport {
            protection,
            warning,
        })
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn load(&self, password: &SecretString) -> Result<LoadedBundle, VaultError> {
        let record = read_record(&self.path)?;
        let opened = record::open(&record, password)?;
        // Authenticated bytes that do not parse mean a foreign writer, not a
        // retryable condition.
        let bundle: CredentialBundle = serde_json::from_slice(&opened.plaintext)
            .map_err(|_| VaultError::DecryptionFailed)?;
        bundle.validate()?;

        if let Some(warning) = &opened.warning {
            warn!(%warning, "loaded weakly protected credentials");
        }
        debug!(protection = ?opened.protection, "credential record decrypted");

        Ok(LoadedBundle {
            bundle,
            protection: opened.protection,
            warning: opened.warning.clone(),
        })
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn clear(&self) -> Result<(), VaultError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(storage_err(err)),
        };

        overwrite(&self.path, len)?;
        match fs::remove_file(&self.path) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(storage_err(err)),
        }
        debug!("credential record destroyed");
        Ok(())
    }

    async fn exists(&self) -> bool {
        self.path.is_file()
    }
}

fn write_record(path: &Path, record: &EncryptedRecord) -> Result<(), VaultError> {
    let parent = path.parent().ok_or_else(|| VaultError::Storage {
        reason: "invalid credential path".to_string(),
    })?;
    create_private_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    restrict_to_owner(tmp.as_file())?;
    let json = serde_json::to_vec(record).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_record(path: &Path) -> Result<EncryptedRecord, VaultError> {
    let mut file = File::open(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            VaultError::NoCredentialsStored {
                location: path.display().to_string(),
            }
        } else {
            storage_err(err)
        }
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    // A record that no longer parses has been corrupted on disk.
    serde_json::from_slice(&buf).map_err(|_| VaultError::DecryptionFailed)
}

fn overwrite(path: &Path, len: u64) -> Result<(), VaultError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(storage_err)?;
    let mut chunk = [0u8; 4096];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        OsRng.fill_bytes(&mut chunk[..n]);
        file.write_all(&chunk[..n]).map_err(storage_err)?;
        remaining -= n as u64;
    }
    file.sync_all().map_err(storage_err)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(storage_err)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(storage_err)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<(), VaultError> {
    fs::create_dir_all(dir).map_err(storage_err)
}

#[cfg(unix)]
fn restrict_to_owner(file: &File) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(storage_err)
}

// NamedTempFile is already created private to the current user on Windows.
#[cfg(not(unix))]
fn restrict_to_owner(_file: &File) -> Result<(), VaultError> {
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    Some(meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

fn storage_err<E: ToString>(err: E) -> VaultError {
    VaultError::Storage {
        reason: err.to_string(),
    }
}

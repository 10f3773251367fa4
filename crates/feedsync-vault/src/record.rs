//! On-disk credential record.
//!
//! A record is a tagged variant: `strong` (AES-256-GCM) or `fallback`
//! (reversible obfuscation, carrying an explicit weak-protection marker).
//! Every decrypt goes through [`open`], which handles both exhaustively.

use std::num::NonZeroU32;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use feedsync_core::{
    secret::SecretString,
    vault::{Protection, VaultError, WeakProtectionWarning},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::kdf::{self, DerivedKey, SALT_LEN};

/// Current record format version.
pub const FORMAT_VERSION: u32 = 1;

const NONCE_LEN: usize = 12;

/// Associated data binding ciphertexts to this record format.
const AAD: &[u8] = b"feedsync-credentials-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum EncryptedRecord {
    Strong(StrongRecord),
    Fallback(FallbackRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRecord {
    pub version: u32,
    pub kdf_iterations: u32,
    pub salt: String,
    pub nonce: String,
    /// Ciphertext with the 128-bit GCM tag appended.
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub version: u32,
    pub kdf_iterations: u32,
    pub salt: String,
    pub payload: String,
    /// Marker surfaced to the user on every load.
    pub weak_protection: WeakProtectionWarning,
}

impl EncryptedRecord {
    pub fn version(&self) -> u32 {
        match self {
            EncryptedRecord::Strong(r) => r.version,
            EncryptedRecord::Fallback(r) => r.version,
        }
    }

    pub fn protection(&self) -> Protection {
        match self {
            EncryptedRecord::Strong(_) => Protection::Strong,
            EncryptedRecord::Fallback(_) => Protection::Fallback,
        }
    }
}

/// Plaintext recovered from a record, wiped on drop.
pub struct Opened {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub protection: Protection,
    pub warning: Option<WeakProtectionWarning>,
}

/// Known-answer check that AES-256-GCM works on this build/platform.
pub fn strong_cipher_self_test() -> Result<(), String> {
    let cipher = Aes256Gcm::new_from_slice(&[0x42u8; 32]).map_err(|e| e.to_string())?;
    let nonce = Nonce::from_slice(&[0x24u8; NONCE_LEN]);
    let probe = b"feedsync self-test";
    let sealed = cipher
        .encrypt(nonce, probe.as_ref())
        .map_err(|e| format!("seal failed: {e}"))?;
    if sealed.len() != probe.len() + 16 || sealed.starts_with(probe) {
        return Err("cipher output is not encrypted".to_string());
    }
    let opened = cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|e| format!("open failed: {e}"))?;
    if opened != probe {
        return Err("cipher round trip mismatch".to_string());
    }
    Ok(())
}

/// Encrypt `plaintext` under a key derived from `password` and a fresh salt.
pub fn seal_strong(
    plaintext: &[u8],
    password: &SecretString,
    iterations: u32,
) -> Result<EncryptedRecord, VaultError> {
    let iterations = kdf::effective_iterations(iterations);
    let salt = kdf::generate_salt();
    let key = kdf::derive_key(password, &salt, iterations);
    let cipher = build_cipher(&key).ok_or(VaultError::EncryptionUnavailable)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: AAD,
            },
        )
        .map_err(|_| VaultError::EncryptionUnavailable)?;

    Ok(EncryptedRecord::Strong(StrongRecord {
        version: FORMAT_VERSION,
        kdf_iterations: iterations.get(),
        salt: URL_SAFE_NO_PAD.encode(salt),
        nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
    }))
}

/// Obfuscate `plaintext` with a password-derived keystream. This is NOT
/// encryption and offers no integrity; the record says so.
pub fn seal_fallback(
    plaintext: &[u8],
    password: &SecretString,
    iterations: u32,
    warning: WeakProtectionWarning,
) -> EncryptedRecord {
    let iterations = kdf::effective_iterations(iterations);
    let salt = kdf::generate_salt();
    let key = kdf::derive_key(password, &salt, iterations);
    let masked = xor_keystream(plaintext, &key);

    EncryptedRecord::Fallback(FallbackRecord {
        version: FORMAT_VERSION,
        kdf_iterations: iterations.get(),
        salt: URL_SAFE_NO_PAD.encode(salt),
        payload: URL_SAFE_NO_PAD.encode(masked.as_slice()),
        weak_protection: warning,
    })
}

/// Recover the plaintext of `record` with `password`.
///
/// Wrong passwords, tampered bytes and malformed fields all surface as
/// [`VaultError::DecryptionFailed`].
pub fn open(record: &EncryptedRecord, password: &SecretString) -> Result<Opened, VaultError> {
    if record.version() > FORMAT_VERSION {
        return Err(VaultError::UnsupportedVersion {
            found: record.version(),
        });
    }

    match record {
        EncryptedRecord::Strong(r) => {
            let salt = decode_salt(&r.salt)?;
            let nonce_bytes = decode(&r.nonce)?;
            if nonce_bytes.len() != NONCE_LEN {
                return Err(VaultError::DecryptionFailed);
            }
            let ciphertext = decode(&r.ciphertext)?;
            let key = kdf::derive_key(password, &salt, iterations_of(r.kdf_iterations)?);
            let cipher = build_cipher(&key).ok_or(VaultError::DecryptionFailed)?;
            let plaintext = cipher
                .decrypt(
                    Nonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: &ciphertext,
                        aad: AAD,
                    },
                )
                .map_err(|_| VaultError::DecryptionFailed)?;
            Ok(Opened {
                plaintext: Zeroizing::new(plaintext),
                protection: Protection::Strong,
                warning: None,
            })
        }
        EncryptedRecord::Fallback(r) => {
            let salt = decode_salt(&r.salt)?;
            let masked = decode(&r.payload)?;
            let key = kdf::derive_key(password, &salt, iterations_of(r.kdf_iterations)?);
            Ok(Opened {
                plaintext: xor_keystream(&masked, &key),
                protection: Protection::Fallback,
                warning: Some(r.weak_protection.clone()),
            })
        }
    }
}

fn build_cipher(key: &DerivedKey) -> Option<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).ok()
}

fn xor_keystream(input: &[u8], key: &DerivedKey) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(
        input
            .iter()
            .zip(key.as_bytes().iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect(),
    )
}

fn iterations_of(found: u32) -> Result<NonZeroU32, VaultError> {
    kdf::stored_iterations(found).ok_or(VaultError::DecryptionFailed)
}

fn decode(field: &str) -> Result<Vec<u8>, VaultError> {
    URL_SAFE_NO_PAD
        .decode(field)
        .map_err(|_| VaultError::DecryptionFailed)
}

fn decode_salt(field: &str) -> Result<[u8; SALT_LEN], VaultError> {
    decode(field)?
        .try_into()
        .map_err(|_| VaultError::DecryptionFailed)
}

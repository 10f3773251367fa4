//! Password-protected credential storage at rest.
//! AES-256-GCM under a PBKDF2-HMAC-SHA256 key, one record per file.

pub mod file_vault;
pub mod kdf;
pub mod record;

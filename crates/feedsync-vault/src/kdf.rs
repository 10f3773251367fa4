use std::{fmt, num::NonZeroU32};

use feedsync_core::secret::SecretString;
use rand::{rngs::OsRng, RngCore};
use ring::pbkdf2;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the per-write random salt.
pub const SALT_LEN: usize = 16;

/// Length of the derived AES-256 key.
pub const KEY_LEN: usize = 32;

/// Floor for the PBKDF2 iteration count; lower requests are raised to it.
pub const MIN_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Ceiling for the PBKDF2 iteration count. Stored records above it are
/// rejected rather than derived.
pub const MAX_ITERATIONS: NonZeroU32 = match NonZeroU32::new(10_000_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// 256-bit key derived from the vault password. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Effective iteration count for a requested value.
pub fn effective_iterations(requested: u32) -> NonZeroU32 {
    NonZeroU32::new(requested).map_or(MIN_ITERATIONS, |n| {
        n.clamp(MIN_ITERATIONS, MAX_ITERATIONS)
    })
}

/// Iteration count read back from a record; `None` when out of range.
pub fn stored_iterations(found: u32) -> Option<NonZeroU32> {
    NonZeroU32::new(found).filter(|n| (MIN_ITERATIONS..=MAX_ITERATIONS).contains(n))
}

/// Fresh random salt from the OS generator.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// PBKDF2-HMAC-SHA256(password, salt, iterations) -> 256-bit key.
pub fn derive_key(password: &SecretString, salt: &[u8], iterations: NonZeroU32) -> DerivedKey {
    let mut key = DerivedKey {
        bytes: [0u8; KEY_LEN],
    };
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.expose().as_bytes(),
        &mut key.bytes,
    );
    key
}

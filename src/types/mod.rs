mod kem;
mod x25519;

pub use self::kem::{
    KEM_CIPHERTEXT_LENGTH, KEM_PUBLIC_KEY_LENGTH, KEM_SEED_LENGTH, KemCiphertext,
};
pub(crate) use self::kem::{KemDecapsulationKey, KemEncapsulationKey};
pub use self::x25519::{X25519PublicKey, X25519Secret};
#[cfg(test)]
pub(crate) use self::x25519::LOW_ORDER_POINTS;

use crate::Error;
use rand::TryRngCore;
use rand::rngs::OsRng;

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    fill_random(seed.as_mut_slice())?;
    Ok(seed)
}

pub(crate) fn fill_random(dest: &mut [u8]) -> Result<(), Error> {
    OsRng.try_fill_bytes(dest).map_err(|_| Error::Random)
}

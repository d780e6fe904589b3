use crate::codec::Reader;
use crate::hash::sha256;
use crate::types::{
    KEM_PUBLIC_KEY_LENGTH, KEM_SEED_LENGTH, KemCiphertext, KemDecapsulationKey, X25519PublicKey,
    X25519Secret, fill_random,
};
use crate::Error;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use zeroize::Zeroize;

pub const KEY_ID_LENGTH: usize = 8;

/// Encoded [`PrekeyBundlePublic`] length.
pub const PREKEY_BUNDLE_PUBLIC_LENGTH: usize = KEY_ID_LENGTH + KEM_PUBLIC_KEY_LENGTH + 32;

/// Persisted [`PrekeyBundle`] length: KEM seed followed by the DH secret.
pub const PREKEY_BUNDLE_SECRET_LENGTH: usize = KEM_SEED_LENGTH + 32;

/// Truncated hash identifying a prekey bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyId([u8; KEY_ID_LENGTH]);

impl KeyId {
    /// First 8 bytes of `sha256(kem_public_key || dh_public_key)`.
    pub fn compute(kem_public_key: &[u8], dh_public_key: &X25519PublicKey) -> Self {
        let hash = sha256(&[kem_public_key, dh_public_key.as_bytes().as_slice()]);
        let mut id = [0u8; KEY_ID_LENGTH];
        id.copy_from_slice(&hash[..KEY_ID_LENGTH]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LENGTH] {
        &self.0
    }
}

impl From<[u8; KEY_ID_LENGTH]> for KeyId {
    fn from(bytes: [u8; KEY_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

/// The distributable half of a [`PrekeyBundle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrekeyBundlePublic {
    pub key_id: KeyId,
    pub kem_public_key: Vec<u8>,
    pub dh_public_key: X25519PublicKey,
}

impl PrekeyBundlePublic {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREKEY_BUNDLE_PUBLIC_LENGTH);
        self.write(&mut out);
        out
    }

    /// Decodes and checks that `key_id` matches the keys it names.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let public = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(public)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.key_id.as_bytes());
        out.extend_from_slice(&self.kem_public_key);
        out.extend_from_slice(self.dh_public_key.as_bytes());
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let key_id = KeyId(reader.array()?);
        let kem_public_key = reader.bytes(KEM_PUBLIC_KEY_LENGTH)?.to_vec();
        let dh_public_key = X25519PublicKey::from(reader.array::<32>()?);

        if KeyId::compute(&kem_public_key, &dh_public_key) != key_id {
            return Err(Error::Validation(
                "Prekey bundle key id does not match its keys".to_string(),
            ));
        }

        Ok(Self {
            key_id,
            kem_public_key,
            dh_public_key,
        })
    }
}

/// Medium-term DH + KEM keypairs a peer publishes so others can start a
/// session while it is offline.
pub struct PrekeyBundle {
    key_id: KeyId,
    dh_secret: X25519Secret,
    kem_seed: Box<[u8; KEM_SEED_LENGTH]>,
    kem_decapsulation_key: KemDecapsulationKey,
    kem_public_key: Vec<u8>,
}

impl Drop for PrekeyBundle {
    fn drop(&mut self) {
        self.kem_seed.zeroize();
    }
}

impl PrekeyBundle {
    pub fn new() -> Result<Self, Error> {
        let mut kem_seed = Box::new([0u8; KEM_SEED_LENGTH]);
        fill_random(kem_seed.as_mut_slice())?;
        Self::from_secrets(kem_seed, X25519Secret::generate()?)
    }

    /// Builds a bundle from existing secrets; the KEM keypair is derived
    /// from `kem_seed`.
    pub fn from_secrets(
        kem_seed: Box<[u8; KEM_SEED_LENGTH]>,
        dh_secret: X25519Secret,
    ) -> Result<Self, Error> {
        let (kem_decapsulation_key, encapsulation_key) = KemDecapsulationKey::from_seed(&kem_seed)?;
        let kem_public_key = encapsulation_key.to_bytes();
        let key_id = KeyId::compute(&kem_public_key, &dh_secret.public_key());

        Ok(Self {
            key_id,
            dh_secret,
            kem_seed,
            kem_decapsulation_key,
            kem_public_key,
        })
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn public_part(&self) -> PrekeyBundlePublic {
        PrekeyBundlePublic {
            key_id: self.key_id,
            kem_public_key: self.kem_public_key.clone(),
            dh_public_key: self.dh_secret.public_key(),
        }
    }

    /// `kem_seed || dh_secret`.
    pub fn to_bytes(&self) -> Box<[u8; PREKEY_BUNDLE_SECRET_LENGTH]> {
        let mut bytes = Box::new([0u8; PREKEY_BUNDLE_SECRET_LENGTH]);
        bytes[..KEM_SEED_LENGTH].copy_from_slice(self.kem_seed.as_slice());
        let mut dh = self.dh_secret.to_bytes();
        bytes[KEM_SEED_LENGTH..].copy_from_slice(&dh);
        dh.zeroize();
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != PREKEY_BUNDLE_SECRET_LENGTH {
            return Err(Error::Serde(format!(
                "Invalid prekey bundle length: {}, expected {}",
                bytes.len(),
                PREKEY_BUNDLE_SECRET_LENGTH
            )));
        }

        let mut kem_seed = Box::new([0u8; KEM_SEED_LENGTH]);
        kem_seed.copy_from_slice(&bytes[..KEM_SEED_LENGTH]);
        let mut dh = Box::new([0u8; 32]);
        dh.copy_from_slice(&bytes[KEM_SEED_LENGTH..]);

        Self::from_secrets(kem_seed, X25519Secret::from(dh))
    }

    pub(crate) fn dh_secret(&self) -> &X25519Secret {
        &self.dh_secret
    }

    pub(crate) fn decapsulate(&self, ciphertext: &KemCiphertext) -> Result<Box<[u8; 32]>, Error> {
        self.kem_decapsulation_key.decapsulate(ciphertext)
    }
}

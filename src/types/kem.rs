use crate::Error;
use ml_kem::kem::{Decapsulate, DecapsulationKey, Encapsulate, EncapsulationKey};
use ml_kem::{B32, Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem1024Params};
use rand_core::OsRng;
use zeroize::Zeroize;

/// Length of the seed an ML-KEM-1024 keypair is derived from (`d || z`).
pub const KEM_SEED_LENGTH: usize = 64;
/// Encoded ML-KEM-1024 encapsulation (public) key length.
pub const KEM_PUBLIC_KEY_LENGTH: usize = 1568;
/// ML-KEM-1024 ciphertext length.
pub const KEM_CIPHERTEXT_LENGTH: usize = 1568;

/// ML-KEM-1024 ciphertext as carried in an envelope.
///
/// The length is not checked on construction; envelope validation and
/// decapsulation both reject anything other than [`KEM_CIPHERTEXT_LENGTH`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KemCiphertext(Vec<u8>);

impl KemCiphertext {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for KemCiphertext {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[derive(Clone)]
pub(crate) struct KemEncapsulationKey(Box<EncapsulationKey<MlKem1024Params>>);

impl KemEncapsulationKey {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != KEM_PUBLIC_KEY_LENGTH {
            return Err(Error::Validation(format!(
                "Invalid ML-KEM public key length: {}, expected {}",
                bytes.len(),
                KEM_PUBLIC_KEY_LENGTH
            )));
        }

        let encoded = Encoded::<EncapsulationKey<MlKem1024Params>>::try_from(bytes)
            .map_err(|_| Error::Validation("Invalid ML-KEM public key".to_string()))?;
        Ok(Self(Box::new(EncapsulationKey::from_bytes(&encoded))))
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Encapsulates a fresh shared secret against this key.
    pub(crate) fn encapsulate(&self) -> Result<(KemCiphertext, Box<[u8; 32]>), Error> {
        let (ciphertext, mut shared) = self
            .0
            .encapsulate(&mut OsRng)
            .map_err(|_| Error::crypto("ML-KEM encapsulation failed"))?;

        let mut secret = Box::new([0u8; 32]);
        secret.copy_from_slice(shared.as_slice());
        shared.as_mut_slice().zeroize();

        Ok((KemCiphertext(ciphertext.to_vec()), secret))
    }
}

pub(crate) struct KemDecapsulationKey(Box<DecapsulationKey<MlKem1024Params>>);

impl KemDecapsulationKey {
    /// Derives the keypair from a 64-byte seed, split as `d || z`.
    pub(crate) fn from_seed(
        seed: &[u8; KEM_SEED_LENGTH],
    ) -> Result<(Self, KemEncapsulationKey), Error> {
        let d = B32::try_from(&seed[..32])
            .map_err(|_| Error::crypto("ML-KEM seed split failed"))?;
        let z = B32::try_from(&seed[32..])
            .map_err(|_| Error::crypto("ML-KEM seed split failed"))?;

        let (dk, ek) = MlKem1024::generate_deterministic(&d, &z);
        Ok((Self(Box::new(dk)), KemEncapsulationKey(Box::new(ek))))
    }

    pub(crate) fn decapsulate(&self, ciphertext: &KemCiphertext) -> Result<Box<[u8; 32]>, Error> {
        if ciphertext.len() != KEM_CIPHERTEXT_LENGTH {
            return Err(Error::Validation(format!(
                "Invalid ML-KEM ciphertext length: {}, expected {}",
                ciphertext.len(),
                KEM_CIPHERTEXT_LENGTH
            )));
        }

        let ct = Ciphertext::<MlKem1024>::try_from(ciphertext.as_bytes())
            .map_err(|_| Error::Validation("Invalid ML-KEM ciphertext".to_string()))?;
        let mut shared = self
            .0
            .decapsulate(&ct)
            .map_err(|_| Error::crypto("ML-KEM decapsulation failed"))?;

        let mut secret = Box::new([0u8; 32]);
        secret.copy_from_slice(shared.as_slice());
        shared.as_mut_slice().zeroize();
        Ok(secret)
    }
}

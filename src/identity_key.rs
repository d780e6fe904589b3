use crate::Error;
use crate::hash::double_sha256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Compressed secp256k1 public key length.
pub const IDENTITY_PUBLIC_KEY_LENGTH: usize = 33;
/// Short identity length.
pub const NODE_ID_LENGTH: usize = 20;
/// Encoded [`RecoverableSignature`] length.
pub const RECOVERABLE_SIGNATURE_LENGTH: usize = 65;

/// Long-term public identity: a compressed secp256k1 point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityPublicKey([u8; IDENTITY_PUBLIC_KEY_LENGTH]);

impl IdentityPublicKey {
    pub fn as_bytes(&self) -> &[u8; IDENTITY_PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// `sha256(sha256(key))` truncated to [`NODE_ID_LENGTH`] bytes.
    pub fn node_id(&self) -> NodeId {
        let hash = double_sha256(&self.0);
        let mut id = [0u8; NODE_ID_LENGTH];
        id.copy_from_slice(&hash[..NODE_ID_LENGTH]);
        NodeId(id)
    }

    fn from_verifying_key(key: &VerifyingKey) -> Result<Self, Error> {
        let point = key.to_encoded_point(true);
        let bytes: [u8; IDENTITY_PUBLIC_KEY_LENGTH] = point
            .as_bytes()
            .try_into()
            .map_err(|_| Error::crypto("Unexpected compressed point length"))?;
        Ok(Self(bytes))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, Error> {
        VerifyingKey::from_sec1_bytes(&self.0)
            .map_err(|_| Error::Validation("Invalid identity public key".to_string()))
    }
}

impl TryFrom<&[u8]> for IdentityPublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::Validation("Invalid identity public key".to_string()))?;
        Self::from_verifying_key(&key)
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({})", STANDARD.encode(self.0))
    }
}

/// Short, fixed-length identity derived from an [`IdentityPublicKey`].
/// Envelope and control-message signatures are bound to this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &NodeId) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl From<[u8; NODE_ID_LENGTH]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

/// Conversation identifier shared by both peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RatchetId([u8; 32]);

impl RatchetId {
    /// Hash of the two identity keys in sorted order, so either peer
    /// computes the same value.
    pub fn new(a: &IdentityPublicKey, b: &IdentityPublicKey) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };

        let mut input = [0u8; IDENTITY_PUBLIC_KEY_LENGTH * 2];
        input[..IDENTITY_PUBLIC_KEY_LENGTH].copy_from_slice(first.as_bytes());
        input[IDENTITY_PUBLIC_KEY_LENGTH..].copy_from_slice(second.as_bytes());
        Self(double_sha256(&input))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for RatchetId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RatchetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

/// ECDSA signature plus the bit needed to recover the signer's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub recovery_bit: u8,
    pub signature: [u8; 64],
}

impl RecoverableSignature {
    /// `recovery_bit || signature`.
    pub fn to_bytes(&self) -> [u8; RECOVERABLE_SIGNATURE_LENGTH] {
        let mut bytes = [0u8; RECOVERABLE_SIGNATURE_LENGTH];
        bytes[0] = self.recovery_bit;
        bytes[1..].copy_from_slice(&self.signature);
        bytes
    }
}

impl From<[u8; RECOVERABLE_SIGNATURE_LENGTH]> for RecoverableSignature {
    fn from(bytes: [u8; RECOVERABLE_SIGNATURE_LENGTH]) -> Self {
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[1..]);
        Self {
            recovery_bit: bytes[0],
            signature,
        }
    }
}

/// Long-lived secp256k1 signing keypair.
///
/// Every signature is taken over a 32-byte digest; callers hash first.
#[derive(Clone)]
pub struct IdentityKeys {
    signing_key: SigningKey,
    public_key: IdentityPublicKey,
}

impl IdentityKeys {
    pub fn new() -> Result<Self, Error> {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self, Error> {
        let public_key = IdentityPublicKey::from_verifying_key(signing_key.verifying_key())?;
        Ok(Self {
            signing_key,
            public_key,
        })
    }

    /// Restores a keypair from its 32-byte secret scalar. The input is zeroed.
    pub fn from_bytes(mut secret: Box<[u8; 32]>) -> Result<Self, Error> {
        let signing_key = SigningKey::from_slice(secret.as_slice());
        secret.zeroize();
        let signing_key =
            signing_key.map_err(|_| Error::Validation("Invalid identity secret key".to_string()))?;
        Self::from_signing_key(signing_key)
    }

    pub fn to_bytes(&self) -> Box<[u8; 32]> {
        let mut bytes = Box::new([0u8; 32]);
        let mut field = self.signing_key.to_bytes();
        bytes.copy_from_slice(field.as_slice());
        field.as_mut_slice().zeroize();
        bytes
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        self.public_key
    }

    pub fn node_id(&self) -> NodeId {
        self.public_key.node_id()
    }

    pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], Error> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|_| Error::crypto("ECDSA signing failed"))?;
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&signature.to_bytes());
        Ok(bytes)
    }

    pub fn recoverable_sign(&self, digest: &[u8; 32]) -> Result<RecoverableSignature, Error> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|_| Error::crypto("ECDSA signing failed"))?;

        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&signature.to_bytes());
        Ok(RecoverableSignature {
            recovery_bit: recovery_id.to_byte(),
            signature: bytes,
        })
    }

    /// Reconstructs the signer's public key from a signature over `digest`.
    pub fn recover_public_key(
        signature: &RecoverableSignature,
        digest: &[u8; 32],
    ) -> Result<IdentityPublicKey, Error> {
        let recovery_id =
            RecoveryId::from_byte(signature.recovery_bit).ok_or(Error::Authentication)?;
        let parsed = Signature::from_slice(&signature.signature)?;
        let key = VerifyingKey::recover_from_prehash(digest, &parsed, recovery_id)?;
        IdentityPublicKey::from_verifying_key(&key)
    }

    pub fn verify(
        signature: &[u8; 64],
        digest: &[u8; 32],
        public_key: &IdentityPublicKey,
    ) -> bool {
        let Ok(key) = public_key.verifying_key() else {
            return false;
        };
        let Ok(parsed) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_prehash(digest, &parsed).is_ok()
    }

    /// Recovers the signer and compares it with `public_key` in constant time.
    pub fn verify_recoverable(
        signature: &RecoverableSignature,
        digest: &[u8; 32],
        public_key: &IdentityPublicKey,
    ) -> bool {
        match Self::recover_public_key(signature, digest) {
            Ok(recovered) => recovered.0[..].ct_eq(&public_key.0[..]).into(),
            Err(_) => false,
        }
    }
}

mod cipher;

pub use crate::envelope::cipher::{CipherData, NONCE_LENGTH, TAG_LENGTH};

use crate::codec::{Reader, put_flag, put_length_prefixed, put_varint};
use crate::hash::double_sha256;
use crate::types::{KEM_CIPHERTEXT_LENGTH, KemCiphertext, X25519PublicKey};
use crate::{
    Error, IdentityKeys, IdentityPublicKey, KeyId, MAX_MESSAGE_NUMBER, MAX_PREVIOUS_CHAIN_LENGTH,
    NodeId, PROTOCOL_VERSION, RecoverableSignature,
};
use std::sync::OnceLock;

/// Everything an envelope signature covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeFields {
    pub version: u8,
    /// Recipient prekey bundle the sender is addressing.
    pub key_id: KeyId,
    /// Sender's current ratchet public key.
    pub dh_public_key: X25519PublicKey,
    pub message_number: u64,
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u64,
    /// Present only on messages that carry a KEM ratchet step.
    pub kem_ciphertext: Option<KemCiphertext>,
    pub cipher_data: CipherData,
}

impl EnvelopeFields {
    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(self.key_id.as_bytes());
        out.extend_from_slice(self.dh_public_key.as_bytes());
        put_varint(out, self.message_number);
        put_varint(out, self.previous_chain_length);

        put_flag(out, self.kem_ciphertext.is_some());
        if let Some(ciphertext) = &self.kem_ciphertext {
            out.extend_from_slice(ciphertext.as_bytes());
        }

        out.extend_from_slice(&self.cipher_data.nonce);
        put_length_prefixed(out, &self.cipher_data.data);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.u8()?;
        let key_id = KeyId::from(reader.array()?);
        let dh_public_key = X25519PublicKey::from(reader.array::<32>()?);
        let message_number = reader.varint()?;
        let previous_chain_length = reader.varint()?;

        let kem_ciphertext = if reader.flag()? {
            Some(KemCiphertext::from(
                reader.bytes(KEM_CIPHERTEXT_LENGTH)?.to_vec(),
            ))
        } else {
            None
        };

        let nonce = reader.array()?;
        let data = reader.length_prefixed()?.to_vec();

        Ok(Self {
            version,
            key_id,
            dh_public_key,
            message_number,
            previous_chain_length,
            kem_ciphertext,
            cipher_data: CipherData { nonce, data },
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.cipher_data.data.len());
        self.write(&mut out);
        out
    }
}

/// An encrypted message together with the sender's recoverable signature
/// over its double-SHA256 hash.
///
/// The hash and the recovered signer are computed at most once.
#[derive(Clone, Debug)]
pub struct SignedEnvelope {
    fields: EnvelopeFields,
    signature: RecoverableSignature,
    hash: OnceLock<[u8; 32]>,
    signer: OnceLock<Option<IdentityPublicKey>>,
}

impl PartialEq for SignedEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && self.signature == other.signature
    }
}

impl Eq for SignedEnvelope {}

impl SignedEnvelope {
    /// Signs `fields` with the sender's identity.
    pub fn create(fields: EnvelopeFields, identity_keys: &IdentityKeys) -> Result<Self, Error> {
        let hash = double_sha256(&fields.encode());
        let signature = identity_keys.recoverable_sign(&hash)?;

        Ok(Self {
            fields,
            signature,
            hash: OnceLock::from(hash),
            signer: OnceLock::from(Some(identity_keys.public_key())),
        })
    }

    fn from_parts(fields: EnvelopeFields, signature: RecoverableSignature) -> Self {
        Self {
            fields,
            signature,
            hash: OnceLock::new(),
            signer: OnceLock::new(),
        }
    }

    /// `sha256(sha256(fields))`, excluding the signature.
    pub fn hash(&self) -> [u8; 32] {
        *self
            .hash
            .get_or_init(|| double_sha256(&self.fields.encode()))
    }

    /// Identity recovered from the signature, or `None` if recovery fails.
    pub fn signer(&self) -> Option<IdentityPublicKey> {
        *self.signer.get_or_init(|| {
            IdentityKeys::recover_public_key(&self.signature, &self.hash()).ok()
        })
    }

    /// Structural checks that need no key material.
    pub fn validate(&self) -> Result<(), Error> {
        let fields = &self.fields;

        if fields.version != PROTOCOL_VERSION {
            return Err(Error::Validation(format!(
                "Unsupported envelope version {}",
                fields.version
            )));
        }
        if fields.dh_public_key.is_low_order() {
            return Err(Error::Validation("Low-order DH public key".to_string()));
        }
        if fields.message_number > MAX_MESSAGE_NUMBER {
            return Err(Error::Validation(format!(
                "Message number {} out of range",
                fields.message_number
            )));
        }
        if fields.previous_chain_length > MAX_PREVIOUS_CHAIN_LENGTH {
            return Err(Error::Validation(format!(
                "Previous chain length {} out of range",
                fields.previous_chain_length
            )));
        }
        if let Some(ciphertext) = &fields.kem_ciphertext {
            if ciphertext.len() != KEM_CIPHERTEXT_LENGTH {
                return Err(Error::Validation(format!(
                    "Invalid KEM ciphertext length: {}, expected {}",
                    ciphertext.len(),
                    KEM_CIPHERTEXT_LENGTH
                )));
            }
        }

        Ok(())
    }

    /// Validates the envelope and checks that it was signed by the identity
    /// behind `expected`.
    pub fn verify(&self, expected: &NodeId) -> Result<(), Error> {
        self.validate()?;

        let signer = self.signer().ok_or(Error::Authentication)?;
        if signer.node_id().ct_eq(expected) {
            Ok(())
        } else {
            Err(Error::Authentication)
        }
    }

    /// Copy with modified fields and the original signature, which no longer
    /// matches unless `f` leaves the fields unchanged.
    pub fn update(&self, f: impl FnOnce(&mut EnvelopeFields)) -> Self {
        let mut fields = self.fields.clone();
        f(&mut fields);
        Self::from_parts(fields, self.signature)
    }

    pub fn fields(&self) -> &EnvelopeFields {
        &self.fields
    }

    pub fn signature(&self) -> &RecoverableSignature {
        &self.signature
    }

    pub fn key_id(&self) -> KeyId {
        self.fields.key_id
    }

    pub fn dh_public_key(&self) -> &X25519PublicKey {
        &self.fields.dh_public_key
    }

    pub fn message_number(&self) -> u64 {
        self.fields.message_number
    }

    pub fn previous_chain_length(&self) -> u64 {
        self.fields.previous_chain_length
    }

    pub fn kem_ciphertext(&self) -> Option<&KemCiphertext> {
        self.fields.kem_ciphertext.as_ref()
    }

    pub fn cipher_data(&self) -> &CipherData {
        &self.fields.cipher_data
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    /// Decodes the wire layout. Range checks are left to
    /// [`SignedEnvelope::validate`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let envelope = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(envelope)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        self.fields.write(out);
        out.extend_from_slice(&self.signature.to_bytes());
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let fields = EnvelopeFields::read(reader)?;
        let signature = RecoverableSignature::from(reader.array()?);
        Ok(Self::from_parts(fields, signature))
    }
}

use crate::codec::Reader;
use crate::hash::double_sha256;
use crate::{
    Error, IdentityKeys, IdentityPublicKey, NodeId, PrekeyBundlePublic, RecoverableSignature,
    SignedEnvelope,
};
use std::sync::OnceLock;

/// Leading bytes of every [`WireMessage`].
pub const MAGIC_BYTES: [u8; 4] = *b"TRDT";
pub const CONTROL_VERSION: u8 = 0;
pub const TRANSACTION_ID_LENGTH: usize = 6;

const CONTROL_TAG: u8 = 0;
const DATA_TAG: u8 = 1;
const GET_PREKEY_BUNDLE_TAG: u8 = 0;
const PREKEY_BUNDLE_TAG: u8 = 1;

/// Top-level frame exchanged between peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Control(ControlMessage),
    Data(SignedEnvelope),
}

impl WireMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = MAGIC_BYTES.to_vec();
        match self {
            Self::Control(message) => {
                out.push(CONTROL_TAG);
                message.write(&mut out);
            }
            Self::Data(envelope) => {
                out.push(DATA_TAG);
                envelope.write(&mut out);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        if reader.array::<4>()? != MAGIC_BYTES {
            return Err(Error::Serde("Invalid magic bytes".to_string()));
        }

        let message = match reader.u8()? {
            CONTROL_TAG => Self::Control(ControlMessage::read(&mut reader)?),
            DATA_TAG => Self::Data(SignedEnvelope::read(&mut reader)?),
            tag => return Err(Error::Serde(format!("Unknown message tag {}", tag))),
        };
        reader.finish()?;
        Ok(message)
    }
}

/// Key-directory traffic carried next to envelopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlBody {
    GetPrekeyBundle {
        transaction_id: [u8; TRANSACTION_ID_LENGTH],
    },
    PrekeyBundle {
        transaction_id: [u8; TRANSACTION_ID_LENGTH],
        bundle: PrekeyBundlePublic,
    },
}

impl ControlBody {
    pub fn transaction_id(&self) -> &[u8; TRANSACTION_ID_LENGTH] {
        match self {
            Self::GetPrekeyBundle { transaction_id } => transaction_id,
            Self::PrekeyBundle { transaction_id, .. } => transaction_id,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::GetPrekeyBundle { transaction_id } => {
                out.push(GET_PREKEY_BUNDLE_TAG);
                out.extend_from_slice(transaction_id);
            }
            Self::PrekeyBundle {
                transaction_id,
                bundle,
            } => {
                out.push(PREKEY_BUNDLE_TAG);
                out.extend_from_slice(transaction_id);
                bundle.write(out);
            }
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        match reader.u8()? {
            GET_PREKEY_BUNDLE_TAG => Ok(Self::GetPrekeyBundle {
                transaction_id: reader.array()?,
            }),
            PREKEY_BUNDLE_TAG => Ok(Self::PrekeyBundle {
                transaction_id: reader.array()?,
                bundle: PrekeyBundlePublic::read(reader)?,
            }),
            tag => Err(Error::Serde(format!("Unknown control body tag {}", tag))),
        }
    }
}

/// A signed [`ControlBody`]. Signed and verified the same way as envelopes.
#[derive(Clone, Debug)]
pub struct ControlMessage {
    version: u8,
    body: ControlBody,
    signature: RecoverableSignature,
    hash: OnceLock<[u8; 32]>,
    signer: OnceLock<Option<IdentityPublicKey>>,
}

impl PartialEq for ControlMessage {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.body == other.body
            && self.signature == other.signature
    }
}

impl Eq for ControlMessage {}

impl ControlMessage {
    pub fn create(body: ControlBody, identity_keys: &IdentityKeys) -> Result<Self, Error> {
        let hash = double_sha256(&encode_unsigned(CONTROL_VERSION, &body));
        let signature = identity_keys.recoverable_sign(&hash)?;

        Ok(Self {
            version: CONTROL_VERSION,
            body,
            signature,
            hash: OnceLock::from(hash),
            signer: OnceLock::from(Some(identity_keys.public_key())),
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn body(&self) -> &ControlBody {
        &self.body
    }

    pub fn signature(&self) -> &RecoverableSignature {
        &self.signature
    }

    pub fn hash(&self) -> [u8; 32] {
        *self
            .hash
            .get_or_init(|| double_sha256(&encode_unsigned(self.version, &self.body)))
    }

    pub fn signer(&self) -> Option<IdentityPublicKey> {
        *self.signer.get_or_init(|| {
            IdentityKeys::recover_public_key(&self.signature, &self.hash()).ok()
        })
    }

    /// Checks the version and that the signer's short identity is `expected`.
    pub fn verify(&self, expected: &NodeId) -> Result<(), Error> {
        if self.version != CONTROL_VERSION {
            return Err(Error::Validation(format!(
                "Unsupported control message version {}",
                self.version
            )));
        }

        let signer = self.signer().ok_or(Error::Authentication)?;
        if signer.node_id().ct_eq(expected) {
            Ok(())
        } else {
            Err(Error::Authentication)
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        self.body.write(out);
        out.extend_from_slice(&self.signature.to_bytes());
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.u8()?;
        let body = ControlBody::read(reader)?;
        let signature = RecoverableSignature::from(reader.array()?);

        Ok(Self {
            version,
            body,
            signature,
            hash: OnceLock::new(),
            signer: OnceLock::new(),
        })
    }
}

fn encode_unsigned(version: u8, body: &ControlBody) -> Vec<u8> {
    let mut out = vec![version];
    body.write(&mut out);
    out
}

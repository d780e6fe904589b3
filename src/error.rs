use std::fmt;

/// Detail text that may reference key material or internal state.
///
/// Both `Display` and `Debug` print `<redacted>`; only [`InternalDetail::reveal`]
/// hands out the text, and it must never be forwarded to a remote peer.
#[derive(Clone, Eq, PartialEq)]
pub struct InternalDetail(String);

impl InternalDetail {
    pub(crate) fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }

    /// Returns the underlying text. For secure-context logging only.
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InternalDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for InternalDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Errors that can occur during ratchet operations.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// An envelope, key or message field is malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The signature does not recover to the expected identity.
    #[error("Authentication failed")]
    Authentication,

    /// The message gap exceeds the configured skip bound.
    #[error("Message skip too large: {gap} > {max}")]
    SkipTooLarge { gap: u64, max: u64 },

    /// AEAD tag mismatch for the derived key and every cached candidate.
    #[error("Decryption failed")]
    Decryption,

    /// A chain was used before it was seeded.
    #[error("Chain not initialized")]
    UninitializedChain,

    /// No peer prekey id is known to address outbound envelopes to.
    #[error("Remote key id not set")]
    MissingRemoteKeyId,

    /// A message counter reached its representable maximum.
    #[error("Message counter exhausted")]
    CounterOverflow,

    /// A DH ratchet step was requested towards the key already in use.
    #[error("Remote DH public key unchanged")]
    DuplicateRatchetKey,

    /// A cryptographic primitive failed.
    #[error("Cryptographic operation failed")]
    Crypto(InternalDetail),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),
}

impl Error {
    pub(crate) fn crypto(detail: impl Into<String>) -> Self {
        Self::Crypto(InternalDetail::new(detail))
    }

    /// Internal detail attached to this error, if any.
    pub fn internal_detail(&self) -> Option<&str> {
        match self {
            Self::Crypto(detail) => Some(detail.reveal()),
            _ => None,
        }
    }
}

impl From<chacha20poly1305::Error> for Error {
    fn from(_: chacha20poly1305::Error) -> Self {
        Self::Decryption
    }
}

impl From<k256::ecdsa::Error> for Error {
    fn from(_: k256::ecdsa::Error) -> Self {
        Self::Authentication
    }
}

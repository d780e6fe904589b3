//! A bounded triple ratchet.
//!
//! Double Ratchet messaging whose root ratchet can mix an ML-KEM-1024 shared
//! secret into the X25519 output, with every message wrapped in an envelope
//! carrying a recoverable secp256k1 signature.
//!
//! Secret material is zeroed when it is replaced or dropped. This is a
//! best-effort measure; it cannot reach copies the compiler or allocator make.

mod codec;
mod hash;

mod error;
pub use error::{Error, InternalDetail};

mod config;
pub use config::SessionConfig;

mod identity_key;
pub use identity_key::*;

mod types;
pub use types::{
    KEM_CIPHERTEXT_LENGTH, KEM_PUBLIC_KEY_LENGTH, KEM_SEED_LENGTH, KemCiphertext,
    X25519PublicKey, X25519Secret,
};

mod prekey;
pub use prekey::*;

mod ratchet;
pub use ratchet::{MessageSecret, RootRatchet, SymmetricChain, derive_root_key};

mod envelope;
pub use envelope::*;

mod session;
pub use session::RatchetSession;

mod message;
pub use message::*;

/// The only envelope version this crate reads or writes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest message number an envelope may carry (2^53 - 1).
pub const MAX_MESSAGE_NUMBER: u64 = (1 << 53) - 1;

/// Upper bound on an envelope's previous chain length.
pub const MAX_PREVIOUS_CHAIN_LENGTH: u64 = 1_000_000;

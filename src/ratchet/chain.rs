use crate::{Error, MAX_MESSAGE_NUMBER};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const CHAIN_INFO: &[u8] = b"Trident-v1-Chain";
const MESSAGE_INFO: &[u8] = b"Trident-v1-Message";

/// Per-message key handed to the AEAD layer.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageSecret(Box<[u8; 32]>);

impl MessageSecret {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<Box<[u8; 32]>> for MessageSecret {
    fn from(bytes: Box<[u8; 32]>) -> Self {
        Self(bytes)
    }
}

/// One-way key chain. Each step yields a message secret and replaces the
/// chain key; an empty chain refuses every derivation.
#[derive(Clone, Default)]
pub struct SymmetricChain {
    chain_key: Option<Box<[u8; 32]>>,
    message_number: u64,
    cached_secret: Option<MessageSecret>,
}

impl Zeroize for SymmetricChain {
    fn zeroize(&mut self) {
        if let Some(chain_key) = self.chain_key.as_mut() {
            chain_key.zeroize();
        }
        self.chain_key = None;
        self.message_number = 0;
        self.cached_secret.zeroize();
    }
}

impl Drop for SymmetricChain {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for SymmetricChain {}

impl SymmetricChain {
    pub fn new(chain_key: Box<[u8; 32]>) -> Self {
        Self::restore(Some(chain_key), 0)
    }

    pub(crate) fn restore(chain_key: Option<Box<[u8; 32]>>, message_number: u64) -> Self {
        Self {
            chain_key,
            message_number,
            cached_secret: None,
        }
    }

    /// Next chain key. Uses a different info label than
    /// [`SymmetricChain::derive_message_secret`], so the two outputs are independent.
    pub fn derive_next_chain_key(chain_key: &[u8; 32]) -> Result<Box<[u8; 32]>, Error> {
        expand(chain_key, CHAIN_INFO)
    }

    pub fn derive_message_secret(chain_key: &[u8; 32]) -> Result<MessageSecret, Error> {
        expand(chain_key, MESSAGE_INFO).map(MessageSecret)
    }

    pub fn is_initialized(&self) -> bool {
        self.chain_key.is_some()
    }

    pub fn message_number(&self) -> u64 {
        self.message_number
    }

    pub(crate) fn chain_key(&self) -> Option<&[u8; 32]> {
        self.chain_key.as_deref()
    }

    /// Message secret for the current position.
    pub fn secret(&mut self) -> Result<MessageSecret, Error> {
        if let Some(secret) = &self.cached_secret {
            return Ok(secret.clone());
        }

        let chain_key = self.chain_key.as_ref().ok_or(Error::UninitializedChain)?;
        let secret = Self::derive_message_secret(chain_key)?;
        self.cached_secret = Some(secret.clone());
        Ok(secret)
    }

    /// Steps the chain forward once. The previous chain key is zeroed.
    pub fn advance(&mut self) -> Result<(), Error> {
        let chain_key = self.chain_key.as_mut().ok_or(Error::UninitializedChain)?;
        if self.message_number >= MAX_MESSAGE_NUMBER {
            return Err(Error::CounterOverflow);
        }

        let next = Self::derive_next_chain_key(chain_key)?;
        chain_key.zeroize();
        *chain_key = next;

        self.message_number += 1;
        self.cached_secret = None;
        Ok(())
    }

    pub fn reset(&mut self, chain_key: Box<[u8; 32]>) {
        self.zeroize();
        self.chain_key = Some(chain_key);
    }
}

fn expand(chain_key: &[u8; 32], info: &[u8]) -> Result<Box<[u8; 32]>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, chain_key);
    let mut okm = Box::new([0u8; 32]);
    hkdf.expand(info, okm.as_mut_slice())
        .map_err(|_| Error::crypto("HKDF expansion failed for chain"))?;
    Ok(okm)
}

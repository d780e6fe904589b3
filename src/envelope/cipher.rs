use crate::types::fill_random;
use crate::{Error, MessageSecret};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LENGTH: usize = 24;
/// Poly1305 tag appended to every ciphertext.
pub const TAG_LENGTH: usize = 16;

/// Nonce and AEAD output of one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherData {
    pub nonce: [u8; NONCE_LENGTH],
    pub data: Vec<u8>,
}

impl CipherData {
    /// Encrypts under a message secret with a random nonce.
    pub fn encrypt(secret: &MessageSecret, plaintext: &[u8]) -> Result<Self, Error> {
        let mut nonce = [0u8; NONCE_LENGTH];
        fill_random(&mut nonce)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
        let data = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::crypto("Message encryption failed"))?;

        Ok(Self { nonce, data })
    }

    pub fn decrypt(&self, secret: &MessageSecret) -> Result<Vec<u8>, Error> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
        Ok(cipher.decrypt(XNonce::from_slice(&self.nonce), self.data.as_slice())?)
    }
}

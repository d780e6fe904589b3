mod chain;

pub use crate::ratchet::chain::{MessageSecret, SymmetricChain};

use crate::types::{KemCiphertext, KemEncapsulationKey, X25519PublicKey, X25519Secret};
use crate::{Error, PrekeyBundle, PrekeyBundlePublic};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

const ROOT_INFO: &[u8] = b"Trident-v1-Root";

/// Mixes a shared secret into the root key.
///
/// The DH output is concatenated with the KEM shared secret when one is
/// given, then expanded with `root_key` as HKDF salt into 64 bytes:
/// the new root key followed by a fresh chain key.
pub fn derive_root_key(
    root_key: &[u8; 32],
    dh_shared_secret: &[u8; 32],
    kem_shared_secret: Option<&[u8; 32]>,
) -> Result<(Box<[u8; 32]>, Box<[u8; 32]>), Error> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(dh_shared_secret);
    if let Some(kem) = kem_shared_secret {
        ikm.extend_from_slice(kem);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_slice()), &ikm);
    ikm.zeroize();

    let mut okm = Box::new([0u8; 64]);
    hkdf.expand(ROOT_INFO, okm.as_mut_slice())
        .map_err(|_| Error::crypto("HKDF expansion failed for root key"))?;

    let mut new_root_key = Box::new([0u8; 32]);
    let mut chain_key = Box::new([0u8; 32]);
    new_root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();

    Ok((new_root_key, chain_key))
}

/// Root of the ratchet: the running root key, the local DH pair, the peer's
/// current DH public key and the two chains minted from them.
#[derive(Clone)]
pub struct RootRatchet {
    root_key: Box<[u8; 32]>,
    dh_secret: X25519Secret,
    remote_dh_public: X25519PublicKey,
    sending_chain: SymmetricChain,
    receiving_chain: SymmetricChain,
}

impl Zeroize for RootRatchet {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.dh_secret.zeroize();
        self.sending_chain.zeroize();
        self.receiving_chain.zeroize();
    }
}

impl Drop for RootRatchet {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for RootRatchet {}

impl RootRatchet {
    pub(crate) fn from_parts(
        root_key: Box<[u8; 32]>,
        dh_secret: X25519Secret,
        remote_dh_public: X25519PublicKey,
        sending_chain: SymmetricChain,
        receiving_chain: SymmetricChain,
    ) -> Self {
        Self {
            root_key,
            dh_secret,
            remote_dh_public,
            sending_chain,
            receiving_chain,
        }
    }

    /// Seeds a ratchet from an all-zero root key against a peer's prekey
    /// bundle. Only the sending chain exists afterwards.
    pub(crate) fn initiate(prekey: &PrekeyBundlePublic) -> Result<(Self, KemCiphertext), Error> {
        let (root_key, chain_key, dh_secret, ciphertext) = kem_step(&[0u8; 32], prekey)?;

        let ratchet = Self::from_parts(
            root_key,
            dh_secret,
            prekey.dh_public_key,
            SymmetricChain::new(chain_key),
            SymmetricChain::default(),
        );
        Ok((ratchet, ciphertext))
    }

    /// Responder side of [`RootRatchet::initiate`].
    pub(crate) fn accept(
        prekey: &PrekeyBundle,
        remote_dh_public: &X25519PublicKey,
        ciphertext: &KemCiphertext,
    ) -> Result<Self, Error> {
        let (root_key, sending, receiving, dh_secret) =
            accept_step(&[0u8; 32], prekey, remote_dh_public, ciphertext)?;

        Ok(Self::from_parts(
            root_key,
            dh_secret,
            *remote_dh_public,
            SymmetricChain::new(sending),
            SymmetricChain::new(receiving),
        ))
    }

    pub fn dh_public_key(&self) -> X25519PublicKey {
        self.dh_secret.public_key()
    }

    pub fn remote_dh_public_key(&self) -> X25519PublicKey {
        self.remote_dh_public
    }

    pub fn sending_chain(&self) -> &SymmetricChain {
        &self.sending_chain
    }

    pub fn receiving_chain(&self) -> &SymmetricChain {
        &self.receiving_chain
    }

    pub(crate) fn sending_chain_mut(&mut self) -> &mut SymmetricChain {
        &mut self.sending_chain
    }

    pub(crate) fn receiving_chain_mut(&mut self) -> &mut SymmetricChain {
        &mut self.receiving_chain
    }

    pub(crate) fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    pub(crate) fn dh_secret(&self) -> &X25519Secret {
        &self.dh_secret
    }

    /// Moves both chains onto `new_remote_dh_public`.
    ///
    /// The receiving chain comes from the current local secret; a fresh local
    /// pair then produces the sending chain, with the root key threaded through
    /// both derivations.
    pub fn perform_dh_ratchet(
        &mut self,
        new_remote_dh_public: &X25519PublicKey,
    ) -> Result<(), Error> {
        if *new_remote_dh_public == self.remote_dh_public {
            return Err(Error::DuplicateRatchetKey);
        }

        debug!(target: "trident::ratchet", "Performing DH ratchet");

        let dh_output = self.dh_secret.dh(new_remote_dh_public);
        let (root_key, receiving_key) =
            derive_root_key(&self.root_key, dh_output.as_bytes(), None)?;

        let dh_secret = X25519Secret::generate()?;
        let dh_output = dh_secret.dh(new_remote_dh_public);
        let (root_key, sending_key) = derive_root_key(&root_key, dh_output.as_bytes(), None)?;

        self.root_key.zeroize();
        self.root_key = root_key;
        self.dh_secret = dh_secret;
        self.remote_dh_public = *new_remote_dh_public;
        self.receiving_chain.reset(receiving_key);
        self.sending_chain.reset(sending_key);

        Ok(())
    }

    /// Hybrid step towards a peer prekey. Returns the KEM ciphertext the peer
    /// needs to follow; the receiving chain stays empty until the peer replies
    /// with a new DH key.
    pub fn perform_kem_ratchet(
        &mut self,
        prekey: &PrekeyBundlePublic,
    ) -> Result<KemCiphertext, Error> {
        debug!(target: "trident::ratchet", key_id = %prekey.key_id, "Performing ML-KEM ratchet");

        let (root_key, sending_key, dh_secret, ciphertext) = kem_step(&self.root_key, prekey)?;

        self.root_key.zeroize();
        self.root_key = root_key;
        self.dh_secret = dh_secret;
        self.remote_dh_public = prekey.dh_public_key;
        self.sending_chain.reset(sending_key);
        self.receiving_chain.zeroize();

        Ok(ciphertext)
    }
}

type KemStep = (Box<[u8; 32]>, Box<[u8; 32]>, X25519Secret, KemCiphertext);
type AcceptStep = (Box<[u8; 32]>, Box<[u8; 32]>, Box<[u8; 32]>, X25519Secret);

/// Returns `(root_key, sending_chain_key, local_dh_secret, kem_ciphertext)`.
fn kem_step(root_key: &[u8; 32], prekey: &PrekeyBundlePublic) -> Result<KemStep, Error> {
    let encapsulation_key = KemEncapsulationKey::from_bytes(&prekey.kem_public_key)?;
    if prekey.dh_public_key.is_low_order() {
        return Err(Error::Validation("Low-order prekey DH public key".to_string()));
    }

    let (ciphertext, mut kem_secret) = encapsulation_key.encapsulate()?;
    let dh_secret = X25519Secret::generate()?;
    let dh_output = dh_secret.dh(&prekey.dh_public_key);

    let derived = derive_root_key(root_key, dh_output.as_bytes(), Some(&kem_secret));
    kem_secret.zeroize();
    let (root_key, chain_key) = derived?;

    Ok((root_key, chain_key, dh_secret, ciphertext))
}

/// Returns `(root_key, sending_chain_key, receiving_chain_key, local_dh_secret)`.
fn accept_step(
    root_key: &[u8; 32],
    prekey: &PrekeyBundle,
    remote_dh_public: &X25519PublicKey,
    ciphertext: &KemCiphertext,
) -> Result<AcceptStep, Error> {
    let mut kem_secret = prekey.decapsulate(ciphertext)?;
    let dh_output = prekey.dh_secret().dh(remote_dh_public);

    let derived = derive_root_key(root_key, dh_output.as_bytes(), Some(&kem_secret));
    kem_secret.zeroize();
    let (root_key, receiving_key) = derived?;

    let dh_secret = X25519Secret::generate()?;
    let dh_output = dh_secret.dh(remote_dh_public);
    let (root_key, sending_key) = derive_root_key(&root_key, dh_output.as_bytes(), None)?;

    Ok((root_key, sending_key, receiving_key, dh_secret))
}

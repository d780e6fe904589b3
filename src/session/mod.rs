mod codec;
mod skipped;

use crate::session::skipped::SkippedKeys;
use crate::types::KemCiphertext;
use crate::{
    CipherData, EnvelopeFields, Error, IdentityKeys, IdentityPublicKey, KeyId, MessageSecret,
    PROTOCOL_VERSION, PrekeyBundle, PrekeyBundlePublic, RatchetId, RootRatchet, SessionConfig,
    SignedEnvelope, X25519PublicKey,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Milliseconds since the UNIX epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or(0)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One end of a conversation.
///
/// A session is not synchronized internally; callers serialize every
/// `encrypt`, `decrypt` and ratchet call on the same session. Methods that
/// depend on the clock have an `_at` variant taking milliseconds since the
/// UNIX epoch.
///
/// Secrets are zeroed when they are replaced or dropped. This is
/// best-effort: copies made by the compiler or the allocator before that
/// point are not reachable.
#[derive(Clone)]
pub struct RatchetSession {
    ratchet_id: RatchetId,
    remote_key_id: Option<KeyId>,
    root: RootRatchet,
    previous_chain_length: u64,
    skipped_keys: SkippedKeys,
    last_ratchet_at: u64,
    config: SessionConfig,
}

impl RatchetSession {
    /// Starts a conversation against a peer's published prekey bundle.
    ///
    /// Returns the session and the signed initiation envelope carrying
    /// `first_plaintext` and the KEM ciphertext the peer needs.
    pub fn initialize_as_initiator(
        local: &IdentityPublicKey,
        remote: &IdentityPublicKey,
        remote_prekey: &PrekeyBundlePublic,
        first_plaintext: &[u8],
        identity_keys: &IdentityKeys,
    ) -> Result<(Self, SignedEnvelope), Error> {
        Self::initialize_as_initiator_at(
            local,
            remote,
            remote_prekey,
            first_plaintext,
            identity_keys,
            now_millis(),
        )
    }

    pub fn initialize_as_initiator_at(
        local: &IdentityPublicKey,
        remote: &IdentityPublicKey,
        remote_prekey: &PrekeyBundlePublic,
        first_plaintext: &[u8],
        identity_keys: &IdentityKeys,
        now: u64,
    ) -> Result<(Self, SignedEnvelope), Error> {
        let (root, kem_ciphertext) = RootRatchet::initiate(remote_prekey)?;

        let mut session = Self::new(RatchetId::new(local, remote), root, now);
        session.remote_key_id = Some(remote_prekey.key_id);

        debug!(
            target: "trident::session",
            ratchet_id = %session.ratchet_id,
            key_id = %remote_prekey.key_id,
            "Initialized session as initiator"
        );

        let envelope = session.encrypt(first_plaintext, identity_keys, Some(&kem_ciphertext))?;
        Ok((session, envelope))
    }

    /// Accepts an initiation envelope addressed to `local_prekey`.
    ///
    /// The envelope is verified against `remote` first. It is not decrypted;
    /// pass it to [`RatchetSession::decrypt`] afterwards. A responder has no
    /// remote key id until [`RatchetSession::set_remote_key_id`] is called.
    pub fn initialize_as_responder(
        envelope: &SignedEnvelope,
        local: &IdentityPublicKey,
        local_prekey: &PrekeyBundle,
        remote: &IdentityPublicKey,
    ) -> Result<Self, Error> {
        Self::initialize_as_responder_at(envelope, local, local_prekey, remote, now_millis())
    }

    pub fn initialize_as_responder_at(
        envelope: &SignedEnvelope,
        local: &IdentityPublicKey,
        local_prekey: &PrekeyBundle,
        remote: &IdentityPublicKey,
        now: u64,
    ) -> Result<Self, Error> {
        envelope.verify(&remote.node_id())?;

        let kem_ciphertext = envelope.kem_ciphertext().ok_or_else(|| {
            Error::Validation("Initiation envelope carries no KEM ciphertext".to_string())
        })?;
        if envelope.key_id() != local_prekey.key_id() {
            return Err(Error::Validation(
                "Envelope addresses a different prekey".to_string(),
            ));
        }

        let root = RootRatchet::accept(local_prekey, envelope.dh_public_key(), kem_ciphertext)?;
        let session = Self::new(RatchetId::new(local, remote), root, now);

        debug!(
            target: "trident::session",
            ratchet_id = %session.ratchet_id,
            key_id = %local_prekey.key_id(),
            "Initialized session as responder"
        );

        Ok(session)
    }

    fn new(ratchet_id: RatchetId, root: RootRatchet, now: u64) -> Self {
        Self {
            ratchet_id,
            remote_key_id: None,
            root,
            previous_chain_length: 0,
            skipped_keys: SkippedKeys::default(),
            last_ratchet_at: now,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn ratchet_id(&self) -> RatchetId {
        self.ratchet_id
    }

    pub fn remote_key_id(&self) -> Option<KeyId> {
        self.remote_key_id
    }

    /// Sets the peer prekey that outbound envelopes are addressed to.
    pub fn set_remote_key_id(&mut self, key_id: KeyId) {
        self.remote_key_id = Some(key_id);
    }

    pub fn root(&self) -> &RootRatchet {
        &self.root
    }

    pub fn previous_chain_length(&self) -> u64 {
        self.previous_chain_length
    }

    pub fn last_ratchet_at(&self) -> u64 {
        self.last_ratchet_at
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    /// Encrypts and signs one message on the sending chain.
    ///
    /// `kem_ciphertext` is the value returned by
    /// [`RatchetSession::perform_kem_ratchet`] and is passed only on the
    /// message that follows it.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        identity_keys: &IdentityKeys,
        kem_ciphertext: Option<&KemCiphertext>,
    ) -> Result<SignedEnvelope, Error> {
        let chain = self.root.sending_chain_mut();
        let secret = chain.secret()?;
        let message_number = chain.message_number();
        let key_id = self.remote_key_id.ok_or(Error::MissingRemoteKeyId)?;

        let fields = EnvelopeFields {
            version: PROTOCOL_VERSION,
            key_id,
            dh_public_key: self.root.dh_public_key(),
            message_number,
            previous_chain_length: self.previous_chain_length,
            kem_ciphertext: kem_ciphertext.cloned(),
            cipher_data: CipherData::encrypt(&secret, plaintext)?,
        };
        let envelope = SignedEnvelope::create(fields, identity_keys)?;
        self.root.sending_chain_mut().advance()?;

        trace!(
            target: "trident::session",
            ratchet_id = %self.ratchet_id,
            message_number,
            "Encrypted message"
        );

        Ok(envelope)
    }

    /// Decrypts an envelope, ratcheting first if it carries a new DH key.
    ///
    /// Only structural validation happens here. Callers verify the signer
    /// with [`SignedEnvelope::verify`] before handing the envelope over. On
    /// any error the session is left exactly as it was.
    pub fn decrypt(&mut self, envelope: &SignedEnvelope) -> Result<Vec<u8>, Error> {
        self.decrypt_at(envelope, now_millis())
    }

    pub fn decrypt_at(&mut self, envelope: &SignedEnvelope, now: u64) -> Result<Vec<u8>, Error> {
        if let Err(err) = envelope.validate() {
            warn!(
                target: "trident::session",
                ratchet_id = %self.ratchet_id,
                error = %err,
                "Rejected envelope"
            );
            return Err(err);
        }

        let snapshot = self.clone();
        match self.open(envelope, now) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                *self = snapshot;
                warn!(
                    target: "trident::session",
                    ratchet_id = %self.ratchet_id,
                    message_number = envelope.message_number(),
                    error = %err,
                    "Failed to decrypt envelope"
                );
                Err(err)
            }
        }
    }

    fn open(&mut self, envelope: &SignedEnvelope, now: u64) -> Result<Vec<u8>, Error> {
        if let Some(plaintext) = self.try_skipped_key(envelope) {
            return Ok(plaintext);
        }

        let mut stored = 0;
        let remote_dh_public = envelope.dh_public_key();
        if *remote_dh_public != self.root.remote_dh_public_key() {
            // The sender re-seeded from a root this side does not hold.
            if envelope.kem_ciphertext().is_some() {
                return Err(Error::Validation(
                    "KEM ciphertext outside session initiation".to_string(),
                ));
            }
            stored += self.skip_previous_chain(envelope.previous_chain_length(), now)?;
            self.perform_dh_ratchet_at(remote_dh_public, now)?;
        }

        let message_number = envelope.message_number();
        stored += self.skip_message_keys(message_number, now)?;

        let chain = self.root.receiving_chain_mut();
        let secret = chain.secret()?;
        let plaintext = envelope.cipher_data().decrypt(&secret)?;
        chain.advance()?;

        if stored > 0 {
            self.prune_skipped_keys_at(now);
        }

        trace!(
            target: "trident::session",
            ratchet_id = %self.ratchet_id,
            message_number,
            skipped = stored,
            "Decrypted message"
        );

        Ok(plaintext)
    }

    /// Caches the rest of the receiving chain ahead of a DH ratchet. A gap over
    /// the skip bound abandons the old chain instead of failing, so the ratchet
    /// still goes through.
    fn skip_previous_chain(
        &mut self,
        previous_chain_length: u64,
        now: u64,
    ) -> Result<usize, Error> {
        let chain = self.root.receiving_chain();
        if !chain.is_initialized() {
            return Ok(0);
        }

        let gap = previous_chain_length.saturating_sub(chain.message_number());
        if gap > self.config.max_message_skip {
            warn!(
                target: "trident::session",
                ratchet_id = %self.ratchet_id,
                gap,
                max = self.config.max_message_skip,
                "Abandoned previous receiving chain"
            );
            return Ok(0);
        }

        self.skip_message_keys(previous_chain_length, now)
    }

    /// Walks the receiving chain up to `until`, caching every secret passed over.
    fn skip_message_keys(&mut self, until: u64, now: u64) -> Result<usize, Error> {
        let max = self.config.max_message_skip;
        let chain = self.root.receiving_chain_mut();
        if !chain.is_initialized() {
            return Err(Error::UninitializedChain);
        }

        let gap = until.saturating_sub(chain.message_number());
        if gap > max {
            return Err(Error::SkipTooLarge { gap, max });
        }

        let mut stored = 0;
        while chain.message_number() < until {
            let secret = chain.secret()?;
            self.skipped_keys.insert(chain.message_number(), secret, now);
            chain.advance()?;
            stored += 1;
        }

        Ok(stored)
    }

    pub fn perform_dh_ratchet(&mut self, remote_dh_public: &X25519PublicKey) -> Result<(), Error> {
        self.perform_dh_ratchet_at(remote_dh_public, now_millis())
    }

    pub fn perform_dh_ratchet_at(
        &mut self,
        remote_dh_public: &X25519PublicKey,
        now: u64,
    ) -> Result<(), Error> {
        let previous_chain_length = self.root.sending_chain().message_number();
        self.root.perform_dh_ratchet(remote_dh_public)?;
        self.previous_chain_length = previous_chain_length;
        self.last_ratchet_at = now;

        debug!(
            target: "trident::session",
            ratchet_id = %self.ratchet_id,
            previous_chain_length,
            "Performed DH ratchet"
        );
        Ok(())
    }

    /// Re-seeds the root from a fresh encapsulation against `prekey` and
    /// addresses later envelopes to it. The returned ciphertext goes into the
    /// next [`RatchetSession::encrypt`] call.
    ///
    /// An established peer cannot follow this step: it rejects the rotated
    /// envelope with [`Error::Validation`], and this side fails with
    /// [`Error::Decryption`] on the peer's next message. Both ends must replace
    /// the session afterwards, so only use this to seed a new conversation.
    pub fn perform_kem_ratchet(
        &mut self,
        prekey: &PrekeyBundlePublic,
    ) -> Result<KemCiphertext, Error> {
        self.perform_kem_ratchet_at(prekey, now_millis())
    }

    pub fn perform_kem_ratchet_at(
        &mut self,
        prekey: &PrekeyBundlePublic,
        now: u64,
    ) -> Result<KemCiphertext, Error> {
        let previous_chain_length = self.root.sending_chain().message_number();
        let ciphertext = self.root.perform_kem_ratchet(prekey)?;
        self.previous_chain_length = previous_chain_length;
        self.remote_key_id = Some(prekey.key_id);
        self.last_ratchet_at = now;

        debug!(
            target: "trident::session",
            ratchet_id = %self.ratchet_id,
            key_id = %prekey.key_id,
            previous_chain_length,
            "Performed ML-KEM ratchet"
        );
        Ok(ciphertext)
    }

    /// Whether a rotation is due. Bounds left as `None` fall back to the
    /// session config.
    ///
    /// Within a session, rotation happens through the DH ratchet on the next
    /// reply. [`RatchetSession::perform_kem_ratchet`] ends the session for
    /// both sides.
    pub fn should_ratchet(&self, message_bound: Option<u64>, time_bound: Option<Duration>) -> bool {
        self.should_ratchet_at(message_bound, time_bound, now_millis())
    }

    pub fn should_ratchet_at(
        &self,
        message_bound: Option<u64>,
        time_bound: Option<Duration>,
        now: u64,
    ) -> bool {
        let message_bound = message_bound.unwrap_or(self.config.message_bound);
        let time_bound = millis(time_bound.unwrap_or(self.config.time_bound));

        self.root.sending_chain().message_number() >= message_bound
            || now.saturating_sub(self.last_ratchet_at) >= time_bound
    }

    /// Caches a copy of `secret` for a message that has not arrived yet.
    pub fn store_skipped_key(&mut self, message_number: u64, secret: &MessageSecret) {
        self.store_skipped_key_at(message_number, secret, now_millis());
    }

    pub fn store_skipped_key_at(&mut self, message_number: u64, secret: &MessageSecret, now: u64) {
        self.skipped_keys.insert(message_number, secret.clone(), now);
    }

    /// Decrypts from the skipped-key cache, consuming the entry that worked.
    pub fn try_skipped_key(&mut self, envelope: &SignedEnvelope) -> Option<Vec<u8>> {
        let plaintext = self
            .skipped_keys
            .take(envelope.message_number(), envelope.cipher_data())?;

        trace!(
            target: "trident::session",
            ratchet_id = %self.ratchet_id,
            message_number = envelope.message_number(),
            "Decrypted message with skipped key"
        );
        Some(plaintext)
    }

    /// Evicts skipped keys by age, then by capacity. Returns the number evicted.
    pub fn prune_skipped_keys(&mut self) -> usize {
        self.prune_skipped_keys_at(now_millis())
    }

    pub fn prune_skipped_keys_at(&mut self, now: u64) -> usize {
        let evicted = self.skipped_keys.prune(
            now,
            self.config.skipped_key_max_age,
            self.config.max_stored_skipped_keys,
        );

        if evicted > 0 {
            warn!(
                target: "trident::session",
                ratchet_id = %self.ratchet_id,
                evicted,
                remaining = self.skipped_keys.len(),
                "Evicted skipped message keys"
            );
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymmetricChain;
    use proptest::prelude::*;

    const NOW: u64 = 1_700_000_000_000;
    const HOUR: u64 = 60 * 60 * 1000;

    struct Fixture {
        alice: IdentityKeys,
        bob: IdentityKeys,
        alice_session: RatchetSession,
        bob_session: RatchetSession,
    }

    /// Alice initiates with "init", Bob accepts and decrypts it, and learns
    /// the prekey id to address Alice with.
    fn create_fixture() -> Fixture {
        let alice = IdentityKeys::new().unwrap();
        let bob = IdentityKeys::new().unwrap();
        let alice_prekey = PrekeyBundle::new().unwrap();
        let bob_prekey = PrekeyBundle::new().unwrap();

        let (alice_session, envelope) = RatchetSession::initialize_as_initiator_at(
            &alice.public_key(),
            &bob.public_key(),
            &bob_prekey.public_part(),
            b"init",
            &alice,
            NOW,
        )
        .unwrap();

        let mut bob_session = RatchetSession::initialize_as_responder_at(
            &envelope,
            &bob.public_key(),
            &bob_prekey,
            &alice.public_key(),
            NOW,
        )
        .unwrap();
        assert_eq!(bob_session.decrypt_at(&envelope, NOW).unwrap(), b"init");
        bob_session.set_remote_key_id(alice_prekey.key_id());

        Fixture {
            alice,
            bob,
            alice_session,
            bob_session,
        }
    }

    fn send(session: &mut RatchetSession, identity: &IdentityKeys, text: &str) -> SignedEnvelope {
        session.encrypt(text.as_bytes(), identity, None).unwrap()
    }

    #[test]
    fn test_init_reply_triggers_dh_ratchet() {
        let mut f = create_fixture();
        let before = f.alice_session.root().remote_dh_public_key();

        let reply = send(&mut f.bob_session, &f.bob, "hello alice");
        assert!(reply.verify(&f.bob.node_id()).is_ok());
        assert_eq!(
            f.alice_session.decrypt_at(&reply, NOW).unwrap(),
            b"hello alice"
        );

        let after = f.alice_session.root().remote_dh_public_key();
        assert_ne!(after, before);
        assert_eq!(&after, reply.dh_public_key());
        assert_eq!(f.alice_session.previous_chain_length(), 1);
    }

    #[test]
    fn test_ratchet_id_is_shared() {
        let f = create_fixture();
        assert_eq!(f.alice_session.ratchet_id(), f.bob_session.ratchet_id());
    }

    #[test]
    fn test_responder_needs_remote_key_id() {
        let alice = IdentityKeys::new().unwrap();
        let bob = IdentityKeys::new().unwrap();
        let bob_prekey = PrekeyBundle::new().unwrap();

        let (_, envelope) = RatchetSession::initialize_as_initiator_at(
            &alice.public_key(),
            &bob.public_key(),
            &bob_prekey.public_part(),
            b"init",
            &alice,
            NOW,
        )
        .unwrap();
        let mut bob_session = RatchetSession::initialize_as_responder_at(
            &envelope,
            &bob.public_key(),
            &bob_prekey,
            &alice.public_key(),
            NOW,
        )
        .unwrap();

        assert_eq!(bob_session.remote_key_id(), None);
        assert_eq!(
            bob_session.encrypt(b"hi", &bob, None).err(),
            Some(Error::MissingRemoteKeyId)
        );
    }

    #[test]
    fn test_responder_rejects_bad_initiation() {
        let alice = IdentityKeys::new().unwrap();
        let bob = IdentityKeys::new().unwrap();
        let mallory = IdentityKeys::new().unwrap();
        let bob_prekey = PrekeyBundle::new().unwrap();
        let other_prekey = PrekeyBundle::new().unwrap();

        let (mut alice_session, envelope) = RatchetSession::initialize_as_initiator_at(
            &alice.public_key(),
            &bob.public_key(),
            &bob_prekey.public_part(),
            b"init",
            &alice,
            NOW,
        )
        .unwrap();

        let respond = |envelope: &SignedEnvelope, prekey: &PrekeyBundle, remote: &IdentityKeys| {
            RatchetSession::initialize_as_responder_at(
                envelope,
                &bob.public_key(),
                prekey,
                &remote.public_key(),
                NOW,
            )
            .err()
        };

        assert_eq!(
            respond(&envelope, &bob_prekey, &mallory),
            Some(Error::Authentication)
        );
        assert!(matches!(
            respond(&envelope, &other_prekey, &alice),
            Some(Error::Validation(_))
        ));

        let second = send(&mut alice_session, &alice, "no kem");
        assert!(matches!(
            respond(&second, &bob_prekey, &alice),
            Some(Error::Validation(_))
        ));
    }

    #[test]
    fn test_skip_boundary() {
        let mut f = create_fixture();
        // Bob's receiving chain sits at 1 after "init".
        for _ in 0..1000 {
            f.alice_session.root.sending_chain_mut().advance().unwrap();
        }
        let at_limit = send(&mut f.alice_session, &f.alice, "gap 1000");
        assert_eq!(at_limit.message_number(), 1001);
        assert_eq!(
            f.bob_session.decrypt_at(&at_limit, NOW).unwrap(),
            b"gap 1000"
        );
        assert_eq!(f.bob_session.skipped_key_count(), 1000);

        let mut f = create_fixture();
        for _ in 0..1001 {
            f.alice_session.root.sending_chain_mut().advance().unwrap();
        }
        let too_far = send(&mut f.alice_session, &f.alice, "gap 1001");
        assert_eq!(
            f.bob_session.decrypt_at(&too_far, NOW),
            Err(Error::SkipTooLarge {
                gap: 1001,
                max: 1000
            })
        );
        assert_eq!(f.bob_session.skipped_key_count(), 0);
        assert_eq!(f.bob_session.root().receiving_chain().message_number(), 1);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut f = create_fixture();
        let envelopes: Vec<_> = (0..5)
            .map(|i| send(&mut f.alice_session, &f.alice, &format!("message {}", i)))
            .collect();

        for i in [4, 0, 2, 1, 3] {
            let plaintext = f.bob_session.decrypt_at(&envelopes[i], NOW).unwrap();
            assert_eq!(plaintext, format!("message {}", i).as_bytes());
        }
        assert_eq!(f.bob_session.skipped_key_count(), 0);
    }

    #[test]
    fn test_replay_is_rejected() {
        let mut f = create_fixture();
        let envelope = send(&mut f.alice_session, &f.alice, "once");

        assert!(f.bob_session.decrypt_at(&envelope, NOW).is_ok());
        assert_eq!(
            f.bob_session.decrypt_at(&envelope, NOW),
            Err(Error::Decryption)
        );
        assert_eq!(f.bob_session.root().receiving_chain().message_number(), 2);
    }

    #[test]
    fn test_failed_decrypt_leaves_session_untouched() {
        let mut f = create_fixture();
        let envelopes: Vec<_> = (0..4)
            .map(|i| send(&mut f.alice_session, &f.alice, &format!("m{}", i)))
            .collect();

        let corrupted = envelopes[3].update(|fields| fields.cipher_data.data[0] ^= 0xff);
        assert_eq!(
            f.bob_session.decrypt_at(&corrupted, NOW),
            Err(Error::Decryption)
        );
        assert_eq!(f.bob_session.skipped_key_count(), 0);
        assert_eq!(f.bob_session.root().receiving_chain().message_number(), 1);

        for (i, envelope) in envelopes.iter().enumerate() {
            let plaintext = f.bob_session.decrypt_at(envelope, NOW).unwrap();
            assert_eq!(plaintext, format!("m{}", i).as_bytes());
        }
    }

    #[test]
    fn test_invalid_envelope_rejected_before_state_change() {
        let mut f = create_fixture();
        let envelope = send(&mut f.alice_session, &f.alice, "hi");
        let bad = envelope.update(|fields| fields.version = 2);

        assert!(matches!(
            f.bob_session.decrypt_at(&bad, NOW),
            Err(Error::Validation(_))
        ));
        assert_eq!(f.bob_session.decrypt_at(&envelope, NOW).unwrap(), b"hi");
    }

    #[test]
    fn test_backward_secrecy() {
        let mut f = create_fixture();
        let mut old_sending = f.alice_session.root().sending_chain().clone();

        let reply = send(&mut f.bob_session, &f.bob, "ratchet");
        f.alice_session.decrypt_at(&reply, NOW).unwrap();
        let envelope = send(&mut f.alice_session, &f.alice, "after ratchet");

        for _ in 0..4 {
            let secret = old_sending.secret().unwrap();
            assert_eq!(
                envelope.cipher_data().decrypt(&secret),
                Err(Error::Decryption)
            );
            old_sending.advance().unwrap();
        }
        assert_eq!(
            f.bob_session.decrypt_at(&envelope, NOW).unwrap(),
            b"after ratchet"
        );
    }

    #[test]
    fn test_late_message_from_previous_chain() {
        let mut f = create_fixture();
        let a1 = send(&mut f.alice_session, &f.alice, "a1");
        let a2 = send(&mut f.alice_session, &f.alice, "a2");
        f.bob_session.decrypt_at(&a1, NOW).unwrap();

        let b0 = send(&mut f.bob_session, &f.bob, "b0");
        f.alice_session.decrypt_at(&b0, NOW).unwrap();

        let a3 = send(&mut f.alice_session, &f.alice, "a3");
        assert_eq!(a3.previous_chain_length(), 3);
        assert_eq!(f.bob_session.decrypt_at(&a3, NOW).unwrap(), b"a3");
        assert_eq!(f.bob_session.skipped_key_count(), 1);

        assert_eq!(f.bob_session.decrypt_at(&a2, NOW).unwrap(), b"a2");
        assert_eq!(f.bob_session.skipped_key_count(), 0);
    }

    #[test]
    fn test_oversized_previous_chain_is_abandoned() {
        let mut f = create_fixture();
        // Lost on the way to Bob.
        for _ in 0..1001 {
            send(&mut f.alice_session, &f.alice, "lost");
        }

        let b0 = send(&mut f.bob_session, &f.bob, "b0");
        f.alice_session.decrypt_at(&b0, NOW).unwrap();

        let fresh = send(&mut f.alice_session, &f.alice, "fresh");
        assert_eq!(fresh.message_number(), 0);
        assert_eq!(fresh.previous_chain_length(), 1002);
        assert_eq!(f.bob_session.decrypt_at(&fresh, NOW).unwrap(), b"fresh");
        assert_eq!(f.bob_session.skipped_key_count(), 0);

        let fresh2 = send(&mut f.alice_session, &f.alice, "fresh2");
        assert_eq!(f.bob_session.decrypt_at(&fresh2, NOW).unwrap(), b"fresh2");
    }

    #[test]
    fn test_kem_ratchet() {
        let mut f = create_fixture();
        send(&mut f.alice_session, &f.alice, "before");
        let bob_next = PrekeyBundle::new().unwrap();

        let ciphertext = f
            .alice_session
            .perform_kem_ratchet_at(&bob_next.public_part(), NOW + HOUR)
            .unwrap();
        assert_eq!(f.alice_session.remote_key_id(), Some(bob_next.key_id()));
        assert_eq!(f.alice_session.last_ratchet_at(), NOW + HOUR);
        assert_eq!(f.alice_session.previous_chain_length(), 2);
        assert!(!f.alice_session.root().receiving_chain().is_initialized());

        let rotated = f
            .alice_session
            .encrypt(b"rotated", &f.alice, Some(&ciphertext))
            .unwrap();
        assert_eq!(rotated.key_id(), bob_next.key_id());
        assert_eq!(rotated.kem_ciphertext(), Some(&ciphertext));
        assert_eq!(rotated.message_number(), 0);
        assert_eq!(rotated.previous_chain_length(), 2);
        assert!(rotated.verify(&f.alice.node_id()).is_ok());
    }

    #[test]
    fn test_kem_ciphertext_mid_session_rejected() {
        let mut f = create_fixture();
        let bob_next = PrekeyBundle::new().unwrap();
        let ciphertext = f
            .alice_session
            .perform_kem_ratchet_at(&bob_next.public_part(), NOW)
            .unwrap();
        let rotated = f
            .alice_session
            .encrypt(b"rotated", &f.alice, Some(&ciphertext))
            .unwrap();

        let remote_before = f.bob_session.root().remote_dh_public_key();
        assert!(matches!(
            f.bob_session.decrypt_at(&rotated, NOW),
            Err(Error::Validation(_))
        ));
        assert_eq!(f.bob_session.root().remote_dh_public_key(), remote_before);
        assert_eq!(f.bob_session.root().receiving_chain().message_number(), 1);
    }

    #[test]
    fn test_kem_ratchet_ends_session_for_rotating_side() {
        let mut f = create_fixture();
        let bob_next = PrekeyBundle::new().unwrap();
        f.alice_session
            .perform_kem_ratchet_at(&bob_next.public_part(), NOW)
            .unwrap();

        let b0 = send(&mut f.bob_session, &f.bob, "b0");
        let b1 = send(&mut f.bob_session, &f.bob, "b1");
        assert_eq!(f.alice_session.decrypt_at(&b0, NOW), Err(Error::Decryption));
        assert_eq!(f.alice_session.decrypt_at(&b1, NOW), Err(Error::Decryption));
    }

    #[test]
    fn test_should_ratchet() {
        let mut f = create_fixture();
        let session = &f.alice_session;

        assert!(!session.should_ratchet_at(None, None, NOW));
        assert!(session.should_ratchet_at(Some(1), None, NOW));
        assert!(!session.should_ratchet_at(None, None, NOW + HOUR - 1));
        assert!(session.should_ratchet_at(None, None, NOW + HOUR));
        assert!(session.should_ratchet_at(None, Some(Duration::from_secs(1)), NOW + 1000));

        for _ in 0..99 {
            send(&mut f.alice_session, &f.alice, "x");
        }
        assert!(f.alice_session.should_ratchet_at(None, None, NOW));

        let reply = send(&mut f.bob_session, &f.bob, "reset");
        f.alice_session.decrypt_at(&reply, NOW + HOUR).unwrap();
        assert!(!f.alice_session.should_ratchet_at(None, None, NOW + HOUR));
    }

    #[test]
    fn test_prune_after_skip_respects_capacity() {
        let mut f = create_fixture();
        let config = SessionConfig {
            max_stored_skipped_keys: 5,
            ..SessionConfig::default()
        };
        f.bob_session = f.bob_session.clone().with_config(config);

        let envelopes: Vec<_> = (0..11)
            .map(|i| send(&mut f.alice_session, &f.alice, &format!("m{}", i)))
            .collect();
        f.bob_session.decrypt_at(&envelopes[10], NOW).unwrap();
        assert_eq!(f.bob_session.skipped_key_count(), 5);

        assert!(f.bob_session.decrypt_at(&envelopes[9], NOW).is_ok());
        assert_eq!(
            f.bob_session.decrypt_at(&envelopes[0], NOW),
            Err(Error::Decryption)
        );
    }

    #[test]
    fn test_store_and_prune_skipped_keys() {
        let mut f = create_fixture();
        let secret = SymmetricChain::derive_message_secret(&[1u8; 32]).unwrap();

        f.bob_session.store_skipped_key_at(1, &secret, NOW - 25 * HOUR);
        f.bob_session.store_skipped_key_at(2, &secret, NOW - HOUR);
        f.bob_session.store_skipped_key_at(3, &secret, NOW);

        assert_eq!(f.bob_session.prune_skipped_keys_at(NOW), 1);
        assert_eq!(f.bob_session.skipped_key_count(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..65536)) {
            let mut f = create_fixture();
            let envelope = f.alice_session.encrypt(&payload, &f.alice, None).unwrap();
            prop_assert_eq!(f.bob_session.decrypt_at(&envelope, NOW).unwrap(), payload);
        }

        #[test]
        fn prop_reordering(order in Just((0..16usize).collect::<Vec<_>>()).prop_shuffle()) {
            let mut f = create_fixture();
            let envelopes: Vec<_> = (0..16)
                .map(|i| send(&mut f.alice_session, &f.alice, &format!("m{}", i)))
                .collect();

            for i in order {
                let plaintext = f.bob_session.decrypt_at(&envelopes[i], NOW).unwrap();
                prop_assert_eq!(plaintext, format!("m{}", i).into_bytes());
            }
            prop_assert_eq!(f.bob_session.skipped_key_count(), 0);
        }
    }
}

#[cfg(test)]
mod integration_tests {
    use std::time::Duration;
    use trident::{
        ControlBody, ControlMessage, Error, IdentityKeys, PrekeyBundle, RatchetSession,
        SessionConfig, SignedEnvelope, WireMessage,
    };

    const NOW: u64 = 1_700_000_000_000;

    struct Peer {
        identity: IdentityKeys,
        prekey: PrekeyBundle,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                identity: IdentityKeys::new().unwrap(),
                prekey: PrekeyBundle::new().unwrap(),
            }
        }
    }

    /// Runs the initiation handshake and returns (alice, bob) sessions.
    fn establish(alice: &Peer, bob: &Peer) -> (RatchetSession, RatchetSession) {
        let (alice_session, init) = RatchetSession::initialize_as_initiator_at(
            &alice.identity.public_key(),
            &bob.identity.public_key(),
            &bob.prekey.public_part(),
            b"hello",
            &alice.identity,
            NOW,
        )
        .unwrap();

        let mut bob_session = RatchetSession::initialize_as_responder_at(
            &init,
            &bob.identity.public_key(),
            &bob.prekey,
            &alice.identity.public_key(),
            NOW,
        )
        .unwrap();
        assert_eq!(bob_session.decrypt_at(&init, NOW).unwrap(), b"hello");
        bob_session.set_remote_key_id(alice.prekey.key_id());

        (alice_session, bob_session)
    }

    fn receive(
        session: &mut RatchetSession,
        sender: &IdentityKeys,
        envelope: &SignedEnvelope,
    ) -> Vec<u8> {
        let envelope = SignedEnvelope::from_bytes(&envelope.to_bytes()).unwrap();
        envelope.verify(&sender.node_id()).unwrap();
        session.decrypt_at(&envelope, NOW).unwrap()
    }

    #[test]
    fn test_full_protocol_flow() {
        println!("Step 1: Creating identities and prekeys for Alice and Bob...");
        let alice = Peer::new();
        let bob = Peer::new();

        println!("Step 2: Bob publishes his prekey bundle...");
        let published = bob.prekey.public_part().to_bytes();
        let bob_bundle = trident::PrekeyBundlePublic::from_bytes(&published).unwrap();
        assert_eq!(bob_bundle.key_id, bob.prekey.key_id());

        println!("Step 3: Alice initiates a session to Bob...");
        let (mut alice_session, init) = RatchetSession::initialize_as_initiator_at(
            &alice.identity.public_key(),
            &bob.identity.public_key(),
            &bob_bundle,
            b"Hey Bob, this is a secure message!",
            &alice.identity,
            NOW,
        )
        .unwrap();
        assert!(init.kem_ciphertext().is_some());

        println!("Step 4: Bob accepts the initiation envelope...");
        let init = SignedEnvelope::from_bytes(&init.to_bytes()).unwrap();
        let mut bob_session = RatchetSession::initialize_as_responder_at(
            &init,
            &bob.identity.public_key(),
            &bob.prekey,
            &alice.identity.public_key(),
            NOW,
        )
        .unwrap();
        assert_eq!(
            bob_session.decrypt_at(&init, NOW).unwrap(),
            b"Hey Bob, this is a secure message!"
        );
        assert_eq!(alice_session.ratchet_id(), bob_session.ratchet_id());

        println!("Step 5: Bob replies to Alice...");
        bob_session.set_remote_key_id(alice.prekey.key_id());
        let reply = bob_session
            .encrypt(b"Hi Alice! I received your message.", &bob.identity, None)
            .unwrap();
        assert_eq!(
            receive(&mut alice_session, &bob.identity, &reply),
            b"Hi Alice! I received your message."
        );

        println!("Step 6: Exchanging several rounds...");
        for round in 0..5 {
            let text = format!("alice round {}", round);
            let envelope = alice_session
                .encrypt(text.as_bytes(), &alice.identity, None)
                .unwrap();
            assert_eq!(
                receive(&mut bob_session, &alice.identity, &envelope),
                text.as_bytes()
            );

            let text = format!("bob round {}", round);
            let envelope = bob_session
                .encrypt(text.as_bytes(), &bob.identity, None)
                .unwrap();
            assert_eq!(
                receive(&mut alice_session, &bob.identity, &envelope),
                text.as_bytes()
            );
        }

        println!("Step 7: Rejecting an envelope from the wrong identity...");
        let mallory = IdentityKeys::new().unwrap();
        let forged = bob_session.encrypt(b"forged", &mallory, None).unwrap();
        assert_eq!(
            forged.verify(&bob.identity.node_id()),
            Err(Error::Authentication)
        );

        println!("Step 8: Rejecting a replayed envelope...");
        let envelope = alice_session.encrypt(b"once", &alice.identity, None).unwrap();
        assert_eq!(receive(&mut bob_session, &alice.identity, &envelope), b"once");
        assert!(bob_session.decrypt_at(&envelope, NOW).is_err());
    }

    #[test]
    fn test_session_persistence() {
        let alice = Peer::new();
        let bob = Peer::new();

        println!("Step 1: Establishing the session...");
        let (mut alice_session, mut bob_session) = establish(&alice, &bob);

        println!("Step 2: Leaving a gap on Bob's side...");
        let delayed = alice_session.encrypt(b"delayed", &alice.identity, None).unwrap();
        let next = alice_session.encrypt(b"next", &alice.identity, None).unwrap();
        assert_eq!(receive(&mut bob_session, &alice.identity, &next), b"next");
        assert_eq!(bob_session.skipped_key_count(), 1);

        println!("Step 3: Serializing and restoring both sides...");
        let mut alice_restored = RatchetSession::from_bytes(&alice_session.to_bytes()).unwrap();
        let mut bob_restored = RatchetSession::from_bytes(&bob_session.to_bytes()).unwrap();
        assert_eq!(bob_restored.skipped_key_count(), 1);
        assert_eq!(bob_restored.remote_key_id(), Some(alice.prekey.key_id()));

        println!("Step 4: Delivering the delayed message after restore...");
        assert_eq!(
            receive(&mut bob_restored, &alice.identity, &delayed),
            b"delayed"
        );

        println!("Step 5: Continuing the conversation...");
        let reply = bob_restored.encrypt(b"restored", &bob.identity, None).unwrap();
        assert_eq!(
            receive(&mut alice_restored, &bob.identity, &reply),
            b"restored"
        );

        println!("Step 6: Restoring identities and prekeys from their bytes...");
        let identity = IdentityKeys::from_bytes(alice.identity.to_bytes()).unwrap();
        assert_eq!(identity.public_key(), alice.identity.public_key());
        let prekey = PrekeyBundle::from_bytes(bob.prekey.to_bytes().as_slice()).unwrap();
        assert_eq!(prekey.public_part(), bob.prekey.public_part());
    }

    #[test]
    fn test_out_of_order_delivery() {
        let alice = Peer::new();
        let bob = Peer::new();
        let (mut alice_session, mut bob_session) = establish(&alice, &bob);

        println!("Step 1: Alice sends a batch of messages...");
        let envelopes: Vec<SignedEnvelope> = (0..6)
            .map(|i| {
                alice_session
                    .encrypt(format!("message {}", i).as_bytes(), &alice.identity, None)
                    .unwrap()
            })
            .collect();

        println!("Step 2: Bob receives them shuffled...");
        for i in [4, 0, 5, 2, 1, 3] {
            assert_eq!(
                receive(&mut bob_session, &alice.identity, &envelopes[i]),
                format!("message {}", i).as_bytes()
            );
        }
        assert_eq!(bob_session.skipped_key_count(), 0);

        println!("Step 3: A message from before Bob's reply arrives late...");
        let late = alice_session.encrypt(b"late", &alice.identity, None).unwrap();
        let reply = bob_session.encrypt(b"reply", &bob.identity, None).unwrap();
        assert_eq!(receive(&mut alice_session, &bob.identity, &reply), b"reply");
        let fresh = alice_session.encrypt(b"fresh", &alice.identity, None).unwrap();
        assert_eq!(receive(&mut bob_session, &alice.identity, &fresh), b"fresh");
        assert_eq!(receive(&mut bob_session, &alice.identity, &late), b"late");
    }

    #[test]
    fn test_skip_limits() {
        let alice = Peer::new();
        let bob = Peer::new();
        let (mut alice_session, bob_session) = establish(&alice, &bob);
        let config = SessionConfig {
            max_message_skip: 3,
            ..SessionConfig::default()
        };
        let mut bob_session = bob_session.with_config(config);

        println!("Step 1: Skipping past the configured limit is refused...");
        let envelopes: Vec<SignedEnvelope> = (0..5)
            .map(|_| alice_session.encrypt(b"x", &alice.identity, None).unwrap())
            .collect();
        assert_eq!(
            bob_session.decrypt_at(&envelopes[4], NOW),
            Err(Error::SkipTooLarge { gap: 4, max: 3 })
        );
        assert_eq!(bob_session.skipped_key_count(), 0);

        println!("Step 2: A gap within the limit is accepted...");
        assert_eq!(bob_session.decrypt_at(&envelopes[3], NOW).unwrap(), b"x");
        assert_eq!(bob_session.skipped_key_count(), 3);

        println!("Step 3: Skipped keys expire...");
        let day = 24 * 60 * 60 * 1000;
        assert_eq!(bob_session.prune_skipped_keys_at(NOW + day + 1), 3);
        assert!(bob_session.decrypt_at(&envelopes[0], NOW + day + 1).is_err());
    }

    #[test]
    fn test_rotation_bounds_and_kem_ratchet() {
        let alice = Peer::new();
        let bob = Peer::new();
        let (mut alice_session, mut bob_session) = establish(&alice, &bob);

        println!("Step 1: Checking rotation bounds...");
        assert!(!alice_session.should_ratchet_at(None, None, NOW));
        let minute = Some(Duration::from_secs(60));
        assert!(alice_session.should_ratchet_at(None, minute, NOW + 60_000));

        println!("Step 2: Alice rotates onto Bob's next prekey...");
        let bob_next = PrekeyBundle::new().unwrap();
        let ciphertext = alice_session
            .perform_kem_ratchet_at(&bob_next.public_part(), NOW + 60_000)
            .unwrap();
        assert!(!alice_session.should_ratchet_at(None, minute, NOW + 60_000));

        let rotated = alice_session
            .encrypt(b"rotated", &alice.identity, Some(&ciphertext))
            .unwrap();
        assert_eq!(rotated.key_id(), bob_next.key_id());
        assert_eq!(rotated.kem_ciphertext(), Some(&ciphertext));

        println!("Step 3: Bob refuses a KEM envelope outside initiation...");
        let before = bob_session.to_bytes();
        assert!(matches!(
            bob_session.decrypt_at(&rotated, NOW),
            Err(Error::Validation(_))
        ));
        assert_eq!(bob_session.to_bytes(), before);
    }

    #[test]
    fn test_wire_framing() {
        let alice = Peer::new();
        let bob = Peer::new();

        println!("Step 1: Alice asks Bob for a prekey bundle...");
        let request = ControlMessage::create(
            ControlBody::GetPrekeyBundle {
                transaction_id: [7; trident::TRANSACTION_ID_LENGTH],
            },
            &alice.identity,
        )
        .unwrap();
        let frame = WireMessage::Control(request).to_bytes();
        assert_eq!(&frame[..4], &trident::MAGIC_BYTES);

        println!("Step 2: Bob answers with his bundle...");
        let transaction_id = match WireMessage::from_bytes(&frame).unwrap() {
            WireMessage::Control(request) => {
                request.verify(&alice.identity.node_id()).unwrap();
                *request.body().transaction_id()
            }
            WireMessage::Data(_) => [0; trident::TRANSACTION_ID_LENGTH],
        };
        assert_eq!(transaction_id, [7; trident::TRANSACTION_ID_LENGTH]);

        let response = ControlMessage::create(
            ControlBody::PrekeyBundle {
                transaction_id,
                bundle: bob.prekey.public_part(),
            },
            &bob.identity,
        )
        .unwrap();
        let frame = WireMessage::Control(response).to_bytes();

        println!("Step 3: Alice initiates with the received bundle...");
        let bundle = match WireMessage::from_bytes(&frame).unwrap() {
            WireMessage::Control(response) => {
                response.verify(&bob.identity.node_id()).unwrap();
                match response.body() {
                    ControlBody::PrekeyBundle { bundle, .. } => Some(bundle.clone()),
                    ControlBody::GetPrekeyBundle { .. } => None,
                }
            }
            WireMessage::Data(_) => None,
        }
        .unwrap();

        let (_, init) = RatchetSession::initialize_as_initiator_at(
            &alice.identity.public_key(),
            &bob.identity.public_key(),
            &bundle,
            b"framed",
            &alice.identity,
            NOW,
        )
        .unwrap();
        let frame = WireMessage::Data(init).to_bytes();

        println!("Step 4: Bob unwraps the data frame...");
        let init = match WireMessage::from_bytes(&frame).unwrap() {
            WireMessage::Data(envelope) => Some(envelope),
            WireMessage::Control(_) => None,
        }
        .unwrap();
        let mut bob_session = RatchetSession::initialize_as_responder_at(
            &init,
            &bob.identity.public_key(),
            &bob.prekey,
            &alice.identity.public_key(),
            NOW,
        )
        .unwrap();
        assert_eq!(bob_session.decrypt_at(&init, NOW).unwrap(), b"framed");
    }
}

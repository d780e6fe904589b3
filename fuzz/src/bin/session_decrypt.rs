#[macro_use]
extern crate afl;
use trident::{IdentityKeys, PrekeyBundle, RatchetSession, SignedEnvelope};

fn get_session() -> RatchetSession {
    // The Victim
    let alice = IdentityKeys::new().expect("Setup failed");

    // The Attacker context
    let bob = IdentityKeys::new().expect("Setup failed");
    let bob_prekey = PrekeyBundle::new().expect("Setup failed");

    let (session, _) = RatchetSession::initialize_as_initiator(
        &alice.public_key(),
        &bob.public_key(),
        &bob_prekey.public_part(),
        b"fuzz-context",
        &alice,
    )
    .expect("Setup failed");
    session
}

fn main() {
    let session = get_session();

    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = SignedEnvelope::from_bytes(data) {
            let mut session = session.clone();
            let _ = session.decrypt(&envelope);
        }
    });
}

#[macro_use]
extern crate afl;
use trident::SignedEnvelope;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = SignedEnvelope::from_bytes(data) {
            let _ = envelope.validate();
            let _ = envelope.signer();
        }
    });
}

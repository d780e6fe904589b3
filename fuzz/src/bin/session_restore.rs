#[macro_use]
extern crate afl;
use trident::RatchetSession;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(session) = RatchetSession::from_bytes(data) {
            let _ = session.to_bytes();
        }
    });
}

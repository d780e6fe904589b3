#[macro_use]
extern crate afl;
use trident::{PrekeyBundlePublic, WireMessage};

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = WireMessage::from_bytes(data);
        let _ = PrekeyBundlePublic::from_bytes(data);
    });
}

#[macro_use]
extern crate afl;
use rendezchat::{DhBox, Identity, SessionKey};

fn main() {
    // The attacker knows neither key.
    let session_key = SessionKey::from_slice(&[7u8; 32]).expect("Setup failed");
    let server = Identity::from_bytes("server", [1u8; 32], [2u8; 32]).expect("Setup failed");
    let alice = Identity::from_bytes("alice", [3u8; 32], [4u8; 32]).expect("Setup failed");
    let dh_box = DhBox::new(&alice, &server.public_info(), b"fuzz-context").expect("Setup failed");

    fuzz!(|data: &[u8]| {
        let _ = session_key.open(data);
        let _ = dh_box.open(data);
    });
}

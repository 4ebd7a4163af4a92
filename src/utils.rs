use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};

pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-5AB53DC52D51";

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub(crate) fn generate_websocket_key() -> String {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let random_bytes: [u8; 16] = rng.random();
    BASE64_STANDARD.encode(random_bytes)
}

// The accept key is attacker-influenced on a hostile network, so the
// comparison must not leak a byte index through timing.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

//! Byte-wise key-stream cipher used for string constants.
//!
//! The stream is the top byte of a 64-bit LCG state advanced once per byte and
//! seeded with the key. XOR with the stream is its own inverse. The IR decrypt
//! routine emitted by the string pass computes the same stream.

pub const LCG_MULTIPLIER: u64 = 6_364_136_223_846_793_005;
pub const LCG_INCREMENT: u64 = 1_442_695_040_888_963_407;

#[derive(Debug, Clone)]
pub struct KeyStream {
    state: u64,
}

impl KeyStream {
    pub fn new(key: u64) -> Self {
        Self { state: key }
    }
}

impl Iterator for KeyStream {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        Some((self.state >> 56) as u8)
    }
}

/// XOR `bytes` with the key stream for `key`.
pub fn apply_keystream(bytes: &[u8], key: u64) -> Vec<u8> {
    bytes.iter().zip(KeyStream::new(key)).map(|(b, k)| b ^ k).collect()
}

pub fn encrypt(plaintext: &[u8], key: u64) -> Vec<u8> {
    apply_keystream(plaintext, key)
}

pub fn decrypt(ciphertext: &[u8], key: u64) -> Vec<u8> {
    apply_keystream(ciphertext, key)
}

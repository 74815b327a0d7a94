//! Cryptographic primitives for KNXnet/IP secure sessions (`spec.md` §4.1).
//!
//! Pure functions / small value types only — no socket or session state
//! lives here. X25519 key agreement, SHA-256-derived session keys, AES-CBC-MAC
//! authentication, and AES-CTR encryption, matching the bit-exact layouts the
//! wire format demands.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// A 16-byte AES-128 key used as either a user key, a device authentication
/// key, or a derived session key. Zeroized on drop.
pub type Key16 = Zeroizing<[u8; 16]>;

/// Counter value used for the MAC-confidentiality encryption variant
/// (`spec.md` §4.1 "MAC confidentiality"). Occupies the 6-byte sequence-number
/// field of the security-info block, zero-extended.
const MAC_COUNTER: u64 = 0xff00;

/// One side of an X25519 key agreement. Single-use: `diffie_hellman` consumes it.
pub struct KeyAgreement {
    secret: x25519_dalek::EphemeralSecret,
    public: x25519_dalek::PublicKey,
}

impl KeyAgreement {
    /// Generates a fresh X25519 keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: R) -> Self {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(rng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key in its native encoding, sent on the wire as-is
    /// (`spec.md` §4.1: "transmit the public key in little-endian byte order").
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Completes the agreement against the peer's public key and derives the
    /// 16-byte session key: the first 16 bytes of SHA-256 over the shared
    /// secret (`spec.md` §4.1, literal derivation).
    pub fn derive_session_key(self, peer_public: &[u8; 32]) -> Key16 {
        let peer = x25519_dalek::PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        let digest = Sha256::digest(shared.as_bytes());
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        Zeroizing::new(key)
    }
}

/// AES-128 CBC-MAC over zero-padded input, IV = zeros (`spec.md` §4.1).
/// The MAC is the last 16-byte ciphertext block.
pub fn cbc_mac(key: &Key16, data: &[u8]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_ref()));
    let mut state = [0u8; 16];
    for chunk in padded_blocks(data) {
        for i in 0..16 {
            state[i] ^= chunk[i];
        }
        let mut block = GenericArray::clone_from_slice(&state);
        cipher.encrypt_block(&mut block);
        state.copy_from_slice(block.as_slice());
    }
    state
}

/// Splits `data` into 16-byte blocks, zero-padding the final partial block.
/// Data whose length is already a multiple of 16 is not padded further.
fn padded_blocks(data: &[u8]) -> Vec<[u8; 16]> {
    let mut blocks = Vec::with_capacity(data.len() / 16 + 1);
    let mut offset = 0;
    while offset < data.len() {
        let mut block = [0u8; 16];
        let take = std::cmp::min(16, data.len() - offset);
        block[..take].copy_from_slice(&data[offset..offset + take]);
        blocks.push(block);
        offset += take;
    }
    if blocks.is_empty() {
        blocks.push([0u8; 16]);
    }
    blocks
}

/// Builds the 16-byte "security info" CTR counter block (`spec.md` §4.1):
/// `[6B seq BE][6B serial][2B tag][2B frame length]`.
pub fn security_info(seq_field: u64, serial: &[u8; 6], tag: u16, frame_len: u16) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..6].copy_from_slice(&seq_field.to_be_bytes()[2..8]);
    block[6..12].copy_from_slice(serial);
    block[12..14].copy_from_slice(&tag.to_be_bytes());
    block[14..16].copy_from_slice(&frame_len.to_be_bytes());
    block
}

/// The security-info block used to encrypt/decrypt the MAC itself, per
/// `spec.md` §4.1 "MAC confidentiality": the usual 6-byte sequence-number
/// field is replaced by the fixed value `0xff00`.
pub fn mac_security_info(serial: &[u8; 6], tag: u16, frame_len: u16) -> [u8; 16] {
    security_info(MAC_COUNTER, serial, tag, frame_len)
}

/// AES-CTR encrypt/decrypt in place. Identical operation both directions.
/// `info_block` seeds the counter; it increments by one (as a 128-bit
/// big-endian integer) per 16-byte keystream block.
pub fn ctr_xor(key: &Key16, info_block: [u8; 16], data: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_ref()));
    let mut counter = u128::from_be_bytes(info_block);
    for chunk in data.chunks_mut(16) {
        let mut block = GenericArray::clone_from_slice(&counter.to_be_bytes());
        cipher.encrypt_block(&mut block);
        for (b, k) in chunk.iter_mut().zip(block.iter()) {
            *b ^= k;
        }
        counter = counter.wrapping_add(1);
    }
}

/// Constant-time equality check for MAC comparison (`spec.md` §4.3 step 3).
pub fn mac_eq(a: &[u8; 16], b: &[u8; 16]) -> bool {
    bool::from(a.ct_eq(b))
}

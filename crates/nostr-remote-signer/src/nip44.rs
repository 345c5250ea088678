//! NIP-44 v2 payload encryption.
//!
//! Payload layout: `version(1) || nonce(32) || ciphertext || mac(32)`, base64 encoded.
//! The MAC is HMAC-SHA256 over `nonce || ciphertext` and is checked before any
//! plaintext is handed back.

use crate::backend::{CryptoBackend, DefaultBackend};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nostr::{PublicKey, SecretKey};
use std::sync::OnceLock;

pub const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";
const NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;
const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;
/// version + nonce + (length prefix + 32 padded bytes) + mac
const MIN_PAYLOAD_LEN: usize = 1 + NONCE_LEN + 2 + 32 + MAC_LEN;
const MAX_PAYLOAD_LEN: usize = 1 + NONCE_LEN + 2 + MAX_PLAINTEXT_LEN + 1 + MAC_LEN;

fn default_backend() -> &'static DefaultBackend {
    static BACKEND: OnceLock<DefaultBackend> = OnceLock::new();
    BACKEND.get_or_init(DefaultBackend::new)
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn derive(local_secret: &SecretKey, remote_public: &PublicKey) -> Result<Self> {
        Self::derive_with(
            default_backend(),
            &local_secret.to_secret_bytes(),
            &remote_public.to_bytes(),
        )
    }

    /// ECDH against the x-only remote key, trying the even point first and the
    /// odd point second, followed by HKDF-Extract with the `nip44-v2` salt.
    pub fn derive_with(
        backend: &dyn CryptoBackend,
        local_secret: &[u8; 32],
        remote_xonly: &[u8; 32],
    ) -> Result<Self> {
        for prefix in [0x02u8, 0x03u8] {
            let mut point = [prefix; 33];
            point[1..].copy_from_slice(remote_xonly);
            if let Ok(shared_x) = backend.ecdh(local_secret, &point) {
                return Ok(Self(backend.hkdf_extract(SALT, &shared_x)));
            }
        }
        Err(Error::InvalidKey)
    }
}

/// Per-message keys. Derived from a fresh nonce on every call and dropped after use.
struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    fn derive(
        backend: &dyn CryptoBackend,
        conversation_key: &ConversationKey,
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Self> {
        let mut okm = [0u8; 76];
        backend.hkdf_expand(conversation_key.as_bytes(), nonce, &mut okm)?;

        let mut chacha_key = [0u8; 32];
        let mut chacha_nonce = [0u8; 12];
        let mut hmac_key = [0u8; 32];
        chacha_key.copy_from_slice(&okm[0..32]);
        chacha_nonce.copy_from_slice(&okm[32..44]);
        hmac_key.copy_from_slice(&okm[44..76]);

        Ok(Self {
            chacha_key,
            chacha_nonce,
            hmac_key,
        })
    }
}

pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = std::cmp::max(32, next_power / 8);
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Error::InvalidLength(len));
    }
    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 2 {
        return Err(Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN || len > padded.len() - 2 {
        return Err(Error::InvalidPadding);
    }
    if padded.len() != 2 + calc_padded_len(len) {
        return Err(Error::InvalidPadding);
    }
    Ok(padded[2..2 + len].to_vec())
}

pub fn encrypt(plaintext: &str, conversation_key: &ConversationKey) -> Result<String> {
    encrypt_with(default_backend(), plaintext.as_bytes(), conversation_key)
}

pub fn decrypt(payload: &str, conversation_key: &ConversationKey) -> Result<String> {
    let bytes = decrypt_with(default_backend(), payload, conversation_key)?;
    String::from_utf8(bytes).map_err(|_| Error::Protocol("plaintext is not UTF-8".to_string()))
}

pub fn encrypt_with(
    backend: &dyn CryptoBackend,
    plaintext: &[u8],
    conversation_key: &ConversationKey,
) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    backend.fill_random(&mut nonce);
    encrypt_with_nonce(backend, plaintext, conversation_key, &nonce)
}

/// Deterministic variant of [`encrypt_with`]. The nonce must never be reused
/// with the same conversation key.
pub fn encrypt_with_nonce(
    backend: &dyn CryptoBackend,
    plaintext: &[u8],
    conversation_key: &ConversationKey,
    nonce: &[u8; NONCE_LEN],
) -> Result<String> {
    let keys = MessageKeys::derive(backend, conversation_key, nonce)?;
    let mut buffer = pad(plaintext)?;
    backend.chacha20(&keys.chacha_key, &keys.chacha_nonce, &mut buffer);
    let mac = backend.hmac_sha256(&keys.hmac_key, &[&nonce[..], &buffer[..]])?;

    let mut payload = Vec::with_capacity(1 + NONCE_LEN + buffer.len() + MAC_LEN);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&mac);
    Ok(BASE64.encode(payload))
}

pub fn decrypt_with(
    backend: &dyn CryptoBackend,
    payload: &str,
    conversation_key: &ConversationKey,
) -> Result<Vec<u8>> {
    let data = BASE64.decode(payload)?;
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(Error::TooShort(data.len()));
    }
    if data.len() > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidLength(data.len()));
    }
    if data[0] != VERSION {
        return Err(Error::UnsupportedVersion(data[0]));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[1..1 + NONCE_LEN]);
    let ciphertext = &data[1 + NONCE_LEN..data.len() - MAC_LEN];
    let mac = &data[data.len() - MAC_LEN..];

    let keys = MessageKeys::derive(backend, conversation_key, &nonce)?;
    if !backend.verify_hmac_sha256(&keys.hmac_key, &[&nonce[..], ciphertext], mac)? {
        return Err(Error::InvalidMac);
    }

    let mut padded = ciphertext.to_vec();
    backend.chacha20(&keys.chacha_key, &keys.chacha_nonce, &mut padded);
    unpad(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    fn key_pair() -> (Keys, Keys, ConversationKey) {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = ConversationKey::derive(alice.secret_key(), &bob.public_key()).unwrap();
        (alice, bob, key)
    }

    #[test]
    fn padded_lengths_match_reference_table() {
        let table = [
            (1, 32),
            (16, 32),
            (32, 32),
            (33, 64),
            (37, 64),
            (64, 64),
            (65, 96),
            (100, 128),
            (111, 128),
            (200, 224),
            (250, 256),
            (256, 256),
            (257, 320),
            (320, 320),
            (383, 384),
            (384, 384),
            (400, 448),
            (500, 512),
            (512, 512),
            (515, 640),
            (700, 768),
            (800, 896),
            (900, 1024),
            (1020, 1024),
            (65535, 65536),
        ];
        for (input, expected) in table {
            assert_eq!(calc_padded_len(input), expected, "input {}", input);
        }
    }

    #[test]
    fn padded_len_is_monotonic_and_covers_input() {
        let mut previous = 0;
        for len in 1..=MAX_PLAINTEXT_LEN {
            let padded = calc_padded_len(len);
            assert!(padded >= previous);
            assert!(padded >= std::cmp::max(32, len));
            previous = padded;
        }
    }

    #[test]
    fn conversation_key_matches_reference_vector() {
        let sec1 = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let sec2 = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000002",
        )
        .unwrap();
        let pub2 = Keys::new(sec2).public_key();
        let key = ConversationKey::derive(&sec1, &pub2).unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "c41c775356fd92eadc63ff5a0dc1da211b268cbea22316767095b2871ea1412d"
        );
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let (alice, bob, key) = key_pair();
        let reverse = ConversationKey::derive(bob.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(key, reverse);
    }

    #[test]
    fn derive_fails_when_x_is_not_a_field_element() {
        let alice = Keys::generate();
        // larger than the field prime, so neither parity decodes
        let x = [0xffu8; 32];
        let result = ConversationKey::derive_with(
            default_backend(),
            &alice.secret_key().to_secret_bytes(),
            &x,
        );
        assert!(matches!(result, Err(Error::InvalidKey)));
    }

    #[test]
    fn hello_encrypts_to_distinct_payloads() {
        let (_, _, key) = key_pair();
        let first = encrypt("hello", &key).unwrap();
        let second = encrypt("hello", &key).unwrap();
        assert_ne!(first, second);
        assert_eq!(decrypt(&first, &key).unwrap(), "hello");
        assert_eq!(decrypt(&second, &key).unwrap(), "hello");
    }

    #[test]
    fn round_trip_at_length_boundaries() {
        let (_, _, key) = key_pair();
        for len in [1usize, 31, 32, 33, 255, 256, 257, 1000, 65535] {
            let plaintext = vec![b'x'; len];
            let payload = encrypt_with(default_backend(), &plaintext, &key).unwrap();
            let decoded = decrypt_with(default_backend(), &payload, &key).unwrap();
            assert_eq!(decoded, plaintext, "length {}", len);
        }
    }

    #[test]
    fn rejects_empty_and_oversized_plaintext() {
        let (_, _, key) = key_pair();
        assert!(matches!(encrypt("", &key), Err(Error::InvalidLength(0))));
        let big = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            encrypt_with(default_backend(), &big, &key),
            Err(Error::InvalidLength(_))
        ));
    }

    #[test]
    fn any_flipped_bit_after_version_fails_mac() {
        let (_, _, key) = key_pair();
        let payload = encrypt("tamper me", &key).unwrap();
        let raw = BASE64.decode(&payload).unwrap();
        for index in 1..raw.len() {
            let mut tampered = raw.clone();
            tampered[index] ^= 0x01;
            let result = decrypt(&BASE64.encode(&tampered), &key);
            assert!(
                matches!(result, Err(Error::InvalidMac)),
                "byte {} gave {:?}",
                index,
                result
            );
        }
    }

    #[test]
    fn wrong_conversation_key_fails_mac() {
        let (_, _, key) = key_pair();
        let (_, _, other) = key_pair();
        let payload = encrypt("secret", &key).unwrap();
        assert!(matches!(decrypt(&payload, &other), Err(Error::InvalidMac)));
    }

    #[test]
    fn version_gate_precedes_crypto() {
        let (_, _, key) = key_pair();
        let payload = encrypt("versioned", &key).unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        for version in [0u8, 1, 3, 0xff] {
            raw[0] = version;
            let result = decrypt(&BASE64.encode(&raw), &key);
            assert!(matches!(result, Err(Error::UnsupportedVersion(v)) if v == version));
        }
    }

    #[test]
    fn short_and_malformed_payloads_are_decode_errors() {
        let (_, _, key) = key_pair();
        let short = BASE64.encode([2u8; MIN_PAYLOAD_LEN - 1]);
        assert!(matches!(decrypt(&short, &key), Err(Error::TooShort(98))));
        assert!(matches!(decrypt("not base64 !!", &key), Err(Error::Base64(_))));
    }

    #[test]
    fn deterministic_nonce_gives_deterministic_payload() {
        let (_, _, key) = key_pair();
        let nonce = [1u8; 32];
        let a = encrypt_with_nonce(default_backend(), b"same", &key, &nonce).unwrap();
        let b = encrypt_with_nonce(default_backend(), b"same", &key, &nonce).unwrap();
        assert_eq!(a, b);
        assert!(!a.contains('\n'));
    }

    #[test]
    fn unpad_rejects_inconsistent_prefix() {
        let mut padded = pad(b"abc").unwrap();
        padded[0] = 0xff;
        assert!(matches!(unpad(&padded), Err(Error::InvalidPadding)));

        let mut zero = pad(b"abc").unwrap();
        zero[0] = 0;
        zero[1] = 0;
        assert!(matches!(unpad(&zero), Err(Error::InvalidPadding)));
    }
}

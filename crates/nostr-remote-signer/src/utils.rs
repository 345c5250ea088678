use crate::backend::CryptoBackend;
use crate::{Error, Result};
use nostr::secp256k1::schnorr::Signature;
use nostr::{Event, PublicKey, UnsignedEvent};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidKey);
    }
    PublicKey::from_slice(&bytes).map_err(|_| Error::InvalidKey)
}

/// Random 16-byte correlation id, hex encoded.
pub fn random_request_id(backend: &dyn CryptoBackend) -> String {
    let mut id = [0u8; 16];
    backend.fill_random(&mut id);
    hex::encode(id)
}

/// NIP-01 event id preimage hash.
pub fn event_hash(
    backend: &dyn CryptoBackend,
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let preimage = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    backend.sha256(preimage.to_string().as_bytes())
}

pub fn sign_event_with(
    backend: &dyn CryptoBackend,
    mut unsigned: UnsignedEvent,
    secret_key: &[u8; 32],
) -> Result<Event> {
    unsigned.ensure_id();
    let id = unsigned
        .id
        .ok_or_else(|| Error::Protocol("event id missing".to_string()))?;
    let sig = backend.schnorr_sign(secret_key, id.as_bytes())?;
    let sig = Signature::from_slice(&sig).map_err(|_| Error::InvalidKey)?;
    unsigned
        .add_signature(sig)
        .map_err(|e| Error::Protocol(e.to_string()))
}

/// Recomputes the id of `event` and checks its Schnorr signature.
pub fn verify_event_with(backend: &dyn CryptoBackend, event: &Event) -> bool {
    let tags: Vec<Vec<String>> = event.tags.iter().map(|t| t.as_slice().to_vec()).collect();
    let hash = event_hash(
        backend,
        &event.pubkey,
        event.created_at.as_u64(),
        event.kind.as_u16(),
        &tags,
        &event.content,
    );
    if &hash != event.id.as_bytes() {
        return false;
    }
    backend.schnorr_verify(&event.pubkey.to_bytes(), &hash, &event.sig.serialize())
}

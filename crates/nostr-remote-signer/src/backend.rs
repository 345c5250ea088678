//! Primitive operations the protocol code is written against.
//!
//! The NIP-44 codec and the NIP-46 engine only talk to [`CryptoBackend`], so a
//! target that needs a different implementation of the primitives (a hardware
//! module, a platform crypto library) swaps the backend and nothing else.

use crate::{Error, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use nostr::secp256k1::{self, ecdh, schnorr, All, Keypair, Message, Secp256k1, XOnlyPublicKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub trait CryptoBackend: Send + Sync {
    /// x-coordinate of `secret * point`, where `point` is a 33-byte compressed key.
    fn ecdh(&self, secret_key: &[u8; 32], compressed_point: &[u8; 33]) -> Result<[u8; 32]>;

    fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> [u8; 32];

    fn hkdf_expand(&self, prk: &[u8; 32], info: &[u8], out: &mut [u8]) -> Result<()>;

    fn hmac_sha256(&self, key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]>;

    /// Constant-time comparison of `tag` against the HMAC of `parts`.
    fn verify_hmac_sha256(&self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<bool>;

    /// Applies the IETF ChaCha20 keystream in place (encrypt and decrypt are identical).
    fn chacha20(&self, key: &[u8; 32], nonce: &[u8; 12], data: &mut [u8]);

    fn sha256(&self, data: &[u8]) -> [u8; 32];

    fn schnorr_sign(&self, secret_key: &[u8; 32], digest: &[u8; 32]) -> Result<[u8; 64]>;

    fn schnorr_verify(&self, public_key: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64])
        -> bool;

    fn fill_random(&self, out: &mut [u8]);
}

/// Software backend built on `secp256k1`, `hkdf`, `hmac`, `sha2` and `chacha20`.
pub struct DefaultBackend {
    secp: Secp256k1<All>,
}

impl DefaultBackend {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for DefaultBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoBackend for DefaultBackend {
    fn ecdh(&self, secret_key: &[u8; 32], compressed_point: &[u8; 33]) -> Result<[u8; 32]> {
        let sk = secp256k1::SecretKey::from_slice(secret_key).map_err(|_| Error::InvalidKey)?;
        let point =
            secp256k1::PublicKey::from_slice(compressed_point).map_err(|_| Error::InvalidKey)?;
        let xy = ecdh::shared_secret_point(&point, &sk);
        let mut x = [0u8; 32];
        x.copy_from_slice(&xy[..32]);
        Ok(x)
    }

    fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> [u8; 32] {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
        prk.into()
    }

    fn hkdf_expand(&self, prk: &[u8; 32], info: &[u8], out: &mut [u8]) -> Result<()> {
        let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| Error::InvalidKey)?;
        hk.expand(info, out).map_err(|_| Error::InvalidKey)
    }

    fn hmac_sha256(&self, key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidKey)?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().into())
    }

    fn verify_hmac_sha256(&self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<bool> {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidKey)?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.verify_slice(tag).is_ok())
    }

    fn chacha20(&self, key: &[u8; 32], nonce: &[u8; 12], data: &mut [u8]) {
        let mut cipher = ChaCha20::new(key.into(), nonce.into());
        cipher.apply_keystream(data);
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn schnorr_sign(&self, secret_key: &[u8; 32], digest: &[u8; 32]) -> Result<[u8; 64]> {
        let sk = secp256k1::SecretKey::from_slice(secret_key).map_err(|_| Error::InvalidKey)?;
        let keypair = Keypair::from_secret_key(&self.secp, &sk);
        let mut aux = [0u8; 32];
        self.fill_random(&mut aux);
        let msg = Message::from_digest(*digest);
        let sig = self.secp.sign_schnorr_with_aux_rand(&msg, &keypair, &aux);
        Ok(sig.serialize())
    }

    fn schnorr_verify(
        &self,
        public_key: &[u8; 32],
        digest: &[u8; 32],
        signature: &[u8; 64],
    ) -> bool {
        let Ok(xonly) = XOnlyPublicKey::from_slice(public_key) else {
            return false;
        };
        let Ok(sig) = schnorr::Signature::from_slice(signature) else {
            return false;
        };
        let msg = Message::from_digest(*digest);
        self.secp.verify_schnorr(&sig, &msg, &xonly).is_ok()
    }

    fn fill_random(&self, out: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(out);
    }
}

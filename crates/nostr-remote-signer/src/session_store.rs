use crate::{BunkerUrl, Result, StorageAdapter};
use nostr::{Keys, PublicKey, SecretKey};
use std::sync::Arc;

const CLIENT_KEY: &str = "nip46/client-key";
const BUNKER_URL: &str = "nip46/bunker-url";
const USER_PUBKEY: &str = "nip46/user-pubkey";

/// Persisted remote-signer session: the local client keypair, the bunker URL
/// it was paired with and the user pubkey the bunker reported.
///
/// Unparsable values read back as `None`.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn StorageAdapter>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    pub fn client_keys(&self) -> Result<Option<Keys>> {
        let Some(hex_key) = self.storage.get(CLIENT_KEY)? else {
            return Ok(None);
        };
        match SecretKey::from_hex(hex_key.trim()) {
            Ok(sk) => Ok(Some(Keys::new(sk))),
            Err(e) => {
                tracing::warn!("ignoring unreadable client key: {}", e);
                Ok(None)
            }
        }
    }

    /// Returns the persisted client keypair, generating and saving one if absent.
    pub fn load_or_create_client_keys(&self) -> Result<Keys> {
        if let Some(keys) = self.client_keys()? {
            return Ok(keys);
        }
        let keys = Keys::generate();
        self.save_client_keys(&keys)?;
        Ok(keys)
    }

    pub fn save_client_keys(&self, keys: &Keys) -> Result<()> {
        self.storage
            .put(CLIENT_KEY, hex::encode(keys.secret_key().to_secret_bytes()))
    }

    pub fn bunker_url(&self) -> Result<Option<BunkerUrl>> {
        let Some(raw) = self.storage.get(BUNKER_URL)? else {
            return Ok(None);
        };
        match BunkerUrl::parse(&raw) {
            Ok(url) => Ok(Some(url)),
            Err(e) => {
                tracing::warn!("ignoring unreadable bunker url: {}", e);
                Ok(None)
            }
        }
    }

    pub fn save_bunker_url(&self, url: &BunkerUrl) -> Result<()> {
        self.storage.put(BUNKER_URL, url.to_string())
    }

    pub fn user_pubkey(&self) -> Result<Option<PublicKey>> {
        Ok(self
            .storage
            .get(USER_PUBKEY)?
            .and_then(|hex_key| PublicKey::from_hex(hex_key.trim()).ok()))
    }

    pub fn save_user_pubkey(&self, pubkey: &PublicKey) -> Result<()> {
        self.storage.put(USER_PUBKEY, pubkey.to_hex())
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.del(CLIENT_KEY)?;
        self.storage.del(BUNKER_URL)?;
        self.storage.del(USER_PUBKEY)
    }
}

use serde::{Deserialize, Serialize};

pub const NOSTR_CONNECT_KIND: u16 = 24133;
pub const RELAY_LIST_KIND: u16 = 10002;

/// Result value reserved by signers for out-of-band authorization challenges.
pub const AUTH_URL_RESULT: &str = "auth_url";
pub const CONNECT_ACK: &str = "ack";
pub const PING_PONG: &str = "pong";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nip46Method {
    Connect,
    GetPublicKey,
    SignEvent,
    Ping,
    Nip44Encrypt,
    Nip44Decrypt,
}

impl Nip46Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Nip46Method::Connect => "connect",
            Nip46Method::GetPublicKey => "get_public_key",
            Nip46Method::SignEvent => "sign_event",
            Nip46Method::Ping => "ping",
            Nip46Method::Nip44Encrypt => "nip44_encrypt",
            Nip46Method::Nip44Decrypt => "nip44_decrypt",
        }
    }
}

impl std::fmt::Display for Nip46Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nip46Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nip46Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Nip46Response {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Returns the challenge URL if this reply is an authorization notification
    /// rather than a terminal response.
    pub fn auth_url(&self) -> Option<&str> {
        if self.result.as_deref() != Some(AUTH_URL_RESULT) {
            return None;
        }
        self.error.as_deref().filter(|url| !url.is_empty())
    }
}

/// One entry of a NIP-65 relay list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nip65Relay {
    pub url: String,
    pub read: bool,
    pub write: bool,
}

impl Nip65Relay {
    pub fn new(url: impl Into<String>, read: bool, write: bool) -> Self {
        Self {
            url: url.into(),
            read,
            write,
        }
    }

    pub fn read_write(url: impl Into<String>) -> Self {
        Self::new(url, true, true)
    }

    pub fn marker(&self) -> Option<&'static str> {
        match (self.read, self.write) {
            (true, false) => Some("read"),
            (false, true) => Some("write"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRelayList {
    pub pubkey: String,
    pub relays: Vec<Nip65Relay>,
    pub fetched_at: u64,
    pub expires_at: u64,
}

impl CachedRelayList {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.write)
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.read)
            .map(|r| r.url.clone())
            .collect()
    }
}

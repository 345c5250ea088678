use crate::utils::pubkey_from_hex;
use crate::{Error, Result};
use nostr::PublicKey;

const SCHEME: &str = "bunker://";

/// `bunker://<remote-signer-pubkey>?relay=<url>&relay=<url>&secret=<value>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUrl {
    pub remote_signer_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidBunkerUrl("expected bunker:// scheme".to_string()))?;

        let (pubkey_part, query) = rest.split_once('?').unwrap_or((rest, ""));
        let pubkey_hex = pubkey_part.trim_end_matches('/');
        if pubkey_hex.len() != 64 {
            return Err(Error::InvalidBunkerUrl(
                "remote signer pubkey must be 64 hex characters".to_string(),
            ));
        }
        let remote_signer_pubkey = pubkey_from_hex(pubkey_hex)
            .map_err(|_| Error::InvalidBunkerUrl("invalid remote signer pubkey".to_string()))?;

        let mut relays: Vec<String> = Vec::new();
        let mut secret = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value)
                .map_err(|_| Error::InvalidBunkerUrl(format!("bad encoding in {}", name)))?
                .trim()
                .to_string();
            match name {
                "relay" if !value.is_empty() => {
                    if !relays.contains(&value) {
                        relays.push(value);
                    }
                }
                "secret" if !value.is_empty() => secret = Some(value),
                _ => {}
            }
        }

        if relays.is_empty() {
            return Err(Error::InvalidBunkerUrl("missing relay".to_string()));
        }

        Ok(Self {
            remote_signer_pubkey,
            relays,
            secret,
        })
    }
}

impl std::fmt::Display for BunkerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", SCHEME, self.remote_signer_pubkey.to_hex())?;
        let mut separator = '?';
        for relay in &self.relays {
            write!(f, "{}relay={}", separator, urlencoding::encode(relay))?;
            separator = '&';
        }
        if let Some(secret) = &self.secret {
            write!(f, "{}secret={}", separator, urlencoding::encode(secret))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for BunkerUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

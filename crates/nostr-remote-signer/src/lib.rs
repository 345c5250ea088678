//! Encrypted remote signing for Nostr clients.
//!
//! NIP-44 v2 payload encryption, a NIP-46 remote signer client, NIP-65 relay
//! list discovery with outbox/inbox relay selection, and a bounded event
//! deduplicator. Relay sockets stay behind the [`RelayTransport`] trait.

pub mod backend;
pub mod bunker_url;
pub mod config;
pub mod dedup;
pub mod error;
pub mod file_storage;
pub mod memory_relay;
pub mod nip44;
pub mod pubsub;
pub mod relay;
pub mod relay_list;
pub mod session_store;
pub mod signer;
pub mod storage;
pub mod types;
pub mod utils;

pub use backend::{CryptoBackend, DefaultBackend};
pub use bunker_url::BunkerUrl;
pub use config::{Config, RelayListConfig, SignerConfig};
pub use dedup::EventDeduplicator;
pub use error::{Error, ErrorKind, Result};
pub use file_storage::FileStorageAdapter;
pub use memory_relay::MemoryRelayNetwork;
pub use nip44::ConversationKey;
pub use pubsub::RelayPool;
pub use relay::{ConnectionId, InboundMessage, InboundSender, RelayTransport};
pub use relay_list::{parse_relay_list, relay_list_event, RelayListManager};
pub use session_store::SessionStore;
pub use signer::{RemoteSigner, SignerNotification, SignerState};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use types::{CachedRelayList, Nip46Method, Nip46Request, Nip46Response, Nip65Relay};

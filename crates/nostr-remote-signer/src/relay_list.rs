//! NIP-65 relay list discovery and outbox/inbox relay selection.

use crate::config::RelayListConfig;
use crate::pubsub::build_filter;
use crate::relay::{ClientCommand, RelayReply, RelayTransport};
use crate::types::{CachedRelayList, Nip65Relay, RELAY_LIST_KIND};
use crate::utils::now_millis;
use crate::{Error, Result, StorageAdapter};
use nostr::{Event, EventBuilder, Filter, Kind, PublicKey, Tag, UnsignedEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

const STORAGE_PREFIX: &str = "relay-list/";

/// Trims whitespace and trailing slashes. Returns `None` for anything that is
/// not a `ws://` or `wss://` url.
pub fn normalize_relay_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("wss://")
        .or_else(|| lower.strip_prefix("ws://"))?;
    if rest.is_empty() {
        return None;
    }
    Some(url.to_string())
}

/// Extracts `["r", url, marker?]` tags. A missing marker means read and write,
/// unknown markers are skipped and repeated urls are merged.
pub fn parse_relay_list(event: &Event) -> Vec<Nip65Relay> {
    if event.kind != Kind::from(RELAY_LIST_KIND) {
        return Vec::new();
    }

    let mut relays: Vec<Nip65Relay> = Vec::new();
    for tag in event.tags.iter() {
        let t = tag.as_slice();
        if t.len() < 2 || t[0] != "r" {
            continue;
        }
        let Some(url) = normalize_relay_url(&t[1]) else {
            continue;
        };
        let (read, write) = match t.get(2).map(|m| m.as_str()) {
            None | Some("") => (true, true),
            Some("read") => (true, false),
            Some("write") => (false, true),
            Some(_) => continue,
        };
        match relays.iter_mut().find(|r| r.url == url) {
            Some(existing) => {
                existing.read |= read;
                existing.write |= write;
            }
            None => relays.push(Nip65Relay::new(url, read, write)),
        }
    }
    relays
}

/// Builds the kind 10002 event announcing `relays` for `pubkey`.
pub fn relay_list_event(pubkey: PublicKey, relays: &[Nip65Relay]) -> Result<UnsignedEvent> {
    let mut tags = Vec::with_capacity(relays.len());
    for relay in relays {
        let mut parts = vec!["r".to_string(), relay.url.clone()];
        if let Some(marker) = relay.marker() {
            parts.push(marker.to_string());
        }
        tags.push(Tag::parse(&parts).map_err(|e| Error::Protocol(e.to_string()))?);
    }
    Ok(EventBuilder::new(Kind::from(RELAY_LIST_KIND), "")
        .tags(tags)
        .build(pubkey))
}

/// Relay lists keyed by hex pubkey, bounded in count. Inserting a new key at
/// capacity evicts the entry with the oldest `fetched_at`.
pub struct RelayListCache {
    entries: HashMap<String, CachedRelayList>,
    capacity: usize,
}

impl RelayListCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Entry for `pubkey` unless it has expired at `now_ms`.
    pub fn get(&self, pubkey: &str, now_ms: u64) -> Option<&CachedRelayList> {
        self.entries
            .get(pubkey)
            .filter(|entry| !entry.is_expired(now_ms))
    }

    pub fn insert(&mut self, entry: CachedRelayList) -> Option<CachedRelayList> {
        let mut evicted = None;
        if !self.entries.contains_key(&entry.pubkey) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| e.fetched_at)
                .map(|e| e.pubkey.clone());
            if let Some(oldest) = oldest {
                evicted = self.entries.remove(&oldest);
            }
        }
        self.entries.insert(entry.pubkey.clone(), entry);
        evicted
    }

    pub fn remove(&mut self, pubkey: &str) -> Option<CachedRelayList> {
        self.entries.remove(pubkey)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes the in-flight marker and wakes waiters when the owning fetch ends,
/// including when its future is dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, watch::Receiver<()>>>,
    pubkey: String,
    _done: watch::Sender<()>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap().remove(&self.pubkey);
    }
}

pub struct RelayListManager {
    transport: Arc<dyn RelayTransport>,
    config: RelayListConfig,
    cache: Mutex<RelayListCache>,
    in_flight: Mutex<HashMap<String, watch::Receiver<()>>>,
    current_user: Mutex<Option<PublicKey>>,
    storage: Option<Arc<dyn StorageAdapter>>,
}

impl RelayListManager {
    pub fn new(transport: Arc<dyn RelayTransport>, config: RelayListConfig) -> Self {
        let cache = RelayListCache::new(config.cache_capacity);
        Self {
            transport,
            config,
            cache: Mutex::new(cache),
            in_flight: Mutex::new(HashMap::new()),
            current_user: Mutex::new(None),
            storage: None,
        }
    }

    /// Persist cache entries under `relay-list/<pubkey>`.
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Loads persisted, unexpired entries into the cache. Returns how many were loaded.
    pub fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let now = now_millis();
        let mut restored = 0;
        for key in storage.list(STORAGE_PREFIX)? {
            let Some(raw) = storage.get(&key)? else {
                continue;
            };
            let entry: CachedRelayList = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable cached relay list {}: {}", key, e);
                    continue;
                }
            };
            if entry.is_expired(now) {
                continue;
            }
            self.cache.lock().unwrap().insert(entry);
            restored += 1;
        }
        Ok(restored)
    }

    pub fn bootstrap_relays(&self) -> &[String] {
        &self.config.bootstrap_relays
    }

    pub fn set_current_user(&self, pubkey: Option<PublicKey>) {
        *self.current_user.lock().unwrap() = pubkey;
    }

    pub fn current_user(&self) -> Option<PublicKey> {
        *self.current_user.lock().unwrap()
    }

    /// Cached, unexpired list for `pubkey` without touching the network.
    pub fn cached(&self, pubkey: &PublicKey) -> Option<CachedRelayList> {
        self.cache
            .lock()
            .unwrap()
            .get(&pubkey.to_hex(), now_millis())
            .cloned()
    }

    pub fn invalidate(&self, pubkey: &PublicKey) {
        let key = pubkey.to_hex();
        self.cache.lock().unwrap().remove(&key);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.del(&format!("{}{}", STORAGE_PREFIX, key)) {
                tracing::warn!("failed to drop cached relay list {}: {}", key, e);
            }
        }
    }

    /// Drops every cached list and forgets the current user.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
        self.set_current_user(None);
        if let Some(storage) = &self.storage {
            match storage.list(STORAGE_PREFIX) {
                Ok(keys) => {
                    for key in keys {
                        let _ = storage.del(&key);
                    }
                }
                Err(e) => tracing::warn!("failed to clear cached relay lists: {}", e),
            }
        }
    }

    /// Relay list for `pubkey`: from cache when fresh, otherwise fetched from
    /// the bootstrap relays. At most one fetch per pubkey runs at a time; other
    /// callers wait for it. An empty list means nothing could be found.
    pub async fn get_relay_list(&self, pubkey: &PublicKey) -> Vec<Nip65Relay> {
        self.relay_entry(pubkey)
            .await
            .map(|entry| entry.relays)
            .unwrap_or_default()
    }

    async fn relay_entry(&self, pubkey: &PublicKey) -> Option<CachedRelayList> {
        let key = pubkey.to_hex();
        if let Some(entry) = self.fresh(&key) {
            tracing::debug!("relay list cache hit for {}", key);
            return Some(entry);
        }

        let lookup = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(&key) {
                Some(rx) => Lookup::Wait(rx.clone()),
                // A fetch may have finished since the first cache check.
                None => match self.fresh(&key) {
                    Some(entry) => Lookup::Cached(entry),
                    None => {
                        let (tx, rx) = watch::channel(());
                        in_flight.insert(key.clone(), rx);
                        Lookup::Fetch(tx)
                    }
                },
            }
        };

        let done_tx = match lookup {
            Lookup::Cached(entry) => return Some(entry),
            Lookup::Wait(mut rx) => {
                tracing::debug!("relay list fetch for {} already in flight", key);
                // Resolves once the fetching side drops its sender.
                let _ = tokio::time::timeout(self.config.fetch_timeout(), rx.changed()).await;
                return self.fresh(&key);
            }
            Lookup::Fetch(tx) => tx,
        };
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            pubkey: key.clone(),
            _done: done_tx,
        };

        match self.fetch(pubkey).await {
            Some(relays) => {
                tracing::debug!("fetched {} relays for {}", relays.len(), key);
                Some(self.store(&key, relays))
            }
            None => {
                tracing::debug!("no relay list found for {}", key);
                None
            }
        }
    }

    fn fresh(&self, key: &str) -> Option<CachedRelayList> {
        self.cache.lock().unwrap().get(key, now_millis()).cloned()
    }

    /// Where to read `author`'s events from: their write relays, then bootstrap.
    pub async fn select_fetch_relays(&self, author: &PublicKey) -> Vec<String> {
        let write = self
            .relay_entry(author)
            .await
            .map(|entry| entry.write_relays())
            .unwrap_or_default();
        self.with_fallback(write)
    }

    /// Where to publish the current user's events: their write relays, else bootstrap.
    pub async fn select_publish_relays(&self) -> Vec<String> {
        let Some(user) = self.current_user() else {
            return self.config.bootstrap_relays.clone();
        };
        let write = self
            .relay_entry(&user)
            .await
            .map(|entry| entry.write_relays())
            .unwrap_or_default();
        if write.is_empty() {
            return self.config.bootstrap_relays.clone();
        }
        write
    }

    /// Where to deliver events mentioning `pubkey`: their read relays, then bootstrap.
    pub async fn select_inbox_relays(&self, pubkey: &PublicKey) -> Vec<String> {
        let read = self
            .relay_entry(pubkey)
            .await
            .map(|entry| entry.read_relays())
            .unwrap_or_default();
        self.with_fallback(read)
    }

    fn with_fallback(&self, mut preferred: Vec<String>) -> Vec<String> {
        for relay in &self.config.bootstrap_relays {
            if !preferred.contains(relay) {
                preferred.push(relay.clone());
            }
        }
        preferred
    }

    fn store(&self, key: &str, relays: Vec<Nip65Relay>) -> CachedRelayList {
        let fetched_at = now_millis();
        let entry = CachedRelayList {
            pubkey: key.to_string(),
            relays,
            fetched_at,
            expires_at: fetched_at + self.config.ttl_ms,
        };

        if let Some(storage) = &self.storage {
            let stored = serde_json::to_string(&entry)
                .map_err(Error::from)
                .and_then(|json| storage.put(&format!("{}{}", STORAGE_PREFIX, key), json));
            if let Err(e) = stored {
                tracing::warn!("failed to persist relay list for {}: {}", key, e);
            }
        }

        let evicted = self.cache.lock().unwrap().insert(entry.clone());
        if let (Some(evicted), Some(storage)) = (evicted, &self.storage) {
            let _ = storage.del(&format!("{}{}", STORAGE_PREFIX, evicted.pubkey));
        }
        entry
    }

    /// Queries every bootstrap relay in parallel under one shared timeout.
    /// The first non-empty list wins. Queries still running afterwards are
    /// cancelled and drained so each closes its relay connection.
    async fn fetch(&self, pubkey: &PublicKey) -> Option<Vec<Nip65Relay>> {
        let filter = build_filter()
            .kinds(vec![RELAY_LIST_KIND])
            .authors(vec![*pubkey])
            .build();
        let timeout = self.config.fetch_timeout();

        let mut tasks = FetchTasks::new();
        for url in &self.config.bootstrap_relays {
            let transport = self.transport.clone();
            let url = url.clone();
            let filter = filter.clone();
            let author = *pubkey;
            let cancel = tasks.cancel_signal();
            tasks.set.spawn(async move {
                let result = fetch_from_relay(transport, &url, filter, author, timeout, cancel).await;
                (url, result)
            });
        }

        let first_success = async {
            while let Some(joined) = tasks.set.join_next().await {
                match joined {
                    Ok((_, Ok(Some(event)))) => {
                        let relays = parse_relay_list(&event);
                        if !relays.is_empty() {
                            return Some(relays);
                        }
                    }
                    Ok((url, Ok(None))) => tracing::debug!("{} has no relay list", url),
                    Ok((url, Err(e))) => tracing::debug!("relay list fetch from {} failed: {}", url, e),
                    Err(e) => tracing::warn!("relay list fetch task failed: {}", e),
                }
            }
            None
        };

        let found = match tokio::time::timeout(timeout, first_success).await {
            Ok(found) => found,
            Err(_) => {
                tracing::debug!("relay list fetch for {} timed out", pubkey.to_hex());
                None
            }
        };
        tasks.cancel_and_drain().await;
        found
    }
}

enum Lookup {
    Cached(CachedRelayList),
    Wait(watch::Receiver<()>),
    Fetch(watch::Sender<()>),
}

type FetchResult = (String, Result<Option<Event>>);

/// Per-relay fetch tasks sharing one cancel signal. Dropping the set without
/// draining (the caller's future was dropped) detaches the tasks after
/// cancelling them, so they still run their close path.
struct FetchTasks {
    set: JoinSet<FetchResult>,
    cancel: watch::Sender<bool>,
}

impl FetchTasks {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            set: JoinSet::new(),
            cancel,
        }
    }

    fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    async fn cancel_and_drain(&mut self) {
        let _ = self.cancel.send(true);
        while let Some(joined) = self.set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("relay list fetch task failed: {}", e);
            }
        }
    }
}

impl Drop for FetchTasks {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        self.set.detach_all();
    }
}

/// Resolves once `cancel` is raised or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|raised| *raised).await;
}

/// Newest valid relay-list event `relay_url` holds for `author`, read up to EOSE.
/// Cancellation ends the query early with `Ok(None)`; an opened connection is
/// always closed before returning.
async fn fetch_from_relay(
    transport: Arc<dyn RelayTransport>,
    relay_url: &str,
    filter: Filter,
    author: PublicKey,
    timeout: std::time::Duration,
    mut cancel: watch::Receiver<bool>,
) -> Result<Option<Event>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = tokio::select! {
        connection = transport.connect(relay_url, tx) => connection?,
        _ = cancelled(&mut cancel) => return Ok(None),
    };
    let sub_id = format!("relay-list-{}", uuid::Uuid::new_v4());

    let query = async {
        transport
            .send(connection, ClientCommand::req(sub_id.clone(), filter).to_json()?)
            .await?;

        let mut newest: Option<Event> = None;
        while let Some(msg) = rx.recv().await {
            match RelayReply::parse(&msg.text) {
                Ok(Some(RelayReply::Event {
                    subscription_id,
                    event,
                })) if subscription_id == sub_id => {
                    if event.pubkey != author
                        || event.kind != Kind::from(RELAY_LIST_KIND)
                        || event.verify().is_err()
                    {
                        continue;
                    }
                    if newest
                        .as_ref()
                        .map_or(true, |current| event.created_at > current.created_at)
                    {
                        newest = Some(*event);
                    }
                }
                Ok(Some(RelayReply::EndOfStoredEvents(id))) if id == sub_id => break,
                Ok(Some(RelayReply::Closed {
                    subscription_id,
                    message,
                })) if subscription_id == sub_id => {
                    return Err(Error::Transport(format!("subscription closed: {}", message)));
                }
                _ => {}
            }
        }
        Ok::<_, Error>(newest)
    };

    let (result, unsubscribe) = tokio::select! {
        outcome = tokio::time::timeout(timeout, query) => match outcome {
            Ok(result) => (result, true),
            Err(_) => (Err(Error::Timeout), true),
        },
        // Closing the connection drops the subscription with it.
        _ = cancelled(&mut cancel) => (Ok(None), false),
    };

    if unsubscribe {
        if let Ok(close) = ClientCommand::Close(sub_id.clone()).to_json() {
            let _ = tokio::time::timeout(timeout, transport.send(connection, close)).await;
        }
    }
    transport.close(connection).await;
    result
}

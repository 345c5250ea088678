use crate::relay::{ClientCommand, ConnectionId, InboundReceiver, InboundSender, RelayTransport};
use crate::{Error, Result};
use nostr::{Event, Filter, Kind, PublicKey, Timestamp};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A set of relay connections sharing one inbound channel.
///
/// Writes go to every connected relay. A relay that fails to accept a frame is
/// logged and skipped; only when every relay fails does the write error.
pub struct RelayPool {
    transport: Arc<dyn RelayTransport>,
    connections: Mutex<Vec<(String, ConnectionId)>>,
    inbound_tx: InboundSender,
}

impl RelayPool {
    pub fn new(transport: Arc<dyn RelayTransport>) -> (Self, InboundReceiver) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                connections: Mutex::new(Vec::new()),
                inbound_tx,
            },
            inbound_rx,
        )
    }

    /// Connects to every url not already connected. Succeeds when at least one
    /// relay of the pool is connected afterwards.
    pub async fn connect_all(&self, urls: &[String]) -> Result<usize> {
        for url in urls {
            if self.is_connected(url) {
                continue;
            }
            match self.transport.connect(url, self.inbound_tx.clone()).await {
                Ok(connection) => {
                    tracing::debug!("connected to relay {}", url);
                    self.connections
                        .lock()
                        .unwrap()
                        .push((url.clone(), connection));
                }
                Err(e) => tracing::warn!("failed to connect to relay {}: {}", url, e),
            }
        }

        let connected = self.connections.lock().unwrap().len();
        if connected == 0 {
            return Err(Error::NoRelayReachable);
        }
        Ok(connected)
    }

    pub fn is_connected(&self, url: &str) -> bool {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .any(|(u, _)| u == url)
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Opens `filter` on every relay under a fresh subscription id.
    pub async fn subscribe(&self, filter: Filter) -> Result<String> {
        let sub_id = format!("sub-{}", uuid::Uuid::new_v4());
        self.broadcast(&ClientCommand::req(sub_id.clone(), filter))
            .await?;
        Ok(sub_id)
    }

    /// Best effort: failures are only logged.
    pub async fn unsubscribe(&self, sub_id: &str) {
        if let Err(e) = self
            .broadcast(&ClientCommand::Close(sub_id.to_string()))
            .await
        {
            tracing::debug!("unsubscribe {} failed: {}", sub_id, e);
        }
    }

    pub async fn publish(&self, event: &Event) -> Result<()> {
        self.broadcast(&ClientCommand::Event(Box::new(event.clone())))
            .await
    }

    /// Closes every connection. The pool can be reconnected afterwards.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.connections.lock().unwrap().drain(..).collect();
        for (url, connection) in connections {
            tracing::debug!("closing relay {}", url);
            self.transport.close(connection).await;
        }
    }

    async fn broadcast(&self, command: &ClientCommand) -> Result<()> {
        let text = command.to_json()?;
        let connections = self.connections.lock().unwrap().clone();
        if connections.is_empty() {
            return Err(Error::NotConnected);
        }

        let mut delivered = 0;
        let mut last_error = None;
        for (url, connection) in connections {
            match self.transport.send(connection, text.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("send to relay {} failed: {}", url, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if delivered == 0 {
            return Err(Error::Transport(
                last_error.unwrap_or_else(|| "no relay accepted the frame".to_string()),
            ));
        }
        Ok(())
    }
}

/// Helper to build filters for this crate
pub fn build_filter() -> FilterBuilder {
    FilterBuilder::new()
}

#[derive(Default)]
pub struct FilterBuilder {
    kinds: Vec<Kind>,
    authors: Vec<PublicKey>,
    pubkeys: Vec<PublicKey>,
    since: Option<u64>,
    limit: Option<usize>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = kinds.into_iter().map(Kind::from).collect();
        self
    }

    pub fn authors(mut self, authors: Vec<PublicKey>) -> Self {
        self.authors = authors;
        self
    }

    pub fn pubkeys(mut self, pubkeys: Vec<PublicKey>) -> Self {
        self.pubkeys = pubkeys;
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds);
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors);
        }
        if !self.pubkeys.is_empty() {
            filter = filter.pubkeys(self.pubkeys);
        }
        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from(since));
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_relay::MemoryRelayNetwork;
    use crate::relay::RelayReply;
    use nostr::{EventBuilder, Keys};

    #[test]
    fn filter_builder_serializes_nip01_fields() {
        let pk = Keys::generate().public_key();
        let filter = build_filter()
            .kinds(vec![24133])
            .pubkeys(vec![pk])
            .since(1_700_000_000)
            .limit(5)
            .build();
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["kinds"], serde_json::json!([24133]));
        assert_eq!(value["#p"], serde_json::json!([pk.to_hex()]));
        assert_eq!(value["since"], serde_json::json!(1_700_000_000u64));
        assert_eq!(value["limit"], serde_json::json!(5));
    }

    #[tokio::test]
    async fn connect_all_tolerates_partial_failure() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("wss://up.example");
        network.add_relay("wss://down.example");
        network.set_online("wss://down.example", false);

        let (pool, _rx) = RelayPool::new(Arc::new(network.clone()));
        let connected = pool
            .connect_all(&[
                "wss://down.example".to_string(),
                "wss://up.example".to_string(),
                "wss://unknown.example".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(connected, 1);
        assert_eq!(pool.relay_urls(), vec!["wss://up.example".to_string()]);
    }

    #[tokio::test]
    async fn connect_all_fails_when_nothing_reachable() {
        let network = MemoryRelayNetwork::new();
        let (pool, _rx) = RelayPool::new(Arc::new(network));
        let err = pool
            .connect_all(&["wss://nowhere.example".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRelayReachable));
    }

    #[tokio::test]
    async fn publish_reaches_every_relay() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("wss://a.example");
        network.add_relay("wss://b.example");
        let (pool, mut rx) = RelayPool::new(Arc::new(network.clone()));
        pool.connect_all(&["wss://a.example".to_string(), "wss://b.example".to_string()])
            .await
            .unwrap();

        let event = EventBuilder::text_note("stored")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        pool.publish(&event).await.unwrap();

        for _ in 0..2 {
            let msg = rx.recv().await.unwrap();
            assert!(matches!(
                RelayReply::parse(&msg.text).unwrap(),
                Some(RelayReply::Ok { accepted: true, .. })
            ));
        }
        assert_eq!(network.stored_events("wss://a.example").len(), 1);
        assert_eq!(network.stored_events("wss://b.example").len(), 1);
    }

    #[tokio::test]
    async fn publish_survives_one_relay_going_away() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("wss://a.example");
        network.add_relay("wss://b.example");
        let (pool, _rx) = RelayPool::new(Arc::new(network.clone()));
        pool.connect_all(&["wss://a.example".to_string(), "wss://b.example".to_string()])
            .await
            .unwrap();

        network.set_online("wss://a.example", false);
        let event = EventBuilder::text_note("x")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        pool.publish(&event).await.unwrap();

        network.set_online("wss://b.example", false);
        let err = pool.publish(&event).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn shutdown_disconnects() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("wss://a.example");
        let (pool, _rx) = RelayPool::new(Arc::new(network.clone()));
        pool.connect_all(&["wss://a.example".to_string()])
            .await
            .unwrap();
        assert_eq!(network.connection_count(), 1);

        pool.shutdown().await;
        assert_eq!(network.connection_count(), 0);
        assert!(pool.relay_urls().is_empty());
        let event = EventBuilder::text_note("x")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        assert!(matches!(pool.publish(&event).await, Err(Error::NotConnected)));
    }
}

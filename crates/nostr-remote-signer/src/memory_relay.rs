//! In-process relay network.
//!
//! Implements enough of NIP-01 to run the signer and relay-list flows without
//! sockets: per-relay event stores, live subscriptions, `OK` and `EOSE`
//! replies, replaceable and ephemeral kinds, and relays that can be taken
//! offline mid-test.

use crate::relay::{
    ClientCommand, ConnectionId, InboundMessage, InboundSender, RelayReply, RelayTransport,
};
use crate::{Error, Result};
use async_trait::async_trait;
use nostr::Event;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Subscription filter as sent on the wire
#[derive(Debug, Clone, Default, Deserialize)]
struct RelayFilter {
    ids: Option<Vec<String>>,
    authors: Option<Vec<String>>,
    kinds: Option<Vec<u16>>,
    #[serde(rename = "#p")]
    p_tags: Option<Vec<String>>,
    since: Option<u64>,
    until: Option<u64>,
    limit: Option<usize>,
}

impl RelayFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&event.id.to_hex()) {
                return false;
            }
        }
        if let Some(ref authors) = self.authors {
            if !authors.contains(&event.pubkey.to_hex()) {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind.as_u16()) {
                return false;
            }
        }
        if let Some(ref p_tags) = self.p_tags {
            let has_match = event.tags.iter().any(|t| {
                let t = t.as_slice();
                t.len() >= 2 && t[0] == "p" && p_tags.contains(&t[1])
            });
            if !has_match {
                return false;
            }
        }
        let created_at = event.created_at.as_u64();
        if let Some(since) = self.since {
            if created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if created_at > until {
                return false;
            }
        }
        true
    }
}

struct RelayState {
    online: bool,
    events: Vec<Event>,
}

struct Connection {
    relay_url: String,
    sender: InboundSender,
    subscriptions: HashMap<String, Vec<RelayFilter>>,
}

#[derive(Default)]
struct NetworkState {
    relays: HashMap<String, RelayState>,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
}

#[derive(Clone, Default)]
pub struct MemoryRelayNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryRelayNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relay(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .relays
            .entry(url.to_string())
            .or_insert_with(|| RelayState {
                online: true,
                events: Vec::new(),
            });
    }

    /// Taking a relay offline drops its open connections and refuses new ones.
    pub fn set_online(&self, url: &str, online: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(relay) = state.relays.get_mut(url) {
            relay.online = online;
        }
        if !online {
            state.connections.retain(|_, c| c.relay_url != url);
        }
    }

    /// Stores `event` on `url` as-is, bypassing replaceable-kind handling.
    pub fn store_event(&self, url: &str, event: Event) {
        if let Some(relay) = self.state.lock().unwrap().relays.get_mut(url) {
            relay.events.push(event);
        }
    }

    pub fn stored_events(&self, url: &str) -> Vec<Event> {
        self.state
            .lock()
            .unwrap()
            .relays
            .get(url)
            .map(|r| r.events.clone())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Number of live subscriptions across every connection.
    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }

    fn handle_req(
        state: &mut NetworkState,
        connection: ConnectionId,
        subscription_id: String,
        filters: Vec<RelayFilter>,
    ) -> Result<()> {
        let conn = state
            .connections
            .get(&connection)
            .ok_or_else(|| Error::Transport("connection closed".to_string()))?;
        let relay = state
            .relays
            .get(&conn.relay_url)
            .ok_or_else(|| Error::Transport("unknown relay".to_string()))?;

        let mut stored: Vec<&Event> = Vec::new();
        for filter in &filters {
            let mut matching: Vec<&Event> =
                relay.events.iter().filter(|e| filter.matches(e)).collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matching.truncate(limit);
            }
            for event in matching {
                if !stored.iter().any(|e| e.id == event.id) {
                    stored.push(event);
                }
            }
        }

        let mut frames = Vec::with_capacity(stored.len() + 1);
        for event in stored {
            frames.push(
                RelayReply::Event {
                    subscription_id: subscription_id.clone(),
                    event: Box::new(event.clone()),
                }
                .to_json()?,
            );
        }
        frames.push(RelayReply::EndOfStoredEvents(subscription_id.clone()).to_json()?);

        let relay_url = conn.relay_url.clone();
        let sender = conn.sender.clone();
        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.subscriptions.insert(subscription_id, filters);
        }
        for text in frames {
            let _ = sender.send(InboundMessage {
                connection,
                relay_url: relay_url.clone(),
                text,
            });
        }
        Ok(())
    }

    fn handle_event(state: &mut NetworkState, connection: ConnectionId, event: Event) -> Result<()> {
        let (relay_url, sender) = state
            .connections
            .get(&connection)
            .map(|c| (c.relay_url.clone(), c.sender.clone()))
            .ok_or_else(|| Error::Transport("connection closed".to_string()))?;

        if event.verify().is_err() {
            let reply = RelayReply::Ok {
                event_id: event.id.to_hex(),
                accepted: false,
                message: "invalid: bad signature".to_string(),
            };
            let _ = sender.send(InboundMessage {
                connection,
                relay_url,
                text: reply.to_json()?,
            });
            return Ok(());
        }

        let relay = state
            .relays
            .get_mut(&relay_url)
            .ok_or_else(|| Error::Transport("unknown relay".to_string()))?;
        let duplicate = relay.events.iter().any(|e| e.id == event.id);
        let kind = event.kind.as_u16();
        if !duplicate && !(20000..30000).contains(&kind) {
            if (10000..20000).contains(&kind) {
                let newer_exists = relay.events.iter().any(|e| {
                    e.pubkey == event.pubkey
                        && e.kind == event.kind
                        && e.created_at > event.created_at
                });
                if newer_exists {
                    let _ = sender.send(InboundMessage {
                        connection,
                        relay_url,
                        text: RelayReply::Ok {
                            event_id: event.id.to_hex(),
                            accepted: false,
                            message: "duplicate: have a newer event".to_string(),
                        }
                        .to_json()?,
                    });
                    return Ok(());
                }
                relay
                    .events
                    .retain(|e| !(e.pubkey == event.pubkey && e.kind == event.kind));
            }
            relay.events.push(event.clone());
        }

        let ok = RelayReply::Ok {
            event_id: event.id.to_hex(),
            accepted: true,
            message: if duplicate {
                "duplicate: already have this event".to_string()
            } else {
                String::new()
            },
        };
        let _ = sender.send(InboundMessage {
            connection,
            relay_url: relay_url.clone(),
            text: ok.to_json()?,
        });
        if duplicate {
            return Ok(());
        }

        for (id, conn) in state.connections.iter() {
            if conn.relay_url != relay_url {
                continue;
            }
            for (subscription_id, filters) in &conn.subscriptions {
                if filters.iter().any(|f| f.matches(&event)) {
                    let text = RelayReply::Event {
                        subscription_id: subscription_id.clone(),
                        event: Box::new(event.clone()),
                    }
                    .to_json()?;
                    let _ = conn.sender.send(InboundMessage {
                        connection: *id,
                        relay_url: relay_url.clone(),
                        text,
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryRelayNetwork {
    async fn connect(&self, url: &str, inbound: InboundSender) -> Result<ConnectionId> {
        let mut state = self.state.lock().unwrap();
        match state.relays.get(url) {
            Some(relay) if relay.online => {}
            Some(_) => return Err(Error::Transport(format!("{} is offline", url))),
            None => return Err(Error::Transport(format!("{} is unreachable", url))),
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            Connection {
                relay_url: url.to_string(),
                sender: inbound,
                subscriptions: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn send(&self, connection: ConnectionId, text: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connections.contains_key(&connection) {
            return Err(Error::Transport("connection closed".to_string()));
        }

        match ClientCommand::parse(&text)? {
            Some(ClientCommand::Req {
                subscription_id,
                filters,
            }) => {
                let filters = filters
                    .iter()
                    .map(|f| serde_json::to_value(f).and_then(serde_json::from_value))
                    .collect::<std::result::Result<Vec<RelayFilter>, _>>()?;
                Self::handle_req(&mut state, connection, subscription_id, filters)
            }
            Some(ClientCommand::Event(event)) => Self::handle_event(&mut state, connection, *event),
            Some(ClientCommand::Close(subscription_id)) => {
                if let Some(conn) = state.connections.get_mut(&connection) {
                    conn.subscriptions.remove(&subscription_id);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn close(&self, connection: ConnectionId) {
        self.state.lock().unwrap().connections.remove(&connection);
    }
}

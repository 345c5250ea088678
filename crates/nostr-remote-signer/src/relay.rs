//! Relay transport seam and NIP-01 frame helpers.

use crate::{Error, Result};
use async_trait::async_trait;
use nostr::{Event, Filter};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// A text frame received from a relay connection.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection: ConnectionId,
    pub relay_url: String,
    pub text: String,
}

pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundMessage>;

/// Socket layer the rest of the crate talks through.
///
/// Implementations deliver every frame a relay sends on the `inbound` sender
/// handed to `connect`, and must support many concurrent connections.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, url: &str, inbound: InboundSender) -> Result<ConnectionId>;

    async fn send(&self, connection: ConnectionId, text: String) -> Result<()>;

    async fn close(&self, connection: ConnectionId);
}

/// Client to relay frame.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Event(Box<Event>),
    Close(String),
}

impl ClientCommand {
    pub fn req(subscription_id: impl Into<String>, filter: Filter) -> Self {
        ClientCommand::Req {
            subscription_id: subscription_id.into(),
            filters: vec![filter],
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let frame = match self {
            ClientCommand::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientCommand::Event(event) => json!(["EVENT", serde_json::to_value(event)?]),
            ClientCommand::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(frame.to_string())
    }

    /// Parses a client frame. Returns `Ok(None)` for verbs this crate does not speak.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let frame: Vec<Value> = serde_json::from_str(text)?;
        let verb = frame.first().and_then(Value::as_str).unwrap_or_default();
        let command = match (verb, frame.len()) {
            ("REQ", n) if n >= 2 => ClientCommand::Req {
                subscription_id: string_at(&frame, 1)?,
                filters: frame[2..]
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<std::result::Result<_, _>>()?,
            },
            ("EVENT", 2) => ClientCommand::Event(Box::new(serde_json::from_value(frame[1].clone())?)),
            ("CLOSE", 2) => ClientCommand::Close(string_at(&frame, 1)?),
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// Relay to client frame.
#[derive(Debug, Clone)]
pub enum RelayReply {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayReply {
    /// Parses a relay frame. Unknown verbs yield `Ok(None)`.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let frame: Vec<Value> = serde_json::from_str(text)?;
        let verb = frame.first().and_then(Value::as_str).unwrap_or_default();
        let reply = match (verb, frame.len()) {
            ("EVENT", 3) => RelayReply::Event {
                subscription_id: string_at(&frame, 1)?,
                event: Box::new(serde_json::from_value(frame[2].clone())?),
            },
            ("EOSE", 2) => RelayReply::EndOfStoredEvents(string_at(&frame, 1)?),
            ("OK", n) if n >= 3 => RelayReply::Ok {
                event_id: string_at(&frame, 1)?,
                accepted: frame[2].as_bool().unwrap_or(false),
                message: frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            ("NOTICE", 2) => RelayReply::Notice(string_at(&frame, 1)?),
            ("CLOSED", n) if n >= 2 => RelayReply::Closed {
                subscription_id: string_at(&frame, 1)?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    pub fn to_json(&self) -> Result<String> {
        let frame = match self {
            RelayReply::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, serde_json::to_value(event)?]),
            RelayReply::EndOfStoredEvents(subscription_id) => json!(["EOSE", subscription_id]),
            RelayReply::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayReply::Notice(message) => json!(["NOTICE", message]),
            RelayReply::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
        };
        Ok(frame.to_string())
    }
}

fn string_at(frame: &[Value], index: usize) -> Result<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("expected string at position {}", index)))
}

//! Simulated NIP-46 bunker listening on a [`MemoryRelayNetwork`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use nostr_remote_signer::nip44::{self, ConversationKey};
use nostr_remote_signer::pubsub::build_filter;
use nostr_remote_signer::relay::RelayReply;
use nostr_remote_signer::types::{Nip46Request, Nip46Response, NOSTR_CONNECT_KIND};
use nostr_remote_signer::{BunkerUrl, MemoryRelayNetwork, RelayPool};
use tokio::task::JoinHandle;

/// How the bunker answers.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Required as the second `connect` param when set.
    pub secret: Option<String>,
    /// Answer `sign_event` with an `auth_url` challenge and hold the real reply until `approve`.
    pub challenge_signing: bool,
    pub deny_signing: bool,
    /// Never reply to anything.
    pub silent: bool,
    /// Delay for the first `sign_event` reply only.
    pub first_sign_delay: Option<Duration>,
    /// Sign with these keys instead of the user's.
    pub sign_with: Option<Keys>,
    /// Sign a copy whose `created_at` is one second later than requested.
    pub shift_created_at: bool,
}

pub const AUTH_URL: &str = "https://bunker.example/approve";

struct BunkerState {
    keys: Keys,
    user_keys: Keys,
    pool: RelayPool,
    behavior: Mutex<Behavior>,
    known_clients: Mutex<HashSet<PublicKey>>,
    held: Mutex<Vec<(PublicKey, Nip46Response)>>,
    seen: Mutex<Vec<Nip46Request>>,
    sign_requests: Mutex<usize>,
}

async fn handle(state: Arc<BunkerState>, event: Event) {
    state.handle(&state, event).await
}

impl BunkerState {
    async fn handle(&self, this: &Arc<BunkerState>, event: Event) {
        let Ok(key) = ConversationKey::derive(self.keys.secret_key(), &event.pubkey) else {
            return;
        };
        let Ok(plaintext) = nip44::decrypt(&event.content, &key) else {
            return;
        };
        let Ok(request) = serde_json::from_str::<Nip46Request>(&plaintext) else {
            return;
        };
        self.seen.lock().unwrap().push(request.clone());

        let behavior = self.behavior.lock().unwrap().clone();
        if behavior.silent {
            return;
        }

        let client = event.pubkey;
        let response = match request.method.as_str() {
            "connect" => self.connect(&client, &request, &behavior),
            "get_public_key" => Nip46Response::ok(&request.id, self.user_keys.public_key().to_hex()),
            "ping" => Nip46Response::ok(&request.id, "pong"),
            "sign_event" => {
                if behavior.deny_signing {
                    Nip46Response::error(&request.id, "Permission denied by user")
                } else {
                    let signed = match self.sign(&request, &behavior) {
                        Ok(signed) => Nip46Response::ok(&request.id, signed),
                        Err(e) => Nip46Response::error(&request.id, e),
                    };
                    let first = {
                        let mut count = self.sign_requests.lock().unwrap();
                        *count += 1;
                        *count == 1
                    };
                    if behavior.challenge_signing {
                        self.held.lock().unwrap().push((client, signed));
                        let challenge = Nip46Response {
                            id: request.id.clone(),
                            result: Some("auth_url".to_string()),
                            error: Some(AUTH_URL.to_string()),
                        };
                        self.reply(&client, &challenge).await;
                        return;
                    }
                    if let (true, Some(delay)) = (first, behavior.first_sign_delay) {
                        let state = this.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            state.reply(&client, &signed).await;
                        });
                        return;
                    }
                    signed
                }
            }
            "nip44_encrypt" | "nip44_decrypt" => self.nip44(&request),
            other => Nip46Response::error(&request.id, format!("unsupported method {}", other)),
        };
        self.reply(&client, &response).await;
    }

    fn connect(&self, client: &PublicKey, request: &Nip46Request, behavior: &Behavior) -> Nip46Response {
        if request.params.first() != Some(&self.keys.public_key().to_hex()) {
            return Nip46Response::error(&request.id, "wrong remote signer pubkey");
        }
        let mut known = self.known_clients.lock().unwrap();
        if known.contains(client) {
            return Nip46Response::error(&request.id, "already connected");
        }
        if let Some(secret) = &behavior.secret {
            if request.params.get(1) != Some(secret) {
                return Nip46Response::error(&request.id, "invalid secret");
            }
        }
        known.insert(*client);
        Nip46Response::ok(&request.id, "ack")
    }

    fn sign(&self, request: &Nip46Request, behavior: &Behavior) -> Result<String, String> {
        let json = request.params.first().ok_or("missing event")?;
        let unsigned = UnsignedEvent::from_json(json).map_err(|e| e.to_string())?;
        let mut created_at = unsigned.created_at;
        if behavior.shift_created_at {
            created_at = Timestamp::from(created_at.as_u64() + 1);
        }
        let keys = behavior.sign_with.as_ref().unwrap_or(&self.user_keys);
        let event = EventBuilder::new(unsigned.kind, unsigned.content.clone())
            .tags(unsigned.tags.iter().cloned())
            .custom_created_at(created_at)
            .sign_with_keys(keys)
            .map_err(|e| e.to_string())?;
        Ok(event.as_json())
    }

    fn nip44(&self, request: &Nip46Request) -> Nip46Response {
        let (Some(peer), Some(text)) = (request.params.first(), request.params.get(1)) else {
            return Nip46Response::error(&request.id, "missing params");
        };
        let Ok(peer) = PublicKey::from_hex(peer) else {
            return Nip46Response::error(&request.id, "bad peer pubkey");
        };
        let Ok(key) = ConversationKey::derive(self.user_keys.secret_key(), &peer) else {
            return Nip46Response::error(&request.id, "bad peer pubkey");
        };
        let outcome = if request.method == "nip44_encrypt" {
            nip44::encrypt(text, &key)
        } else {
            nip44::decrypt(text, &key)
        };
        match outcome {
            Ok(value) => Nip46Response::ok(&request.id, value),
            Err(e) => Nip46Response::error(&request.id, e.to_string()),
        }
    }

    async fn reply(&self, client: &PublicKey, response: &Nip46Response) {
        let Ok(key) = ConversationKey::derive(self.keys.secret_key(), client) else {
            return;
        };
        let payload = serde_json::to_string(response).unwrap();
        let content = nip44::encrypt(&payload, &key).unwrap();
        let event = EventBuilder::new(Kind::from(NOSTR_CONNECT_KIND), content)
            .tag(Tag::public_key(*client))
            .sign_with_keys(&self.keys)
            .unwrap();
        let _ = self.pool.publish(&event).await;
    }
}

pub struct FakeBunker {
    pub keys: Keys,
    pub user_keys: Keys,
    pub relays: Vec<String>,
    state: Arc<BunkerState>,
    task: JoinHandle<()>,
}

impl FakeBunker {
    pub async fn start(network: &MemoryRelayNetwork, relays: &[&str], behavior: Behavior) -> Self {
        let keys = Keys::generate();
        let user_keys = Keys::generate();
        let relays: Vec<String> = relays.iter().map(|r| r.to_string()).collect();

        let (pool, mut inbound) = RelayPool::new(Arc::new(network.clone()));
        pool.connect_all(&relays).await.unwrap();
        let filter = build_filter()
            .kinds(vec![NOSTR_CONNECT_KIND])
            .pubkeys(vec![keys.public_key()])
            .build();
        pool.subscribe(filter).await.unwrap();

        let state = Arc::new(BunkerState {
            keys: keys.clone(),
            user_keys: user_keys.clone(),
            pool,
            behavior: Mutex::new(behavior),
            known_clients: Mutex::new(HashSet::new()),
            held: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            sign_requests: Mutex::new(0),
        });

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let mut handled = HashSet::new();
            while let Some(message) = inbound.recv().await {
                if let Ok(Some(RelayReply::Event { event, .. })) = RelayReply::parse(&message.text) {
                    // The same request arrives once per shared relay.
                    if handled.insert(event.id) {
                        handle(task_state.clone(), *event).await;
                    }
                }
            }
        });

        Self {
            keys,
            user_keys,
            relays,
            state,
            task,
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn bunker_url(&self) -> String {
        BunkerUrl {
            remote_signer_pubkey: self.pubkey(),
            relays: self.relays.clone(),
            secret: self.state.behavior.lock().unwrap().secret.clone(),
        }
        .to_string()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn requests(&self) -> Vec<Nip46Request> {
        self.state.seen.lock().unwrap().clone()
    }

    /// Sends the replies held back by a signing challenge.
    pub async fn approve(&self) {
        let held: Vec<_> = self.state.held.lock().unwrap().drain(..).collect();
        for (client, response) in held {
            self.state.reply(&client, &response).await;
        }
    }

    /// Sends an arbitrary response to `client`.
    pub async fn send_raw(&self, client: &PublicKey, response: &Nip46Response) {
        self.state.reply(client, response).await;
    }
}

impl Drop for FakeBunker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

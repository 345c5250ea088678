//! NIP-46 remote signer client.
//!
//! Every RPC is a kind 24133 event whose content is a NIP-44 payload
//! addressed to the remote signer. Replies come back the same way and are
//! matched to their request by id. A reply with `result == "auth_url"` is an
//! authorization challenge: it is surfaced as a [`SignerNotification`] and the
//! request keeps waiting for the real answer.

use crate::backend::{CryptoBackend, DefaultBackend};
use crate::config::SignerConfig;
use crate::dedup::EventDeduplicator;
use crate::nip44::{self, ConversationKey};
use crate::pubsub::{build_filter, RelayPool};
use crate::relay::{InboundReceiver, RelayReply, RelayTransport};
use crate::types::{
    Nip46Method, Nip46Request, Nip46Response, CONNECT_ACK, NOSTR_CONNECT_KIND, PING_PONG,
};
use crate::utils::{now_secs, random_request_id, sign_event_with, verify_event_with};
use crate::{BunkerUrl, Error, Result, SessionStore};
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, PublicKey, Tag, UnsignedEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingAuthorization,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerNotification {
    /// The signer wants the user to approve `request_id` at `url`.
    AuthUrl { request_id: String, url: String },
    StateChanged(SignerState),
}

/// Signers only report "already connected" as free text.
pub fn is_already_connected(error: &str) -> bool {
    error.to_lowercase().contains("already connected")
}

pub fn is_permission_denied(error: &str) -> bool {
    let error = error.to_lowercase();
    ["denied", "not authorized", "unauthorized", "permission", "rejected"]
        .iter()
        .any(|pattern| error.contains(pattern))
}

/// Terminal value of a response, or its error classified.
fn into_result(response: Nip46Response) -> Result<String> {
    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        if is_permission_denied(&error) {
            return Err(Error::PermissionDenied(error));
        }
        return Err(Error::Remote(error));
    }
    response
        .result
        .ok_or_else(|| Error::Protocol("response has neither result nor error".to_string()))
}

fn interpret_connect(response: Nip46Response, secret: Option<&str>) -> Result<String> {
    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        if is_already_connected(&error) {
            return Ok(CONNECT_ACK.to_string());
        }
        return Err(Error::ConnectRejected(error));
    }
    match response.result {
        Some(result) if result == CONNECT_ACK => Ok(result),
        Some(result) if secret == Some(result.as_str()) => Ok(result),
        Some(result) => Err(Error::ConnectRejected(format!(
            "unexpected connect result: {}",
            result
        ))),
        None => Err(Error::ConnectRejected("empty connect response".to_string())),
    }
}

type Waiter = oneshot::Sender<Result<Nip46Response>>;

#[derive(Clone)]
struct RemoteSession {
    remote_pubkey: PublicKey,
    conversation_key: ConversationKey,
}

/// State shared with the inbound dispatcher task.
struct Shared {
    backend: Arc<dyn CryptoBackend>,
    client_keys: Keys,
    pending: Mutex<HashMap<String, Waiter>>,
    /// Pending ids the signer has answered with an auth challenge.
    challenged: Mutex<HashSet<String>>,
    dedup: EventDeduplicator,
    session: Mutex<Option<RemoteSession>>,
    state: Mutex<SignerState>,
    notify_tx: crossbeam_channel::Sender<SignerNotification>,
}

impl Shared {
    fn secret_bytes(&self) -> [u8; 32] {
        self.client_keys.secret_key().to_secret_bytes()
    }

    fn state(&self) -> SignerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SignerState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::debug!("signer state -> {:?}", state);
        let _ = self
            .notify_tx
            .send(SignerNotification::StateChanged(state));
    }

    /// Removes the waiter for `id` however the request ended. Leaves
    /// `AwaitingAuthorization` once no challenged request is outstanding.
    fn take_waiter(&self, id: &str) -> Option<Waiter> {
        let waiter = self.pending.lock().unwrap().remove(id);
        let mut challenged = self.challenged.lock().unwrap();
        challenged.remove(id);
        if challenged.is_empty() && self.state() == SignerState::AwaitingAuthorization {
            self.set_state(SignerState::Connected);
        }
        waiter
    }

    fn fail_pending(&self) {
        self.challenged.lock().unwrap().clear();
        let waiters: Vec<Waiter> = self
            .pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Disconnected));
        }
    }

    fn handle_inbound(&self, text: &str) {
        let event = match RelayReply::parse(text) {
            Ok(Some(RelayReply::Event { event, .. })) => event,
            Ok(Some(RelayReply::Ok {
                event_id,
                accepted: false,
                message,
            })) => {
                tracing::warn!("relay refused event {}: {}", event_id, message);
                return;
            }
            Ok(Some(RelayReply::Notice(message))) => {
                tracing::debug!("relay notice: {}", message);
                return;
            }
            Ok(_) => return,
            Err(e) => {
                tracing::debug!("ignoring malformed relay frame: {}", e);
                return;
            }
        };

        if event.kind != Kind::from(NOSTR_CONNECT_KIND) {
            return;
        }
        if !verify_event_with(self.backend.as_ref(), &event) {
            tracing::warn!("dropping nip46 event {} with invalid signature", event.id);
            return;
        }
        if !self.dedup.try_add(&event.id.to_hex()) {
            return;
        }
        if let Some(response) = self.decrypt_response(&event) {
            self.dispatch(response);
        }
    }

    fn decrypt_response(&self, event: &Event) -> Option<Nip46Response> {
        let cached = self
            .session
            .lock()
            .unwrap()
            .as_ref()
            .filter(|s| s.remote_pubkey == event.pubkey)
            .map(|s| s.conversation_key.clone());
        let key = match cached {
            Some(key) => key,
            None => match ConversationKey::derive_with(
                self.backend.as_ref(),
                &self.secret_bytes(),
                &event.pubkey.to_bytes(),
            ) {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!("cannot derive key for {}: {}", event.pubkey, e);
                    return None;
                }
            },
        };

        let plaintext = match nip44::decrypt_with(self.backend.as_ref(), &event.content, &key) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!("dropping undecryptable nip46 event {}: {}", event.id, e);
                return None;
            }
        };
        match serde_json::from_slice::<Nip46Response>(&plaintext) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!("dropping malformed nip46 payload in {}: {}", event.id, e);
                None
            }
        }
    }

    fn dispatch(&self, response: Nip46Response) {
        if let Some(url) = response.auth_url() {
            {
                // Lock order: pending, challenged, state.
                let pending = self.pending.lock().unwrap();
                if !pending.contains_key(&response.id) {
                    return;
                }
                let mut challenged = self.challenged.lock().unwrap();
                challenged.insert(response.id.clone());
                self.set_state(SignerState::AwaitingAuthorization);
            }
            tracing::info!("signer requested authorization for request {}", response.id);
            let _ = self.notify_tx.send(SignerNotification::AuthUrl {
                request_id: response.id.clone(),
                url: url.to_string(),
            });
            return;
        }

        match self.take_waiter(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
            }
            None => tracing::debug!("no pending request for response {}", response.id),
        }
    }
}

async fn dispatch_inbound(shared: Arc<Shared>, mut inbound: InboundReceiver) {
    while let Some(message) = inbound.recv().await {
        shared.handle_inbound(&message.text);
    }
}

pub struct RemoteSigner {
    shared: Arc<Shared>,
    transport: Arc<dyn RelayTransport>,
    config: SignerConfig,
    pool: Mutex<Option<Arc<RelayPool>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    user_pubkey: Mutex<Option<PublicKey>>,
    notify_rx: crossbeam_channel::Receiver<SignerNotification>,
    session_store: Option<SessionStore>,
}

impl RemoteSigner {
    /// Session with a fresh, unpersisted client keypair.
    pub fn new(transport: Arc<dyn RelayTransport>, config: SignerConfig) -> Self {
        Self::with_keys(transport, Keys::generate(), config)
    }

    pub fn with_keys(
        transport: Arc<dyn RelayTransport>,
        client_keys: Keys,
        config: SignerConfig,
    ) -> Self {
        Self::with_backend(transport, client_keys, config, Arc::new(DefaultBackend::new()))
    }

    pub fn with_backend(
        transport: Arc<dyn RelayTransport>,
        client_keys: Keys,
        config: SignerConfig,
        backend: Arc<dyn CryptoBackend>,
    ) -> Self {
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            backend,
            client_keys,
            pending: Mutex::new(HashMap::new()),
            challenged: Mutex::new(HashSet::new()),
            dedup: EventDeduplicator::new(config.dedup_capacity),
            session: Mutex::new(None),
            state: Mutex::new(SignerState::Disconnected),
            notify_tx,
        });
        Self {
            shared,
            transport,
            config,
            pool: Mutex::new(None),
            dispatcher: Mutex::new(None),
            user_pubkey: Mutex::new(None),
            notify_rx,
            session_store: None,
        }
    }

    /// Session whose client keypair is loaded from (or created in) `store`,
    /// so a bunker that saw it before recognizes it again.
    pub fn from_store(
        transport: Arc<dyn RelayTransport>,
        store: SessionStore,
        config: SignerConfig,
    ) -> Result<Self> {
        let keys = store.load_or_create_client_keys()?;
        let mut signer = Self::with_keys(transport, keys, config);
        signer.session_store = Some(store);
        Ok(signer)
    }

    pub fn client_public_key(&self) -> PublicKey {
        self.shared.client_keys.public_key()
    }

    pub fn state(&self) -> SignerState {
        self.shared.state()
    }

    pub fn user_pubkey(&self) -> Option<PublicKey> {
        *self.user_pubkey.lock().unwrap()
    }

    pub fn remote_signer_pubkey(&self) -> Option<PublicKey> {
        self.shared
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.remote_pubkey)
    }

    /// Auth challenges and state transitions, in order.
    pub fn notifications(&self) -> crossbeam_channel::Receiver<SignerNotification> {
        self.notify_rx.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Opens the relays, then performs the `connect` handshake. Returns the
    /// accepted result (`"ack"` or the echoed secret).
    pub async fn connect(
        &self,
        remote_signer: PublicKey,
        relays: &[String],
        secret: Option<&str>,
    ) -> Result<String> {
        self.teardown().await;
        self.shared.set_state(SignerState::Connecting);

        let result = self.open(remote_signer, relays, secret).await;
        match &result {
            Ok(_) => {
                tracing::info!("connected to remote signer {}", remote_signer);
                self.shared.set_state(SignerState::Connected);
            }
            Err(e) => {
                tracing::warn!("connect to remote signer {} failed: {}", remote_signer, e);
                self.teardown().await;
            }
        }
        result
    }

    async fn open(
        &self,
        remote_signer: PublicKey,
        relays: &[String],
        secret: Option<&str>,
    ) -> Result<String> {
        let conversation_key = ConversationKey::derive_with(
            self.shared.backend.as_ref(),
            &self.shared.secret_bytes(),
            &remote_signer.to_bytes(),
        )?;

        let (pool, inbound) = RelayPool::new(self.transport.clone());
        let pool = Arc::new(pool);
        *self.pool.lock().unwrap() = Some(pool.clone());
        *self.shared.session.lock().unwrap() = Some(RemoteSession {
            remote_pubkey: remote_signer,
            conversation_key,
        });
        *self.dispatcher.lock().unwrap() =
            Some(tokio::spawn(dispatch_inbound(self.shared.clone(), inbound)));

        pool.connect_all(relays).await?;

        let mut params = vec![remote_signer.to_hex()];
        if let Some(secret) = secret {
            params.push(secret.to_string());
        }
        let response = self.call(Nip46Method::Connect, params).await?;
        interpret_connect(response, secret)
    }

    pub async fn get_public_key(&self) -> Result<String> {
        into_result(self.call(Nip46Method::GetPublicKey, Vec::new()).await?)
    }

    /// Sends a serialized unsigned event and returns the signer's JSON verbatim.
    pub async fn sign_event_json(&self, unsigned_json: &str) -> Result<String> {
        into_result(
            self.call(Nip46Method::SignEvent, vec![unsigned_json.to_string()])
                .await?,
        )
    }

    /// Signs `unsigned` remotely and checks that what came back is a correctly
    /// signed copy of it, by the user when their pubkey is known.
    pub async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let reply = self.sign_event_json(&unsigned.as_json()).await?;
        let event = Event::from_json(&reply)
            .map_err(|e| Error::Protocol(format!("malformed signed event: {}", e)))?;

        if event.kind != unsigned.kind
            || event.content != unsigned.content
            || event.tags != unsigned.tags
            || event.created_at != unsigned.created_at
        {
            return Err(Error::Protocol(
                "signed event does not match the request".to_string(),
            ));
        }
        if let Some(user) = self.user_pubkey() {
            if event.pubkey != user {
                return Err(Error::Protocol(format!(
                    "event signed by {} instead of {}",
                    event.pubkey, user
                )));
            }
        }
        if !verify_event_with(self.shared.backend.as_ref(), &event) {
            return Err(Error::Protocol("signed event failed verification".to_string()));
        }
        Ok(event)
    }

    pub async fn ping(&self) -> Result<()> {
        let result = into_result(self.call(Nip46Method::Ping, Vec::new()).await?)?;
        if result != PING_PONG {
            return Err(Error::Protocol(format!("unexpected ping reply: {}", result)));
        }
        Ok(())
    }

    pub async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        into_result(
            self.call(
                Nip46Method::Nip44Encrypt,
                vec![peer.to_hex(), plaintext.to_string()],
            )
            .await?,
        )
    }

    pub async fn nip44_decrypt(&self, peer: &PublicKey, payload: &str) -> Result<String> {
        into_result(
            self.call(
                Nip46Method::Nip44Decrypt,
                vec![peer.to_hex(), payload.to_string()],
            )
            .await?,
        )
    }

    /// Closes every relay and fails outstanding requests with [`Error::Disconnected`].
    pub async fn disconnect(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        let pool = self.pool.lock().unwrap().take();
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            handle.abort();
        }
        self.shared.session.lock().unwrap().take();
        self.shared.fail_pending();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        self.shared.set_state(SignerState::Disconnected);
    }

    /// Parses `bunker_url`, connects, asks for the user pubkey and persists
    /// the session when a store is attached.
    pub async fn login(&self, bunker_url: &str) -> Result<PublicKey> {
        let url = BunkerUrl::parse(bunker_url)?;
        self.connect(url.remote_signer_pubkey, &url.relays, url.secret.as_deref())
            .await?;

        let user = match self.fetch_user_pubkey().await {
            Ok(user) => user,
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };

        if let Some(store) = &self.session_store {
            store.save_client_keys(&self.shared.client_keys)?;
            store.save_bunker_url(&url)?;
            store.save_user_pubkey(&user)?;
        }
        Ok(user)
    }

    /// Reconnects a persisted session with the same client keypair. Returns
    /// `Ok(None)` when nothing is persisted.
    pub async fn resume(&self) -> Result<Option<PublicKey>> {
        let Some(store) = &self.session_store else {
            return Ok(None);
        };
        let Some(url) = store.bunker_url()? else {
            return Ok(None);
        };

        self.connect(url.remote_signer_pubkey, &url.relays, url.secret.as_deref())
            .await?;

        let user = match store.user_pubkey()? {
            Some(user) => user,
            None => {
                let user = self.fetch_user_pubkey().await?;
                store.save_user_pubkey(&user)?;
                user
            }
        };
        *self.user_pubkey.lock().unwrap() = Some(user);
        Ok(Some(user))
    }

    /// Disconnects and forgets the persisted session.
    pub async fn logout(&self) -> Result<()> {
        self.teardown().await;
        self.user_pubkey.lock().unwrap().take();
        if let Some(store) = &self.session_store {
            store.clear()?;
        }
        Ok(())
    }

    async fn fetch_user_pubkey(&self) -> Result<PublicKey> {
        let hex_key = self.get_public_key().await?;
        let user = PublicKey::from_hex(hex_key.trim())
            .map_err(|_| Error::Protocol(format!("signer returned invalid pubkey: {}", hex_key)))?;
        *self.user_pubkey.lock().unwrap() = Some(user);
        Ok(user)
    }

    fn connection(&self) -> Result<(Arc<RelayPool>, RemoteSession)> {
        let pool = self
            .pool
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)?;
        let session = self
            .shared
            .session
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)?;
        Ok((pool, session))
    }

    /// One correlated round trip. The reply subscription is opened before the
    /// request is published and closed again whatever the outcome.
    async fn call(&self, method: Nip46Method, params: Vec<String>) -> Result<Nip46Response> {
        let (pool, session) = self.connection()?;
        let id = random_request_id(self.shared.backend.as_ref());
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id.clone(), tx);
        tracing::debug!("nip46 {} request {}", method, id);

        let filter = build_filter()
            .kinds(vec![NOSTR_CONNECT_KIND])
            .pubkeys(vec![self.client_public_key()])
            .since(now_secs().saturating_sub(self.config.subscription_lookback_secs))
            .build();
        let sub_id = match pool.subscribe(filter).await {
            Ok(sub_id) => sub_id,
            Err(e) => {
                self.shared.take_waiter(&id);
                return Err(e);
            }
        };

        let request = Nip46Request {
            id: id.clone(),
            method: method.as_str().to_string(),
            params,
        };
        let outcome = tokio::time::timeout(
            self.config.request_timeout(),
            self.send_and_wait(&pool, &session, &request, rx),
        )
        .await;

        self.shared.take_waiter(&id);
        pool.unsubscribe(&sub_id).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("nip46 {} request {} timed out", method, id);
                Err(Error::Timeout)
            }
        }
    }

    async fn send_and_wait(
        &self,
        pool: &RelayPool,
        session: &RemoteSession,
        request: &Nip46Request,
        reply: oneshot::Receiver<Result<Nip46Response>>,
    ) -> Result<Nip46Response> {
        tokio::time::sleep(self.config.settle_delay()).await;
        let event = self.request_event(session, request)?;
        pool.publish(&event).await?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        }
    }

    fn request_event(&self, session: &RemoteSession, request: &Nip46Request) -> Result<Event> {
        let backend = self.shared.backend.as_ref();
        let payload = serde_json::to_string(request)?;
        let content = nip44::encrypt_with(backend, payload.as_bytes(), &session.conversation_key)?;
        let unsigned = EventBuilder::new(Kind::from(NOSTR_CONNECT_KIND), content)
            .tag(Tag::public_key(session.remote_pubkey))
            .build(self.client_public_key());
        sign_event_with(backend, unsigned, &self.shared.secret_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_connected_is_case_insensitive() {
        assert!(is_already_connected("Already Connected"));
        assert!(is_already_connected("error: client already connected to bunker"));
        assert!(!is_already_connected("connection refused"));
    }

    #[test]
    fn permission_patterns() {
        for text in [
            "Permission denied",
            "not authorized to sign kind 1",
            "Unauthorized",
            "user rejected the request",
            "no permission for sign_event",
        ] {
            assert!(is_permission_denied(text), "{}", text);
        }
        assert!(!is_permission_denied("invalid params"));
    }

    #[test]
    fn errors_are_classified() {
        assert!(matches!(
            into_result(Nip46Response::error("1", "denied by user")),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            into_result(Nip46Response::error("1", "bad json")),
            Err(Error::Remote(_))
        ));
        assert_eq!(into_result(Nip46Response::ok("1", "x")).unwrap(), "x");

        // An empty error string does not mask a result.
        let response = Nip46Response {
            id: "1".to_string(),
            result: Some("value".to_string()),
            error: Some(String::new()),
        };
        assert_eq!(into_result(response).unwrap(), "value");

        let empty = Nip46Response {
            id: "1".to_string(),
            result: None,
            error: None,
        };
        assert!(matches!(into_result(empty), Err(Error::Protocol(_))));
    }

    #[test]
    fn connect_acceptance() {
        assert_eq!(
            interpret_connect(Nip46Response::ok("1", "ack"), None).unwrap(),
            "ack"
        );
        assert_eq!(
            interpret_connect(Nip46Response::ok("1", "s3cret"), Some("s3cret")).unwrap(),
            "s3cret"
        );
        assert!(matches!(
            interpret_connect(Nip46Response::ok("1", "s3cret"), None),
            Err(Error::ConnectRejected(_))
        ));
        assert!(matches!(
            interpret_connect(Nip46Response::ok("1", "other"), Some("s3cret")),
            Err(Error::ConnectRejected(_))
        ));
        assert_eq!(
            interpret_connect(Nip46Response::error("1", "already connected"), None).unwrap(),
            "ack"
        );
        assert!(matches!(
            interpret_connect(Nip46Response::error("1", "invalid secret"), Some("x")),
            Err(Error::ConnectRejected(_))
        ));
    }

    #[tokio::test]
    async fn calls_require_a_connection() {
        let network = crate::memory_relay::MemoryRelayNetwork::new();
        let signer = RemoteSigner::new(Arc::new(network), SignerConfig::default());
        assert!(matches!(
            signer.get_public_key().await,
            Err(Error::NotConnected)
        ));
        assert_eq!(signer.state(), SignerState::Disconnected);
    }

    #[tokio::test]
    async fn connect_with_no_reachable_relay() {
        let network = crate::memory_relay::MemoryRelayNetwork::new();
        let signer = RemoteSigner::new(Arc::new(network), SignerConfig::default());
        let remote = Keys::generate().public_key();
        let err = signer
            .connect(remote, &["wss://nowhere.example".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRelayReachable));
        assert_eq!(signer.state(), SignerState::Disconnected);
        assert!(signer.remote_signer_pubkey().is_none());

        let states: Vec<_> = signer.notifications().try_iter().collect();
        assert_eq!(
            states,
            vec![
                SignerNotification::StateChanged(SignerState::Connecting),
                SignerNotification::StateChanged(SignerState::Disconnected),
            ]
        );
    }
}

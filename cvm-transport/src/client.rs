//! The Nostr client transport.
//!
//! Gives the app layer an ordinary bidirectional message channel while, on
//! the network, every send is a signed (optionally gift-wrapped) event and
//! every receive comes off one relay subscription. The id of the published
//! event acts as the over-the-wire request id; the correlation store maps
//! responses back to the ids the app layer chose.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

use cvm_tokio::{NotifyOnce, Task};
use cvm_types::{
    Event, EventTemplate, Filter, Message, Response, kind, tag,
    unix_time_secs,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::SeenCache;
use crate::correlation::{PendingRequest, PendingRequestStore};
use crate::error::{TRANSPORT_ERROR_CODE, TransportError};
use crate::stateless::{self, StatelessAction};
use crate::traits::{
    EncryptionMode, EphemeralKeyProvider, RelayHandler, Signer,
};
use crate::wrap;

/// Extra tags appended to every outbound app-message event.
pub type OutboundTagHook =
    Box<dyn Fn(&Message) -> Vec<Vec<String>> + Send + Sync>;

const PENDING_REQUEST_CAPACITY: usize = 256;
const SEEN_CACHE_CAPACITY: usize = 1000;

pub struct ClientConfig {
    pub signer: Arc<dyn Signer>,
    pub relay: Arc<dyn RelayHandler>,
    pub ephemeral_keys: Arc<dyn EphemeralKeyProvider>,
    pub server_pubkey: String,
    pub encryption: EncryptionMode,
    /// Emulate the initialize handshake locally (broadcast-only peer).
    pub stateless: bool,
    pub outbound_tag_hook: Option<OutboundTagHook>,
}

impl ClientConfig {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay: Arc<dyn RelayHandler>,
        ephemeral_keys: Arc<dyn EphemeralKeyProvider>,
        server_pubkey: impl Into<String>,
    ) -> Self {
        Self {
            signer,
            relay,
            ephemeral_keys,
            server_pubkey: server_pubkey.into(),
            encryption: EncryptionMode::default(),
            stateless: false,
            outbound_tag_hook: None,
        }
    }

    pub fn with_encryption(mut self, encryption: EncryptionMode) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_stateless(mut self, stateless: bool) -> Self {
        self.stateless = stateless;
        self
    }

    pub fn with_outbound_tag_hook(mut self, hook: OutboundTagHook) -> Self {
        self.outbound_tag_hook = Some(hook);
        self
    }
}

/// See the [module docs](self).
pub struct NostrClientTransport {
    inner: Arc<ClientInner>,
    pump: Mutex<Option<Task<()>>>,
}

struct ClientInner {
    signer: Arc<dyn Signer>,
    relay: Arc<dyn RelayHandler>,
    ephemeral_keys: Arc<dyn EphemeralKeyProvider>,
    server_pubkey: String,
    encryption: EncryptionMode,
    stateless: bool,
    tag_hook: Option<OutboundTagHook>,

    own_pubkey: OnceLock<String>,
    state: Mutex<ClientState>,
    app_tx: Mutex<Option<mpsc::Sender<Message>>>,
    subscription: Mutex<Option<String>>,
    shutdown: NotifyOnce,
}

struct ClientState {
    pending: PendingRequestStore,
    seen: SeenCache,
    decrypted: SeenCache,
    /// Set once the server has answered wrapped; upgrades `Optional` mode
    /// to wrapping.
    server_wraps: bool,
}

impl NostrClientTransport {
    pub fn new(config: ClientConfig) -> Self {
        let pending_cap = NonZeroUsize::new(PENDING_REQUEST_CAPACITY)
            .expect("nonzero");
        let seen_cap =
            NonZeroUsize::new(SEEN_CACHE_CAPACITY).expect("nonzero");
        Self {
            inner: Arc::new(ClientInner {
                signer: config.signer,
                relay: config.relay,
                ephemeral_keys: config.ephemeral_keys,
                server_pubkey: config.server_pubkey,
                encryption: config.encryption,
                stateless: config.stateless,
                tag_hook: config.outbound_tag_hook,
                own_pubkey: OnceLock::new(),
                state: Mutex::new(ClientState {
                    pending: PendingRequestStore::new(pending_cap),
                    seen: SeenCache::new(seen_cap),
                    decrypted: SeenCache::new(seen_cap),
                    server_wraps: false,
                }),
                app_tx: Mutex::new(None),
                subscription: Mutex::new(None),
                shutdown: NotifyOnce::new(),
            }),
            pump: Mutex::new(None),
        }
    }

    /// The transport's own pubkey. Available after [`start`](Self::start).
    pub fn pubkey(&self) -> Option<&str> {
        self.inner.own_pubkey.get().map(String::as_str)
    }

    /// Connects, subscribes for events addressed to us, and returns the
    /// channel on which received app messages are delivered.
    pub async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Message>, TransportError> {
        let inner = &self.inner;
        inner.relay.connect().await.map_err(TransportError::Relay)?;

        let own_pubkey = inner.signer.pubkey().await?;
        let _ = inner.own_pubkey.set(own_pubkey.clone());

        let (events_tx, mut events_rx) =
            mpsc::channel(crate::DEFAULT_CHANNEL_SIZE);
        let subscription = inner
            .relay
            .subscribe(vec![Filter::inbound_for(&own_pubkey)], events_tx)
            .await
            .map_err(TransportError::Relay)?;
        *inner.subscription.lock().unwrap() = Some(subscription);

        let (app_tx, app_rx) = mpsc::channel(crate::DEFAULT_CHANNEL_SIZE);
        *inner.app_tx.lock().unwrap() = Some(app_tx);

        let pump_inner = inner.clone();
        let pump = Task::spawn("nostr-client-inbound", async move {
            loop {
                tokio::select! {
                    () = pump_inner.shutdown.recv() => break,
                    maybe_event = events_rx.recv() => match maybe_event {
                        Some(event) =>
                            pump_inner.process_incoming_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Client inbound pump finished");
        });
        *self.pump.lock().unwrap() = Some(pump);

        info!("Client transport started as {own_pubkey}");
        Ok(app_rx)
    }

    /// Sends one app message to the server.
    pub async fn send(
        &self,
        message: Message,
    ) -> Result<(), TransportError> {
        self.inner.send(message).await
    }

    /// Shuts down: unsubscribes, disconnects, fails outstanding pending
    /// requests, and clears every cache.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.send();
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.await;
        }

        let subscription = inner.subscription.lock().unwrap().take();
        if let Some(subscription) = subscription {
            if let Err(e) = inner.relay.unsubscribe(&subscription).await {
                warn!("Unsubscribe failed: {e:#}");
            }
        }
        if let Err(e) = inner.relay.disconnect().await {
            warn!("Relay disconnect failed: {e:#}");
        }

        // Anyone still awaiting a response gets a transport error rather
        // than silence.
        let outstanding = inner.state.lock().unwrap().pending.drain();
        let app_tx = inner.app_tx.lock().unwrap().take();
        if let Some(app_tx) = app_tx {
            for (_, pending) in outstanding {
                let response = Response::error(
                    pending.original_id,
                    TRANSPORT_ERROR_CODE,
                    "transport stopped before a response arrived",
                );
                let _ = app_tx.send(Message::Response(response)).await;
            }
        }

        let mut state = inner.state.lock().unwrap();
        state.seen.clear();
        state.decrypted.clear();
        info!("Client transport stopped");
    }
}

impl ClientInner {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let app_tx = self
            .app_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotRunning)?;

        if self.stateless {
            match stateless::intercept(&message) {
                StatelessAction::RespondLocally(response) => {
                    let _ =
                        app_tx.send(Message::Response(response)).await;
                    return Ok(());
                }
                StatelessAction::Drop => return Ok(()),
                StatelessAction::PassThrough => (),
            }
        }

        let mut message = message;
        let request_meta = match &mut message {
            Message::Request(request) => {
                let own_pubkey = self
                    .own_pubkey
                    .get()
                    .ok_or(TransportError::NotRunning)?;
                request.set_client_pubkey(own_pubkey);
                Some(PendingRequest {
                    original_id: request.id.clone(),
                    is_initialize: request.is_initialize(),
                    progress_token: request.progress_token(),
                })
            }
            _ => None,
        };

        let mut tags = vec![vec![
            tag::RECIPIENT.to_owned(),
            self.server_pubkey.clone(),
        ]];
        if let Some(hook) = &self.tag_hook {
            tags.extend(hook(&message));
        }
        let template = EventTemplate {
            created_at: unix_time_secs(),
            kind: kind::APP_MESSAGE,
            tags,
            content: message.to_json(),
        };
        let event = self.signer.sign_event(template).await?;

        // The published event id is the over-the-wire request id; register
        // the pending entry under it before the event can possibly be
        // answered.
        if let Some(pending) = request_meta {
            let evicted = self
                .state
                .lock()
                .unwrap()
                .pending
                .insert(event.id.clone(), pending);
            if let Some((_, evicted)) = evicted {
                warn!("Pending request store overflow; failing caller");
                let response = Response::error(
                    evicted.original_id,
                    TRANSPORT_ERROR_CODE,
                    TransportError::PendingEvicted.to_string(),
                );
                let _ = app_tx.send(Message::Response(response)).await;
            }
        }

        match self.publish_outbound(&event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Never leave a pending entry for a request that was never
                // on the wire.
                self.state.lock().unwrap().pending.remove(&event.id);
                Err(e)
            }
        }
    }

    async fn publish_outbound(
        &self,
        event: &Event,
    ) -> Result<(), TransportError> {
        let should_wrap = match self.encryption {
            EncryptionMode::Required => true,
            EncryptionMode::Optional =>
                self.state.lock().unwrap().server_wraps,
            EncryptionMode::Disabled => false,
        };

        if should_wrap {
            let plaintext = serde_json::to_string(event)
                .expect("Event serialization is infallible");
            let wrapped = wrap::seal(
                self.ephemeral_keys.as_ref(),
                &self.server_pubkey,
                &plaintext,
                kind::GIFT_WRAP,
            )
            .await?;
            self.relay
                .publish(&wrapped)
                .await
                .map_err(TransportError::PublishFailed)
        } else {
            self.relay
                .publish(event)
                .await
                .map_err(TransportError::PublishFailed)
        }
    }

    async fn process_incoming_event(&self, event: Event) {
        let mut event = event;
        // Unwrap loop: a gift wrap yields an inner event which is processed
        // from the top (including its own duplicate suppression).
        loop {
            if !self.state.lock().unwrap().seen.first_sighting(&event.id) {
                return;
            }
            if !kind::is_gift_wrap(event.kind) {
                break;
            }
            if !self
                .state
                .lock()
                .unwrap()
                .decrypted
                .first_sighting(&event.id)
            {
                return;
            }
            let plaintext =
                match wrap::open(self.signer.as_ref(), &event).await {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        match self.encryption {
                            EncryptionMode::Required =>
                                error!("Failed to open gift wrap: {e:#}"),
                            _ => warn!("Dropping undecryptable wrap: {e:#}"),
                        }
                        return;
                    }
                };
            // The server answers wrapped; reciprocate from now on.
            self.state.lock().unwrap().server_wraps = true;
            match serde_json::from_str::<Event>(&plaintext) {
                Ok(inner_event) => event = inner_event,
                Err(e) => {
                    warn!("Gift wrap payload is not an event: {e:#}");
                    return;
                }
            }
        }

        if event.kind != kind::APP_MESSAGE {
            return;
        }
        let message = match Message::from_json(&event.content) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping event {id}: {e:#}", id = event.id);
                return;
            }
        };
        self.dispatch_message(event, message).await;
    }

    async fn dispatch_message(&self, event: Event, message: Message) {
        let app_tx = match self.app_tx.lock().unwrap().clone() {
            Some(app_tx) => app_tx,
            None => return,
        };

        match message {
            Message::Response(mut response) => {
                let matched = {
                    let mut state = self.state.lock().unwrap();
                    match event.correlated_event_id() {
                        Some(event_id) => state
                            .pending
                            .resolve_response(event_id, &mut response),
                        // Untagged response: some frames put the request
                        // event id in the response id itself.
                        None => match response.id.as_str().map(str::to_owned)
                        {
                            Some(key) => state
                                .pending
                                .resolve_response(&key, &mut response),
                            None => false,
                        },
                    }
                };
                if matched {
                    let _ = app_tx.send(Message::Response(response)).await;
                } else {
                    debug!("Dropping uncorrelated response");
                }
            }
            Message::Notification(notification)
                if notification.method == cvm_types::method::PROGRESS =>
            {
                let matched = {
                    let state = self.state.lock().unwrap();
                    notification
                        .progress_token()
                        .is_some_and(|token| {
                            state.pending.match_progress_token(&token).is_some()
                        })
                };
                if matched {
                    // The pending entry stays; progress precedes the
                    // response.
                    let _ = app_tx
                        .send(Message::Notification(notification))
                        .await;
                } else {
                    debug!("Dropping progress for unknown token");
                }
            }
            other => {
                let _ = app_tx.send(other).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use cvm_types::{Notification, Request, ResponsePayload, method};
    use serde_json::json;
    use tokio::time;

    use super::*;
    use crate::test_utils::{FakeSigner, InMemoryRelay, TestEphemeralKeys};

    struct Harness {
        relay: Arc<InMemoryRelay>,
        client: NostrClientTransport,
        app_rx: mpsc::Receiver<Message>,
    }

    async fn start_client(
        config_fn: impl FnOnce(ClientConfig) -> ClientConfig,
    ) -> Harness {
        cvm_logger::init_for_testing();
        let relay = InMemoryRelay::new();
        let server_pubkey = FakeSigner::new("server").pubkey;
        let config = config_fn(ClientConfig::new(
            Arc::new(FakeSigner::new("alice")),
            relay.clone(),
            Arc::new(TestEphemeralKeys::new()),
            server_pubkey,
        ));
        let client = NostrClientTransport::new(config);
        let app_rx = client.start().await.unwrap();
        Harness {
            relay,
            client,
            app_rx,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Message>) -> Message {
        time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("receive channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn stateless_handshake_is_emulated_locally() {
        let mut harness =
            start_client(|config| config.with_stateless(true)).await;

        let initialize = Message::Request(Request::new(
            1,
            method::INITIALIZE,
            Some(json!({"clientInfo": {"name": "cli"}})),
        ));
        harness.client.send(initialize).await.unwrap();

        let Message::Response(response) = recv(&mut harness.app_rx).await
        else {
            panic!("expected the emulated initialize response");
        };
        assert_eq!(response.id, cvm_types::RequestId::Number(1));
        match response.payload {
            ResponsePayload::Result { result } => assert_eq!(
                result["serverInfo"]["name"],
                json!("Emulated-Stateless-Server")
            ),
            other => panic!("expected a result, got {other:?}"),
        }
        // Nothing touched the network.
        assert!(harness.relay.published().is_empty());

        // The initialized notification is swallowed.
        let initialized = Message::Notification(Notification::new(
            method::INITIALIZED,
            None,
        ));
        harness.client.send(initialized).await.unwrap();
        assert!(harness.relay.published().is_empty());

        // Everything else still goes over the wire.
        let call = Message::Request(Request::new(
            "r1",
            method::TOOLS_CALL,
            Some(json!({"name": "add"})),
        ));
        harness.client.send(call).await.unwrap();
        assert_eq!(harness.relay.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fails_outstanding_requests() {
        let mut harness = start_client(|config| config).await;

        let call = Message::Request(Request::new(
            "r1",
            method::TOOLS_CALL,
            Some(json!({"name": "add"})),
        ));
        harness.client.send(call).await.unwrap();
        harness.client.stop().await;

        let Message::Response(response) = recv(&mut harness.app_rx).await
        else {
            panic!("expected a synthesized error response");
        };
        assert_eq!(response.id, cvm_types::RequestId::from("r1"));
        match response.payload {
            ResponsePayload::Error { error } =>
                assert_eq!(error.code, TRANSPORT_ERROR_CODE),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let relay = InMemoryRelay::new();
        let client = NostrClientTransport::new(ClientConfig::new(
            Arc::new(FakeSigner::new("alice")),
            relay,
            Arc::new(TestEphemeralKeys::new()),
            "server-pubkey",
        ));
        let err = client
            .send(Message::Request(Request::new(
                1,
                method::TOOLS_CALL,
                None,
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_surfaces_and_clears_the_pending_entry() {
        let mut harness = start_client(|config| config).await;
        harness.relay.set_fail_publishes(true);

        let call = Message::Request(Request::new(
            "r1",
            method::TOOLS_CALL,
            None,
        ));
        let err = harness.client.send(call).await.unwrap_err();
        assert!(matches!(err, TransportError::PublishFailed(_)));

        // The request never made it to the wire, so stop has no
        // outstanding pending entry to fail.
        harness.client.stop().await;
        assert!(
            time::timeout(Duration::from_millis(10), harness.app_rx.recv())
                .await
                .map(|msg| msg.is_none())
                .unwrap_or(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn required_mode_needs_an_encrypting_ephemeral_key() {
        let relay = InMemoryRelay::new();
        let client = NostrClientTransport::new(
            ClientConfig::new(
                Arc::new(FakeSigner::new("alice")),
                relay,
                Arc::new(TestEphemeralKeys::without_encryption()),
                FakeSigner::new("server").pubkey,
            )
            .with_encryption(EncryptionMode::Required),
        );
        let _app_rx = client.start().await.unwrap();

        let err = client
            .send(Message::Request(Request::new(
                "r1",
                method::TOOLS_CALL,
                None,
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EncryptionUnsupported));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_app_messages_are_dropped() {
        let mut harness = start_client(|config| config).await;
        let client_pubkey = harness.client.pubkey().unwrap().to_owned();
        let peer = FakeSigner::new("peer");

        // An event that parses as JSON but not as JSON-RPC.
        let garbage = peer
            .sign_event(EventTemplate::addressed_to(
                kind::APP_MESSAGE,
                &client_pubkey,
                r#"{"hello":"world"}"#.to_owned(),
            ))
            .await
            .unwrap();
        harness.relay.publish(&garbage).await.unwrap();

        // A well-formed notification arriving later is still delivered,
        // proving the pump survived the bad event.
        let notification = Message::Notification(Notification::new(
            "notifications/resources/updated",
            Some(json!({"uri": "file:///x"})),
        ));
        let event = peer
            .sign_event(EventTemplate::addressed_to(
                kind::APP_MESSAGE,
                &client_pubkey,
                notification.to_json(),
            ))
            .await
            .unwrap();
        harness.relay.publish(&event).await.unwrap();

        let received = recv(&mut harness.app_rx).await;
        assert_eq!(
            received.method(),
            Some("notifications/resources/updated")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn uncorrelated_responses_are_dropped() {
        let mut harness = start_client(|config| config).await;
        let client_pubkey = harness.client.pubkey().unwrap().to_owned();
        let peer = FakeSigner::new("peer");

        let stray = Message::Response(Response::result(
            "no-such-event",
            json!({"value": 1}),
        ));
        let mut event_template = EventTemplate::addressed_to(
            kind::APP_MESSAGE,
            &client_pubkey,
            stray.to_json(),
        );
        event_template.tags.push(vec![
            tag::EVENT_REF.to_owned(),
            "unknown-event-id".to_owned(),
        ]);
        let event = peer.sign_event(event_template).await.unwrap();
        harness.relay.publish(&event).await.unwrap();

        assert!(
            time::timeout(Duration::from_millis(50), harness.app_rx.recv())
                .await
                .is_err(),
            "uncorrelated responses must not reach the app layer"
        );
    }
}

//! The Nostr server transport.
//!
//! Terminates inbound events for one server identity, multiplexing any
//! number of client pubkeys over bounded per-peer sessions. Inbound requests
//! have their id replaced by the carrying event id before they reach the app
//! layer, so the eventual response can be routed (and its original id
//! restored) purely through the correlation store. Outbound traffic flows
//! through a single pump, which is what makes the at-most-one-response-
//! per-request guarantee cheap to enforce.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Context;
use cvm_tokio::{NotifyOnce, Task, TaskQueue};
use cvm_types::{
    Event, EventTemplate, Filter, Message, Notification, RequestId,
    Response, kind, tag, unix_time_secs,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::SeenCache;
use crate::correlation::{EventRoute, EventRouteStore};
use crate::error::{TRANSPORT_ERROR_CODE, TransportError};
use crate::middleware::{Forward, InboundContext, InboundMiddleware, Next};
use crate::session::SessionStore;
use crate::traits::{
    AppSessionFactory, EncryptionMode, EphemeralKeyProvider, RelayHandler,
    Signer,
};
use crate::wrap;

const EVENT_ROUTE_CAPACITY: usize = 1000;
const SEEN_CACHE_CAPACITY: usize = 1000;
const DEFAULT_MAX_SESSIONS: usize = 100;

/// Identity advertised in the server-info announcement.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub website: Option<String>,
    pub picture: Option<String>,
    pub about: Option<String>,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            website: None,
            picture: None,
            about: None,
        }
    }
}

/// App-supplied payloads for the list announcements. Unset lists are not
/// announced.
#[derive(Clone, Debug, Default)]
pub struct AnnouncementPayloads {
    pub tools: Option<Value>,
    pub resources: Option<Value>,
    pub resource_templates: Option<Value>,
    pub prompts: Option<Value>,
}

pub struct ServerConfig {
    pub signer: Arc<dyn Signer>,
    pub relay: Arc<dyn RelayHandler>,
    pub ephemeral_keys: Arc<dyn EphemeralKeyProvider>,
    pub session_factory: Arc<dyn AppSessionFactory>,
    pub server_info: ServerInfo,
    pub encryption: EncryptionMode,
    /// Public servers announce themselves (and their lists) at start.
    pub is_public_server: bool,
    pub max_sessions: usize,
    pub announcements: AnnouncementPayloads,
}

impl ServerConfig {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay: Arc<dyn RelayHandler>,
        ephemeral_keys: Arc<dyn EphemeralKeyProvider>,
        session_factory: Arc<dyn AppSessionFactory>,
        server_info: ServerInfo,
    ) -> Self {
        Self {
            signer,
            relay,
            ephemeral_keys,
            session_factory,
            server_info,
            encryption: EncryptionMode::default(),
            is_public_server: true,
            max_sessions: DEFAULT_MAX_SESSIONS,
            announcements: AnnouncementPayloads::default(),
        }
    }

    pub fn with_encryption(mut self, encryption: EncryptionMode) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_public_server(mut self, is_public: bool) -> Self {
        self.is_public_server = is_public;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_announcements(
        mut self,
        announcements: AnnouncementPayloads,
    ) -> Self {
        self.announcements = announcements;
        self
    }
}

/// A message the app layer (or a middleware) wants on the wire.
pub enum Outbound {
    /// Routed through the correlation store: responses restore their
    /// original id, progress notifications resolve their token.
    Message(Message),
    /// A notification explicitly correlated to a request event
    /// (payment flow).
    Correlated {
        client_pubkey: String,
        request_event_id: String,
        notification: Notification,
    },
}

/// The app layer's (weak, by-channel) way back into the transport. Cloning
/// is cheap; handles outlive neither the transport's outbound pump nor its
/// guarantees.
#[derive(Clone)]
pub struct ServerHandle {
    outbound_tx: mpsc::Sender<Outbound>,
}

impl ServerHandle {
    /// Emits a response or progress notification; routing and id
    /// restoration happen inside the transport.
    pub async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.outbound_tx
            .send(Outbound::Message(message))
            .await
            .context("server transport stopped")
    }

    /// Emits a notification correlated to a specific request event.
    pub async fn notify_correlated(
        &self,
        client_pubkey: &str,
        request_event_id: &str,
        notification: Notification,
    ) -> anyhow::Result<()> {
        self.outbound_tx
            .send(Outbound::Correlated {
                client_pubkey: client_pubkey.to_owned(),
                request_event_id: request_event_id.to_owned(),
                notification,
            })
            .await
            .context("server transport stopped")
    }

    /// A handle whose sends go nowhere, for tests that only need the type.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn detached() -> Self {
        Self::loopback().0
    }

    /// A handle paired with the receiving end of its channel, for tests
    /// that assert on what a middleware emits.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn loopback() -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound_tx, outbound_rx) =
            mpsc::channel(crate::DEFAULT_CHANNEL_SIZE);
        (Self { outbound_tx }, outbound_rx)
    }
}

/// See the [module docs](self).
pub struct NostrServerTransport {
    inner: Arc<ServerInner>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    pumps: Mutex<Vec<Task<()>>>,
}

struct ServerInner {
    signer: Arc<dyn Signer>,
    relay: Arc<dyn RelayHandler>,
    ephemeral_keys: Arc<dyn EphemeralKeyProvider>,
    session_factory: Arc<dyn AppSessionFactory>,
    server_info: ServerInfo,
    encryption: EncryptionMode,
    is_public_server: bool,
    announcements: AnnouncementPayloads,

    own_pubkey: OnceLock<String>,
    routes: Mutex<EventRouteStore>,
    caches: Mutex<ServerCaches>,
    sessions: SessionStore,
    middlewares: Mutex<Vec<Arc<dyn InboundMiddleware>>>,
    extra_tags: Mutex<Vec<Vec<String>>>,
    pricing_tags: Mutex<Vec<Vec<String>>>,
    outbound_tx: mpsc::Sender<Outbound>,
    queue: TaskQueue,
    shutdown: NotifyOnce,
    subscription: Mutex<Option<String>>,
    started: AtomicBool,
}

struct ServerCaches {
    seen: SeenCache,
    decrypted: SeenCache,
    /// Per-request-event-id "response already published" markers.
    published: SeenCache,
}

impl NostrServerTransport {
    pub fn new(config: ServerConfig) -> Self {
        let (outbound_tx, outbound_rx) =
            mpsc::channel(crate::DEFAULT_CHANNEL_SIZE);
        let route_cap =
            NonZeroUsize::new(EVENT_ROUTE_CAPACITY).expect("nonzero");
        let seen_cap =
            NonZeroUsize::new(SEEN_CACHE_CAPACITY).expect("nonzero");
        let max_sessions = NonZeroUsize::new(config.max_sessions)
            .expect("max_sessions must be positive");

        Self {
            inner: Arc::new(ServerInner {
                signer: config.signer,
                relay: config.relay,
                ephemeral_keys: config.ephemeral_keys,
                session_factory: config.session_factory,
                server_info: config.server_info,
                encryption: config.encryption,
                is_public_server: config.is_public_server,
                announcements: config.announcements,
                own_pubkey: OnceLock::new(),
                routes: Mutex::new(EventRouteStore::new(route_cap)),
                caches: Mutex::new(ServerCaches {
                    seen: SeenCache::new(seen_cap),
                    decrypted: SeenCache::new(seen_cap),
                    published: SeenCache::new(seen_cap),
                }),
                sessions: SessionStore::new(max_sessions),
                middlewares: Mutex::new(Vec::new()),
                extra_tags: Mutex::new(Vec::new()),
                pricing_tags: Mutex::new(Vec::new()),
                outbound_tx,
                queue: TaskQueue::new(),
                shutdown: NotifyOnce::new(),
                subscription: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// The transport's own pubkey. Available after [`start`](Self::start).
    pub fn pubkey(&self) -> Option<&str> {
        self.inner.own_pubkey.get().map(String::as_str)
    }

    /// A cloneable outbound entry point for app sessions and middleware.
    pub fn handle(&self) -> ServerHandle {
        self.inner.handle()
    }

    /// Number of live client sessions. Never exceeds the configured
    /// maximum.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Manually closes one client's session (initiating its app close
    /// callback) and drops that peer's event routes. Returns whether a
    /// session existed.
    pub fn close_session(&self, client_pubkey: &str) -> bool {
        let closed = self.inner.sessions.close_session(client_pubkey);
        if closed {
            self.inner
                .routes
                .lock()
                .unwrap()
                .remove_routes_for_client(client_pubkey);
        }
        closed
    }

    /// Registers an inbound middleware. Middlewares run in registration
    /// order; register before [`start`](Self::start).
    pub fn add_middleware(&self, middleware: Arc<dyn InboundMiddleware>) {
        self.inner.middlewares.lock().unwrap().push(middleware);
    }

    /// Stores extra tags merged into the next announcement publication,
    /// re-announcing if already started.
    pub fn set_announcement_extra_tags(&self, tags: Vec<Vec<String>>) {
        *self.inner.extra_tags.lock().unwrap() = tags;
        self.inner.schedule_reannounce();
    }

    /// Stores pricing (`pmi` / `cap`) tags merged into the next
    /// announcement publication, re-announcing if already started.
    pub fn set_announcement_pricing_tags(&self, tags: Vec<Vec<String>>) {
        *self.inner.pricing_tags.lock().unwrap() = tags;
        self.inner.schedule_reannounce();
    }

    /// Connects, announces (public servers), subscribes, and spawns the
    /// inbound/outbound pumps.
    pub async fn start(&self) -> Result<(), TransportError> {
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

        let inbound_inner = inner.clone();
        let inbound = Task::spawn("nostr-server-inbound", async move {
            loop {
                tokio::select! {
                    () = inbound_inner.shutdown.recv() => break,
                    maybe_event = events_rx.recv() => match maybe_event {
                        Some(event) => inbound_inner
                            .process_incoming_event(event)
                            .await,
                        None => break,
                    },
                }
            }
            debug!("Server inbound pump finished");
        });

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::NotRunning)?;
        let outbound_inner = inner.clone();
        let outbound = Task::spawn("nostr-server-outbound", async move {
            loop {
                tokio::select! {
                    () = outbound_inner.shutdown.recv() => break,
                    maybe_out = outbound_rx.recv() => match maybe_out {
                        Some(outbound) =>
                            outbound_inner.handle_outbound(outbound).await,
                        None => break,
                    },
                }
            }
            debug!("Server outbound pump finished");
        });
        self.pumps.lock().unwrap().extend([inbound, outbound]);

        if inner.is_public_server {
            inner.publish_announcements().await?;
        }
        inner.started.store(true, Ordering::SeqCst);

        info!("Server transport started as {own_pubkey}");
        Ok(())
    }

    /// Shuts down: stops the pumps, unsubscribes, closes every session,
    /// and clears all correlation state.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.started.store(false, Ordering::SeqCst);
        inner.shutdown.send();
        inner.queue.close();

        let pumps = std::mem::take(&mut *self.pumps.lock().unwrap());
        for pump in pumps {
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

        inner.sessions.close_all().await;
        inner.routes.lock().unwrap().clear();
        let mut caches = inner.caches.lock().unwrap();
        caches.seen.clear();
        caches.decrypted.clear();
        caches.published.clear();
        info!("Server transport stopped");
    }
}

impl ServerInner {
    fn handle(&self) -> ServerHandle {
        ServerHandle {
            outbound_tx: self.outbound_tx.clone(),
        }
    }

    fn schedule_reannounce(&self) {
        if !self.started.load(Ordering::SeqCst) || !self.is_public_server {
            return;
        }
        // Re-announcement is background work; bound its parallelism on the
        // shared queue rather than blocking the caller.
        let relay = self.relay.clone();
        let signer = self.signer.clone();
        let announcement_events = self.announcement_templates();
        self.queue
            .spawn("reannounce", async move {
                for template in announcement_events {
                    let event = match signer.sign_event(template).await {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Failed to sign announcement: {e:#}");
                            continue;
                        }
                    };
                    if let Err(e) = relay.publish(&event).await {
                        warn!("Failed to re-announce: {e:#}");
                    }
                }
            })
            .detach();
    }

    /// Builds the full announcement set with current decorations.
    fn announcement_templates(&self) -> Vec<EventTemplate> {
        let decorations = {
            let mut tags = self.extra_tags.lock().unwrap().clone();
            tags.extend(self.pricing_tags.lock().unwrap().iter().cloned());
            tags
        };

        let mut identity_tags = vec![vec![
            tag::NAME.to_owned(),
            self.server_info.name.clone(),
        ]];
        for (name, value) in [
            (tag::WEBSITE, &self.server_info.website),
            (tag::PICTURE, &self.server_info.picture),
            (tag::ABOUT, &self.server_info.about),
        ] {
            if let Some(value) = value {
                identity_tags.push(vec![name.to_owned(), value.clone()]);
            }
        }
        if self.encryption != EncryptionMode::Disabled {
            identity_tags.push(vec![
                tag::SUPPORT_ENCRYPTION.to_owned(),
                "true".to_owned(),
            ]);
            identity_tags.push(vec![
                tag::SUPPORT_ENCRYPTION_EPHEMERAL.to_owned(),
                "true".to_owned(),
            ]);
        }

        let created_at = unix_time_secs();
        let server_info_content = serde_json::json!({
            "name": self.server_info.name,
            "version": self.server_info.version,
        });
        let mut templates = vec![EventTemplate {
            created_at,
            kind: kind::SERVER_INFO,
            tags: {
                let mut tags = identity_tags;
                tags.extend(decorations.iter().cloned());
                tags
            },
            content: server_info_content.to_string(),
        }];

        for (list_kind, payload) in [
            (kind::TOOLS_LIST, &self.announcements.tools),
            (kind::RESOURCES_LIST, &self.announcements.resources),
            (
                kind::RESOURCE_TEMPLATES_LIST,
                &self.announcements.resource_templates,
            ),
            (kind::PROMPTS_LIST, &self.announcements.prompts),
        ] {
            if let Some(payload) = payload {
                templates.push(EventTemplate {
                    created_at,
                    kind: list_kind,
                    tags: decorations.clone(),
                    content: payload.to_string(),
                });
            }
        }
        templates
    }

    async fn publish_announcements(&self) -> Result<(), TransportError> {
        for template in self.announcement_templates() {
            let event = self.signer.sign_event(template).await?;
            self.relay
                .publish(&event)
                .await
                .map_err(TransportError::PublishFailed)?;
        }
        Ok(())
    }

    async fn process_incoming_event(&self, event: Event) {
        let mut event = event;
        let mut wrap_kind = None;
        loop {
            if !self.caches.lock().unwrap().seen.first_sighting(&event.id) {
                return;
            }
            if !kind::is_gift_wrap(event.kind) {
                break;
            }
            if !self
                .caches
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
                        warn!("Dropping undecryptable wrap: {e:#}");
                        return;
                    }
                };
            wrap_kind = Some(event.kind);
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

        match message {
            Message::Response(_) => {
                debug!("Ignoring inbound response event {id}", id = event.id)
            }
            Message::Request(mut request) => {
                let client_pmis = request.client_pmis();
                let progress_token = request.progress_token();
                let original_id = request.id.clone();
                // The app layer sees the event id as the request id; the
                // route restores the original on the way back out.
                request.id = RequestId::String(event.id.clone());
                self.routes.lock().unwrap().insert(
                    event.id.clone(),
                    EventRoute {
                        client_pubkey: event.pubkey.clone(),
                        original_id,
                        progress_token,
                        wrap_kind,
                    },
                );
                let dispatched = self
                    .dispatch_inbound(
                        &event,
                        wrap_kind,
                        client_pmis,
                        Message::Request(request),
                    )
                    .await;
                if let Err(e) = dispatched {
                    warn!("Inbound request failed: {e:#}");
                    let response = Response::error(
                        RequestId::String(event.id.clone()),
                        TRANSPORT_ERROR_CODE,
                        format!("{e:#}"),
                    );
                    self.handle_outbound(Outbound::Message(
                        Message::Response(response),
                    ))
                    .await;
                }
            }
            Message::Notification(notification) => {
                let dispatched = self
                    .dispatch_inbound(
                        &event,
                        wrap_kind,
                        None,
                        Message::Notification(notification),
                    )
                    .await;
                if let Err(e) = dispatched {
                    warn!("Inbound notification failed: {e:#}");
                }
            }
        }
    }

    /// Session lookup + middleware chain + terminal forward into the app.
    async fn dispatch_inbound(
        &self,
        event: &Event,
        wrap_kind: Option<u16>,
        client_pmis: Option<Vec<String>>,
        message: Message,
    ) -> anyhow::Result<()> {
        let (session, evicted_pubkey) = self
            .sessions
            .get_or_create(
                &event.pubkey,
                wrap_kind.is_none(),
                self.session_factory.as_ref(),
                self.handle(),
            )
            .await
            .context("session factory failed")?;
        if let Some(evicted_pubkey) = evicted_pubkey {
            self.routes
                .lock()
                .unwrap()
                .remove_routes_for_client(&evicted_pubkey);
        }

        let ctx = InboundContext {
            client_pubkey: event.pubkey.clone(),
            client_pmis,
            request_event_id: event.id.clone(),
            server: self.handle(),
        };
        let middlewares = self.middlewares.lock().unwrap().clone();
        let app = session.app.clone();
        let forward: Forward<'_> = &move |message| {
            let app = app.clone();
            Box::pin(async move { app.handle_message(message).await })
        };
        Next::new(&middlewares, forward).run(message, &ctx).await
    }

    async fn handle_outbound(&self, outbound: Outbound) {
        match outbound {
            Outbound::Message(Message::Response(response)) =>
                self.publish_response(response).await,
            Outbound::Message(Message::Notification(notification)) =>
                self.publish_progress(notification).await,
            Outbound::Message(Message::Request(_)) => {
                debug!("Server-initiated requests are unsupported; dropping")
            }
            Outbound::Correlated {
                client_pubkey,
                request_event_id,
                notification,
            } =>
                self.publish_correlated(
                    &client_pubkey,
                    &request_event_id,
                    notification,
                )
                .await,
        }
    }

    async fn publish_response(&self, mut response: Response) {
        let request_event_id = response.id.as_key();
        // At most one response per request event id, even under duplicate
        // sends from the app layer.
        if !self
            .caches
            .lock()
            .unwrap()
            .published
            .first_sighting(&request_event_id)
        {
            debug!(
                "Suppressing duplicate response for {request_event_id}"
            );
            return;
        }

        let route = self.routes.lock().unwrap().get(&request_event_id);
        let route = match route {
            Some(route) => route,
            None => {
                warn!("No route for response id '{request_event_id}'");
                self.caches
                    .lock()
                    .unwrap()
                    .published
                    .forget(&request_event_id);
                return;
            }
        };

        response.id = route.original_id.clone();
        let published = self
            .publish_addressed(
                Message::Response(response),
                &route.client_pubkey,
                &request_event_id,
                route.wrap_kind,
            )
            .await;
        match published {
            Ok(()) => {
                self.routes.lock().unwrap().remove(&request_event_id);
            }
            Err(e) => {
                warn!("Failed to publish response: {e:#}");
                // The response never made it out; allow a retry.
                self.caches
                    .lock()
                    .unwrap()
                    .published
                    .forget(&request_event_id);
            }
        }
    }

    async fn publish_progress(&self, notification: Notification) {
        let token = match notification.progress_token() {
            Some(token) => token,
            None => {
                debug!("Dropping notification without a progress token");
                return;
            }
        };
        let resolved = {
            let mut routes = self.routes.lock().unwrap();
            routes.event_id_for_token(&token).and_then(|event_id| {
                routes.get(&event_id).map(|route| (event_id, route))
            })
        };
        let (request_event_id, route) = match resolved {
            Some(resolved) => resolved,
            None => {
                debug!("No route for progress token '{token}'");
                return;
            }
        };

        // Progress never consumes the route; the response is still coming.
        if let Err(e) = self
            .publish_addressed(
                Message::Notification(notification),
                &route.client_pubkey,
                &request_event_id,
                route.wrap_kind,
            )
            .await
        {
            warn!("Failed to publish progress: {e:#}");
        }
    }

    async fn publish_correlated(
        &self,
        client_pubkey: &str,
        request_event_id: &str,
        notification: Notification,
    ) {
        let wrap_kind = self
            .routes
            .lock()
            .unwrap()
            .get(request_event_id)
            .and_then(|route| route.wrap_kind);
        if let Err(e) = self
            .publish_addressed(
                Message::Notification(notification),
                client_pubkey,
                request_event_id,
                wrap_kind,
            )
            .await
        {
            warn!("Failed to publish correlated notification: {e:#}");
        }
    }

    /// Signs and publishes one app message addressed to `client_pubkey`,
    /// correlated to `request_event_id`, wrapping per the transport mode
    /// and the mode the request arrived in.
    async fn publish_addressed(
        &self,
        message: Message,
        client_pubkey: &str,
        request_event_id: &str,
        inbound_wrap_kind: Option<u16>,
    ) -> Result<(), TransportError> {
        let template = EventTemplate {
            created_at: unix_time_secs(),
            kind: kind::APP_MESSAGE,
            tags: vec![
                vec![tag::RECIPIENT.to_owned(), client_pubkey.to_owned()],
                vec![
                    tag::EVENT_REF.to_owned(),
                    request_event_id.to_owned(),
                ],
            ],
            content: message.to_json(),
        };
        let event = self.signer.sign_event(template).await?;

        let wrap_kind = match (self.encryption, inbound_wrap_kind) {
            // Required always wraps, answering in the arrival kind when
            // there was one.
            (EncryptionMode::Required, inbound) =>
                Some(inbound.unwrap_or(kind::GIFT_WRAP)),
            // Optional answers in the mode the request arrived.
            (EncryptionMode::Optional, inbound) => inbound,
            (EncryptionMode::Disabled, _) => None,
        };

        match wrap_kind {
            Some(wrap_kind) => {
                let plaintext = serde_json::to_string(&event)
                    .expect("Event serialization is infallible");
                let wrapped = wrap::seal(
                    self.ephemeral_keys.as_ref(),
                    client_pubkey,
                    &plaintext,
                    wrap_kind,
                )
                .await?;
                self.relay
                    .publish(&wrapped)
                    .await
                    .map_err(TransportError::PublishFailed)
            }
            None => self
                .relay
                .publish(&event)
                .await
                .map_err(TransportError::PublishFailed),
        }
    }
}

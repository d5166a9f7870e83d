//! Interfaces to the transport's external collaborators.
//!
//! The core depends on no concrete signer, relay pool, or app-protocol
//! implementation; everything crosses one of these seams. Implementations
//! are injected at transport construction and shared via `Arc<dyn _>`.

use std::sync::Arc;

use async_trait::async_trait;
use cvm_types::{Event, EventTemplate, Filter, Message};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::server::ServerHandle;

/// Whether and when payloads are gift-wrapped.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EncryptionMode {
    /// Never wrap.
    Disabled,
    /// Wrap opportunistically: the client upgrades once the server answers
    /// wrapped; the server answers each request in the mode it arrived.
    #[default]
    Optional,
    /// Always wrap; a peer that cannot decrypt gets nothing useful.
    Required,
}

/// Produces the author identity: public key, event signatures, and nip44
/// payload encryption.
///
/// Signing also computes the event's content-hash id. Signers without
/// encryption support return [`TransportError::EncryptionUnsupported`] from
/// the nip44 methods.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn pubkey(&self) -> Result<String, TransportError>;

    async fn sign_event(
        &self,
        template: EventTemplate,
    ) -> Result<Event, TransportError>;

    async fn nip44_encrypt(
        &self,
        peer_pubkey: &str,
        plaintext: &str,
    ) -> Result<String, TransportError>;

    async fn nip44_decrypt(
        &self,
        peer_pubkey: &str,
        ciphertext: &str,
    ) -> Result<String, TransportError>;
}

/// Mints one-shot signers used to author gift wraps. Each wrap is signed by
/// a fresh key so wraps are unlinkable to the sender's long-term identity.
pub trait EphemeralKeyProvider: Send + Sync {
    fn fresh_signer(&self) -> Arc<dyn Signer>;
}

/// A connection to one or more relays.
///
/// `publish` succeeds if any relay accepts the event and fails only when
/// all reject. Subscriptions deliver matching events into the provided
/// channel until unsubscribed; the handler must tolerate concurrent
/// `publish` calls alongside an active subscription.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;

    async fn publish(&self, event: &Event) -> anyhow::Result<()>;

    async fn subscribe(
        &self,
        filters: Vec<Filter>,
        events_tx: mpsc::Sender<Event>,
    ) -> anyhow::Result<String>;

    async fn unsubscribe(&self, subscription_id: &str) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// Per-peer app-layer state held by the server transport's session store.
///
/// Outbound replies do NOT go through this handle: app code answers via the
/// [`ServerHandle`] it received at session creation, which routes through
/// the transport's public send entry point. Keeping the coupling one-way
/// (and by channel rather than by pointer) is what prevents a reference
/// cycle between sessions and the transport.
#[async_trait]
pub trait AppSession: Send + Sync {
    /// The terminal step of the inbound middleware chain.
    async fn handle_message(&self, message: Message) -> anyhow::Result<()>;

    /// Invoked on manual close, LRU eviction, and transport stop.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Builds the app-layer state for a newly seen client pubkey.
#[async_trait]
pub trait AppSessionFactory: Send + Sync {
    async fn create_session(
        &self,
        client_pubkey: &str,
        server: ServerHandle,
    ) -> anyhow::Result<Arc<dyn AppSession>>;
}

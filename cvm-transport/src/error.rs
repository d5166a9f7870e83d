//! Transport error types.

use cvm_types::relay_url::InvalidRelayUrl;
use thiserror::Error;

/// JSON-RPC error code used for error responses synthesized by the
/// transports themselves (evicted pending requests, middleware failures,
/// stop while awaiting).
pub const TRANSPORT_ERROR_CODE: i64 = -32000;

/// Errors surfaced by the transports and their collaborator seams.
///
/// Propagation policy: signer and relay errors bubble to the caller of
/// `send`; schema and correlation failures on the inbound path are logged
/// and dropped by the pumps; cache eviction callbacks never throw out of a
/// cache.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    InvalidRelayUrl(#[from] InvalidRelayUrl),

    /// `publish` failed on every configured relay.
    #[error("publish failed on all relays: {0:#}")]
    PublishFailed(#[source] anyhow::Error),

    /// The message needed encryption but the signer cannot encrypt.
    #[error("signer does not support nip44 encryption")]
    EncryptionUnsupported,

    /// The event kind is not one of the recognized gift-wrap kinds.
    #[error("event kind {0} is not a gift wrap")]
    NotAGiftWrap(u16),

    /// The event content is not a valid JSON-RPC app message.
    #[error("app message failed schema validation: {0}")]
    Schema(#[from] serde_json::Error),

    /// A response or notification could not be tied to any known request.
    #[error("no correlation for message id '{0}'")]
    UnknownCorrelation(String),

    /// The pending request was evicted before its response arrived.
    #[error("pending request evicted before a response arrived")]
    PendingEvicted,

    /// The transport has not been started or was stopped.
    #[error("transport is not running")]
    NotRunning,

    #[error("relay error: {0:#}")]
    Relay(#[source] anyhow::Error),

    #[error("signer error: {0:#}")]
    Signer(#[source] anyhow::Error),
}

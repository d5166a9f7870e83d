//! Wire data model for the ContextVM transport: Nostr-style events and
//! subscription filters, the JSON-RPC 2.0 app-message union, and the protocol
//! constants (event kinds, tag names, notification methods) shared by the
//! client and server transports.

/// Events, templates, filters, kind and tag constants.
pub mod event;
/// JSON-RPC 2.0 requests, responses, notifications, and `_meta` helpers.
pub mod message;
/// Validated relay URL newtype.
pub mod relay_url;

pub use event::{Event, EventTemplate, Filter, kind, tag, unix_time_secs};
pub use message::{
    ErrorObject, Message, Notification, Request, RequestId, Response,
    ResponsePayload, method,
};
pub use relay_url::RelayUrl;

/// The newest app-protocol version this implementation speaks. Used by the
/// stateless initialize emulator and announcement payload builders.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

//! Signed events and subscription filters.
//!
//! The transport treats events as mostly opaque: it only ever inspects the
//! `id`, `pubkey`, `kind`, the single-letter `p`/`e` tags, and `content`.
//! Signing (which also computes the content-hash `id`) lives behind the
//! `Signer` trait in `cvm-transport`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Event kinds used by the transport.
pub mod kind {
    /// Discrete, non-replayable app-protocol request/response/notification.
    pub const APP_MESSAGE: u16 = 25910;
    /// Persistent gift wrap carrying an encrypted inner event.
    pub const GIFT_WRAP: u16 = 1059;
    /// Ephemeral variant of [`GIFT_WRAP`]; same structure, relays don't
    /// retain it.
    pub const EPHEMERAL_GIFT_WRAP: u16 = 21059;

    // Addressable server announcement kinds.
    pub const SERVER_INFO: u16 = 11316;
    pub const TOOLS_LIST: u16 = 11317;
    pub const RESOURCES_LIST: u16 = 11318;
    pub const RESOURCE_TEMPLATES_LIST: u16 = 11319;
    pub const PROMPTS_LIST: u16 = 11320;

    /// Whether `kind` is one of the two recognized gift-wrap kinds.
    pub fn is_gift_wrap(kind: u16) -> bool {
        kind == GIFT_WRAP || kind == EPHEMERAL_GIFT_WRAP
    }
}

/// Tag names used by the transport.
pub mod tag {
    /// Recipient pubkey.
    pub const RECIPIENT: &str = "p";
    /// Correlated request event id.
    pub const EVENT_REF: &str = "e";
    /// Priced capability: `["cap", "<kind>:<name>", "<price>", "<unit>"]`.
    pub const CAP: &str = "cap";
    /// Payment method identifier.
    pub const PMI: &str = "pmi";

    // Announcement metadata tags.
    pub const NAME: &str = "name";
    pub const WEBSITE: &str = "website";
    pub const PICTURE: &str = "picture";
    pub const ABOUT: &str = "about";
    pub const SUPPORT_ENCRYPTION: &str = "support_encryption";
    pub const SUPPORT_ENCRYPTION_EPHEMERAL: &str =
        "support_encryption_ephemeral";
}

/// A signed event: the unit of transport on the relay network.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte content hash, lowercase hex.
    pub id: String,
    /// Author public key, lowercase hex.
    pub pubkey: String,
    /// Unix seconds.
    pub created_at: u64,
    pub kind: u16,
    /// Ordered list of ordered string lists. The first element of each inner
    /// list is the tag name.
    pub tags: Vec<Vec<String>>,
    /// Either JSON app-message text or opaque ciphertext.
    pub content: String,
    pub sig: String,
}

/// The unsigned subset of an [`Event`] handed to a signer, which fills in
/// `pubkey`, computes `id`, and produces `sig`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Event {
    /// The value of the first tag named `name` that carries one, if any.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name =>
                Some(value.as_str()),
            _ => None,
        })
    }

    /// The recipient pubkey (first `p` tag), if any.
    pub fn recipient(&self) -> Option<&str> {
        self.first_tag_value(tag::RECIPIENT)
    }

    /// The correlated request event id (first `e` tag), if any.
    pub fn correlated_event_id(&self) -> Option<&str> {
        self.first_tag_value(tag::EVENT_REF)
    }
}

impl EventTemplate {
    /// A template for an event of `kind` addressed to `recipient`, timestamped
    /// now.
    pub fn addressed_to(
        kind: u16,
        recipient: &str,
        content: String,
    ) -> Self {
        Self {
            created_at: unix_time_secs(),
            kind,
            tags: vec![vec![
                tag::RECIPIENT.to_owned(),
                recipient.to_owned(),
            ]],
            content,
        }
    }
}

/// A relay subscription filter. Only the fields the transport actually
/// subscribes with are modeled.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    /// Recipient pubkeys, i.e. the `#p` tag filter.
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

impl Filter {
    /// The filter both transports subscribe with: app messages and gift wraps
    /// addressed to `pubkey`.
    pub fn inbound_for(pubkey: &str) -> Self {
        Self {
            kinds: Some(vec![
                kind::APP_MESSAGE,
                kind::GIFT_WRAP,
                kind::EPHEMERAL_GIFT_WRAP,
            ]),
            recipients: Some(vec![pubkey.to_owned()]),
            since: None,
        }
    }

    /// Whether `event` matches this filter. Relay-side semantics: unset
    /// fields match everything.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(recipients) = &self.recipients {
            let matched = event.tags.iter().any(|tag| {
                tag.first().is_some_and(|n| n == tag::RECIPIENT)
                    && tag.get(1).is_some_and(|v| recipients.contains(v))
            });
            if !matched {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

/// Current unix time in whole seconds.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is before the unix epoch")
        .as_secs()
}

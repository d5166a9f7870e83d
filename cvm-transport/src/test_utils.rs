//! Deterministic fakes for transport tests: a signer with toy crypto, an
//! ephemeral key mint, and an in-memory relay that routes events between
//! subscribers in-process.
//!
//! The fake "nip44" is structurally faithful — a conversation key symmetric
//! in the two pubkeys, opaque ciphertext, decryption only by the right
//! peer — with none of the actual cryptography, which lives outside this
//! workspace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cvm_types::{Event, EventTemplate, Filter};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::traits::{EphemeralKeyProvider, RelayHandler, Signer};

/// Lowercase-hex SHA-256.
pub fn sha256_hex(input: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest.as_ref() {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
        out.push(char::from_digit((byte & 0xf) as u32, 16).unwrap());
    }
    out
}

/// A deterministic signer: the pubkey is derived from a seed string, event
/// ids are real content hashes (so duplicate content still produces stable,
/// distinct ids across events), and signatures are unverifiable markers.
/// Decrypt calls are counted so tests can pin down the single-decrypt
/// guarantee.
pub struct FakeSigner {
    pub seed: String,
    pub pubkey: String,
    pub decrypt_calls: AtomicU64,
    supports_encryption: bool,
}

impl FakeSigner {
    pub fn new(seed: &str) -> Self {
        Self {
            seed: seed.to_owned(),
            pubkey: sha256_hex(&format!("pubkey:{seed}")),
            decrypt_calls: AtomicU64::new(0),
            supports_encryption: true,
        }
    }

    /// A signer whose nip44 methods fail with the typed capability error.
    pub fn without_encryption(seed: &str) -> Self {
        Self {
            supports_encryption: false,
            ..Self::new(seed)
        }
    }

    pub fn decrypt_call_count(&self) -> u64 {
        self.decrypt_calls.load(Ordering::SeqCst)
    }
}

/// Symmetric in the pair, like a real ECDH conversation key.
fn conversation_key(pubkey_a: &str, pubkey_b: &str) -> String {
    let (lo, hi) = if pubkey_a <= pubkey_b {
        (pubkey_a, pubkey_b)
    } else {
        (pubkey_b, pubkey_a)
    };
    sha256_hex(&format!("conv:{lo}:{hi}"))
}

#[async_trait]
impl Signer for FakeSigner {
    async fn pubkey(&self) -> Result<String, TransportError> {
        Ok(self.pubkey.clone())
    }

    async fn sign_event(
        &self,
        template: EventTemplate,
    ) -> Result<Event, TransportError> {
        // The canonical [0, pubkey, created_at, kind, tags, content] shape.
        let preimage = serde_json::json!([
            0,
            self.pubkey,
            template.created_at,
            template.kind,
            template.tags,
            template.content,
        ]);
        let id = sha256_hex(&preimage.to_string());
        Ok(Event {
            sig: format!("fakesig:{seed}:{id}", seed = self.seed),
            id,
            pubkey: self.pubkey.clone(),
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
        })
    }

    async fn nip44_encrypt(
        &self,
        peer_pubkey: &str,
        plaintext: &str,
    ) -> Result<String, TransportError> {
        if !self.supports_encryption {
            return Err(TransportError::EncryptionUnsupported);
        }
        let envelope = serde_json::json!({
            "conv": conversation_key(&self.pubkey, peer_pubkey),
            "plaintext": plaintext,
        });
        Ok(BASE64.encode(envelope.to_string()))
    }

    async fn nip44_decrypt(
        &self,
        peer_pubkey: &str,
        ciphertext: &str,
    ) -> Result<String, TransportError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_encryption {
            return Err(TransportError::EncryptionUnsupported);
        }
        let decrypt = || -> anyhow::Result<String> {
            let raw = BASE64
                .decode(ciphertext)
                .context("ciphertext is not base64")?;
            let envelope: serde_json::Value = serde_json::from_slice(&raw)
                .context("ciphertext envelope is not JSON")?;
            let conv = envelope["conv"]
                .as_str()
                .context("missing conversation key")?;
            if conv != conversation_key(&self.pubkey, peer_pubkey) {
                return Err(anyhow!("wrong conversation key"));
            }
            envelope["plaintext"]
                .as_str()
                .map(str::to_owned)
                .context("missing plaintext")
        };
        decrypt().map_err(TransportError::Signer)
    }
}

/// Mints `FakeSigner`s with unique counter-derived seeds.
pub struct TestEphemeralKeys {
    counter: AtomicU64,
    supports_encryption: bool,
}

impl TestEphemeralKeys {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            supports_encryption: true,
        }
    }

    pub fn without_encryption() -> Self {
        Self {
            supports_encryption: false,
            ..Self::new()
        }
    }
}

impl EphemeralKeyProvider for TestEphemeralKeys {
    fn fresh_signer(&self) -> Arc<dyn Signer> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let seed = format!("ephemeral-{n}");
        Arc::new(if self.supports_encryption {
            FakeSigner::new(&seed)
        } else {
            FakeSigner::without_encryption(&seed)
        })
    }
}

struct FakeSubscription {
    filters: Vec<Filter>,
    events_tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct RelayState {
    next_subscription: u64,
    subscriptions: HashMap<String, FakeSubscription>,
    published: Vec<Event>,
    fail_all_publishes: bool,
}

/// An in-process relay: `publish` fans events out to every matching
/// subscription and records them for assertions.
#[derive(Default)]
pub struct InMemoryRelay {
    state: Mutex<RelayState>,
}

impl InMemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event published so far, in order. Duplicate publishes of the
    /// same event appear once each.
    pub fn published(&self) -> Vec<Event> {
        self.state.lock().unwrap().published.clone()
    }

    /// How many times an event with this id has been published.
    pub fn publish_count(&self, event_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|ev| ev.id == event_id)
            .count()
    }

    /// Simulates all relays rejecting publishes.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().unwrap().fail_all_publishes = fail;
    }

    /// Delivers an event to matching subscribers *without* recording it,
    /// simulating relay redelivery of an already-stored event.
    pub async fn redeliver(&self, event: &Event) {
        let matching = self.matching_senders(event);
        for tx in matching {
            let _ = tx.send(event.clone()).await;
        }
    }

    fn matching_senders(&self, event: &Event) -> Vec<mpsc::Sender<Event>> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .values()
            .filter(|sub| sub.filters.iter().any(|f| f.matches(event)))
            .map(|sub| sub.events_tx.clone())
            .collect()
    }
}

#[async_trait]
impl RelayHandler for InMemoryRelay {
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        if self.state.lock().unwrap().fail_all_publishes {
            return Err(anyhow!("all relays rejected the event"));
        }
        self.state.lock().unwrap().published.push(event.clone());
        let matching = self.matching_senders(event);
        for tx in matching {
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filters: Vec<Filter>,
        events_tx: mpsc::Sender<Event>,
    ) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_subscription += 1;
        let id = format!("sub-{n}", n = state.next_subscription);
        state.subscriptions.insert(
            id.clone(),
            FakeSubscription { filters, events_tx },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .remove(subscription_id);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

//! Bounded per-peer session store.
//!
//! The server transport multiplexes many client pubkeys over one network
//! identity; each pubkey gets one session holding its app-layer handle.
//! Capacity is fixed: inserting past the bound evicts the single oldest
//! session, whose app handle is closed before the new session is installed.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cvm_tokio::Task;
use cvm_types::unix_time_secs;
use lru::LruCache;
use tracing::{debug, warn};

use crate::server::ServerHandle;
use crate::traits::{AppSession, AppSessionFactory};

/// Per-peer server-side context.
#[derive(Clone)]
pub struct Session {
    pub client_pubkey: String,
    /// Whether the peer has only ever reached us in plaintext.
    pub is_public_client: bool,
    /// Unix seconds.
    pub created_at: u64,
    pub app: Arc<dyn AppSession>,
}

/// Bounded map of client pubkey → [`Session`].
///
/// Close callbacks may be slow; they are *initiated* synchronously with the
/// removal (spawned, then awaited off to the side) so a new session for the
/// same key can never race an un-started close.
pub struct SessionStore {
    sessions: Mutex<LruCache<String, Session>>,
}

/// How long `close_all` waits for app close callbacks on transport stop.
const CLOSE_ALL_TIMEOUT: Duration = Duration::from_secs(5);

impl SessionStore {
    pub fn new(max_sessions: NonZeroUsize) -> Self {
        Self {
            sessions: Mutex::new(LruCache::new(max_sessions)),
        }
    }

    /// Returns the session for `client_pubkey`, creating it through
    /// `factory` on first sight. Creating may evict the oldest session,
    /// closing its app handle first; the evicted pubkey is reported so the
    /// transport can drop that peer's event routes.
    pub async fn get_or_create(
        &self,
        client_pubkey: &str,
        is_public_client: bool,
        factory: &dyn AppSessionFactory,
        server: ServerHandle,
    ) -> anyhow::Result<(Session, Option<String>)> {
        if let Some(session) = self.get(client_pubkey) {
            return Ok((session, None));
        }

        // Not held across the factory await; inbound dispatch is serialized
        // per transport, so no competing create for the same key exists.
        let app = factory.create_session(client_pubkey, server).await?;
        let session = Session {
            client_pubkey: client_pubkey.to_owned(),
            is_public_client,
            created_at: unix_time_secs(),
            app,
        };

        let mut locked = self.sessions.lock().unwrap();
        let mut evicted_pubkey = None;
        if locked.len() == locked.cap().get()
            && !locked.contains(client_pubkey)
        {
            if let Some((evicted_key, evicted)) = locked.pop_lru() {
                debug!("Session bound hit; evicting {evicted_key}");
                spawn_close(evicted);
                evicted_pubkey = Some(evicted_key);
            }
        }
        locked.put(client_pubkey.to_owned(), session.clone());
        Ok((session, evicted_pubkey))
    }

    /// Reads the session and marks it most-recently-used.
    pub fn get(&self, client_pubkey: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(client_pubkey).cloned()
    }

    /// Manually removes one session, closing its app handle.
    pub fn close_session(&self, client_pubkey: &str) -> bool {
        let removed = self.sessions.lock().unwrap().pop(client_pubkey);
        match removed {
            Some(session) => {
                spawn_close(session);
                true
            }
            None => false,
        }
    }

    /// Removes every session and awaits their close callbacks, bounded by
    /// [`CLOSE_ALL_TIMEOUT`]. Used on transport stop.
    pub async fn close_all(&self) {
        let sessions = {
            let mut locked = self.sessions.lock().unwrap();
            let mut drained = Vec::with_capacity(locked.len());
            while let Some((_, session)) = locked.pop_lru() {
                drained.push(session);
            }
            drained
        };
        if sessions.is_empty() {
            return;
        }

        let closes = sessions.into_iter().map(|session| async move {
            if let Err(e) = session.app.close().await {
                warn!(
                    "App session close failed for {pk}: {e:#}",
                    pk = session.client_pubkey,
                );
            }
        });
        let all = futures::future::join_all(closes);
        if tokio::time::timeout(CLOSE_ALL_TIMEOUT, all).await.is_err() {
            warn!("Timed out waiting for app sessions to close");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Initiates an app-session close without blocking the caller.
fn spawn_close(session: Session) {
    let pubkey = session.client_pubkey.clone();
    Task::spawn(format!("close-session-{pubkey}"), async move {
        if let Err(e) = session.app.close().await {
            warn!("App session close failed for {pubkey}: {e:#}");
        }
    })
    .detach();
}

//! Request/response correlation stores.
//!
//! Over the wire, the id of a request is the id of the event that carried
//! it. These stores hold the mapping back to the ids the app layers actually
//! chose, on both ends: the client remembers what it sent, the server
//! remembers where a request came from and what to restore on the way out.

use std::num::NonZeroUsize;

use cvm_types::{RequestId, Response};
use tracing::debug;

use crate::cache::BoundedLruMap;

/// Client-side metadata for a request in flight, keyed by the id of the
/// event it was published under.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    /// The id the app layer used; restored onto the matching response.
    pub original_id: RequestId,
    pub is_initialize: bool,
    /// `params._meta.progressToken`, if the caller asked for progress.
    pub progress_token: Option<String>,
}

/// Bounded store of [`PendingRequest`]s.
pub struct PendingRequestStore {
    pending: BoundedLruMap<PendingRequest>,
}

impl PendingRequestStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            pending: BoundedLruMap::new(capacity),
        }
    }

    /// Registers a request under its published event id. Returns the entry
    /// evicted to make room, if any, so the transport can fail its caller.
    pub fn insert(
        &mut self,
        event_id: String,
        pending: PendingRequest,
    ) -> Option<(String, PendingRequest)> {
        self.pending.insert(event_id, pending)
    }

    /// Matches a response to its pending request: rewrites `response.id`
    /// back to the original id and consumes the entry. Returns whether a
    /// match was found; unmatched responses are the caller's to drop.
    pub fn resolve_response(
        &mut self,
        event_id: &str,
        response: &mut Response,
    ) -> bool {
        match self.pending.remove(event_id) {
            Some(pending) => {
                response.id = pending.original_id;
                true
            }
            None => false,
        }
    }

    /// Reads a pending entry without consuming it (progress pump).
    pub fn get(&self, event_id: &str) -> Option<&PendingRequest> {
        self.pending.peek(event_id)
    }

    /// Removes and returns a pending entry without resolving a response
    /// (used when a publish attempt fails before the event hit the wire).
    pub fn remove(&mut self, event_id: &str) -> Option<PendingRequest> {
        self.pending.remove(event_id)
    }

    /// Finds the pending request carrying `token`, without consuming it.
    /// O(n) over the bound.
    pub fn match_progress_token(
        &self,
        token: &str,
    ) -> Option<&PendingRequest> {
        self.pending
            .entries()
            .find(|(_, p)| p.progress_token.as_deref() == Some(token))
            .map(|(_, p)| p)
    }

    /// Removes and returns every pending entry (transport stop).
    pub fn drain(&mut self) -> Vec<(String, PendingRequest)> {
        let keys = self
            .pending
            .entries()
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|k| {
                let pending = self.pending.remove(&k)?;
                Some((k, pending))
            })
            .collect()
    }
}

/// Server-side record tying an inbound request event to its origin.
#[derive(Clone, Debug)]
pub struct EventRoute {
    pub client_pubkey: String,
    /// The id the client's app layer used; restored onto the response.
    pub original_id: RequestId,
    pub progress_token: Option<String>,
    /// The wrap kind the request arrived under, if it was gift-wrapped.
    /// Responses answer in the same mode.
    pub wrap_kind: Option<u16>,
}

/// Two bounded maps that move together: event id → route, and progress
/// token → event id. Removing a route always drops its token mapping, and
/// LRU eviction of a route cleans the token index in the same step.
pub struct EventRouteStore {
    routes: BoundedLruMap<EventRoute>,
    token_to_event: BoundedLruMap<String>,
}

impl EventRouteStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            routes: BoundedLruMap::new(capacity),
            token_to_event: BoundedLruMap::new(capacity),
        }
    }

    pub fn insert(&mut self, event_id: String, route: EventRoute) {
        if let Some(token) = &route.progress_token {
            self.token_to_event.insert(token.clone(), event_id.clone());
        }
        if let Some((_, evicted)) = self.routes.insert(event_id, route) {
            // Keep the pair of maps consistent under capacity pressure.
            if let Some(token) = &evicted.progress_token {
                self.token_to_event.remove(token);
            }
        }
    }

    pub fn get(&mut self, event_id: &str) -> Option<EventRoute> {
        self.routes.get(event_id).cloned()
    }

    pub fn remove(&mut self, event_id: &str) -> Option<EventRoute> {
        let route = self.routes.remove(event_id)?;
        if let Some(token) = &route.progress_token {
            self.token_to_event.remove(token);
        }
        Some(route)
    }

    pub fn event_id_for_token(&self, token: &str) -> Option<String> {
        self.token_to_event.peek(token).cloned()
    }

    /// Drops every route originating from `client_pubkey` (session
    /// eviction). O(n) over the bound, which is fixed.
    pub fn remove_routes_for_client(&mut self, client_pubkey: &str) -> usize {
        let matching = self
            .routes
            .entries()
            .filter(|(_, route)| route.client_pubkey == client_pubkey)
            .map(|(event_id, _)| event_id.clone())
            .collect::<Vec<_>>();
        let removed = matching.len();
        for event_id in matching {
            self.remove(&event_id);
        }
        if removed > 0 {
            debug!("Dropped {removed} routes for client {client_pubkey}");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.routes.clear();
        self.token_to_event.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

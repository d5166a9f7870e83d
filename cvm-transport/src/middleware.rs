//! Inbound server middleware chain.
//!
//! Registered middleware run in order between event decoding and the app
//! handler; each may complete the message itself (dropping it), fail (the
//! transport answers requests with an error response), or pass it along via
//! [`Next::run`]. The payment middleware in `cvm-payments` is the expected
//! occupant.

use std::sync::Arc;

use async_trait::async_trait;
use cvm_types::Message;
use futures::future::BoxFuture;

use crate::server::ServerHandle;

/// What a middleware knows about the message it is inspecting.
#[derive(Clone)]
pub struct InboundContext {
    pub client_pubkey: String,
    /// The client's advertised payment-method preference, in order.
    pub client_pmis: Option<Vec<String>>,
    /// Id of the event that carried the message; equals the request id the
    /// app layer will observe.
    pub request_event_id: String,
    /// Outbound entry point, e.g. for correlated notifications.
    pub server: ServerHandle,
}

/// The terminal step of the chain: forwards into the app session.
pub type Forward<'a> =
    &'a (dyn Fn(Message) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync);

#[async_trait]
pub trait InboundMiddleware: Send + Sync {
    async fn handle(
        &self,
        message: Message,
        ctx: &InboundContext,
        next: Next<'_>,
    ) -> anyhow::Result<()>;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn InboundMiddleware>],
    forward: Forward<'a>,
}

impl<'a> Next<'a> {
    pub fn new(
        chain: &'a [Arc<dyn InboundMiddleware>],
        forward: Forward<'a>,
    ) -> Self {
        Self {
            rest: chain,
            forward,
        }
    }

    /// Runs the rest of the chain, ending in the terminal forward.
    pub async fn run(
        self,
        message: Message,
        ctx: &InboundContext,
    ) -> anyhow::Result<()> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    rest,
                    forward: self.forward,
                };
                middleware.handle(message, ctx, next).await
            }
            None => (self.forward)(message).await,
        }
    }
}

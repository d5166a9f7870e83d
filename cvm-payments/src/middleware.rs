//! The server-side payment middleware.
//!
//! Sits on the server transport's inbound chain. For a priced request it
//! quotes, invoices, notifies `payment_required`, awaits settlement, then
//! notifies `payment_accepted` and forwards to the app handler. The pending
//! table makes the whole flow idempotent per request event id: duplicates
//! arriving while a payment is in flight await the same shared future and
//! never re-invoice, re-verify, or re-forward.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use cvm_tokio::NotifyOnce;
use cvm_transport::middleware::{InboundContext, InboundMiddleware, Next};
use cvm_transport::server::ServerHandle;
use cvm_types::{Message, Notification, Request, method};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PaymentError;
use crate::tags;
use crate::traits::{
    CreatePaymentParams, PaymentProcessor, PriceRequest, PriceResolver,
    Quote, VerifyPaymentParams,
};
use crate::types::{
    PaymentAcceptedParams, PaymentRejectedParams, PaymentRequiredParams,
    PricedCapability,
};

pub const DEFAULT_PAYMENT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_PENDING_PAYMENTS: usize = 1000;
/// Invoice ttl assumed when the processor doesn't state one.
const DEFAULT_INVOICE_TTL_SECS: u64 = 300;
/// At most this many pending entries are examined for expiry per request;
/// keeps the purge O(1) without a background sweeper.
const PURGE_BATCH: usize = 25;

pub struct PaymentMiddlewareConfig {
    pub processors: Vec<Arc<dyn PaymentProcessor>>,
    pub priced_capabilities: Vec<PricedCapability>,
    pub resolve_price: Option<Arc<dyn PriceResolver>>,
    pub payment_ttl: Duration,
    pub max_pending_payments: usize,
}

impl PaymentMiddlewareConfig {
    pub fn new(
        processors: Vec<Arc<dyn PaymentProcessor>>,
        priced_capabilities: Vec<PricedCapability>,
    ) -> Self {
        Self {
            processors,
            priced_capabilities,
            resolve_price: None,
            payment_ttl: DEFAULT_PAYMENT_TTL,
            max_pending_payments: DEFAULT_MAX_PENDING_PAYMENTS,
        }
    }

    pub fn with_price_resolver(
        mut self,
        resolver: Arc<dyn PriceResolver>,
    ) -> Self {
        self.resolve_price = Some(resolver);
        self
    }

    pub fn with_payment_ttl(mut self, payment_ttl: Duration) -> Self {
        self.payment_ttl = payment_ttl;
        self
    }

    pub fn with_max_pending_payments(mut self, max: usize) -> Self {
        self.max_pending_payments = max;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PaymentOutcome {
    Settled,
    Rejected,
}

type SharedPaymentResult = Result<PaymentOutcome, Arc<anyhow::Error>>;
type InFlight = Shared<BoxFuture<'static, SharedPaymentResult>>;

struct PendingPayment {
    expires_at: Instant,
    in_flight: InFlight,
}

/// See the [module docs](self).
pub struct PaymentMiddleware {
    processors: Vec<Arc<dyn PaymentProcessor>>,
    priced_capabilities: Vec<PricedCapability>,
    resolve_price: Option<Arc<dyn PriceResolver>>,
    payment_ttl: Duration,
    max_pending_payments: usize,
    pending: Arc<Mutex<HashMap<String, PendingPayment>>>,
}

impl PaymentMiddleware {
    pub fn new(config: PaymentMiddlewareConfig) -> Self {
        Self {
            processors: config.processors,
            priced_capabilities: config.priced_capabilities,
            resolve_price: config.resolve_price,
            payment_ttl: config.payment_ttl,
            max_pending_payments: config.max_pending_payments,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The `pmi` + `cap` tags this configuration should announce; hand to
    /// `NostrServerTransport::set_announcement_pricing_tags`.
    pub fn announcement_tags(&self) -> Vec<Vec<String>> {
        let mut tags = tags::pmi_tags_from_processors(&self.processors);
        tags.extend(tags::cap_tags_from_priced_capabilities(
            &self.priced_capabilities,
        ));
        tags
    }

    /// Server preference order, bumped by the client's advertised pmis.
    fn select_processor(
        &self,
        client_pmis: Option<&[String]>,
    ) -> Option<Arc<dyn PaymentProcessor>> {
        if let Some(pmis) = client_pmis {
            if let Some(preferred) = self
                .processors
                .iter()
                .find(|processor| pmis.iter().any(|p| p == processor.pmi()))
            {
                return Some(preferred.clone());
            }
        }
        self.processors.first().cloned()
    }
}

#[async_trait]
impl InboundMiddleware for PaymentMiddleware {
    async fn handle(
        &self,
        message: Message,
        ctx: &InboundContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let request = match &message {
            Message::Request(request) => request,
            _ => return next.run(message, ctx).await,
        };
        let capability = match self
            .priced_capabilities
            .iter()
            .find(|capability| capability.matches(request))
        {
            Some(capability) => capability.clone(),
            None => return next.run(message, ctx).await,
        };

        let request_event_id = ctx.request_event_id.clone();
        enum Role {
            Primary(InFlight),
            Piggyback(InFlight),
        }
        let role = {
            let mut pending = self.pending.lock().unwrap();
            let now = Instant::now();
            purge_expired(&mut pending, now);

            match pending.get(&request_event_id) {
                Some(entry) if entry.expires_at > now =>
                    Role::Piggyback(entry.in_flight.clone()),
                _ => {
                    let processor = self
                        .select_processor(ctx.client_pmis.as_deref())
                        .ok_or(PaymentError::NoProcessors)?;
                    let flow = run_payment_flow(
                        processor,
                        self.resolve_price.clone(),
                        capability,
                        request.clone(),
                        ctx.client_pubkey.clone(),
                        request_event_id.clone(),
                        ctx.server.clone(),
                        self.payment_ttl,
                        self.pending.clone(),
                    )
                    .boxed()
                    .shared();

                    if pending.len() >= self.max_pending_payments {
                        evict_soonest_expiring(&mut pending);
                    }
                    // Inserted before any await so a duplicate observing
                    // the table always finds this entry.
                    pending.insert(
                        request_event_id.clone(),
                        PendingPayment {
                            expires_at: now + self.payment_ttl,
                            in_flight: flow.clone(),
                        },
                    );
                    Role::Primary(flow)
                }
            }
        };

        match role {
            Role::Piggyback(in_flight) => {
                debug!(
                    "Duplicate priced request {request_event_id}; awaiting \
                     the in-flight payment"
                );
                // The primary invocation forwards (or errors); duplicates
                // only share its fate.
                match in_flight.await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(anyhow!("payment failed: {e:#}")),
                }
            }
            Role::Primary(in_flight) => match in_flight.await {
                Ok(PaymentOutcome::Settled) => next.run(message, ctx).await,
                Ok(PaymentOutcome::Rejected) => Ok(()),
                Err(e) => Err(anyhow!("payment failed: {e:#}")),
            },
        }
    }
}

fn purge_expired(
    pending: &mut HashMap<String, PendingPayment>,
    now: Instant,
) {
    let expired = pending
        .iter()
        .take(PURGE_BATCH)
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .collect::<Vec<_>>();
    for key in expired {
        pending.remove(&key);
    }
}

fn evict_soonest_expiring(pending: &mut HashMap<String, PendingPayment>) {
    let soonest = pending
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = soonest {
        warn!("Pending payment bound exceeded; dropping entry {key}");
        pending.remove(&key);
    }
}

/// `{..invoice_meta, ..quote_meta}`: the quote wins on overlap.
fn merge_meta(
    invoice_meta: Option<Value>,
    quote_meta: Option<Value>,
) -> Option<Value> {
    match (invoice_meta, quote_meta) {
        (None, None) => None,
        (Some(meta), None) | (None, Some(meta)) => Some(meta),
        (Some(Value::Object(mut base)), Some(Value::Object(overlay))) => {
            base.extend(overlay);
            Some(Value::Object(base))
        }
        // Non-object metas can't merge field-wise.
        (_, Some(quote_meta)) => Some(quote_meta),
    }
}

async fn notify<T: Serialize>(
    server: &ServerHandle,
    client_pubkey: &str,
    request_event_id: &str,
    method_name: &str,
    params: &T,
) -> anyhow::Result<()> {
    let params = serde_json::to_value(params)
        .context("failed to serialize payment notification params")?;
    server
        .notify_correlated(
            client_pubkey,
            request_event_id,
            Notification::new(method_name, Some(params)),
        )
        .await
}

/// The full payment lifecycle for one request event id. Exactly one of
/// these runs per pending entry; its result is shared with duplicates. The
/// pending entry is removed whichever way this resolves.
#[allow(clippy::too_many_arguments)]
async fn run_payment_flow(
    processor: Arc<dyn PaymentProcessor>,
    resolve_price: Option<Arc<dyn PriceResolver>>,
    capability: PricedCapability,
    request: Request,
    client_pubkey: String,
    request_event_id: String,
    server: ServerHandle,
    payment_ttl: Duration,
    pending: Arc<Mutex<HashMap<String, PendingPayment>>>,
) -> SharedPaymentResult {
    let flow = async {
        // Quote.
        let (amount, description, quote_meta) = match &resolve_price {
            Some(resolver) => {
                let quote = resolver
                    .resolve_price(PriceRequest {
                        capability: &capability,
                        request: &request,
                        client_pubkey: &client_pubkey,
                        request_event_id: &request_event_id,
                    })
                    .await
                    .context("price resolver failed")?;
                match quote {
                    Quote::Reject { message } => {
                        let rejected = PaymentRejectedParams {
                            pmi: processor.pmi().to_owned(),
                            amount: Some(capability.amount),
                            message,
                        };
                        notify(
                            &server,
                            &client_pubkey,
                            &request_event_id,
                            method::PAYMENT_REJECTED,
                            &rejected,
                        )
                        .await?;
                        return Ok(PaymentOutcome::Rejected);
                    }
                    Quote::Price {
                        amount,
                        description,
                        meta,
                    } => (
                        amount,
                        description
                            .or_else(|| capability.description.clone()),
                        meta,
                    ),
                }
            }
            None =>
                (capability.amount, capability.description.clone(), None),
        };

        // Invoice.
        let invoice = processor
            .create_payment_required(CreatePaymentParams {
                amount,
                description,
                request_event_id: request_event_id.clone(),
                client_pubkey: client_pubkey.clone(),
            })
            .await
            .context("create_payment_required failed")?;

        let required = PaymentRequiredParams {
            meta: merge_meta(invoice.meta.clone(), quote_meta),
            ..invoice.clone()
        };
        notify(
            &server,
            &client_pubkey,
            &request_event_id,
            method::PAYMENT_REQUIRED,
            &required,
        )
        .await?;

        // Settlement, bounded by the invoice ttl and the configured cap.
        let invoice_ttl = Duration::from_secs(
            invoice.ttl.unwrap_or(DEFAULT_INVOICE_TTL_SECS),
        );
        let bound = invoice_ttl.min(payment_ttl);
        let abort = NotifyOnce::new();
        let verify = processor.verify_payment(VerifyPaymentParams {
            pay_req: invoice.pay_req.clone(),
            request_event_id: request_event_id.clone(),
            client_pubkey: client_pubkey.clone(),
            abort: abort.clone(),
        });
        let verified = match tokio::time::timeout(bound, verify).await {
            Err(_elapsed) => {
                abort.send();
                return Err(PaymentError::VerifyTimeout.into());
            }
            Ok(result) => result.map_err(PaymentError::Processor)?,
        };

        let accepted = PaymentAcceptedParams {
            amount: invoice.amount,
            pmi: invoice.pmi.clone(),
            meta: verified.meta,
        };
        notify(
            &server,
            &client_pubkey,
            &request_event_id,
            method::PAYMENT_ACCEPTED,
            &accepted,
        )
        .await?;
        Ok(PaymentOutcome::Settled)
    };

    let result: anyhow::Result<PaymentOutcome> = flow.await;
    pending.lock().unwrap().remove(&request_event_id);
    result.map_err(Arc::new)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cvm_transport::middleware::Forward;
    use cvm_transport::server::{
        NostrServerTransport, Outbound, ServerConfig, ServerInfo,
    };
    use cvm_transport::test_utils::{
        FakeSigner, InMemoryRelay, TestEphemeralKeys,
    };
    use cvm_transport::client::{ClientConfig, NostrClientTransport};
    use cvm_transport::traits::{AppSession, AppSessionFactory};
    use cvm_types::{RequestId, Response, ResponsePayload};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time;

    use super::*;
    use crate::traits::PaymentVerified;

    struct FakeProcessor {
        pmi: &'static str,
        /// `None` = never settles; verification waits on the abort signal.
        settle_after: Option<Duration>,
        ttl: Option<u64>,
        invoice_meta: Option<Value>,
        created: AtomicUsize,
        verified: AtomicUsize,
        seen_abort: Mutex<Option<NotifyOnce>>,
    }

    impl FakeProcessor {
        fn settling(after: Duration) -> Arc<Self> {
            Arc::new(Self {
                pmi: "fake",
                settle_after: Some(after),
                ttl: None,
                invoice_meta: None,
                created: AtomicUsize::new(0),
                verified: AtomicUsize::new(0),
                seen_abort: Mutex::new(None),
            })
        }

        fn never_settling() -> Arc<Self> {
            Arc::new(Self {
                pmi: "fake",
                settle_after: None,
                ttl: None,
                invoice_meta: None,
                created: AtomicUsize::new(0),
                verified: AtomicUsize::new(0),
                seen_abort: Mutex::new(None),
            })
        }

        fn created_count(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn verified_count(&self) -> usize {
            self.verified.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PaymentProcessor for FakeProcessor {
        fn pmi(&self) -> &str {
            self.pmi
        }

        async fn create_payment_required(
            &self,
            params: CreatePaymentParams,
        ) -> anyhow::Result<PaymentRequiredParams> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentRequiredParams {
                amount: params.amount,
                pay_req: format!("fake:{}", params.request_event_id),
                pmi: self.pmi.to_owned(),
                description: params.description,
                ttl: self.ttl,
                meta: self.invoice_meta.clone(),
            })
        }

        async fn verify_payment(
            &self,
            params: VerifyPaymentParams,
        ) -> anyhow::Result<PaymentVerified> {
            self.verified.fetch_add(1, Ordering::SeqCst);
            *self.seen_abort.lock().unwrap() = Some(params.abort.clone());
            match self.settle_after {
                Some(delay) => {
                    time::sleep(delay).await;
                    Ok(PaymentVerified { meta: None })
                }
                None => {
                    params.abort.recv().await;
                    anyhow::bail!("verification aborted")
                }
            }
        }
    }

    fn middleware(
        processor: Arc<FakeProcessor>,
    ) -> (PaymentMiddleware, Vec<PricedCapability>) {
        let priced = vec![PricedCapability::new(
            method::TOOLS_CALL,
            Some("add"),
            1,
            "sats",
        )];
        let mw = PaymentMiddleware::new(PaymentMiddlewareConfig::new(
            vec![processor],
            priced.clone(),
        ));
        (mw, priced)
    }

    fn priced_add_request(event_id: &str) -> Message {
        // The server transport has already substituted the event id in as
        // the request id by the time a middleware sees the message.
        Message::Request(Request::new(
            event_id,
            method::TOOLS_CALL,
            Some(json!({"name": "add", "arguments": {"a": 1, "b": 2}})),
        ))
    }

    fn ctx(server: ServerHandle, event_id: &str) -> InboundContext {
        InboundContext {
            client_pubkey: "client-pk".to_owned(),
            client_pmis: None,
            request_event_id: event_id.to_owned(),
            server,
        }
    }

    /// Drains every outbound notification currently queued on the loopback
    /// receiver, returning (method, params) pairs.
    fn drain_notifications(
        rx: &mut mpsc::Receiver<Outbound>,
    ) -> Vec<(String, Value)> {
        let mut notifications = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Correlated { notification, .. } = outbound {
                notifications.push((
                    notification.method.clone(),
                    notification.params.unwrap_or(Value::Null),
                ));
            }
        }
        notifications
    }

    #[tokio::test(start_paused = true)]
    async fn unpriced_traffic_forwards_untouched() {
        let processor = FakeProcessor::settling(Duration::from_millis(10));
        let (mw, _) = middleware(processor.clone());
        let (handle, mut rx) = ServerHandle::loopback();

        let forwarded = Arc::new(AtomicUsize::new(0));
        let fwd = forwarded.clone();
        let forward: Forward<'_> = &move |_msg| {
            let fwd = fwd.clone();
            Box::pin(async move {
                fwd.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        // Same method, different tool name: not priced.
        let unpriced = Message::Request(Request::new(
            "ev1",
            method::TOOLS_CALL,
            Some(json!({"name": "sub"})),
        ));
        mw.handle(unpriced, &ctx(handle.clone(), "ev1"), Next::new(&[], forward))
            .await
            .unwrap();
        // Notifications are never priced.
        let notification = Message::Notification(Notification::new(
            method::INITIALIZED,
            None,
        ));
        mw.handle(
            notification,
            &ctx(handle, "ev2"),
            Next::new(&[], forward),
        )
        .await
        .unwrap();

        assert_eq!(forwarded.load(Ordering::SeqCst), 2);
        assert_eq!(processor.created_count(), 0);
        assert!(drain_notifications(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_piggyback_and_charge_once() {
        let processor = FakeProcessor::settling(Duration::from_millis(50));
        let (mw, _) = middleware(processor.clone());
        let (handle, mut rx) = ServerHandle::loopback();

        let forwarded = Arc::new(AtomicUsize::new(0));
        let fwd_a = forwarded.clone();
        let forward_a: Forward<'_> = &move |_msg| {
            let fwd = fwd_a.clone();
            Box::pin(async move {
                fwd.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let fwd_b = forwarded.clone();
        let forward_b: Forward<'_> = &move |_msg| {
            let fwd = fwd_b.clone();
            Box::pin(async move {
                fwd.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let ctx_a = ctx(handle.clone(), "ev1");
        let ctx_b = ctx(handle, "ev1");
        let (first, second) = tokio::join!(
            mw.handle(
                priced_add_request("ev1"),
                &ctx_a,
                Next::new(&[], forward_a),
            ),
            mw.handle(
                priced_add_request("ev1"),
                &ctx_b,
                Next::new(&[], forward_b),
            ),
        );
        first.unwrap();
        second.unwrap();

        // One invoice, one verification, one forward; the duplicate only
        // waited.
        assert_eq!(processor.created_count(), 1);
        assert_eq!(processor.verified_count(), 1);
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);

        let methods = drain_notifications(&mut rx)
            .into_iter()
            .map(|(method, _)| method)
            .collect::<Vec<_>>();
        assert_eq!(
            methods,
            vec![
                method::PAYMENT_REQUIRED.to_owned(),
                method::PAYMENT_ACCEPTED.to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_rejection_skips_invoice_and_forward() {
        struct QuotaResolver;

        #[async_trait]
        impl PriceResolver for QuotaResolver {
            async fn resolve_price(
                &self,
                _request: PriceRequest<'_>,
            ) -> anyhow::Result<Quote> {
                Ok(Quote::Reject {
                    message: Some("quota exceeded".to_owned()),
                })
            }
        }

        let processor = FakeProcessor::settling(Duration::from_millis(10));
        let priced = vec![PricedCapability::new(
            method::TOOLS_CALL,
            Some("add"),
            1,
            "sats",
        )];
        let mw = PaymentMiddleware::new(
            PaymentMiddlewareConfig::new(vec![processor.clone()], priced)
                .with_price_resolver(Arc::new(QuotaResolver)),
        );
        let (handle, mut rx) = ServerHandle::loopback();

        let forwarded = Arc::new(AtomicUsize::new(0));
        let fwd = forwarded.clone();
        let forward: Forward<'_> = &move |_msg| {
            let fwd = fwd.clone();
            Box::pin(async move {
                fwd.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        mw.handle(
            priced_add_request("ev1"),
            &ctx(handle, "ev1"),
            Next::new(&[], forward),
        )
        .await
        .unwrap();

        assert_eq!(processor.created_count(), 0);
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);

        let notifications = drain_notifications(&mut rx);
        assert_eq!(notifications.len(), 1);
        let (method_name, params) = &notifications[0];
        assert_eq!(method_name, method::PAYMENT_REJECTED);
        assert_eq!(params["pmi"], json!("fake"));
        assert_eq!(params["amount"], json!(1));
        assert_eq!(params["message"], json!("quota exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn verify_timeout_aborts_and_surfaces_an_error() {
        let processor = FakeProcessor::never_settling();
        let priced = vec![PricedCapability::new(
            method::TOOLS_CALL,
            Some("add"),
            1,
            "sats",
        )];
        let mw = PaymentMiddleware::new(
            PaymentMiddlewareConfig::new(
                vec![processor.clone()],
                priced,
            )
            .with_payment_ttl(Duration::from_millis(100)),
        );
        let (handle, mut rx) = ServerHandle::loopback();

        let forwarded = Arc::new(AtomicUsize::new(0));
        let fwd = forwarded.clone();
        let forward: Forward<'_> = &move |_msg| {
            let fwd = fwd.clone();
            Box::pin(async move {
                fwd.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let err = mw
            .handle(
                priced_add_request("ev1"),
                &ctx(handle, "ev1"),
                Next::new(&[], forward),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("payment failed"));
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);

        // The abort signal fired, and the pending entry is gone.
        let abort = processor.seen_abort.lock().unwrap().clone().unwrap();
        assert!(abort.is_sent());
        assert!(mw.pending.lock().unwrap().is_empty());

        // Only the payment_required notification went out.
        let methods = drain_notifications(&mut rx)
            .into_iter()
            .map(|(method, _)| method)
            .collect::<Vec<_>>();
        assert_eq!(methods, vec![method::PAYMENT_REQUIRED.to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn quote_meta_wins_over_invoice_meta() {
        assert_eq!(
            merge_meta(
                Some(json!({"a": 1, "b": 2})),
                Some(json!({"b": 20, "c": 3})),
            ),
            Some(json!({"a": 1, "b": 20, "c": 3}))
        );
        assert_eq!(merge_meta(Some(json!({"a": 1})), None), Some(json!({"a": 1})));
        assert_eq!(merge_meta(None, None), None);
    }

    // --- Full-stack scenarios --- //

    struct AddSession {
        server: ServerHandle,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AppSession for AddSession {
        async fn handle_message(
            &self,
            message: Message,
        ) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if let Message::Request(request) = message {
                let args = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                let response =
                    Response::result(request.id, json!({"value": a + b}));
                self.server.send(Message::Response(response)).await?;
            }
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AddFactory {
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AppSessionFactory for AddFactory {
        async fn create_session(
            &self,
            _client_pubkey: &str,
            server: ServerHandle,
        ) -> anyhow::Result<Arc<dyn AppSession>> {
            Ok(Arc::new(AddSession {
                server,
                handled: self.handled.clone(),
            }))
        }
    }

    struct Stack {
        client: NostrClientTransport,
        app_rx: mpsc::Receiver<Message>,
        handled: Arc<AtomicUsize>,
        _server: NostrServerTransport,
    }

    async fn start_paid_stack(
        mw: PaymentMiddleware,
        pricing_tags: Vec<Vec<String>>,
    ) -> Stack {
        cvm_logger::init_for_testing();
        let relay = InMemoryRelay::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let server_signer = Arc::new(FakeSigner::new("server"));
        let server_pubkey = server_signer.pubkey.clone();
        let server = NostrServerTransport::new(ServerConfig::new(
            server_signer,
            relay.clone(),
            Arc::new(TestEphemeralKeys::new()),
            Arc::new(AddFactory {
                handled: handled.clone(),
            }),
            ServerInfo::new("paid-server", "0.1.0"),
        ));
        server.set_announcement_pricing_tags(pricing_tags);
        server.add_middleware(Arc::new(mw));
        server.start().await.unwrap();

        let client = NostrClientTransport::new(ClientConfig::new(
            Arc::new(FakeSigner::new("alice")),
            relay,
            Arc::new(TestEphemeralKeys::new()),
            server_pubkey,
        ));
        let app_rx = client.start().await.unwrap();
        Stack {
            client,
            app_rx,
            handled,
            _server: server,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Message>) -> Message {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("receive channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn paid_tool_call_required_then_accepted_then_result() {
        let processor = FakeProcessor::settling(Duration::from_millis(50));
        let (mw, _) = middleware(processor.clone());
        let pricing_tags = mw.announcement_tags();
        let mut stack = start_paid_stack(mw, pricing_tags).await;

        stack
            .client
            .send(priced_add_request("r1"))
            .await
            .unwrap();

        let Message::Notification(required) = recv(&mut stack.app_rx).await
        else {
            panic!("expected payment_required first");
        };
        assert_eq!(required.method, method::PAYMENT_REQUIRED);
        let params = required.params.unwrap();
        assert_eq!(params["amount"], json!(1));
        assert!(
            params["pay_req"]
                .as_str()
                .is_some_and(|pay_req| pay_req.starts_with("fake:"))
        );

        let Message::Notification(accepted) = recv(&mut stack.app_rx).await
        else {
            panic!("expected payment_accepted second");
        };
        assert_eq!(accepted.method, method::PAYMENT_ACCEPTED);
        assert_eq!(accepted.params.unwrap()["amount"], json!(1));

        let Message::Response(response) = recv(&mut stack.app_rx).await
        else {
            panic!("expected the tool result last");
        };
        assert_eq!(response.id, RequestId::from("r1"));
        match response.payload {
            ResponsePayload::Result { result } =>
                assert_eq!(result, json!({"value": 3})),
            other => panic!("expected a result, got {other:?}"),
        }

        assert_eq!(stack.handled.load(Ordering::SeqCst), 1);
        assert_eq!(processor.created_count(), 1);
        assert_eq!(processor.verified_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_quote_reaches_the_client() {
        struct QuotaResolver;

        #[async_trait]
        impl PriceResolver for QuotaResolver {
            async fn resolve_price(
                &self,
                _request: PriceRequest<'_>,
            ) -> anyhow::Result<Quote> {
                Ok(Quote::Reject {
                    message: Some("quota exceeded".to_owned()),
                })
            }
        }

        let processor = FakeProcessor::settling(Duration::from_millis(10));
        let priced = vec![PricedCapability::new(
            method::TOOLS_CALL,
            Some("add"),
            1,
            "sats",
        )];
        let mw = PaymentMiddleware::new(
            PaymentMiddlewareConfig::new(
                vec![processor.clone()],
                priced,
            )
            .with_price_resolver(Arc::new(QuotaResolver)),
        );
        let mut stack = start_paid_stack(mw, Vec::new()).await;

        stack
            .client
            .send(priced_add_request("r1"))
            .await
            .unwrap();

        let Message::Notification(rejected) = recv(&mut stack.app_rx).await
        else {
            panic!("expected payment_rejected");
        };
        assert_eq!(rejected.method, method::PAYMENT_REJECTED);
        let params = rejected.params.unwrap();
        assert_eq!(params["pmi"], json!("fake"));
        assert_eq!(params["amount"], json!(1));
        assert_eq!(params["message"], json!("quota exceeded"));

        // No invoice, no app invocation, and nothing further on the wire.
        assert_eq!(processor.created_count(), 0);
        assert_eq!(stack.handled.load(Ordering::SeqCst), 0);
        assert!(
            time::timeout(Duration::from_millis(100), stack.app_rx.recv())
                .await
                .is_err()
        );
    }
}

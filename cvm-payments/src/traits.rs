//! Payment collaborator seams.
//!
//! Concrete backends (Lightning invoice issuance, balance checks, external
//! quoting services) live outside this workspace; the middleware only sees
//! these traits.

use async_trait::async_trait;
use cvm_tokio::NotifyOnce;
use cvm_types::Request;
use serde_json::Value;

use crate::types::{PaymentRequiredParams, PricedCapability};

pub struct CreatePaymentParams {
    pub amount: u64,
    pub description: Option<String>,
    pub request_event_id: String,
    pub client_pubkey: String,
}

pub struct VerifyPaymentParams {
    pub pay_req: String,
    pub request_event_id: String,
    pub client_pubkey: String,
    /// Fired when the middleware gives up (timeout, transport stop);
    /// verifiers must stop polling when it does.
    pub abort: NotifyOnce,
}

pub struct PaymentVerified {
    pub meta: Option<Value>,
}

/// Server-side invoice issuance and settlement verification for one payment
/// method. `verify_payment` resolving implies the invoice settled.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Payment method identifier, e.g. `bitcoin-lightning-bolt11`.
    fn pmi(&self) -> &str;

    async fn create_payment_required(
        &self,
        params: CreatePaymentParams,
    ) -> anyhow::Result<PaymentRequiredParams>;

    async fn verify_payment(
        &self,
        params: VerifyPaymentParams,
    ) -> anyhow::Result<PaymentVerified>;
}

/// What a client-side handler is asked to pay.
pub struct PaymentRequest {
    pub amount: u64,
    pub pay_req: String,
    pub pmi: String,
    pub description: Option<String>,
    pub request_event_id: String,
}

/// Client-side settlement of one payment method. `handle` resolving implies
/// the payment was attempted.
#[async_trait]
pub trait PaymentHandler: Send + Sync {
    fn pmi(&self) -> &str;

    async fn handle(&self, request: PaymentRequest) -> anyhow::Result<()>;
}

pub struct PriceRequest<'a> {
    pub capability: &'a PricedCapability,
    pub request: &'a Request,
    pub client_pubkey: &'a str,
    pub request_event_id: &'a str,
}

/// A dynamic quote for one priced request.
pub enum Quote {
    Price {
        amount: u64,
        description: Option<String>,
        meta: Option<Value>,
    },
    Reject {
        message: Option<String>,
    },
}

/// Per-request pricing hook; when absent the capability's static price is
/// used.
#[async_trait]
pub trait PriceResolver: Send + Sync {
    async fn resolve_price(
        &self,
        request: PriceRequest<'_>,
    ) -> anyhow::Result<Quote>;
}

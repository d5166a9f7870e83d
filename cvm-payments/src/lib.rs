//! Payment gating for the ContextVM server transport.
//!
//! [`PaymentMiddleware`] interposes between incoming requests and the app
//! handler: priced requests trigger a `payment_required` notification, the
//! middleware awaits settlement through a pluggable [`PaymentProcessor`],
//! and only verified requests reach the app. Duplicate request events
//! piggy-back on the in-flight payment, so processors are never invoked
//! twice for one request.

/// Payment error types.
pub mod error;
/// Client-side dispatch of `payment_required` notifications.
pub mod handler;
/// The server-side payment middleware.
pub mod middleware;
/// `pmi` / `cap` announcement tag assembly.
pub mod tags;
/// Processor / handler / price-resolver seams.
pub mod traits;
/// Priced capabilities and payment notification payloads.
pub mod types;

pub use error::PaymentError;
pub use handler::dispatch_payment_required;
pub use middleware::{PaymentMiddleware, PaymentMiddlewareConfig};
pub use tags::{cap_tags_from_priced_capabilities, pmi_tags_from_processors};
pub use traits::{
    CreatePaymentParams, PaymentHandler, PaymentProcessor, PaymentRequest,
    PaymentVerified, PriceRequest, PriceResolver, Quote, VerifyPaymentParams,
};
pub use types::{
    PaymentAcceptedParams, PaymentRejectedParams, PaymentRequiredParams,
    PricedCapability,
};

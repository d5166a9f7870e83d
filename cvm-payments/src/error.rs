//! Payment error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    /// A priced capability matched but no processor is configured.
    #[error("no payment processors configured")]
    NoProcessors,

    /// No client-side handler recognizes the invoice's payment method.
    #[error("no payment handler for pmi '{0}'")]
    NoHandlerForPmi(String),

    /// Settlement was not verified within the allowed window.
    #[error("payment verification timed out")]
    VerifyTimeout,

    #[error("payment processor error: {0:#}")]
    Processor(#[source] anyhow::Error),

    #[error("payment handler error: {0:#}")]
    Handler(#[source] anyhow::Error),
}

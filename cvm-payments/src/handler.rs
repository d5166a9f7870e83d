//! Client-side dispatch of `payment_required` notifications.

use std::sync::Arc;

use crate::error::PaymentError;
use crate::traits::{PaymentHandler, PaymentRequest};
use crate::types::PaymentRequiredParams;

/// Routes a received `payment_required` notification to the first handler
/// whose pmi matches, asking it to settle the invoice. The request event id
/// is the one carried in the notification's `e` correlation tag.
pub async fn dispatch_payment_required(
    handlers: &[Arc<dyn PaymentHandler>],
    params: &PaymentRequiredParams,
    request_event_id: &str,
) -> Result<(), PaymentError> {
    let handler = handlers
        .iter()
        .find(|handler| handler.pmi() == params.pmi)
        .ok_or_else(|| PaymentError::NoHandlerForPmi(params.pmi.clone()))?;

    handler
        .handle(PaymentRequest {
            amount: params.amount,
            pay_req: params.pay_req.clone(),
            pmi: params.pmi.clone(),
            description: params.description.clone(),
            request_event_id: request_event_id.to_owned(),
        })
        .await
        .map_err(PaymentError::Handler)
}

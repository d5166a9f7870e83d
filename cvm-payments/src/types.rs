//! Priced capabilities and the payment notification payloads.

use cvm_types::{Request, method};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declares that a specific request incurs a payment.
///
/// A capability matches a request when the methods are equal and `name` is
/// either unset or equals the request's capability identifier
/// (`params.name` for tool/prompt methods, `params.uri` for resource
/// reads).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PricedCapability {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<u64>,
    pub currency_unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PricedCapability {
    pub fn new(
        method: impl Into<String>,
        name: Option<&str>,
        amount: u64,
        currency_unit: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            name: name.map(str::to_owned),
            amount,
            max_amount: None,
            currency_unit: currency_unit.into(),
            description: None,
        }
    }

    pub fn matches(&self, request: &Request) -> bool {
        if self.method != request.method {
            return false;
        }
        match &self.name {
            None => true,
            Some(name) =>
                request.capability_identifier() == Some(name.as_str()),
        }
    }

    /// `tool` / `prompt` / `resource`, or `None` for methods that can't be
    /// announced as priced.
    pub fn capability_kind(&self) -> Option<&'static str> {
        match self.method.as_str() {
            method::TOOLS_CALL => Some("tool"),
            method::PROMPTS_GET => Some("prompt"),
            method::RESOURCES_READ => Some("resource"),
            _ => None,
        }
    }
}

/// `notifications/payment_required` params; also the shape a processor
/// returns from `create_payment_required`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRequiredParams {
    pub amount: u64,
    pub pay_req: String,
    pub pmi: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Invoice time-to-live in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// `notifications/payment_accepted` params.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentAcceptedParams {
    pub amount: u64,
    pub pmi: String,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// `notifications/payment_rejected` params.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRejectedParams {
    pub pmi: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

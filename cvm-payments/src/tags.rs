//! Assembly of the `pmi` / `cap` discovery tags announced by priced
//! servers.

use std::sync::Arc;

use cvm_types::tag;

use crate::traits::PaymentProcessor;
use crate::types::PricedCapability;

/// One `["pmi", <id>]` tag per processor, preserving configuration order
/// (which is the server's preference order).
pub fn pmi_tags_from_processors(
    processors: &[Arc<dyn PaymentProcessor>],
) -> Vec<Vec<String>> {
    processors
        .iter()
        .map(|processor| {
            vec![tag::PMI.to_owned(), processor.pmi().to_owned()]
        })
        .collect()
}

/// One `["cap", "<kind>:<name>", "<amount>[-<maxAmount>]", "<unit>"]` tag
/// per named, announceable capability. Unnamed capabilities and methods
/// outside tool/prompt/resource are skipped; input order is preserved.
pub fn cap_tags_from_priced_capabilities(
    capabilities: &[PricedCapability],
) -> Vec<Vec<String>> {
    capabilities
        .iter()
        .filter_map(|capability| {
            let kind = capability.capability_kind()?;
            let name = capability.name.as_deref()?;
            let price = match capability.max_amount {
                Some(max) => format!("{}-{}", capability.amount, max),
                None => capability.amount.to_string(),
            };
            Some(vec![
                tag::CAP.to_owned(),
                format!("{kind}:{name}"),
                price,
                capability.currency_unit.clone(),
            ])
        })
        .collect()
}

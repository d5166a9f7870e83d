//! Gift-wrap codec: seals an app-message event inside a one-shot encrypted
//! envelope.
//!
//! The wrap is authored and signed by a freshly minted ephemeral key; the
//! payload is nip44-encrypted to the recipient. Two wrap kinds exist — the
//! persistent kind relays retain, and an ephemeral kind they don't — with
//! identical structure. The codec never touches long-term keys: sealing uses
//! only the ephemeral signer, opening only the recipient's own signer.

use cvm_types::{Event, EventTemplate, kind};

use crate::error::TransportError;
use crate::traits::{EphemeralKeyProvider, Signer};

/// Seals `plaintext` (serialized inner-event JSON) for `recipient` under a
/// fresh ephemeral key, producing a wrap event of `wrap_kind`.
pub async fn seal(
    ephemeral_keys: &dyn EphemeralKeyProvider,
    recipient: &str,
    plaintext: &str,
    wrap_kind: u16,
) -> Result<Event, TransportError> {
    if !kind::is_gift_wrap(wrap_kind) {
        return Err(TransportError::NotAGiftWrap(wrap_kind));
    }

    let ephemeral = ephemeral_keys.fresh_signer();
    let ciphertext = ephemeral.nip44_encrypt(recipient, plaintext).await?;
    let template =
        EventTemplate::addressed_to(wrap_kind, recipient, ciphertext);
    ephemeral.sign_event(template).await
}

/// Opens a wrap event addressed to `signer`, returning the inner plaintext.
///
/// Refuses events whose kind is not a recognized wrap kind. The decryption
/// peer is the wrap's author (the ephemeral pubkey).
pub async fn open(
    signer: &dyn Signer,
    event: &Event,
) -> Result<String, TransportError> {
    if !kind::is_gift_wrap(event.kind) {
        return Err(TransportError::NotAGiftWrap(event.kind));
    }
    signer.nip44_decrypt(&event.pubkey, &event.content).await
}

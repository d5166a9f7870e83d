//! Stateless initialize-handshake emulation.
//!
//! Some servers are broadcast-only: they answer tool calls but hold no
//! per-client session, so the initialize round-trip would never complete.
//! In stateless mode the client transport answers the handshake locally and
//! everything else flows over the network as usual.

use cvm_types::{
    LATEST_PROTOCOL_VERSION, Message, Request, Response, method,
};
use serde_json::json;

/// What the emulator decided about an outbound message.
pub enum StatelessAction {
    /// The initialize request; deliver this canned response locally.
    RespondLocally(Response),
    /// The initialized notification; drop it silently.
    Drop,
    /// Not part of the handshake; send it over the network.
    PassThrough,
}

/// Inspects an outbound message in stateless mode.
pub fn intercept(message: &Message) -> StatelessAction {
    match message {
        Message::Request(req) if req.is_initialize() =>
            StatelessAction::RespondLocally(emulated_initialize(req)),
        Message::Notification(notif)
            if notif.method == method::INITIALIZED =>
            StatelessAction::Drop,
        _ => StatelessAction::PassThrough,
    }
}

fn emulated_initialize(request: &Request) -> Response {
    Response::result(
        request.id.clone(),
        json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "serverInfo": {
                "name": "Emulated-Stateless-Server",
                "version": "1.0.0",
            },
            "capabilities": {
                "tools": { "listChanged": true },
                "prompts": { "listChanged": true },
                "resources": { "subscribe": true, "listChanged": true },
            },
        }),
    )
}

#[cfg(test)]
mod test {
    use cvm_types::{Notification, RequestId, ResponsePayload};

    use super::*;

    #[test]
    fn initialize_is_answered_locally() {
        let msg = Message::Request(Request::new(
            7,
            method::INITIALIZE,
            Some(json!({"clientInfo": {"name": "test"}})),
        ));
        match intercept(&msg) {
            StatelessAction::RespondLocally(resp) => {
                assert_eq!(resp.id, RequestId::Number(7));
                let ResponsePayload::Result { result } = resp.payload else {
                    panic!("expected a result response");
                };
                assert_eq!(
                    result["serverInfo"]["name"],
                    json!("Emulated-Stateless-Server")
                );
                assert_eq!(
                    result["protocolVersion"],
                    json!(LATEST_PROTOCOL_VERSION)
                );
                assert_eq!(
                    result["capabilities"]["resources"]["subscribe"],
                    json!(true)
                );
            }
            _ => panic!("initialize must be intercepted"),
        }
    }

    #[test]
    fn initialized_notification_is_dropped() {
        let msg = Message::Notification(Notification::new(
            method::INITIALIZED,
            None,
        ));
        assert!(matches!(intercept(&msg), StatelessAction::Drop));
    }

    #[test]
    fn other_messages_pass_through() {
        let call =
            Message::Request(Request::new("r1", method::TOOLS_CALL, None));
        assert!(matches!(intercept(&call), StatelessAction::PassThrough));

        let progress = Message::Notification(Notification::new(
            method::PROGRESS,
            Some(json!({"progressToken": "t"})),
        ));
        assert!(matches!(
            intercept(&progress),
            StatelessAction::PassThrough
        ));
    }
}

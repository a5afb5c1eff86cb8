//! [`SessionController`]: the coordinator control-channel transport
//! (spec.md §4.5).
//!
//! The original dials an engine.io/socket.io client; this Rust version
//! retargets the same dial-timeout/event-dispatch shape onto a plain
//! WebSocket (`tokio-tungstenite`), framing each message as a small JSON
//! envelope (`{"event": ..., "payload": ...}`) rather than replicating
//! socket.io's packet encoding, since nothing downstream depends on that
//! wire format specifically.

use futures::stream::SplitSink;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::{
    parse_disable_ack, parse_enable_ack, parse_keep_alive_ack, parse_request_cert_ack,
    ControlEvent,
};
use super::{SessionError, SessionResult};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, WsMessage>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(360);

#[derive(Serialize)]
struct OutboundFrame<'a, T: Serialize> {
    event: &'a str,
    payload: T,
}

#[derive(serde::Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    payload: Value,
}

/// Dials the coordinator control channel and translates frames to/from
/// typed [`ControlEvent`]s. Reconnect policy itself lives on
/// [`super::EnableStateMachine`] (`next_reconnect_attempt`); this type is
/// the mechanics of one connection attempt.
pub struct SessionController {
    url: String,
}

impl SessionController {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Dial with a bounded handshake timeout, supplying the bearer token
    /// as a query parameter.
    pub async fn connect(&self, bearer_token: &str) -> SessionResult<WsStream> {
        let dial_url = format!(
            "{}{}token={}",
            self.url,
            if self.url.contains('?') { '&' } else { '?' },
            bearer_token
        );
        let outcome = timeout(HANDSHAKE_TIMEOUT, connect_async(&dial_url)).await;
        let (stream, _response) = match outcome {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(SessionError::Transport(e.to_string())),
            Err(_) => return Err(SessionError::Handshake("handshake timed out".into())),
        };
        Ok(stream)
    }

    /// Send a named event with a JSON-serializable payload.
    pub async fn send_event<T: Serialize>(
        sink: &mut WsSink,
        event: &str,
        payload: T,
    ) -> SessionResult<()> {
        use futures::SinkExt;
        let frame = OutboundFrame { event, payload };
        let text = serde_json::to_string(&frame)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Decode one inbound frame. Returns `Ok(None)` for frame types that
    /// carry no application event (close, ping/pong, binary).
    pub fn decode_event(msg: &WsMessage) -> SessionResult<Option<ControlEvent>> {
        let text = match msg {
            WsMessage::Text(t) => t,
            _ => return Ok(None),
        };
        let frame: InboundFrame =
            serde_json::from_str(text).map_err(|e| SessionError::Protocol(e.to_string()))?;
        let event = match frame.event.as_str() {
            "enable-ack" => ControlEvent::EnableAck(parse_enable_ack(&frame.payload)?),
            "keep-alive-ack" => ControlEvent::KeepAliveAck(parse_keep_alive_ack(&frame.payload)?),
            "disable-ack" => ControlEvent::DisableAck(parse_disable_ack(&frame.payload)?),
            "request-cert" => {
                ControlEvent::RequestCertAck(parse_request_cert_ack(&frame.payload)?)
            }
            "message" => ControlEvent::Message(
                frame.payload.as_str().unwrap_or_default().to_string(),
            ),
            other => {
                return Err(SessionError::Protocol(format!(
                    "unrecognized control event: {other}"
                )))
            }
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_enable_ack_frame() {
        let msg = WsMessage::Text(
            json!({"event": "enable-ack", "payload": [null, true]}).to_string(),
        );
        let event = SessionController::decode_event(&msg).unwrap().unwrap();
        assert!(matches!(event, ControlEvent::EnableAck(ack) if ack.ok));
    }

    #[test]
    fn decodes_message_push() {
        let msg = WsMessage::Text(
            json!({"event": "message", "payload": "hello operator"}).to_string(),
        );
        let event = SessionController::decode_event(&msg).unwrap().unwrap();
        assert!(matches!(event, ControlEvent::Message(m) if m == "hello operator"));
    }

    #[test]
    fn rejects_unknown_event_name() {
        let msg = WsMessage::Text(json!({"event": "bogus", "payload": null}).to_string());
        assert!(SessionController::decode_event(&msg).is_err());
    }

    #[test]
    fn non_text_frames_decode_to_none() {
        let msg = WsMessage::Ping(vec![]);
        assert!(SessionController::decode_event(&msg).unwrap().is_none());
    }
}

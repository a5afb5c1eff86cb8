//! Wire shapes for the coordinator control channel (spec.md §6).
//!
//! Acks arrive as heterogeneous two-element arrays (`[error|null, ...]`);
//! per design note "Dynamic typing of ack payloads" these are decoded into
//! named, typed structs rather than passed around as `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SessionError;

#[derive(Debug, Clone, Serialize)]
pub struct Flavor {
    pub runtime: String,
    pub storage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnableRequest {
    pub host: String,
    pub port: u16,
    pub version: String,
    pub byoc: bool,
    #[serde(rename = "noFastEnable")]
    pub no_fast_enable: bool,
    pub flavor: Flavor,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeepAliveRequest {
    pub time: DateTime<Utc>,
    pub hits: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckErrorBody {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct EnableAck {
    pub error: Option<AckErrorBody>,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct KeepAliveAck {
    pub error: Option<AckErrorBody>,
    /// `false` means kicked.
    pub keep_going: bool,
}

#[derive(Debug, Clone)]
pub struct DisableAck {
    pub error: Option<AckErrorBody>,
    pub ok: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertPayload {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct RequestCertAck {
    pub error: Option<AckErrorBody>,
    pub cert: Option<CertPayload>,
}

/// A decoded push from the coordinator, dispatched by the controller to
/// whoever is driving the state machine.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    EnableAck(EnableAck),
    KeepAliveAck(KeepAliveAck),
    DisableAck(DisableAck),
    RequestCertAck(RequestCertAck),
    /// Free-form operator message, logged and otherwise ignored.
    Message(String),
}

fn split_ack(raw: &Value) -> Result<(Option<AckErrorBody>, &Value), SessionError> {
    let arr = raw
        .as_array()
        .ok_or_else(|| SessionError::Protocol("ack is not a two-element array".into()))?;
    if arr.len() != 2 {
        return Err(SessionError::Protocol(format!(
            "expected 2-element ack array, got {}",
            arr.len()
        )));
    }
    let error = if arr[0].is_null() {
        None
    } else {
        Some(
            serde_json::from_value(arr[0].clone())
                .map_err(|e| SessionError::Protocol(format!("malformed ack error: {e}")))?,
        )
    };
    Ok((error, &arr[1]))
}

pub fn parse_enable_ack(raw: &Value) -> Result<EnableAck, SessionError> {
    let (error, second) = split_ack(raw)?;
    let ok = second
        .as_bool()
        .ok_or_else(|| SessionError::Protocol("enable ack second element not a bool".into()))?;
    Ok(EnableAck { error, ok })
}

pub fn parse_keep_alive_ack(raw: &Value) -> Result<KeepAliveAck, SessionError> {
    let (error, second) = split_ack(raw)?;
    let keep_going = second
        .as_bool()
        .ok_or_else(|| SessionError::Protocol("keep-alive ack second element not a bool".into()))?;
    Ok(KeepAliveAck { error, keep_going })
}

pub fn parse_disable_ack(raw: &Value) -> Result<DisableAck, SessionError> {
    let (error, second) = split_ack(raw)?;
    let ok = second
        .as_bool()
        .ok_or_else(|| SessionError::Protocol("disable ack second element not a bool".into()))?;
    Ok(DisableAck { error, ok })
}

pub fn parse_request_cert_ack(raw: &Value) -> Result<RequestCertAck, SessionError> {
    let (error, second) = split_ack(raw)?;
    let cert = if second.is_null() {
        None
    } else {
        Some(
            serde_json::from_value(second.clone())
                .map_err(|e| SessionError::Protocol(format!("malformed cert payload: {e}")))?,
        )
    };
    Ok(RequestCertAck { error, cert })
}

/// Parse the coordinator's well-known hash-mismatch error message shape:
/// `"hash mismatch, expected <h1>, got <h2>"`. Returns `(expected, got)`.
pub fn parse_hash_mismatch(message: &str) -> Option<(String, String)> {
    let rest = message.strip_prefix("hash mismatch, expected ")?;
    let (expected, rest) = rest.split_once(", got ")?;
    Some((expected.to_string(), rest.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_successful_enable_ack() {
        let raw = json!([null, true]);
        let ack = parse_enable_ack(&raw).unwrap();
        assert!(ack.error.is_none());
        assert!(ack.ok);
    }

    #[test]
    fn parses_enable_ack_with_error() {
        let raw = json!([{"message": "hash mismatch, expected aaa, got bbb"}, false]);
        let ack = parse_enable_ack(&raw).unwrap();
        let err = ack.error.unwrap();
        assert_eq!(
            parse_hash_mismatch(&err.message),
            Some(("aaa".to_string(), "bbb".to_string()))
        );
    }

    #[test]
    fn rejects_wrong_shape() {
        let raw = json!([null, true, "extra"]);
        assert!(parse_enable_ack(&raw).is_err());
    }

    #[test]
    fn keep_alive_ack_false_means_kicked() {
        let raw = json!([null, false]);
        let ack = parse_keep_alive_ack(&raw).unwrap();
        assert!(!ack.keep_going);
    }

    #[test]
    fn request_cert_ack_carries_cert_payload() {
        let raw = json!([null, {"cert": "CERT", "key": "KEY"}]);
        let ack = parse_request_cert_ack(&raw).unwrap();
        let cert = ack.cert.unwrap();
        assert_eq!(cert.cert, "CERT");
    }

    #[test]
    fn hash_mismatch_message_parses() {
        let parsed = parse_hash_mismatch("hash mismatch, expected abc123, got def456");
        assert_eq!(parsed, Some(("abc123".to_string(), "def456".to_string())));
        assert_eq!(parse_hash_mismatch("some other error"), None);
    }
}

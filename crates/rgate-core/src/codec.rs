//! JSON wire codec for control-channel envelopes.
//!
//! Decoding is pure: bytes in, [`Envelope`] or error out. Encoding validates
//! that the envelope is well-formed before anything reaches the wire.

use crate::error::{GatewayError, GatewayResult};
use crate::messages::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level keys owned by the envelope itself.
const RESERVED_KEYS: [&str; 4] = ["type", "id", "payload", "ts"];

#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    ts: u64,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Encode an envelope into JSON bytes.
pub fn encode(envelope: &Envelope) -> GatewayResult<Vec<u8>> {
    let raw = to_raw(envelope)?;
    serde_json::to_vec(&raw).map_err(|e| GatewayError::MalformedMessage(e.to_string()))
}

/// Encode an envelope into a JSON string (for WebSocket text frames).
pub fn encode_text(envelope: &Envelope) -> GatewayResult<String> {
    let raw = to_raw(envelope)?;
    serde_json::to_string(&raw).map_err(|e| GatewayError::MalformedMessage(e.to_string()))
}

/// Decode JSON bytes into a typed envelope.
pub fn decode(data: &[u8]) -> GatewayResult<Envelope> {
    let value: Value = serde_json::from_slice(data)?;
    if !value.is_object() {
        return Err(GatewayError::Decode("envelope must be a JSON object".into()));
    }
    let raw: RawEnvelope = serde_json::from_value(value)?;

    let msg_type =
        MsgType::parse(&raw.msg_type).ok_or_else(|| GatewayError::UnknownType(raw.msg_type.clone()))?;

    if msg_type.requires_id() && raw.id.as_deref().map_or(true, str::is_empty) {
        return Err(GatewayError::Decode(format!(
            "{} envelope without correlation id",
            msg_type.as_str()
        )));
    }

    let payload = match msg_type {
        MsgType::Request => Payload::Request(serde_json::from_value(raw.payload)?),
        MsgType::Response => Payload::Response(raw.payload),
        MsgType::Event => Payload::Event(serde_json::from_value(raw.payload)?),
        MsgType::Error => Payload::Error(serde_json::from_value(raw.payload)?),
        MsgType::Ping => Payload::Ping(heartbeat_from(raw.payload)?),
        MsgType::Pong => Payload::Pong(heartbeat_from(raw.payload)?),
    };

    Ok(Envelope {
        msg_type,
        id: raw.id,
        payload,
        ts: raw.ts,
        extra: raw.extra,
    })
}

/// Best-effort extraction of the correlation id from an undecodable frame,
/// so a rejection can still be paired with its request.
pub fn peek_id(data: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(data).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

fn heartbeat_from(payload: Value) -> GatewayResult<HeartbeatPayload> {
    if payload.is_null() {
        return Ok(HeartbeatPayload::default());
    }
    Ok(serde_json::from_value(payload)?)
}

fn to_raw(envelope: &Envelope) -> GatewayResult<RawEnvelope> {
    validate(envelope)?;
    let payload = match &envelope.payload {
        Payload::Request(p) => serde_json::to_value(p),
        Payload::Response(v) => Ok(v.clone()),
        Payload::Event(p) => serde_json::to_value(p),
        Payload::Error(p) => serde_json::to_value(p),
        Payload::Ping(p) | Payload::Pong(p) => serde_json::to_value(p),
    }
    .map_err(|e| GatewayError::MalformedMessage(e.to_string()))?;

    Ok(RawEnvelope {
        msg_type: envelope.msg_type.as_str().to_string(),
        id: envelope.id.clone(),
        payload,
        ts: envelope.ts,
        extra: envelope.extra.clone(),
    })
}

fn validate(envelope: &Envelope) -> GatewayResult<()> {
    let declared = envelope.msg_type;
    let actual = envelope.payload.msg_type();
    if declared != actual {
        return Err(GatewayError::MalformedMessage(format!(
            "type {} carries a {} payload",
            declared.as_str(),
            actual.as_str()
        )));
    }

    if declared.requires_id() && envelope.id.as_deref().map_or(true, str::is_empty) {
        return Err(GatewayError::MalformedMessage(format!(
            "{} envelope requires a correlation id",
            declared.as_str()
        )));
    }

    if let Some(key) = RESERVED_KEYS.iter().find(|k| envelope.extra.contains_key(**k)) {
        return Err(GatewayError::MalformedMessage(format!(
            "extra field shadows envelope key `{key}`"
        )));
    }

    match &envelope.payload {
        Payload::Request(p) => {
            require_non_empty("op", &p.op)?;
            reject_shadowed(&p.args, &["op"])
        }
        Payload::Event(p) => {
            require_non_empty("event", &p.event)?;
            reject_shadowed(&p.data, &["event"])
        }
        Payload::Error(p) => {
            require_non_empty("kind", &p.kind)?;
            reject_shadowed(&p.details, &["kind", "message"])
        }
        Payload::Ping(p) | Payload::Pong(p) => reject_shadowed(&p.extra, &["seq"]),
        Payload::Response(_) => Ok(()),
    }
}

fn require_non_empty(field: &str, value: &str) -> GatewayResult<()> {
    if value.is_empty() {
        return Err(GatewayError::MalformedMessage(format!("`{field}` must not be empty")));
    }
    Ok(())
}

fn reject_shadowed(map: &Map<String, Value>, keys: &[&str]) -> GatewayResult<()> {
    match keys.iter().find(|k| map.contains_key(**k)) {
        Some(key) => Err(GatewayError::MalformedMessage(format!(
            "payload field `{key}` is duplicated"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn round_trip_each_type() {
        let samples = vec![
            Envelope::request("1", "ping-remote", args(json!({"host": "10.0.0.5"}))),
            Envelope::response("1", json!({"reachable": true})),
            Envelope::event("client.banned", args(json!({"world": 302}))),
            Envelope::from_error(Some("1".into()), &GatewayError::RequestTimeout),
            Envelope::ping(4),
            Envelope::pong(Some(4)),
        ];
        for env in samples {
            let bytes = encode(&env).unwrap();
            assert_eq!(decode(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn decodes_spec_style_request_without_ts() {
        let raw = br#"{"type":"request","id":"1","payload":{"op":"ping-remote","host":"10.0.0.5"}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.ts, 0);
        match env.payload {
            Payload::Request(p) => {
                assert_eq!(p.op, "ping-remote");
                assert_eq!(p.args["host"], "10.0.0.5");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = decode(br#"{"type":"blob","payload":{}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownType(t) if t == "blob"));
    }

    #[test]
    fn invalid_structure_is_decode_error() {
        assert!(matches!(decode(b"not json"), Err(GatewayError::Decode(_))));
        assert!(matches!(decode(b"[1,2]"), Err(GatewayError::Decode(_))));
        assert!(matches!(
            decode(br#"{"type":"request","payload":{"op":"x"}}"#),
            Err(GatewayError::Decode(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"request","id":"2","payload":{"host":"h"}}"#),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn unknown_fields_survive_pass_through() {
        let raw = br#"{"type":"event","payload":{"event":"tick","n":1,"future":[1]},"ts":5,"trace":"abc"}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.extra["trace"], "abc");
        let again: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(again["trace"], "abc");
        assert_eq!(again["payload"]["future"], json!([1]));
    }

    #[test]
    fn encode_rejects_mismatched_payload() {
        let mut env = Envelope::ping(1);
        env.msg_type = MsgType::Request;
        assert!(matches!(encode(&env), Err(GatewayError::MalformedMessage(_))));
    }

    #[test]
    fn encode_rejects_missing_id() {
        let mut env = Envelope::response("9", Value::Null);
        env.id = None;
        assert!(matches!(encode(&env), Err(GatewayError::MalformedMessage(_))));
    }

    #[test]
    fn encode_rejects_shadowed_keys() {
        let env = Envelope::request("1", "exec", args(json!({"op": "other"})));
        assert!(matches!(encode(&env), Err(GatewayError::MalformedMessage(_))));

        let mut env = Envelope::pong(None);
        env.extra.insert("type".into(), json!("x"));
        assert!(matches!(encode(&env), Err(GatewayError::MalformedMessage(_))));
    }

    #[test]
    fn uncorrelated_error_is_allowed() {
        let env = Envelope::error(None, ErrorPayload::new(ErrorKind::DecodeError, "bad frame"));
        let back = decode(&encode(&env).unwrap()).unwrap();
        assert!(back.id.is_none());
    }

    #[test]
    fn peek_id_reads_through_garbage_payload() {
        let raw = br#"{"type":"request","id":"42","payload":7}"#;
        assert!(decode(raw).is_err());
        assert_eq!(peek_id(raw).as_deref(), Some("42"));
        assert_eq!(peek_id(b"{"), None);
    }

    #[test]
    fn ping_without_payload_decodes() {
        let env = decode(br#"{"type":"ping","ts":1}"#).unwrap();
        assert_eq!(env.payload, Payload::Ping(HeartbeatPayload::default()));
    }
}

//! JSON codec for [`Envelope`]s.
//!
//! Decoding classifies a frame purely by shape:
//!
//! - an integer `id` together with a string `method` is a request,
//! - an integer `id` together with `ok`, `result` or `error` is a response,
//! - a string `topic` without an `id` is an event,
//! - anything else is rejected as [`RpcError::MalformedEnvelope`].
//!
//! A malformed frame is a per-frame failure; callers are expected to log and
//! discard it rather than tear the link down.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::{CallId, Envelope, Notification};
use crate::{Result, RpcError, ServerError};

#[derive(Serialize)]
struct RequestFrame<'a, P: ?Sized> {
    id: CallId,
    method: &'a str,
    params: &'a P,
}

// Notifications carry the JSON-RPC version tag; servers validate control
// messages as JSON-RPC 2.0 requests.
#[derive(Serialize)]
struct NotificationFrame<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a str,
}

const JSONRPC_VERSION: &str = "2.0";

/// Encode a call request as a JSON frame.
///
/// # Errors
///
/// Returns `RpcError::Serialization` if `params` cannot be represented as
/// JSON (e.g. a map with non-string keys).
pub fn encode_request<P>(id: CallId, method: &str, params: &P) -> Result<Bytes>
where
    P: Serialize + ?Sized,
{
    // ---
    let frame = RequestFrame { id, method, params };
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Encode a subscription control notification.
pub fn encode_notification(notice: &Notification) -> Result<Bytes> {
    // ---
    let frame = NotificationFrame {
        jsonrpc: JSONRPC_VERSION,
        method: notice.method(),
        params: notice.topic(),
    };
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Decode an inbound frame into a request, a response or an event.
///
/// # Errors
///
/// Returns `RpcError::MalformedEnvelope` describing why the frame was
/// rejected.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    // ---
    let value: Value = serde_json::from_slice(frame)
        .map_err(|err| malformed(format!("invalid JSON: {err}")))?;

    let Value::Object(mut obj) = value else {
        return Err(malformed("frame is not a JSON object"));
    };

    if let Some(raw_id) = obj.get("id") {
        let id = raw_id
            .as_u64()
            .map(CallId::new)
            .ok_or_else(|| malformed(format!("id is not an unsigned integer: {raw_id}")))?;

        if let Some(raw_method) = obj.remove("method") {
            let Value::String(method) = raw_method else {
                return Err(malformed(format!("request {id}: method is not a string: {raw_method}")));
            };
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(Envelope::Request { id, method, params });
        }

        let outcome = decode_outcome(id, &mut obj)?;
        return Ok(Envelope::Response { id, outcome });
    }

    match obj.remove("topic") {
        Some(Value::String(topic)) => {
            let payload = obj.remove("payload").unwrap_or(Value::Null);
            Ok(Envelope::Event { topic, payload })
        }
        Some(other) => Err(malformed(format!("topic is not a string: {other}"))),
        None => Err(malformed("frame has neither id nor topic")),
    }
}

fn decode_outcome(id: CallId, obj: &mut Map<String, Value>) -> Result<std::result::Result<Value, ServerError>> {
    // ---
    let ok = match obj.get("ok") {
        Some(Value::Bool(ok)) => *ok,
        Some(other) => return Err(malformed(format!("response {id}: ok is not a boolean: {other}"))),
        // No explicit flag: infer from which payload field is present.
        None => match (obj.get("error"), obj.get("result")) {
            (Some(err), _) if !err.is_null() => false,
            (_, Some(_)) => true,
            _ => return Err(malformed(format!("response {id} has no ok, result or error"))),
        },
    };

    if ok {
        return Ok(Ok(obj.remove("result").unwrap_or(Value::Null)));
    }

    match obj.remove("error") {
        Some(Value::Object(body)) => serde_json::from_value::<ServerError>(Value::Object(body))
            .map(Err)
            .map_err(|err| malformed(format!("response {id}: bad error body: {err}"))),
        // Some peers send a bare message string.
        Some(Value::String(message)) => Ok(Err(ServerError::new(message))),
        Some(other) => Err(malformed(format!("response {id}: error is not an object: {other}"))),
        None => Err(malformed(format!("response {id}: ok is false but error is missing"))),
    }
}

fn malformed(reason: impl Into<String>) -> RpcError {
    RpcError::MalformedEnvelope(reason.into())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn decode_json(value: Value) -> Result<Envelope> {
        decode(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn request_frame_shape() {
        // ---
        let bytes = encode_request(CallId::new(1), "echo", &json!({"message": "hi"})).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(
            value,
            json!({"id": 1, "method": "echo", "params": {"message": "hi"}})
        );
    }

    #[test]
    fn request_params_from_typed_struct() {
        // ---
        #[derive(Serialize)]
        struct Generate<'a> {
            data: &'a str,
        }

        let bytes = encode_request(CallId::new(9), "code.generate_image", &Generate { data: "x" }).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["params"], json!({"data": "x"}));
    }

    #[test]
    fn notification_frame_has_no_id() {
        // ---
        let bytes = encode_notification(&Notification::Subscribe("ticks".into())).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "method": "subscribe", "params": "ticks"})
        );
    }

    #[test]
    fn decode_success_response() {
        // ---
        let env = decode_json(json!({"id": 1, "ok": true, "result": {"message": "hi"}})).unwrap();
        assert_eq!(
            env,
            Envelope::Response {
                id: CallId::new(1),
                outcome: Ok(json!({"message": "hi"})),
            }
        );
    }

    #[test]
    fn decode_success_without_result_is_null() {
        // ---
        let env = decode_json(json!({"id": 3, "ok": true})).unwrap();
        assert_eq!(
            env,
            Envelope::Response {
                id: CallId::new(3),
                outcome: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn decode_failure_response() {
        // ---
        let env = decode_json(json!({
            "id": 2,
            "ok": false,
            "error": {"message": "method \"nope\" doesn't exist", "code": -32601}
        }))
        .unwrap();

        let Envelope::Response { id, outcome: Err(err) } = env else {
            panic!("expected failed response");
        };
        assert_eq!(id, CallId::new(2));
        assert_eq!(err.message, "method \"nope\" doesn't exist");
        assert_eq!(err.data["code"], json!(-32601));
    }

    #[test]
    fn decode_failure_without_ok_flag() {
        // ---
        let env = decode_json(json!({"id": 4, "error": "boom"})).unwrap();
        assert_eq!(
            env,
            Envelope::Response {
                id: CallId::new(4),
                outcome: Err(ServerError::new("boom")),
            }
        );
    }

    #[test]
    fn decode_event() {
        // ---
        let env = decode_json(json!({"topic": "ticks", "payload": {"value": "5"}})).unwrap();
        assert_eq!(
            env,
            Envelope::Event {
                topic: "ticks".into(),
                payload: json!({"value": "5"}),
            }
        );
    }

    #[test]
    fn decode_peer_request() {
        // ---
        let env = decode_json(json!({"id": 1, "method": "ping"})).unwrap();
        assert_eq!(
            env,
            Envelope::Request {
                id: CallId::new(1),
                method: "ping".into(),
                params: Value::Null,
            }
        );
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        // ---
        let cases = [
            json!([1, 2, 3]),
            json!({"hello": "world"}),
            json!({"id": "one", "ok": true}),
            json!({"id": -1, "ok": true}),
            json!({"id": 1}),
            json!({"id": 1, "ok": "yes"}),
            json!({"id": 1, "ok": false}),
            json!({"id": 1, "ok": false, "error": {"code": 1}}),
            json!({"id": 1, "method": 7}),
            json!({"topic": 5, "payload": null}),
        ];

        for case in cases {
            match decode_json(case.clone()) {
                Err(RpcError::MalformedEnvelope(_)) => {}
                other => panic!("{case} decoded to {other:?}"),
            }
        }
    }

    #[test]
    fn decode_rejects_invalid_json() {
        // ---
        assert!(matches!(
            decode(b"{not json"),
            Err(RpcError::MalformedEnvelope(_))
        ));
    }
}

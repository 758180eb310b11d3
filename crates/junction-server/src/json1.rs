//! The JSON-over-WebSocket envelope (`x-junction-json1` subprotocol).
//!
//! Frames are JSON arrays `[type, msgid, ...]`:
//!
//! - `[2, msgid, "api/verb", args, token?, uuid?]` — call (client → server)
//! - `[3, msgid, {"response": …}]` — successful reply
//! - `[4, msgid, {"error": kind, "info": …}]` — failed reply
//! - `[5, "event", data]` — event delivery (push or broadcast)
//!
//! `msgid` is opaque to the server and echoed back verbatim (clients use
//! strings or numbers). The envelope maps 1-to-1 onto the binary
//! protocol's call/reply/event operations.

use serde_json::{json, Value};

use junction_api::Reply;

/// Envelope type tag: call.
pub const TYPE_CALL: u64 = 2;
/// Envelope type tag: successful reply.
pub const TYPE_REPLY_OK: u64 = 3;
/// Envelope type tag: failed reply.
pub const TYPE_REPLY_ERR: u64 = 4;
/// Envelope type tag: event delivery.
pub const TYPE_EVENT: u64 = 5;

/// Envelope parse failure. The offending frame is dropped; the
/// connection stays usable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Json1Error {
    /// The frame is not a JSON array.
    #[error("envelope is not a json array")]
    NotAnArray,

    /// The type tag is missing or not a call.
    #[error("unsupported envelope type")]
    BadType,

    /// A required field is missing or of the wrong type.
    #[error("malformed envelope field: {0}")]
    BadField(&'static str),
}

/// A parsed client call envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Json1Call {
    /// Opaque correlation value, echoed in the reply.
    pub msgid: Value,
    /// `api/verb` selector.
    pub selector: String,
    /// JSON argument.
    pub args: Value,
    /// Per-call token override.
    pub token: Option<String>,
    /// Per-call session override.
    pub uuid: Option<String>,
}

/// Parse one incoming text frame.
pub fn parse_call(text: &str) -> Result<Json1Call, Json1Error> {
    let frame: Value = serde_json::from_str(text).map_err(|_| Json1Error::NotAnArray)?;
    let Value::Array(fields) = frame else {
        return Err(Json1Error::NotAnArray);
    };

    match fields.first().and_then(Value::as_u64) {
        Some(TYPE_CALL) => {}
        _ => return Err(Json1Error::BadType),
    }

    let msgid = fields.get(1).cloned().ok_or(Json1Error::BadField("msgid"))?;
    let selector = fields
        .get(2)
        .and_then(Value::as_str)
        .ok_or(Json1Error::BadField("selector"))?
        .to_owned();
    let args = fields.get(3).cloned().unwrap_or(Value::Null);
    let token = fields
        .get(4)
        .and_then(Value::as_str)
        .map(str::to_owned);
    let uuid = fields
        .get(5)
        .and_then(Value::as_str)
        .map(str::to_owned);

    Ok(Json1Call {
        msgid,
        selector,
        args,
        token,
        uuid,
    })
}

/// Render a reply envelope for `msgid`.
pub fn reply_frame(msgid: &Value, reply: &Reply) -> String {
    let frame = match &reply.error {
        None => json!([TYPE_REPLY_OK, msgid, { "response": reply.result }]),
        Some(error) => json!([
            TYPE_REPLY_ERR,
            msgid,
            { "error": error, "info": reply.info, "response": reply.result }
        ]),
    };
    frame.to_string()
}

/// Render an event envelope.
pub fn event_frame(event: &str, data: &Value) -> String {
    json!([TYPE_EVENT, event, data]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_a_minimal_call() {
        let call = parse_call(r#"[2, "m1", "hello/ping", {}]"#).unwrap();
        assert_eq!(call.msgid, json!("m1"));
        assert_eq!(call.selector, "hello/ping");
        assert_eq!(call.args, json!({}));
        assert_eq!(call.token, None);
        assert_eq!(call.uuid, None);
    }

    #[test]
    fn parses_token_and_uuid() {
        let call = parse_call(r#"[2, 7, "a/v", null, "tok", "uuid-1"]"#).unwrap();
        assert_eq!(call.msgid, json!(7));
        assert_eq!(call.token.as_deref(), Some("tok"));
        assert_eq!(call.uuid.as_deref(), Some("uuid-1"));
    }

    #[test]
    fn rejects_non_calls() {
        assert_matches!(parse_call("not json"), Err(Json1Error::NotAnArray));
        assert_matches!(parse_call(r#"{"a": 1}"#), Err(Json1Error::NotAnArray));
        assert_matches!(parse_call(r#"[3, "m", {}]"#), Err(Json1Error::BadType));
        assert_matches!(parse_call("[]"), Err(Json1Error::BadType));
        assert_matches!(parse_call("[2]"), Err(Json1Error::BadField("msgid")));
        assert_matches!(parse_call(r#"[2, "m"]"#), Err(Json1Error::BadField("selector")));
        assert_matches!(parse_call(r#"[2, "m", 42]"#), Err(Json1Error::BadField("selector")));
    }

    #[test]
    fn reply_frames_echo_the_msgid() {
        let ok = reply_frame(&json!("m1"), &Reply::success(json!({"x": 1})));
        assert_eq!(
            serde_json::from_str::<Value>(&ok).unwrap(),
            json!([3, "m1", {"response": {"x": 1}}])
        );

        let err = reply_frame(
            &json!(9),
            &Reply::failure("invalid-token", Some("token mismatch")),
        );
        let parsed: Value = serde_json::from_str(&err).unwrap();
        assert_eq!(parsed[0], json!(4));
        assert_eq!(parsed[1], json!(9));
        assert_eq!(parsed[2]["error"], "invalid-token");
        assert_eq!(parsed[2]["info"], "token mismatch");
    }

    #[test]
    fn event_frames_carry_name_and_data() {
        let frame = event_frame("hello/x", &json!({"v": 1}));
        assert_eq!(
            serde_json::from_str::<Value>(&frame).unwrap(),
            json!([5, "hello/x", {"v": 1}])
        );
    }
}

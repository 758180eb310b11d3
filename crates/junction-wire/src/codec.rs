//! Frame encoding and decoding for the binder wire protocol.
//!
//! A frame is one binary message: a 1-byte opcode followed by type-tagged
//! fields. Integers are little-endian `u32`. A `string` is encoded as its
//! length including a trailing NUL (so the length is always ≥ 1) followed by
//! the bytes and the NUL. A `nullstring` uses length 0 to encode the null
//! value and is otherwise identical to `string`.
//!
//! JSON payloads travel as strings. Decoding parses them leniently: text
//! that is not valid JSON is kept as a JSON string, so a peer sending a bare
//! word still round-trips.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

/// Client → server: invoke a verb.
pub const OP_CALL: u8 = b'C';
/// Server → client: answer a call.
pub const OP_REPLY: u8 = b'Y';
/// Server → client: broadcast event data to everyone.
pub const OP_EVENT_BROADCAST: u8 = b'*';
/// Server → client: an event was created.
pub const OP_EVENT_CREATE: u8 = b'+';
/// Server → client: an event was removed.
pub const OP_EVENT_REMOVE: u8 = b'-';
/// Server → client: push event data to subscribers.
pub const OP_EVENT_PUSH: u8 = b'!';
/// Server → client: subscription bound to an in-flight call.
pub const OP_EVENT_SUBSCRIBE: u8 = b'S';
/// Server → client: unsubscription bound to an in-flight call.
pub const OP_EVENT_UNSUBSCRIBE: u8 = b'U';
/// Client → server: request the self-description.
pub const OP_DESCRIBE: u8 = b'D';
/// Server → client: the self-description.
pub const OP_DESCRIPTION: u8 = b'd';

/// Decoding failure. All variants are local to the offending frame: the
/// frame is dropped and the connection stays usable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame was empty.
    #[error("empty frame")]
    Empty,

    /// The frame ended before a field was complete.
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated {
        /// How many bytes were missing for the current field.
        needed: usize,
    },

    /// A `string` field had length 0 or no trailing NUL.
    #[error("malformed string field")]
    BadString,

    /// A string field held bytes that are not UTF-8.
    #[error("string field is not valid utf-8")]
    BadUtf8,

    /// The opcode byte is not part of the protocol.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

/// One wire message, either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Verb invocation (`C`).
    Call {
        /// Correlation id, unique among the sender's in-flight calls.
        callid: u32,
        /// `api/verb` selector.
        verb: String,
        /// Session UUID the call runs under.
        session: String,
        /// JSON argument.
        args: Value,
        /// Optional caller credentials.
        creds: Option<String>,
    },
    /// Call answer (`Y`).
    Reply {
        /// Correlation id of the answered call.
        callid: u32,
        /// Error kind, `None` on success.
        error: Option<String>,
        /// Optional human-oriented detail.
        info: Option<String>,
        /// JSON result.
        result: Value,
    },
    /// Unsolicited event data for every listener (`*`).
    EventBroadcast {
        /// Full event name.
        event: String,
        /// JSON payload.
        data: Value,
    },
    /// Event came into existence (`+`).
    EventCreate {
        /// Numeric event id, scoped to the emitting endpoint.
        event_id: u32,
        /// Full event name.
        event: String,
    },
    /// Event was destroyed (`-`).
    EventRemove {
        /// Numeric event id.
        event_id: u32,
        /// Full event name.
        event: String,
    },
    /// Event data for subscribers (`!`).
    EventPush {
        /// Numeric event id.
        event_id: u32,
        /// Full event name.
        event: String,
        /// JSON payload.
        data: Value,
    },
    /// Subscription granted within a call (`S`).
    EventSubscribe {
        /// The in-flight call this subscription belongs to.
        callid: u32,
        /// Numeric event id.
        event_id: u32,
        /// Full event name.
        event: String,
    },
    /// Subscription revoked within a call (`U`).
    EventUnsubscribe {
        /// The in-flight call this unsubscription belongs to.
        callid: u32,
        /// Numeric event id.
        event_id: u32,
        /// Full event name.
        event: String,
    },
    /// Description request (`D`).
    Describe {
        /// Correlation id, unique among the sender's in-flight describes.
        descid: u32,
    },
    /// Description answer (`d`).
    Description {
        /// Correlation id of the answered describe.
        descid: u32,
        /// JSON description document.
        description: Value,
    },
}

impl Message {
    /// Opcode byte of this message.
    pub fn opcode(&self) -> u8 {
        match self {
            Message::Call { .. } => OP_CALL,
            Message::Reply { .. } => OP_REPLY,
            Message::EventBroadcast { .. } => OP_EVENT_BROADCAST,
            Message::EventCreate { .. } => OP_EVENT_CREATE,
            Message::EventRemove { .. } => OP_EVENT_REMOVE,
            Message::EventPush { .. } => OP_EVENT_PUSH,
            Message::EventSubscribe { .. } => OP_EVENT_SUBSCRIBE,
            Message::EventUnsubscribe { .. } => OP_EVENT_UNSUBSCRIBE,
            Message::Describe { .. } => OP_DESCRIBE,
            Message::Description { .. } => OP_DESCRIPTION,
        }
    }

    /// Encode into a single binary frame.
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new(self.opcode());
        match self {
            Message::Call {
                callid,
                verb,
                session,
                args,
                creds,
            } => {
                w.u32(*callid);
                w.string(verb);
                w.string(session);
                w.object(args);
                w.nullstring(creds.as_deref());
            }
            Message::Reply {
                callid,
                error,
                info,
                result,
            } => {
                w.u32(*callid);
                w.nullstring(error.as_deref());
                w.nullstring(info.as_deref());
                w.object(result);
            }
            Message::EventBroadcast { event, data } => {
                w.string(event);
                w.object(data);
            }
            Message::EventCreate { event_id, event }
            | Message::EventRemove { event_id, event } => {
                w.u32(*event_id);
                w.string(event);
            }
            Message::EventPush {
                event_id,
                event,
                data,
            } => {
                w.u32(*event_id);
                w.string(event);
                w.object(data);
            }
            Message::EventSubscribe {
                callid,
                event_id,
                event,
            }
            | Message::EventUnsubscribe {
                callid,
                event_id,
                event,
            } => {
                w.u32(*callid);
                w.u32(*event_id);
                w.string(event);
            }
            Message::Describe { descid } => {
                w.u32(*descid);
            }
            Message::Description {
                descid,
                description,
            } => {
                w.u32(*descid);
                w.object(description);
            }
        }
        w.finish()
    }

    /// Decode one binary frame.
    pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
        let mut r = Reader::new(frame);
        let op = r.u8()?;
        let msg = match op {
            OP_CALL => Message::Call {
                callid: r.u32()?,
                verb: r.string()?.to_owned(),
                session: r.string()?.to_owned(),
                args: r.object()?,
                creds: r.nullstring()?.map(str::to_owned),
            },
            OP_REPLY => Message::Reply {
                callid: r.u32()?,
                error: r.nullstring()?.map(str::to_owned),
                info: r.nullstring()?.map(str::to_owned),
                result: r.object()?,
            },
            OP_EVENT_BROADCAST => Message::EventBroadcast {
                event: r.string()?.to_owned(),
                data: r.object()?,
            },
            OP_EVENT_CREATE => Message::EventCreate {
                event_id: r.u32()?,
                event: r.string()?.to_owned(),
            },
            OP_EVENT_REMOVE => Message::EventRemove {
                event_id: r.u32()?,
                event: r.string()?.to_owned(),
            },
            OP_EVENT_PUSH => Message::EventPush {
                event_id: r.u32()?,
                event: r.string()?.to_owned(),
                data: r.object()?,
            },
            OP_EVENT_SUBSCRIBE => Message::EventSubscribe {
                callid: r.u32()?,
                event_id: r.u32()?,
                event: r.string()?.to_owned(),
            },
            OP_EVENT_UNSUBSCRIBE => Message::EventUnsubscribe {
                callid: r.u32()?,
                event_id: r.u32()?,
                event: r.string()?.to_owned(),
            },
            OP_DESCRIBE => Message::Describe { descid: r.u32()? },
            OP_DESCRIPTION => Message::Description {
                descid: r.u32()?,
                description: r.object()?,
            },
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        Ok(msg)
    }
}

/// Frame writer. Fields append to one contiguous buffer; the transport
/// sends the finished frame as a single binary message.
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new(opcode: u8) -> Writer {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(opcode);
        Writer { buf }
    }

    fn u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    fn string(&mut self, value: &str) {
        // length includes the trailing NUL
        self.buf.put_u32_le(value.len() as u32 + 1);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    fn nullstring(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.string(s),
            None => self.buf.put_u32_le(0),
        }
    }

    fn object(&mut self, value: &Value) {
        self.string(&value.to_string());
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Frame reader over a borrowed buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated { needed: len })?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end - self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.buf.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Err(DecodeError::BadString);
        }
        let raw = self.take(len)?;
        if raw[len - 1] != 0 {
            return Err(DecodeError::BadString);
        }
        std::str::from_utf8(&raw[..len - 1]).map_err(|_| DecodeError::BadUtf8)
    }

    fn nullstring(&mut self) -> Result<Option<&'a str>, DecodeError> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(len)?;
        if raw[len - 1] != 0 {
            return Err(DecodeError::BadString);
        }
        std::str::from_utf8(&raw[..len - 1])
            .map(Some)
            .map_err(|_| DecodeError::BadUtf8)
    }

    fn object(&mut self) -> Result<Value, DecodeError> {
        let text = self.string()?;
        // Lenient: non-JSON text is kept verbatim as a JSON string.
        Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn roundtrip(msg: &Message) {
        let frame = msg.encode();
        let decoded = Message::decode(&frame).expect("decode");
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn call_roundtrip() {
        roundtrip(&Message::Call {
            callid: 1,
            verb: "hello/ping".into(),
            session: "123456789012345678901234567890123456".into(),
            args: json!({}),
            creds: None,
        });
        roundtrip(&Message::Call {
            callid: u32::MAX,
            verb: "x".into(),
            session: String::new(),
            args: json!({"a": [1, 2, 3], "b": null}),
            creds: Some("token:abc".into()),
        });
    }

    #[test]
    fn reply_roundtrip() {
        roundtrip(&Message::Reply {
            callid: 1,
            error: None,
            info: None,
            result: json!("pong"),
        });
        roundtrip(&Message::Reply {
            callid: 7,
            error: Some("invalid-token".into()),
            info: Some("token mismatch".into()),
            result: Value::Null,
        });
    }

    #[test]
    fn event_frames_roundtrip() {
        roundtrip(&Message::EventBroadcast {
            event: "hello/alert".into(),
            data: json!({"level": 3}),
        });
        roundtrip(&Message::EventCreate {
            event_id: 11,
            event: "hello/x".into(),
        });
        roundtrip(&Message::EventRemove {
            event_id: 11,
            event: "hello/x".into(),
        });
        roundtrip(&Message::EventPush {
            event_id: 11,
            event: "hello/x".into(),
            data: json!({"v": 1}),
        });
        roundtrip(&Message::EventSubscribe {
            callid: 5,
            event_id: 11,
            event: "hello/x".into(),
        });
        roundtrip(&Message::EventUnsubscribe {
            callid: 5,
            event_id: 11,
            event: "hello/x".into(),
        });
    }

    #[test]
    fn describe_roundtrip() {
        roundtrip(&Message::Describe { descid: 99 });
        roundtrip(&Message::Description {
            descid: 99,
            description: json!({"openapi": "3.0.0"}),
        });
    }

    #[test]
    fn strings_are_nul_terminated_on_the_wire() {
        let frame = Message::EventCreate {
            event_id: 1,
            event: "abc".into(),
        }
        .encode();
        // opcode, u32 id, u32 len=4, 'a' 'b' 'c' 0
        assert_eq!(&frame[..], b"+\x01\x00\x00\x00\x04\x00\x00\x00abc\x00");
    }

    #[test]
    fn null_and_empty_nullstrings_differ() {
        let none = Message::Reply {
            callid: 0,
            error: None,
            info: None,
            result: Value::Null,
        }
        .encode();
        let empty = Message::Reply {
            callid: 0,
            error: Some(String::new()),
            info: None,
            result: Value::Null,
        }
        .encode();
        assert_ne!(none, empty);
        assert_matches!(
            Message::decode(&empty),
            Ok(Message::Reply { error: Some(e), .. }) if e.is_empty()
        );
    }

    #[test]
    fn non_json_payload_survives_as_string() {
        // A peer may send bare text where JSON is expected.
        let mut w = Writer::new(OP_EVENT_BROADCAST);
        w.string("ev");
        w.string("not json at all");
        let frame = w.finish();
        assert_matches!(
            Message::decode(&frame),
            Ok(Message::EventBroadcast { data, .. }) if data == json!("not json at all")
        );
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(Message::decode(b"Z"), Err(DecodeError::UnknownOpcode(b'Z')));
    }

    #[test]
    fn truncated_fields_are_rejected() {
        let frame = Message::Describe { descid: 5 }.encode();
        for cut in 1..frame.len() {
            assert_matches!(
                Message::decode(&frame[..cut]),
                Err(DecodeError::Truncated { .. })
            );
        }
    }

    #[test]
    fn string_without_terminator_is_rejected() {
        // length 3 but last byte is not NUL
        let frame = b"+\x01\x00\x00\x00\x03\x00\x00\x00abc";
        assert_eq!(Message::decode(frame), Err(DecodeError::BadString));
    }

    #[test]
    fn zero_length_string_is_rejected() {
        // event name is a plain string: length 0 is not the null value
        let frame = b"+\x01\x00\x00\x00\x00\x00\x00\x00";
        assert_eq!(Message::decode(frame), Err(DecodeError::BadString));
    }
}

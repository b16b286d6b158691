//! The on-wire message envelope.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Reserved method name for the discovery RPC.
///
/// Every endpoint answers it with the sorted list of fully qualified method
/// names its registry holds, without dispatching to user code.
pub const GET_METHODS: &str = "getMethods";

/// The envelope shared by requests, responses, and error replies.
///
/// Exactly one JSON object travels per logical message. A non-empty `fn`
/// field marks a request; responses leave it empty. `args` and `result` stay
/// raw until the destination type is known, so decoding is deferred to the
/// moment the handler (or caller) is resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Sequence number assigned by the sender and round-tripped verbatim by
    /// the responder. `0` is reserved for untagged notifications, which are
    /// never responded to.
    #[serde(default)]
    pub id: u64,

    /// Fully qualified method name, `Service.Method`. Empty on responses,
    /// including error responses.
    #[serde(rename = "fn", default, skip_serializing_if = "String::is_empty")]
    pub func: String,

    /// Encoded call arguments; requests only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Box<RawValue>>,

    /// Encoded reply value; successful responses only. An empty reply is
    /// still encoded (as `null`), so a success response always carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,

    /// Failure report; error responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Message {
    /// Build a request (or, with `id == 0`, a notification).
    pub fn request(id: u64, func: impl Into<String>, args: Option<Box<RawValue>>) -> Self {
        Self {
            id,
            func: func.into(),
            args,
            ..Self::default()
        }
    }

    /// Build a success response carrying an encoded reply.
    pub fn response(id: u64, result: Box<RawValue>) -> Self {
        Self {
            id,
            result: Some(result),
            ..Self::default()
        }
    }

    /// Build an error response.
    pub fn error_response(id: u64, msg: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(RemoteError::new(msg)),
            ..Self::default()
        }
    }

    /// Whether this envelope is a request. Responses have an empty `fn`.
    pub fn is_request(&self) -> bool {
        !self.func.is_empty()
    }

    /// Decode the argument payload into the handler's declared shape.
    ///
    /// A missing payload decodes as `null`, which is acceptable when the
    /// declared type has a natural empty value (`()`, `Option<T>`, ...).
    pub fn decode_args<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.args {
            Some(raw) => serde_json::from_str(raw.get()),
            None => serde_json::from_str("null"),
        }
    }
}

/// Encode a value into the raw payload representation.
pub(crate) fn encode_payload<T: Serialize + ?Sized>(
    value: &T,
) -> Result<Box<RawValue>, serde_json::Error> {
    serde_json::value::to_raw_value(value)
}

/// The structured `error` member of a failure response.
///
/// An open struct: `msg` is the only mandatory member, and unknown members
/// sent by other implementations are ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human-readable failure description.
    pub msg: String,
}

impl RemoteError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let args = encode_payload(&serde_json::json!({ "Msg": "Hello, world" })).unwrap();
        let msg = Message::request(42, "Greeting.Greet", Some(args));
        let wire = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            wire,
            r#"{"id":42,"fn":"Greeting.Greet","args":{"Msg":"Hello, world"}}"#
        );
    }

    #[test]
    fn response_wire_shape() {
        let msg = Message::response(7, encode_payload(&3u32).unwrap());
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"id":7,"result":3}"#);
    }

    #[test]
    fn error_wire_shape() {
        let msg = Message::error_response(7, "No such function.");
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"id":7,"error":{"msg":"No such function."}}"#
        );
    }

    #[test]
    fn notification_keeps_id_zero_on_the_wire() {
        let msg = Message::request(0, "Log.Line", None);
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"id":0,"fn":"Log.Line"}"#);
    }

    #[test]
    fn classification_by_func() {
        let req: Message = serde_json::from_str(r#"{"id":1,"fn":"A.B","args":[1,2]}"#).unwrap();
        assert!(req.is_request());

        let resp: Message = serde_json::from_str(r#"{"id":1,"result":[1,2]}"#).unwrap();
        assert!(!resp.is_request());
    }

    #[test]
    fn missing_id_decodes_as_notification() {
        let msg: Message = serde_json::from_str(r#"{"fn":"Log.Line"}"#).unwrap();
        assert_eq!(msg.id, 0);
        assert!(msg.is_request());
    }

    #[test]
    fn error_struct_is_open() {
        let msg: Message =
            serde_json::from_str(r#"{"id":3,"error":{"msg":"boom","code":500}}"#).unwrap();
        assert_eq!(msg.error.unwrap().msg, "boom");
    }

    #[test]
    fn args_stay_raw_until_decoded() {
        let msg: Message =
            serde_json::from_str(r#"{"id":9,"fn":"Echo.Echo","args":{"msg":"hi"}}"#).unwrap();
        assert_eq!(msg.args.as_ref().unwrap().get(), r#"{"msg":"hi"}"#);

        #[derive(Deserialize)]
        struct EchoArgs {
            msg: String,
        }
        let args: EchoArgs = msg.decode_args().unwrap();
        assert_eq!(args.msg, "hi");
    }

    #[test]
    fn missing_args_decode_as_null() {
        let msg: Message = serde_json::from_str(r#"{"id":9,"fn":"Peer.Address"}"#).unwrap();
        let _: () = msg.decode_args().unwrap();
        let opt: Option<String> = msg.decode_args().unwrap();
        assert!(opt.is_none());
        assert!(msg.decode_args::<String>().is_err());
    }
}

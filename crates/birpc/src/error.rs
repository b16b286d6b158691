//! Error types.

use core::fmt;

use crate::message::RemoteError;

/// Transport-level failures reported by a [`Codec`](crate::Codec).
#[derive(Debug)]
pub enum CodecError {
    /// The connection is closed, by the peer or by a local `close`.
    Closed,
    /// The underlying transport failed.
    Io(std::io::Error),
    /// Envelope (de)serialization failed.
    Json(serde_json::Error),
    /// The peer violated the framing contract.
    Protocol(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Json(e) => write!(f, "message encoding error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Failures of a single outbound call.
///
/// None of these terminate the endpoint; transport and protocol errors
/// surface through [`ServeError`] instead.
#[derive(Debug)]
pub enum CallError {
    /// The endpoint has shut down; no message was or will be sent.
    Closed,
    /// The peer answered with an error reply; carries the peer's `msg`.
    Remote(RemoteError),
    /// The peer's success reply carried no result payload.
    MissingResult,
    /// Decoding the result payload into the caller's reply type failed.
    Decode(serde_json::Error),
    /// Encoding the arguments failed; no message was sent.
    Encode(serde_json::Error),
    /// The deadline fired before the response arrived. The request is
    /// already on the wire, so whether a retry is safe is up to the caller.
    DeadlineExceeded,
    /// Writing the request to the codec failed.
    Transport(CodecError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "birpc: endpoint is shut down"),
            Self::Remote(e) => write!(f, "{}", e.msg),
            Self::MissingResult => write!(f, "response must set result"),
            Self::Decode(e) => write!(f, "unmarshaling result: {e}"),
            Self::Encode(e) => write!(f, "marshaling args: {e}"),
            Self::DeadlineExceeded => write!(f, "birpc: call timeout, dont resend"),
            Self::Transport(e) => write!(f, "sending request: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Decode(e) | Self::Encode(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Why [`Endpoint::serve`](crate::Endpoint::serve) terminated.
#[derive(Debug)]
pub enum ServeError {
    /// Reading from the codec failed.
    Read(CodecError),
    /// Writing a reply from the reader loop failed.
    Write(CodecError),
    /// No pong arrived within twice the ping period.
    PingTimeout,
    /// Emitting a ping failed.
    PingSend,
    /// The peer answered a sequence number with no pending call.
    UnknownSeq(u64),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(e) => write!(f, "reading message: {e}"),
            Self::Write(e) => write!(f, "writing reply: {e}"),
            Self::PingTimeout => write!(f, "remote connection is timeout."),
            Self::PingSend => write!(f, "remote connection is closed."),
            Self::UnknownSeq(id) => write!(f, "peer responded with unknown seq {id}"),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read(e) | Self::Write(e) => Some(e),
            _ => None,
        }
    }
}

/// Service registration failures.
#[derive(Debug)]
pub enum RegisterError {
    /// The service declared no methods.
    NoMethods,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMethods => write!(f, "no suitable methods"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// An error produced by a method handler.
///
/// Its message becomes the `error.msg` member of the reply. Handlers
/// typically build one from whatever error they hit:
///
/// ```
/// use birpc::MethodError;
///
/// fn lookup(key: &str) -> Result<u64, MethodError> {
///     Err(MethodError::new(format!("no such key: {key}")))
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError(String);

impl MethodError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// The message reported to the caller.
    pub fn msg(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        Self(msg.to_owned())
    }
}

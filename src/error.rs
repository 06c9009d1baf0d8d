//! Error taxonomy shared by the broker, the VM, and operators.
//!
//! Codes are bounded and stable: they name protocol/refusal states, not
//! library implementation details. When a failure crosses the wire it is
//! rendered as a `reason` string of the form `"<Code>: <detail>"` inside a
//! `respond` or `respond_execute` body.

use std::fmt;

use thiserror::Error;

/// Stable error codes carried in packet bodies when `status=false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    MalformedValue,
    MalformedPacket,
    InvalidPacket,
    NotConnected,
    ClientGone,
    NoSubscriber,
    AlreadySubscribed,
    UnknownTransaction,
    NoSuchFunction,
    NoSuchComponent,
    NoSuchMethod,
    ComponentExists,
    TypeError,
    RangeError,
    ValueError,
    ContextLengthLimit,
    InvalidToolCall,
    OperatorTerminated,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedValue => "MalformedValue",
            ErrorCode::MalformedPacket => "MalformedPacket",
            ErrorCode::InvalidPacket => "InvalidPacket",
            ErrorCode::NotConnected => "NotConnected",
            ErrorCode::ClientGone => "ClientGone",
            ErrorCode::NoSubscriber => "NoSubscriber",
            ErrorCode::AlreadySubscribed => "AlreadySubscribed",
            ErrorCode::UnknownTransaction => "UnknownTransaction",
            ErrorCode::NoSuchFunction => "NoSuchFunction",
            ErrorCode::NoSuchComponent => "NoSuchComponent",
            ErrorCode::NoSuchMethod => "NoSuchMethod",
            ErrorCode::ComponentExists => "ComponentExists",
            ErrorCode::TypeError => "TypeError",
            ErrorCode::RangeError => "RangeError",
            ErrorCode::ValueError => "ValueError",
            ErrorCode::ContextLengthLimit => "ContextLengthLimit",
            ErrorCode::InvalidToolCall => "InvalidToolCall",
            ErrorCode::OperatorTerminated => "OperatorTerminated",
            ErrorCode::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input value had the wrong type for a field.
#[derive(Debug, Error, Clone)]
#[error("{context}: field `{field}` expected {expected}, got {got}")]
pub struct TypeError {
    pub context: String,
    pub field: String,
    pub expected: String,
    pub got: String,
}

impl TypeError {
    pub fn new(
        context: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            field: field.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// A required field is missing or outside its domain.
#[derive(Debug, Error, Clone)]
#[error("{context}: field `{field}` missing or out of range")]
pub struct RangeError {
    pub context: String,
    pub field: String,
}

impl RangeError {
    pub fn new(context: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            field: field.into(),
        }
    }
}

/// A field carried a value outside the accepted set.
#[derive(Debug, Error, Clone)]
#[error("{context}: field `{field}` expected {expected}, got `{got}`")]
pub struct ValueError {
    pub context: String,
    pub field: String,
    pub expected: String,
    pub got: String,
}

impl ValueError {
    pub fn new(
        context: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            field: field.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Failure raised inside an operator or routed back in a `respond_execute`
/// body. The VM catches these at its boundary and forwards the rendered
/// reason; it never aborts on one.
#[derive(Debug, Clone)]
pub struct OperatorError {
    pub code: ErrorCode,
    pub detail: String,
}

impl std::error::Error for OperatorError {}

impl OperatorError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn code(code: ErrorCode) -> Self {
        Self {
            code,
            detail: String::new(),
        }
    }

    /// The wire form carried in `respond_execute` bodies.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(self.code.as_str())
        } else {
            write!(f, "{}: {}", self.code, self.detail)
        }
    }
}

impl From<TypeError> for OperatorError {
    fn from(err: TypeError) -> Self {
        OperatorError::new(ErrorCode::TypeError, err.to_string())
    }
}

impl From<RangeError> for OperatorError {
    fn from(err: RangeError) -> Self {
        OperatorError::new(ErrorCode::RangeError, err.to_string())
    }
}

impl From<ValueError> for OperatorError {
    fn from(err: ValueError) -> Self {
        OperatorError::new(ErrorCode::ValueError, err.to_string())
    }
}

/// Host-facing errors from the endpoint registry and broker clients.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("endpoint `{0}` is already occupied")]
    UrlOccupied(String),
    #[error("no broker is running at `{0}`")]
    UnknownEndpoint(String),
    #[error("a VM is already running at `{0}`")]
    VmAlreadyRunning(String),
    #[error("connect to `{url}` failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("peer mailbox full")]
    MailboxFull,
    #[error("packet encode failed: {0}")]
    Encode(String),
    #[error("VM startup failed: {0}")]
    VmStartup(String),
    #[error(transparent)]
    Operator(#[from] OperatorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_renders_code_and_detail() {
        let err = OperatorError::new(ErrorCode::NoSuchFunction, "echo2");
        assert_eq!(err.reason(), "NoSuchFunction: echo2");
        let bare = OperatorError::code(ErrorCode::Cancelled);
        assert_eq!(bare.reason(), "Cancelled");
    }

    #[test]
    fn structured_payloads_render_fields() {
        let err: OperatorError = TypeError::new("echo", "in", "string", "map").into();
        assert_eq!(err.code, ErrorCode::TypeError);
        assert!(err.reason().contains("expected string, got map"));
    }
}

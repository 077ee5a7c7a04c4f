//! Structured exceptions carried on RPC responses.

use serde::Serialize;

/// What went wrong, independent of the transport that reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// Malformed arguments or unparseable payload.
    BadRequest,
    /// Dial, read, write or timeout failure towards an upstream.
    Transport,
    /// Wire codec failure surfaced at a transport boundary.
    Codec,
    /// No location rule or cluster accepts the request.
    ServiceNotFound,
    /// A handler panicked; the request was aborted.
    Panic,
}

/// Exception attached to a response: kind, message, HTTP-family code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: String,
    pub code: u16,
}

impl Exception {
    #[must_use]
    pub fn new(kind: ExceptionKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code,
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::BadRequest, 400, message)
    }

    #[must_use]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Codec, 400, message)
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Transport, 503, message)
    }

    #[must_use]
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Transport, 502, message)
    }

    #[must_use]
    pub fn service_not_found(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::ServiceNotFound, 503, message)
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_codes() {
        assert_eq!(Exception::bad_request("x").code, 400);
        assert_eq!(Exception::unavailable("x").code, 503);
        assert_eq!(Exception::bad_gateway("x").code, 502);
        let ex = Exception::service_not_found("service not found");
        assert_eq!(ex.code, 503);
        assert_eq!(ex.kind, ExceptionKind::ServiceNotFound);
    }

    #[test]
    fn serializes_to_json() {
        let ex = Exception::service_not_found("service not found");
        let json = serde_json::to_string(&ex).unwrap();
        assert!(json.contains("\"service_not_found\""));
        assert!(json.contains("503"));
    }
}

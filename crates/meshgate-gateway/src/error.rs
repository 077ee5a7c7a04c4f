//! Gateway error types.

use http::StatusCode;
use meshgate_proto::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no such host: {0}")]
    NoSuchHost(String),

    #[error("dns failure: {0}")]
    Dns(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request build failed: {0}")]
    RequestBuild(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("request timeout")]
    Timeout,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The HTTP status this error maps to at the proxy boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RequestBuild(_) | GatewayError::Codec(_) => StatusCode::BAD_REQUEST,
            GatewayError::ConnectionFailed(_)
            | GatewayError::Upstream(_)
            | GatewayError::Timeout
            | GatewayError::NoSuchHost(_)
            | GatewayError::Dns(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ServiceNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::Timeout.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::ServiceNotFound("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Codec(CodecError::Underflow).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}

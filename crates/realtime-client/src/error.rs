use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const MAX_MESSAGE_SIZE_EXCEEDED: u32 = 40009;
    pub const INVALID_CLIENT_ID: u32 = 40012;
    pub const DELTA_DECODE_FAILED: u32 = 40018;
    pub const DELTA_DECODER_MISSING: u32 = 40019;
    pub const INCOMPATIBLE_CLIENT_ID: u32 = 40102;
    pub const TOKEN_ERROR_MIN: u32 = 40140;
    pub const TOKEN_ERROR_MAX: u32 = 40150;
    pub const NO_MEANS_TO_RENEW: u32 = 40171;
    pub const INTERNAL: u32 = 50000;
    pub const UNKNOWN_CHANNEL: u32 = 50001;
    pub const UNKNOWN_CONNECTION: u32 = 50002;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const DISCONNECTED: u32 = 80003;
    pub const SUPERSEDED_TRANSPORT: u32 = 80016;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const AUTH_PROVIDER_FAILED: u32 = 80019;
    pub const INVALID_STATE: u32 = 90000;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90001;
    pub const CHANNEL_TIMEOUT: u32 = 90007;
    pub const PRESENCE_STATE_MISMATCH: u32 = 91001;
    pub const PRESENCE_REENTER_FAILED: u32 = 91004;
}

/// Error carried on the wire and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip)]
    pub cause: Option<Box<ErrorInfo>>,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        match (self.code, self.status_code) {
            (Some(code), Some(status)) => write!(f, " (code = {code}, status = {status})")?,
            (Some(code), None) => write!(f, " (code = {code})")?,
            (None, Some(status)) => write!(f, " (status = {status})")?,
            (None, None) => {}
        }
        if let Some(cause) = &self.cause {
            write!(f, "; cause: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, code: u32, status_code: u16) -> Self {
        Self {
            code: Some(code),
            status_code: Some(status_code),
            message: message.into(),
            href: None,
            cause: None,
        }
    }

    /// An error with no code, used for raw network failures.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn disconnected() -> Self {
        Self::new(
            "Connection to server temporarily unavailable",
            codes::DISCONNECTED,
            400,
        )
    }

    pub fn suspended() -> Self {
        Self::new(
            "Connection to server unavailable",
            codes::CONNECTION_SUSPENDED,
            400,
        )
    }

    pub fn failed() -> Self {
        Self::new(
            "Connection failed or disconnected by server",
            codes::CONNECTION_FAILED,
            400,
        )
    }

    pub fn closing() -> Self {
        Self::new("Connection closing", codes::CONNECTION_CLOSED, 400)
    }

    pub fn closed() -> Self {
        Self::new("Connection closed", codes::CONNECTION_CLOSED, 400)
    }

    pub fn unknown_connection() -> Self {
        Self::new("Internal connection error", codes::UNKNOWN_CONNECTION, 500)
    }

    pub fn unknown_channel() -> Self {
        Self::new("Internal channel error", codes::UNKNOWN_CHANNEL, 500)
    }

    pub fn is_token_error(&self) -> bool {
        is_token_error(self)
    }
}

/// Token errors are recoverable by fetching a fresh credential.
pub fn is_token_error(err: &ErrorInfo) -> bool {
    matches!(err.code, Some(code) if (codes::TOKEN_ERROR_MIN..codes::TOKEN_ERROR_MAX).contains(&code))
}

/// Whether a connection error calls for trying another host or transport.
pub fn is_retriable(err: &ErrorInfo) -> bool {
    let (Some(status), Some(code)) = (err.status_code, err.code) else {
        return true;
    };
    if status >= 500 {
        return true;
    }
    matches!(
        code,
        codes::DISCONNECTED
            | codes::CONNECTION_SUSPENDED
            | codes::CONNECTION_FAILED
            | codes::CONNECTION_CLOSED
            | codes::UNKNOWN_CONNECTION
            | codes::UNKNOWN_CHANNEL
    )
}

/// Errors returned by the async handle methods.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Service(#[from] ErrorInfo),
    #[error("realtime client has shut down")]
    Shutdown,
}

impl RealtimeError {
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            RealtimeError::Service(info) => Some(info),
            RealtimeError::Shutdown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_error_range_is_half_open() {
        assert!(is_token_error(&ErrorInfo::new("expired", 40140, 401)));
        assert!(is_token_error(&ErrorInfo::new("expired", 40149, 401)));
        assert!(!is_token_error(&ErrorInfo::new("nope", 40150, 401)));
        assert!(!is_token_error(&ErrorInfo::network("reset")));
    }

    #[test]
    fn retriable_rules() {
        assert!(is_retriable(&ErrorInfo::network("socket hang up")));
        assert!(is_retriable(&ErrorInfo::new("boom", 50000, 500)));
        assert!(is_retriable(&ErrorInfo::disconnected()));
        assert!(!is_retriable(&ErrorInfo::new("rate limited", 42910, 429)));
    }

    #[test]
    fn display_includes_code_and_cause() {
        let err = ErrorInfo::new("outer", 80019, 401).with_cause(ErrorInfo::network("inner"));
        assert_eq!(
            err.to_string(),
            "outer (code = 80019, status = 401); cause: inner"
        );
    }

    #[test]
    fn deserializes_wire_error() {
        let err: ErrorInfo =
            serde_json::from_str(r#"{"code":40142,"statusCode":401,"message":"Token expired"}"#)
                .unwrap();
        assert!(err.is_token_error());
        assert_eq!(err.status_code, Some(401));
    }
}

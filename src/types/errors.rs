//! Crate-wide error hierarchy.

use thiserror::Error;

/// The taxonomy of errors the proxy surfaces to downstream callers.
///
/// Each variant maps to a `data.code` value attached to a JSON-RPC error
/// response via [`ProxyError::json_rpc_code`]; the outer JSON-RPC `code`
/// field itself always comes from the fixed set in the wire protocol
/// (parse/invalid-request/method-not-found/invalid-params/internal).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("service not found: {name}")]
    ServiceNotFound { name: String },

    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("service not ready: {name}")]
    ServiceNotReady { name: String },

    #[error("service already running: {name}")]
    AlreadyRunning { name: String },

    #[error("service not running: {name}")]
    NotRunning { name: String },

    #[error("transport error on {service}: {message}")]
    Transport { service: String, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("validation error: {reason}")]
    Validation { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ProxyError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn service_not_found(name: impl Into<String>) -> Self {
        Self::ServiceNotFound { name: name.into() }
    }

    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    pub fn service_not_ready(name: impl Into<String>) -> Self {
        Self::ServiceNotReady { name: name.into() }
    }

    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning { name: name.into() }
    }

    pub fn not_running(name: impl Into<String>) -> Self {
        Self::NotRunning { name: name.into() }
    }

    pub fn transport(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal { reason: reason.into() }
    }

    /// The `data.code` string carried in a JSON-RPC error's `data` field.
    pub fn data_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG_ERROR",
            Self::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::ServiceNotReady { .. } => "SERVICE_NOT_READY",
            Self::AlreadyRunning { .. } | Self::NotRunning { .. } => "VALIDATION_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// The JSON-RPC 2.0 standard error code this error maps to on the wire.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::ToolNotFound { .. } => -32601,
            Self::Validation { .. } | Self::AlreadyRunning { .. } | Self::NotRunning { .. } => -32602,
            _ => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_codes_match_taxonomy() {
        assert_eq!(ProxyError::service_not_ready("calc").data_code(), "SERVICE_NOT_READY");
        assert_eq!(ProxyError::tool_not_found("calc__add").data_code(), "TOOL_NOT_FOUND");
        assert_eq!(ProxyError::tool_not_found("calc__add").json_rpc_code(), -32601);
    }

    #[test]
    fn timeout_error_carries_operation_and_duration() {
        let err = ProxyError::timeout("tools/call", 8000);
        assert!(err.to_string().contains("8000ms"));
    }
}

use crate::capability::Capability;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

/// Top-level error type for the Switchyard orchestrator.
///
/// Cross-component failures (routing, workflow) reach callers as values of
/// this type; they never cross the bus as panics.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// No `ready` agent offers the requested capability.
    #[error("No capable agent for '{0}'")]
    NoCapableAgent(Capability),

    /// An agent's handler reported a failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A deadline elapsed (health check, request, sandbox operation).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A sandboxed operation exceeded its configured bounds.
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Unrecoverable infrastructure failure that needs an operator.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// An error from the message bus.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error from the agent registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// An error from the workflow engine.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An error from the sandbox executor.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Input rejected before any work was done.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`SwitchyardError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// No capable agent; surfaced immediately, never retried silently.
    Routing,
    /// An agent's `handle` failed.
    Handler,
    /// A deadline was exceeded.
    Timeout,
    /// A sandbox bound was exceeded.
    ResourceLimit,
    /// Not recoverable locally.
    Fatal,
    /// Anything else (validation, config, serialization, ...).
    Other,
}

impl SwitchyardError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SwitchyardError::NoCapableAgent(_) => ErrorClass::Routing,
            SwitchyardError::Handler(_) => ErrorClass::Handler,
            SwitchyardError::Timeout(_) => ErrorClass::Timeout,
            SwitchyardError::ResourceLimit(_) => ErrorClass::ResourceLimit,
            SwitchyardError::Fatal(_) => ErrorClass::Fatal,
            _ => ErrorClass::Other,
        }
    }

    /// Whether the error is fatal for the component that raised it.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Stable snake_case code used in error-message payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SwitchyardError::NoCapableAgent(_) => "no_capable_agent",
            SwitchyardError::Handler(_) => "handler",
            SwitchyardError::Timeout(_) => "timeout",
            SwitchyardError::ResourceLimit(_) => "resource_limit",
            SwitchyardError::Fatal(_) => "fatal",
            SwitchyardError::Bus(_) => "bus",
            SwitchyardError::Registry(_) => "registry",
            SwitchyardError::Workflow(_) => "workflow",
            SwitchyardError::Sandbox(_) => "sandbox",
            SwitchyardError::Validation(_) => "validation",
            SwitchyardError::Config(_) => "config",
            SwitchyardError::NotFound(_) => "not_found",
            SwitchyardError::Json(_) => "json",
            SwitchyardError::Io(_) => "io",
        }
    }

    /// Text carried next to [`code`](Self::code) in an error payload: the bare
    /// message for variants [`from_code`](Self::from_code) rebuilds, the full
    /// display for the rest.
    pub fn detail(&self) -> String {
        match self {
            SwitchyardError::Handler(m)
            | SwitchyardError::Timeout(m)
            | SwitchyardError::ResourceLimit(m)
            | SwitchyardError::Fatal(m)
            | SwitchyardError::Sandbox(m)
            | SwitchyardError::Validation(m)
            | SwitchyardError::NotFound(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a code and message, as carried in an error-kind
    /// [`Message`](crate::Message) payload. Unknown codes become `Handler`.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "timeout" => SwitchyardError::Timeout(message),
            "resource_limit" => SwitchyardError::ResourceLimit(message),
            "fatal" => SwitchyardError::Fatal(message),
            "validation" => SwitchyardError::Validation(message),
            "sandbox" => SwitchyardError::Sandbox(message),
            "not_found" => SwitchyardError::NotFound(message),
            _ => SwitchyardError::Handler(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            SwitchyardError::NoCapableAgent(Capability::GenerateSql).class(),
            ErrorClass::Routing
        );
        assert_eq!(
            SwitchyardError::Timeout("x".into()).class(),
            ErrorClass::Timeout
        );
        assert_eq!(
            SwitchyardError::Config("x".into()).class(),
            ErrorClass::Other
        );
        assert!(SwitchyardError::Fatal("queue".into()).is_fatal());
    }

    #[test]
    fn test_code_roundtrip() {
        let err = SwitchyardError::ResourceLimit("rows".into());
        let back = SwitchyardError::from_code(err.code(), "rows");
        assert_eq!(back.class(), ErrorClass::ResourceLimit);

        let unknown = SwitchyardError::from_code("something_else", "boom");
        assert_eq!(unknown.class(), ErrorClass::Handler);
    }

    #[test]
    fn test_detail_rebuilds_same_display() {
        let err = SwitchyardError::Handler("requested failure".into());
        assert_eq!(err.detail(), "requested failure");
        let back = SwitchyardError::from_code(err.code(), err.detail());
        assert_eq!(back.to_string(), "Handler error: requested failure");

        let bus = SwitchyardError::Bus("closed".into());
        assert_eq!(bus.detail(), "Bus error: closed");
    }

    #[test]
    fn test_display() {
        let err = SwitchyardError::NoCapableAgent(Capability::ExecuteQuery);
        assert_eq!(err.to_string(), "No capable agent for 'execute-query'");
    }
}

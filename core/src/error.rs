use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, MarcusError>;

/// Error categories for the coordination server.
///
/// Every failure in the system is tagged with exactly one kind. The kind
/// determines recoverability: `Integration`, `Transient` and
/// `ResourceExhausted` errors may be retried; the rest fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An external service (Kanban board, classifier) failed
    Integration,
    /// Missing credentials or an invalid option
    Configuration,
    /// A coordination rule was violated (e.g. double lease grant)
    BusinessLogic,
    /// Storage unavailable, timeout, or other transient condition
    Transient,
    /// Cache full, memory pressure
    ResourceExhausted,
    /// Unauthorized tool call
    Security,
    /// Storage corruption or schema mismatch
    Storage,
}

impl ErrorKind {
    /// Whether errors of this kind are safe to retry
    pub fn recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::Integration | ErrorKind::Transient | ErrorKind::ResourceExhausted
        )
    }
}

/// Machine-readable discriminator for failures that callers branch on.
///
/// The kind classifies an error for policy (retry or not); the code names
/// the specific condition so call sites do not have to match on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    General,
    /// Another live lease exists for the task (or the agent)
    LeaseConflict,
    /// The lease is in a state that cannot be renewed or completed
    LeaseNotActive,
    /// A circuit breaker is open and the call was rejected fast
    CircuitOpen,
    /// A tool was invoked while no project is active
    NoActiveProject,
    /// The client's role does not allow the requested tool
    Unauthorized,
    /// The storage backend could not be reached
    StorageUnavailable,
    /// The storage backend returned corrupted data
    StorageCorrupt,
    /// The task graph failed strict validation
    InvalidGraph,
    /// The requested tool name is not known
    UnknownTool,
    /// The operation exceeded its deadline
    Timeout,
}

/// Structured context attached to every error.
///
/// All fields are optional; constructors fill in what they know and the
/// layers above enrich the envelope as it propagates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

/// The common error envelope carried by every failure in the system.
///
/// # Examples
///
/// ```rust
/// use marcus_core::error::{ErrorCode, ErrorKind, MarcusError};
///
/// let err = MarcusError::lease_conflict("task-7")
///     .with_operation("grant")
///     .with_agent("agent-1");
/// assert_eq!(err.kind, ErrorKind::BusinessLogic);
/// assert_eq!(err.code, ErrorCode::LeaseConflict);
/// assert!(!err.recoverable);
/// ```
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct MarcusError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl MarcusError {
    /// Create an error with the given kind; recoverability follows the kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: ErrorCode::General,
            message: message.into(),
            context: ErrorContext::default(),
            recoverable: kind.recoverable(),
            timestamp: Utc::now(),
        }
    }

    fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    /// External service failure (retryable)
    pub fn integration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integration, message)
    }

    /// Missing credentials or invalid option (fatal)
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Coordination rule violation (fatal)
    pub fn business_logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessLogic, message)
    }

    /// Transient condition such as a timeout (retryable)
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Cache or memory pressure (retryable)
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    /// Unauthorized tool call (fatal)
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message).with_code(ErrorCode::Unauthorized)
    }

    /// Storage corruption or schema mismatch (fatal)
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    /// Another live lease exists for the task or agent
    pub fn lease_conflict(task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let mut err = Self::new(
            ErrorKind::BusinessLogic,
            format!("A live lease already exists for task '{task_id}'"),
        )
        .with_code(ErrorCode::LeaseConflict);
        err.context.task_id = Some(task_id);
        err
    }

    /// The lease cannot be renewed or completed from its current state
    pub fn lease_not_active(lease_id: impl Into<String>) -> Self {
        let lease_id = lease_id.into();
        let mut err = Self::new(
            ErrorKind::BusinessLogic,
            format!("Lease '{lease_id}' is not in a renewable state"),
        )
        .with_code(ErrorCode::LeaseNotActive);
        err.context.detail.insert("lease_id".into(), lease_id);
        err
    }

    /// A tool requiring an active project was invoked without one
    pub fn no_active_project() -> Self {
        Self::new(ErrorKind::BusinessLogic, "No project is currently active")
            .with_code(ErrorCode::NoActiveProject)
    }

    /// Role-gated tool invoked outside the caller's role
    pub fn unauthorized(tool: &str, role: &str) -> Self {
        Self::new(
            ErrorKind::Security,
            format!("Role '{role}' is not allowed to call tool '{tool}'"),
        )
        .with_code(ErrorCode::Unauthorized)
    }

    /// Circuit breaker rejected the call without attempting it
    pub fn circuit_open(resource: &str) -> Self {
        let mut err = Self::new(
            ErrorKind::Transient,
            format!("Circuit breaker for '{resource}' is open"),
        )
        .with_code(ErrorCode::CircuitOpen);
        err.context.detail.insert("resource".into(), resource.into());
        err
    }

    /// Storage backend unreachable (retryable)
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message).with_code(ErrorCode::StorageUnavailable)
    }

    /// Storage backend returned corrupt data (fatal)
    pub fn storage_corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message).with_code(ErrorCode::StorageCorrupt)
    }

    /// Strict graph validation failed
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessLogic, message).with_code(ErrorCode::InvalidGraph)
    }

    /// The requested tool name is not part of the surface
    pub fn unknown_tool(tool: &str) -> Self {
        Self::new(ErrorKind::BusinessLogic, format!("Unknown tool '{tool}'"))
            .with_code(ErrorCode::UnknownTool)
    }

    /// Deadline exceeded (retryable)
    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorKind::Transient,
            format!("Operation '{operation}' exceeded its deadline"),
        )
        .with_code(ErrorCode::Timeout)
        .with_operation(operation)
    }

    /// Attach the operation name to the context
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    /// Attach the project id to the context
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.context.project_id = Some(project_id.into());
        self
    }

    /// Attach the task id to the context
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.context.task_id = Some(task_id.into());
        self
    }

    /// Attach the agent id to the context
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.context.agent_id = Some(agent_id.into());
        self
    }

    /// Attach a free-form context entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.detail.insert(key.into(), value.into());
        self
    }

    pub fn is_lease_conflict(&self) -> bool {
        self.code == ErrorCode::LeaseConflict
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code == ErrorCode::CircuitOpen
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code == ErrorCode::Unauthorized
    }

    pub fn is_no_active_project(&self) -> bool {
        self.code == ErrorCode::NoActiveProject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_follows_kind() {
        assert!(MarcusError::integration("kanban down").recoverable);
        assert!(MarcusError::transient("timeout").recoverable);
        assert!(MarcusError::resource_exhausted("cache full").recoverable);

        assert!(!MarcusError::configuration("missing key").recoverable);
        assert!(!MarcusError::business_logic("rule violated").recoverable);
        assert!(!MarcusError::security("nope").recoverable);
        assert!(!MarcusError::storage("corrupt page").recoverable);
    }

    #[test]
    fn lease_conflict_carries_task_context() {
        let err = MarcusError::lease_conflict("task-42").with_agent("agent-1");
        assert!(err.is_lease_conflict());
        assert_eq!(err.context.task_id.as_deref(), Some("task-42"));
        assert_eq!(err.context.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(err.kind, ErrorKind::BusinessLogic);
    }

    #[test]
    fn circuit_open_is_transient() {
        let err = MarcusError::circuit_open("classifier");
        assert!(err.is_circuit_open());
        assert!(err.recoverable);
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(
            err.context.detail.get("resource").map(String::as_str),
            Some("classifier")
        );
    }

    #[test]
    fn display_is_the_message() {
        let err = MarcusError::unauthorized("create_project", "observer");
        assert_eq!(
            format!("{err}"),
            "Role 'observer' is not allowed to call tool 'create_project'"
        );
    }

    #[test]
    fn envelope_serializes_with_kind_and_context() {
        let err = MarcusError::storage_unavailable("db locked").with_operation("store");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "transient");
        assert_eq!(value["code"], "storage_unavailable");
        assert_eq!(value["recoverable"], true);
        assert_eq!(value["context"]["operation"], "store");
    }
}

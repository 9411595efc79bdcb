//! Error taxonomy for the workflow execution core.
//!
//! Every failure the core raises is a tagged value exposing a stable error
//! code, a category, a severity, a recoverability flag, suggested recovery
//! actions, and a structured context map. Subtypes add typed fields on top
//! of that shared shape.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable classification used for error-handling policy (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Dependency,
    Resource,
    Execution,
    Network,
    Io,
    Configuration,
    Permission,
    Timeout,
    ExternalApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Fallback,
    ManualIntervention,
    Abort,
}

/// Free-form structured context attached to an error: project id, step name,
/// execution id plus arbitrary caller-supplied keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub project_id: Option<String>,
    pub step_name: Option<String>,
    pub execution_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Accessor trait every error subtype in the taxonomy implements so callers
/// can branch on classification without matching on the concrete enum.
pub trait ErrorInfo {
    fn code(&self) -> &str;
    fn category(&self) -> ErrorCategory;
    fn severity(&self) -> Severity;
    fn is_recoverable(&self) -> bool;
    fn suggested_actions(&self) -> Vec<RecoveryAction>;
}

/// Default suggested-action classifier: network/timeout favor retry; a
/// missing-file style IO error favors fallback then manual intervention;
/// permission errors require a human; everything else gets a conservative
/// retry-then-manual pair.
pub fn default_suggested_actions(category: ErrorCategory, is_missing_file: bool) -> Vec<RecoveryAction> {
    match category {
        ErrorCategory::Network | ErrorCategory::Timeout => vec![RecoveryAction::Retry],
        ErrorCategory::Io if is_missing_file => {
            vec![RecoveryAction::Fallback, RecoveryAction::ManualIntervention]
        }
        ErrorCategory::Permission => vec![RecoveryAction::ManualIntervention],
        _ => vec![RecoveryAction::Retry, RecoveryAction::ManualIntervention],
    }
}

/// An unknown/unclassified exception is recoverable unless it looks like an
/// interrupt, an out-of-memory condition, or a programmer/configuration
/// error (§4.1 general-purpose classifier).
pub fn classify_unknown_recoverable(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    let unrecoverable_markers = ["interrupt", "out of memory", "oom", "panic", "config"];
    !unrecoverable_markers.iter().any(|m| lowered.contains(m))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
    pub code: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub suggested_actions: Vec<RecoveryAction>,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, code: impl Into<String>, category: ErrorCategory, severity: Severity) -> Self {
        let recoverable = !matches!(severity, Severity::Critical);
        Self {
            message: message.into(),
            code: code.into(),
            suggested_actions: default_suggested_actions(category, false),
            category,
            severity,
            recoverable,
            context: ErrorContext::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Raised by the dependency resolver and deadlock detector when a set of
/// step definitions forms a cycle.
#[derive(Debug, thiserror::Error)]
#[error("circular dependency detected: {}", cycle.join(" -> "))]
pub struct CircularDependencyError {
    pub cycle: Vec<String>,
}

impl ErrorInfo for CircularDependencyError {
    fn code(&self) -> &str {
        "CIRCULAR_DEPENDENCY"
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
    fn is_recoverable(&self) -> bool {
        false
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Abort]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("step '{step}' references unknown dependency '{missing}'")]
    MissingDependency { step: String, missing: String },
    #[error("steps not satisfied: {0:?}")]
    Unsatisfied(Vec<String>),
}

impl ErrorInfo for DependencyError {
    fn code(&self) -> &str {
        match self {
            Self::MissingDependency { .. } => "MISSING_DEPENDENCY",
            Self::Unsatisfied(_) => "DEPENDENCY_UNSATISFIED",
        }
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }
    fn is_recoverable(&self) -> bool {
        false
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Abort]
    }
}

#[derive(Debug, thiserror::Error)]
#[error("resource limit exceeded for '{resource}': requested {requested}, available {available}")]
pub struct ResourceLimitError {
    pub resource: String,
    pub requested: usize,
    pub available: usize,
}

impl ErrorInfo for ResourceLimitError {
    fn code(&self) -> &str {
        "RESOURCE_LIMIT"
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Resource
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }
    fn is_recoverable(&self) -> bool {
        true
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Retry, RecoveryAction::Fallback]
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timeout during '{operation}': budget {budget_secs}s, elapsed {elapsed_secs}s")]
pub struct TimeoutError {
    pub operation: String,
    pub budget_secs: f64,
    pub elapsed_secs: f64,
}

impl ErrorInfo for TimeoutError {
    fn code(&self) -> &str {
        "TIMEOUT"
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Timeout
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }
    fn is_recoverable(&self) -> bool {
        true
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Retry]
    }
}

/// Raised by the parallel execution manager when a step's own exception
/// needs enrichment with run-time context before surfacing.
#[derive(Debug, thiserror::Error)]
#[error("step '{step_name}' failed during execution (project={project_id}, execution={execution_id}, elapsed={elapsed_secs}s): {message}")]
pub struct StepExecutionError {
    pub project_id: String,
    pub step_name: String,
    pub execution_id: String,
    pub elapsed_secs: f64,
    pub message: String,
    pub phase: Option<usize>,
}

impl ErrorInfo for StepExecutionError {
    fn code(&self) -> &str {
        "STEP_EXECUTION_FAILED"
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Execution
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }
    fn is_recoverable(&self) -> bool {
        classify_unknown_recoverable(&self.message)
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Retry, RecoveryAction::ManualIntervention]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowEngineError {
    #[error("no step processor registered for step '{step_name}'")]
    ProcessorNotFound { step_name: String },
    #[error("workflow '{name}' is not registered")]
    WorkflowNotFound { name: String },
    #[error(transparent)]
    CircularDependency(#[from] CircularDependencyError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitError),
    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ErrorInfo for WorkflowEngineError {
    fn code(&self) -> &str {
        match self {
            Self::ProcessorNotFound { .. } => "PROCESSOR_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::CircularDependency(e) => e.code(),
            Self::Dependency(e) => e.code(),
            Self::ResourceLimit(e) => e.code(),
            Self::StepExecution(e) => e.code(),
            Self::Timeout(e) => e.code(),
            Self::Other(_) => "UNKNOWN",
        }
    }
    fn category(&self) -> ErrorCategory {
        match self {
            Self::ProcessorNotFound { .. } | Self::WorkflowNotFound { .. } => ErrorCategory::Configuration,
            Self::CircularDependency(_) | Self::Dependency(_) => ErrorCategory::Dependency,
            Self::ResourceLimit(_) => ErrorCategory::Resource,
            Self::StepExecution(_) => ErrorCategory::Execution,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Other(_) => ErrorCategory::Execution,
        }
    }
    fn severity(&self) -> Severity {
        match self {
            Self::ProcessorNotFound { .. } | Self::CircularDependency(_) => Severity::Critical,
            _ => Severity::Error,
        }
    }
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ProcessorNotFound { .. } | Self::CircularDependency(_) | Self::WorkflowNotFound { .. })
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        match self {
            Self::ProcessorNotFound { .. } | Self::WorkflowNotFound { .. } => vec![RecoveryAction::Abort],
            Self::CircularDependency(_) => vec![RecoveryAction::Abort],
            _ => vec![RecoveryAction::Retry, RecoveryAction::ManualIntervention],
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("filesystem error: {0}")]
pub struct FileSystemError(pub String);

impl ErrorInfo for FileSystemError {
    fn code(&self) -> &str {
        "FILESYSTEM_ERROR"
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Io
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }
    fn is_recoverable(&self) -> bool {
        true
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Fallback, RecoveryAction::ManualIntervention]
    }
}

#[derive(Debug, thiserror::Error)]
#[error("project data access error during '{operation}': {message}")]
pub struct ProjectDataAccessError {
    pub operation: String,
    pub message: String,
}

impl ErrorInfo for ProjectDataAccessError {
    fn code(&self) -> &str {
        "PROJECT_DATA_ACCESS_ERROR"
    }
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Io
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }
    fn is_recoverable(&self) -> bool {
        true
    }
    fn suggested_actions(&self) -> Vec<RecoveryAction> {
        vec![RecoveryAction::Retry, RecoveryAction::ManualIntervention]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_std_error<E: std::error::Error>(_e: &E) {}

    #[test]
    fn circular_dependency_error_message() {
        let err = CircularDependencyError {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.category(), ErrorCategory::Dependency);
        assert!(!err.is_recoverable());
        assert_std_error(&err);
    }

    #[test]
    fn workflow_engine_error_from_circular() {
        let circular = CircularDependencyError { cycle: vec!["x".into()] };
        let wrapped: WorkflowEngineError = circular.into();
        assert_eq!(wrapped.code(), "CIRCULAR_DEPENDENCY");
        assert!(!wrapped.is_recoverable());
        assert_std_error(&wrapped);
    }

    #[test]
    fn processor_not_found_is_configuration_category() {
        let err = WorkflowEngineError::ProcessorNotFound {
            step_name: "render".into(),
        };
        assert_eq!(err.code(), "PROCESSOR_NOT_FOUND");
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn default_suggested_actions_network_is_retry() {
        let actions = default_suggested_actions(ErrorCategory::Network, false);
        assert_eq!(actions, vec![RecoveryAction::Retry]);
    }

    #[test]
    fn default_suggested_actions_permission_is_manual() {
        let actions = default_suggested_actions(ErrorCategory::Permission, false);
        assert_eq!(actions, vec![RecoveryAction::ManualIntervention]);
    }

    #[test]
    fn classify_unknown_recoverable_flags_oom() {
        assert!(!classify_unknown_recoverable("process ran out of memory"));
        assert!(classify_unknown_recoverable("connection reset by peer"));
    }

    #[test]
    fn error_context_builder() {
        let ctx = ErrorContext::new()
            .with_project("proj-1")
            .with_step("render")
            .with_execution_id("exec-1");
        assert_eq!(ctx.project_id.as_deref(), Some("proj-1"));
        assert_eq!(ctx.step_name.as_deref(), Some("render"));
    }

    #[test]
    fn step_execution_error_recoverable_by_message() {
        let err = StepExecutionError {
            project_id: "p".into(),
            step_name: "s".into(),
            execution_id: "e".into(),
            elapsed_secs: 1.0,
            message: "ran out of memory".into(),
            phase: Some(0),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("s"));
    }
}

//! Step abstractions: the data model for step definitions, execution
//! contexts, step results, and the capability interface step implementations
//! satisfy.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type DataMap = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

/// A workflow step definition: immutable once a workflow is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: u32,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: StepPriority,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub retry_budget: usize,
    #[serde(default)]
    pub can_skip: bool,
    #[serde(default = "default_can_run_parallel")]
    pub can_run_parallel: bool,
    #[serde(default)]
    pub required_resources: HashSet<String>,
}

fn default_can_run_parallel() -> bool {
    true
}

impl StepDefinition {
    pub fn new(id: u32, name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            display_name: display_name.into(),
            description: String::new(),
            dependencies: Vec::new(),
            priority: StepPriority::Normal,
            timeout_seconds: None,
            retry_budget: 0,
            can_skip: false,
            can_run_parallel: true,
            required_resources: HashSet::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retry_budget(mut self, retries: usize) -> Self {
        self.retry_budget = retries;
        self
    }

    pub fn with_required_resources(mut self, resources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_resources = resources.into_iter().map(Into::into).collect();
        self
    }
}

/// A set of step definitions making up one workflow, keyed by name at
/// registration time. Supports the same load/save-as-JSON convenience the
/// rest of this tree's definition files use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinitionSet {
    pub workflow_name: String,
    pub steps: Vec<StepDefinition>,
}

impl StepDefinitionSet {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read step definitions file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse step definitions JSON: {}", path.display()))
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize step definitions")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write step definitions file: {}", path.display()))
    }
}

/// Per-attempt, read-only context handed to a step implementation.
#[derive(Debug, Clone)]
pub struct StepExecutionContext {
    pub project_id: String,
    pub step_name: String,
    pub execution_id: String,
    pub user_context: DataMap,
    pub environment: HashMap<String, String>,
    pub resource_limits: HashMap<String, usize>,
    pub cancellation: CancellationToken,
}

impl StepExecutionContext {
    pub fn new(project_id: impl Into<String>, step_name: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            project_id: project_id.into(),
            step_name: step_name.into(),
            execution_id: Uuid::new_v4().to_string(),
            user_context: DataMap::new(),
            environment: HashMap::new(),
            resource_limits: HashMap::new(),
            cancellation,
        }
    }
}

/// Cooperative cancellation handle propagated through the execution context
/// per the "Cancellation" design note: a cheap atomic flag a step may poll.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output_data: DataMap,
    pub error_message: Option<String>,
    pub execution_time_secs: f64,
    #[serde(default)]
    pub resource_usage: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl StepResult {
    pub fn success(output_data: DataMap, execution_time: Duration) -> Self {
        Self {
            status: StepStatus::Completed,
            output_data,
            error_message: None,
            execution_time_secs: execution_time.as_secs_f64(),
            resource_usage: HashMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            status: StepStatus::Failed,
            output_data: DataMap::new(),
            error_message: Some(message.into()),
            execution_time_secs: execution_time.as_secs_f64(),
            resource_usage: HashMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// The capability interface a step implementation satisfies. `execute` is
/// the synchronous path; implementers with a genuinely async-native step
/// override `execute_async` directly, otherwise the default offloads
/// `execute` to a blocking worker thread so it never blocks the scheduler.
#[async_trait]
pub trait StepProcessor: Send + Sync {
    fn execute(&self, context: &StepExecutionContext, input: &DataMap) -> Result<StepResult>;

    async fn execute_async(&self, context: &StepExecutionContext, input: &DataMap) -> Result<StepResult> {
        let context = context.clone();
        let input = input.clone();
        let this = self.clone_processor();
        tokio::task::spawn_blocking(move || this.execute(&context, &input))
            .await
            .context("step execution task panicked")?
    }

    fn validate_input(&self, _input: &DataMap) -> bool {
        true
    }

    fn required_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn can_run_concurrently_with(&self, _other_name: &str) -> bool {
        true
    }

    fn estimate_execution_time(&self, _input: &DataMap) -> f64 {
        0.0
    }

    /// Needed so the default `execute_async` can move a handle into a
    /// blocking task without requiring callers to hand us an `Arc` already.
    fn clone_processor(&self) -> Arc<dyn StepProcessor>;
}

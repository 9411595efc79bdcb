//! Workflow engine: ties the resolver, resource manager, parallel executor,
//! state tracker, and progress monitor together into the top-level
//! register/plan/execute surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{CircularDependencyError, ErrorInfo, ResourceLimitError, WorkflowEngineError};
use crate::parallel::{execute_steps_parallel, StepTask};
use crate::progress::{ProgressEvent, ProgressMonitor};
use crate::resolver::{find_circular_dependencies, resolve_execution_order, GraphBuilder};
use crate::resource::ResourceManager;
use crate::state::{StatusSummary, WorkflowExecutionState};
use crate::step::{CancellationToken, DataMap, StepDefinition, StepExecutionContext, StepProcessor, StepResult, StepStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub project_id: String,
    pub workflow_name: String,
    pub phases: Vec<Vec<String>>,
    pub total_phases: usize,
    pub estimated_total_time_secs: f64,
    pub required_resources: HashMap<String, std::collections::HashSet<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub project_id: String,
    pub workflow_name: String,
    pub status: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub step_results: HashMap<String, StepResult>,
    pub duration_secs: f64,
    pub error_summary: Option<ErrorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub error: String,
    pub error_type: String,
}

pub struct WorkflowEngine {
    workflows: Mutex<HashMap<String, Vec<StepDefinition>>>,
    processors: Mutex<HashMap<String, Arc<dyn StepProcessor>>>,
    active_executions: Mutex<HashMap<String, Arc<Mutex<WorkflowExecutionState>>>>,
    pub resources: Arc<ResourceManager>,
    pub progress: Arc<ProgressMonitor>,
    max_concurrent_steps: usize,
    default_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(max_concurrent_steps: usize, default_timeout: Duration) -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            processors: Mutex::new(HashMap::new()),
            active_executions: Mutex::new(HashMap::new()),
            resources: Arc::new(ResourceManager::new()),
            progress: Arc::new(ProgressMonitor::new()),
            max_concurrent_steps,
            default_timeout,
        }
    }

    pub async fn register_workflow(&self, name: impl Into<String>, defs: Vec<StepDefinition>) -> Result<(), WorkflowEngineError> {
        let name = name.into();
        let cycles = find_circular_dependencies(&defs);
        if let Some(cycle) = cycles.into_iter().next() {
            return Err(CircularDependencyError { cycle }.into());
        }
        self.workflows.lock().await.insert(name, defs);
        Ok(())
    }

    pub async fn register_step_processor(&self, step_name: impl Into<String>, processor: Arc<dyn StepProcessor>) {
        self.processors.lock().await.insert(step_name.into(), processor);
    }

    async fn defs_for(&self, workflow_name: &str) -> Result<Vec<StepDefinition>, WorkflowEngineError> {
        self.workflows
            .lock()
            .await
            .get(workflow_name)
            .cloned()
            .ok_or_else(|| WorkflowEngineError::WorkflowNotFound { name: workflow_name.to_string() })
    }

    pub async fn plan_execution(&self, workflow_name: &str, project_id: &str) -> Result<ExecutionPlan, WorkflowEngineError> {
        let defs = self.defs_for(workflow_name).await?;
        let graph = GraphBuilder::new(defs.clone()).build()?;
        let phases = resolve_execution_order(&graph)?;

        let processors = self.processors.lock().await;
        let mut estimated_total = 0.0;
        let mut required_resources = HashMap::new();
        for def in &defs {
            if let Some(processor) = processors.get(&def.name) {
                estimated_total += processor.estimate_execution_time(&DataMap::new());
            }
            required_resources.insert(def.name.clone(), def.required_resources.clone());
        }

        Ok(ExecutionPlan {
            project_id: project_id.to_string(),
            workflow_name: workflow_name.to_string(),
            total_phases: phases.len(),
            phases,
            estimated_total_time_secs: estimated_total,
            required_resources,
        })
    }

    /// Informational only: does not reserve any resource. Returns the name of
    /// the first currently-unavailable resource, if any.
    pub async fn check_resource_availability(&self, workflow_name: &str) -> Result<Option<String>, WorkflowEngineError> {
        let defs = self.defs_for(workflow_name).await?;
        for def in &defs {
            for resource in &def.required_resources {
                if !self.resources.is_resource_available(resource).await {
                    return Ok(Some(resource.clone()));
                }
            }
        }
        Ok(None)
    }

    pub async fn execute_workflow_dry_run(&self, workflow_name: &str, project_id: &str) -> Result<ExecutionPlan, WorkflowEngineError> {
        let plan = self.plan_execution(workflow_name, project_id).await?;
        if let Some(resource) = self.check_resource_availability(workflow_name).await? {
            return Err(ResourceLimitError {
                resource,
                requested: 1,
                available: 0,
            }
            .into());
        }
        let defs = self.defs_for(workflow_name).await?;
        if let Some(cycle) = find_circular_dependencies(&defs).into_iter().next() {
            return Err(CircularDependencyError { cycle }.into());
        }
        Ok(plan)
    }

    pub async fn execute_workflow(
        &self,
        workflow_name: &str,
        project_id: &str,
        initial_input: DataMap,
    ) -> Result<WorkflowExecutionResult, WorkflowEngineError> {
        let started = Instant::now();
        info!(project_id, workflow_name, "starting workflow execution");

        let plan = self.execute_workflow_dry_run(workflow_name, project_id).await?;
        let defs = self.defs_for(workflow_name).await?;
        let total_steps = defs.len();
        let def_by_name: HashMap<&str, &StepDefinition> = defs.iter().map(|d| (d.name.as_str(), d)).collect();

        let state = Arc::new(Mutex::new(WorkflowExecutionState::new(project_id, workflow_name, total_steps)));
        self.active_executions.lock().await.insert(project_id.to_string(), state.clone());

        self.progress
            .publish(ProgressEvent::WorkflowStarted {
                project_id: project_id.to_string(),
                workflow_name: workflow_name.to_string(),
                total_steps,
            })
            .await;

        let mut step_results: HashMap<String, StepResult> = HashMap::new();
        let mut current_output = initial_input;
        let mut failed_steps = 0usize;

        let result = self
            .run_phases(&plan, &def_by_name, &state, project_id, workflow_name, &mut step_results, &mut current_output, &mut failed_steps)
            .await;

        if let Err(err) = result {
            self.active_executions.lock().await.remove(project_id);
            warn!(project_id, workflow_name, error = %err, "workflow execution aborted by a configuration error");
            return Err(err);
        }

        let final_state = state.lock().await;
        let status = if failed_steps > 0 {
            "FAILED"
        } else if final_state.is_cancelled {
            "CANCELLED"
        } else {
            "COMPLETED"
        };

        let error_summary = if failed_steps > 0 {
            Some(ErrorSummary {
                error: format!("{failed_steps} step(s) failed during execution"),
                error_type: "STEP_EXECUTION_FAILED".to_string(),
            })
        } else {
            None
        };

        self.active_executions.lock().await.remove(project_id);

        let outcome = WorkflowExecutionResult {
            project_id: project_id.to_string(),
            workflow_name: workflow_name.to_string(),
            status: status.to_string(),
            total_steps,
            completed_steps: final_state.completed_steps,
            failed_steps,
            step_results,
            duration_secs: started.elapsed().as_secs_f64(),
            error_summary,
        };

        if status == "FAILED" {
            warn!(project_id, workflow_name, "workflow execution finished with failures");
        } else {
            info!(project_id, workflow_name, status, "workflow execution finished");
        }

        self.progress
            .publish(match status {
                "FAILED" => ProgressEvent::WorkflowFailed {
                    project_id: project_id.to_string(),
                    workflow_name: workflow_name.to_string(),
                    reason: "one or more steps failed".to_string(),
                },
                "CANCELLED" => ProgressEvent::WorkflowCancelled {
                    project_id: project_id.to_string(),
                    workflow_name: workflow_name.to_string(),
                    reason: final_state.cancellation_reason.clone().unwrap_or_default(),
                },
                _ => ProgressEvent::WorkflowCompleted {
                    project_id: project_id.to_string(),
                    workflow_name: workflow_name.to_string(),
                    duration_secs: outcome.duration_secs,
                },
            })
            .await;

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        plan: &ExecutionPlan,
        def_by_name: &HashMap<&str, &StepDefinition>,
        state: &Arc<Mutex<WorkflowExecutionState>>,
        project_id: &str,
        workflow_name: &str,
        step_results: &mut HashMap<String, StepResult>,
        current_output: &mut DataMap,
        failed_steps: &mut usize,
    ) -> Result<(), WorkflowEngineError> {
        for (phase_index, phase) in plan.phases.iter().enumerate() {
            if state.lock().await.is_cancelled {
                info!(project_id, workflow_name, phase_index, "execution cancelled before phase started");
                break;
            }

            self.progress
                .publish(ProgressEvent::PhaseStarted {
                    project_id: project_id.to_string(),
                    phase_index,
                    step_names: phase.clone(),
                })
                .await;

            let mut tasks = Vec::with_capacity(phase.len());
            let mut acquired_in_phase: Vec<(String, Vec<String>)> = Vec::new();

            for step_name in phase {
                let processor = {
                    let processors = self.processors.lock().await;
                    processors.get(step_name).cloned()
                };
                let processor = match processor.ok_or_else(|| WorkflowEngineError::ProcessorNotFound { step_name: step_name.clone() }) {
                    Ok(processor) => processor,
                    Err(err) => {
                        self.release_all(&acquired_in_phase).await;
                        return Err(err);
                    }
                };

                let def = def_by_name.get(step_name.as_str()).copied();
                let timeout = def
                    .and_then(|d| d.timeout_seconds)
                    .map(|secs| Duration::from_secs(secs as u64))
                    .or(Some(self.default_timeout));

                let required_resources: Vec<String> = def.map(|d| d.required_resources.iter().cloned().collect()).unwrap_or_default();
                if !required_resources.is_empty() {
                    let acquired = match self.resources.acquire(step_name, &required_resources, None).await {
                        Ok(acquired) => acquired,
                        Err(err) => {
                            self.release_all(&acquired_in_phase).await;
                            return Err(err.into());
                        }
                    };
                    if !acquired {
                        self.release_all(&acquired_in_phase).await;
                        return Err(ResourceLimitError {
                            resource: required_resources.join(","),
                            requested: required_resources.len(),
                            available: 0,
                        }
                        .into());
                    }
                    acquired_in_phase.push((step_name.clone(), required_resources.clone()));
                }

                state.lock().await.start_step(step_name);
                self.progress
                    .publish(ProgressEvent::StepStarted {
                        project_id: project_id.to_string(),
                        step_name: step_name.clone(),
                    })
                    .await;

                let context = StepExecutionContext::new(project_id, step_name.clone(), CancellationToken::new());
                let exec_context = context.clone();
                let input = current_output.clone();
                let resources = self.resources.clone();
                let owning_step_name = step_name.clone();

                tasks.push(StepTask::new(&context, timeout, async move {
                    let result = processor.execute_async(&exec_context, &input).await;
                    if !required_resources.is_empty() {
                        resources.release(&owning_step_name, &required_resources).await;
                    }
                    result
                }));
            }

            let outcomes = execute_steps_parallel(tasks, self.max_concurrent_steps).await;

            for outcome in outcomes {
                match outcome.result {
                    Ok(result) => {
                        let mut guard = state.lock().await;
                        if result.status == StepStatus::Completed {
                            guard.complete_step(&outcome.step_name, Some(Duration::from_secs_f64(result.execution_time_secs)));
                            for (key, value) in &result.output_data {
                                current_output.insert(key.clone(), value.clone());
                            }
                            self.progress
                                .publish(ProgressEvent::StepCompleted {
                                    project_id: project_id.to_string(),
                                    step_name: outcome.step_name.clone(),
                                    duration_secs: result.execution_time_secs,
                                })
                                .await;
                        } else {
                            guard.fail_step(&outcome.step_name, Some(Duration::from_secs_f64(result.execution_time_secs)));
                            *failed_steps += 1;
                            self.progress
                                .publish(ProgressEvent::StepFailed {
                                    project_id: project_id.to_string(),
                                    step_name: outcome.step_name.clone(),
                                    message: result.error_message.clone().unwrap_or_default(),
                                })
                                .await;
                        }
                        step_results.insert(outcome.step_name.clone(), result);
                    }
                    Err(message) => {
                        state.lock().await.fail_step(&outcome.step_name, None);
                        *failed_steps += 1;
                        step_results.insert(outcome.step_name.clone(), StepResult::failure(message.clone(), Duration::from_secs(0)));
                        self.progress
                            .publish(ProgressEvent::StepFailed {
                                project_id: project_id.to_string(),
                                step_name: outcome.step_name.clone(),
                                message,
                            })
                            .await;
                    }
                }
            }

            self.progress
                .publish(ProgressEvent::PhaseCompleted {
                    project_id: project_id.to_string(),
                    phase_index,
                })
                .await;
        }
        Ok(())
    }

    pub async fn cancel_workflow(&self, project_id: &str, reason: impl Into<String>) {
        if let Some(state) = self.active_executions.lock().await.get(project_id) {
            state.lock().await.cancel(reason);
        }
    }

    pub async fn pause_workflow(&self, project_id: &str) {
        if let Some(state) = self.active_executions.lock().await.get(project_id) {
            state.lock().await.pause();
        }
    }

    pub async fn resume_workflow(&self, project_id: &str) {
        if let Some(state) = self.active_executions.lock().await.get(project_id) {
            state.lock().await.resume();
        }
    }

    pub async fn get_execution_status(&self, project_id: &str) -> Option<StatusSummary> {
        let state = self.active_executions.lock().await.get(project_id)?.clone();
        Some(state.lock().await.get_status_summary())
    }

    pub async fn list_active_executions(&self) -> Vec<String> {
        self.active_executions.lock().await.keys().cloned().collect()
    }

    /// Best-effort rollback for a phase that fails partway through resource
    /// acquisition: releases everything already acquired by earlier steps in
    /// the same phase so a later retry does not find them wedged.
    async fn release_all(&self, acquired: &[(String, Vec<String>)]) {
        for (step_name, names) in acquired {
            self.resources.release(step_name, names).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    struct EchoStep;

    #[async_trait]
    impl StepProcessor for EchoStep {
        fn execute(&self, context: &StepExecutionContext, input: &DataMap) -> anyhow::Result<StepResult> {
            let mut output = input.clone();
            output.insert(context.step_name.clone(), Value::Bool(true));
            Ok(StepResult::success(output, Duration::from_millis(5)))
        }

        fn clone_processor(&self) -> Arc<dyn StepProcessor> {
            Arc::new(EchoStep)
        }
    }

    struct FailingStep;

    #[async_trait]
    impl StepProcessor for FailingStep {
        fn execute(&self, _context: &StepExecutionContext, _input: &DataMap) -> anyhow::Result<StepResult> {
            Ok(StepResult::failure("boom", Duration::from_millis(5)))
        }

        fn clone_processor(&self) -> Arc<dyn StepProcessor> {
            Arc::new(FailingStep)
        }
    }

    fn diamond_defs() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(1, "a", "A"),
            StepDefinition::new(2, "b", "B").with_dependencies(["a"]),
            StepDefinition::new(3, "c", "C").with_dependencies(["a"]),
            StepDefinition::new(4, "d", "D").with_dependencies(["b", "c"]),
        ]
    }

    #[tokio::test]
    async fn diamond_dag_executes_all_steps_successfully() {
        let engine = WorkflowEngine::new(3, Duration::from_secs(5));
        engine.register_workflow("render", diamond_defs()).await.unwrap();
        for name in ["a", "b", "c", "d"] {
            engine.register_step_processor(name, Arc::new(EchoStep)).await;
        }

        let result = engine.execute_workflow("render", "proj-1", DataMap::new()).await.unwrap();
        assert_eq!(result.status, "COMPLETED");
        assert_eq!(result.completed_steps, 4);
        assert_eq!(result.failed_steps, 0);
        assert!(result.step_results.contains_key("d"));
    }

    #[tokio::test]
    async fn middle_step_failure_still_runs_sibling_and_marks_workflow_failed() {
        let engine = WorkflowEngine::new(3, Duration::from_secs(5));
        engine.register_workflow("render", diamond_defs()).await.unwrap();
        engine.register_step_processor("a", Arc::new(EchoStep)).await;
        engine.register_step_processor("b", Arc::new(FailingStep)).await;
        engine.register_step_processor("c", Arc::new(EchoStep)).await;
        engine.register_step_processor("d", Arc::new(EchoStep)).await;

        let result = engine.execute_workflow("render", "proj-1", DataMap::new()).await.unwrap();
        assert_eq!(result.status, "FAILED");
        assert_eq!(result.failed_steps, 1);
        assert_eq!(result.completed_steps, 3);
    }

    #[tokio::test]
    async fn register_workflow_rejects_cycle() {
        let engine = WorkflowEngine::new(3, Duration::from_secs(5));
        let defs = vec![
            StepDefinition::new(1, "a", "A").with_dependencies(["b"]),
            StepDefinition::new(2, "b", "B").with_dependencies(["a"]),
        ];
        let err = engine.register_workflow("cyclical", defs).await.unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
    }

    #[tokio::test]
    async fn missing_processor_fails_fast_with_configuration_error() {
        let engine = WorkflowEngine::new(3, Duration::from_secs(5));
        engine.register_workflow("render", vec![StepDefinition::new(1, "a", "A")]).await.unwrap();
        let err = engine.execute_workflow("render", "proj-1", DataMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "PROCESSOR_NOT_FOUND");
    }

    #[tokio::test]
    async fn plan_execution_reports_phases_and_resources() {
        let engine = WorkflowEngine::new(3, Duration::from_secs(5));
        engine.register_workflow("render", diamond_defs()).await.unwrap();
        for name in ["a", "b", "c", "d"] {
            engine.register_step_processor(name, Arc::new(EchoStep)).await;
        }
        let plan = engine.plan_execution("render", "proj-1").await.unwrap();
        assert_eq!(plan.total_phases, 3);
        assert_eq!(plan.phases[0], vec!["a"]);
    }

    #[tokio::test]
    async fn list_active_executions_empty_when_idle() {
        let engine = WorkflowEngine::new(3, Duration::from_secs(5));
        assert!(engine.list_active_executions().await.is_empty());
    }
}

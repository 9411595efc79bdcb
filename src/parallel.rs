//! Parallel execution manager: runs a batch of steps under a bounded
//! concurrency limit, enforcing per-step timeouts and always releasing its
//! concurrency permit regardless of outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};

use crate::errors::StepExecutionError;
use crate::step::{StepExecutionContext, StepResult, StepStatus};

/// One unit of work submitted to the parallel executor: a step name plus a
/// boxed future producing its result. The engine builds these from a
/// `StepProcessor::execute_async` call already bound to its context/input.
pub struct StepTask {
    pub step_name: String,
    pub project_id: String,
    pub execution_id: String,
    pub timeout: Option<Duration>,
    pub future: Pin<Box<dyn Future<Output = anyhow::Result<StepResult>> + Send>>,
}

impl StepTask {
    pub fn new(
        context: &StepExecutionContext,
        timeout: Option<Duration>,
        future: impl Future<Output = anyhow::Result<StepResult>> + Send + 'static,
    ) -> Self {
        Self {
            step_name: context.step_name.clone(),
            project_id: context.project_id.clone(),
            execution_id: context.execution_id.clone(),
            timeout,
            future: Box::pin(future),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub step_name: String,
    pub result: Result<StepResult, String>,
}

/// Runs every task concurrently, gated by a semaphore of `max_concurrency`
/// permits; the permit for a task is held only across its own future, so a
/// task that finishes early frees its slot for one still queued. The
/// returned vector preserves submission order, not completion order.
pub async fn execute_steps_parallel(tasks: Vec<StepTask>, max_concurrency: usize) -> Vec<TaskOutcome> {
    let total = tasks.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel(total.max(1));

    for (index, task) in tasks.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let outcome = run_single(task).await;
            drop(permit);
            let _ = tx.send((index, outcome)).await;
        });
    }
    drop(tx);

    let mut slots: Vec<Option<TaskOutcome>> = (0..total).map(|_| None).collect();
    while let Some((index, outcome)) = rx.recv().await {
        slots[index] = Some(outcome);
    }
    slots.into_iter().map(|slot| slot.expect("every submitted task reports exactly one outcome")).collect()
}

/// Runs every task one at a time, in submission order. Used for workflows
/// (or individual phases) that opt out of parallelism.
pub async fn execute_steps_sequential(tasks: Vec<StepTask>) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        outcomes.push(run_single(task).await);
    }
    outcomes
}

async fn run_single(task: StepTask) -> TaskOutcome {
    let StepTask {
        step_name,
        project_id,
        execution_id,
        timeout,
        future,
    } = task;

    let started = Instant::now();
    let outcome = match timeout {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = started.elapsed().as_secs_f64();
                return TaskOutcome {
                    step_name: step_name.clone(),
                    result: Err(StepExecutionError {
                        project_id,
                        step_name,
                        execution_id,
                        elapsed_secs: elapsed,
                        message: format!("step exceeded its timeout of {:.1}s", duration.as_secs_f64()),
                        phase: None,
                    }
                    .to_string()),
                };
            }
        },
        None => future.await,
    };

    match outcome {
        Ok(result) => TaskOutcome { step_name, result: Ok(result) },
        Err(err) => {
            let elapsed = started.elapsed().as_secs_f64();
            let message = err.to_string();
            TaskOutcome {
                step_name: step_name.clone(),
                result: Err(StepExecutionError {
                    project_id,
                    step_name,
                    execution_id,
                    elapsed_secs: elapsed,
                    message,
                    phase: None,
                }
                .to_string()),
            }
        }
    }
}

/// Converts a raw outcome into a terminal `StepResult`, collapsing a failure
/// string into a `Failed` result so phase aggregation never has to branch on
/// `Result` vs. `StepResult` separately.
pub fn outcome_into_result(outcome: TaskOutcome, elapsed: Duration) -> (String, StepResult) {
    match outcome.result {
        Ok(result) => (outcome.step_name, result),
        Err(message) => (outcome.step_name, StepResult::failure(message, elapsed)),
    }
}

pub fn all_succeeded(outcomes: &[TaskOutcome]) -> bool {
    outcomes.iter().all(|o| matches!(&o.result, Ok(r) if r.status == StepStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{CancellationToken, DataMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(name: &str) -> StepExecutionContext {
        StepExecutionContext::new("proj", name, CancellationToken::new())
    }

    #[tokio::test]
    async fn runs_all_tasks_and_collects_results() {
        let tasks = vec![
            StepTask::new(&ctx("a"), None, async { Ok(StepResult::success(DataMap::new(), Duration::from_millis(1))) }),
            StepTask::new(&ctx("b"), None, async { Ok(StepResult::success(DataMap::new(), Duration::from_millis(1))) }),
        ];
        let outcomes = execute_steps_parallel(tasks, 2).await;
        assert_eq!(outcomes.len(), 2);
        assert!(all_succeeded(&outcomes));
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..5 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            tasks.push(StepTask::new(&ctx(&format!("s{i}")), None, async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(StepResult::success(DataMap::new(), Duration::from_millis(20)))
            }));
        }

        execute_steps_parallel(tasks, 2).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_produces_failed_outcome() {
        let tasks = vec![StepTask::new(&ctx("slow"), Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepResult::success(DataMap::new(), Duration::from_secs(5)))
        })];
        let outcomes = execute_steps_parallel(tasks, 1).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());
        assert!(!all_succeeded(&outcomes));
    }

    #[tokio::test]
    async fn sequential_preserves_submission_order() {
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            tasks.push(StepTask::new(&ctx(name), None, async move {
                order.lock().await.push(name.to_string());
                Ok(StepResult::success(DataMap::new(), Duration::from_millis(1)))
            }));
        }
        execute_steps_sequential(tasks).await;
        assert_eq!(*order.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn parallel_preserves_submission_order_despite_reversed_completion() {
        let mut tasks = Vec::new();
        for (name, delay_ms) in [("slow", 30u64), ("fast", 1)] {
            tasks.push(StepTask::new(&ctx(name), None, async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(StepResult::success(DataMap::new(), Duration::from_millis(delay_ms)))
            }));
        }
        let outcomes = execute_steps_parallel(tasks, 2).await;
        let names: Vec<&str> = outcomes.iter().map(|o| o.step_name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn step_error_is_wrapped_with_context() {
        let tasks = vec![StepTask::new(&ctx("broken"), None, async {
            Err(anyhow::anyhow!("boom"))
        })];
        let outcomes = execute_steps_parallel(tasks, 1).await;
        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(err.contains("broken"));
        assert!(err.contains("boom"));
    }
}

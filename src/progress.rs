//! Progress monitor: an in-process pub/sub layer over workflow lifecycle
//! events, with a bounded event history and a cleanup sweep for subscribers
//! that repeatedly fail to accept delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::resource::ResourceUsage;
use crate::state::StatusSummary;

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const MAX_SUBSCRIBER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    WorkflowStarted { project_id: String, workflow_name: String, total_steps: usize },
    WorkflowCompleted { project_id: String, workflow_name: String, duration_secs: f64 },
    WorkflowFailed { project_id: String, workflow_name: String, reason: String },
    WorkflowCancelled { project_id: String, workflow_name: String, reason: String },
    WorkflowPaused { project_id: String, workflow_name: String },
    WorkflowResumed { project_id: String, workflow_name: String },
    PhaseStarted { project_id: String, phase_index: usize, step_names: Vec<String> },
    PhaseCompleted { project_id: String, phase_index: usize },
    StepStarted { project_id: String, step_name: String },
    StepCompleted { project_id: String, step_name: String, duration_secs: f64 },
    StepFailed { project_id: String, step_name: String, message: String },
    StepSkipped { project_id: String, step_name: String, reason: String },
    StepRetrying { project_id: String, step_name: String, attempt: usize },
    StatusSnapshot { project_id: String, summary: StatusSummary },
}

impl ProgressEvent {
    pub fn project_id(&self) -> &str {
        match self {
            ProgressEvent::WorkflowStarted { project_id, .. }
            | ProgressEvent::WorkflowCompleted { project_id, .. }
            | ProgressEvent::WorkflowFailed { project_id, .. }
            | ProgressEvent::WorkflowCancelled { project_id, .. }
            | ProgressEvent::WorkflowPaused { project_id, .. }
            | ProgressEvent::WorkflowResumed { project_id, .. }
            | ProgressEvent::PhaseStarted { project_id, .. }
            | ProgressEvent::PhaseCompleted { project_id, .. }
            | ProgressEvent::StepStarted { project_id, .. }
            | ProgressEvent::StepCompleted { project_id, .. }
            | ProgressEvent::StepFailed { project_id, .. }
            | ProgressEvent::StepSkipped { project_id, .. }
            | ProgressEvent::StepRetrying { project_id, .. }
            | ProgressEvent::StatusSnapshot { project_id, .. } => project_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::WorkflowStarted { .. } => "workflow_started",
            ProgressEvent::WorkflowCompleted { .. } => "workflow_completed",
            ProgressEvent::WorkflowFailed { .. } => "workflow_failed",
            ProgressEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            ProgressEvent::WorkflowPaused { .. } => "workflow_paused",
            ProgressEvent::WorkflowResumed { .. } => "workflow_resumed",
            ProgressEvent::PhaseStarted { .. } => "phase_started",
            ProgressEvent::PhaseCompleted { .. } => "phase_completed",
            ProgressEvent::StepStarted { .. } => "step_started",
            ProgressEvent::StepCompleted { .. } => "step_completed",
            ProgressEvent::StepFailed { .. } => "step_failed",
            ProgressEvent::StepSkipped { .. } => "step_skipped",
            ProgressEvent::StepRetrying { .. } => "step_retrying",
            ProgressEvent::StatusSnapshot { .. } => "status_snapshot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub event: ProgressEvent,
    pub emitted_at: DateTime<Utc>,
}

/// The subscriber capability interface. `on_event` returning `Err` counts as
/// a delivery failure; a subscriber is dropped from the registry once it
/// accumulates `MAX_SUBSCRIBER_FAILURES` consecutive failures, or immediately
/// once `is_active` reports false.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &TimestampedEvent) -> anyhow::Result<()>;

    /// Whether this subscriber still wants delivery. Checked before every
    /// publish; a `false` drops it from the registry right away.
    fn is_active(&self) -> bool {
        true
    }
}

struct Subscription {
    id: u64,
    subscriber: Arc<dyn EventSubscriber>,
    consecutive_failures: u32,
    project_filter: Option<HashSet<String>>,
}

pub struct ProgressMonitor {
    subscriptions: Mutex<Vec<Subscription>>,
    history: Mutex<VecDeque<TimestampedEvent>>,
    history_limit: usize,
    next_id: std::sync::atomic::AtomicU64,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Subscribes with an optional project filter: when present, only events
    /// whose `project_id` is in the set are delivered to this subscriber.
    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>, project_filter: Option<HashSet<String>>) -> u64 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.subscriptions.lock().await.push(Subscription {
            id,
            subscriber,
            consecutive_failures: 0,
            project_filter,
        });
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscriptions.lock().await.retain(|s| s.id != id);
    }

    /// Publishes to a snapshot of the subscriber list taken before delivery
    /// starts, so a subscriber that unsubscribes mid-publish (from within its
    /// own `on_event`) cannot deadlock on the registry lock. Subscribers
    /// whose filter excludes the event's project are skipped entirely;
    /// subscribers that report `is_active() == false` are pruned immediately.
    pub async fn publish(&self, event: ProgressEvent) {
        let timestamped = TimestampedEvent { event, emitted_at: Utc::now() };
        let project_id = timestamped.event.project_id().to_string();

        {
            let mut history = self.history.lock().await;
            history.push_back(timestamped.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        let snapshot: Vec<(u64, Arc<dyn EventSubscriber>, bool)> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .map(|s| {
                    let deliver = s.project_filter.as_ref().is_none_or(|filter| filter.contains(&project_id));
                    (s.id, s.subscriber.clone(), deliver)
                })
                .collect()
        };

        let mut inactive: Vec<u64> = Vec::new();
        let mut outcomes: Vec<(u64, bool)> = Vec::with_capacity(snapshot.len());
        for (id, subscriber, deliver) in snapshot {
            if !subscriber.is_active() {
                inactive.push(id);
                continue;
            }
            if !deliver {
                continue;
            }
            let ok = subscriber.on_event(&timestamped).await.is_ok();
            outcomes.push((id, ok));
        }

        self.record_delivery_outcomes(&outcomes, &inactive).await;
    }

    async fn record_delivery_outcomes(&self, outcomes: &[(u64, bool)], inactive: &[u64]) {
        let mut subscriptions = self.subscriptions.lock().await;
        for (id, ok) in outcomes {
            if let Some(sub) = subscriptions.iter_mut().find(|s| s.id == *id) {
                if *ok {
                    sub.consecutive_failures = 0;
                } else {
                    sub.consecutive_failures += 1;
                }
            }
        }
        subscriptions.retain(|s| s.consecutive_failures < MAX_SUBSCRIBER_FAILURES && !inactive.contains(&s.id));
    }

    /// Returns events newest-last, optionally filtered by `project` and/or
    /// `types` (matched against `ProgressEvent::kind()`) before the `limit`
    /// cap is applied.
    pub async fn get_event_history(&self, project: Option<&str>, types: Option<&[&str]>, limit: Option<usize>) -> Vec<TimestampedEvent> {
        let history = self.history.lock().await;
        let filtered = history.iter().filter(|entry| {
            let project_ok = project.is_none_or(|p| entry.event.project_id() == p);
            let type_ok = types.is_none_or(|kinds| kinds.contains(&entry.event.kind()));
            project_ok && type_ok
        });
        match limit {
            Some(limit) => {
                let matched: Vec<TimestampedEvent> = filtered.cloned().collect();
                matched.into_iter().rev().take(limit).rev().collect()
            }
            None => filtered.cloned().collect(),
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Produces a detailed report for a single project: totals, per-step
    /// statuses/durations, fastest/slowest step, and a resource-pool
    /// snapshot as seen at call time.
    pub async fn generate_detailed_report(&self, project_id: &str, resource_usage: &HashMap<String, ResourceUsage>) -> String {
        let events = self.get_event_history(Some(project_id), None, None).await;

        let mut started = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        let mut step_durations: Vec<(String, f64)> = Vec::new();
        let mut step_lines: Vec<String> = Vec::new();

        for entry in &events {
            match &entry.event {
                ProgressEvent::StepStarted { step_name, .. } => {
                    started += 1;
                    step_lines.push(format!("  {step_name}: started"));
                }
                ProgressEvent::StepCompleted { step_name, duration_secs, .. } => {
                    completed += 1;
                    step_durations.push((step_name.clone(), *duration_secs));
                    step_lines.push(format!("  {step_name}: completed in {duration_secs:.2}s"));
                }
                ProgressEvent::StepFailed { step_name, message, .. } => {
                    failed += 1;
                    step_lines.push(format!("  {step_name}: failed ({message})"));
                }
                ProgressEvent::StepSkipped { step_name, reason, .. } => {
                    skipped += 1;
                    step_lines.push(format!("  {step_name}: skipped ({reason})"));
                }
                _ => {}
            }
        }

        let mut report = String::new();
        report.push_str(&format!("progress report for project '{project_id}'\n"));
        report.push_str(&format!(
            "totals: {started} started, {completed} completed, {failed} failed, {skipped} skipped ({} events)\n",
            events.len()
        ));

        if let Some((name, secs)) = step_durations.iter().min_by(|a, b| a.1.total_cmp(&b.1)) {
            report.push_str(&format!("fastest step: '{name}' in {secs:.2}s\n"));
        }
        if let Some((name, secs)) = step_durations.iter().max_by(|a, b| a.1.total_cmp(&b.1)) {
            report.push_str(&format!("slowest step: '{name}' in {secs:.2}s\n"));
        }

        report.push_str("steps:\n");
        for line in step_lines {
            report.push_str(&line);
            report.push('\n');
        }

        report.push_str("resources:\n");
        let mut resource_names: Vec<&String> = resource_usage.keys().collect();
        resource_names.sort();
        for name in resource_names {
            let usage = &resource_usage[name];
            report.push_str(&format!("  {name}: {}/{} in use\n", usage.in_use, usage.capacity));
        }

        report
    }
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::WorkflowStarted { workflow_name, total_steps, .. } => {
            format!("workflow '{workflow_name}' started with {total_steps} steps")
        }
        ProgressEvent::WorkflowCompleted { workflow_name, duration_secs, .. } => {
            format!("workflow '{workflow_name}' completed in {duration_secs:.2}s")
        }
        ProgressEvent::WorkflowFailed { workflow_name, reason, .. } => {
            format!("workflow '{workflow_name}' failed: {reason}")
        }
        ProgressEvent::WorkflowCancelled { workflow_name, reason, .. } => {
            format!("workflow '{workflow_name}' cancelled: {reason}")
        }
        ProgressEvent::WorkflowPaused { workflow_name, .. } => format!("workflow '{workflow_name}' paused"),
        ProgressEvent::WorkflowResumed { workflow_name, .. } => format!("workflow '{workflow_name}' resumed"),
        ProgressEvent::PhaseStarted { phase_index, step_names, .. } => {
            format!("phase {phase_index} started: {}", step_names.join(", "))
        }
        ProgressEvent::PhaseCompleted { phase_index, .. } => format!("phase {phase_index} completed"),
        ProgressEvent::StepStarted { step_name, .. } => format!("step '{step_name}' started"),
        ProgressEvent::StepCompleted { step_name, duration_secs, .. } => {
            format!("step '{step_name}' completed in {duration_secs:.2}s")
        }
        ProgressEvent::StepFailed { step_name, message, .. } => format!("step '{step_name}' failed: {message}"),
        ProgressEvent::StepSkipped { step_name, reason, .. } => format!("step '{step_name}' skipped: {reason}"),
        ProgressEvent::StepRetrying { step_name, attempt, .. } => format!("step '{step_name}' retrying (attempt {attempt})"),
        ProgressEvent::StatusSnapshot { summary, .. } => {
            format!("status snapshot: {:.1}% complete", summary.completion_percentage)
        }
    }
}

/// Builds a simple closure-backed subscriber from a synchronous callback, the
/// style most direct callers reach for instead of implementing the trait.
pub struct CallbackSubscriber<F>
where
    F: Fn(&TimestampedEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackSubscriber<F>
where
    F: Fn(&TimestampedEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> EventSubscriber for CallbackSubscriber<F>
where
    F: Fn(&TimestampedEvent) + Send + Sync,
{
    async fn on_event(&self, event: &TimestampedEvent) -> anyhow::Result<()> {
        (self.callback)(event);
        Ok(())
    }
}

pub fn create_progress_callback(sink: Arc<Mutex<Vec<ProgressEvent>>>) -> Arc<dyn EventSubscriber> {
    Arc::new(CallbackSubscriberAsync { sink })
}

struct CallbackSubscriberAsync {
    sink: Arc<Mutex<Vec<ProgressEvent>>>,
}

#[async_trait]
impl EventSubscriber for CallbackSubscriberAsync {
    async fn on_event(&self, event: &TimestampedEvent) -> anyhow::Result<()> {
        self.sink.lock().await.push(event.event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSubscriber {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventSubscriber for FailingSubscriber {
        async fn on_event(&self, _event: &TimestampedEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("subscriber always fails"))
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let monitor = ProgressMonitor::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        monitor.subscribe(create_progress_callback(sink.clone()), None).await;
        monitor
            .publish(ProgressEvent::StepStarted {
                project_id: "p".into(),
                step_name: "render".into(),
            })
            .await;
        assert_eq!(sink.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let monitor = ProgressMonitor::with_history_limit(2);
        for i in 0..5 {
            monitor
                .publish(ProgressEvent::StepStarted {
                    project_id: "p".into(),
                    step_name: format!("step-{i}"),
                })
                .await;
        }
        assert_eq!(monitor.get_event_history(None, None, None).await.len(), 2);
    }

    #[tokio::test]
    async fn failing_subscriber_is_dropped_after_threshold() {
        let monitor = ProgressMonitor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        monitor.subscribe(Arc::new(FailingSubscriber { calls: calls.clone() }), None).await;
        assert_eq!(monitor.subscriber_count().await, 1);

        for _ in 0..MAX_SUBSCRIBER_FAILURES {
            monitor
                .publish(ProgressEvent::StepStarted {
                    project_id: "p".into(),
                    step_name: "x".into(),
                })
                .await;
        }
        assert_eq!(monitor.subscriber_count().await, 0);
        assert_eq!(calls.load(Ordering::SeqCst) as u32, MAX_SUBSCRIBER_FAILURES);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let monitor = ProgressMonitor::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let id = monitor.subscribe(create_progress_callback(sink.clone()), None).await;
        monitor.unsubscribe(id).await;
        monitor
            .publish(ProgressEvent::StepStarted {
                project_id: "p".into(),
                step_name: "render".into(),
            })
            .await;
        assert!(sink.lock().await.is_empty());
    }

    #[tokio::test]
    async fn get_event_history_respects_limit_and_order() {
        let monitor = ProgressMonitor::new();
        for i in 0..3 {
            monitor
                .publish(ProgressEvent::StepStarted {
                    project_id: "p".into(),
                    step_name: format!("step-{i}"),
                })
                .await;
        }
        let recent = monitor.get_event_history(None, None, Some(2)).await;
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn get_event_history_filters_by_project_and_type() {
        let monitor = ProgressMonitor::new();
        monitor
            .publish(ProgressEvent::StepStarted { project_id: "a".into(), step_name: "s1".into() })
            .await;
        monitor
            .publish(ProgressEvent::StepCompleted {
                project_id: "a".into(),
                step_name: "s1".into(),
                duration_secs: 1.0,
            })
            .await;
        monitor
            .publish(ProgressEvent::StepStarted { project_id: "b".into(), step_name: "s2".into() })
            .await;

        let project_a = monitor.get_event_history(Some("a"), None, None).await;
        assert_eq!(project_a.len(), 2);

        let completed_only = monitor.get_event_history(None, Some(&["step_completed"]), None).await;
        assert_eq!(completed_only.len(), 1);
    }

    #[tokio::test]
    async fn publish_skips_subscribers_outside_their_project_filter() {
        let monitor = ProgressMonitor::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut filter = HashSet::new();
        filter.insert("only-this-project".to_string());
        monitor.subscribe(create_progress_callback(sink.clone()), Some(filter)).await;

        monitor
            .publish(ProgressEvent::StepStarted { project_id: "other-project".into(), step_name: "x".into() })
            .await;
        assert!(sink.lock().await.is_empty());

        monitor
            .publish(ProgressEvent::StepStarted { project_id: "only-this-project".into(), step_name: "x".into() })
            .await;
        assert_eq!(sink.lock().await.len(), 1);
    }

    struct InactiveSubscriber;

    #[async_trait]
    impl EventSubscriber for InactiveSubscriber {
        async fn on_event(&self, _event: &TimestampedEvent) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_active(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn inactive_subscriber_is_pruned_on_next_publish() {
        let monitor = ProgressMonitor::new();
        monitor.subscribe(Arc::new(InactiveSubscriber), None).await;
        assert_eq!(monitor.subscriber_count().await, 1);
        monitor
            .publish(ProgressEvent::StepStarted { project_id: "p".into(), step_name: "x".into() })
            .await;
        assert_eq!(monitor.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn generate_detailed_report_includes_totals_and_resource_snapshot() {
        let monitor = ProgressMonitor::new();
        monitor
            .publish(ProgressEvent::StepStarted { project_id: "p".into(), step_name: "a".into() })
            .await;
        monitor
            .publish(ProgressEvent::StepCompleted { project_id: "p".into(), step_name: "a".into(), duration_secs: 2.0 })
            .await;
        monitor
            .publish(ProgressEvent::StepFailed { project_id: "p".into(), step_name: "b".into(), message: "boom".into() })
            .await;

        let mut usage = HashMap::new();
        usage.insert("gpu".to_string(), ResourceUsage { capacity: 2, available: 1, in_use: 1 });

        let report = monitor.generate_detailed_report("p", &usage).await;
        assert!(report.contains("1 completed"));
        assert!(report.contains("1 failed"));
        assert!(report.contains("fastest step: 'a'"));
        assert!(report.contains("gpu: 1/2 in use"));
    }
}

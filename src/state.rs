//! Execution state tracker: the mutable bookkeeping for one workflow run —
//! per-step status/timing plus aggregate counters, mirroring the
//! transition-counter-adjustment rules of the system being modeled (a step
//! leaving "running" decrements `running_steps`; leaving "pending" decrements
//! `pending_steps`; whichever was actually true at the time of transition).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::StepStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionState {
    pub project_id: String,
    pub workflow_name: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub running_steps: usize,
    pub pending_steps: usize,
    pub skipped_steps: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_cancelled: bool,
    pub is_paused: bool,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub step_durations: HashMap<String, f64>,
    pub step_statuses: HashMap<String, StepStatus>,
    #[serde(skip)]
    step_start_times: HashMap<String, Instant>,
}

impl WorkflowExecutionState {
    pub fn new(project_id: impl Into<String>, workflow_name: impl Into<String>, total_steps: usize) -> Self {
        Self {
            project_id: project_id.into(),
            workflow_name: workflow_name.into(),
            total_steps,
            completed_steps: 0,
            failed_steps: 0,
            running_steps: 0,
            pending_steps: total_steps,
            skipped_steps: 0,
            started_at: Utc::now(),
            completed_at: None,
            is_cancelled: false,
            is_paused: false,
            cancellation_reason: None,
            cancelled_at: None,
            step_durations: HashMap::new(),
            step_statuses: HashMap::new(),
            step_start_times: HashMap::new(),
        }
    }

    pub fn start_step(&mut self, step_name: &str) {
        let was_pending = !matches!(self.step_statuses.get(step_name), Some(StepStatus::Running));
        if was_pending && self.pending_steps > 0 {
            self.pending_steps -= 1;
        }
        self.running_steps += 1;
        self.step_statuses.insert(step_name.to_string(), StepStatus::Running);
        self.step_start_times.insert(step_name.to_string(), Instant::now());
    }

    fn leave_running_or_pending(&mut self, step_name: &str) {
        match self.step_statuses.get(step_name) {
            Some(StepStatus::Running) => {
                if self.running_steps > 0 {
                    self.running_steps -= 1;
                }
            }
            _ => {
                if self.pending_steps > 0 {
                    self.pending_steps -= 1;
                }
            }
        }
    }

    fn duration_for(&mut self, step_name: &str, duration: Option<Duration>) -> f64 {
        if let Some(duration) = duration {
            return duration.as_secs_f64();
        }
        match self.step_start_times.remove(step_name) {
            Some(started) => started.elapsed().as_secs_f64(),
            None => 0.0,
        }
    }

    pub fn complete_step(&mut self, step_name: &str, duration: Option<Duration>) {
        self.leave_running_or_pending(step_name);
        let elapsed = self.duration_for(step_name, duration);
        self.completed_steps += 1;
        self.step_statuses.insert(step_name.to_string(), StepStatus::Completed);
        self.step_durations.insert(step_name.to_string(), elapsed);
        self.maybe_finish();
    }

    pub fn fail_step(&mut self, step_name: &str, duration: Option<Duration>) {
        self.leave_running_or_pending(step_name);
        let elapsed = self.duration_for(step_name, duration);
        self.failed_steps += 1;
        self.step_statuses.insert(step_name.to_string(), StepStatus::Failed);
        self.step_durations.insert(step_name.to_string(), elapsed);
        self.maybe_finish();
    }

    pub fn skip_step(&mut self, step_name: &str) {
        self.leave_running_or_pending(step_name);
        self.skipped_steps += 1;
        self.step_statuses.insert(step_name.to_string(), StepStatus::Skipped);
        self.maybe_finish();
    }

    fn maybe_finish(&mut self) {
        if self.completed_steps + self.failed_steps + self.skipped_steps >= self.total_steps {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.is_cancelled = true;
        self.cancellation_reason = Some(reason.into());
        self.cancelled_at = Some(Utc::now());
    }

    pub fn pause(&mut self) {
        self.is_paused = true;
    }

    pub fn resume(&mut self) {
        self.is_paused = false;
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        (self.completed_steps + self.skipped_steps) as f64 / self.total_steps as f64 * 100.0
    }

    /// Projects remaining time from the mean duration of steps completed so
    /// far, applied to however many steps have not yet reached a terminal
    /// status. Before any step has finished, assumes a 60s-per-step default.
    pub fn estimate_remaining_time(&self) -> Option<f64> {
        let remaining = self.total_steps.saturating_sub(self.completed_steps + self.failed_steps + self.skipped_steps);
        if self.step_durations.is_empty() {
            return Some(60.0 * remaining as f64);
        }
        let mean = self.step_durations.values().sum::<f64>() / self.step_durations.len() as f64;
        Some(mean * remaining as f64)
    }

    pub fn get_status_summary(&self) -> StatusSummary {
        StatusSummary {
            project_id: self.project_id.clone(),
            workflow_name: self.workflow_name.clone(),
            total_steps: self.total_steps,
            completed_steps: self.completed_steps,
            failed_steps: self.failed_steps,
            running_steps: self.running_steps,
            pending_steps: self.pending_steps,
            skipped_steps: self.skipped_steps,
            completion_percentage: self.completion_percentage(),
            is_cancelled: self.is_cancelled,
            is_paused: self.is_paused,
            estimated_remaining_secs: self.estimate_remaining_time(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub project_id: String,
    pub workflow_name: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub running_steps: usize,
    pub pending_steps: usize,
    pub skipped_steps: usize,
    pub completion_percentage: f64,
    pub is_cancelled: bool,
    pub is_paused: bool,
    pub estimated_remaining_secs: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_all_steps_pending() {
        let state = WorkflowExecutionState::new("proj", "render", 3);
        assert_eq!(state.pending_steps, 3);
        assert_eq!(state.completion_percentage(), 0.0);
    }

    #[test]
    fn start_then_complete_moves_pending_to_completed() {
        let mut state = WorkflowExecutionState::new("proj", "render", 2);
        state.start_step("a");
        assert_eq!(state.pending_steps, 1);
        assert_eq!(state.running_steps, 1);
        state.complete_step("a", Some(Duration::from_secs(2)));
        assert_eq!(state.running_steps, 0);
        assert_eq!(state.completed_steps, 1);
        assert_eq!(state.step_durations["a"], 2.0);
    }

    #[test]
    fn completing_without_starting_decrements_pending() {
        let mut state = WorkflowExecutionState::new("proj", "render", 1);
        state.complete_step("a", Some(Duration::from_secs(1)));
        assert_eq!(state.pending_steps, 0);
        assert_eq!(state.running_steps, 0);
        assert_eq!(state.completed_steps, 1);
    }

    #[test]
    fn completion_percentage_counts_skipped_as_done() {
        let mut state = WorkflowExecutionState::new("proj", "render", 2);
        state.start_step("a");
        state.complete_step("a", Some(Duration::from_secs(1)));
        state.skip_step("b");
        assert_eq!(state.completion_percentage(), 100.0);
    }

    #[test]
    fn empty_workflow_is_always_complete() {
        let state = WorkflowExecutionState::new("proj", "render", 0);
        assert_eq!(state.completion_percentage(), 100.0);
    }

    #[test]
    fn cancel_records_reason_and_timestamp() {
        let mut state = WorkflowExecutionState::new("proj", "render", 1);
        state.cancel("user requested abort");
        assert!(state.is_cancelled);
        assert_eq!(state.cancellation_reason.as_deref(), Some("user requested abort"));
        assert!(state.cancelled_at.is_some());
    }

    #[test]
    fn pause_resume_toggles_flag() {
        let mut state = WorkflowExecutionState::new("proj", "render", 1);
        state.pause();
        assert!(state.is_paused);
        state.resume();
        assert!(!state.is_paused);
    }

    #[test]
    fn completed_at_set_once_all_steps_terminal() {
        let mut state = WorkflowExecutionState::new("proj", "render", 2);
        state.start_step("a");
        state.complete_step("a", Some(Duration::from_secs(1)));
        assert!(state.completed_at.is_none());
        state.start_step("b");
        state.fail_step("b", Some(Duration::from_secs(1)));
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn estimate_remaining_time_defaults_to_60s_per_step_before_any_completion() {
        let state = WorkflowExecutionState::new("proj", "render", 3);
        assert_eq!(state.estimate_remaining_time(), Some(180.0));
    }

    #[test]
    fn estimate_remaining_time_scales_by_mean_duration() {
        let mut state = WorkflowExecutionState::new("proj", "render", 4);
        state.start_step("a");
        state.complete_step("a", Some(Duration::from_secs(10)));
        // 1 done, 3 remaining, mean duration 10s => 30s projected
        assert_eq!(state.estimate_remaining_time(), Some(30.0));
    }
}

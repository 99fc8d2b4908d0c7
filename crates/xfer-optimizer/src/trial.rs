//! Trial records, observations and run status tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use xfer_types::{TrialError, TrialId};

use crate::space::Configuration;

/// Unique tuning run identifier.
pub type RunId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Order two metric values so that the better one sorts first.
    /// NaN is worse than any number.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match self {
                Self::Minimize => a.total_cmp(&b),
                Self::Maximize => b.total_cmp(&a),
            },
        }
    }

    pub fn is_better(self, a: f64, b: f64) -> bool {
        self.compare(a, b) == Ordering::Less
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Promoted,
    Stopped,
    Completed,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Stopped | Completed | Failed)
                | (Running, Paused | Stopped | Completed | Failed | Pending)
                | (Paused, Promoted | Stopped)
                | (Promoted, Running | Stopped | Failed | Pending)
        )
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Promoted => "promoted",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A single trial: one configuration run incrementally, one resource unit
/// at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub configuration: Configuration,
    pub status: TrialStatus,
    /// Highest resource level reported so far.
    pub resource_done: u32,
    /// The objective's running aggregate as of `resource_done`.
    pub cumulative_metric: f64,
    pub latest_metric: Option<f64>,
    /// How many times the trial was re-attached after a worker crash.
    pub restarts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<usize>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(id: TrialId, configuration: Configuration) -> Self {
        Self {
            id,
            configuration,
            status: TrialStatus::Pending,
            resource_done: 0,
            cumulative_metric: 0.0,
            latest_metric: None,
            restarts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: TrialStatus) -> Result<(), TrialError> {
        if !self.status.can_transition_to(next) {
            return Err(TrialError::InvalidTransition {
                trial_id: self.id.0,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_running(&mut self, worker_id: usize) -> Result<(), TrialError> {
        self.transition(TrialStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.worker_id = Some(worker_id);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String) -> Result<(), TrialError> {
        self.transition(TrialStatus::Failed)?;
        self.error = Some(error);
        self.worker_id = None;
        Ok(())
    }

    /// Fold a newly accepted report into the running aggregates.
    pub fn record_progress(
        &mut self,
        resource_level: u32,
        metric_value: f64,
        cumulative_metric: f64,
    ) {
        self.resource_done = self.resource_done.max(resource_level);
        self.cumulative_metric = cumulative_metric;
        self.latest_metric = Some(metric_value);
    }

    pub fn summary(&self) -> TrialSummary {
        TrialSummary {
            trial_id: self.id,
            configuration: self.configuration.clone(),
            status: self.status,
            resource_done: self.resource_done,
            latest_metric: self.latest_metric,
            cumulative_metric: self.cumulative_metric,
        }
    }
}

/// One metric report at one resource level. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub trial_id: TrialId,
    pub configuration: Configuration,
    pub resource_level: u32,
    pub metric_value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A trial failure. Kept apart from the observation history so searchers
/// never see a result for a run that produced none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub trial_id: TrialId,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of a trial for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub trial_id: TrialId,
    pub configuration: Configuration,
    pub status: TrialStatus,
    pub resource_done: u32,
    pub latest_metric: Option<f64>,
    pub cumulative_metric: f64,
}

impl TrialSummary {
    /// Deeper trials win; at equal depth the better latest metric wins.
    pub fn outranks(&self, other: &TrialSummary, direction: ObjectiveDirection) -> bool {
        match (self.latest_metric, other.latest_metric) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(a), Some(b)) => match self.resource_done.cmp(&other.resource_done) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => direction.is_better(a, b),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle state for a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    /// Deadline reached; no new trials, in-flight ones are draining.
    Draining,
    Finished,
}

/// Aggregate status of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningStatus {
    pub run_id: RunId,
    pub state: RunState,
    pub direction: ObjectiveDirection,
    pub trials_started: usize,
    pub trials_running: usize,
    pub trials_paused: usize,
    pub trials_completed: usize,
    pub trials_stopped: usize,
    pub trials_failed: usize,
    pub best_trial: Option<TrialSummary>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TuningStatus {
    pub fn new(run_id: RunId, direction: ObjectiveDirection) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            direction,
            trials_started: 0,
            trials_running: 0,
            trials_paused: 0,
            trials_completed: 0,
            trials_stopped: 0,
            trials_failed: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_draining(&mut self) {
        self.state = RunState::Draining;
    }

    pub fn mark_finished(&mut self) {
        self.state = RunState::Finished;
        self.finished_at = Some(Utc::now());
    }

    /// Update the best trial if `summary` improves on the current best.
    pub fn update_best(&mut self, summary: &TrialSummary) {
        let dominated = match &self.best_trial {
            None => summary.latest_metric.is_some(),
            Some(current) if current.trial_id == summary.trial_id => true,
            Some(current) => summary.outranks(current, self.direction),
        };
        if dominated {
            self.best_trial = Some(summary.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;
    use std::collections::BTreeMap;

    fn config(x: i64) -> Configuration {
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), ParameterValue::Int(x));
        Configuration::from_map(values)
    }

    fn summary(id: u64, depth: u32, metric: f64) -> TrialSummary {
        TrialSummary {
            trial_id: TrialId(id),
            configuration: config(id as i64),
            status: TrialStatus::Running,
            resource_done: depth,
            latest_metric: Some(metric),
            cumulative_metric: metric,
        }
    }

    #[test]
    fn direction_orders_nan_last() {
        let min = ObjectiveDirection::Minimize;
        assert!(min.is_better(1.0, 2.0));
        assert!(min.is_better(5.0, f64::NAN));
        assert!(!min.is_better(f64::NAN, 5.0));

        let max = ObjectiveDirection::Maximize;
        assert!(max.is_better(2.0, 1.0));
        assert!(max.is_better(-10.0, f64::NAN));
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = Trial::new(TrialId(0), config(3));
        assert_eq!(trial.status, TrialStatus::Pending);

        trial.mark_running(2).unwrap();
        assert_eq!(trial.worker_id, Some(2));
        assert!(trial.started_at.is_some());

        trial.record_progress(1, 4.0, 4.0);
        trial.record_progress(2, 3.0, 6.0);
        assert_eq!(trial.resource_done, 2);
        assert_eq!(trial.cumulative_metric, 6.0);
        assert_eq!(trial.latest_metric, Some(3.0));

        trial.transition(TrialStatus::Completed).unwrap();
        assert!(trial.is_terminal());
        assert!(trial.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut trial = Trial::new(TrialId(1), config(1));
        trial.mark_running(0).unwrap();
        trial.mark_failed("objective panicked".into()).unwrap();
        assert_eq!(trial.error.as_deref(), Some("objective panicked"));

        let err = trial.transition(TrialStatus::Running).unwrap_err();
        assert!(matches!(err, TrialError::InvalidTransition { .. }));
        assert!(trial.transition(TrialStatus::Completed).is_err());
    }

    #[test]
    fn paused_trials_must_be_promoted_before_running() {
        let mut trial = Trial::new(TrialId(2), config(1));
        trial.mark_running(0).unwrap();
        trial.transition(TrialStatus::Paused).unwrap();
        assert!(trial.mark_running(1).is_err());

        trial.transition(TrialStatus::Promoted).unwrap();
        trial.mark_running(1).unwrap();
        assert_eq!(trial.status, TrialStatus::Running);
    }

    #[test]
    fn best_trial_prefers_depth_then_metric() {
        let mut status = TuningStatus::new(Uuid::new_v4(), ObjectiveDirection::Minimize);

        status.update_best(&summary(0, 1, 2.0));
        assert_eq!(status.best_trial.as_ref().unwrap().trial_id, TrialId(0));

        // Better metric at the same depth replaces.
        status.update_best(&summary(1, 1, 1.5));
        assert_eq!(status.best_trial.as_ref().unwrap().trial_id, TrialId(1));

        // Deeper trial replaces even with a worse metric.
        status.update_best(&summary(2, 3, 9.0));
        assert_eq!(status.best_trial.as_ref().unwrap().trial_id, TrialId(2));

        // Shallower trial never replaces.
        status.update_best(&summary(3, 2, 0.1));
        assert_eq!(status.best_trial.as_ref().unwrap().trial_id, TrialId(2));

        // Same trial refreshes its own entry.
        status.update_best(&summary(2, 3, 9.5));
        assert_eq!(status.best_trial.as_ref().unwrap().latest_metric, Some(9.5));
    }

    #[test]
    fn run_status_lifecycle() {
        let mut status = TuningStatus::new(Uuid::new_v4(), ObjectiveDirection::Maximize);
        assert_eq!(status.state, RunState::Pending);

        status.mark_running();
        assert!(status.started_at.is_some());
        status.mark_draining();
        assert_eq!(status.state, RunState::Draining);
        status.mark_finished();
        assert_eq!(status.state, RunState::Finished);
        assert!(status.finished_at.is_some());
    }
}

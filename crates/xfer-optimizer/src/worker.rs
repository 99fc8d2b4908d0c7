//! Objective capability and the per-trial execution loop run by workers.
//!
//! A worker holds a transient lease on one trial. It resumes from the
//! trial's checkpoint, runs one resource unit at a time, writes the new
//! checkpoint and only then reports to the scheduler, waiting for a
//! directive before starting the next unit.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use xfer_types::TrialId;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::space::Configuration;

/// What one resource unit produced.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    /// Metric reported for the resource level just reached.
    pub metric_value: f64,
    /// New value of the objective's running aggregate.
    pub cumulative_metric: f64,
    /// Opaque sub-state to persist with the checkpoint.
    pub state: serde_json::Value,
    /// The objective has nothing left to run.
    pub done: bool,
}

/// Errors surfaced by objective execution.
#[derive(Debug, thiserror::Error)]
pub enum ObjectiveError {
    #[error("objective failed: {message}")]
    Failed { message: String },
    #[error("objective I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The black-box function being tuned, evaluated one resource unit at a time.
#[async_trait]
pub trait Objective: Send + Sync {
    /// Run the next resource unit for `config`, resuming from `prior`
    /// (`None` means nothing has run yet).
    async fn run_unit(
        &self,
        config: &Configuration,
        prior: Option<&CheckpointRecord>,
    ) -> Result<UnitOutcome, ObjectiveError>;

    /// Human-readable objective name.
    fn name(&self) -> &str {
        "objective"
    }
}

/// Scheduler answer to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Run the next unit.
    Continue,
    /// The trial is complete; exit normally.
    Finish,
    /// The trial was stopped or paused; start no further units.
    Halt,
}

/// A progress report sent from a worker to the scheduler.
#[derive(Debug)]
pub struct WorkerReport {
    pub trial_id: TrialId,
    pub resource_level: u32,
    pub metric_value: f64,
    /// The objective's running aggregate after this level.
    pub cumulative_metric: f64,
    pub done: bool,
    pub reply: oneshot::Sender<Directive>,
}

/// Cooperative cancellation shared between the dispatch loop and a worker.
/// Checked before each unit; never interrupts one in flight.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a worker needs to execute one trial.
#[derive(Debug, Clone)]
pub struct TrialLease {
    pub trial_id: TrialId,
    pub configuration: Configuration,
    pub worker_id: usize,
    /// Resource level the scheduler has already accepted for this trial.
    pub acknowledged: u32,
    pub max_resource: u32,
    pub cancel: CancellationFlag,
}

/// How a worker left its trial.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    Finished,
    Halted,
    Cancelled,
    Failed(String),
}

/// Execute `lease` until the trial finishes, is halted, cancelled or fails.
pub async fn run_trial(
    lease: TrialLease,
    objective: Arc<dyn Objective>,
    checkpoints: CheckpointStore,
    reports: mpsc::UnboundedSender<WorkerReport>,
) -> WorkerExit {
    let trial_id = lease.trial_id;
    let mut record = checkpoints.load_or_reset(trial_id).await;

    if let Some(resumed) = &record {
        info!(
            trial = %trial_id,
            worker = lease.worker_id,
            resource_done = resumed.resource_done,
            "resuming trial from checkpoint"
        );
        // The previous worker may have died between writing the checkpoint
        // and reporting it. Replaying is harmless: the scheduler ignores
        // reports it has already accepted.
        let level = resumed.resource_done;
        let done = resumed.done || level >= lease.max_resource;
        match resumed.last_metric {
            Some(metric) if level > lease.acknowledged => {
                let cumulative = resumed.cumulative_metric;
                match send_report(&reports, trial_id, level, metric, cumulative, done).await {
                    Some(Directive::Continue) if done => return WorkerExit::Finished,
                    Some(Directive::Continue) => {}
                    Some(Directive::Finish) => return WorkerExit::Finished,
                    Some(Directive::Halt) => return WorkerExit::Halted,
                    None => return WorkerExit::Cancelled,
                }
            }
            _ => {}
        }
    }

    loop {
        let done_units = record.as_ref().map_or(0, |r| r.resource_done);
        if done_units >= lease.max_resource || record.as_ref().is_some_and(|r| r.done) {
            return WorkerExit::Finished;
        }
        if lease.cancel.is_cancelled() {
            debug!(trial = %trial_id, "cancelled before unit {}", done_units + 1);
            return WorkerExit::Cancelled;
        }

        let outcome = match objective.run_unit(&lease.configuration, record.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => return WorkerExit::Failed(e.to_string()),
        };

        let base = record
            .take()
            .unwrap_or_else(|| CheckpointRecord::fresh(trial_id));
        let next = base.advance(&outcome);
        if let Err(e) = checkpoints.save(&next).await {
            warn!(trial = %trial_id, error = %e, "checkpoint write failed");
            return WorkerExit::Failed(format!("checkpoint write failed: {e}"));
        }
        let level = next.resource_done;
        record = Some(next);

        debug!(
            trial = %trial_id,
            level,
            metric = outcome.metric_value,
            "resource unit finished"
        );

        let done = outcome.done || level >= lease.max_resource;
        let reported = send_report(
            &reports,
            trial_id,
            level,
            outcome.metric_value,
            outcome.cumulative_metric,
            done,
        )
        .await;
        match reported {
            Some(Directive::Continue) if done => return WorkerExit::Finished,
            Some(Directive::Continue) => {}
            Some(Directive::Finish) => return WorkerExit::Finished,
            Some(Directive::Halt) => return WorkerExit::Halted,
            None => return WorkerExit::Cancelled,
        }
    }
}

/// Send a report and wait for the directive. `None` if the scheduler is gone.
async fn send_report(
    reports: &mpsc::UnboundedSender<WorkerReport>,
    trial_id: TrialId,
    resource_level: u32,
    metric_value: f64,
    cumulative_metric: f64,
    done: bool,
) -> Option<Directive> {
    let (reply, directive) = oneshot::channel();
    reports
        .send(WorkerReport {
            trial_id,
            resource_level,
            metric_value,
            cumulative_metric,
            done,
            reply,
        })
        .ok()?;
    directive.await.ok()
}

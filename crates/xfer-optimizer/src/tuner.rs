//! Async dispatch loop: runs trials on a bounded pool of worker tasks and
//! funnels every report through the scheduler.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use xfer_types::{TrialId, TuneResult};

use crate::checkpoint::CheckpointStore;
use crate::config::TunerConfig;
use crate::events::EventSink;
use crate::scheduler::Scheduler;
use crate::trial::{FailureEvent, Observation, Trial, TrialSummary, TuningStatus};
use crate::worker::{run_trial, Directive, Objective, WorkerExit, WorkerReport};

/// Final results of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningSummary {
    pub status: TuningStatus,
    pub trials: Vec<TrialSummary>,
    pub failures: Vec<FailureEvent>,
    pub history: Vec<Observation>,
}

impl TuningSummary {
    pub fn best(&self) -> Option<&TrialSummary> {
        self.status.best_trial.as_ref()
    }
}

/// How a worker task ended.
enum Departure {
    Exit(WorkerExit),
    /// The worker panicked; the trial itself did not fail.
    Crash(String),
}

pub struct Tuner {
    scheduler: Scheduler,
    objective: Arc<dyn Objective>,
    checkpoints: CheckpointStore,
    status: Arc<RwLock<TuningStatus>>,
    next_worker_id: usize,
}

impl Tuner {
    pub fn new(
        config: TunerConfig,
        objective: Arc<dyn Objective>,
        checkpoints: CheckpointStore,
        events: EventSink,
    ) -> TuneResult<Self> {
        let scheduler = Scheduler::new(config, events)?;
        Ok(Self::with_scheduler(scheduler, objective, checkpoints))
    }

    /// Drive an already built scheduler, e.g. one with a custom searcher.
    pub fn with_scheduler(
        scheduler: Scheduler,
        objective: Arc<dyn Objective>,
        checkpoints: CheckpointStore,
    ) -> Self {
        let status = Arc::new(RwLock::new(scheduler.status()));
        Self {
            scheduler,
            objective,
            checkpoints,
            status,
            next_worker_id: 0,
        }
    }

    /// Live view of the run status, refreshed after every event.
    pub fn status_handle(&self) -> Arc<RwLock<TuningStatus>> {
        Arc::clone(&self.status)
    }

    /// Run until no trial can be dispatched and every worker has exited.
    pub async fn run(mut self) -> TuningSummary {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<WorkerReport>();
        let mut workers: JoinSet<(TrialId, Departure)> = JoinSet::new();

        let started = Instant::now();
        let deadline = self.scheduler.config().deadline().map(|d| started + d);
        let drain_timeout = self.scheduler.config().drain_timeout();
        let mut drain_deadline: Option<Instant> = None;
        let mut draining = false;

        self.scheduler.start();
        self.publish();

        loop {
            if !draining && deadline.is_some_and(|d| Instant::now() >= d) {
                draining = true;
                self.scheduler.begin_drain();
                drain_deadline = drain_timeout.map(|t| Instant::now() + t);
            }

            self.fill_slots(&mut workers, &report_tx, !draining);
            self.publish();
            if workers.is_empty() {
                break;
            }

            tokio::select! {
                Some(report) = report_rx.recv() => self.handle_report(report),
                Some(joined) = workers.join_next() => self.handle_exit(joined),
                _ = sleep_until(deadline.unwrap_or(started)), if !draining && deadline.is_some() => {}
                _ = sleep_until(drain_deadline.unwrap_or(started)), if drain_deadline.is_some() => {
                    drain_deadline = None;
                    self.cancel_running();
                }
            }
        }

        let status = self.scheduler.finish();
        *self.status.write() = status.clone();
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            best = ?status.best_trial.as_ref().map(|b| b.trial_id),
            "dispatch loop exited"
        );
        TuningSummary {
            status,
            trials: self.scheduler.trials().map(Trial::summary).collect(),
            failures: self.scheduler.failures().to_vec(),
            history: self.scheduler.history().to_vec(),
        }
    }

    fn fill_slots(
        &mut self,
        workers: &mut JoinSet<(TrialId, Departure)>,
        reports: &mpsc::UnboundedSender<WorkerReport>,
        accept_new: bool,
    ) {
        while workers.len() < self.scheduler.effective_workers() {
            let Some(trial_id) = self.scheduler.next_dispatch(accept_new) else {
                break;
            };
            let worker_id = self.next_worker_id;
            self.next_worker_id += 1;
            let lease = match self.scheduler.start_trial(trial_id, worker_id) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(trial = %trial_id, error = %e, "could not dispatch trial");
                    break;
                }
            };

            let objective = Arc::clone(&self.objective);
            let checkpoints = self.checkpoints.clone();
            let reports = reports.clone();
            workers.spawn(async move {
                let handle = tokio::spawn(run_trial(lease, objective, checkpoints, reports));
                let departure = match handle.await {
                    Ok(exit) => Departure::Exit(exit),
                    Err(e) => Departure::Crash(panic_message(e)),
                };
                (trial_id, departure)
            });
        }
    }

    fn handle_report(&mut self, report: WorkerReport) {
        let directive = match self.scheduler.on_report(
            report.trial_id,
            report.resource_level,
            report.metric_value,
            report.cumulative_metric,
            report.done,
        ) {
            Ok(directive) => directive,
            Err(e) => {
                warn!(trial = %report.trial_id, error = %e, "report rejected");
                Directive::Halt
            }
        };
        if report.reply.send(directive).is_err() {
            debug!(trial = %report.trial_id, "worker went away before the directive");
        }
    }

    fn handle_exit(&mut self, joined: Result<(TrialId, Departure), JoinError>) {
        let (trial_id, departure) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!(error = %e, "worker supervisor task failed");
                return;
            }
        };
        let result = match departure {
            Departure::Exit(WorkerExit::Finished) => self.scheduler.on_complete(trial_id),
            Departure::Exit(WorkerExit::Halted) => Ok(()),
            Departure::Exit(WorkerExit::Cancelled) => {
                self.scheduler.force_stop(trial_id, "cancelled")
            }
            Departure::Exit(WorkerExit::Failed(message)) => {
                self.scheduler.on_failure(trial_id, message)
            }
            Departure::Crash(message) => self.scheduler.requeue(trial_id, &message).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(trial = %trial_id, error = %e, "could not record worker exit");
        }
    }

    fn cancel_running(&mut self) {
        for trial_id in self.scheduler.running() {
            if let Err(e) = self.scheduler.force_stop(trial_id, "drain timeout") {
                warn!(trial = %trial_id, error = %e, "could not cancel trial");
            }
        }
    }

    fn publish(&self) {
        *self.status.write() = self.scheduler.status();
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}

//! Single-writer scheduler state machine.
//!
//! The scheduler owns every trial record, the observation history and the
//! rung ladder. Workers only reach it through reports, and the dispatch loop
//! in [`crate::tuner`] serializes every call, so a peer's metric is always
//! visible before the next comparison runs.

use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, error, info, warn};

use xfer_types::{TrialError, TrialId, TuneResult};

use crate::config::{SchedulerMode, TunerConfig};
use crate::events::{EventSink, TuningEvent};
use crate::rung::{RecordOutcome, RungDecision, RungLadder};
use crate::search::Searcher;
use crate::space::Configuration;
use crate::trial::{FailureEvent, Observation, RunState, Trial, TrialStatus, TuningStatus};
use crate::worker::{CancellationFlag, Directive, TrialLease};

/// Invalid searcher proposals tolerated per suggestion before drawing from
/// the prior instead.
const MAX_SUGGEST_ATTEMPTS: usize = 5;

/// What happens to a trial after an accepted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Continue,
    Stop,
    Pause,
    Complete,
}

pub struct Scheduler {
    config: TunerConfig,
    searcher: Box<dyn Searcher>,
    ladder: RungLadder,
    trials: BTreeMap<TrialId, Trial>,
    history: Vec<Observation>,
    failures: Vec<FailureEvent>,
    initial_points: VecDeque<Configuration>,
    /// Trials whose worker crashed, waiting for a fresh worker.
    requeued: VecDeque<TrialId>,
    cancels: HashMap<TrialId, CancellationFlag>,
    rng: ChaCha8Rng,
    next_id: TrialId,
    status: TuningStatus,
    failure_streak: usize,
    events: EventSink,
}

impl Scheduler {
    /// Validate `config` and build a scheduler with its configured searcher.
    pub fn new(config: TunerConfig, events: EventSink) -> TuneResult<Self> {
        let searcher = config.build_searcher();
        Self::with_searcher(config, searcher, events)
    }

    pub fn with_searcher(
        config: TunerConfig,
        searcher: Box<dyn Searcher>,
        events: EventSink,
    ) -> TuneResult<Self> {
        config.validate()?;

        let mut initial_points = VecDeque::new();
        for (index, point) in config.points_to_evaluate.iter().enumerate() {
            match config.space.resolve(point) {
                Ok(configuration) => initial_points.push_back(configuration),
                Err(e) => warn!(index, error = %e, "skipping invalid starting configuration"),
            }
        }

        Ok(Self {
            searcher,
            ladder: config.build_ladder(),
            trials: BTreeMap::new(),
            history: Vec::new(),
            failures: Vec::new(),
            initial_points,
            requeued: VecDeque::new(),
            cancels: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            next_id: TrialId(0),
            status: TuningStatus::new(config.id, config.direction),
            failure_streak: 0,
            events,
            config,
        })
    }

    // ---- accessors ----

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn trial(&self, trial_id: TrialId) -> Option<&Trial> {
        self.trials.get(&trial_id)
    }

    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.values()
    }

    pub fn history(&self) -> &[Observation] {
        &self.history
    }

    pub fn failures(&self) -> &[FailureEvent] {
        &self.failures
    }

    pub fn ladder(&self) -> &RungLadder {
        &self.ladder
    }

    pub fn failure_streak(&self) -> usize {
        self.failure_streak
    }

    /// Trials currently executing on a worker.
    pub fn running(&self) -> Vec<TrialId> {
        self.trials
            .values()
            .filter(|t| t.status == TrialStatus::Running)
            .map(|t| t.id)
            .collect()
    }

    /// Worker slots usable right now. Halves after every `failure_backoff`
    /// consecutive failures, never below one.
    pub fn effective_workers(&self) -> usize {
        let halvings = (self.failure_streak / self.config.failure_backoff) as u32;
        self.config
            .workers
            .checked_shr(halvings)
            .unwrap_or(0)
            .max(1)
    }

    pub fn can_suggest(&self) -> bool {
        self.config
            .max_trials
            .map_or(true, |max| self.trials.len() < max)
    }

    /// Snapshot of the run with counts recomputed from the trial records.
    pub fn status(&self) -> TuningStatus {
        let mut status = self.status.clone();
        let count = |s: TrialStatus| self.trials.values().filter(|t| t.status == s).count();
        status.trials_started = self.trials.len();
        status.trials_running = count(TrialStatus::Running);
        status.trials_paused = count(TrialStatus::Paused);
        status.trials_completed = count(TrialStatus::Completed);
        status.trials_stopped = count(TrialStatus::Stopped);
        status.trials_failed = count(TrialStatus::Failed);
        if let Some(best) = status.best_trial.as_mut() {
            if let Some(trial) = self.trials.get(&best.trial_id) {
                *best = trial.summary();
            }
        }
        status
    }

    // ---- run lifecycle ----

    pub fn start(&mut self) {
        self.status.mark_running();
        info!(
            run = %self.config.id,
            name = %self.config.name,
            workers = self.config.workers,
            mode = ?self.config.mode,
            searcher = self.searcher.name(),
            "tuning run started"
        );
        self.events.emit(TuningEvent::RunStarted {
            run_id: self.config.id,
            workers: self.config.workers,
            mode: self.config.mode,
        });
    }

    /// Deadline reached: from now on only in-flight trials are served.
    pub fn begin_drain(&mut self) {
        if self.status.state == RunState::Draining {
            return;
        }
        self.status.mark_draining();
        let running = self.running().len();
        info!(running, "deadline reached; draining in-flight trials");
        self.events.emit(TuningEvent::DeadlineReached { running });
    }

    /// Stop every trial that has not reached a terminal status and close the
    /// run.
    pub fn finish(&mut self) -> TuningStatus {
        let unfinished: Vec<TrialId> = self
            .trials
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id)
            .collect();
        for trial_id in unfinished {
            if let Err(e) = self.force_stop(trial_id, "run finished") {
                warn!(trial = %trial_id, error = %e, "could not stop unfinished trial");
            }
        }
        self.status.mark_finished();
        let status = self.status();
        info!(
            started = status.trials_started,
            completed = status.trials_completed,
            stopped = status.trials_stopped,
            failed = status.trials_failed,
            "tuning run finished"
        );
        self.events.emit(TuningEvent::RunFinished {
            status: status.clone(),
        });
        status
    }

    // ---- suggestion and dispatch ----

    /// Create a new pending trial from the next configuration.
    pub fn suggest(&mut self) -> Trial {
        let configuration = self.next_configuration();
        let trial_id = self.next_id;
        self.next_id = trial_id.next();
        let trial = Trial::new(trial_id, configuration);
        info!(trial = %trial_id, config = %trial.configuration, "suggested trial");
        self.trials.insert(trial_id, trial.clone());
        trial
    }

    fn next_configuration(&mut self) -> Configuration {
        if let Some(point) = self.initial_points.pop_front() {
            return point;
        }
        for attempt in 1..=MAX_SUGGEST_ATTEMPTS {
            match self
                .searcher
                .next_config(&self.history, &self.config.space, &mut self.rng)
            {
                Some(configuration) => match self.config.space.check(&configuration) {
                    Ok(()) => return configuration,
                    Err(e) => warn!(
                        attempt,
                        searcher = self.searcher.name(),
                        error = %e,
                        "searcher proposed an invalid configuration"
                    ),
                },
                None => {
                    debug!(searcher = self.searcher.name(), "no suggestion; drawing from the prior");
                    break;
                }
            }
        }
        self.config.space.sample_default(&mut self.rng)
    }

    /// Pick the next trial to hand to a free worker: re-attach crashed
    /// trials first, then (unless draining) promote a paused trial or
    /// suggest a new one.
    pub fn next_dispatch(&mut self, accept_new: bool) -> Option<TrialId> {
        while let Some(trial_id) = self.requeued.pop_front() {
            if self
                .trials
                .get(&trial_id)
                .is_some_and(|t| t.status == TrialStatus::Pending)
            {
                return Some(trial_id);
            }
        }
        if !accept_new {
            return None;
        }
        if self.config.mode == SchedulerMode::Promotion {
            if let Some(trial_id) = self.promote_next() {
                return Some(trial_id);
            }
        }
        if self.can_suggest() {
            return Some(self.suggest().id);
        }
        None
    }

    /// Promote the best paused trial that now ranks within its rung's cutoff.
    pub fn promote_next(&mut self) -> Option<TrialId> {
        let trials = &self.trials;
        let (trial_id, level) = self.ladder.promote_next(|id| {
            trials
                .get(&id)
                .is_some_and(|t| t.status == TrialStatus::Paused)
        })?;
        let trial = self.trials.get_mut(&trial_id)?;
        if let Err(e) = trial.transition(TrialStatus::Promoted) {
            warn!(trial = %trial_id, error = %e, "promotion rejected");
            return None;
        }
        info!(trial = %trial_id, from_level = level, "promoted paused trial");
        self.events.emit(TuningEvent::TrialPromoted {
            trial_id,
            from_level: level,
        });
        Some(trial_id)
    }

    /// Hand a pending or promoted trial to `worker_id`.
    pub fn start_trial(&mut self, trial_id: TrialId, worker_id: usize) -> TuneResult<TrialLease> {
        let max_resource = self.ladder.max_level();
        let trial = self
            .trials
            .get_mut(&trial_id)
            .ok_or(TrialError::NotFound { trial_id: trial_id.0 })?;
        trial.mark_running(worker_id)?;

        let cancel = CancellationFlag::new();
        let lease = TrialLease {
            trial_id,
            configuration: trial.configuration.clone(),
            worker_id,
            acknowledged: trial.resource_done,
            max_resource,
            cancel: cancel.clone(),
        };
        self.cancels.insert(trial_id, cancel);

        debug!(trial = %trial_id, worker = worker_id, resume_from = lease.acknowledged, "trial dispatched");
        self.events.emit(TuningEvent::TrialStarted {
            trial_id,
            worker_id,
            configuration: lease.configuration.clone(),
            resume_from: lease.acknowledged,
        });
        Ok(lease)
    }

    // ---- reports ----

    /// Ingest one resource-unit report and tell the worker what to do next.
    ///
    /// Reports at or below the trial's accepted level are duplicates and
    /// change nothing.
    pub fn on_report(
        &mut self,
        trial_id: TrialId,
        resource_level: u32,
        metric_value: f64,
        cumulative_metric: f64,
        done: bool,
    ) -> TuneResult<Directive> {
        let trial = self
            .trials
            .get_mut(&trial_id)
            .ok_or(TrialError::NotFound { trial_id: trial_id.0 })?;

        if resource_level <= trial.resource_done {
            warn!(trial = %trial_id, level = resource_level, "duplicate report ignored");
            return Ok(directive_for(trial.status));
        }
        if trial.status == TrialStatus::Failed {
            warn!(trial = %trial_id, level = resource_level, "report for failed trial ignored");
            return Ok(Directive::Halt);
        }

        trial.record_progress(resource_level, metric_value, cumulative_metric);
        let status = trial.status;
        let summary = trial.summary();
        let observation = Observation {
            trial_id,
            configuration: trial.configuration.clone(),
            resource_level,
            metric_value,
            timestamp: Utc::now(),
        };

        debug!(trial = %trial_id, level = resource_level, metric = metric_value, "report accepted");
        self.events.emit(TuningEvent::UnitReported {
            trial_id,
            resource_level,
            metric_value,
            timestamp: observation.timestamp,
        });
        self.history.push(observation);
        self.failure_streak = 0;
        self.status.update_best(&summary);

        if status != TrialStatus::Running {
            debug!(trial = %trial_id, %status, "late report recorded without a rung decision");
            return Ok(directive_for(status));
        }

        let verdict = self.judge(trial_id, resource_level, metric_value, done);
        self.apply(trial_id, resource_level, verdict)
    }

    fn judge(&mut self, trial_id: TrialId, level: u32, metric: f64, done: bool) -> Verdict {
        let last = level >= self.ladder.max_level();
        match self.config.mode {
            SchedulerMode::Fifo if last || done => Verdict::Complete,
            SchedulerMode::Fifo => Verdict::Continue,
            SchedulerMode::Stopping => match self.ladder.on_result(trial_id, level, metric) {
                RungDecision::Stop => Verdict::Stop,
                RungDecision::Complete => Verdict::Complete,
                RungDecision::Continue | RungDecision::Duplicate if last || done => {
                    Verdict::Complete
                }
                RungDecision::Continue | RungDecision::Duplicate => Verdict::Continue,
            },
            SchedulerMode::Promotion => match self.ladder.record(trial_id, level, metric) {
                _ if last || done => Verdict::Complete,
                RecordOutcome::Recorded => Verdict::Pause,
                RecordOutcome::Duplicate | RecordOutcome::NotARung => Verdict::Continue,
            },
        }
    }

    fn apply(&mut self, trial_id: TrialId, level: u32, verdict: Verdict) -> TuneResult<Directive> {
        match verdict {
            Verdict::Continue => Ok(Directive::Continue),
            Verdict::Stop => {
                self.stop_trial(trial_id, level, "below rung cutoff")?;
                Ok(Directive::Halt)
            }
            Verdict::Pause => {
                let trial = self.trial_mut(trial_id)?;
                trial.transition(TrialStatus::Paused)?;
                trial.worker_id = None;
                self.cancels.remove(&trial_id);
                info!(trial = %trial_id, level, "trial paused at rung");
                self.events.emit(TuningEvent::TrialPaused {
                    trial_id,
                    resource_level: level,
                });
                Ok(Directive::Halt)
            }
            Verdict::Complete => {
                self.complete_trial(trial_id)?;
                Ok(Directive::Finish)
            }
        }
    }

    // ---- terminal transitions ----

    /// The trial reached its maximum resource. No-op if already terminal.
    pub fn on_complete(&mut self, trial_id: TrialId) -> TuneResult<()> {
        if self.trial_mut(trial_id)?.is_terminal() {
            return Ok(());
        }
        self.complete_trial(trial_id)
    }

    /// The objective failed. The trial fails without retry and no
    /// observation is recorded for the attempt.
    pub fn on_failure(&mut self, trial_id: TrialId, message: String) -> TuneResult<()> {
        let trial = self.trial_mut(trial_id)?;
        if trial.is_terminal() {
            debug!(trial = %trial_id, "failure for finished trial ignored");
            return Ok(());
        }
        let failure = TrialError::WorkerFailure {
            trial_id: trial_id.0,
            message,
        };
        trial.mark_failed(failure.to_string())?;
        self.cancels.remove(&trial_id);
        self.failure_streak += 1;
        error!(
            trial = %trial_id,
            error = %failure,
            streak = self.failure_streak,
            "trial failed"
        );
        let event = FailureEvent {
            trial_id,
            error: failure.to_string(),
            timestamp: Utc::now(),
        };
        self.events.emit(TuningEvent::TrialFailed {
            trial_id,
            error: event.error.clone(),
            timestamp: event.timestamp,
        });
        self.failures.push(event);
        Ok(())
    }

    /// The worker running `trial_id` crashed. Queue the trial for a fresh
    /// worker, or fail it once its restart budget is spent. Returns whether
    /// the trial was queued.
    pub fn requeue(&mut self, trial_id: TrialId, reason: &str) -> TuneResult<bool> {
        let max_restarts = self.config.max_worker_restarts;
        let trial = self.trial_mut(trial_id)?;
        if trial.status != TrialStatus::Running {
            return Ok(false);
        }
        if trial.restarts >= max_restarts {
            let message = format!("worker crashed {} times: {reason}", trial.restarts + 1);
            self.on_failure(trial_id, message)?;
            return Ok(false);
        }
        trial.restarts += 1;
        trial.transition(TrialStatus::Pending)?;
        trial.worker_id = None;
        let restarts = trial.restarts;
        self.cancels.remove(&trial_id);
        self.requeued.push_back(trial_id);
        warn!(trial = %trial_id, restarts, reason, "worker crashed; trial queued for re-attachment");
        Ok(true)
    }

    /// Stop a trial regardless of its rung standing, signalling its worker.
    pub fn force_stop(&mut self, trial_id: TrialId, reason: &str) -> TuneResult<()> {
        let trial = self.trial_mut(trial_id)?;
        if trial.is_terminal() {
            return Ok(());
        }
        let level = trial.resource_done;
        self.stop_trial(trial_id, level, reason)
    }

    fn stop_trial(&mut self, trial_id: TrialId, level: u32, reason: &str) -> TuneResult<()> {
        let trial = self.trial_mut(trial_id)?;
        trial.transition(TrialStatus::Stopped)?;
        trial.worker_id = None;
        if let Some(cancel) = self.cancels.remove(&trial_id) {
            cancel.cancel();
        }
        info!(trial = %trial_id, level, reason, "trial stopped");
        self.events.emit(TuningEvent::TrialStopped {
            trial_id,
            resource_level: level,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn complete_trial(&mut self, trial_id: TrialId) -> TuneResult<()> {
        let trial = self.trial_mut(trial_id)?;
        trial.transition(TrialStatus::Completed)?;
        trial.worker_id = None;
        let summary = trial.summary();
        self.cancels.remove(&trial_id);
        self.status.update_best(&summary);
        info!(
            trial = %trial_id,
            level = summary.resource_done,
            metric = ?summary.latest_metric,
            "trial completed"
        );
        self.events.emit(TuningEvent::TrialCompleted { summary });
        Ok(())
    }

    fn trial_mut(&mut self, trial_id: TrialId) -> Result<&mut Trial, TrialError> {
        self.trials
            .get_mut(&trial_id)
            .ok_or(TrialError::NotFound { trial_id: trial_id.0 })
    }
}

fn directive_for(status: TrialStatus) -> Directive {
    match status {
        TrialStatus::Running => Directive::Continue,
        TrialStatus::Completed => Directive::Finish,
        _ => Directive::Halt,
    }
}

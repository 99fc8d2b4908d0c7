//! Reporting sink: structured events for external monitoring.
//!
//! Events go out on a crossbeam channel supplied by the caller. Nothing in
//! the scheduler reads them back; the observation history is the only
//! internal record.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use xfer_types::TrialId;

use crate::config::SchedulerMode;
use crate::space::Configuration;
use crate::trial::{RunId, TrialSummary, TuningStatus};

/// Events emitted by the tuner for external consumption (logging, results
/// files, dashboards).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TuningEvent {
    RunStarted {
        run_id: RunId,
        workers: usize,
        mode: SchedulerMode,
    },
    TrialStarted {
        trial_id: TrialId,
        worker_id: usize,
        configuration: Configuration,
        resume_from: u32,
    },
    UnitReported {
        trial_id: TrialId,
        resource_level: u32,
        metric_value: f64,
        timestamp: DateTime<Utc>,
    },
    TrialPaused {
        trial_id: TrialId,
        resource_level: u32,
    },
    TrialPromoted {
        trial_id: TrialId,
        from_level: u32,
    },
    TrialStopped {
        trial_id: TrialId,
        resource_level: u32,
        reason: String,
    },
    TrialCompleted {
        summary: TrialSummary,
    },
    TrialFailed {
        trial_id: TrialId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    DeadlineReached {
        running: usize,
    },
    RunFinished {
        status: TuningStatus,
    },
}

/// Where events are sent. A disabled sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<TuningEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<TuningEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Unbounded sink plus the receiving end.
    pub fn channel() -> (Self, Receiver<TuningEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: TuningEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("event receiver dropped; event discarded");
            }
        }
    }
}

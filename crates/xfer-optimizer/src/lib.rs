//! # xfer-optimizer
//!
//! Asynchronous multi-fidelity tuning for transfer parameters.
//!
//! Provides config space definitions, searchers, a rung ladder for
//! successive-halving promotion and early stopping, per-trial checkpoints,
//! and a single-writer scheduler driven by an async dispatch loop over a
//! bounded pool of workers.

mod checkpoint;
mod config;
mod events;
mod rung;
mod scheduler;
mod search;
mod space;
mod trial;
mod tuner;
mod worker;

pub use checkpoint::{BlobStore, CheckpointRecord, CheckpointStore, FileBlobStore, MemoryBlobStore};
pub use config::{SchedulerMode, SearcherConfig, SearcherKind, TunerConfig};
pub use events::{EventSink, TuningEvent};
pub use rung::{rank, survivors, RecordOutcome, Rung, RungDecision, RungEntry, RungLadder};
pub use scheduler::Scheduler;
pub use search::{LocalSearcher, RandomSearcher, Searcher};
pub use space::{ConfigSpace, Configuration, ParameterDef, ParameterKind, ParameterValue};
pub use trial::{
    FailureEvent, ObjectiveDirection, Observation, RunId, RunState, Trial, TrialStatus,
    TrialSummary, TuningStatus,
};
pub use tuner::{Tuner, TuningSummary};
pub use worker::{
    run_trial, CancellationFlag, Directive, Objective, ObjectiveError, TrialLease, UnitOutcome,
    WorkerExit, WorkerReport,
};

pub use xfer_types::{TrialId, TuneError, TuneResult};

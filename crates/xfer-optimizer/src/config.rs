//! Run configuration and startup validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use xfer_types::{config_error, TuneResult};

use crate::rung::RungLadder;
use crate::search::{LocalSearcher, RandomSearcher, Searcher};
use crate::space::{ConfigSpace, ParameterValue};
use crate::trial::{ObjectiveDirection, RunId};

/// How rung decisions are applied to trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Asynchronous successive halving: a trial outside the cutoff of a rung
    /// is stopped on the spot.
    #[default]
    Stopping,
    /// Trials pause at every rung and are resumed later once they rank
    /// within the cutoff.
    Promotion,
    /// No rung decisions; every trial runs to the last level.
    Fifo,
}

/// Which built-in searcher proposes configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearcherKind {
    Random,
    #[default]
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearcherConfig {
    pub kind: SearcherKind,
    /// Distinct trials that must report before the searcher starts
    /// proposing on its own.
    pub num_init_random: usize,
    /// Probability of deferring to a random draw once past the initial phase.
    pub exploration_weight: f64,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            kind: SearcherKind::Local,
            num_init_random: 3,
            exploration_weight: 0.3,
        }
    }
}

/// Top-level configuration for a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub id: RunId,
    pub name: String,

    /// Parameters to search plus fixed fields.
    pub space: ConfigSpace,

    /// Number of concurrent worker slots.
    pub workers: usize,

    /// Ascending resource levels at which trials are compared. Empty until
    /// set; an empty ladder does not validate.
    pub rung_levels: Vec<u32>,

    /// Fraction of recorded peers allowed past a rung.
    pub promotion_quantile: f64,

    /// Peers (other than the trial itself) a rung needs before it can stop
    /// anyone.
    pub min_peers: usize,

    /// Name of the metric being optimized (reporting only).
    pub metric: String,
    pub direction: ObjectiveDirection,
    pub mode: SchedulerMode,
    pub searcher: SearcherConfig,

    /// Wall-clock budget after which no new trials are started.
    pub max_wallclock_secs: Option<u64>,

    /// How long in-flight trials may drain after the deadline before they
    /// are cancelled.
    pub drain_timeout_secs: Option<u64>,

    pub max_trials: Option<usize>,

    /// Searched values of configurations to try before anything else.
    pub points_to_evaluate: Vec<HashMap<String, ParameterValue>>,

    pub seed: u64,

    /// Times a trial is re-attached after its worker crashed.
    pub max_worker_restarts: u32,

    /// Consecutive failures after which effective concurrency halves.
    pub failure_backoff: usize,

    pub created_at: DateTime<Utc>,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self::new("tuning", ConfigSpace::new(), Vec::new())
    }
}

impl TunerConfig {
    pub fn new(name: &str, space: ConfigSpace, rung_levels: Vec<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            space,
            workers: 4,
            rung_levels,
            promotion_quantile: 1.0 / 3.0,
            min_peers: 1,
            metric: "avg_download_time".to_string(),
            direction: ObjectiveDirection::Minimize,
            mode: SchedulerMode::Stopping,
            searcher: SearcherConfig::default(),
            max_wallclock_secs: None,
            drain_timeout_secs: None,
            max_trials: None,
            points_to_evaluate: Vec::new(),
            seed: 0,
            max_worker_restarts: 2,
            failure_backoff: 3,
            created_at: Utc::now(),
        }
    }

    /// Rungs 1, 2, ..., `max_resource`.
    pub fn with_unit_rungs(mut self, max_resource: u32) -> Self {
        self.rung_levels = (1..=max_resource).collect();
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_promotion(mut self, quantile: f64, min_peers: usize) -> Self {
        self.promotion_quantile = quantile;
        self.min_peers = min_peers;
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_mode(mut self, mode: SchedulerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_searcher(mut self, searcher: SearcherConfig) -> Self {
        self.searcher = searcher;
        self
    }

    pub fn with_deadline(mut self, wallclock: Duration) -> Self {
        self.max_wallclock_secs = Some(wallclock.as_secs());
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = Some(n);
        self
    }

    pub fn with_point(mut self, point: HashMap<String, ParameterValue>) -> Self {
        self.points_to_evaluate.push(point);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_worker_restarts(mut self, n: u32) -> Self {
        self.max_worker_restarts = n;
        self
    }

    pub fn with_failure_backoff(mut self, n: usize) -> Self {
        self.failure_backoff = n;
        self
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> TuneResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn max_resource(&self) -> u32 {
        self.rung_levels.last().copied().unwrap_or(0)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.max_wallclock_secs.map(Duration::from_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }

    /// Reject configurations the run cannot start with. Every error here is
    /// fatal.
    pub fn validate(&self) -> TuneResult<()> {
        if self.workers == 0 {
            return Err(config_error!("workers must be at least 1"));
        }
        if self.rung_levels.is_empty() {
            return Err(config_error!("rung ladder must not be empty"));
        }
        if self.rung_levels[0] == 0 {
            return Err(config_error!("rung levels must be at least 1"));
        }
        if let Some(pair) = self.rung_levels.windows(2).find(|w| w[0] >= w[1]) {
            return Err(config_error!(
                "rung levels must be strictly ascending ({} then {})",
                pair[0],
                pair[1]
            ));
        }
        if !(self.promotion_quantile > 0.0 && self.promotion_quantile < 1.0) {
            return Err(config_error!(
                "promotion quantile must be in (0, 1), got {}",
                self.promotion_quantile
            ));
        }
        if !(0.0..=1.0).contains(&self.searcher.exploration_weight) {
            return Err(config_error!(
                "exploration weight must be in [0, 1], got {}",
                self.searcher.exploration_weight
            ));
        }
        if self.max_trials.is_none() && self.max_wallclock_secs.is_none() {
            return Err(config_error!(
                "a run needs max_trials or max_wallclock_secs to terminate"
            ));
        }
        if self.max_trials == Some(0) {
            return Err(config_error!("max_trials must be at least 1 when set"));
        }
        if self.failure_backoff == 0 {
            return Err(config_error!("failure_backoff must be at least 1"));
        }
        self.space
            .validate_definition()
            .map_err(|e| config_error!("invalid config space: {e}"))?;
        Ok(())
    }

    pub fn build_ladder(&self) -> RungLadder {
        RungLadder::new(
            self.rung_levels.clone(),
            self.promotion_quantile,
            self.min_peers,
            self.direction,
        )
    }

    pub fn build_searcher(&self) -> Box<dyn Searcher> {
        match self.searcher.kind {
            SearcherKind::Random => Box::new(RandomSearcher),
            SearcherKind::Local => Box::new(LocalSearcher::new(
                self.direction,
                self.searcher.num_init_random,
                self.searcher.exploration_weight,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_types::TuneError;

    fn config() -> TunerConfig {
        TunerConfig::new("t", ConfigSpace::new().add_int("x", 1, 10), vec![1, 2, 3])
            .with_max_trials(10)
    }

    #[test]
    fn defaults_are_valid() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.max_resource(), 3);
        assert_eq!(config.mode, SchedulerMode::Stopping);
        assert_eq!(config.min_peers, 1);
        assert!(config.deadline().is_none());
    }

    #[test]
    fn invalid_static_config_is_fatal() {
        let unbounded = TunerConfig {
            max_trials: None,
            ..config()
        };
        let cases = vec![
            unbounded,
            config().with_workers(0),
            TunerConfig::new("t", ConfigSpace::new(), vec![]),
            TunerConfig::new("t", ConfigSpace::new(), vec![0, 1]),
            TunerConfig::new("t", ConfigSpace::new(), vec![1, 3, 3]),
            config().with_promotion(0.0, 1),
            config().with_promotion(1.0, 1),
            config().with_promotion(f64::NAN, 1),
            config().with_max_trials(0),
            config().with_failure_backoff(0),
            TunerConfig::new("t", ConfigSpace::new().add_log_int("c", 0, 10), vec![1]),
            TunerConfig::new("t", ConfigSpace::new().add_int("x", 1, 2).fix("x", 1i64), vec![1]),
        ];
        for case in cases {
            let err = case.validate().unwrap_err();
            assert!(err.is_fatal(), "expected fatal error, got {err}");
            assert!(matches!(err, TuneError::Config(_)));
        }
    }

    #[test]
    fn builders_and_helpers() {
        let config = config()
            .with_unit_rungs(5)
            .with_deadline(Duration::from_secs(90))
            .with_drain_timeout(Duration::from_secs(5))
            .with_objective("throughput", ObjectiveDirection::Maximize)
            .with_seed(11);
        assert_eq!(config.rung_levels, vec![1, 2, 3, 4, 5]);
        assert_eq!(config.deadline(), Some(Duration::from_secs(90)));
        assert_eq!(config.drain_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.build_ladder().max_level(), 5);
        assert_eq!(config.build_searcher().name(), "local");

        let random = config.with_searcher(SearcherConfig {
            kind: SearcherKind::Random,
            ..SearcherConfig::default()
        });
        assert_eq!(random.build_searcher().name(), "random");
    }

    #[test]
    fn partial_json_takes_defaults() {
        let json = r#"{
            "name": "bench",
            "space": {
                "parameters": [
                    { "name": "max_concurrency", "kind": { "type": "int_range", "low": 10, "high": 1000 } }
                ],
                "fixed": { "n_downloads": 3 }
            },
            "rung_levels": [1, 2, 3],
            "mode": "promotion",
            "max_wallclock_secs": 600,
            "points_to_evaluate": [ { "max_concurrency": 10 } ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.json");
        std::fs::write(&path, json).unwrap();

        let config = TunerConfig::from_json_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, SchedulerMode::Promotion);
        assert_eq!(config.workers, 4);
        assert_eq!(config.searcher.num_init_random, 3);
        assert_eq!(config.points_to_evaluate.len(), 1);
        assert_eq!(
            config.points_to_evaluate[0].get("max_concurrency"),
            Some(&ParameterValue::Int(10))
        );
    }

    #[test]
    fn omitted_ladder_stays_unset() {
        let config: TunerConfig = serde_json::from_str(r#"{ "max_trials": 5 }"#).unwrap();
        assert!(config.rung_levels.is_empty());
        assert!(config.validate().unwrap_err().is_fatal());
    }
}

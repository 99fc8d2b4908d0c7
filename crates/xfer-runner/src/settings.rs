//! Runner settings: where the run file lives, where results go, and the
//! benchmark parameters read from the run file.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use xfer_optimizer::TunerConfig;

use crate::benchmark::{library_defaults, transfer_space};

pub const CONFIG_ENV: &str = "XFER_TUNE_CONFIG";
pub const RESULTS_ENV: &str = "XFER_TUNE_RESULTS";

/// Parameters of the simulated download benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    pub bucket: String,
    pub key: String,
    pub file_size_bytes: u64,
    /// Downloads per trial; one download is one resource unit.
    pub n_downloads: u32,
    /// Try the library's stock settings before anything else.
    pub include_baseline: bool,
    pub per_connection_bytes_per_sec: f64,
    pub link_bytes_per_sec: f64,
    pub request_latency_ms: f64,
    /// Relative jitter applied to every measurement.
    pub noise: f64,
    /// Probability that a download fails outright.
    pub failure_rate: f64,
    /// Real seconds slept per simulated second; 0 runs as fast as possible.
    pub time_scale: f64,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            bucket: "xfer-bench".to_string(),
            key: "payload-1g.bin".to_string(),
            file_size_bytes: 1_000_000_000,
            n_downloads: 3,
            include_baseline: true,
            per_connection_bytes_per_sec: 50e6,
            link_bytes_per_sec: 1.25e9,
            request_latency_ms: 30.0,
            noise: 0.05,
            failure_rate: 0.0,
            time_scale: 0.0,
        }
    }
}

/// Contents of a run file. Both sections are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFile {
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
    #[serde(default)]
    pub tuner: Option<TunerConfig>,
}

impl RunFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading run file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing run file {}", path.display()))
    }

    /// The tuner configuration to run. Without a `tuner` section the run is
    /// bounded by trial count and time. Missing parameters get the transfer
    /// space and a missing ladder gets one rung per download.
    pub fn tuner_config(&self) -> anyhow::Result<TunerConfig> {
        let n_downloads = self.benchmark.n_downloads;
        let mut config = match &self.tuner {
            Some(config) => config.clone(),
            None => TunerConfig::new("xfer-tune", transfer_space(&self.benchmark), Vec::new())
                .with_max_trials(60)
                .with_deadline(Duration::from_secs(600)),
        };
        if config.space.parameters.is_empty() {
            config.space = transfer_space(&self.benchmark);
        }
        if config.rung_levels.is_empty() {
            config = config.with_unit_rungs(n_downloads);
        }
        if config.max_resource() != n_downloads {
            bail!(
                "top rung {} does not match n_downloads = {}",
                config.max_resource(),
                n_downloads
            );
        }
        if self.benchmark.include_baseline && config.points_to_evaluate.is_empty() {
            config.points_to_evaluate.push(library_defaults());
        }
        Ok(config)
    }
}

/// Where to read the run file from and where to write results.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub config_path: Option<PathBuf>,
    pub results_dir: PathBuf,
}

impl RunnerSettings {
    /// First CLI argument, then `XFER_TUNE_CONFIG`; results under
    /// `XFER_TUNE_RESULTS` or the platform data dir.
    pub fn from_env() -> Self {
        Self::resolve(
            std::env::args().nth(1),
            std::env::var(CONFIG_ENV).ok(),
            std::env::var(RESULTS_ENV).ok(),
        )
    }

    fn resolve(arg: Option<String>, config_env: Option<String>, results_env: Option<String>) -> Self {
        let config_path = arg.or(config_env).map(PathBuf::from);
        let results_dir = results_env.map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("xfer-tune")
        });
        Self {
            config_path,
            results_dir,
        }
    }

    pub fn load_run_file(&self) -> anyhow::Result<RunFile> {
        match &self.config_path {
            Some(path) => RunFile::load(path),
            None => Ok(RunFile::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_optimizer::SchedulerMode;

    #[test]
    fn cli_argument_wins_over_environment() {
        let settings = RunnerSettings::resolve(
            Some("cli.json".into()),
            Some("env.json".into()),
            Some("/tmp/results".into()),
        );
        assert_eq!(settings.config_path, Some(PathBuf::from("cli.json")));
        assert_eq!(settings.results_dir, PathBuf::from("/tmp/results"));

        let settings = RunnerSettings::resolve(None, Some("env.json".into()), None);
        assert_eq!(settings.config_path, Some(PathBuf::from("env.json")));
        assert!(settings.results_dir.ends_with("xfer-tune"));
    }

    #[test]
    fn default_run_file_is_a_valid_run() {
        let run = RunFile::default();
        let config = run.tuner_config().unwrap();
        config.validate().unwrap();
        assert_eq!(config.rung_levels, vec![1, 2, 3]);
        assert_eq!(config.points_to_evaluate, vec![library_defaults()]);
        assert_eq!(config.space.parameters.len(), 4);
    }

    #[test]
    fn tuner_section_without_space_gets_the_transfer_space() {
        let json = r#"{
            "benchmark": { "n_downloads": 5, "include_baseline": false },
            "tuner": { "rung_levels": [1, 3, 5], "mode": "promotion", "max_trials": 12, "workers": 2 }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, json).unwrap();

        let run = RunFile::load(&path).unwrap();
        assert_eq!(run.benchmark.n_downloads, 5);
        let config = run.tuner_config().unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, SchedulerMode::Promotion);
        assert_eq!(config.rung_levels, vec![1, 3, 5]);
        assert!(config.points_to_evaluate.is_empty());
        assert!(config.space.parameter("max_io_queue").is_some());
        assert_eq!(config.space.fixed["n_downloads"].as_int(), Some(5));
    }

    #[test]
    fn tuner_section_without_ladder_gets_one_rung_per_download() {
        let run: RunFile = serde_json::from_str(
            r#"{ "benchmark": { "n_downloads": 5 }, "tuner": { "max_trials": 10 } }"#,
        )
        .unwrap();
        let config = run.tuner_config().unwrap();
        config.validate().unwrap();
        assert_eq!(config.rung_levels, vec![1, 2, 3, 4, 5]);
        assert_eq!(config.max_trials, Some(10));
        assert_eq!(config.space.fixed["n_downloads"].as_int(), Some(5));
    }

    #[test]
    fn ladder_must_end_at_n_downloads() {
        let run: RunFile = serde_json::from_str(
            r#"{ "benchmark": { "n_downloads": 5 }, "tuner": { "rung_levels": [1, 2], "max_trials": 10 } }"#,
        )
        .unwrap();
        let err = run.tuner_config().unwrap_err();
        assert!(err.to_string().contains("n_downloads = 5"));
    }

    #[test]
    fn unreadable_run_file_is_reported() {
        let settings = RunnerSettings {
            config_path: Some(PathBuf::from("/nonexistent/run.json")),
            results_dir: PathBuf::from("."),
        };
        let err = settings.load_run_file().unwrap_err();
        assert!(err.to_string().contains("reading run file"));
    }
}

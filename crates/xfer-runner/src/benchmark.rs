//! Simulated download benchmark and the transfer-parameter search space.
//!
//! The model is coarse on purpose: enough structure (parallel streams capped
//! by the link, per-request latency, write-call overhead, queue stalls,
//! worker start-up cost) for the tuner to have a real optimum to find.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::time::Duration;

use xfer_optimizer::{
    CheckpointRecord, ConfigSpace, Configuration, Objective, ObjectiveError, ParameterValue,
    UnitOutcome,
};

use crate::settings::BenchmarkSettings;

pub const MAX_CONCURRENCY: &str = "max_concurrency";
pub const MAX_IO_QUEUE: &str = "max_io_queue";
pub const IO_CHUNKSIZE: &str = "io_chunksize";
pub const MULTIPART_CHUNKSIZE: &str = "multipart_chunksize";

/// Cost of one write call on the local file.
const WRITE_CALL_SECS: f64 = 2e-6;
/// Cost of starting one transfer thread.
const THREAD_START_SECS: f64 = 5e-4;
/// Queue depth at which the writer stalls for a quarter of the transfer.
const QUEUE_HALF_DEPTH: f64 = 50.0;

/// Searched transfer parameters plus the benchmark's fixed fields.
pub fn transfer_space(settings: &BenchmarkSettings) -> ConfigSpace {
    ConfigSpace::new()
        .add_int(MAX_CONCURRENCY, 10, 1_000)
        .add_log_int(MAX_IO_QUEUE, 100, 100_000)
        .add_log_int(IO_CHUNKSIZE, 1_000, 1_000_000_000)
        .add_log_int(MULTIPART_CHUNKSIZE, 1_000_000, 10_000_000_000)
        .fix("bucket", settings.bucket.as_str())
        .fix("key", settings.key.as_str())
        .fix("n_downloads", i64::from(settings.n_downloads))
}

/// The transfer library's stock settings, worth measuring first.
pub fn library_defaults() -> HashMap<String, ParameterValue> {
    HashMap::from([
        (MAX_CONCURRENCY.to_string(), ParameterValue::Int(10)),
        (MAX_IO_QUEUE.to_string(), ParameterValue::Int(100)),
        (IO_CHUNKSIZE.to_string(), ParameterValue::Int(262_144)),
        (MULTIPART_CHUNKSIZE.to_string(), ParameterValue::Int(8_388_608)),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferParams {
    pub max_concurrency: i64,
    pub max_io_queue: i64,
    pub io_chunksize: i64,
    pub multipart_chunksize: i64,
}

impl TransferParams {
    pub fn from_config(config: &Configuration) -> Result<Self, ObjectiveError> {
        let get = |name: &str| {
            config
                .get_int(name)
                .filter(|v| *v > 0)
                .ok_or_else(|| ObjectiveError::Failed {
                    message: format!("configuration has no positive integer {name}"),
                })
        };
        Ok(Self {
            max_concurrency: get(MAX_CONCURRENCY)?,
            max_io_queue: get(MAX_IO_QUEUE)?,
            io_chunksize: get(IO_CHUNKSIZE)?,
            multipart_chunksize: get(MULTIPART_CHUNKSIZE)?,
        })
    }
}

/// Download-time objective: each resource unit is one simulated download,
/// and the reported metric is the running mean of all durations so far.
pub struct SimulatedDownload {
    settings: BenchmarkSettings,
    rng: Mutex<ChaCha8Rng>,
}

impl SimulatedDownload {
    pub fn new(settings: BenchmarkSettings, seed: u64) -> Self {
        Self {
            settings,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Noise-free duration of one download in seconds.
    pub fn expected_duration(&self, params: &TransferParams) -> f64 {
        let size = self.settings.file_size_bytes as f64;
        let parts = (size / params.multipart_chunksize as f64).ceil().max(1.0);
        let streams = (params.max_concurrency as f64).min(parts);

        let bandwidth = (streams * self.settings.per_connection_bytes_per_sec)
            .min(self.settings.link_bytes_per_sec);
        let transfer = size / bandwidth;
        let requests = (parts / streams).ceil() * self.settings.request_latency_ms / 1e3;
        let writes = (size / params.io_chunksize as f64).ceil() * WRITE_CALL_SECS;
        let queue_stall =
            transfer * 0.5 * QUEUE_HALF_DEPTH / (params.max_io_queue as f64 + QUEUE_HALF_DEPTH);
        let startup = params.max_concurrency as f64 * THREAD_START_SECS;

        transfer + requests + writes + queue_stall + startup
    }

    /// One noisy measurement, or a simulated transfer error.
    fn measure(&self, params: &TransferParams) -> Result<f64, ObjectiveError> {
        let mut rng = self.rng.lock();
        if rng.gen::<f64>() < self.settings.failure_rate {
            return Err(ObjectiveError::Failed {
                message: "simulated transfer error".to_string(),
            });
        }
        let jitter = 1.0 + self.settings.noise * rng.gen_range(-1.0..=1.0);
        Ok(self.expected_duration(params) * jitter)
    }
}

#[async_trait]
impl Objective for SimulatedDownload {
    async fn run_unit(
        &self,
        config: &Configuration,
        prior: Option<&CheckpointRecord>,
    ) -> Result<UnitOutcome, ObjectiveError> {
        let params = TransferParams::from_config(config)?;
        let duration = self.measure(&params)?;
        if self.settings.time_scale > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(duration * self.settings.time_scale)).await;
        }

        let downloads = prior.map_or(0, |p| p.resource_done) + 1;
        let cumulative = prior.map_or(0.0, |p| p.cumulative_metric) + duration;
        Ok(UnitOutcome {
            metric_value: cumulative / f64::from(downloads),
            cumulative_metric: cumulative,
            state: serde_json::json!({ "last_duration": duration }),
            done: downloads >= self.settings.n_downloads,
        })
    }

    fn name(&self) -> &str {
        "simulated-download"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_optimizer::TrialId;

    fn settings() -> BenchmarkSettings {
        BenchmarkSettings {
            noise: 0.0,
            ..BenchmarkSettings::default()
        }
    }

    fn params(concurrency: i64) -> TransferParams {
        TransferParams {
            max_concurrency: concurrency,
            max_io_queue: 100,
            io_chunksize: 262_144,
            multipart_chunksize: 8_388_608,
        }
    }

    fn baseline(settings: &BenchmarkSettings) -> Configuration {
        transfer_space(settings).resolve(&library_defaults()).unwrap()
    }

    #[test]
    fn baseline_is_inside_the_space() {
        let settings = settings();
        let config = baseline(&settings);
        assert_eq!(TransferParams::from_config(&config).unwrap(), params(10));
        assert_eq!(config.get_int("n_downloads"), Some(3));
    }

    #[test]
    fn more_streams_help_until_the_link_saturates() {
        let bench = SimulatedDownload::new(settings(), 0);
        let slow = bench.expected_duration(&params(10));
        let fast = bench.expected_duration(&params(100));
        let wasteful = bench.expected_duration(&params(1_000));
        assert!(fast < slow, "{fast} !< {slow}");
        // Past the part count extra threads only add start-up cost.
        assert!(wasteful > fast, "{wasteful} !> {fast}");
    }

    #[tokio::test]
    async fn reports_running_mean_and_finishes_after_n_downloads() {
        let settings = settings();
        let config = baseline(&settings);
        let bench = SimulatedDownload::new(settings, 1);
        let expected = bench.expected_duration(&params(10));

        let first = bench.run_unit(&config, None).await.unwrap();
        assert!((first.metric_value - expected).abs() < 1e-9);
        assert!(!first.done);

        let mut prior = CheckpointRecord::fresh(TrialId(0)).advance(&first);
        prior = prior.advance(&bench.run_unit(&config, Some(&prior)).await.unwrap());
        let last = bench.run_unit(&config, Some(&prior)).await.unwrap();
        assert!(last.done);
        assert!((last.cumulative_metric - 3.0 * expected).abs() < 1e-9);
        assert!((last.metric_value - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failures_and_bad_configs_surface_as_objective_errors() {
        let settings = settings();
        let config = baseline(&settings);
        let flaky = SimulatedDownload::new(
            BenchmarkSettings {
                failure_rate: 1.0,
                ..settings.clone()
            },
            2,
        );
        assert!(flaky.run_unit(&config, None).await.is_err());

        let bench = SimulatedDownload::new(settings, 2);
        let broken = config.with(MAX_CONCURRENCY, ParameterValue::from("many"));
        let err = bench.run_unit(&broken, None).await.unwrap_err();
        assert!(err.to_string().contains(MAX_CONCURRENCY));
    }
}

mod benchmark;
mod settings;

use anyhow::{anyhow, Context};
use crossbeam_channel::Receiver;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xfer_optimizer::{CheckpointStore, EventSink, FileBlobStore, Tuner, TuningEvent};

use crate::benchmark::SimulatedDownload;
use crate::settings::RunnerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = RunnerSettings::from_env();
    let run = settings.load_run_file()?;
    let config = run.tuner_config()?;
    config.validate().context("invalid tuner configuration")?;

    let results_dir = settings.results_dir.join(config.id.to_string());
    std::fs::create_dir_all(&results_dir)
        .with_context(|| format!("creating results dir {}", results_dir.display()))?;
    info!(results = %results_dir.display(), "writing results");

    let checkpoints =
        CheckpointStore::new(Arc::new(FileBlobStore::new(results_dir.join("checkpoints"))?));
    let (events, rx) = EventSink::channel();
    let writer = spawn_event_writer(rx, &results_dir.join("events.jsonl"))?;

    let objective = Arc::new(SimulatedDownload::new(run.benchmark.clone(), config.seed));
    let metric = config.metric.clone();
    let summary = Tuner::new(config, objective, checkpoints, events)?.run().await;

    // The tuner owned the last sender, so the writer sees the channel close.
    let written = writer
        .join()
        .map_err(|_| anyhow!("event writer thread panicked"))??;
    info!(events = written, "event log closed");

    let summary_path = results_dir.join("summary.json");
    let mut out = BufWriter::new(File::create(&summary_path)?);
    serde_json::to_writer_pretty(&mut out, &summary)?;
    out.flush()?;

    let status = &summary.status;
    println!(
        "trials: {} started, {} completed, {} stopped, {} failed",
        status.trials_started, status.trials_completed, status.trials_stopped, status.trials_failed
    );
    match summary.best() {
        Some(best) => {
            println!(
                "best trial {} after {} downloads: {} = {:.4}",
                best.trial_id,
                best.resource_done,
                metric,
                best.latest_metric.unwrap_or(f64::NAN)
            );
            println!("  {}", best.configuration);
        }
        None => println!("no trial reported a result"),
    }
    println!("summary written to {}", summary_path.display());
    Ok(())
}

/// Append every event as one JSON line until the sending side hangs up.
fn spawn_event_writer(
    rx: Receiver<TuningEvent>,
    path: &Path,
) -> anyhow::Result<JoinHandle<std::io::Result<usize>>> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("creating event log {}", path.display()))?,
    );
    Ok(std::thread::spawn(move || {
        let mut written = 0;
        for event in rx.iter() {
            serde_json::to_writer(&mut out, &event)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        out.flush()?;
        Ok(written)
    }))
}

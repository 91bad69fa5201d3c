use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info};

use stagehand::api::Client;
use stagehand::config::AppConfig;
use stagehand::push::{PushTransport, WsPushTransport};
use stagehand::results::batch_summary;
use stagehand::stage::SharedConditioning;
use stagehand::types::{FlatConfig, PipelineStageWire};
use stagehand::{RecordOutcome, Studio, StudioOutcome, TaskChannel, TaskEvent};

#[derive(Parser)]
#[command(name = "stagehand", version, about = "Dispatch and track generative-audio tasks")]
struct Cli {
    /// Overrides the configured worker URL.
    #[arg(long, global = true)]
    worker_url: Option<String>,

    /// Track by polling only.
    #[arg(long, global = true)]
    no_push: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch a single-shot generation from a TOML or JSON form.
    Generate { config: PathBuf },
    /// Dispatch a multi-stage pipeline from a JSON graph file.
    Pipeline { graph: PathBuf },
    /// Follow a task that is already running.
    Track { task_id: String },
}

#[derive(Deserialize)]
struct GraphFile {
    #[serde(default)]
    shared: SharedConditioning,
    stages: Vec<PipelineStageWire>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing()?;
    let cli = Cli::parse();
    info!("starting stagehand CLI");

    let config = AppConfig::load()?;
    let worker_url = cli.worker_url.clone().unwrap_or_else(|| config.worker_url().to_string());
    let client = Arc::new(Client::new(Some(&worker_url)).context("invalid worker URL")?);
    let push: Option<Arc<dyn PushTransport>> = if config.push_enabled() && !cli.no_push {
        Some(Arc::new(WsPushTransport::for_client(&client)?))
    } else {
        None
    };
    let channel = TaskChannel::new(client.clone(), push, config.channel_config());
    let mut studio = Studio::new(channel, client.clone(), client);

    if let Err(err) = run(&mut studio, cli.command).await {
        error!("{err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run(studio: &mut Studio, command: Command) -> Result<()> {
    match command {
        Command::Generate { config } => {
            studio.set_flat(read_flat(&config)?);
            let task_id = studio.dispatch_flat().await?;
            println!("Dispatched task {task_id}");
        }
        Command::Pipeline { graph } => {
            let file: GraphFile = read_json(&graph)?;
            studio
                .graph_mut()
                .replace_all_from_wire(file.shared, file.stages)
                .with_context(|| format!("invalid pipeline in {}", graph.display()))?;
            let task_id = studio.dispatch_pipeline().await?;
            println!("Dispatched {}-stage pipeline as task {task_id}", studio.graph().len());
        }
        Command::Track { task_id } => {
            studio.track(&task_id);
            println!("Tracking task {task_id}");
        }
    }

    let outcome = studio.drive_active(print_event).await?;
    report(studio, outcome)
}

fn print_event(event: &TaskEvent) {
    if let TaskEvent::Progress { progress, message } = event {
        let percent = (progress * 100.0).round() as i32;
        if message.is_empty() {
            println!("[{percent:>3}%]");
        } else {
            println!("[{percent:>3}%] {message}");
        }
    }
}

fn report(studio: &Studio, outcome: StudioOutcome) -> Result<()> {
    match outcome {
        StudioOutcome::Finished(RecordOutcome::Recorded { index }) => {
            let batch = studio
                .results()
                .batch(index)
                .ok_or_else(|| anyhow!("batch {index} missing after recording"))?;
            println!("{}", batch_summary(batch));
            for audio in &batch.audios {
                let tag = audio
                    .stage
                    .map(|stage| {
                        let last = if stage.is_final { ", final" } else { "" };
                        format!(" (stage {}{last})", stage.index)
                    })
                    .unwrap_or_default();
                println!("  {}{tag}", audio.id);
            }
            Ok(())
        }
        StudioOutcome::Finished(RecordOutcome::Duplicate { index }) => {
            println!("Task already recorded as batch {}", index + 1);
            Ok(())
        }
        StudioOutcome::Finished(RecordOutcome::Failed { message }) => {
            bail!("generation produced no usable result: {message}")
        }
        StudioOutcome::TaskFailed { reason, detail } => match detail {
            Some(detail) => bail!("task failed: {reason}\n{detail}"),
            None => bail!("task failed: {reason}"),
        },
        StudioOutcome::Stopped => bail!("tracking stopped before the task finished"),
    }
}

fn read_flat(path: &Path) -> Result<FlatConfig> {
    if path.extension().is_some_and(|ext| ext == "toml") {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()));
    }
    read_json(path)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn setup_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err: Box<dyn std::error::Error + Send + Sync>| {
            anyhow!("failed to initialise tracing: {err}")
        })?;
    Ok(())
}

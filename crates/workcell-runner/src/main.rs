use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use workcell_core::config::WorkcellConfig;
use workcell_executor::{
    ChannelDispatcher, Executor, ExecutorError, Job, SequentialInstanceIds,
};

#[derive(Parser, Debug)]
#[command(name = "workcell-runner", about = "Run jobs in isolated worker processes")]
struct Cli {
    /// Config file (falls back to WORKCELL_CONFIG, then ~/.workcell/workcell.toml).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit instances of one worker function and print their events.
    Run {
        /// Function name in the worker's function table.
        func: String,
        /// Positional argument as JSON; repeatable.
        #[arg(long = "arg", value_parser = parse_json)]
        args: Vec<Value>,
        /// Keyword argument as NAME=JSON; repeatable.
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,
        /// Job id shared by every submitted instance.
        #[arg(long, default_value = "cli-job")]
        job_id: String,
        /// How many instances to submit.
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        max_instances: Option<usize>,
        /// Give up waiting for events after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
        /// Terminate unfinished workers at teardown instead of waiting.
        #[arg(long)]
        no_wait: bool,
    },
}

fn parse_json(s: &str) -> Result<Value> {
    // Bare words are taken as strings so `--arg hello` works.
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}

fn parse_kwarg(s: &str) -> Result<(String, Value)> {
    let Some((name, raw)) = s.split_once('=') else {
        bail!("expected NAME=JSON, got {s:?}");
    };
    if name.is_empty() {
        bail!("keyword argument name is empty");
    }
    Ok((name.to_string(), parse_json(raw)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workcell_executor=info,workcell_runner=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > WORKCELL_CONFIG env > ~/.workcell/workcell.toml
    let config_path = cli.config.or_else(|| std::env::var("WORKCELL_CONFIG").ok());
    let config = WorkcellConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        WorkcellConfig::default()
    });

    match cli.command {
        Command::Run {
            func,
            args,
            kwargs,
            job_id,
            count,
            max_instances,
            timeout_secs,
            no_wait,
        } => {
            let mut job = Job::new(job_id, func).with_args(args);
            for (name, value) in kwargs {
                job = job.with_kwarg(name, value);
            }
            if let Some(max) = max_instances {
                job = job.with_max_instances(max);
            }
            run(config, job, count, Duration::from_secs(timeout_secs), !no_wait).await
        }
    }
}

async fn run(
    config: WorkcellConfig,
    job: Job,
    count: usize,
    timeout: Duration,
    wait: bool,
) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(count.max(1));
    let executor = Executor::new(
        config,
        Arc::new(SequentialInstanceIds::new()),
        Arc::new(ChannelDispatcher::new(tx)),
    );
    executor.setup().await.context("executor setup failed")?;

    let mut pending = HashSet::new();
    for _ in 0..count {
        match executor.submit_job(&job, chrono::Utc::now()).await {
            Ok(instance_id) => {
                pending.insert(instance_id);
            }
            Err(ExecutorError::MaxInstancesExceeded { instance_ids, .. }) => {
                warn!(job_id = %job.id, running = ?instance_ids, "submission rejected: instance cap reached");
            }
            Err(e) => warn!(job_id = %job.id, code = e.code(), "submission failed: {e}"),
        }
    }
    info!(accepted = pending.len(), requested = count, "jobs submitted");

    let deadline = tokio::time::Instant::now() + timeout;
    while !pending.is_empty() {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                pending.remove(&event.instance_id);
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(outstanding = pending.len(), "timed out waiting for events");
                break;
            }
        }
    }

    executor.teardown(wait).await.context("executor teardown failed")?;
    Ok(())
}

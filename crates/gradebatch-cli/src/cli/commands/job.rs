use super::super::args::{DirectArgs, JobArgs, WaitArgs};
use super::{exit_codes, load};
use gradebatch_core::config::{ExperimentConfig, ProviderSettings};
use gradebatch_core::controller::{BatchJobController, JobState, PollPolicy};
use gradebatch_core::errors::ConfigError;
use gradebatch_core::model::Provider;
use gradebatch_core::providers::{build_adapter, AdapterOptions};
use std::path::PathBuf;
use std::time::Duration;

struct Job {
    cfg: ExperimentConfig,
    controller: BatchJobController,
}

fn paths(args: &JobArgs) -> (PathBuf, PathBuf) {
    let requests = args
        .requests
        .clone()
        .unwrap_or_else(|| PathBuf::from("requests").join(format!("{}.jsonl", args.model)));
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("responses").join(format!("{}.jsonl", args.model)));
    (requests, output)
}

fn open_job(
    args: &JobArgs,
    provider_override: Option<Provider>,
    workers: Option<usize>,
    cache: Option<PathBuf>,
) -> anyhow::Result<Job> {
    let cfg = load(&args.config)?;
    let model = cfg.model(&args.model)?;
    let provider = provider_override.unwrap_or_else(|| model.provider());
    let (requests, output) = paths(args);

    let opts = AdapterOptions {
        workers: workers.unwrap_or_else(|| cfg.settings.workers()),
        cache_path: cache.or_else(|| cfg.settings.cache.as_ref().map(PathBuf::from)),
        output_path: output.clone(),
    };
    let settings = ProviderSettings::from_env();
    tracing::debug!(?settings, provider = provider.as_str(), "resolved provider");
    let adapter = build_adapter(provider, &settings, &opts)?;
    let controller = BatchJobController::new(adapter, &requests, &output)?;
    Ok(Job { cfg, controller })
}

async fn submit(mut job: Job) -> anyhow::Result<i32> {
    let c = &mut job.controller;
    if c.state() == JobState::NotStarted && !c.job().jsonl_path.exists() {
        return Err(ConfigError(format!(
            "request file not found: {}",
            c.job().jsonl_path.display()
        ))
        .into());
    }
    match c.send().await? {
        Some(id) => println!("{}", id),
        None => println!("{}", c.job().output_path.display()),
    }
    Ok(exit_codes::OK)
}

pub async fn cmd_send(args: JobArgs) -> anyhow::Result<i32> {
    submit(open_job(&args, None, None, None)?).await
}

pub async fn cmd_direct(args: DirectArgs) -> anyhow::Result<i32> {
    submit(open_job(&args.job, Some(Provider::Direct), args.workers, args.cache)?).await
}

pub async fn cmd_status(args: JobArgs) -> anyhow::Result<i32> {
    let mut job = open_job(&args, None, None, None)?;
    let report = job.controller.check_status().await?;
    let batch_id = job.controller.job().batch_id.clone().unwrap_or_else(|| "-".into());
    println!(
        "{}\t{}\t{}",
        report.state.as_str(),
        report.raw.as_deref().unwrap_or("-"),
        batch_id
    );
    Ok(exit_codes::OK)
}

pub async fn cmd_wait(args: WaitArgs) -> anyhow::Result<i32> {
    let mut job = open_job(&args.job, None, None, None)?;
    let settings = &job.cfg.settings;
    let policy = PollPolicy {
        interval: args
            .poll_interval
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or_else(|| settings.poll_interval()),
        expiry: match args.expiry_hours {
            Some(h) if h > 0.0 => Some(Duration::from_secs_f64(h * 3600.0)),
            Some(_) => None,
            None => settings.expiry(),
        },
    };

    match job.controller.wait_for_completion(&policy).await? {
        Some(path) => println!("{}", path.display()),
        None => {
            // terminal vendor failure still exits 0
            tracing::warn!(
                state = job.controller.state().as_str(),
                output = %job.controller.job().output_path.display(),
                "batch finished without results"
            );
        }
    }
    Ok(exit_codes::OK)
}

pub async fn cmd_download(args: JobArgs) -> anyhow::Result<i32> {
    let mut job = open_job(&args, None, None, None)?;
    match job.controller.download().await? {
        Some(path) => println!("{}", path.display()),
        None if job.controller.state().is_terminal() => eprintln!(
            "batch ended {} without results; run send to resubmit",
            job.controller.state().as_str()
        ),
        None => eprintln!("no results available yet"),
    }
    Ok(exit_codes::OK)
}

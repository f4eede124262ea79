use super::args::*;
use gradebatch_core::config::{load_config, load_questions, questions_path, ExperimentConfig};
use gradebatch_core::errors::ConfigError;
use gradebatch_core::model::Question;
use std::path::Path;

pub mod encode;
pub mod job;
pub mod reconcile;
pub mod retry;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const UNEXPECTED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Init(args) => cmd_init(args),
        Command::Encode(args) => encode::cmd_encode(args),
        Command::Grade(args) => encode::cmd_grade(args),
        Command::Send(args) => job::cmd_send(args).await,
        Command::Status(args) => job::cmd_status(args).await,
        Command::Wait(args) => job::cmd_wait(args).await,
        Command::Download(args) => job::cmd_download(args).await,
        Command::Direct(args) => job::cmd_direct(args).await,
        Command::Split(args) => retry::cmd_split(args),
        Command::Merge(args) => retry::cmd_merge(args),
        Command::Reconcile(args) => reconcile::cmd_reconcile(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
        return Ok(exit_codes::OK);
    }
    if let Some(parent) = args.config.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    gradebatch_core::config::write_sample_config(&args.config)?;
    eprintln!("created {}", args.config.display());
    Ok(exit_codes::OK)
}

pub(crate) fn load(args: &ConfigArgs) -> anyhow::Result<ExperimentConfig> {
    Ok(load_config(&args.config, args.strict)?)
}

/// Questions are part of the configuration: a missing file is fatal.
pub(crate) fn questions(
    cfg: &ExperimentConfig,
    override_path: Option<&Path>,
) -> anyhow::Result<Vec<Question>> {
    let path = questions_path(cfg, override_path).ok_or_else(|| {
        ConfigError("no question file: set settings.questions or pass --questions".into())
    })?;
    if !path.exists() {
        return Err(ConfigError(format!("question file not found: {}", path.display())).into());
    }
    load_questions(&path)
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gradebatch",
    version,
    about = "Multiple-choice LLM evaluation over vendor batch APIs"
)]
pub struct Cli {
    /// log filter, e.g. `info` or `gradebatch_core=debug`
    #[arg(long, global = true, env = "GRADEBATCH_LOG", default_value = "info")]
    pub log_level: String,

    /// emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a sample experiment config
    Init(InitArgs),
    /// Render request files for one model config
    Encode(EncodeArgs),
    /// Submit a request file (no-op while a batch is in flight)
    Send(JobArgs),
    /// Print the state of the batch behind an output path
    Status(JobArgs),
    /// Poll until the batch is terminal and download its results
    Wait(WaitArgs),
    /// Download results of a finished batch
    Download(JobArgs),
    /// Run a request file synchronously against an OpenAI-compatible endpoint
    Direct(DirectArgs),
    /// Build grading requests from an answer file
    Grade(GradeArgs),
    /// Extract requests that need a retry
    Split(SplitArgs),
    /// Merge response files; later files win
    Merge(MergeArgs),
    /// Join answers and grades into one CSV per model config
    Reconcile(ReconcileArgs),
    Version,
}

#[derive(Args, Clone)]
pub struct ConfigArgs {
    #[arg(long, default_value = "experiment.yaml")]
    pub config: PathBuf,

    /// reject unknown keys in the config file
    #[arg(long)]
    pub strict: bool,
}

#[derive(Args, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "experiment.yaml")]
    pub config: PathBuf,
}

#[derive(Args, Clone)]
pub struct EncodeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// model config id
    #[arg(long)]
    pub model: String,

    /// prompt ids to render (default: all)
    #[arg(long = "prompt")]
    pub prompts: Vec<String>,

    /// question file (JSON Lines); overrides settings.questions
    #[arg(long)]
    pub questions: Option<PathBuf>,

    #[arg(long, default_value = "requests")]
    pub out_dir: PathBuf,
}

#[derive(Args, Clone)]
pub struct JobArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// model config whose provider runs the batch
    #[arg(long)]
    pub model: String,

    /// request file (default: requests/<model>.jsonl)
    #[arg(long)]
    pub requests: Option<PathBuf>,

    /// normalized output (default: responses/<model>.jsonl)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct WaitArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// seconds between status checks; overrides settings.poll_interval_seconds
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// give up on unfinished batches older than this; overrides settings.expiry_hours
    #[arg(long)]
    pub expiry_hours: Option<f64>,
}

#[derive(Args, Clone)]
pub struct DirectArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// concurrent requests; overrides settings.workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// SQLite response cache; overrides settings.cache
    #[arg(long)]
    pub cache: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct GradeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// evaluator id from the config
    #[arg(long)]
    pub evaluator: String,

    /// normalized answer file, e.g. responses/mc01.jsonl
    #[arg(long)]
    pub answers: PathBuf,

    #[arg(long)]
    pub questions: Option<PathBuf>,

    /// grading request file (default: grading/<evaluator>/<answer file name>)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct SplitArgs {
    #[arg(long)]
    pub requests: PathBuf,

    #[arg(long)]
    pub responses: PathBuf,

    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Args, Clone)]
pub struct MergeArgs {
    #[arg(long)]
    pub out: PathBuf,

    /// response files, oldest first
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,
}

#[derive(Args, Clone)]
pub struct ReconcileArgs {
    #[arg(long)]
    pub answers: PathBuf,

    /// NAME=PATH, or PATH inside a directory named after the evaluator
    #[arg(long = "evaluator")]
    pub evaluators: Vec<String>,

    /// expected model config id (default: answer file stem)
    #[arg(long)]
    pub model_config: Option<String>,

    #[arg(long, default_value = "results")]
    pub out_dir: PathBuf,
}

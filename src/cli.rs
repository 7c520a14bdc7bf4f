use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mongo-eval",
    version,
    about = "Layered validation of generated MongoDB find/aggregate queries"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a single candidate document.
    Check(CheckArgs),
    /// Validate every example of a dataset and write a run manifest.
    Eval(EvalArgs),
    /// Recompute the seen/unseen gap report from a run manifest.
    Gap(GapArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[arg(long, conflicts_with = "document_path", required_unless_present = "document_path")]
    pub document: Option<String>,

    #[arg(long)]
    pub document_path: Option<PathBuf>,

    #[arg(long)]
    pub schema_path: PathBuf,

    #[arg(long)]
    pub allowlist_path: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Treat the input as raw generator output and pull the document out of it.
    #[arg(long, default_value_t = false)]
    pub extract: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
    #[arg(long)]
    pub examples_path: PathBuf,

    /// Predictions aligned line-by-line with the examples. Without it the
    /// examples' own outputs are validated.
    #[arg(long)]
    pub predictions_path: Option<PathBuf>,

    #[arg(long = "held-out-collection")]
    pub held_out_collections: Vec<String>,

    #[arg(long, default_value = "runs/eval_report.json")]
    pub report_path: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub gap_threshold: Option<f64>,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Use predictions verbatim instead of extracting the first JSON object.
    #[arg(long, default_value_t = false)]
    pub raw_predictions: bool,

    #[arg(long, default_value_t = false)]
    pub include_negative: bool,
}

#[derive(Args, Debug, Clone)]
pub struct GapArgs {
    #[arg(long, default_value = "runs/eval_report.json")]
    pub report_path: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub gap_threshold: Option<f64>,
}

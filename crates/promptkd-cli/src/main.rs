use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use config::load_config;

/// PromptKD: distil a prompt-tuned CLIP teacher into a lightweight student.
#[derive(Debug, Parser)]
#[command(name = "promptkd", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a student against a frozen prompt-tuned teacher.
    Train {
        /// Dataset directory holding classnames.txt and train/val safetensors.
        #[arg(long, short = 'd')]
        dataset: PathBuf,

        /// Directory the student checkpoints are written to.
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Teacher checkpoint; derived from the dataset name when omitted.
        #[arg(long)]
        teacher_checkpoint: Option<PathBuf>,

        /// Student weights to start from.
        #[arg(long)]
        init_weights: Option<PathBuf>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,

        /// fp16, fp32 or amp.
        #[arg(long)]
        precision: Option<String>,

        /// base2novel or cross.
        #[arg(long)]
        modal: Option<String>,

        /// Prefer GPU acceleration (CUDA/Metal).
        #[arg(long)]
        gpu: bool,
    },

    /// Evaluate a saved student on a dataset split.
    Eval {
        #[arg(long, short = 'd')]
        dataset: PathBuf,

        /// Directory a previous `train` run wrote to.
        #[arg(long)]
        model_dir: PathBuf,

        /// Load `model-ep<N>` instead of `model-best`.
        #[arg(long)]
        epoch: Option<usize>,

        /// val or test.
        #[arg(long, default_value = "test")]
        split: String,

        #[arg(long)]
        teacher_checkpoint: Option<PathBuf>,

        #[arg(long)]
        modal: Option<String>,

        #[arg(long)]
        gpu: bool,
    },

    /// Download a CLIP backbone into the local cache.
    Pull {
        /// Backbone name: ViT-B/16, ViT-B/32 or ViT-L/14.
        #[arg(long, short = 'b')]
        backbone: String,

        #[arg(long, default_value = "main")]
        revision: String,
    },

    /// List cached backbones.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    let cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Train {
            dataset,
            output,
            teacher_checkpoint,
            init_weights,
            epochs,
            batch_size,
            learning_rate,
            precision,
            modal,
            gpu,
        } => {
            let args = commands::train::TrainArgs {
                dataset,
                output,
                teacher_checkpoint,
                init_weights,
                epochs,
                batch_size,
                learning_rate,
                precision,
                modal,
                gpu,
            };
            commands::train::run(args, cfg).await?;
        }
        Commands::Eval { dataset, model_dir, epoch, split, teacher_checkpoint, modal, gpu } => {
            let args = commands::eval::EvalArgs { dataset, model_dir, epoch, split, teacher_checkpoint, modal, gpu };
            commands::eval::run(args, cfg).await?;
        }
        Commands::Pull { backbone, revision } => {
            commands::pull::run(&backbone, &revision, &cfg).await?;
        }
        Commands::List => {
            commands::list::run(&cfg)?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

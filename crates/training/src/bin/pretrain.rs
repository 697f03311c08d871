use std::path::PathBuf;

use clap::Parser;
use training::{CliOverrides, PretrainConfig, Trainer, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("pretraining failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Self-supervised signal pretraining CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to pretraining config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long,
        default_value = "",
        help = "Directory where run artifacts (checkpoints, logs) are stored"
    )]
    output_dir: String,

    #[arg(long, default_value = "", help = "Run name under the output directory")]
    exp_name: String,

    #[arg(
        long,
        default_value = "",
        help = "Checkpoint directory to restore model and optimizer state from"
    )]
    resume: String,

    #[arg(
        long,
        default_value_t = 0,
        help = "Epoch to start the loop at (pairs with --resume)"
    )]
    start_epoch: usize,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = PretrainConfig::from_path(&args.config)?;
    config.apply_overrides(&CliOverrides {
        output_dir: args.output_dir,
        exp_name: args.exp_name,
        resume: args.resume,
        start_epoch: args.start_epoch,
    });
    config.validate()?;

    Trainer::new(config)?.run()
}

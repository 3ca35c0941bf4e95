// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with `clap`.
// All business logic is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train`  — initialise a new model and train it
//   2. `resume` — continue from <out_dir>/ckpt.bin
//
// Ctrl-C sets a shared flag; the training loop finishes the
// current iteration and exits cleanly.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, TrainArgs};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::application::train_use_case::{TrainConfig, TrainUseCase};
use crate::domain::error::TrainError;

#[derive(Parser, Debug)]
#[command(
    name = "token-lm-trainer",
    version = "0.1.0",
    about = "Train an autoregressive token model on flat u16 token files."
)]
pub struct Cli {
    /// The subcommand to run (train or resume)
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the use case; this layer only routes.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)  => run_train(args, false),
            Commands::Resume(args) => run_train(args, true),
        }
    }
}

fn run_train(args: TrainArgs, resume: bool) -> Result<()> {
    let config: TrainConfig = args.into_config()?;
    tracing::info!(
        "Dataset '{}' under '{}', writing to '{}'",
        config.dataset,
        config.data_root,
        config.out_dir
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupt received; stopping after the current iteration");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;

    let use_case = TrainUseCase::new(config).with_stop_flag(stop);
    let result = if resume {
        use_case.train_resume()
    } else {
        use_case.train_from_scratch()
    };

    let model = result.inspect_err(|e| match e.downcast_ref::<TrainError>() {
        Some(err) if err.is_resource_not_found() => {
            tracing::error!("A required input is missing; check --data-root, --dataset and --out-dir")
        }
        Some(err) if err.is_fatal_config() => {
            tracing::error!("Configuration rejected before any training step ran")
        }
        _ => {}
    })?;

    println!("Training complete. Final architecture: {:?}", model.hyperparams());
    Ok(())
}

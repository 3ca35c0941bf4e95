// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// `train` and `resume` share one argument set. Values are
// layered:
//
//   built-in defaults  <  --config file.json  <  --flags
//
// Only flags the user actually passes override the layers
// below them, so every field is an Option here. Switches take
// an optional value: `--bias` sets it, `--bias false` clears a
// value the config file turned on.
//
// Reference: Rust Book §12 (Building a CLI Program)

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::train_use_case::TrainConfig;
use crate::data::sampler::SamplingLayout;
use crate::ml::device::Precision;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialise a new model and train it
    Train(TrainArgs),

    /// Continue training from the checkpoint in --out-dir
    Resume(TrainArgs),
}

#[derive(Args, Debug, Default)]
pub struct TrainArgs {
    /// JSON file with any subset of the training config
    #[arg(long)]
    pub config: Option<PathBuf>,

    // ── I/O ──────────────────────────────────────────────────────────────────
    /// Dataset name; files are read from <data-root>/<dataset>/
    #[arg(long)]
    pub dataset: Option<String>,
    #[arg(long)]
    pub data_root: Option<String>,
    /// Directory for ckpt.bin and metrics.csv
    #[arg(long)]
    pub out_dir: Option<String>,

    // ── System ───────────────────────────────────────────────────────────────
    #[arg(long)]
    pub device: Option<String>,
    /// fp32, bf16 or fp16
    #[arg(long)]
    pub dtype: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub compile: Option<bool>,

    // ── Data ─────────────────────────────────────────────────────────────────
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub block_size: Option<usize>,
    #[arg(long)]
    pub grad_accum: Option<usize>,
    /// Switch to fixed-width record sampling with this row width
    #[arg(long)]
    pub record_width: Option<usize>,
    #[arg(long)]
    pub train_records: Option<usize>,
    #[arg(long)]
    pub val_records: Option<usize>,

    // ── Optimizer and schedule ───────────────────────────────────────────────
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub min_lr: Option<f64>,
    #[arg(long)]
    pub warmup_iters: Option<u64>,
    #[arg(long)]
    pub lr_decay_iters: Option<u64>,
    /// Cosine-decay the learning rate after warmup
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub decay_lr: Option<bool>,
    /// Same as --decay-lr false
    #[arg(long, conflicts_with = "decay_lr")]
    pub no_decay_lr: bool,
    #[arg(long)]
    pub weight_decay: Option<f32>,
    #[arg(long)]
    pub beta1: Option<f32>,
    #[arg(long)]
    pub beta2: Option<f32>,
    /// 0 disables clipping
    #[arg(long)]
    pub grad_clip: Option<f32>,

    // ── Loop ─────────────────────────────────────────────────────────────────
    #[arg(long)]
    pub eval_interval: Option<u64>,
    #[arg(long)]
    pub eval_iters: Option<usize>,
    /// Evaluate once at step 0 and exit
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub eval_only: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub always_save_checkpoint: Option<bool>,
    #[arg(long)]
    pub log_interval: Option<u64>,
    #[arg(long)]
    pub max_iters: Option<u64>,
    #[arg(long)]
    pub seed_offset: Option<u64>,

    // ── Model ────────────────────────────────────────────────────────────────
    #[arg(long)]
    pub n_layer: Option<usize>,
    #[arg(long)]
    pub n_head: Option<usize>,
    #[arg(long)]
    pub n_embd: Option<usize>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub bias: Option<bool>,
    #[arg(long)]
    pub dropout: Option<f32>,
}

/// Assign `$field` from `$value` when the flag was given
macro_rules! override_field {
    ($cfg:ident . $field:ident, $value:expr) => {
        if let Some(v) = $value {
            $cfg.$field = v;
        }
    };
}

impl TrainArgs {
    /// Resolve defaults, the optional JSON file and the flags
    /// into one config. Validation happens in Layer 2.
    pub fn into_config(self) -> Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file '{}'", path.display()))?;
                serde_json::from_str::<TrainConfig>(&text)
                    .with_context(|| format!("malformed config file '{}'", path.display()))?
            }
            None => TrainConfig::default(),
        };

        override_field!(cfg.dataset, self.dataset);
        override_field!(cfg.data_root, self.data_root);
        override_field!(cfg.out_dir, self.out_dir);
        override_field!(cfg.device, self.device);
        if let Some(dtype) = &self.dtype {
            cfg.dtype = Precision::parse(dtype)?;
        }

        override_field!(cfg.batch_size, self.batch_size);
        override_field!(cfg.block_size, self.block_size);
        override_field!(cfg.gradient_accumulation_steps, self.grad_accum);
        cfg.layout = merge_layout(cfg.layout, self.record_width, self.train_records, self.val_records)?;

        override_field!(cfg.learning_rate, self.learning_rate);
        override_field!(cfg.min_lr, self.min_lr);
        override_field!(cfg.warmup_iters, self.warmup_iters);
        override_field!(cfg.lr_decay_iters, self.lr_decay_iters);
        override_field!(cfg.weight_decay, self.weight_decay);
        override_field!(cfg.beta1, self.beta1);
        override_field!(cfg.beta2, self.beta2);
        override_field!(cfg.grad_clip, self.grad_clip);

        override_field!(cfg.eval_interval, self.eval_interval);
        override_field!(cfg.eval_iters, self.eval_iters);
        override_field!(cfg.log_interval, self.log_interval);
        override_field!(cfg.max_iters, self.max_iters);
        override_field!(cfg.seed_offset, self.seed_offset);

        override_field!(cfg.n_layer, self.n_layer);
        override_field!(cfg.n_head, self.n_head);
        override_field!(cfg.n_embd, self.n_embd);
        override_field!(cfg.dropout, self.dropout);

        override_field!(cfg.compile, self.compile);
        override_field!(cfg.eval_only, self.eval_only);
        override_field!(cfg.always_save_checkpoint, self.always_save_checkpoint);
        override_field!(cfg.bias, self.bias);
        override_field!(cfg.decay_lr, self.decay_lr);
        if self.no_decay_lr {
            cfg.decay_lr = false;
        }

        Ok(cfg)
    }
}

/// Apply the record flags on top of the configured layout.
/// The counts fall back to the file's fixed-record values.
fn merge_layout(
    base:          SamplingLayout,
    record_width:  Option<usize>,
    train_records: Option<usize>,
    val_records:   Option<usize>,
) -> Result<SamplingLayout> {
    if record_width.is_none() && train_records.is_none() && val_records.is_none() {
        return Ok(base);
    }

    let (w0, t0, v0) = match base {
        SamplingLayout::FixedRecord { record_width, train_records, val_records } => {
            (Some(record_width), Some(train_records), Some(val_records))
        }
        SamplingLayout::Contiguous => (None, None, None),
    };

    match (record_width.or(w0), train_records.or(t0), val_records.or(v0)) {
        (Some(record_width), Some(train_records), Some(val_records)) => Ok(SamplingLayout::FixedRecord {
            record_width,
            train_records,
            val_records,
        }),
        _ => anyhow::bail!("--record-width, --train-records and --val-records must be given together"),
    }
}

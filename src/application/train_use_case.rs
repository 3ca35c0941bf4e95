// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Turns a TrainConfig into a running Trainer. This is the
// "Initializing" phase of a run:
//
//   Step 1: Validate the config              (fatal before compute)
//   Step 2: Resolve device and precision     (Layer 5 - ml)
//           and pick the burn backend:
//             cpu  → Autodiff<NdArray>
//             gpu  → Autodiff<Wgpu>, async batch uploads
//   Step 3: Open the corpus                  (Layer 4 - data)
//   Step 4: Build the batch sampler          (Layer 4 - data)
//   Step 5: Build or restore the model and
//           loop state                       (Layer 5 / Layer 6)
//   Step 6: Crop the context window          (Layer 5 - ml)
//   Step 7: Build the optimizer; on resume,
//           restore its moments for the
//           parameters the model has now     (Layer 5 - ml)
//   Step 8: Run the training loop            (Layer 5 - ml)
//
// Two entry points, both returning the trained model:
//   train_from_scratch() — needs meta.json for the vocab size
//   train_resume()       — needs <out_dir>/ckpt.bin
//
// Reference: Rust Book §13 (Iterators and Closures)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::data::{
    sampler::{BatchSampler, SamplingLayout},
    token_file::DatasetAccessor,
    vocab::VocabularyMeta,
};
use crate::domain::{
    error::{TrainError, TrainResult},
    hyperparams::ArchitectureHyperparams,
    state::TrainingState,
    traits::{LanguageModel, Optimizer},
};
use crate::infra::{
    checkpoint::{normalize_state_dict_keys, reconcile_hyperparams, CheckpointManager},
    metrics::MetricsLogger,
};
use crate::ml::{
    adamw::{AdamWSettings, BurnAdamW},
    device::{CpuBackend, Device, GpuBackend, Precision},
    model::GptLm,
    schedule::LrSchedule,
    trainer::{LoopSettings, TrainOutcome, Trainer, TrainerParts},
};
use burn::tensor::backend::AutodiffBackend;

/// Base of every RNG seed in a run; seed_offset is added to it
const BASE_SEED: u64 = 1337;

// ─── Training Configuration ──────────────────────────────────────────────────
// Every knob of a run. Serialisable so it can be read from a
// JSON file, overridden from the command line, and stored in
// each checkpoint as a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    // I/O
    pub dataset:   String,
    pub data_root: String,
    pub out_dir:   String,

    // System
    pub device:  String,
    pub dtype:   Precision,
    pub compile: bool,

    // Data
    pub batch_size:                  usize,
    pub block_size:                  usize,
    pub gradient_accumulation_steps: usize,
    pub layout:                      SamplingLayout,

    // Optimizer and schedule
    pub learning_rate:  f64,
    pub min_lr:         f64,
    pub warmup_iters:   u64,
    pub lr_decay_iters: u64,
    pub decay_lr:       bool,
    pub weight_decay:   f32,
    pub beta1:          f32,
    pub beta2:          f32,
    pub grad_clip:      f32,

    // Loop
    pub eval_interval:          u64,
    pub eval_iters:             usize,
    pub eval_only:              bool,
    pub always_save_checkpoint: bool,
    pub log_interval:           u64,
    pub max_iters:              u64,
    pub seed_offset:            u64,

    // Model
    pub n_layer: usize,
    pub n_head:  usize,
    pub n_embd:  usize,
    pub bias:    bool,
    pub dropout: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset:   "puzzle".to_string(),
            data_root: "data".to_string(),
            out_dir:   "out".to_string(),

            device:  "cpu".to_string(),
            dtype:   Precision::Fp32,
            compile: false,

            batch_size:                  12,
            block_size:                  64,
            gradient_accumulation_steps: 1,
            layout:                      SamplingLayout::Contiguous,

            learning_rate:  6e-4,
            min_lr:         6e-5,
            warmup_iters:   100,
            lr_decay_iters: 5000,
            decay_lr:       true,
            weight_decay:   0.1,
            beta1:          0.9,
            beta2:          0.95,
            grad_clip:      1.0,

            eval_interval:          250,
            eval_iters:             20,
            eval_only:              false,
            always_save_checkpoint: false,
            log_interval:           10,
            max_iters:              5000,
            seed_offset:            0,

            n_layer: 4,
            n_head:  4,
            n_embd:  128,
            bias:    false,
            dropout: 0.0,
        }
    }
}

impl TrainConfig {
    /// Reject every configuration error that can be detected
    /// before touching the disk.
    pub fn validate(&self) -> TrainResult<()> {
        if self.batch_size == 0 || self.block_size == 0 {
            return Err(TrainError::config("batch_size and block_size must be at least 1"));
        }
        self.loop_settings().validate()?;
        self.lr_schedule()?;
        self.requested_hyperparams(1).validate()?;

        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(TrainError::config(format!(
                "beta1 ({}) and beta2 ({}) must lie in [0, 1)",
                self.beta1, self.beta2
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(TrainError::config("weight_decay must be non-negative"));
        }

        if let SamplingLayout::FixedRecord { record_width, train_records, val_records } = &self.layout {
            if *record_width < 3 {
                return Err(TrainError::config(format!(
                    "record_width must be at least 3 (two tokens plus delimiter), got {record_width}"
                )));
            }
            if *train_records == 0 || *val_records == 0 {
                return Err(TrainError::config("train_records and val_records must be at least 1"));
            }
        }
        let window = self.layout.window_len(self.block_size);
        if window > self.block_size {
            return Err(TrainError::config(format!(
                "records yield sequences of {window} tokens, longer than block_size {}",
                self.block_size
            )));
        }

        Device::parse(&self.device)?;
        Ok(())
    }

    pub fn lr_schedule(&self) -> TrainResult<LrSchedule> {
        LrSchedule::new(
            self.learning_rate,
            self.warmup_iters,
            self.lr_decay_iters,
            self.min_lr,
            self.decay_lr,
        )
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            eval_interval:          self.eval_interval,
            eval_iters:             self.eval_iters,
            eval_only:              self.eval_only,
            always_save_checkpoint: self.always_save_checkpoint,
            log_interval:           self.log_interval,
            max_iters:              self.max_iters,
            grad_clip:              self.grad_clip,
            accumulation_steps:     self.gradient_accumulation_steps,
        }
    }

    /// The architecture this config asks for, given a vocabulary
    pub fn requested_hyperparams(&self, vocab_size: usize) -> ArchitectureHyperparams {
        ArchitectureHyperparams {
            layer_count:     self.n_layer,
            head_count:      self.n_head,
            embedding_width: self.n_embd,
            context_window:  self.block_size,
            use_bias:        self.bias,
            dropout_rate:    self.dropout,
            vocab_size,
        }
    }

    pub fn dataset_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_root).join(&self.dataset)
    }

    pub fn seed(&self) -> u64 {
        BASE_SEED.wrapping_add(self.seed_offset)
    }
}

/// Where the model and optimizer state come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFrom {
    Scratch,
    Resume,
}

/// A trained model on whichever backend the run used
#[derive(Debug)]
pub enum TrainedModel {
    Cpu(GptLm<CpuBackend>),
    Gpu(GptLm<GpuBackend>),
}

impl TrainedModel {
    pub fn hyperparams(&self) -> &ArchitectureHyperparams {
        match self {
            TrainedModel::Cpu(model) => model.hyperparams(),
            TrainedModel::Gpu(model) => model.hyperparams(),
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config:    TrainConfig,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config, stop_flag: None }
    }

    /// Stop cleanly at the next iteration boundary once `flag`
    /// is set (e.g. by a Ctrl-C handler).
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    /// Initialise a new model from the corpus vocabulary and train it
    pub fn train_from_scratch(&self) -> Result<TrainedModel> {
        self.execute(InitFrom::Scratch)
    }

    /// Continue training from `<out_dir>/ckpt.bin`
    pub fn train_resume(&self) -> Result<TrainedModel> {
        self.execute(InitFrom::Resume)
    }

    /// Validate, pick the backend for the configured device and run
    pub fn execute(&self, init: InitFrom) -> Result<TrainedModel> {
        // ── Step 1: Validate ──────────────────────────────────────────────────
        self.config.validate().context("invalid training configuration")?;

        // ── Step 2: Device and precision ─────────────────────────────────────
        let device = Device::parse(&self.config.device)?;
        match device {
            Device::Cpu => {
                let out = self.execute_on::<CpuBackend>(init, device, Default::default())?;
                Ok(TrainedModel::Cpu(out.model))
            }
            Device::Gpu(_) => {
                let out = self.execute_on::<GpuBackend>(init, device, device.wgpu_device())?;
                Ok(TrainedModel::Gpu(out.model))
            }
        }
    }

    /// Run the full pipeline on backend `B` and return the loop's
    /// end state
    pub fn execute_on<B: AutodiffBackend>(
        &self,
        init:           InitFrom,
        device:         Device,
        backend_device: B::Device,
    ) -> Result<TrainOutcome<GptLm<B>, BurnAdamW<B>>> {
        let cfg = &self.config;
        cfg.validate().context("invalid training configuration")?;

        if cfg.dtype != Precision::Fp32 {
            tracing::info!(
                "dtype {}: the {} backend computes in fp32; {}",
                cfg.dtype,
                device,
                if cfg.dtype.needs_loss_scaling() {
                    "dynamic loss scaling is still applied"
                } else {
                    "no loss scaling needed"
                }
            );
        }
        if cfg.compile {
            tracing::warn!("compile requested; the {} backend has no graph compiler, running eagerly", device);
        }

        // ── Step 3: Open the corpus ───────────────────────────────────────────
        let data_dir = cfg.dataset_dir();
        let data = DatasetAccessor::open(&data_dir)
            .with_context(|| format!("cannot open dataset '{}'", cfg.dataset))?;

        // ── Step 4: Batch sampler ─────────────────────────────────────────────
        let sampler = BatchSampler::new(cfg.layout.clone(), cfg.block_size, cfg.batch_size, cfg.seed());
        sampler.validate_against(&data)?;

        // ── Step 5: Model and loop state ──────────────────────────────────────
        let checkpoints = CheckpointManager::new(&cfg.out_dir);

        let (model, state, saved_optimizer) = match init {
            InitFrom::Scratch => {
                tracing::info!("Initializing a new model from scratch");
                let meta = VocabularyMeta::load(&data_dir)?
                    .ok_or_else(|| TrainError::VocabularyNotFound(data_dir.join("meta.json")))?;

                let model = GptLm::<B>::new(cfg.requested_hyperparams(meta.vocab_size), backend_device)?;
                (model, TrainingState::fresh(), None)
            }
            InitFrom::Resume => {
                tracing::info!("Resuming training from '{}'", cfg.out_dir);
                let ckpt = checkpoints.load().context("cannot resume")?;

                let requested = cfg.requested_hyperparams(ckpt.hyperparams.vocab_size);
                let hp = reconcile_hyperparams(&requested, &ckpt.hyperparams);
                if hp != requested {
                    tracing::info!("Architecture taken from checkpoint: {:?}", hp);
                }

                let mut model = GptLm::<B>::new(hp, backend_device)?;
                model
                    .load_state_dict(&normalize_state_dict_keys(ckpt.model_state))
                    .context("checkpoint weights do not fit the stored architecture")?;

                let state = TrainingState {
                    step_index:    ckpt.step_index,
                    best_val_loss: ckpt.best_val_loss,
                };
                (model, state, Some(ckpt.optimizer_state))
            }
        };
        let mut model = model.with_async_transfer(device.is_accelerator());

        // ── Step 6: Crop the context window ───────────────────────────────────
        let window = model.hyperparams().context_window;
        if cfg.block_size < window {
            model.crop_context_window(cfg.block_size)?;
        } else if cfg.block_size > window {
            return Err(TrainError::config(format!(
                "block_size {} exceeds the model's context window of {}",
                cfg.block_size, window
            ))
            .into());
        }

        // ── Step 7: Optimizer ─────────────────────────────────────────────────
        // moments are matched against the cropped parameters
        let mut optimizer = BurnAdamW::<B>::new(AdamWSettings {
            learning_rate: cfg.learning_rate,
            weight_decay:  cfg.weight_decay,
            beta1:         cfg.beta1,
            beta2:         cfg.beta2,
        });
        if let Some(saved) = saved_optimizer {
            optimizer
                .load_state_dict(saved, &model)
                .context("checkpoint optimizer state does not fit the model")?;
        }

        // ── Step 8: Train ─────────────────────────────────────────────────────
        let mut trainer = Trainer::new(TrainerParts {
            model,
            optimizer,
            state,
            data,
            sampler,
            schedule: cfg.lr_schedule()?,
            settings: cfg.loop_settings(),
            device,
            precision: cfg.dtype,
            checkpoints,
        })?
        .with_metrics(MetricsLogger::new(&PathBuf::from(&cfg.out_dir))?)
        .with_config_snapshot(serde_json::to_string(cfg)?);

        if let Some(flag) = &self.stop_flag {
            let flag = Arc::clone(flag);
            trainer = trainer.with_stop_condition(move || flag.load(Ordering::Relaxed));
        }

        let out = trainer.run()?;
        tracing::info!("{} optimizer updates applied in total", out.optimizer.step_count());
        Ok(out)
    }
}

// ============================================================
// Layer 5 — Training Loop
// ============================================================
// The orchestrator. One iteration of the loop is exactly one
// optimizer step:
//
//   ┌─▶ stop requested?                      → Terminated
//   │   lr ← schedule(step), set on every group
//   │   step % eval_interval == 0            → evaluate, maybe checkpoint
//   │   step == 0 && eval_only               → Terminated
//   │   repeat accumulation_steps times:
//   │       batch ← pending.join()
//   │       forward(batch)
//   │       pending ← transfer(next batch)    (overlaps with backward)
//   │       backward(loss · scale / accum)
//   │   grad_clip ≠ 0 → unscale, clip global norm
//   │   scaler.step(optimizer)  (skipped on inf/NaN under fp16)
//   │   scaler.update(), zero grads
//   │   MFU estimate once 5 local iterations have run
//   │   step += 1
//   └── step > max_iters                     → Terminated
//
// "Local" iterations are counted from the start of this process,
// so a resumed run also waits five iterations before trusting
// its timing.
//
// Checkpoint policy at each evaluation:
//   val < best || always_save_checkpoint
//       → best ← val
//       → persist, unless step == 0 (nothing trained yet)
//
// Reference: Kaplan et al. (2020) (tokens/iteration accounting)
//            Micikevicius et al. (2018) (loss scaling)

use std::time::Instant;

use crate::data::sampler::BatchSampler;
use crate::data::token_file::DatasetAccessor;
use crate::domain::error::{TrainError, TrainResult};
use crate::domain::state::{Split, TrainingState};
use crate::domain::traits::{LanguageModel, Optimizer};
use crate::infra::checkpoint::{Checkpoint, CheckpointManager};
use crate::infra::metrics::{EvalMetrics, MetricsLogger};
use crate::ml::device::{Device, Precision};
use crate::ml::evaluator::estimate_loss;
use crate::ml::scaler::{LossScaler, StepOutcome};
use crate::ml::schedule::LrSchedule;

/// MFU is only measured once this many iterations have run in
/// the current process; the first few include warm-up costs.
const MFU_WARMUP_ITERS: u64 = 5;

// ─── Settings ─────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub eval_interval:          u64,
    pub eval_iters:             usize,
    pub eval_only:              bool,
    pub always_save_checkpoint: bool,
    pub log_interval:           u64,
    pub max_iters:              u64,
    /// 0 disables clipping
    pub grad_clip:              f32,
    pub accumulation_steps:     usize,
}

impl LoopSettings {
    pub fn validate(&self) -> TrainResult<()> {
        if self.eval_interval == 0 {
            return Err(TrainError::config("eval_interval must be at least 1"));
        }
        if self.eval_iters == 0 {
            return Err(TrainError::config("eval_iters must be at least 1"));
        }
        if self.log_interval == 0 {
            return Err(TrainError::config("log_interval must be at least 1"));
        }
        if self.accumulation_steps == 0 {
            return Err(TrainError::config("gradient_accumulation_steps must be at least 1"));
        }
        if !self.grad_clip.is_finite() || self.grad_clip < 0.0 {
            return Err(TrainError::config(format!(
                "grad_clip must be a finite non-negative number, got {}",
                self.grad_clip
            )));
        }
        Ok(())
    }
}

/// Everything the loop needs, assembled during initialisation
pub struct TrainerParts<M, O> {
    pub model:       M,
    pub optimizer:   O,
    pub state:       TrainingState,
    pub data:        DatasetAccessor,
    pub sampler:     BatchSampler,
    pub schedule:    LrSchedule,
    pub settings:    LoopSettings,
    pub device:      Device,
    pub precision:   Precision,
    pub checkpoints: CheckpointManager,
}

/// What the loop hands back when it terminates
pub struct TrainOutcome<M, O> {
    pub model:               M,
    pub optimizer:           O,
    pub state:               TrainingState,
    pub checkpoints_written: usize,
    /// Optimizer steps dropped because of fp16 overflow
    pub skipped_steps:       u64,
    pub running_mfu:         Option<f64>,
    pub loss_scale:          f32,
}

// ─── Trainer ──────────────────────────────────────────────────────────────────
pub struct Trainer<M: LanguageModel, O: Optimizer<M>> {
    model:           M,
    optimizer:       O,
    state:           TrainingState,
    data:            DatasetAccessor,
    sampler:         BatchSampler,
    schedule:        LrSchedule,
    settings:        LoopSettings,
    device:          Device,
    scaler:          LossScaler,
    checkpoints:     CheckpointManager,
    metrics:         Option<MetricsLogger>,
    config_snapshot: String,
    stop:            Option<Box<dyn Fn() -> bool>>,
    saved:           usize,
}

impl<M: LanguageModel, O: Optimizer<M>> Trainer<M, O> {
    pub fn new(parts: TrainerParts<M, O>) -> TrainResult<Self> {
        parts.settings.validate()?;
        parts.schedule.validate()?;

        let scaler = LossScaler::new(parts.precision.needs_loss_scaling());
        Ok(Self {
            model:           parts.model,
            optimizer:       parts.optimizer,
            state:           parts.state,
            data:            parts.data,
            sampler:         parts.sampler,
            schedule:        parts.schedule,
            settings:        parts.settings,
            device:          parts.device,
            scaler,
            checkpoints:     parts.checkpoints,
            metrics:         None,
            config_snapshot: String::new(),
            stop:            None,
            saved:           0,
        })
    }

    /// Append one CSV row per evaluation
    pub fn with_metrics(mut self, metrics: MetricsLogger) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// JSON of the run's config, stored in every checkpoint
    pub fn with_config_snapshot(mut self, snapshot: String) -> Self {
        self.config_snapshot = snapshot;
        self
    }

    /// Checked once per iteration boundary; returning true ends
    /// the run cleanly.
    pub fn with_stop_condition<F>(mut self, stop: F) -> Self
    where
        F: Fn() -> bool + 'static,
    {
        self.stop = Some(Box::new(stop));
        self
    }

    /// Run until max_iters, eval-only termination, or a stop
    /// request.
    pub fn run(mut self) -> TrainResult<TrainOutcome<M, O>> {
        let s = self.settings.clone();
        let tokens_per_iter = s.accumulation_steps * self.sampler.batch_size() * self.sampler.window_len();
        tracing::info!(
            "Tokens per iteration: {} ({} accum × {} batch × {} window)",
            tokens_per_iter,
            s.accumulation_steps,
            self.sampler.batch_size(),
            self.sampler.window_len()
        );
        tracing::info!(
            "Training from step {} to {} on {} (dynamic loss scaling {})",
            self.state.step_index,
            s.max_iters,
            self.device,
            if self.scaler.is_enabled() { "on" } else { "off" },
        );

        // first batch is in flight before the loop starts
        let mut pending = self.model.transfer(self.sampler.sample(&self.data, Split::Train)?);

        let mut t0          = Instant::now();
        let mut local_iter  = 0u64;
        let mut running_mfu = None::<f64>;
        let mut skipped     = 0u64;

        loop {
            if self.stop.as_ref().is_some_and(|stop| stop()) {
                tracing::info!("Stop requested at step {}", self.state.step_index);
                break;
            }

            let step = self.state.step_index;
            let lr   = self.schedule.lr(step)?;
            self.optimizer.set_learning_rate(lr);

            if step % s.eval_interval == 0 {
                self.evaluate_and_checkpoint(lr)?;
            }
            if step == 0 && s.eval_only {
                tracing::info!("eval_only set; stopping after the initial evaluation");
                break;
            }

            // ── Forward / backward with gradient accumulation ────────────────
            let mut last_loss = 0.0f32;
            for _ in 0..s.accumulation_steps {
                if !pending.is_ready() {
                    tracing::trace!("waiting for batch transfer at step {}", step);
                }
                let batch = pending.join()?;
                last_loss = self.model.forward(&batch)?;

                // next batch transfers while backward runs
                pending = self.model.transfer(self.sampler.sample(&self.data, Split::Train)?);

                let multiplier = self.scaler.scale_factor() / s.accumulation_steps as f32;
                self.model.backward(multiplier)?;
            }

            // ── Clip, step, reset ────────────────────────────────────────────
            if s.grad_clip != 0.0 {
                self.scaler.unscale(&mut self.model)?;
                self.model.clip_grad_norm(s.grad_clip)?;
            }

            match self.scaler.step(&mut self.optimizer, &mut self.model)? {
                StepOutcome::Applied => {}
                StepOutcome::SkippedNonFinite { scale } => {
                    skipped += 1;
                    tracing::warn!(
                        "Numeric instability at step {}: non-finite gradients under loss scale {}; step skipped",
                        step,
                        scale
                    );
                }
            }
            self.scaler.update();
            self.optimizer.zero_gradients(&mut self.model);

            // ── Timing and utilization ───────────────────────────────────────
            let dt = t0.elapsed().as_secs_f64();
            t0 = Instant::now();

            if local_iter >= MFU_WARMUP_ITERS {
                let mfu = self.model.estimate_utilization(tokens_per_iter, dt);
                running_mfu = Some(match running_mfu {
                    Some(prev) => 0.9 * prev + 0.1 * mfu,
                    None => mfu,
                });
            }

            if step % s.log_interval == 0 {
                tracing::info!(
                    "iter {}: loss {:.4}, time {:.2}ms, mfu {:.2}%",
                    step,
                    last_loss,
                    dt * 1000.0,
                    running_mfu.unwrap_or(0.0) * 100.0
                );
            }

            self.state.step_index += 1;
            local_iter += 1;

            if self.state.step_index > s.max_iters {
                break;
            }
        }

        tracing::info!(
            "Training finished at step {} (best val loss {:.4}, {} checkpoints written)",
            self.state.step_index,
            self.state.best_val_loss,
            self.saved
        );

        Ok(TrainOutcome {
            model:               self.model,
            optimizer:           self.optimizer,
            state:               self.state,
            checkpoints_written: self.saved,
            skipped_steps:       skipped,
            running_mfu,
            loss_scale:          self.scaler.scale_factor(),
        })
    }

    fn evaluate_and_checkpoint(&mut self, lr: f64) -> TrainResult<()> {
        let step   = self.state.step_index;
        let losses = estimate_loss(
            &mut self.model,
            &mut self.sampler,
            &self.data,
            self.settings.eval_iters,
        )?;
        tracing::info!(
            "step {}: train loss {:.4}, val loss {:.4}",
            step,
            losses.train,
            losses.val
        );

        let mut persisted = false;
        if losses.val < self.state.best_val_loss || self.settings.always_save_checkpoint {
            self.state.best_val_loss = losses.val;
            if step > 0 {
                let ckpt = Checkpoint {
                    model_state:     self.model.state_dict()?,
                    optimizer_state: self.optimizer.state_dict(&self.model)?,
                    hyperparams:     self.model.hyperparams().clone(),
                    step_index:      step,
                    best_val_loss:   self.state.best_val_loss,
                    config_snapshot: self.config_snapshot.clone(),
                };
                self.checkpoints.save(&ckpt)?;
                self.saved += 1;
                persisted = true;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.log(&EvalMetrics {
                step,
                train_loss: losses.train,
                val_loss:   losses.val,
                lr,
                checkpoint_saved: persisted,
            })?;
        }
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sampler::SamplingLayout;
    use crate::data::token_file::InMemoryTokens;
    use crate::infra::checkpoint::load_checkpoint;
    use crate::ml::testing::{CountingOptimizer, ScriptedModel};
    use std::cell::Cell;
    use std::rc::Rc;

    fn settings() -> LoopSettings {
        LoopSettings {
            eval_interval:          1000,
            eval_iters:             1,
            eval_only:              false,
            always_save_checkpoint: false,
            log_interval:           1,
            max_iters:              3,
            grad_clip:              0.0,
            accumulation_steps:     1,
        }
    }

    fn schedule() -> LrSchedule {
        LrSchedule::new(6e-4, 2, 10, 6e-5, true).unwrap()
    }

    fn trainer(
        model:    ScriptedModel,
        state:    TrainingState,
        settings: LoopSettings,
        precision: Precision,
        out_dir:  &std::path::Path,
    ) -> Trainer<ScriptedModel, CountingOptimizer> {
        let data = DatasetAccessor::from_sources(
            Box::new(InMemoryTokens((0..64).map(|t| t % 16).collect())),
            Box::new(InMemoryTokens((0..64).map(|t| t % 16).collect())),
        );
        Trainer::new(TrainerParts {
            model,
            optimizer: CountingOptimizer::new(),
            state,
            data,
            sampler: BatchSampler::new(SamplingLayout::Contiguous, 4, 2, 1337),
            schedule: schedule(),
            settings,
            device: Device::Cpu,
            precision,
            checkpoints: CheckpointManager::new(out_dir),
        })
        .unwrap()
    }

    #[test]
    fn test_runs_max_iters_plus_one_steps() {
        let dir = tempfile::tempdir().unwrap();
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), settings(), Precision::Fp32, dir.path())
            .run()
            .unwrap();

        assert_eq!(out.optimizer.steps, 4);
        assert_eq!(out.state.step_index, 4);
        // only step 0 is an eval step with eval_interval = 1000
        assert_eq!(out.model.eval_forwards, 2);
    }

    #[test]
    fn test_learning_rate_follows_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), settings(), Precision::Fp32, dir.path())
            .run()
            .unwrap();

        let s = schedule();
        let expected: Vec<f64> = (0..4).map(|i| s.lr(i).unwrap()).collect();
        assert_eq!(out.optimizer.lrs, expected);
        assert!(out.optimizer.param_groups().iter().all(|g| g.learning_rate == expected[3]));
    }

    #[test]
    fn test_gradient_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoopSettings { accumulation_steps: 4, max_iters: 1, ..settings() };
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), cfg, Precision::Fp32, dir.path())
            .run()
            .unwrap();

        assert_eq!(out.model.train_forwards, 8);
        assert_eq!(out.optimizer.steps, 2);
        assert!(out.model.backward_multipliers.iter().all(|&m| m == 0.25));
    }

    #[test]
    fn test_eval_only_stops_after_first_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoopSettings { eval_only: true, always_save_checkpoint: true, ..settings() };
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), cfg, Precision::Fp32, dir.path())
            .run()
            .unwrap();

        assert_eq!(out.optimizer.steps, 0);
        assert_eq!(out.state.step_index, 0);
        assert_eq!(out.model.eval_forwards, 2);
        assert_eq!(out.checkpoints_written, 0);
        assert!(!dir.path().join("ckpt.bin").exists());
    }

    #[test]
    fn test_checkpoint_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        // (train, val) per evaluation at steps 0, 1, 2, 3
        let model = ScriptedModel::with_eval_losses(&[5.0, 5.0, 4.0, 3.0, 4.0, 4.0, 2.0, 2.0]);
        let cfg   = LoopSettings { eval_interval: 1, ..settings() };
        let out   = trainer(model, TrainingState::fresh(), cfg, Precision::Fp32, dir.path())
            .with_metrics(MetricsLogger::new(dir.path()).unwrap())
            .run()
            .unwrap();

        // step 0 improves on 1e9 but is never persisted; step 2 is worse
        assert_eq!(out.checkpoints_written, 2);
        assert_eq!(out.state.best_val_loss, 2.0);

        let ckpt = load_checkpoint(&dir.path().join("ckpt.bin")).unwrap();
        assert_eq!(ckpt.step_index, 3);
        assert_eq!(ckpt.best_val_loss, 2.0);

        let csv = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        let saved: Vec<&str> = csv.lines().skip(1).map(|l| l.rsplit(',').next().unwrap()).collect();
        assert_eq!(saved, vec!["false", "true", "false", "true"]);
    }

    #[test]
    fn test_always_save_tracks_latest_val_loss() {
        let dir   = tempfile::tempdir().unwrap();
        let model = ScriptedModel::with_eval_losses(&[5.0, 5.0, 6.0, 6.0, 7.0, 7.0]);
        let cfg   = LoopSettings { eval_interval: 1, always_save_checkpoint: true, max_iters: 2, ..settings() };
        let out   = trainer(model, TrainingState::fresh(), cfg, Precision::Fp32, dir.path()).run().unwrap();

        assert_eq!(out.checkpoints_written, 2);
        assert_eq!(out.state.best_val_loss, 7.0);
    }

    #[test]
    fn test_resume_starts_at_stored_step() {
        let dir   = tempfile::tempdir().unwrap();
        let state = TrainingState { step_index: 7, best_val_loss: 0.5 };
        let cfg   = LoopSettings { max_iters: 8, ..settings() };
        let out   = trainer(ScriptedModel::with_eval_losses(&[1.0]), state, cfg, Precision::Fp32, dir.path())
            .run()
            .unwrap();

        let s = schedule();
        assert_eq!(out.optimizer.lrs, vec![s.lr(7).unwrap(), s.lr(8).unwrap()]);
        assert_eq!(out.state.step_index, 9);
        // neither step 7 nor 8 is a multiple of the eval interval
        assert_eq!(out.model.eval_forwards, 0);
        assert_eq!(out.state.best_val_loss, 0.5);
    }

    #[test]
    fn test_fp16_overflow_is_skipped_not_fatal() {
        let dir       = tempfile::tempdir().unwrap();
        let mut model = ScriptedModel::with_eval_losses(&[1.0]);
        model.grad_value = f32::INFINITY;

        let out = trainer(model, TrainingState::fresh(), settings(), Precision::Fp16, dir.path())
            .run()
            .unwrap();

        assert_eq!(out.optimizer.steps, 0);
        assert_eq!(out.skipped_steps, 4);
        assert_eq!(out.loss_scale, 65536.0 / 16.0);
        assert_eq!(out.state.step_index, 4);
    }

    #[test]
    fn test_fp16_scales_loss_before_backward() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoopSettings { accumulation_steps: 2, max_iters: 0, ..settings() };
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), cfg, Precision::Fp16, dir.path())
            .run()
            .unwrap();

        assert!(out.model.backward_multipliers.iter().all(|&m| m == 32768.0));
        assert_eq!(out.optimizer.steps, 1);
    }

    #[test]
    fn test_gradient_clipping() {
        let dir       = tempfile::tempdir().unwrap();
        let mut model = ScriptedModel::with_eval_losses(&[1.0]);
        model.grad_value = 10.0;
        let cfg = LoopSettings { grad_clip: 1.0, ..settings() };

        let out = trainer(model, TrainingState::fresh(), cfg, Precision::Fp16, dir.path()).run().unwrap();
        assert!(out.optimizer.grad_norms.iter().all(|&n| n <= 1.0 + 1e-4));

        // without clipping the unscaled norm reaches the optimizer
        let dir       = tempfile::tempdir().unwrap();
        let mut model = ScriptedModel::with_eval_losses(&[1.0]);
        model.grad_value = 10.0;
        let out = trainer(model, TrainingState::fresh(), settings(), Precision::Fp16, dir.path()).run().unwrap();
        // six gradient entries of 10 each
        let expected = (6.0f32 * 100.0).sqrt();
        assert!(out.optimizer.grad_norms.iter().all(|&n| (n - expected).abs() < 1e-2));
    }

    #[test]
    fn test_async_transfers_arrive_in_sampling_order() {
        let cfg = LoopSettings { accumulation_steps: 2, ..settings() };

        let dir  = tempfile::tempdir().unwrap();
        let sync = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), cfg.clone(), Precision::Fp32, dir.path())
            .run()
            .unwrap();

        let dir       = tempfile::tempdir().unwrap();
        let mut model = ScriptedModel::with_eval_losses(&[1.0]);
        model.async_transfer = true;
        let overlapped = trainer(model, TrainingState::fresh(), cfg, Precision::Fp32, dir.path())
            .run()
            .unwrap();

        assert_eq!(overlapped.model.train_batches.len(), 8);
        assert_eq!(overlapped.model.train_batches, sync.model.train_batches);
        assert_eq!(overlapped.optimizer.steps, 4);
    }

    #[test]
    fn test_stop_condition_checked_each_iteration() {
        let dir    = tempfile::tempdir().unwrap();
        let checks = Rc::new(Cell::new(0u32));
        let seen   = Rc::clone(&checks);
        let cfg    = LoopSettings { max_iters: 100, ..settings() };

        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), cfg, Precision::Fp32, dir.path())
            .with_stop_condition(move || {
                seen.set(seen.get() + 1);
                seen.get() > 2
            })
            .run()
            .unwrap();

        assert_eq!(out.optimizer.steps, 2);
        assert_eq!(checks.get(), 3);
    }

    #[test]
    fn test_utilization_waits_for_five_local_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), settings(), Precision::Fp32, dir.path())
            .run()
            .unwrap();
        assert_eq!(out.running_mfu, None);

        let dir = tempfile::tempdir().unwrap();
        let cfg = LoopSettings { max_iters: 9, ..settings() };
        let out = trainer(ScriptedModel::with_eval_losses(&[1.0]), TrainingState::fresh(), cfg, Precision::Fp32, dir.path())
            .run()
            .unwrap();
        // the scripted model always reports 0.5, so the EMA stays there
        assert!((out.running_mfu.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_zero_eval_interval() {
        let dir = tempfile::tempdir().unwrap();
        let data = DatasetAccessor::from_sources(
            Box::new(InMemoryTokens(vec![0; 16])),
            Box::new(InMemoryTokens(vec![0; 16])),
        );
        let result = Trainer::new(TrainerParts {
            model:       ScriptedModel::with_eval_losses(&[1.0]),
            optimizer:   CountingOptimizer::new(),
            state:       TrainingState::fresh(),
            data,
            sampler:     BatchSampler::new(SamplingLayout::Contiguous, 4, 1, 0),
            schedule:    schedule(),
            settings:    LoopSettings { eval_interval: 0, ..settings() },
            device:      Device::Cpu,
            precision:   Precision::Fp32,
            checkpoints: CheckpointManager::new(dir.path()),
        });
        assert!(matches!(result, Err(TrainError::Configuration(_))));
    }
}

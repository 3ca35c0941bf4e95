// ============================================================
// Layer 5 — AdamW Optimizer
// ============================================================
// burn's AdamW (decoupled weight decay) over two parameter
// groups:
//
//   "decay"    — rank ≥ 2 tensors (matmul weights, embeddings)
//   "no_decay" — rank 1 tensors (biases, layer-norm gains)
//
// Each group is its own OptimizerAdaptor configured with the
// group's weight decay. A step splits the accumulated gradients
// by rank and runs the two adaptors one after the other.
//
// burn keys moment buffers by ParamId, which changes every time
// a module is built. Persisted state re-keys them by each
// parameter's position in the name-sorted parameter list and
// stores the names and shapes alongside:
//
//   live ParamId ──► slot index ──► name + shape   (save)
//   name + shape ──► slot index ──► live ParamId   (load)
//
// On load a slot whose shape no longer matches (a cropped
// position table) is dropped; that parameter starts with fresh
// moments.
//
// Global-norm clipping happens in the trainer before step();
// burn's GradientClipping works per parameter.
//
// Reference: Loshchilov & Hutter (2019) Decoupled Weight Decay

use std::collections::HashMap;

use burn::{
    module::ParamId,
    optim::{adaptor::OptimizerAdaptor, AdamW, AdamWConfig, Optimizer as BurnOptimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::AutodiffBackend,
};

use crate::domain::error::{TrainError, TrainResult};
use crate::domain::traits::{Optimizer, OptimizerState, ParamGroup, ParamSlot};
use crate::ml::grads;
use crate::ml::model::{GptLm, GptModule};

const EPSILON: f32 = 1e-8;
const DECAY_GROUP:    usize = 0;
const NO_DECAY_GROUP: usize = 1;

type Adaptor<B> = OptimizerAdaptor<AdamW, GptModule<B>, B>;
type AdaptorState<B> = <Adaptor<B> as BurnOptimizer<GptModule<B>, B>>::Record;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWSettings {
    pub learning_rate: f64,
    pub weight_decay:  f32,
    pub beta1:         f32,
    pub beta2:         f32,
}

impl AdamWSettings {
    fn config(&self, weight_decay: f32) -> AdamWConfig {
        AdamWConfig::new()
            .with_beta_1(self.beta1)
            .with_beta_2(self.beta2)
            .with_epsilon(EPSILON)
            .with_weight_decay(weight_decay)
    }
}

pub struct BurnAdamW<B: AutodiffBackend> {
    groups:          Vec<ParamGroup>,
    decay_config:    AdamWConfig,
    no_decay_config: AdamWConfig,
    decay:           Adaptor<B>,
    no_decay:        Adaptor<B>,
    steps:           u64,
}

impl<B: AutodiffBackend> BurnAdamW<B> {
    pub fn new(settings: AdamWSettings) -> Self {
        let decay_config    = settings.config(settings.weight_decay);
        let no_decay_config = settings.config(0.0);

        Self {
            groups: vec![
                ParamGroup {
                    name:          "decay".into(),
                    learning_rate: settings.learning_rate,
                    weight_decay:  settings.weight_decay,
                },
                ParamGroup {
                    name:          "no_decay".into(),
                    learning_rate: settings.learning_rate,
                    weight_decay:  0.0,
                },
            ],
            decay:    decay_config.init::<B, GptModule<B>>(),
            no_decay: no_decay_config.init::<B, GptModule<B>>(),
            decay_config,
            no_decay_config,
            steps: 0,
        }
    }

    /// Number of updates applied so far, including those
    /// restored from a checkpoint.
    pub fn step_count(&self) -> u64 {
        self.steps
    }

    fn encode(&self, state: AdaptorState<B>) -> TrainResult<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        Recorder::<B>::record(&recorder, state, ())
            .map_err(|e| TrainError::Model(format!("cannot encode optimizer moments: {e:?}")))
    }

    fn decode(bytes: Vec<u8>, device: &B::Device) -> TrainResult<AdaptorState<B>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        Recorder::<B>::load(&recorder, bytes, device)
            .map_err(|e| TrainError::Model(format!("cannot decode optimizer moments: {e:?}")))
    }
}

fn rekey<B: AutodiffBackend>(state: AdaptorState<B>, ids: &HashMap<ParamId, ParamId>) -> AdaptorState<B> {
    state
        .into_iter()
        .filter_map(|(id, record)| ids.get(&id).map(|&to| (to, record)))
        .collect()
}

impl<B: AutodiffBackend> std::fmt::Debug for BurnAdamW<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurnAdamW")
            .field("groups", &self.groups)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl<B: AutodiffBackend> Optimizer<GptLm<B>> for BurnAdamW<B> {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, model: &mut GptLm<B>) -> TrainResult<()> {
        let all = model.take_gradients();
        let (matrices, rest) = grads::split_by_rank::<B, _>(model.module(), all);

        let module = model.module().clone();
        let module = self
            .decay
            .step(self.groups[DECAY_GROUP].learning_rate, module, matrices);
        let module = self
            .no_decay
            .step(self.groups[NO_DECAY_GROUP].learning_rate, module, rest);

        model.replace_module(module);
        self.steps += 1;
        Ok(())
    }

    fn state_dict(&self, model: &GptLm<B>) -> TrainResult<OptimizerState> {
        let params = model.named_params();
        let to_slot: HashMap<ParamId, ParamId> = params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, ParamId::from(i as u64)))
            .collect();

        let payload = vec![
            self.encode(rekey::<B>(self.decay.to_record(), &to_slot))?,
            self.encode(rekey::<B>(self.no_decay.to_record(), &to_slot))?,
        ];

        Ok(OptimizerState {
            step:   self.steps,
            groups: self.groups.clone(),
            slots:  params
                .into_iter()
                .map(|p| ParamSlot { name: p.name, shape: p.shape })
                .collect(),
            payload,
        })
    }

    fn load_state_dict(&mut self, state: OptimizerState, model: &GptLm<B>) -> TrainResult<()> {
        if state.groups.len() != self.groups.len() || state.payload.len() != self.groups.len() {
            return Err(TrainError::Model(format!(
                "optimizer state has {} groups and {} moment blobs, expected {}",
                state.groups.len(),
                state.payload.len(),
                self.groups.len()
            )));
        }

        let live: HashMap<String, (ParamId, Vec<usize>)> = model
            .named_params()
            .into_iter()
            .map(|p| (p.name, (p.id, p.shape)))
            .collect();

        let mut from_slot = HashMap::with_capacity(state.slots.len());
        for (i, slot) in state.slots.iter().enumerate() {
            let Some((id, shape)) = live.get(&slot.name) else {
                return Err(TrainError::Model(format!(
                    "optimizer state refers to unknown parameter '{}'",
                    slot.name
                )));
            };
            if *shape == slot.shape {
                from_slot.insert(ParamId::from(i as u64), *id);
            } else {
                tracing::info!(
                    "Dropping optimizer moments of '{}': shape {:?} → {:?}",
                    slot.name,
                    slot.shape,
                    shape
                );
            }
        }

        let mut blobs = state.payload.into_iter();
        let device = model.device();
        let (Some(decay), Some(no_decay)) = (blobs.next(), blobs.next()) else {
            return Err(TrainError::Model("optimizer state is missing moment blobs".into()));
        };
        let decay    = rekey::<B>(Self::decode(decay, device)?, &from_slot);
        let no_decay = rekey::<B>(Self::decode(no_decay, device)?, &from_slot);

        self.decay    = self.decay_config.init::<B, GptModule<B>>().load_record(decay);
        self.no_decay = self.no_decay_config.init::<B, GptModule<B>>().load_record(no_decay);

        for (group, saved) in self.groups.iter_mut().zip(&state.groups) {
            group.learning_rate = saved.learning_rate;
        }
        self.steps = state.step;
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::hyperparams::ArchitectureHyperparams;
    use crate::domain::record::StateDict;
    use crate::domain::state::TokenBatch;
    use crate::domain::traits::LanguageModel;
    use crate::ml::device::CpuBackend;

    type TestModel = GptLm<CpuBackend>;
    type TestOptimizer = BurnAdamW<CpuBackend>;

    fn settings(learning_rate: f64, weight_decay: f32) -> AdamWSettings {
        AdamWSettings { learning_rate, weight_decay, beta1: 0.9, beta2: 0.95 }
    }

    fn model() -> TestModel {
        let hp = ArchitectureHyperparams {
            layer_count:     1,
            head_count:      2,
            embedding_width: 8,
            context_window:  8,
            use_bias:        true,
            dropout_rate:    0.0,
            vocab_size:      6,
        };
        GptLm::new(hp, Default::default()).unwrap()
    }

    /// A repeating 0..5 sequence
    fn batch() -> TokenBatch {
        let inputs: Vec<u32> = (0..16).map(|i| i % 5).collect();
        let targets = inputs.iter().map(|t| (t + 1) % 5).collect();
        TokenBatch { batch_size: 2, window: 8, inputs, targets }
    }

    fn train_step(model: &mut TestModel, opt: &mut TestOptimizer, multiplier: f32) -> f32 {
        let b = model.transfer(batch()).join().unwrap();
        let loss = model.forward(&b).unwrap();
        model.backward(multiplier).unwrap();
        opt.step(model).unwrap();
        opt.zero_gradients(model);
        loss
    }

    fn max_diff(a: &StateDict, b: &StateDict) -> f32 {
        a.iter()
            .flat_map(|(k, ra)| ra.data.iter().zip(&b[k].data).map(|(x, y)| (x - y).abs()))
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_step_counts_and_clears_gradients() {
        let mut m = model();
        let mut opt = TestOptimizer::new(settings(1e-3, 0.1));
        train_step(&mut m, &mut opt, 1.0);
        train_step(&mut m, &mut opt, 1.0);
        assert_eq!(opt.step_count(), 2);
        assert_eq!(m.grad_norm().unwrap(), 0.0);
    }

    #[test]
    fn test_weight_decay_only_on_matrices() {
        // zero gradients leave only the decay term: θ ← θ·(1 − lr·wd)
        let mut m = model();
        let before = m.state_dict().unwrap();
        let mut opt = TestOptimizer::new(settings(0.1, 0.5));
        train_step(&mut m, &mut opt, 0.0);
        let after = m.state_dict().unwrap();

        for (name, old) in &before {
            let factor = if old.shape.len() >= 2 { 0.95 } else { 1.0 };
            for (x, y) in old.data.iter().zip(&after[name].data) {
                assert!((x * factor - y).abs() < 1e-5, "{name}: {x} → {y}");
            }
        }
    }

    #[test]
    fn test_set_learning_rate_hits_every_group() {
        let mut opt = TestOptimizer::new(settings(1e-3, 0.1));
        opt.set_learning_rate(0.5);
        assert!(opt.param_groups().iter().all(|g| g.learning_rate == 0.5));
        assert_eq!(opt.param_groups()[NO_DECAY_GROUP].weight_decay, 0.0);
    }

    #[test]
    fn test_state_dict_resumes_identically() {
        let mut a = model();
        let mut opt_a = TestOptimizer::new(settings(1e-2, 0.1));
        train_step(&mut a, &mut opt_a, 1.0);
        let saved = opt_a.state_dict(&a).unwrap();
        assert_eq!(saved.slots.len(), a.named_params().len());

        // a rebuilt model has fresh ParamIds
        let mut b = model();
        b.load_state_dict(&a.state_dict().unwrap()).unwrap();
        let mut opt_b = TestOptimizer::new(settings(1e-2, 0.1));
        opt_b.load_state_dict(saved, &b).unwrap();
        assert_eq!(opt_b.step_count(), 1);

        let mut c = model();
        c.load_state_dict(&a.state_dict().unwrap()).unwrap();
        let mut opt_fresh = TestOptimizer::new(settings(1e-2, 0.1));

        train_step(&mut a, &mut opt_a, 1.0);
        train_step(&mut b, &mut opt_b, 1.0);
        train_step(&mut c, &mut opt_fresh, 1.0);

        let (sa, sb, sc) = (a.state_dict().unwrap(), b.state_dict().unwrap(), c.state_dict().unwrap());
        assert!(max_diff(&sa, &sb) < 1e-6);
        assert!(max_diff(&sa, &sc) > 1e-4);
    }

    #[test]
    fn test_moments_of_cropped_parameters_are_dropped() {
        let mut a = model();
        let mut opt_a = TestOptimizer::new(settings(1e-2, 0.1));
        train_step(&mut a, &mut opt_a, 1.0);
        let saved = opt_a.state_dict(&a).unwrap();

        let mut b = model();
        b.load_state_dict(&a.state_dict().unwrap()).unwrap();
        b.crop_context_window(4).unwrap();

        let mut opt_b = TestOptimizer::new(settings(1e-2, 0.1));
        opt_b.load_state_dict(saved, &b).unwrap();

        let short = TokenBatch {
            batch_size: 1,
            window:     4,
            inputs:     vec![0, 1, 2, 3],
            targets:    vec![1, 2, 3, 4],
        };
        let on_device = b.transfer(short).join().unwrap();
        b.forward(&on_device).unwrap();
        b.backward(1.0).unwrap();
        opt_b.step(&mut b).unwrap();
        assert_eq!(opt_b.step_count(), 2);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut a = model();
        let mut opt_a = TestOptimizer::new(settings(1e-2, 0.1));
        train_step(&mut a, &mut opt_a, 1.0);

        let mut saved = opt_a.state_dict(&a).unwrap();
        saved.slots[0].name = "no.such.weight".into();
        let mut opt_b = TestOptimizer::new(settings(1e-2, 0.1));
        assert!(opt_b.load_state_dict(saved, &a).is_err());

        let mut truncated = opt_a.state_dict(&a).unwrap();
        truncated.payload.pop();
        assert!(opt_b.load_state_dict(truncated, &a).is_err());
    }

    #[test]
    fn test_learns_a_repeating_sequence() {
        let mut m = model();
        let mut opt = TestOptimizer::new(settings(1e-2, 0.0));
        let first = train_step(&mut m, &mut opt, 1.0);
        let mut last = first;
        for _ in 0..60 {
            last = train_step(&mut m, &mut opt, 1.0);
        }
        assert!(last < 0.5 * first, "loss {first} → {last}");
    }
}

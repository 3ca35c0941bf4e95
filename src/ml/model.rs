// ============================================================
// Layer 5 — Reference Language Model
// ============================================================
// A GPT-style decoder built from burn::nn modules. The training
// loop only sees the LanguageModel trait, so any other
// architecture can replace this one.
//
// Architecture (C = embedding_width, V = vocab_size):
//
//   tokens [B, T]
//       │
//       ▼
//   wte[token] + wpe[position]             [B, T, C]
//       │  dropout
//       ▼
//   ┌─ block × layer_count ──────────────────────────┐
//   │   x ← x + dropout( attn( ln_1(x), causal ) )   │
//   │   x ← x + mlp( ln_2(x) )                       │
//   │        mlp: C → 4C → gelu → C → dropout        │
//   └────────────────────────────────────────────────┘
//       │
//       ▼
//   ln_f → lm_head                          [B, T, V]
//       │
//       ▼
//   cross-entropy, mean over B·T
//
// GptModule is the burn Module; GptLm wraps it with what the
// loop needs across calls: the mode, the graph of the last
// training forward, and the gradients accumulated since the
// last optimizer step.
//
// Eval-mode forwards run on model.valid(): the inner backend,
// so no graph is recorded and dropout is inactive.
//
// Reference: Radford et al. (2019) GPT-2
//            PaLM (2022) Appendix B (model FLOPs utilization)

use burn::{
    module::{AutodiffModule, Param, ParamId},
    nn::{
        attention::{generate_autoregressive_mask, MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        loss::CrossEntropyLossConfig,
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        Initializer,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::domain::error::{TrainError, TrainResult};
use crate::domain::hyperparams::ArchitectureHyperparams;
use crate::domain::record::StateDict;
use crate::domain::state::TokenBatch;
use crate::domain::traits::{LanguageModel, ModelMode};
use crate::domain::transfer::PendingBatch;
use crate::ml::{grads, weights};

/// Peak dense throughput the utilization estimate is measured
/// against (A100 bf16).
const REFERENCE_PEAK_FLOPS: f64 = 312e12;
const INIT_STD: f64 = 0.02;

// ─── Configuration ────────────────────────────────────────────────────────────
// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct GptConfig {
    pub vocab_size:      usize,
    pub context_window:  usize,
    pub embedding_width: usize,
    pub head_count:      usize,
    pub layer_count:     usize,
    #[config(default = false)]
    pub use_bias:        bool,
    #[config(default = 0.0)]
    pub dropout:         f64,
}

impl GptConfig {
    pub fn from_hyperparams(hp: &ArchitectureHyperparams) -> Self {
        GptConfig::new(
            hp.vocab_size,
            hp.context_window,
            hp.embedding_width,
            hp.head_count,
            hp.layer_count,
        )
        .with_use_bias(hp.use_bias)
        .with_dropout(hp.dropout_rate as f64)
    }

    /// Weights start N(0, 0.02²). The projection back into the
    /// residual stream is scaled by 1/√(2·layer_count) so the
    /// stream does not grow with depth.
    pub fn init<B: Backend>(&self, device: &B::Device) -> GptModule<B> {
        let c = self.embedding_width;
        let normal = |std: f64| Initializer::Normal { mean: 0.0, std };
        let proj_std = INIT_STD / (2.0 * self.layer_count as f64).sqrt();

        let blocks = (0..self.layer_count)
            .map(|_| Block {
                ln_1: LayerNormConfig::new(c).init(device),
                attn: MultiHeadAttentionConfig::new(c, self.head_count)
                    .with_dropout(self.dropout)
                    .init(device),
                resid_dropout: DropoutConfig::new(self.dropout).init(),
                ln_2: LayerNormConfig::new(c).init(device),
                mlp: Mlp {
                    fc: LinearConfig::new(c, 4 * c)
                        .with_bias(self.use_bias)
                        .with_initializer(normal(INIT_STD))
                        .init(device),
                    proj: LinearConfig::new(4 * c, c)
                        .with_bias(self.use_bias)
                        .with_initializer(normal(proj_std))
                        .init(device),
                    dropout: DropoutConfig::new(self.dropout).init(),
                },
            })
            .collect();

        GptModule {
            wte: EmbeddingConfig::new(self.vocab_size, c)
                .with_initializer(normal(INIT_STD))
                .init(device),
            wpe: EmbeddingConfig::new(self.context_window, c)
                .with_initializer(normal(INIT_STD))
                .init(device),
            drop: DropoutConfig::new(self.dropout).init(),
            blocks,
            ln_f: LayerNormConfig::new(c).init(device),
            lm_head: LinearConfig::new(c, self.vocab_size)
                .with_bias(self.use_bias)
                .with_initializer(normal(INIT_STD))
                .init(device),
        }
    }
}

// ─── Modules ──────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub fc:      Linear<B>,
    pub proj:    Linear<B>,
    pub dropout: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = burn::tensor::activation::gelu(self.fc.forward(x));
        self.dropout.forward(self.proj.forward(h))
    }
}

#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    pub ln_1:          LayerNorm<B>,
    pub attn:          MultiHeadAttention<B>,
    pub resid_dropout: Dropout,
    pub ln_2:          LayerNorm<B>,
    pub mlp:           Mlp<B>,
}

impl<B: Backend> Block<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, seq_len, _] = x.dims();
        let mask = generate_autoregressive_mask::<B>(batch_size, seq_len, &x.device());

        let attn = self
            .attn
            .forward(MhaInput::self_attn(self.ln_1.forward(x.clone())).mask_attn(mask))
            .context;
        let x = x + self.resid_dropout.forward(attn);
        let h = self.mlp.forward(self.ln_2.forward(x.clone()));
        x + h
    }
}

#[derive(Module, Debug)]
pub struct GptModule<B: Backend> {
    pub wte:     Embedding<B>,
    pub wpe:     Embedding<B>,
    pub drop:    Dropout,
    pub blocks:  Vec<Block<B>>,
    pub ln_f:    LayerNorm<B>,
    pub lm_head: Linear<B>,
}

impl<B: Backend> GptModule<B> {
    /// inputs: [batch, seq_len] → logits: [batch, seq_len, vocab]
    pub fn forward(&self, inputs: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = inputs.dims();

        let tok_emb = self.wte.forward(inputs);
        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &tok_emb.device())
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let pos_emb = self.wpe.forward(positions);

        let mut x = self.drop.forward(tok_emb + pos_emb);
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.lm_head.forward(self.ln_f.forward(x))
    }

    /// Mean next-token cross-entropy over every position
    pub fn forward_loss(&self, inputs: Tensor<B, 2, Int>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let logits = self.forward(inputs);
        let [batch_size, seq_len, vocab] = logits.dims();
        let ce = CrossEntropyLossConfig::new().init(&logits.device());
        ce.forward(
            logits.reshape([batch_size * seq_len, vocab]),
            targets.reshape([batch_size * seq_len]),
        )
    }

    /// Keep the first `window` rows of the position table. The
    /// cropped table is a new parameter.
    pub fn crop_positions(mut self, window: usize) -> Self {
        let table = self.wpe.weight.val();
        let [_, width] = table.dims();
        let cropped = table.slice([0..window, 0..width]).detach().require_grad();
        self.wpe.weight = Param::initialized(ParamId::new(), cropped);
        self
    }
}

// ─── GptBatch ─────────────────────────────────────────────────────────────────
/// A token batch on the model's device
#[derive(Debug, Clone)]
pub struct GptBatch<B: Backend> {
    /// [batch_size, window]
    pub inputs:  Tensor<B, 2, Int>,
    /// [batch_size, window]
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> GptBatch<B> {
    pub fn upload(batch: &TokenBatch, device: &B::Device) -> Self {
        let shape = [batch.batch_size, batch.window];
        let ints = |ids: &[u32]| ids.iter().map(|&t| t as i32).collect::<Vec<i32>>();

        let inputs = Tensor::<B, 1, Int>::from_ints(ints(&batch.inputs).as_slice(), device).reshape(shape);
        let targets = Tensor::<B, 1, Int>::from_ints(ints(&batch.targets).as_slice(), device).reshape(shape);
        Self { inputs, targets }
    }
}

// ─── GptLm ────────────────────────────────────────────────────────────────────
pub struct GptLm<B: AutodiffBackend> {
    module:         GptModule<B>,
    hp:             ArchitectureHyperparams,
    device:         B::Device,
    mode:           ModelMode,
    async_transfer: bool,
    /// Loss of the last training-mode forward, still attached
    /// to its graph
    graph:          Option<Tensor<B, 1>>,
    grads:          Option<GradientsParams>,
}

impl<B: AutodiffBackend> GptLm<B> {
    pub fn new(hp: ArchitectureHyperparams, device: B::Device) -> TrainResult<Self> {
        hp.validate()?;
        let module = GptConfig::from_hyperparams(&hp).init::<B>(&device);

        tracing::info!(
            "GPT model: {} layers, {} heads, width {}, vocab {}, {} parameters",
            hp.layer_count,
            hp.head_count,
            hp.embedding_width,
            hp.vocab_size,
            module.num_params()
        );

        Ok(Self {
            module,
            hp,
            device,
            mode: ModelMode::Train,
            async_transfer: false,
            graph: None,
            grads: None,
        })
    }

    /// Upload batches on a background thread
    pub fn with_async_transfer(mut self, enabled: bool) -> Self {
        self.async_transfer = enabled;
        self
    }

    pub fn module(&self) -> &GptModule<B> {
        &self.module
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Every parameter with its current id, sorted by name
    pub fn named_params(&self) -> Vec<weights::NamedParam> {
        weights::named_params::<B, _>(&self.module)
    }

    /// Hand the accumulated gradients to an optimizer.
    pub fn take_gradients(&mut self) -> GradientsParams {
        self.grads.take().unwrap_or_else(GradientsParams::new)
    }

    /// Install the module an optimizer step produced.
    pub fn replace_module(&mut self, module: GptModule<B>) {
        self.module = module;
    }

    /// Parameter count excluding the position table, the N in
    /// the 6N FLOPs-per-token rule.
    pub fn num_non_embedding_params(&self) -> usize {
        let [rows, width] = self.module.wpe.weight.val().dims();
        self.module.num_params() - rows * width
    }

    fn check_batch(&self, batch: &TokenBatch) -> TrainResult<()> {
        if batch.window > self.hp.context_window {
            return Err(TrainError::Model(format!(
                "sequence of length {} exceeds the context window of {}",
                batch.window, self.hp.context_window
            )));
        }
        let n = batch.num_tokens();
        if batch.inputs.len() != n || batch.targets.len() != n {
            return Err(TrainError::Model(format!(
                "batch buffers do not match {}×{}",
                batch.batch_size, batch.window
            )));
        }
        let v = self.hp.vocab_size as u32;
        if let Some(&bad) = batch.inputs.iter().chain(&batch.targets).find(|&&t| t >= v) {
            return Err(TrainError::Model(format!(
                "token id {bad} is outside the vocabulary of {v}"
            )));
        }
        Ok(())
    }
}

impl<B: AutodiffBackend> std::fmt::Debug for GptLm<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GptLm")
            .field("hp", &self.hp)
            .field("mode", &self.mode)
            .field("async_transfer", &self.async_transfer)
            .finish_non_exhaustive()
    }
}

impl<B: AutodiffBackend> LanguageModel for GptLm<B> {
    type Batch = GptBatch<B>;

    fn transfer(&self, batch: TokenBatch) -> PendingBatch<GptBatch<B>> {
        if let Err(e) = self.check_batch(&batch) {
            return PendingBatch::ready(Err(e));
        }
        let device = self.device.clone();
        if self.async_transfer {
            PendingBatch::spawn(move || Ok(GptBatch::upload(&batch, &device)))
        } else {
            PendingBatch::ready(Ok(GptBatch::upload(&batch, &device)))
        }
    }

    fn forward(&mut self, batch: &GptBatch<B>) -> TrainResult<f32> {
        match self.mode {
            ModelMode::Train => {
                let loss = self
                    .module
                    .forward_loss(batch.inputs.clone(), batch.targets.clone());
                let value = loss.clone().into_scalar().elem::<f32>();
                self.graph = Some(loss);
                Ok(value)
            }
            ModelMode::Eval => {
                let loss = self
                    .module
                    .valid()
                    .forward_loss(batch.inputs.clone().inner(), batch.targets.clone().inner());
                Ok(loss.into_scalar().elem::<f32>())
            }
        }
    }

    fn backward(&mut self, loss_multiplier: f32) -> TrainResult<()> {
        let loss = self
            .graph
            .take()
            .ok_or_else(|| TrainError::Model("backward() called without a training-mode forward".into()))?;

        let fresh = GradientsParams::from_grads(loss.mul_scalar(loss_multiplier).backward(), &self.module);
        let total = self.grads.get_or_insert_with(GradientsParams::new);
        grads::accumulate::<B, _>(&self.module, total, fresh);
        Ok(())
    }

    fn set_mode(&mut self, mode: ModelMode) {
        if mode == ModelMode::Eval {
            self.graph = None;
        }
        self.mode = mode;
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn hyperparams(&self) -> &ArchitectureHyperparams {
        &self.hp
    }

    fn grad_norm(&mut self) -> TrainResult<f32> {
        Ok(match &self.grads {
            Some(g) => grads::global_norm::<B, _>(&self.module, g),
            None => 0.0,
        })
    }

    fn scale_grads(&mut self, factor: f32) -> TrainResult<()> {
        if let Some(g) = &mut self.grads {
            grads::scale::<B, _>(&self.module, g, factor);
        }
        Ok(())
    }

    fn zero_grads(&mut self) {
        self.grads = None;
        self.graph = None;
    }

    fn state_dict(&self) -> TrainResult<StateDict> {
        weights::export::<B, _>(&self.module)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> TrainResult<()> {
        self.module = weights::import::<B, _>(self.module.clone(), state, &self.device)?;
        self.zero_grads();
        Ok(())
    }

    fn crop_context_window(&mut self, window: usize) -> TrainResult<()> {
        if window == 0 || window > self.hp.context_window {
            return Err(TrainError::config(format!(
                "cannot crop context window {} to {}",
                self.hp.context_window, window
            )));
        }
        if window == self.hp.context_window {
            return Ok(());
        }

        self.module = self.module.clone().crop_positions(window);
        tracing::info!("Cropped context window {} → {}", self.hp.context_window, window);
        self.hp.context_window = window;
        self.zero_grads();
        Ok(())
    }

    fn estimate_utilization(&self, tokens_per_iter: usize, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        let n_params = self.num_non_embedding_params() as f64;
        let l = self.hp.layer_count as f64;
        let heads = self.hp.head_count as f64;
        let q = self.hp.head_width() as f64;
        let t = self.hp.context_window as f64;

        let flops_per_token = 6.0 * n_params + 12.0 * l * heads * q * t;
        let flops_per_iter  = flops_per_token * tokens_per_iter as f64;
        (flops_per_iter / elapsed_secs) / REFERENCE_PEAK_FLOPS
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::device::CpuBackend;

    type TestModel = GptLm<CpuBackend>;

    fn hp(dropout_rate: f32) -> ArchitectureHyperparams {
        ArchitectureHyperparams {
            layer_count:     2,
            head_count:      2,
            embedding_width: 8,
            context_window:  8,
            use_bias:        true,
            dropout_rate,
            vocab_size:      11,
        }
    }

    fn model(dropout_rate: f32) -> TestModel {
        GptLm::new(hp(dropout_rate), Default::default()).unwrap()
    }

    /// Two rows of a 0..10 ramp, targets shifted by one
    fn batch(window: usize) -> TokenBatch {
        let inputs: Vec<u32> = (0..2 * window as u32).map(|i| i % 10).collect();
        let targets = inputs.iter().map(|t| t + 1).collect();
        TokenBatch { batch_size: 2, window, inputs, targets }
    }

    fn loss_of(model: &mut TestModel, b: &TokenBatch) -> f32 {
        let on_device = model.transfer(b.clone()).join().unwrap();
        model.forward(&on_device).unwrap()
    }

    #[test]
    fn test_initial_loss_near_uniform() {
        let mut m = model(0.0);
        let loss = loss_of(&mut m, &batch(8));
        assert!((loss - (11f32).ln()).abs() < 0.3, "loss {loss}");
    }

    #[test]
    fn test_backward_needs_training_forward() {
        let mut m = model(0.0);
        assert!(m.backward(1.0).is_err());

        m.set_mode(ModelMode::Eval);
        loss_of(&mut m, &batch(4));
        assert!(m.backward(1.0).is_err());
    }

    #[test]
    fn test_multiplier_scales_gradients_and_accumulates() {
        let b = batch(4);
        let mut m = model(0.0);

        loss_of(&mut m, &b);
        m.backward(1.0).unwrap();
        let single = m.grad_norm().unwrap();
        assert!(single > 0.0);

        m.zero_grads();
        loss_of(&mut m, &b);
        m.backward(2.0).unwrap();
        assert!((m.grad_norm().unwrap() - 2.0 * single).abs() < 1e-3 * single);

        // a second micro-step adds on top
        loss_of(&mut m, &b);
        m.backward(1.0).unwrap();
        assert!((m.grad_norm().unwrap() - 3.0 * single).abs() < 1e-3 * single);

        m.scale_grads(1.0 / 3.0).unwrap();
        assert!((m.grad_norm().unwrap() - single).abs() < 1e-3 * single);
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut m = model(0.0);
        loss_of(&mut m, &batch(4));
        m.backward(1000.0).unwrap();

        let before = m.clip_grad_norm(0.5).unwrap();
        assert!(before > 0.5);
        assert!((m.grad_norm().unwrap() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_dropout_only_in_training_mode() {
        let b = batch(8);
        let mut m = model(0.5);

        m.set_mode(ModelMode::Eval);
        let e1 = loss_of(&mut m, &b);
        let e2 = loss_of(&mut m, &b);
        assert_eq!(e1, e2);

        m.set_mode(ModelMode::Train);
        let t1 = loss_of(&mut m, &b);
        let t2 = loss_of(&mut m, &b);
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_async_transfer_matches_sync() {
        let b = batch(8);
        let mut m = model(0.0);
        m.set_mode(ModelMode::Eval);
        let sync = loss_of(&mut m, &b);

        let mut m = m.with_async_transfer(true);
        let pending = m.transfer(b.clone());
        let on_device = pending.join().unwrap();
        assert_eq!(m.forward(&on_device).unwrap(), sync);
    }

    #[test]
    fn test_transfer_rejects_bad_batches() {
        let m = model(0.0);
        assert!(m.transfer(batch(9)).join().is_err());

        let mut b = batch(4);
        b.targets[0] = 11;
        assert!(m.transfer(b).join().is_err());
    }

    #[test]
    fn test_crop_context_window() {
        let mut m = model(0.0);
        m.crop_context_window(4).unwrap();
        assert_eq!(m.hyperparams().context_window, 4);

        let sd = m.state_dict().unwrap();
        let wpe: Vec<_> = sd.iter().filter(|(k, _)| k.starts_with("wpe")).collect();
        assert_eq!(wpe.len(), 1);
        assert_eq!(wpe[0].1.shape, vec![4, 8]);

        // cropped model still trains on the shorter window
        loss_of(&mut m, &batch(4));
        m.backward(1.0).unwrap();
        assert!(m.transfer(batch(8)).join().is_err());

        assert!(m.crop_context_window(8).is_err());
        assert!(m.crop_context_window(0).is_err());
    }

    #[test]
    fn test_state_dict_round_trip_between_models() {
        let b = batch(8);
        let mut a = model(0.0);
        let mut c = model(0.0);
        a.set_mode(ModelMode::Eval);
        c.set_mode(ModelMode::Eval);
        assert_ne!(loss_of(&mut a, &b), loss_of(&mut c, &b));

        c.load_state_dict(&a.state_dict().unwrap()).unwrap();
        assert_eq!(loss_of(&mut a, &b), loss_of(&mut c, &b));
        assert_eq!(c.state_dict().unwrap(), a.state_dict().unwrap());
    }

    #[test]
    fn test_state_dict_rejects_other_architecture() {
        let a = model(0.0);
        let mut wider = GptLm::<CpuBackend>::new(
            ArchitectureHyperparams { embedding_width: 16, ..hp(0.0) },
            Default::default(),
        )
        .unwrap();
        assert!(matches!(
            wider.load_state_dict(&a.state_dict().unwrap()),
            Err(TrainError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_parameter_names_are_unique_and_complete() {
        let m = model(0.0);
        let params = m.named_params();
        let sd = m.state_dict().unwrap();
        assert_eq!(sd.len(), params.len());

        let total: usize = sd.values().map(|r| r.numel()).sum();
        assert_eq!(total, m.module().num_params());
        assert!(sd.keys().any(|k| k.starts_with("wte")));
        assert!(sd.keys().any(|k| k.starts_with("lm_head")));
    }

    #[test]
    fn test_utilization_formula() {
        let m = model(0.0);
        let n = m.num_non_embedding_params() as f64;
        // L=2, H=2, Q=4, T=8
        let per_token = 6.0 * n + 12.0 * 2.0 * 2.0 * 4.0 * 8.0;
        let expected = per_token * 100.0 / 0.5 / 312e12;
        assert!((m.estimate_utilization(100, 0.5) - expected).abs() < 1e-18);
        assert_eq!(m.estimate_utilization(100, 0.0), 0.0);
    }
}

// ============================================================
// Layer 5 — Gradient Bookkeeping
// ============================================================
// burn hands back one GradientsParams per backward pass. The
// loop needs a few whole-model operations on top of that:
//
//   accumulate()    — sum micro-step gradients parameter-wise
//   global_norm()   — one L2 norm over every gradient
//   scale()         — multiply every gradient (unscale, clip)
//   split_by_rank() — matrices vs. vectors, for the two
//                     weight-decay groups
//
// Each is a ModuleVisitor: the module supplies the parameter
// ids and their ranks, the gradients are looked up by id on
// the inner (non-autodiff) backend.
//
// Reference: Burn Book §5 (Custom Training Loops)

use burn::{
    module::{Module, ModuleVisitor, Param},
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

// ─── accumulate ───────────────────────────────────────────────────────────────
struct Accumulate<'a> {
    total: &'a mut GradientsParams,
    fresh: GradientsParams,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Accumulate<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let Some(grad) = self.fresh.remove::<B::InnerBackend, D>(param.id) else {
            return;
        };
        let sum = match self.total.remove::<B::InnerBackend, D>(param.id) {
            Some(prev) => prev + grad,
            None => grad,
        };
        self.total.register::<B::InnerBackend, D>(param.id, sum);
    }
}

/// Add `fresh` into `total`, parameter by parameter.
pub fn accumulate<B, M>(module: &M, total: &mut GradientsParams, fresh: GradientsParams)
where
    B: AutodiffBackend,
    M: Module<B>,
{
    module.visit(&mut Accumulate { total, fresh });
}

// ─── global_norm ──────────────────────────────────────────────────────────────
struct SquaredNorm<'a> {
    grads: &'a GradientsParams,
    sum:   f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            self.sum += (grad.clone() * grad).sum().into_scalar().elem::<f64>();
        }
    }
}

/// L2 norm over all gradients; inf or NaN if any entry is.
pub fn global_norm<B, M>(module: &M, grads: &GradientsParams) -> f32
where
    B: AutodiffBackend,
    M: Module<B>,
{
    let mut visitor = SquaredNorm { grads, sum: 0.0 };
    module.visit(&mut visitor);
    visitor.sum.sqrt() as f32
}

// ─── scale ────────────────────────────────────────────────────────────────────
struct Scale<'a> {
    grads:  &'a mut GradientsParams,
    factor: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Scale<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads
                .register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.factor));
        }
    }
}

pub fn scale<B, M>(module: &M, grads: &mut GradientsParams, factor: f32)
where
    B: AutodiffBackend,
    M: Module<B>,
{
    module.visit(&mut Scale { grads, factor });
}

// ─── split_by_rank ────────────────────────────────────────────────────────────
struct SplitByRank {
    rest:     GradientsParams,
    matrices: GradientsParams,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SplitByRank {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if D < 2 {
            return;
        }
        if let Some(grad) = self.rest.remove::<B::InnerBackend, D>(param.id) {
            self.matrices.register::<B::InnerBackend, D>(param.id, grad);
        }
    }
}

/// Gradients of rank ≥ 2 parameters (weights, embeddings) and
/// of everything else (biases, norm gains), in that order.
pub fn split_by_rank<B, M>(module: &M, grads: GradientsParams) -> (GradientsParams, GradientsParams)
where
    B: AutodiffBackend,
    M: Module<B>,
{
    let mut visitor = SplitByRank { rest: grads, matrices: GradientsParams::new() };
    module.visit(&mut visitor);
    (visitor.matrices, visitor.rest)
}

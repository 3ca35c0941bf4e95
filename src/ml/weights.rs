// ============================================================
// Layer 5 — Named Weights
// ============================================================
// burn identifies parameters by ParamId, which is minted fresh
// every time a module is built. Checkpoints need names that
// survive a restart, so parameters are named by their field
// path in the module tree:
//
//   GptModule { blocks: Vec<Block { mlp: Mlp { fc: Linear { weight }}}}}
//       → "blocks.0.mlp.fc.weight"
//
// export() turns a module into a StateDict; import() writes a
// StateDict back into a freshly built module of the same
// architecture, keeping that module's ParamIds.
//
// Reference: Burn Book §6 (Records and Saving)

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId},
    prelude::*,
};
use std::collections::{BTreeSet, HashMap};

use crate::domain::error::{TrainError, TrainResult};
use crate::domain::record::{ParamRecord, StateDict};

/// A parameter of a live module, located by path
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParam {
    pub name:  String,
    pub id:    ParamId,
    pub shape: Vec<usize>,
}

// ─── Walking the module tree ──────────────────────────────────────────────────
struct Walker {
    path:        Vec<String>,
    with_values: bool,
    found:       Vec<(NamedParam, Option<Result<Vec<f32>, String>>)>,
}

impl<B: Backend> ModuleVisitor<B> for Walker {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let value  = param.val();
        let shape  = value.dims().to_vec();
        let values = self
            .with_values
            .then(|| value.to_data().to_vec::<f32>().map_err(|e| format!("{e:?}")));
        let named  = NamedParam { name: self.path.join("."), id: param.id, shape };
        self.found.push((named, values));
    }
}

fn walk<B: Backend, M: Module<B>>(
    module:      &M,
    with_values: bool,
) -> Vec<(NamedParam, Option<Result<Vec<f32>, String>>)> {
    let mut walker = Walker { path: Vec::new(), with_values, found: Vec::new() };
    module.visit(&mut walker);
    walker.found.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    walker.found
}

/// Every float parameter of `module`, sorted by name.
pub fn named_params<B: Backend, M: Module<B>>(module: &M) -> Vec<NamedParam> {
    walk::<B, M>(module, false).into_iter().map(|(p, _)| p).collect()
}

// ─── export ───────────────────────────────────────────────────────────────────
pub fn export<B: Backend, M: Module<B>>(module: &M) -> TrainResult<StateDict> {
    let mut state = StateDict::new();
    for (param, values) in walk::<B, M>(module, true) {
        let data = values
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(|e| TrainError::Model(format!("cannot read '{}': {e}", param.name)))?;
        let record = ParamRecord::new(param.shape, data)?;
        if state.insert(param.name.clone(), record).is_some() {
            return Err(TrainError::Model(format!("duplicate parameter name '{}'", param.name)));
        }
    }
    Ok(state)
}

// ─── import ───────────────────────────────────────────────────────────────────
struct Loader<'a, B: Backend> {
    by_id:  HashMap<ParamId, &'a ParamRecord>,
    device: B::Device,
}

impl<B: Backend> ModuleMapper<B> for Loader<'_, B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let (id, tensor, mapper) = param.consume();
        let value = match self.by_id.get(&id) {
            Some(record) => {
                let data = TensorData::new(record.data.clone(), record.shape.clone());
                Tensor::<B, D>::from_data(data.convert::<B::FloatElem>(), &self.device)
                    .set_require_grad(tensor.is_require_grad())
            }
            None => tensor,
        };
        Param::from_mapped_value(id, value, mapper)
    }
}

/// Overwrite every parameter of `module` with the entry of the
/// same name in `state`. Missing names, extra names and shape
/// differences are errors; nothing is written in that case.
pub fn import<B: Backend, M: Module<B>>(
    module: M,
    state:  &StateDict,
    device: &B::Device,
) -> TrainResult<M> {
    let params = named_params::<B, M>(&module);

    let expected: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    if let Some(missing) = expected.iter().find(|name| !state.contains_key(**name)) {
        return Err(TrainError::Model(format!("state dict is missing '{missing}'")));
    }
    if let Some(extra) = state.keys().find(|name| !expected.contains(name.as_str())) {
        return Err(TrainError::Model(format!("state dict has unexpected parameter '{extra}'")));
    }

    let mut by_id = HashMap::with_capacity(params.len());
    for param in &params {
        let record = &state[&param.name];
        if record.shape != param.shape {
            return Err(TrainError::ShapeMismatch {
                name:     param.name.clone(),
                expected: param.shape.clone(),
                actual:   record.shape.clone(),
            });
        }
        by_id.insert(param.id, record);
    }

    Ok(module.map(&mut Loader::<B> { by_id, device: device.clone() }))
}

// ============================================================
// Layer 3 — Parameter Records and State Dicts
// ============================================================
// The portable form of model weights: a shape plus a flat
// row-major f32 buffer per named parameter. Live tensors stay
// inside the backend; these records only exist while weights
// travel between a model and the checkpoint file.
//
// A StateDict is a name → ParamRecord map. BTreeMap keeps the
// keys sorted, so two state dicts with the same content
// serialise to the same bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::error::{TrainError, TrainResult};

/// Named parameters of a model
pub type StateDict = BTreeMap<String, ParamRecord>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub shape: Vec<usize>,
    pub data:  Vec<f32>,
}

impl ParamRecord {
    /// Fails if the element count does not match the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> TrainResult<Self> {
        let n: usize = shape.iter().product();
        if n != data.len() {
            return Err(TrainError::Model(format!(
                "parameter of shape {:?} needs {} values, got {}",
                shape, n, data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ============================================================
// Layer 4 — Batch Sampler
// ============================================================
// Draws (inputs, targets) minibatches from a DatasetAccessor.
// Two corpus layouts share one sampler:
//
//   Contiguous   — one long token stream per split.
//                  Pick batch_size start offsets uniformly in
//                  [0, len - window), read window + 1 tokens,
//                  inputs = [0, window), targets = [1, window + 1).
//
//   FixedRecord  — the stream is a table of equal-width rows,
//                  one puzzle solution per row, each ending in a
//                  delimiter token:
//
//                    row i = tokens[i*W .. (i+1)*W]
//
//                  Pick batch_size row indices uniformly in
//                  [0, num_records), inputs = row[0 .. W-2],
//                  targets = row[1 .. W-1]. The delimiter is
//                  never a prediction target.
//
// Sampling is with replacement and independent per call; there
// are no epochs. Record counts per split come from the config,
// never from guessing at the file size.
//
// Reference: rand crate documentation (Rng::gen_range)

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::token_file::DatasetAccessor;
use crate::domain::error::{TrainError, TrainResult};
use crate::domain::state::{Split, TokenBatch};

/// How the token arrays of a corpus are organised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingLayout {
    Contiguous,
    FixedRecord {
        /// Tokens per record, delimiter included
        record_width:  usize,
        train_records: usize,
        val_records:   usize,
    },
}

impl Default for SamplingLayout {
    fn default() -> Self {
        SamplingLayout::Contiguous
    }
}

impl SamplingLayout {
    /// Sequence length the model sees for this layout
    pub fn window_len(&self, block_size: usize) -> usize {
        match self {
            SamplingLayout::Contiguous => block_size,
            SamplingLayout::FixedRecord { record_width, .. } => record_width.saturating_sub(2),
        }
    }
}

// ─── BatchSampler ─────────────────────────────────────────────────────────────
pub struct BatchSampler {
    layout:     SamplingLayout,
    batch_size: usize,
    window:     usize,
    rng:        StdRng,
}

impl BatchSampler {
    /// `block_size` is the window for the contiguous layout and
    /// is ignored for fixed records (their width decides).
    pub fn new(layout: SamplingLayout, block_size: usize, batch_size: usize, seed: u64) -> Self {
        let window = layout.window_len(block_size);
        Self {
            layout,
            batch_size,
            window,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn window_len(&self) -> usize {
        self.window
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Check that both splits are large enough for this layout.
    /// Run once at start-up so sampling never fails mid-run on
    /// a corpus that was too small from the beginning.
    pub fn validate_against(&self, data: &DatasetAccessor) -> TrainResult<()> {
        if self.batch_size == 0 || self.window == 0 {
            return Err(TrainError::config("batch size and window must be positive"));
        }
        for split in Split::ALL {
            let len = data.split(split).len();
            match &self.layout {
                SamplingLayout::Contiguous => {
                    if len <= self.window {
                        return Err(TrainError::config(format!(
                            "{split} split has {len} tokens; needs more than the window of {}",
                            self.window
                        )));
                    }
                }
                SamplingLayout::FixedRecord { record_width, .. } => {
                    let records = self.records_in(split);
                    if records == 0 {
                        return Err(TrainError::config(format!(
                            "{split} split is configured with zero records"
                        )));
                    }
                    if records.saturating_mul(*record_width) > len {
                        return Err(TrainError::config(format!(
                            "{split} split holds {len} tokens, fewer than {records} records × {record_width}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Draw one fresh batch from `split`.
    pub fn sample(&mut self, data: &DatasetAccessor, split: Split) -> TrainResult<TokenBatch> {
        let source = data.split(split);
        let n      = self.batch_size * self.window;

        let mut inputs  = Vec::with_capacity(n);
        let mut targets = Vec::with_capacity(n);

        match &self.layout {
            SamplingLayout::Contiguous => {
                let len = source.len();
                if len <= self.window {
                    return Err(TrainError::config(format!(
                        "{split} split is too short for a window of {}",
                        self.window
                    )));
                }
                for _ in 0..self.batch_size {
                    let offset = self.rng.gen_range(0..len - self.window);
                    let chunk  = source.read_window(offset, self.window + 1)?;
                    inputs.extend_from_slice(&chunk[..self.window]);
                    targets.extend_from_slice(&chunk[1..]);
                }
            }
            SamplingLayout::FixedRecord { record_width, .. } => {
                let width   = *record_width;
                let records = self.records_in(split);
                if records == 0 {
                    return Err(TrainError::config(format!(
                        "{split} split is configured with zero records"
                    )));
                }
                for _ in 0..self.batch_size {
                    let row = self.rng.gen_range(0..records);
                    let rec = source.read_window(row * width, width)?;
                    inputs.extend_from_slice(&rec[..width - 2]);
                    targets.extend_from_slice(&rec[1..width - 1]);
                }
            }
        }

        Ok(TokenBatch {
            batch_size: self.batch_size,
            window:     self.window,
            inputs,
            targets,
        })
    }

    fn records_in(&self, split: Split) -> usize {
        match (&self.layout, split) {
            (SamplingLayout::FixedRecord { train_records, .. }, Split::Train) => *train_records,
            (SamplingLayout::FixedRecord { val_records, .. }, Split::Val)     => *val_records,
            (SamplingLayout::Contiguous, _) => 0,
        }
    }
}

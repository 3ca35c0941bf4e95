// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Appends one CSV row per evaluation to <out_dir>/metrics.csv:
//
//   step,train_loss,val_loss,lr,checkpoint_saved
//   0,2.890100,2.894300,0.000000,false
//   250,1.124500,1.189200,0.000598,true
//   ...
//
// The header is only written when the file is new, so a
// resumed run keeps appending to the same learning curve.
//
// How to read the metrics:
//   - val_loss should track train_loss
//   - val_loss rising while train_loss falls → overfitting
//   - checkpoint_saved marks the rows a resume would start from
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::domain::error::TrainResult;

pub const METRICS_FILE: &str = "metrics.csv";

/// One row of the learning curve
#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    pub step:             u64,
    pub train_loss:       f32,
    pub val_loss:         f32,
    pub lr:               f64,
    pub checkpoint_saved: bool,
}

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Open (or create) `<dir>/metrics.csv`.
    pub fn new(dir: &Path) -> TrainResult<Self> {
        fs::create_dir_all(dir)?;
        let csv_path = dir.join(METRICS_FILE);

        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "step,train_loss,val_loss,lr,checkpoint_saved")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EvalMetrics) -> TrainResult<()> {
        let mut f = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{}",
            m.step, m.train_loss, m.val_loss, m.lr, m.checkpoint_saved,
        )?;
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ============================================================
// Layer 4 — Vocabulary Metadata
// ============================================================
// Optional `data/<dataset>/meta.json` written by preprocessing:
//
//   { "vocab_size": 18 }
//
// Only the vocabulary size matters to training. Extra keys
// (token tables, delimiters) are ignored.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::domain::error::{TrainError, TrainResult};

pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyMeta {
    pub vocab_size: usize,
}

impl VocabularyMeta {
    /// Read `<dir>/meta.json`. Returns Ok(None) when the file is
    /// absent; a file that exists but does not parse is an error.
    pub fn load(dir: &Path) -> TrainResult<Option<Self>> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)?;
        let meta: VocabularyMeta = serde_json::from_str(&json).map_err(|e| {
            TrainError::config(format!("cannot parse '{}': {e}", path.display()))
        })?;

        if meta.vocab_size == 0 {
            return Err(TrainError::config(format!(
                "'{}' declares vocab_size 0",
                path.display()
            )));
        }

        tracing::info!("Found vocab_size = {} (inside {})", meta.vocab_size, path.display());
        Ok(Some(meta))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_meta_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(VocabularyMeta::load(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_reads_vocab_size_and_ignores_extra_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(META_FILE),
            r#"{"vocab_size": 18, "stoi": {"a": 1}}"#,
        )
        .unwrap();
        let meta = VocabularyMeta::load(dir.path()).unwrap().unwrap();
        assert_eq!(meta.vocab_size, 18);
    }

    #[test]
    fn test_malformed_meta_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), "not json").unwrap();
        assert!(VocabularyMeta::load(dir.path()).unwrap_err().is_fatal_config());
    }
}

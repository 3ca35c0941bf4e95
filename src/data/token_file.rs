// ============================================================
// Layer 4 — Dataset Accessor
// ============================================================
// Random-access reads from the flat token arrays produced by
// the preprocessing step:
//
//   data/<dataset>/train.bin   little-endian u16 token ids
//   data/<dataset>/val.bin
//
// The files can be far larger than RAM, so nothing is loaded
// up front. Each read seeks to `offset * 2` and pulls exactly
// the requested window into memory.
//
// TokenSource is the seam: TokenFile reads from disk, and
// InMemoryTokens backs unit tests.
//
// Reference: Rust Book §12 (I/O), std::io::Seek

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use crate::domain::error::{TrainError, TrainResult};
use crate::domain::state::Split;

const BYTES_PER_TOKEN: u64 = 2;

// ─── TokenSource ──────────────────────────────────────────────────────────────
/// Read-only, random-access view of one split's token stream.
pub trait TokenSource {
    /// Number of tokens in the stream
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `count` consecutive tokens starting at `offset`.
    fn read_window(&self, offset: usize, count: usize) -> TrainResult<Vec<u32>>;
}

// ─── TokenFile ────────────────────────────────────────────────────────────────
/// A split backed by a `.bin` file on disk.
#[derive(Debug)]
pub struct TokenFile {
    file: File,
    len:  usize,
}

impl TokenFile {
    /// Open `<dir>/<split>.bin`. A missing file is reported as
    /// DatasetNotFound naming the split and the path.
    pub fn open(dir: &Path, split: Split) -> TrainResult<Self> {
        let path = dir.join(split.file_name());

        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TrainError::DatasetNotFound {
                split: split.as_str().to_string(),
                path:  path.clone(),
            },
            _ => TrainError::Io(e),
        })?;

        let bytes = file.metadata()?.len();
        if bytes % BYTES_PER_TOKEN != 0 {
            tracing::warn!(
                "'{}' has a trailing odd byte; it will be ignored",
                path.display()
            );
        }
        let len = (bytes / BYTES_PER_TOKEN) as usize;

        tracing::debug!("Opened {} split: {} tokens", split, len);
        Ok(Self { file, len })
    }
}

impl TokenSource for TokenFile {
    fn len(&self) -> usize {
        self.len
    }

    fn read_window(&self, offset: usize, count: usize) -> TrainResult<Vec<u32>> {
        check_bounds(offset, count, self.len)?;

        // &File implements Read + Seek, so no &mut self is needed
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset as u64 * BYTES_PER_TOKEN))?;

        let mut raw = vec![0u8; count * BYTES_PER_TOKEN as usize];
        f.read_exact(&mut raw)?;

        Ok(raw
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32)
            .collect())
    }
}

// ─── InMemoryTokens ───────────────────────────────────────────────────────────
/// A split held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryTokens(pub Vec<u32>);

impl TokenSource for InMemoryTokens {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn read_window(&self, offset: usize, count: usize) -> TrainResult<Vec<u32>> {
        check_bounds(offset, count, self.0.len())?;
        Ok(self.0[offset..offset + count].to_vec())
    }
}

fn check_bounds(offset: usize, count: usize, len: usize) -> TrainResult<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(TrainError::Model(format!(
            "token read [{offset}, {offset}+{count}) is outside a stream of {len} tokens"
        ))),
    }
}

// ─── DatasetAccessor ──────────────────────────────────────────────────────────
/// Both splits of one corpus.
pub struct DatasetAccessor {
    train: Box<dyn TokenSource>,
    val:   Box<dyn TokenSource>,
}

impl DatasetAccessor {
    /// Open `train.bin` and `val.bin` under `dir`.
    pub fn open(dir: &Path) -> TrainResult<Self> {
        let train = TokenFile::open(dir, Split::Train)?;
        let val   = TokenFile::open(dir, Split::Val)?;
        tracing::info!(
            "Corpus '{}': {} train tokens, {} val tokens",
            dir.display(),
            train.len(),
            val.len()
        );
        Ok(Self::from_sources(Box::new(train), Box::new(val)))
    }

    pub fn from_sources(train: Box<dyn TokenSource>, val: Box<dyn TokenSource>) -> Self {
        Self { train, val }
    }

    pub fn split(&self, split: Split) -> &dyn TokenSource {
        match split {
            Split::Train => self.train.as_ref(),
            Split::Val   => self.val.as_ref(),
        }
    }
}

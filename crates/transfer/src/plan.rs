use serde::{Deserialize, Serialize};

use crate::{DEFAULT_PART_SIZE, TransferError};

/// Upper bound on the number of chunks in one plan (the S3 part limit).
pub const MAX_CHUNKS: usize = 10_000;

/// Chunking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkingConfig {
    pub enabled: bool,
    /// Size of every chunk except the last.
    pub part_size: u64,
    /// Files smaller than this are sent whole.
    pub min_file_size: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            part_size: DEFAULT_PART_SIZE,
            min_file_size: DEFAULT_PART_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// One request carries the whole file.
    Whole,
    /// Multi-part transaction that is combined at the end.
    Chunked,
}

/// A contiguous byte range `[start, end)` of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Ordered chunk descriptors for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    mode: PlanMode,
    file_size: u64,
    part_size: u64,
    descriptors: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    /// Splits `file_size` bytes according to `config`.
    ///
    /// Pure: the same inputs always yield the same plan, so a resumed
    /// session only needs its receipts, never the plan itself.
    pub fn compute(file_size: u64, config: &ChunkingConfig) -> Result<Self, TransferError> {
        if config.enabled && config.part_size == 0 {
            return Err(TransferError::InvalidPlan("part size must be positive".into()));
        }

        let count = if config.part_size == 0 {
            1
        } else {
            file_size.div_ceil(config.part_size)
        };
        let chunked = config.enabled && file_size >= config.min_file_size && count > 1;

        if !chunked {
            return Ok(Self {
                mode: PlanMode::Whole,
                file_size,
                part_size: file_size,
                descriptors: vec![ChunkDescriptor {
                    index: 0,
                    start: 0,
                    end: file_size,
                }],
            });
        }

        if count as usize > MAX_CHUNKS {
            return Err(TransferError::InvalidPlan(format!(
                "{count} chunks exceeds the limit of {MAX_CHUNKS}; raise the part size"
            )));
        }

        let descriptors = (0..count)
            .map(|i| {
                let start = i * config.part_size;
                ChunkDescriptor {
                    index: i as u32,
                    start,
                    end: (start + config.part_size).min(file_size),
                }
            })
            .collect();

        Ok(Self {
            mode: PlanMode::Chunked,
            file_size,
            part_size: config.part_size,
            descriptors,
        })
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn is_chunked(&self) -> bool {
        self.mode == PlanMode::Chunked
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Chunk size the plan was computed with (the file size for whole plans).
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[ChunkDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, index: u32) -> Option<&ChunkDescriptor> {
        self.descriptors.get(index as usize)
    }
}

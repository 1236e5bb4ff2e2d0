#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("Chunk size must be at least 1")]
    ZeroChunkSize,
}

/// A contiguous slice of the caller's input, tagged with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    pub index: usize,
    pub rows: Vec<T>,
}

/// Splits an input sequence into chunks of at most `chunk_size` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    chunk_size: usize,
}

impl ChunkPlanner {
    pub const DEFAULT_CHUNK_SIZE: usize = 1000;

    pub fn new(chunk_size: usize) -> Result<Self, PlanError> {
        if chunk_size == 0 {
            return Err(PlanError::ZeroChunkSize);
        }
        Ok(ChunkPlanner { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks `split` produces for `len` rows.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    pub fn split<T>(&self, rows: Vec<T>) -> Vec<Chunk<T>> {
        let mut chunks = Vec::with_capacity(self.chunk_count(rows.len()));
        let mut rows = rows.into_iter().peekable();

        while rows.peek().is_some() {
            let chunk: Vec<T> = rows.by_ref().take(self.chunk_size).collect();
            chunks.push(Chunk { index: chunks.len(), rows: chunk });
        }

        chunks
    }
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        ChunkPlanner { chunk_size: Self::DEFAULT_CHUNK_SIZE }
    }
}

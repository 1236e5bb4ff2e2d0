//! Bulk data synchronization: chunked parallel inserts through the native
//! loader and atomic staging-table updates.

pub mod chunk;
pub mod insert;
pub mod update;

pub use chunk::{Chunk, ChunkPlanner, PlanError};
pub use insert::{insert_bulk, BulkInsertError, ChunkError, ChunkFailure, InsertOptions, InsertReport};
pub use update::{update_bulk, BulkUpdateError, UpdateReport, UpdateStep};

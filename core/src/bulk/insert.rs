use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use futures::future::join_all;
use tokio::{sync::Semaphore, task::JoinError};
use tracing::{debug, error, info};

use crate::{
    bulk::chunk::{Chunk, ChunkPlanner, PlanError},
    database::store::{
        rollback_after_failure, BulkLoad, ColumnBuffer, Connector, StoreError,
    },
    schema::{Persistable, Schema, SchemaError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOptions {
    /// Rows per chunk, and per `COPY` statement inside a chunk.
    pub chunk_size: usize,
    /// Chunks loading at the same time.
    pub max_parallelism: usize,
    /// Lock the target table before each chunk is written.
    pub table_lock: bool,
}

impl InsertOptions {
    pub const DEFAULT_MAX_PARALLELISM: usize = 4;
}

impl Default for InsertOptions {
    fn default() -> Self {
        InsertOptions {
            chunk_size: ChunkPlanner::DEFAULT_CHUNK_SIZE,
            max_parallelism: Self::DEFAULT_MAX_PARALLELISM,
            table_lock: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub rows: u64,
    pub chunks: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum ChunkError {
    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("Chunk worker could not be joined: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug)]
pub struct ChunkFailure {
    pub index: usize,
    pub error: ChunkError,
}

#[derive(thiserror::Error, Debug)]
pub enum BulkInsertError {
    #[error("{0}")]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Plan(#[from] PlanError),

    #[error("Max parallelism must be at least 1")]
    ZeroParallelism,

    #[error(
        "{} chunk(s) failed, first was chunk {}: {} ({committed_chunks} of {total_chunks} chunks committed, {rows_committed} rows)",
        .failures.len(),
        .failures.first().map(|f| f.index).unwrap_or_default(),
        .failures.first().map(|f| f.error.to_string()).unwrap_or_default()
    )]
    ChunksFailed {
        /// Ordered by chunk index.
        failures: Vec<ChunkFailure>,
        committed_chunks: usize,
        total_chunks: usize,
        rows_committed: u64,
    },
}

impl BulkInsertError {
    pub fn failed_chunks(&self) -> Vec<usize> {
        match self {
            BulkInsertError::ChunksFailed { failures, .. } => {
                failures.iter().map(|f| f.index).collect()
            }
            _ => vec![],
        }
    }
}

/// Raises the stop flag when dropped before the chunk was marked done,
/// which covers a worker unwinding from a panic.
struct StopOnFailure {
    failed: Arc<AtomicBool>,
    succeeded: bool,
}

impl Drop for StopOnFailure {
    fn drop(&mut self) {
        if !self.succeeded {
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}

/// Writes one chunk in its own transaction on its own connection.
async fn load_chunk<T: Persistable>(
    connector: &dyn Connector,
    schema: &Schema<T>,
    chunk: &Chunk<T>,
    options: InsertOptions,
) -> Result<u64, StoreError> {
    let descriptor = schema.descriptor();

    let mut buffer = ColumnBuffer::new(descriptor.columns.clone());
    for row in &chunk.rows {
        buffer.push(schema.values(row))?;
    }

    let mut session = connector.open().await?;
    session.begin().await?;

    let load = BulkLoad {
        table: &descriptor.table_name,
        buffer: &buffer,
        table_lock: options.table_lock,
        batch_size: Some(options.chunk_size),
    };

    match session.bulk_load(load).await {
        Ok(written) => {
            session.commit().await?;
            Ok(written)
        }
        Err(e) => {
            rollback_after_failure(session.as_mut(), &format!("chunk {}", chunk.index)).await;
            Err(e)
        }
    }
}

/// Bulk inserts `rows` into the row type's table through the native loader.
///
/// The input is split into chunks, each written in its own transaction on a
/// dedicated connection with at most `max_parallelism` chunks in flight. The
/// call is not atomic: once a chunk fails no further chunks are dispatched,
/// but chunks that already committed stay committed and are reported in
/// [`BulkInsertError::ChunksFailed`].
pub async fn insert_bulk<T: Persistable>(
    connector: Arc<dyn Connector>,
    schema: Arc<Schema<T>>,
    rows: Vec<T>,
    options: InsertOptions,
) -> Result<InsertReport, BulkInsertError> {
    let planner = ChunkPlanner::new(options.chunk_size)?;
    if options.max_parallelism == 0 {
        return Err(BulkInsertError::ZeroParallelism);
    }

    if rows.is_empty() {
        return Ok(InsertReport::default());
    }

    let start = Instant::now();
    let table_name = schema.descriptor().table_name.clone();
    let chunks = planner.split(rows);
    let total_chunks = chunks.len();

    let semaphore = Arc::new(Semaphore::new(options.max_parallelism));
    let failed = Arc::new(AtomicBool::new(false));
    let dispatched = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(total_chunks);
    let mut dispatched_indices = Vec::with_capacity(total_chunks);

    for chunk in chunks {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        if failed.load(Ordering::SeqCst) {
            debug!(
                "{} - a chunk failed, not dispatching chunks from {} onwards",
                table_name, chunk.index
            );
            break;
        }

        let connector = Arc::clone(&connector);
        let schema = Arc::clone(&schema);
        let failed = Arc::clone(&failed);
        let in_flight = dispatched.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} - dispatching chunk {} ({} dispatched)", table_name, chunk.index, in_flight);

        dispatched_indices.push(chunk.index);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let mut stop = StopOnFailure { failed, succeeded: false };
            let result = load_chunk(connector.as_ref(), &schema, &chunk, options).await;
            stop.succeeded = result.is_ok();
            result
        }));
    }

    let mut failures = Vec::new();
    let mut committed_chunks = 0;
    let mut rows_committed = 0;

    for (index, joined) in dispatched_indices.into_iter().zip(join_all(handles).await) {
        let outcome = match joined {
            Ok(outcome) => outcome.map_err(ChunkError::from),
            Err(e) => Err(ChunkError::from(e)),
        };
        match outcome {
            Ok(written) => {
                committed_chunks += 1;
                rows_committed += written;
            }
            Err(error) => {
                error!("{} - chunk {} failed: {}", table_name, index, error);
                failures.push(ChunkFailure { index, error });
            }
        }
    }

    if !failures.is_empty() {
        failures.sort_by_key(|f| f.index);
        return Err(BulkInsertError::ChunksFailed {
            failures,
            committed_chunks,
            total_chunks,
            rows_committed,
        });
    }

    info!(
        "{} - bulk inserted {} rows in {} chunks - took {:?}",
        table_name,
        rows_committed,
        committed_chunks,
        start.elapsed()
    );

    Ok(InsertReport { rows: rows_committed, chunks: committed_chunks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{
            memory::{FailPoint, MemoryStore},
            value::{ColumnType, Record, RecordError, SqlValue},
        },
        schema::{
            tests::{product, Product},
            FieldSpec, SchemaIntrospector,
        },
    };

    fn setup() -> (MemoryStore, Arc<Schema<Product>>) {
        let store = MemoryStore::new().with_table("Product", Some("Id"));
        let schema = SchemaIntrospector::default().describe::<Product>().unwrap();
        (store, schema)
    }

    fn products(count: usize) -> Vec<Product> {
        (0..count).map(|i| product(0, &format!("item-{i}"))).collect()
    }

    fn options(chunk_size: usize, max_parallelism: usize) -> InsertOptions {
        InsertOptions { chunk_size, max_parallelism, table_lock: true }
    }

    #[tokio::test]
    async fn test_empty_input_performs_no_io() {
        let (store, schema) = setup();

        let report =
            insert_bulk(Arc::new(store.clone()), schema, vec![], InsertOptions::default()).await.unwrap();

        assert_eq!(report, InsertReport::default());
        assert_eq!(store.connections_opened(), 0);
        assert!(store.log().is_empty());
    }

    #[tokio::test]
    async fn test_rows_are_loaded_one_chunk_per_connection() {
        let (store, schema) = setup();

        let report =
            insert_bulk(Arc::new(store.clone()), schema, products(2500), options(1000, 4)).await.unwrap();

        assert_eq!(report, InsertReport { rows: 2500, chunks: 3 });
        assert_eq!(store.rows("Product").len(), 2500);
        assert_eq!(store.connections_opened(), 3);
        assert_eq!(store.count_in_log("LOCK"), 3);
        assert_eq!(store.count_in_log("COPY"), 3);
        assert_eq!(store.count_in_log("COMMIT"), 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_stops_dispatch_and_keeps_committed_chunks() {
        let (store, schema) = setup();
        store.fail_on(FailPoint::LoadContaining {
            column: "product_name".to_string(),
            value: SqlValue::from("item-15"),
        });

        let err = insert_bulk(Arc::new(store.clone()), schema, products(30), options(10, 1))
            .await
            .unwrap_err();

        match &err {
            BulkInsertError::ChunksFailed { committed_chunks, total_chunks, rows_committed, .. } => {
                assert_eq!(*committed_chunks, 1);
                assert_eq!(*total_chunks, 3);
                assert_eq!(*rows_committed, 10);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.failed_chunks(), vec![1]);
        assert_eq!(store.rows("Product").len(), 10);
        assert_eq!(store.connections_opened(), 2);
        assert_eq!(store.count_in_log("ROLLBACK"), 1);
    }

    #[tokio::test]
    async fn test_parallel_chunks_commit_independently() {
        let (store, schema) = setup();
        store.fail_on(FailPoint::LoadContaining {
            column: "product_name".to_string(),
            value: SqlValue::from("item-12"),
        });

        let err = insert_bulk(Arc::new(store.clone()), schema, products(30), options(10, 4))
            .await
            .unwrap_err();

        assert_eq!(err.failed_chunks(), vec![1]);
        let names: Vec<SqlValue> =
            store.rows("Product").iter().filter_map(|r| r.get("product_name").cloned()).collect();
        assert_eq!(names.len(), 20);
        assert!(!names.contains(&SqlValue::from("item-12")));
        assert!(names.contains(&SqlValue::from("item-25")));
    }

    struct Fragile {
        label: String,
    }

    impl Persistable for Fragile {
        const TYPE_NAME: &'static str = "Fragile";

        fn fields() -> Vec<FieldSpec<Self>> {
            vec![
                FieldSpec::scalar("id", ColumnType::Integer, |_: &Fragile| SqlValue::Null).primary_key(),
                FieldSpec::scalar("label", ColumnType::Text, |f: &Fragile| {
                    assert_ne!(f.label, "label-15", "unreadable row");
                    f.label.clone().into()
                }),
            ]
        }

        fn from_record(record: &Record) -> Result<Self, RecordError> {
            Ok(Fragile { label: record.value("label")? })
        }
    }

    #[tokio::test]
    async fn test_panicked_worker_is_reported_with_committed_counts() {
        let store = MemoryStore::new().with_table("Fragile", Some("id"));
        let schema = SchemaIntrospector::default().describe::<Fragile>().unwrap();
        let rows = (0..30).map(|i| Fragile { label: format!("label-{i}") }).collect();

        let err = insert_bulk(Arc::new(store.clone()), schema, rows, options(10, 1))
            .await
            .unwrap_err();

        match &err {
            BulkInsertError::ChunksFailed {
                failures, committed_chunks, total_chunks, rows_committed,
            } => {
                assert!(matches!(failures[0].error, ChunkError::Worker(_)));
                assert_eq!(*committed_chunks, 1);
                assert_eq!(*total_chunks, 3);
                assert_eq!(*rows_committed, 10);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.failed_chunks(), vec![1]);
        assert_eq!(store.rows("Fragile").len(), 10);
    }

    #[tokio::test]
    async fn test_copy_is_batched_by_chunk_size() {
        let (store, schema) = setup();

        insert_bulk(Arc::new(store.clone()), schema, products(7), options(3, 2)).await.unwrap();

        assert_eq!(store.count_in_log("COPY"), 3);
        assert_eq!(store.rows("Product").len(), 7);
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected_before_io() {
        let (store, schema) = setup();

        let err = insert_bulk(Arc::new(store.clone()), schema.clone(), products(3), options(0, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, BulkInsertError::Plan(PlanError::ZeroChunkSize)));

        let err = insert_bulk(Arc::new(store.clone()), schema, products(3), options(10, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, BulkInsertError::ZeroParallelism));
        assert_eq!(store.connections_opened(), 0);
    }
}

use async_trait::async_trait;
use bb8::RunError;
use tokio_postgres::Error as PgError;
use tracing::error;

use crate::database::{
    postgres::client::PostgresConnectionError,
    statement::{Query, Statement},
    value::{Record, SqlValue},
};
use crate::schema::ColumnDescriptor;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Connection(#[from] PostgresConnectionError),

    #[error("PgError {0}")]
    PgError(#[from] PgError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] RunError<PgError>),

    #[error("Could not decode column {column}: {message}")]
    Decode { column: String, message: String },

    #[error("Value for column {column} is {found} but the column is {expected}")]
    ValueMismatch { column: String, expected: &'static str, found: &'static str },

    #[error("Row has {found} values but {expected} columns were declared")]
    RowWidth { expected: usize, found: usize },

    #[error("Store rejected the operation: {0}")]
    Rejected(String),
}

/// Column-mapped tabular buffer handed to the native bulk loader.
///
/// Each row holds exactly one value per column, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBuffer {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ColumnBuffer {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        ColumnBuffer { columns, rows: Vec::new() }
    }

    /// Appends a row, checking its width and that every value encodes as its column.
    pub fn push(&mut self, row: Vec<SqlValue>) -> Result<(), StoreError> {
        if row.len() != self.columns.len() {
            return Err(StoreError::RowWidth { expected: self.columns.len(), found: row.len() });
        }

        for (column, value) in self.columns.iter().zip(row.iter()) {
            if !value.fits(column.store_type) {
                return Err(StoreError::ValueMismatch {
                    column: column.name.clone(),
                    expected: column.store_type.as_str(),
                    found: value.raw_name(),
                });
            }
        }

        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One native bulk-load write.
#[derive(Debug, Clone, Copy)]
pub struct BulkLoad<'a> {
    pub table: &'a str,
    pub buffer: &'a ColumnBuffer,
    /// Take a table-level lock before loading.
    pub table_lock: bool,
    /// Maximum rows per load statement, `None` for a single statement.
    pub batch_size: Option<usize>,
}

/// Opens sessions against the store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// A connection owned by the caller alone, closed when the session drops.
    async fn open(&self) -> Result<Box<dyn Session>, StoreError>;

    /// A connection suited for short repository calls, pooled when the backend pools.
    async fn acquire(&self) -> Result<Box<dyn Session>, StoreError> {
        self.open().await
    }
}

/// A single store connection.
///
/// Sessions are exclusively owned; dropping one releases the connection on
/// every exit path, rolling back whatever transaction is still open.
#[async_trait]
pub trait Session: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError>;

    /// Runs an insert carrying a `returning` column and yields that column
    /// for every inserted row, in insert order.
    async fn insert_returning(&mut self, statement: &Statement) -> Result<Vec<SqlValue>, StoreError>;

    async fn bulk_load(&mut self, load: BulkLoad<'_>) -> Result<u64, StoreError>;

    async fn query(&mut self, query: &Query) -> Result<Vec<Record>, StoreError>;

    async fn count(&mut self, query: &Query) -> Result<u64, StoreError>;
}

/// Rolls back after a failed operation. A rollback failure is logged and
/// otherwise ignored so the caller can surface the original error.
pub async fn rollback_after_failure(session: &mut dyn Session, operation: &str) {
    if let Err(e) = session.rollback().await {
        error!("{} - rollback failed: {}", operation, e);
    }
}

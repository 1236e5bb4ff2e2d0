// public
pub mod bulk;
pub mod repository;
pub mod schema;

mod clock;
pub use clock::{Clock, ClockError, DEFAULT_UTC_OFFSET};

mod config;
pub use config::{read_config, ConfigError, SyncConfig};

mod context;
pub use context::{DataContext, DataContextError};

mod database;
pub use database::{
    filter::{CompareOp, Filter},
    postgres::{
        client::{connection_string, PostgresClient, PostgresConnectionError, PostgresOptions},
        session::PostgresSession,
    },
    statement::{OrderBy, Query, QueryOrder, Statement},
    store::{BulkLoad, ColumnBuffer, Connector, Session, StoreError},
    value::{ColumnType, FromSqlValue, Record, RecordError, SqlValue, ValueError},
};

mod logger;
pub use logger::{setup_config_logger, setup_debug_logger, setup_info_logger, setup_logger};

pub use bulk::{
    insert_bulk, update_bulk, BulkInsertError, BulkUpdateError, Chunk, ChunkError, ChunkFailure,
    ChunkPlanner, InsertOptions, InsertReport, PlanError, UpdateReport, UpdateStep,
};
pub use repository::{
    Paginated, PaginationError, ProjectedRecord, Projection, ProjectionError, Repository,
    RepositoryError,
};
pub use schema::{
    ColumnDescriptor, DeletionPolicy, FieldKind, FieldSpec, Persistable, RowTypeDescriptor,
    Schema, SchemaError, SchemaIntrospector,
};

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use chrono;
pub use rust_decimal::Decimal;
pub use tokio_postgres::types::Type as PgType;
pub use tracing::level_filters::LevelFilter;

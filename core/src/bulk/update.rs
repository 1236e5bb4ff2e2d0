use std::{fmt, time::Instant};

use tracing::{debug, error, info};

use crate::{
    database::{
        statement::Statement,
        store::{rollback_after_failure, BulkLoad, ColumnBuffer, Connector, Session, StoreError},
    },
    schema::{Persistable, RowTypeDescriptor, Schema, SchemaError},
};

/// The stage of a bulk update that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    Connect,
    Begin,
    CreateStaging,
    LoadStaging,
    Merge,
    DropStaging,
    Commit,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            UpdateStep::Connect => "opening the connection",
            UpdateStep::Begin => "starting the transaction",
            UpdateStep::CreateStaging => "creating the staging table",
            UpdateStep::LoadStaging => "loading the staging table",
            UpdateStep::Merge => "merging into the target table",
            UpdateStep::DropStaging => "dropping the staging table",
            UpdateStep::Commit => "committing",
        };
        write!(f, "{}", step)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BulkUpdateError {
    #[error("{0}")]
    Schema(#[from] SchemaError),

    #[error("Could not stage rows: {0}")]
    Stage(StoreError),

    #[error("Bulk update failed while {step}: {source}")]
    Step {
        step: UpdateStep,
        #[source]
        source: StoreError,
    },
}

impl BulkUpdateError {
    pub fn step(&self) -> Option<UpdateStep> {
        match self {
            BulkUpdateError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub rows_staged: u64,
    pub rows_updated: u64,
}

/// Temp table name for one update call; unique per call so concurrent
/// updates on the same connection pool never collide.
fn staging_table_name(table_name: &str) -> String {
    let base: String = table_name
        .rsplit('.')
        .next()
        .unwrap_or(table_name)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("staging_{}_{}", base, rand::random::<u32>())
}

async fn stage_and_merge(
    session: &mut dyn Session,
    descriptor: &RowTypeDescriptor,
    key: &str,
    staging: &str,
    buffer: &ColumnBuffer,
) -> Result<UpdateReport, (UpdateStep, StoreError)> {
    session
        .execute(&Statement::CreateStaging {
            table: staging.to_string(),
            columns: buffer.columns.clone(),
        })
        .await
        .map_err(|e| (UpdateStep::CreateStaging, e))?;

    let load = BulkLoad { table: staging, buffer, table_lock: false, batch_size: None };
    let rows_staged = session.bulk_load(load).await.map_err(|e| (UpdateStep::LoadStaging, e))?;

    let rows_updated = session
        .execute(&Statement::Merge {
            target: descriptor.table_name.clone(),
            staging: staging.to_string(),
            key: key.to_string(),
            columns: descriptor.column_names(),
        })
        .await
        .map_err(|e| (UpdateStep::Merge, e))?;

    session
        .execute(&Statement::DropTable { table: staging.to_string() })
        .await
        .map_err(|e| (UpdateStep::DropStaging, e))?;

    Ok(UpdateReport { rows_staged, rows_updated })
}

/// Updates every row whose key matches an input row, as one atomic unit.
///
/// Rows are copied into a temporary staging table and merged into the target
/// on the primary key; rows with no match are ignored. Either every matched
/// row is updated or none is.
pub async fn update_bulk<T: Persistable>(
    connector: &dyn Connector,
    schema: &Schema<T>,
    rows: &[T],
) -> Result<UpdateReport, BulkUpdateError> {
    let descriptor = schema.descriptor();
    let key = descriptor.key_column()?;

    if rows.is_empty() {
        return Ok(UpdateReport::default());
    }

    let start = Instant::now();
    let mut buffer = ColumnBuffer::new(descriptor.all_columns());
    for row in rows {
        buffer.push(schema.values_with_key(row)?).map_err(BulkUpdateError::Stage)?;
    }

    let staging = staging_table_name(&descriptor.table_name);
    debug!("{} - staging {} rows in {}", descriptor.table_name, buffer.len(), staging);

    let mut session = connector
        .open()
        .await
        .map_err(|source| BulkUpdateError::Step { step: UpdateStep::Connect, source })?;
    session
        .begin()
        .await
        .map_err(|source| BulkUpdateError::Step { step: UpdateStep::Begin, source })?;

    let report = match stage_and_merge(session.as_mut(), descriptor, &key.name, &staging, &buffer)
        .await
    {
        Ok(report) => report,
        Err((step, source)) => {
            error!("{} - bulk update failed while {}: {}", descriptor.table_name, step, source);
            rollback_after_failure(session.as_mut(), &descriptor.table_name).await;
            return Err(BulkUpdateError::Step { step, source });
        }
    };

    session
        .commit()
        .await
        .map_err(|source| BulkUpdateError::Step { step: UpdateStep::Commit, source })?;

    info!(
        "{} - bulk updated {} of {} rows - took {:?}",
        descriptor.table_name,
        report.rows_updated,
        report.rows_staged,
        start.elapsed()
    );

    Ok(report)
}

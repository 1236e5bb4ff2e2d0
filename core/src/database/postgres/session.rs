use std::sync::Arc;

use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::pin_mut;
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use tokio::{runtime::Handle as RuntimeHandle, task::JoinHandle};
use tokio_postgres::{
    binary_copy::BinaryCopyInWriter,
    types::{FromSql, ToSql, Type as PgType},
    Client, Row,
};
use tracing::{debug, error};

use crate::database::{
    statement::{copy_in_sql, lock_table_sql, Query, Statement},
    store::{BulkLoad, Session, StoreError},
    value::{ColumnType, Record, SqlValue},
};

type PooledClient = PooledConnection<'static, PostgresConnectionManager<MakeTlsConnector>>;

enum Connection {
    Dedicated { client: Client, _connection: JoinHandle<()> },
    Pooled(Option<PooledClient>),
}

/// A PostgreSQL connection, either dedicated or borrowed from the pool.
pub struct PostgresSession {
    connection: Connection,
    in_transaction: bool,
}

impl PostgresSession {
    pub(crate) fn dedicated(client: Client, connection: JoinHandle<()>) -> Self {
        PostgresSession {
            connection: Connection::Dedicated { client, _connection: connection },
            in_transaction: false,
        }
    }

    pub(crate) fn pooled(client: PooledClient) -> Self {
        PostgresSession { connection: Connection::Pooled(Some(client)), in_transaction: false }
    }

    fn client(&self) -> Result<&Client, StoreError> {
        match &self.connection {
            Connection::Dedicated { client, .. } => Ok(client),
            Connection::Pooled(Some(client)) => Ok(client),
            Connection::Pooled(None) => {
                Err(StoreError::Rejected("pooled connection already released".to_string()))
            }
        }
    }
}

fn params_ref(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|param| param as &(dyn ToSql + Sync)).collect()
}

fn column_type_of(ty: &PgType) -> Option<ColumnType> {
    if *ty == PgType::VARCHAR || *ty == PgType::BPCHAR || *ty == PgType::NAME {
        return Some(ColumnType::Text);
    }

    [
        ColumnType::Bool,
        ColumnType::SmallInt,
        ColumnType::Integer,
        ColumnType::BigInt,
        ColumnType::Real,
        ColumnType::Double,
        ColumnType::Decimal,
        ColumnType::Text,
        ColumnType::Timestamp,
        ColumnType::TimestampTz,
        ColumnType::Date,
        ColumnType::Time,
    ]
    .into_iter()
    .find(|column_type| column_type.to_type() == *ty)
}

fn read<'a, V>(row: &'a Row, index: usize) -> Result<SqlValue, StoreError>
where
    V: FromSql<'a> + Into<SqlValue>,
{
    row.try_get::<_, Option<V>>(index).map(SqlValue::from).map_err(|e| StoreError::Decode {
        column: row.columns()[index].name().to_string(),
        message: e.to_string(),
    })
}

fn decode_value(row: &Row, index: usize) -> Result<SqlValue, StoreError> {
    let column = &row.columns()[index];
    let column_type = column_type_of(column.type_()).ok_or_else(|| StoreError::Decode {
        column: column.name().to_string(),
        message: format!("unsupported column type {}", column.type_()),
    })?;

    match column_type {
        ColumnType::Bool => read::<bool>(row, index),
        ColumnType::SmallInt => read::<i16>(row, index),
        ColumnType::Integer => read::<i32>(row, index),
        ColumnType::BigInt => read::<i64>(row, index),
        ColumnType::Real => read::<f32>(row, index),
        ColumnType::Double => read::<f64>(row, index),
        ColumnType::Decimal => read::<Decimal>(row, index),
        ColumnType::Text => read::<String>(row, index),
        ColumnType::Timestamp => read::<NaiveDateTime>(row, index),
        ColumnType::TimestampTz => read::<DateTime<FixedOffset>>(row, index),
        ColumnType::Date => read::<NaiveDate>(row, index),
        ColumnType::Time => read::<NaiveTime>(row, index),
    }
}

fn decode_row(columns: &Arc<[String]>, row: &Row) -> Result<Record, StoreError> {
    let values = (0..row.len()).map(|index| decode_value(row, index)).collect::<Result<_, _>>()?;
    Ok(Record::new(columns.clone(), values))
}

#[async_trait]
impl Session for PostgresSession {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.client()?.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let result = self.client()?.batch_execute("COMMIT").await;
        self.in_transaction = false;
        Ok(result?)
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let result = self.client()?.batch_execute("ROLLBACK").await;
        self.in_transaction = false;
        Ok(result?)
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let (sql, params) = statement.to_sql();
        debug!("Executing {} statement: {}", statement.kind(), sql);
        let affected = self.client()?.execute(sql.as_str(), &params_ref(&params)).await?;
        Ok(affected)
    }

    async fn insert_returning(&mut self, statement: &Statement) -> Result<Vec<SqlValue>, StoreError> {
        let (sql, params) = statement.to_sql();
        debug!("Executing {} statement: {}", statement.kind(), sql);
        let rows = self.client()?.query(sql.as_str(), &params_ref(&params)).await?;
        rows.iter().map(|row| decode_value(row, 0)).collect()
    }

    async fn bulk_load(&mut self, load: BulkLoad<'_>) -> Result<u64, StoreError> {
        if load.buffer.is_empty() {
            return Ok(0);
        }

        let client = self.client()?;
        if load.table_lock {
            client.batch_execute(&lock_table_sql(load.table)).await?;
        }

        let column_types: Vec<PgType> =
            load.buffer.columns.iter().map(|column| column.store_type.to_type()).collect();
        let copy_sql = copy_in_sql(load.table, &load.buffer.column_names());
        let batch_size = load.batch_size.unwrap_or(load.buffer.len()).max(1);

        let mut written = 0;
        for batch in load.buffer.rows.chunks(batch_size) {
            let sink = client.copy_in(copy_sql.as_str()).await?;
            let writer = BinaryCopyInWriter::new(sink, &column_types);
            pin_mut!(writer);

            for row in batch {
                let row_refs = params_ref(row);
                writer.as_mut().write(&row_refs).await?;
            }

            written += writer.finish().await?;
        }

        debug!("Bulk loaded {} rows into {}", written, load.table);
        Ok(written)
    }

    async fn query(&mut self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let (sql, params) = query.to_sql();
        debug!("Querying: {}", sql);
        let rows = self.client()?.query(sql.as_str(), &params_ref(&params)).await?;

        let columns: Arc<[String]> = query.columns.clone().into();
        rows.iter().map(|row| decode_row(&columns, row)).collect()
    }

    async fn count(&mut self, query: &Query) -> Result<u64, StoreError> {
        let (sql, params) = query.to_count_sql();
        let row = self.client()?.query_one(sql.as_str(), &params_ref(&params)).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }

        // A dedicated connection ends its transaction when the socket closes.
        if let Connection::Pooled(slot) = &mut self.connection {
            if let Some(client) = slot.take() {
                match RuntimeHandle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = client.batch_execute("ROLLBACK").await {
                                error!("Failed to roll back abandoned transaction: {}", e);
                            }
                        });
                    }
                    Err(_) => error!("Pooled session dropped mid-transaction outside a runtime"),
                }
            }
        }
    }
}

//! Generic data access over one row type.
//!
//! Reads go through a pooled session and respect the row type's deletion
//! policy: soft-deleted rows are invisible. Writes stamp creation/update
//! times from the context clock.

mod pagination;
mod projection;

use std::sync::Arc;

pub use pagination::{page_offset, Paginated, PaginationError};
pub use projection::{ProjectedRecord, Projection, ProjectionError};
use tracing::debug;

use crate::{
    bulk::{
        insert_bulk, update_bulk, BulkInsertError, BulkUpdateError, ChunkPlanner, InsertOptions,
        InsertReport, UpdateReport,
    },
    clock::Clock,
    database::{
        filter::Filter,
        statement::{OrderBy, Query, Statement},
        store::{rollback_after_failure, Connector, Session, StoreError},
        value::{ColumnType, Record, RecordError, SqlValue},
    },
    schema::{DeletionPolicy, Persistable, RowTypeDescriptor, Schema, SchemaError},
};

/// Bound parameters PostgreSQL accepts in one statement.
const MAX_BIND_PARAMETERS: usize = u16::MAX as usize;

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("{0}")]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Projection(#[from] ProjectionError),

    #[error("{0}")]
    Pagination(#[from] PaginationError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("Could not read row: {0}")]
    Record(#[from] RecordError),

    #[error("{0}")]
    BulkInsert(#[from] BulkInsertError),

    #[error("{0}")]
    BulkUpdate(#[from] BulkUpdateError),
}

pub struct Repository<T> {
    connector: Arc<dyn Connector>,
    schema: Arc<Schema<T>>,
    clock: Clock,
    insert_options: InsertOptions,
}

impl<T: Persistable> Repository<T> {
    pub fn new(
        connector: Arc<dyn Connector>,
        schema: Arc<Schema<T>>,
        clock: Clock,
        insert_options: InsertOptions,
    ) -> Self {
        Repository { connector, schema, clock, insert_options }
    }

    pub fn descriptor(&self) -> &RowTypeDescriptor {
        self.schema.descriptor()
    }

    /// A projection over this repository's row type, see [`Projection::new`].
    pub fn projection<I, S>(&self, columns: I) -> Result<Projection<T>, ProjectionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::new(&self.schema, columns)
    }

    fn table(&self) -> &str {
        &self.descriptor().table_name
    }

    fn ensure_column(&self, column: &str) -> Result<(), ProjectionError> {
        if self.descriptor().resolves(column) {
            Ok(())
        } else {
            Err(ProjectionError::UnknownColumn {
                type_name: T::TYPE_NAME,
                column: column.to_string(),
            })
        }
    }

    /// Validates the caller's filter and adds the soft-delete visibility rule.
    fn visible(&self, filter: Option<Filter>) -> Result<Option<Filter>, ProjectionError> {
        if let Some(filter) = &filter {
            for column in filter.columns() {
                self.ensure_column(column)?;
            }
        }

        let hidden = match self.descriptor().deletion_policy {
            DeletionPolicy::Soft { column } => Some(Filter::is_null(column)),
            DeletionPolicy::Hard => None,
        };

        Ok(Filter::and_optional(filter, hidden))
    }

    fn entity_query(&self, filter: Option<Filter>) -> Result<Query, RepositoryError> {
        let columns = self.descriptor().all_columns().into_iter().map(|c| c.name).collect();
        Ok(Query::select(self.table(), columns).filter(self.visible(filter)?))
    }

    fn validated_order(&self, order: OrderBy) -> Result<OrderBy, ProjectionError> {
        self.ensure_column(&order.column)?;
        Ok(order)
    }

    fn key_filter(&self, entity: &T) -> Result<Filter, SchemaError> {
        let key = self.descriptor().key_column()?;
        Ok(Filter::eq(&key.name, self.schema.key_value(entity)?))
    }

    async fn session(&self) -> Result<Box<dyn Session>, StoreError> {
        self.connector.acquire().await
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<T>, RepositoryError> {
        let records = self.session().await?.query(query).await?;
        Ok(records.iter().map(T::from_record).collect::<Result<_, _>>()?)
    }

    /// Runs `statements` on one session, inside a transaction when there is more than one.
    async fn run(&self, statements: Vec<Statement>) -> Result<u64, RepositoryError> {
        let mut session = self.session().await?;

        if statements.len() == 1 {
            return Ok(session.execute(&statements[0]).await?);
        }

        session.begin().await?;
        let mut affected = 0;
        for statement in &statements {
            match session.execute(statement).await {
                Ok(rows) => affected += rows,
                Err(e) => {
                    rollback_after_failure(session.as_mut(), self.table()).await;
                    return Err(e.into());
                }
            }
        }
        session.commit().await?;

        Ok(affected)
    }

    /// Inserts `entities` like [`Self::run`] and hands every generated key back to its entity.
    async fn run_inserts(&self, entities: &mut [T]) -> Result<u64, RepositoryError> {
        let statements = self.insert_statements(&entities.iter().collect::<Vec<_>>());
        let Some(key) = self.descriptor().key.as_ref() else {
            return self.run(statements).await;
        };

        let mut session = self.session().await?;
        let in_transaction = statements.len() > 1;
        if in_transaction {
            session.begin().await?;
        }

        let mut keys = Vec::with_capacity(entities.len());
        for statement in &statements {
            match session.insert_returning(statement).await {
                Ok(returned) => keys.extend(returned),
                Err(e) => {
                    if in_transaction {
                        rollback_after_failure(session.as_mut(), self.table()).await;
                    }
                    return Err(e.into());
                }
            }
        }

        if in_transaction {
            session.commit().await?;
        }

        for (entity, value) in entities.iter_mut().zip(&keys) {
            entity
                .set_key(value)
                .map_err(|source| RecordError::Value { column: key.name.clone(), source })?;
        }

        Ok(keys.len() as u64)
    }

    /// The first row matching `filter`.
    pub async fn find(&self, filter: Option<Filter>) -> Result<Option<T>, RepositoryError> {
        let query = self.entity_query(filter)?.limit(1);
        Ok(self.fetch(&query).await?.into_iter().next())
    }

    pub async fn find_projected(
        &self,
        projection: &Projection<T>,
        filter: Option<Filter>,
    ) -> Result<Option<ProjectedRecord>, RepositoryError> {
        Ok(self.get_projected(projection, filter, Some(1)).await?.into_iter().next())
    }

    /// Rows matching `filter`, reading only the projected columns.
    pub async fn get_projected(
        &self,
        projection: &Projection<T>,
        filter: Option<Filter>,
        limit: Option<u64>,
    ) -> Result<Vec<ProjectedRecord>, RepositoryError> {
        let mut query =
            Query::select(self.table(), projection.columns().to_vec()).filter(self.visible(filter)?);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        let records: Vec<Record> = self.session().await?.query(&query).await?;
        Ok(records.into_iter().map(ProjectedRecord::new).collect())
    }

    pub async fn get(&self, filter: Option<Filter>) -> Result<Vec<T>, RepositoryError> {
        let query = self.entity_query(filter)?;
        self.fetch(&query).await
    }

    pub async fn get_with_order(
        &self,
        order: OrderBy,
        filter: Option<Filter>,
    ) -> Result<Vec<T>, RepositoryError> {
        let order = self.validated_order(order)?;
        let query = self.entity_query(filter)?.order_by(Some(order));
        self.fetch(&query).await
    }

    pub async fn count(&self, filter: Option<Filter>) -> Result<u64, RepositoryError> {
        let query = self.entity_query(filter)?;
        Ok(self.session().await?.count(&query).await?)
    }

    pub async fn exists(&self, filter: Option<Filter>) -> Result<bool, RepositoryError> {
        Ok(self.count(filter).await? > 0)
    }

    /// One page of rows, ordered by the key.
    pub async fn paginate(
        &self,
        page_num: u64,
        page_size: u64,
        filter: Option<Filter>,
    ) -> Result<Paginated<T>, RepositoryError> {
        let order = self.descriptor().key.as_ref().map(|key| OrderBy::asc(&key.name));
        self.paginate_query(page_num, page_size, order, filter).await
    }

    pub async fn paginate_with_order(
        &self,
        page_num: u64,
        page_size: u64,
        order: OrderBy,
        filter: Option<Filter>,
    ) -> Result<Paginated<T>, RepositoryError> {
        let order = self.validated_order(order)?;
        self.paginate_query(page_num, page_size, Some(order), filter).await
    }

    async fn paginate_query(
        &self,
        page_num: u64,
        page_size: u64,
        order: Option<OrderBy>,
        filter: Option<Filter>,
    ) -> Result<Paginated<T>, RepositoryError> {
        if page_size == 0 {
            return Err(PaginationError::ZeroPageSize.into());
        }

        let query = self.entity_query(filter)?.order_by(order);
        let mut session = self.session().await?;

        let total = session.count(&query).await?;
        if total == 0 {
            return Ok(Paginated::empty(page_size));
        }

        let offset = page_offset(page_num, page_size, total);
        debug!("{} - page {} of size {} starts at row {}", self.table(), page_num, page_size, offset);

        let records = session.query(&query.limit(page_size).offset(offset)).await?;
        let items = records.iter().map(T::from_record).collect::<Result<Vec<_>, _>>()?;

        Ok(Paginated::from_count(items, total, offset, page_size))
    }

    fn insert_statements(&self, entities: &[&T]) -> Vec<Statement> {
        let descriptor = self.descriptor();
        let rows_per_statement = (MAX_BIND_PARAMETERS / descriptor.columns.len()).max(1);
        let planner = ChunkPlanner::new(rows_per_statement).unwrap_or_default();

        planner
            .split(entities.iter().map(|entity| self.schema.values(entity)).collect())
            .into_iter()
            .map(|chunk| Statement::Insert {
                table: descriptor.table_name.clone(),
                columns: descriptor.column_names(),
                rows: chunk.rows,
                returning: descriptor.key.as_ref().map(|key| key.name.clone()),
            })
            .collect()
    }

    fn update_statement(&self, entity: &T) -> Result<Statement, SchemaError> {
        let descriptor = self.descriptor();
        let assignments = descriptor
            .columns
            .iter()
            .zip(self.schema.values(entity))
            .filter(|(column, _)| !descriptor.is_insert_only(&column.name))
            .map(|(column, value)| (column.name.clone(), value))
            .collect();

        Ok(Statement::Update {
            table: descriptor.table_name.clone(),
            assignments,
            filter: self.key_filter(entity)?,
        })
    }

    fn delete_statement(&self, entity: &mut T) -> Result<Statement, SchemaError> {
        match self.descriptor().deletion_policy {
            DeletionPolicy::Soft { column } => {
                let now = self.clock.now();
                entity.mark_deleted(now);
                entity.stamp_updated(now);

                let deleted_at = match self.descriptor().column(column).map(|c| c.store_type) {
                    Some(ColumnType::Timestamp) => SqlValue::from(now.naive_local()),
                    _ => SqlValue::from(now),
                };

                let mut statement = self.update_statement(entity)?;
                if let Statement::Update { assignments, .. } = &mut statement {
                    match assignments.iter_mut().find(|(name, _)| name == column) {
                        Some((_, value)) => *value = deleted_at,
                        None => assignments.push((column.to_string(), deleted_at)),
                    }
                }
                Ok(statement)
            }
            DeletionPolicy::Hard => Ok(Statement::Delete {
                table: self.table().to_string(),
                filter: self.key_filter(entity)?,
            }),
        }
    }

    fn stamp_new(&self, entity: &mut T) {
        let now = self.clock.now();
        entity.stamp_created(now);
        entity.stamp_updated(now);
    }

    /// Inserts `entity` and writes the generated key back to it.
    pub async fn insert(&self, entity: &mut T) -> Result<u64, RepositoryError> {
        self.stamp_new(entity);
        self.run_inserts(std::slice::from_mut(entity)).await
    }

    /// Inserts every entity in one transaction.
    pub async fn insert_range(&self, entities: &mut [T]) -> Result<u64, RepositoryError> {
        if entities.is_empty() {
            return Ok(0);
        }

        entities.iter_mut().for_each(|entity| self.stamp_new(entity));
        self.run_inserts(entities).await
    }

    pub async fn update(&self, entity: &mut T) -> Result<u64, RepositoryError> {
        entity.stamp_updated(self.clock.now());
        self.run(vec![self.update_statement(entity)?]).await
    }

    /// Updates every entity in one transaction.
    pub async fn update_range(&self, entities: &mut [T]) -> Result<u64, RepositoryError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now();
        let statements = entities
            .iter_mut()
            .map(|entity| {
                entity.stamp_updated(now);
                self.update_statement(entity)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.run(statements).await
    }

    /// Soft-deletes or removes `entity` according to the row type's deletion policy.
    pub async fn delete(&self, entity: &mut T) -> Result<u64, RepositoryError> {
        self.run(vec![self.delete_statement(entity)?]).await
    }

    /// Deletes every entity in one transaction.
    pub async fn delete_range(&self, entities: &mut [T]) -> Result<u64, RepositoryError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let statements = entities
            .iter_mut()
            .map(|entity| self.delete_statement(entity))
            .collect::<Result<Vec<_>, _>>()?;

        self.run(statements).await
    }

    /// Bulk inserts through the native loader, see [`insert_bulk`].
    ///
    /// `chunk_size` and `max_parallelism` fall back to the configured values.
    pub async fn insert_bulk(
        &self,
        rows: Vec<T>,
        chunk_size: Option<usize>,
        max_parallelism: Option<usize>,
    ) -> Result<InsertReport, RepositoryError> {
        let options = InsertOptions {
            chunk_size: chunk_size.unwrap_or(self.insert_options.chunk_size),
            max_parallelism: max_parallelism.unwrap_or(self.insert_options.max_parallelism),
            table_lock: self.insert_options.table_lock,
        };

        Ok(insert_bulk(Arc::clone(&self.connector), Arc::clone(&self.schema), rows, options).await?)
    }

    /// Atomic set-based update, see [`update_bulk`].
    pub async fn update_bulk(&self, rows: &[T]) -> Result<UpdateReport, RepositoryError> {
        Ok(update_bulk(self.connector.as_ref(), &self.schema, rows).await?)
    }
}

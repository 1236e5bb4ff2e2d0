use std::marker::PhantomData;

use crate::{
    database::value::{FromSqlValue, Record, RecordError, SqlValue},
    schema::{Persistable, Schema},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("{type_name} has no persisted column named {column}")]
    UnknownColumn { type_name: &'static str, column: String },

    #[error("Projection over {0} selects no columns")]
    Empty(&'static str),
}

/// A validated subset of a row type's columns to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection<T> {
    columns: Vec<String>,
    _row: PhantomData<fn() -> T>,
}

impl<T: Persistable> Projection<T> {
    /// Every name must be a persisted column of `T` (its key included).
    pub fn new<I, S>(schema: &Schema<T>, columns: I) -> Result<Self, ProjectionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let descriptor = schema.descriptor();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();

        if columns.is_empty() {
            return Err(ProjectionError::Empty(T::TYPE_NAME));
        }

        if let Some(unknown) = columns.iter().find(|c| !descriptor.resolves(c)) {
            return Err(ProjectionError::UnknownColumn {
                type_name: T::TYPE_NAME,
                column: unknown.clone(),
            });
        }

        Ok(Projection { columns, _row: PhantomData })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// A row read through a [`Projection`], holding only the selected columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRecord {
    record: Record,
}

impl ProjectedRecord {
    pub(crate) fn new(record: Record) -> Self {
        ProjectedRecord { record }
    }

    pub fn columns(&self) -> &[String] {
        self.record.columns()
    }

    pub fn raw(&self, column: &str) -> Option<&SqlValue> {
        self.record.get(column)
    }

    pub fn get<V: FromSqlValue>(&self, column: &str) -> Result<V, RecordError> {
        self.record.value(column)
    }
}

//! Row-type descriptions shared by the bulk engines and the repository.
//!
//! A row type declares its fields once through [`Persistable::fields`]; the
//! [`SchemaIntrospector`] turns that declaration into a [`RowTypeDescriptor`]
//! the first time the type is used and hands out the cached copy afterwards.

mod field;

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, FixedOffset};
pub use field::{FieldKind, FieldSpec};
use tracing::debug;

use crate::database::value::{ColumnType, Record, RecordError, SqlValue, ValueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub store_type: ColumnType,
    pub nullable: bool,
}

/// How a delete request is carried out for a row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Physical removal of the row.
    Hard,
    /// Stamp `column` with the deletion time and keep the row.
    Soft { column: &'static str },
}

/// A row shape that can be persisted.
///
/// Implementors list their fields in declaration order; everything the
/// engines need (columns, key, table) is derived from that list.
pub trait Persistable: Sized + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    /// Explicit table-name override, takes precedence over configuration.
    const TABLE: Option<&'static str> = None;

    fn fields() -> Vec<FieldSpec<Self>>;

    fn from_record(record: &Record) -> Result<Self, RecordError>;

    /// Receives the key the store generated when the row was inserted.
    fn set_key(&mut self, _key: &SqlValue) -> Result<(), ValueError> {
        Ok(())
    }

    fn deletion_policy() -> DeletionPolicy {
        DeletionPolicy::Hard
    }

    fn mark_deleted(&mut self, _at: DateTime<FixedOffset>) {}

    fn stamp_created(&mut self, _at: DateTime<FixedOffset>) {}

    fn stamp_updated(&mut self, _at: DateTime<FixedOffset>) {}
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SchemaError {
    #[error("Row type {0} has no persisted columns")]
    NoPersistedColumns(&'static str),

    #[error("Row type {0} has no primary key")]
    MissingPrimaryKey(&'static str),

    #[error("Row type {type_name} declares soft deletion on unknown column {column}")]
    UnknownDeletionColumn { type_name: &'static str, column: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowTypeDescriptor {
    pub type_name: &'static str,
    pub table_name: String,
    /// Data-carrying columns, primary key excluded, in declaration order.
    pub columns: Vec<ColumnDescriptor>,
    pub key: Option<ColumnDescriptor>,
    pub deletion_policy: DeletionPolicy,
    insert_only: Vec<String>,
}

impl RowTypeDescriptor {
    /// Looks a store-side name up among the key and the data columns.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.key.iter().chain(self.columns.iter()).find(|c| c.name == name)
    }

    pub fn resolves(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn key_column(&self) -> Result<&ColumnDescriptor, SchemaError> {
        self.key.as_ref().ok_or(SchemaError::MissingPrimaryKey(self.type_name))
    }

    /// Key first, then the data columns.
    pub fn all_columns(&self) -> Vec<ColumnDescriptor> {
        self.key.iter().chain(self.columns.iter()).cloned().collect()
    }

    pub fn is_insert_only(&self, name: &str) -> bool {
        self.insert_only.iter().any(|c| c == name)
    }
}

/// A descriptor together with the accessors that read a row's values.
pub struct Schema<T> {
    descriptor: RowTypeDescriptor,
    accessors: Vec<fn(&T) -> SqlValue>,
    key_accessor: Option<fn(&T) -> SqlValue>,
}

impl<T: Persistable> Schema<T> {
    fn derive(table_name: String) -> Result<Self, SchemaError> {
        let fields = T::fields();
        let explicit_key = fields.iter().any(|f| f.is_primary_key());

        let mut columns = Vec::new();
        let mut accessors = Vec::new();
        let mut insert_only = Vec::new();
        let mut key = None;
        let mut key_accessor = None;

        for field in fields {
            let is_key = if explicit_key {
                field.is_primary_key()
            } else {
                field.name().eq_ignore_ascii_case("id")
            };

            let (store_type, accessor) = match field.storable() {
                Some(storable) => storable,
                None => continue,
            };

            let descriptor = ColumnDescriptor {
                name: field.column_name().to_string(),
                store_type,
                nullable: field.is_nullable(),
            };

            if is_key {
                key = Some(descriptor);
                key_accessor = Some(accessor);
                continue;
            }

            if field.is_insert_only() {
                insert_only.push(descriptor.name.clone());
            }
            columns.push(descriptor);
            accessors.push(accessor);
        }

        if columns.is_empty() {
            return Err(SchemaError::NoPersistedColumns(T::TYPE_NAME));
        }

        let deletion_policy = T::deletion_policy();
        if let DeletionPolicy::Soft { column } = deletion_policy {
            if !columns.iter().any(|c| c.name == column) {
                return Err(SchemaError::UnknownDeletionColumn { type_name: T::TYPE_NAME, column });
            }
        }

        Ok(Schema {
            descriptor: RowTypeDescriptor {
                type_name: T::TYPE_NAME,
                table_name,
                columns,
                key,
                deletion_policy,
                insert_only,
            },
            accessors,
            key_accessor,
        })
    }

    pub fn descriptor(&self) -> &RowTypeDescriptor {
        &self.descriptor
    }

    /// Values of the data columns, in descriptor order.
    pub fn values(&self, row: &T) -> Vec<SqlValue> {
        self.accessors.iter().map(|accessor| accessor(row)).collect()
    }

    pub fn key_value(&self, row: &T) -> Result<SqlValue, SchemaError> {
        self.key_accessor
            .map(|accessor| accessor(row))
            .ok_or(SchemaError::MissingPrimaryKey(T::TYPE_NAME))
    }

    /// Key value followed by the data values, matching [`RowTypeDescriptor::all_columns`].
    pub fn values_with_key(&self, row: &T) -> Result<Vec<SqlValue>, SchemaError> {
        let mut values = Vec::with_capacity(self.accessors.len() + 1);
        values.push(self.key_value(row)?);
        values.extend(self.values(row));
        Ok(values)
    }
}

/// Derives and caches one [`Schema`] per row type.
pub struct SchemaIntrospector {
    table_names: HashMap<String, String>,
    cache: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl SchemaIntrospector {
    /// `table_names` maps a row type name to the table the mapping layer assigned it.
    pub fn new(table_names: HashMap<String, String>) -> Self {
        SchemaIntrospector { table_names, cache: RwLock::new(HashMap::new()) }
    }

    /// Resolution order: the row type's own override, then the mapping layer, then the type name.
    pub fn table_name<T: Persistable>(&self) -> String {
        T::TABLE
            .map(str::to_string)
            .or_else(|| self.table_names.get(T::TYPE_NAME).cloned())
            .unwrap_or_else(|| T::TYPE_NAME.to_string())
    }

    pub fn describe<T: Persistable>(&self) -> Result<Arc<Schema<T>>, SchemaError> {
        let type_id = TypeId::of::<T>();

        let cached = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&type_id).cloned();
        if let Some(schema) = cached.and_then(|entry| entry.downcast::<Schema<T>>().ok()) {
            return Ok(schema);
        }

        let schema = Arc::new(Schema::<T>::derive(self.table_name::<T>())?);
        debug!(
            "Described {} as {} with {} columns",
            T::TYPE_NAME,
            schema.descriptor.table_name,
            schema.descriptor.columns.len()
        );

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(type_id).or_insert_with(|| schema.clone() as Arc<dyn Any + Send + Sync>);

        Ok(entry.clone().downcast::<Schema<T>>().unwrap_or(schema))
    }
}

impl Default for SchemaIntrospector {
    fn default() -> Self {
        SchemaIntrospector::new(HashMap::new())
    }
}

use crate::database::value::{ColumnType, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A storable scalar (numeric, text, decimal, date/time, boolean or enumeration).
    Scalar(ColumnType),
    /// A collection of values; never persisted as a column.
    Collection,
    /// A navigation to another entity; never persisted as a column.
    Nested,
}

/// Static declaration of one field of a [`crate::Persistable`] row type.
pub struct FieldSpec<T> {
    name: &'static str,
    column: Option<&'static str>,
    kind: FieldKind,
    accessor: Option<fn(&T) -> SqlValue>,
    nullable: bool,
    readable: bool,
    persisted: bool,
    primary_key: bool,
    insert_only: bool,
}

impl<T> FieldSpec<T> {
    fn new(name: &'static str, kind: FieldKind, accessor: Option<fn(&T) -> SqlValue>) -> Self {
        FieldSpec {
            name,
            column: None,
            kind,
            accessor,
            nullable: false,
            readable: true,
            persisted: true,
            primary_key: false,
            insert_only: false,
        }
    }

    pub fn scalar(name: &'static str, store_type: ColumnType, accessor: fn(&T) -> SqlValue) -> Self {
        Self::new(name, FieldKind::Scalar(store_type), Some(accessor))
    }

    /// An enumeration, stored by its integer discriminant.
    pub fn enumeration(name: &'static str, accessor: fn(&T) -> SqlValue) -> Self {
        Self::scalar(name, ColumnType::Integer, accessor)
    }

    pub fn collection(name: &'static str) -> Self {
        Self::new(name, FieldKind::Collection, None)
    }

    pub fn nested(name: &'static str) -> Self {
        Self::new(name, FieldKind::Nested, None)
    }

    /// Store-side column name override.
    pub fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.readable = false;
        self
    }

    pub fn not_persisted(mut self) -> Self {
        self.persisted = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Written on insert, left untouched by repository updates.
    pub fn insert_only(mut self) -> Self {
        self.insert_only = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn column_name(&self) -> &'static str {
        self.column.unwrap_or(self.name)
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_insert_only(&self) -> bool {
        self.insert_only
    }

    /// The store type and accessor when the field becomes a column.
    pub(crate) fn storable(&self) -> Option<(ColumnType, fn(&T) -> SqlValue)> {
        if !self.readable || !self.persisted {
            return None;
        }
        match (self.kind, self.accessor) {
            (FieldKind::Scalar(store_type), Some(accessor)) => Some((store_type, accessor)),
            _ => None,
        }
    }
}

use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type as PgType};

/// Store-side type of a persisted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Time,
}

impl ColumnType {
    /// Returns the PostgreSQL type string used in generated DDL.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Bool => "BOOLEAN",
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Real => "REAL",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
        }
    }

    pub fn to_type(&self) -> PgType {
        match self {
            ColumnType::Bool => PgType::BOOL,
            ColumnType::SmallInt => PgType::INT2,
            ColumnType::Integer => PgType::INT4,
            ColumnType::BigInt => PgType::INT8,
            ColumnType::Real => PgType::FLOAT4,
            ColumnType::Double => PgType::FLOAT8,
            ColumnType::Decimal => PgType::NUMERIC,
            ColumnType::Text => PgType::TEXT,
            ColumnType::Timestamp => PgType::TIMESTAMP,
            ColumnType::TimestampTz => PgType::TIMESTAMPTZ,
            ColumnType::Date => PgType::DATE,
            ColumnType::Time => PgType::TIME,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    pub fn raw_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "Null",
            SqlValue::Bool(_) => "Bool",
            SqlValue::SmallInt(_) => "SmallInt",
            SqlValue::Integer(_) => "Integer",
            SqlValue::BigInt(_) => "BigInt",
            SqlValue::Real(_) => "Real",
            SqlValue::Double(_) => "Double",
            SqlValue::Decimal(_) => "Decimal",
            SqlValue::Text(_) => "Text",
            SqlValue::Timestamp(_) => "Timestamp",
            SqlValue::TimestampTz(_) => "TimestampTz",
            SqlValue::Date(_) => "Date",
            SqlValue::Time(_) => "Time",
        }
    }

    /// The column type this value encodes as, `None` for `Null`.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(_) => Some(ColumnType::Bool),
            SqlValue::SmallInt(_) => Some(ColumnType::SmallInt),
            SqlValue::Integer(_) => Some(ColumnType::Integer),
            SqlValue::BigInt(_) => Some(ColumnType::BigInt),
            SqlValue::Real(_) => Some(ColumnType::Real),
            SqlValue::Double(_) => Some(ColumnType::Double),
            SqlValue::Decimal(_) => Some(ColumnType::Decimal),
            SqlValue::Text(_) => Some(ColumnType::Text),
            SqlValue::Timestamp(_) => Some(ColumnType::Timestamp),
            SqlValue::TimestampTz(_) => Some(ColumnType::TimestampTz),
            SqlValue::Date(_) => Some(ColumnType::Date),
            SqlValue::Time(_) => Some(ColumnType::Time),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Binary COPY is strict about types so a value must encode exactly as its column.
    pub fn fits(&self, column_type: ColumnType) -> bool {
        match self.column_type() {
            Some(own) => own == column_type,
            None => true,
        }
    }

    /// Stores an enumeration by its integer discriminant.
    pub fn from_enum<E: Into<i32>>(value: E) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &PgType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(value) => value.to_sql(ty, out),
            SqlValue::SmallInt(value) => value.to_sql(ty, out),
            SqlValue::Integer(value) => value.to_sql(ty, out),
            SqlValue::BigInt(value) => value.to_sql(ty, out),
            SqlValue::Real(value) => value.to_sql(ty, out),
            SqlValue::Double(value) => value.to_sql(ty, out),
            SqlValue::Decimal(value) => value.to_sql(ty, out),
            SqlValue::Text(value) => value.to_sql(ty, out),
            SqlValue::Timestamp(value) => value.to_sql(ty, out),
            SqlValue::TimestampTz(value) => value.to_sql(ty, out),
            SqlValue::Date(value) => value.to_sql(ty, out),
            SqlValue::Time(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true // We accept all types
    }

    to_sql_checked!();
}

macro_rules! impl_from_for_sql_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    SqlValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_sql_value!(
    bool => Bool,
    i16 => SmallInt,
    i32 => Integer,
    i64 => BigInt,
    f32 => Real,
    f64 => Double,
    Decimal => Decimal,
    String => Text,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    NaiveDate => Date,
    NaiveTime => Time,
);

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::TimestampTz(value.fixed_offset())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValueError {
    #[error("Expected a {expected} value but found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    #[error("Expected a {0} value but found NULL")]
    UnexpectedNull(&'static str),
}

/// Converts a store value back into a Rust field value.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: &SqlValue) -> Result<Self, ValueError>;
}

macro_rules! impl_from_sql_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromSqlValue for $ty {
                fn from_sql_value(value: &SqlValue) -> Result<Self, ValueError> {
                    match value {
                        SqlValue::$variant(inner) => Ok(inner.clone()),
                        SqlValue::Null => Err(ValueError::UnexpectedNull(stringify!($variant))),
                        other => Err(ValueError::TypeMismatch {
                            expected: stringify!($variant),
                            found: other.raw_name(),
                        }),
                    }
                }
            }
        )*
    };
}

impl_from_sql_value!(
    bool => Bool,
    i16 => SmallInt,
    i32 => Integer,
    i64 => BigInt,
    f32 => Real,
    f64 => Double,
    Decimal => Decimal,
    String => Text,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    NaiveDate => Date,
    NaiveTime => Time,
);

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql_value(other).map(Some),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RecordError {
    #[error("Column {0} is not present in the record")]
    MissingColumn(String),

    #[error("Column {column}: {source}")]
    Value {
        column: String,
        #[source]
        source: ValueError,
    },
}

/// One row read back from the store, values ordered like `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Record {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Record { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.iter().position(|c| c == column).and_then(|i| self.values.get(i))
    }

    pub fn set(&mut self, column: &str, value: SqlValue) -> bool {
        match self.columns.iter().position(|c| c == column).and_then(|i| self.values.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Reads `column` as `V`, failing when it is absent or of another type.
    pub fn value<V: FromSqlValue>(&self, column: &str) -> Result<V, RecordError> {
        let value = self.get(column).ok_or_else(|| RecordError::MissingColumn(column.to_string()))?;
        V::from_sql_value(value)
            .map_err(|source| RecordError::Value { column: column.to_string(), source })
    }
}

//! SQL generation for the statements the bulk engines and the repository issue.
//!
//! Every statement is kept as structured data until it reaches a session, so the
//! PostgreSQL backend renders it with [`Statement::to_sql`] / [`Query::to_sql`]
//! while test doubles can interpret it directly.

use crate::database::{filter::Filter, value::SqlValue};
use crate::schema::ColumnDescriptor;

/// Reserved SQL keywords that need quoting.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "all", "and", "as", "by", "check", "column", "default", "desc", "from", "group", "index",
    "key", "limit", "order", "primary", "select", "table", "to", "user", "where",
];

/// Quotes an identifier if it's a reserved keyword or would otherwise be case folded.
#[inline]
pub fn quote_identifier(name: &str) -> String {
    let plain = name.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if plain && !RESERVED_KEYWORDS.contains(&name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Formats a table name, handling schema.table format.
pub fn format_table_name(table_name: &str) -> String {
    match table_name.split_once('.') {
        Some((schema, table)) => format!(
            "{}.{}",
            quote_identifier(schema.trim_matches('"')),
            quote_identifier(table.trim_matches('"'))
        ),
        None => quote_identifier(table_name.trim_matches('"')),
    }
}

fn column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns.iter().map(|c| quote_identifier(c.as_ref())).collect::<Vec<_>>().join(", ")
}

/// `COPY <table> (<cols>) FROM STDIN WITH (FORMAT binary)`
pub fn copy_in_sql<S: AsRef<str>>(table_name: &str, columns: &[S]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
        format_table_name(table_name),
        column_list(columns)
    )
}

/// Table-level lock taken before a bulk load.
///
/// `ROW EXCLUSIVE` is what a plain `INSERT` takes; acquiring it up front keeps DDL
/// and `SHARE` lockers away for the length of the load while parallel loaders
/// into the same table still proceed.
pub fn lock_table_sql(table_name: &str) -> String {
    format!("LOCK TABLE {} IN ROW EXCLUSIVE MODE", format_table_name(table_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    Ascending,
    Descending,
}

impl QueryOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOrder::Ascending => "ASC",
            QueryOrder::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub order: QueryOrder,
}

impl OrderBy {
    pub fn asc(column: &str) -> Self {
        OrderBy { column: column.to_string(), order: QueryOrder::Ascending }
    }

    pub fn desc(column: &str) -> Self {
        OrderBy { column: column.to_string(), order: QueryOrder::Descending }
    }
}

/// A `SELECT` over a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: Vec<String>,
    pub filter: Option<Filter>,
    pub order: Option<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Query {
    pub fn select(table: &str, columns: Vec<String>) -> Self {
        Query {
            table: table.to_string(),
            columns,
            filter: None,
            order: None,
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, order: Option<OrderBy>) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn where_clause(&self, params: &mut Vec<SqlValue>) -> String {
        match &self.filter {
            Some(filter) => format!(" WHERE {}", filter.render(params)),
            None => String::new(),
        }
    }

    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT {} FROM {}",
            column_list(&self.columns),
            format_table_name(&self.table)
        );
        sql.push_str(&self.where_clause(&mut params));

        if let Some(order) = &self.order {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_identifier(&order.column),
                order.order.as_str()
            ));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        (sql, params)
    }

    /// `SELECT COUNT(*)` over the same table and filter; ordering and paging are ignored.
    pub fn to_count_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", format_table_name(&self.table));
        sql.push_str(&self.where_clause(&mut params));
        (sql, params)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `CREATE TEMP TABLE` shaped like the given columns.
    CreateStaging { table: String, columns: Vec<ColumnDescriptor> },
    /// Update-only merge of `staging` into `target` joined on `key`.
    Merge { target: String, staging: String, key: String, columns: Vec<String> },
    DropTable { table: String },
    /// Multi-row insert, optionally returning one column of every inserted row.
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        returning: Option<String>,
    },
    Update { table: String, assignments: Vec<(String, SqlValue)>, filter: Filter },
    Delete { table: String, filter: Filter },
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::CreateStaging { .. } => "CREATE",
            Statement::Merge { .. } => "MERGE",
            Statement::DropTable { .. } => "DROP",
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
        }
    }

    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        match self {
            Statement::CreateStaging { table, columns } => {
                let definitions = columns
                    .iter()
                    .map(|c| format!("{} {}", quote_identifier(&c.name), c.store_type.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ");
                (format!("CREATE TEMP TABLE {} ({})", quote_identifier(table), definitions), vec![])
            }
            Statement::Merge { target, staging, key, columns } => {
                let key = quote_identifier(key);
                let set_clauses = columns
                    .iter()
                    .map(|c| {
                        let column = quote_identifier(c);
                        format!("{column} = Source.{column}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "MERGE INTO {} AS Target USING {} AS Source ON Target.{key} = Source.{key} WHEN MATCHED THEN UPDATE SET {}",
                    format_table_name(target),
                    quote_identifier(staging),
                    set_clauses
                );
                (sql, vec![])
            }
            Statement::DropTable { table } => {
                (format!("DROP TABLE {}", format_table_name(table)), vec![])
            }
            Statement::Insert { table, columns, rows, returning } => {
                let total_columns = columns.len();
                let mut params = Vec::with_capacity(rows.len() * total_columns);
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ",
                    format_table_name(table),
                    column_list(columns)
                );

                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        sql.push(',');
                    }
                    let placeholders = (0..total_columns)
                        .map(|j| format!("${}", i * total_columns + j + 1))
                        .collect::<Vec<_>>();
                    sql.push_str(&format!("({})", placeholders.join(",")));
                    params.extend(row.iter().cloned());
                }

                if let Some(column) = returning {
                    sql.push_str(&format!(" RETURNING {}", quote_identifier(column)));
                }

                (sql, params)
            }
            Statement::Update { table, assignments, filter } => {
                let mut params = Vec::new();
                let set_clauses = assignments
                    .iter()
                    .map(|(column, value)| {
                        params.push(value.clone());
                        format!("{} = ${}", quote_identifier(column), params.len())
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let condition = filter.render(&mut params);
                (
                    format!(
                        "UPDATE {} SET {} WHERE {}",
                        format_table_name(table),
                        set_clauses,
                        condition
                    ),
                    params,
                )
            }
            Statement::Delete { table, filter } => {
                let mut params = Vec::new();
                let condition = filter.render(&mut params);
                (format!("DELETE FROM {} WHERE {}", format_table_name(table), condition), params)
            }
        }
    }
}

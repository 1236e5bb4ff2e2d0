use crate::database::{statement::quote_identifier, value::SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// A composable `WHERE` predicate over store-side column names.
///
/// Values are never inlined into SQL, they are rendered as `$n` placeholders
/// and collected into the parameter list.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare { column: String, op: CompareOp, value: SqlValue },
    IsNull(String),
    IsNotNull(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    fn compare(column: &str, op: CompareOp, value: impl Into<SqlValue>) -> Self {
        Filter::Compare { column: column.to_string(), op, value: value.into() }
    }

    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn gt(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn ge(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, CompareOp::Ge, value)
    }

    pub fn lt(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn le(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, CompareOp::Le, value)
    }

    pub fn like(column: &str, pattern: &str) -> Self {
        Self::compare(column, CompareOp::Like, pattern)
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull(column.to_string())
    }

    pub fn is_not_null(column: &str) -> Self {
        Filter::IsNotNull(column.to_string())
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Joins two optional predicates with `AND`.
    pub fn and_optional(left: Option<Filter>, right: Option<Filter>) -> Option<Filter> {
        match (left, right) {
            (Some(left), Some(right)) => Some(left.and(right)),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        }
    }

    /// Every column name the predicate references, in visiting order.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Compare { column, .. } | Filter::IsNull(column) | Filter::IsNotNull(column) => {
                out.push(column.as_str())
            }
            Filter::And(left, right) | Filter::Or(left, right) => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
        }
    }

    /// Renders the predicate, pushing bound values onto `params`.
    pub fn render(&self, params: &mut Vec<SqlValue>) -> String {
        match self {
            Filter::Compare { column, op, value } => {
                params.push(value.clone());
                format!("{} {} ${}", quote_identifier(column), op.as_str(), params.len())
            }
            Filter::IsNull(column) => format!("{} IS NULL", quote_identifier(column)),
            Filter::IsNotNull(column) => format!("{} IS NOT NULL", quote_identifier(column)),
            Filter::And(left, right) => {
                format!("({} AND {})", left.render(params), right.render(params))
            }
            Filter::Or(left, right) => {
                format!("({} OR {})", left.render(params), right.render(params))
            }
        }
    }
}

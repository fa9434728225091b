//! Entity metadata and SQL value binding
//!
//! An [`Entity`] describes the table behind a record type: table name,
//! primary key, column list, and which soft-delete convention (if any) the
//! table follows. The query compiler and the repository are generic over
//! this trait and never see anything storage-internal beyond a `sqlx` row.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;

/// Metadata about the database table backing a record type.
pub trait Entity: Send + Sync + Sized {
    /// The SQL table name (e.g., "users")
    const TABLE_NAME: &'static str;

    /// The primary key column name
    const PRIMARY_KEY: &'static str = "id";

    /// Column stamped with a deletion timestamp by soft deletes. Rows with a
    /// non-NULL value here are excluded from default query scope. `None`
    /// opts the table out of timestamp-based soft deletion.
    const DELETED_AT_COLUMN: Option<&'static str> = Some("deleted_at");

    /// Column set to 1 by flag deletes. Unlike [`Self::DELETED_AT_COLUMN`],
    /// the flag does not affect default query scope; queries that care
    /// filter on it explicitly.
    const DELETED_FLAG_COLUMN: Option<&'static str> = Some("is_deleted");

    /// List of all column names in the table
    fn column_names() -> &'static [&'static str];

    /// Build a SELECT over all columns, each qualified with the table name
    /// so joined queries never produce an ambiguous select list.
    fn select_sql() -> String {
        let columns: Vec<String> = Self::column_names()
            .iter()
            .map(|c| format!("{}.{}", Self::TABLE_NAME, c))
            .collect();
        format!("SELECT {} FROM {}", columns.join(", "), Self::TABLE_NAME)
    }
}

/// Trait for decoding a database row into a record.
pub trait FromSqlRow: Sized {
    /// Decode a SQLite row into this record type
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;
}

/// Trait for encoding a record into an INSERT statement.
pub trait IntoSqlRow {
    /// Columns written on insert, in the order `insert_values` yields them.
    /// Auto-populated columns (rowid primary keys, timestamp defaults) are
    /// normally left out.
    fn insert_columns() -> &'static [&'static str];

    /// One value per entry of [`Self::insert_columns`]
    fn insert_values(&self) -> Vec<SqlValue>;
}

/// A SQL value ready to be bound to a parameterized query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SqlValue {
    /// Convert a JSON scalar into a bindable value.
    ///
    /// Arrays and objects have no single-placeholder shape and return
    /// `None`; callers compile those into set/operator clauses instead.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Bind this value to a sqlx query. Booleans are stored as 0/1 integers.
    pub fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(if *b { 1i32 } else { 0i32 }),
            SqlValue::Null => query.bind(None::<String>),
        }
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::String(s) => write!(f, "{s}"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Bool(b) => write!(f, "{b}"),
            SqlValue::Null => write!(f, "NULL"),
        }
    }
}

/// Current UTC time as an ISO8601 string, the TEXT format timestamps are
/// stored in.
pub(crate) fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}

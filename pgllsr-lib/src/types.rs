use crate::lsn::LogPos;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
}

impl Operation {
    /// Row operations carry a table and columns; BEGIN/COMMIT do not
    pub fn is_row_change(self) -> bool {
        matches!(
            self,
            Operation::Insert | Operation::Update | Operation::Delete
        )
    }

    /// Transaction boundary markers
    pub fn is_transaction_boundary(self) -> bool {
        !self.is_row_change()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Begin => write!(f, "BEGIN"),
            Operation::Commit => write!(f, "COMMIT"),
        }
    }
}

/// A decoded column value, exactly as the output plugin typed it
///
/// No semantic conversion is applied: numeric and text values keep the
/// representation chosen by the plugin for the column's declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    /// Unchanged TOAST value that the server did not resend
    Unchanged,
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Point { x: f64, y: f64 },
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int32(v) => Some(i64::from(*v)),
            ColumnValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

/// One column of a row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared type OID of the column
    pub type_oid: i64,
    pub value: ColumnValue,
    /// Prior value for UPDATE/DELETE when the replica identity provides it
    pub old_value: Option<ColumnValue>,
}

/// One decoded unit of change from the replication stream
///
/// BEGIN and COMMIT events mark transaction boundaries; for those
/// `table` is `None` and `columns` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,

    /// Schema-qualified table name for row operations
    pub table: Option<String>,

    /// Columns in wire order
    pub columns: Vec<Column>,

    /// Position at which this change was recorded
    pub position: LogPos,

    /// Source transaction id, when the plugin reports it
    pub transaction_id: Option<u32>,

    /// Commit timestamp of the enclosing transaction, when reported
    pub commit_time: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Name of the affected table, or an empty string for boundary events
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or("")
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_classification() {
        assert!(Operation::Insert.is_row_change());
        assert!(Operation::Delete.is_row_change());
        assert!(Operation::Begin.is_transaction_boundary());
        assert!(Operation::Commit.is_transaction_boundary());
        assert_eq!(Operation::Update.to_string(), "UPDATE");
    }

    #[test]
    fn test_column_lookup() {
        let event = ChangeEvent {
            operation: Operation::Insert,
            table: Some("public.users".to_string()),
            columns: vec![Column {
                name: "id".to_string(),
                type_oid: 23,
                value: ColumnValue::Int32(7),
                old_value: None,
            }],
            position: LogPos(42),
            transaction_id: Some(1),
            commit_time: None,
        };

        assert_eq!(event.table_name(), "public.users");
        assert_eq!(event.column("id").unwrap().value.as_i64(), Some(7));
        assert!(event.column("missing").is_none());
    }
}

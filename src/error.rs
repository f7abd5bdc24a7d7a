use thiserror::Error;

/// Failure kinds raised by the audit reversion pipeline. Everything is
/// surfaced through `anyhow::Result`, so callers that need to branch on a
/// specific kind can `downcast_ref::<AuditError>()`.
#[derive(Debug, Error)]
pub enum AuditError {
    /// A table referenced by the change log is missing from the schema
    /// catalog, e.g. because it was dropped after the change was recorded.
    #[error("table '{0}' referenced by the change log is not in the schema catalog")]
    Schema(String),

    /// The table has no primary key, so its rows cannot be reverted.
    #[error("table '{0}' has no primary key and cannot be reverted")]
    UnsupportedTable(String),

    /// A logged field no longer exists on its table.
    #[error("field '{field}' does not exist on table '{table}'")]
    UnsupportedField { table: String, field: String },

    /// An empty value was cast against a non-nullable, non-boolean column.
    #[error("column '{0}' is not nullable and cannot hold an empty value")]
    NotNullable(String),

    /// The requested statement shape is not supported, e.g. an UPDATE that
    /// would touch a primary key column.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The change log contains an operation sequence that cannot be merged.
    /// This means the log is corrupt, or the producer wrote out of order.
    #[error(
        "inconsistent change log for {table} pk {pk}: cannot merge a {proposed} revert into a {current} revert"
    )]
    MergeConsistency {
        table: String,
        pk: String,
        current: String,
        proposed: String,
    },

    /// A logged value could not be cast to its column's declared type.
    #[error("cannot cast value '{value}' for column '{column}' ({type_name})")]
    ValueCast {
        column: String,
        type_name: String,
        value: String,
    },
}

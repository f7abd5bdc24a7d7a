use std::fmt;

use anyhow::Result;

use super::changelog::{ChangeLogEntry, FieldChange, Operation};
use super::schema::{ColumnSchema, SchemaCatalog, TableSchema};
use crate::error::AuditError;

/// The net reversal action for one row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevertKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for RevertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertKind::Insert => write!(f, "Insert"),
            RevertKind::Update => write!(f, "Update"),
            RevertKind::Delete => write!(f, "Delete"),
        }
    }
}

/// One field of a pending revert: the value that will be written back, and
/// whether it came from the log or was backfilled. Primary key fields are
/// seeded at creation and are never updatable.
#[derive(Debug)]
pub struct FieldRevert<'a> {
    pub field_name: String,
    pub column: &'a ColumnSchema,
    pub value: String,
    /// True when the value was present in the log, false for the seeded
    /// primary key and for backfilled defaults.
    pub explicit: bool,
}

/// In-memory accumulator for the net reversal of one (table, primary key)
/// pair. Mutated in place while log entries for the row are folded in.
#[derive(Debug)]
pub struct PendingRevert<'a> {
    pub table_name: String,
    pub pk_value: String,
    pub table: &'a TableSchema,
    pub kind: RevertKind,
    /// Relative execution order; assigned when the row is first touched and
    /// re-assigned when a later delete must run earlier.
    pub order: usize,
    pub fields: Vec<FieldRevert<'a>>,
}

/// Folds the newest-first entry stream into one PendingRevert per row.
///
/// Each log operation proposes a reversal kind (Insert is undone by Delete,
/// Delete by Insert, Update by Update) which is merged into the row's
/// current kind: Delete always wins and pulls the row's execution order
/// forward to the current fold position, and an Insert absorbs later
/// Updates, since the insert already determines the full row state. Any
/// other transition means the log is out of order and fails fast.
///
/// A single forward pass: O(entries) time, O(distinct rows) space.
pub fn merge_changes<'a>(
    entries: &[ChangeLogEntry],
    catalog: &'a SchemaCatalog,
) -> Result<Vec<PendingRevert<'a>>> {
    let mut reverts: Vec<PendingRevert<'a>> = Vec::new();

    for entry in entries {
        let proposed = match entry.op {
            Operation::Insert => RevertKind::Delete,
            Operation::Delete => RevertKind::Insert,
            Operation::Update => RevertKind::Update,
        };
        let position = reverts.len() + 1;

        let index = match reverts
            .iter()
            .position(|r| r.table_name == entry.table_name && r.pk_value == entry.pk)
        {
            Some(index) => {
                merge_kind(&mut reverts[index], proposed, position)?;
                index
            }
            None => {
                let table = catalog.require(&entry.table_name)?;
                let pk_column = table
                    .primary_key()
                    .ok_or_else(|| AuditError::UnsupportedTable(entry.table_name.clone()))?;
                reverts.push(PendingRevert {
                    table_name: entry.table_name.clone(),
                    pk_value: entry.pk.clone(),
                    table,
                    kind: proposed,
                    order: position,
                    fields: vec![FieldRevert {
                        field_name: pk_column.name.clone(),
                        column: pk_column,
                        value: entry.pk.clone(),
                        explicit: false,
                    }],
                });
                reverts.len() - 1
            }
        };

        let revert = &mut reverts[index];
        // A row that nets to Delete needs no field values, only its key.
        if revert.kind != RevertKind::Delete {
            for change in &entry.fields {
                fold_field(revert, entry.op, change)?;
            }
        }
    }

    Ok(reverts)
}

fn merge_kind(revert: &mut PendingRevert, proposed: RevertKind, position: usize) -> Result<()> {
    if revert.kind == proposed {
        return Ok(());
    }
    match (revert.kind, proposed) {
        // Delete trumps everything else. The delete also has to run at the
        // position this entry was folded at, ahead of reverts that would
        // otherwise collide with the still-existing row.
        (_, RevertKind::Delete) => {
            revert.kind = RevertKind::Delete;
            revert.order = position;
            Ok(())
        }
        // Inserted then updated nets to an insert carrying the final field
        // values; the insert already fixes the row's order.
        (RevertKind::Insert, RevertKind::Update) => Ok(()),
        (current, proposed) => Err(AuditError::MergeConsistency {
            table: revert.table_name.clone(),
            pk: revert.pk_value.clone(),
            current: current.to_string(),
            proposed: proposed.to_string(),
        }
        .into()),
    }
}

fn fold_field<'a>(
    revert: &mut PendingRevert<'a>,
    op: Operation,
    change: &FieldChange,
) -> Result<()> {
    let index = match revert
        .fields
        .iter()
        .position(|f| f.field_name.eq_ignore_ascii_case(&change.field_name))
    {
        Some(index) => index,
        None => {
            let column = revert.table.column(&change.field_name).ok_or_else(|| {
                AuditError::UnsupportedField {
                    table: revert.table_name.clone(),
                    field: change.field_name.clone(),
                }
            })?;
            revert.fields.push(FieldRevert {
                field_name: column.name.clone(),
                column,
                value: String::new(),
                explicit: false,
            });
            revert.fields.len() - 1
        }
    };

    // Undoing a delete restores the row, and the producer stores the
    // pre-delete content in new_value. Everything else restores old_value.
    let value = match op {
        Operation::Delete => change.new_value.as_deref(),
        Operation::Insert | Operation::Update => change.old_value.as_deref(),
    };
    let field = &mut revert.fields[index];
    field.value = value.unwrap_or_default().to_string();
    field.explicit = true;

    Ok(())
}

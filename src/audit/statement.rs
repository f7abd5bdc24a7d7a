use anyhow::Result;
use rusqlite::types::Value;

use super::merge::{FieldRevert, PendingRevert, RevertKind};
use super::schema::{ColumnSchema, TypeFamily};
use crate::error::AuditError;

/// One parameterized SQL statement produced from a pending revert. A single
/// revert can expand to several statements when engine-assigned key state
/// has to be managed around the write.
#[derive(Debug)]
pub struct RevertStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Renders a pending revert into the statements that undo it. Values are
/// cast from their logged string form into typed parameters here, so a bad
/// value fails the whole run before anything executes.
pub fn build_statements(revert: &PendingRevert) -> Result<Vec<RevertStatement>> {
    match revert.kind {
        RevertKind::Delete => build_delete(revert),
        RevertKind::Update => build_update(revert),
        RevertKind::Insert => build_insert(revert),
    }
}

fn build_delete(revert: &PendingRevert) -> Result<Vec<RevertStatement>> {
    let pk = primary_key(revert)?;
    Ok(vec![RevertStatement {
        sql: format!(
            "DELETE FROM {} WHERE \"{}\" = ?",
            revert.table.quoted_name(),
            pk.field_name
        ),
        params: vec![cast_value(pk.column, &pk.value)?],
    }])
}

fn build_update(revert: &PendingRevert) -> Result<Vec<RevertStatement>> {
    let pk = primary_key(revert)?;
    let mut assignments = Vec::new();
    let mut params = Vec::new();
    for field in revert.fields.iter().filter(|f| f.explicit) {
        // A changed primary key cannot be reverted with an update keyed on
        // the new value; the log producer guarantees keys are immutable.
        if field.column.primary_key {
            return Err(AuditError::UnsupportedOperation(format!(
                "primary key {}.{} changed",
                revert.table_name, field.field_name
            ))
            .into());
        }
        assignments.push(format!("\"{}\" = ?", field.field_name));
        params.push(cast_value(field.column, &field.value)?);
    }
    // The producer contract says update entries carry at least one detail
    // row; an empty one means the log came from somewhere else or is
    // corrupt.
    if assignments.is_empty() {
        return Err(AuditError::UnsupportedOperation(format!(
            "update of {} pk {} carries no revertible fields",
            revert.table_name, revert.pk_value
        ))
        .into());
    }
    params.push(cast_value(pk.column, &pk.value)?);

    Ok(vec![RevertStatement {
        sql: format!(
            "UPDATE {} SET {} WHERE \"{}\" = ?",
            revert.table.quoted_name(),
            assignments.join(", "),
            pk.field_name
        ),
        params,
    }])
}

fn build_insert(revert: &PendingRevert) -> Result<Vec<RevertStatement>> {
    let mut names = Vec::new();
    let mut params = Vec::new();
    for field in &revert.fields {
        if field.explicit || field.column.primary_key {
            names.push(format!("\"{}\"", field.field_name));
            params.push(cast_value(field.column, &field.value)?);
        }
    }
    // Default-bearing columns the log never saw are written explicitly as
    // the empty value, otherwise the default would fire again and the
    // restored row would not match its captured shape. Columns with neither
    // a logged value nor a default are left out entirely.
    for column in &revert.table.columns {
        let present = revert
            .fields
            .iter()
            .any(|f| (f.explicit || f.column.primary_key) && f.field_name == column.name);
        if !present && column.has_default {
            names.push(format!("\"{}\"", column.name));
            params.push(cast_value(column, "")?);
        }
    }

    let insert = RevertStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            revert.table.quoted_name(),
            names.join(", "),
            vec!["?"; params.len()].join(", ")
        ),
        params,
    };

    if !revert.table.has_identity_primary_key() {
        return Ok(vec![insert]);
    }

    // Re-inserting a row with an engine-assigned key needs the sequence
    // bookkeeping bracketed around it: make sure the table has a sequence
    // slot, then push the sequence past the restored key so the engine never
    // hands that id out again.
    let pk = primary_key(revert)?;
    let pre = RevertStatement {
        sql: "INSERT OR IGNORE INTO sqlite_sequence (name, seq) VALUES (?, 0)".to_string(),
        params: vec![Value::Text(revert.table.table_name.clone())],
    };
    let post = RevertStatement {
        sql: format!(
            "UPDATE sqlite_sequence
             SET seq = (SELECT COALESCE(MAX(\"{pk}\"), 0) FROM {table})
             WHERE name = ? AND seq < (SELECT COALESCE(MAX(\"{pk}\"), 0) FROM {table})",
            pk = pk.field_name,
            table = revert.table.quoted_name(),
        ),
        params: vec![Value::Text(revert.table.table_name.clone())],
    };

    Ok(vec![pre, insert, post])
}

fn primary_key<'a, 'b>(revert: &'a PendingRevert<'b>) -> Result<&'a FieldRevert<'b>> {
    revert
        .fields
        .iter()
        .find(|f| f.column.primary_key)
        .ok_or_else(|| AuditError::UnsupportedTable(revert.table_name.clone()).into())
}

/// Casts a string-serialized log value into a typed parameter for the
/// column it targets. Empty strings mean "no logged value": NULL for
/// nullable columns, false for booleans, an error otherwise.
pub fn cast_value(column: &ColumnSchema, raw: &str) -> Result<Value> {
    if raw.is_empty() {
        if column.nullable {
            return Ok(Value::Null);
        }
        if column.family == TypeFamily::Boolean {
            return Ok(Value::Integer(0));
        }
        return Err(AuditError::NotNullable(column.name.clone()).into());
    }

    let cast_err = || AuditError::ValueCast {
        column: column.name.clone(),
        type_name: column.type_name.clone(),
        value: raw.to_string(),
    };

    match column.family {
        TypeFamily::Integer => Ok(Value::Integer(
            raw.parse::<i64>().map_err(|_| cast_err())?,
        )),
        TypeFamily::Boolean => match raw {
            "1" | "true" | "TRUE" | "True" => Ok(Value::Integer(1)),
            "0" | "false" | "FALSE" | "False" => Ok(Value::Integer(0)),
            _ => Err(cast_err().into()),
        },
        TypeFamily::Float => Ok(Value::Real(raw.parse::<f64>().map_err(|_| cast_err())?)),
        TypeFamily::Binary => Ok(Value::Blob(decode_hex(raw).ok_or_else(cast_err)?)),
        TypeFamily::Text | TypeFamily::Temporal | TypeFamily::Other => {
            Ok(Value::Text(raw.to_string()))
        }
    }
}

// Binary columns are logged through hex(), upper case with no prefix.
fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    raw.as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

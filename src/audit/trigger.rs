use std::collections::HashSet;

use anyhow::Result;
use rusqlite::Connection;

use super::schema::{ColumnSchema, SchemaCatalog, TableSchema, TypeFamily};

/// Names of the log tables and how aggressively triggers are refreshed.
#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub schema: String,
    pub audit_table: String,
    pub detail_table: String,
    /// When true, existing audit triggers are dropped and recreated on every
    /// install so they pick up schema changes since the last run.
    pub always_update_triggers: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            schema: "main".to_string(),
            audit_table: "_audit".to_string(),
            detail_table: "_audit_detail".to_string(),
            always_update_triggers: true,
        }
    }
}

impl AuditConfig {
    pub(crate) fn context_table(&self) -> String {
        format!("{}_context", self.audit_table)
    }
}

/// An object excluded from audit capture: a whole schema, one table, or one
/// column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ignore {
    Schema(String),
    Table {
        schema: String,
        table: String,
    },
    Column {
        schema: String,
        table: String,
        column: String,
    },
}

impl Ignore {
    pub fn schema(schema: impl Into<String>) -> Self {
        Ignore::Schema(schema.into())
    }

    pub fn table(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Ignore::Table {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn column(
        schema: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Ignore::Column {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
        }
    }
}

const TRIGGER_SUFFIXES: [&str; 3] = ["i", "u", "d"];

fn trigger_name(table: &TableSchema, suffix: &str) -> String {
    format!(
        "audit_{}_{}_{}",
        table.schema_name, table.table_name, suffix
    )
}

/// Generates and executes the trigger scripts.
pub fn install_triggers(conn: &Connection, config: &AuditConfig, ignores: &[Ignore]) -> Result<()> {
    for script in generate_trigger_scripts(conn, config, ignores)? {
        log::debug!("SQL EXECUTE: {}", script);
        conn.execute_batch(&script)?;
    }
    Ok(())
}

/// Plans the capture triggers for every auditable user table: drops for
/// stale or orphaned triggers first, then one insert/update/delete trigger
/// trio per table. Tables without a usable (single-column) primary key are
/// skipped, as are the log tables themselves and anything on the ignore
/// list.
pub fn generate_trigger_scripts(
    conn: &Connection,
    config: &AuditConfig,
    ignores: &[Ignore],
) -> Result<Vec<String>> {
    let catalog = SchemaCatalog::load(conn, &config.schema)?;

    let mut ignored_schemas = HashSet::new();
    let mut ignored_tables = HashSet::new();
    for ignore in ignores {
        match ignore {
            Ignore::Schema(schema) => {
                ignored_schemas.insert(schema.clone());
            }
            Ignore::Table { schema, table } => {
                ignored_tables.insert(format!("{}.{}", schema, table));
            }
            Ignore::Column { .. } => {}
        }
    }
    // Never audit the tables that hold the log.
    for table in [
        &config.audit_table,
        &config.detail_table,
        &config.context_table(),
    ] {
        ignored_tables.insert(format!("{}.{}", config.schema, table));
    }

    let existing = existing_trigger_names(conn, config)?;

    let mut audited = Vec::new();
    for table in catalog.tables() {
        if ignored_schemas.contains(&table.schema_name)
            || ignored_tables.contains(&table.qualified_name())
        {
            continue;
        }
        let pk_count = table.columns.iter().filter(|c| c.primary_key).count();
        if pk_count != 1 {
            log::warn!(
                "not auditing {}: {}",
                table.qualified_name(),
                if pk_count == 0 {
                    "no primary key"
                } else {
                    "composite primary key"
                }
            );
            continue;
        }
        audited.push(table);
    }

    let mut expected = HashSet::new();
    for table in &audited {
        for suffix in TRIGGER_SUFFIXES {
            expected.insert(trigger_name(table, suffix));
        }
    }

    let mut drops: Vec<&String> = existing
        .iter()
        .filter(|name| !expected.contains(*name) || config.always_update_triggers)
        .collect();
    drops.sort();

    let mut scripts = Vec::new();
    if !drops.is_empty() {
        for name in &drops {
            log::debug!("dropping audit trigger {}", name);
        }
        scripts.push(
            drops
                .iter()
                .map(|name| format!("DROP TRIGGER IF EXISTS \"{}\";", name))
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }
    let dropped: HashSet<&String> = drops.into_iter().collect();

    for table in &audited {
        let ignored_columns: Vec<&str> = ignores
            .iter()
            .filter_map(|ignore| match ignore {
                Ignore::Column {
                    schema,
                    table: t,
                    column,
                } if *schema == table.schema_name && *t == table.table_name => {
                    Some(column.as_str())
                }
                _ => None,
            })
            .collect();
        let columns: Vec<&ColumnSchema> = table
            .columns
            .iter()
            .filter(|c| !c.primary_key)
            .filter(|c| !ignored_columns.iter().any(|i| c.name.eq_ignore_ascii_case(i)))
            .collect();
        let pk = table
            .primary_key()
            .expect("audited tables have a primary key");

        let mut creates = vec![
            (trigger_name(table, "i"), insert_trigger(config, table, pk, &columns)),
            (trigger_name(table, "d"), delete_trigger(config, table, pk, &columns)),
        ];
        // A table with no audited non-key columns has nothing to log on
        // update.
        if !columns.is_empty() {
            creates.push((
                trigger_name(table, "u"),
                update_trigger(config, table, pk, &columns),
            ));
        }

        for (name, script) in creates {
            if existing.contains(&name) && !dropped.contains(&name) {
                continue;
            }
            log::debug!("creating audit trigger {}", name);
            scripts.push(script);
        }
    }

    Ok(scripts)
}

fn existing_trigger_names(conn: &Connection, config: &AuditConfig) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT name FROM \"{}\".sqlite_master
         WHERE type = 'trigger' AND name LIKE 'audit\\_%' ESCAPE '\\'",
        config.schema
    ))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

/// Text rendering of one column for a detail row. Binary columns are stored
/// hex-encoded so the value survives the text-typed log bit-exact; everything
/// else is CAST to its text form.
fn value_expr(row: &str, column: &ColumnSchema) -> String {
    if column.family == TypeFamily::Binary {
        format!(
            "(CASE WHEN {row}.\"{name}\" IS NULL THEN NULL ELSE hex({row}.\"{name}\") END)",
            row = row,
            name = column.name,
        )
    } else {
        format!("CAST({}.\"{}\" AS TEXT)", row, column.name)
    }
}

/// The header insert shared by all three triggers. The actor comes from the
/// single-row context table, falling back to 'unknown' when no identity was
/// stamped.
fn header_insert(config: &AuditConfig, table: &TableSchema, op: char, row: &str, pk: &ColumnSchema) -> String {
    format!(
        "    INSERT INTO \"{audit}\" (type, table_name, pk, update_date, user_name)
    VALUES ('{op}', '{qualified}', CAST({row}.\"{pk}\" AS TEXT), datetime('now'),
            COALESCE((SELECT user_name FROM \"{context}\" WHERE id = 1), 'unknown'));",
        audit = config.audit_table,
        op = op,
        qualified = table.qualified_name(),
        row = row,
        pk = pk.name,
        context = config.context_table(),
    )
}

/// The detail insert shared by all three triggers. The header written just
/// above is the newest row in the log; triggers run under SQLite's single
/// writer, so MAX(id) is its id.
fn detail_insert(config: &AuditConfig, union_rows: &str, filter: &str) -> String {
    format!(
        "    INSERT INTO \"{detail}\" (audit_id, field_name, old_value, new_value)
    SELECT (SELECT MAX(id) FROM \"{audit}\"), v.field_name, v.old_value, v.new_value
    FROM (
        {union_rows}
    ) AS v
    WHERE {filter};",
        detail = config.detail_table,
        audit = config.audit_table,
        union_rows = union_rows,
        filter = filter,
    )
}

fn insert_trigger(
    config: &AuditConfig,
    table: &TableSchema,
    pk: &ColumnSchema,
    columns: &[&ColumnSchema],
) -> String {
    let mut body = header_insert(config, table, 'I', "NEW", pk);
    if !columns.is_empty() {
        // NULL columns are not logged on insert; the row shape is implied.
        let rows = columns
            .iter()
            .map(|c| {
                format!(
                    "SELECT '{}' AS field_name, NULL AS old_value, {} AS new_value",
                    c.name,
                    value_expr("NEW", c)
                )
            })
            .collect::<Vec<_>>()
            .join("\n        UNION ALL ");
        body.push('\n');
        body.push_str(&detail_insert(config, &rows, "v.new_value IS NOT NULL"));
    }
    format!(
        "CREATE TRIGGER \"{name}\" AFTER INSERT ON \"{table}\" FOR EACH ROW
BEGIN
{body}
END;",
        name = trigger_name(table, "i"),
        table = table.table_name,
        body = body,
    )
}

fn update_trigger(
    config: &AuditConfig,
    table: &TableSchema,
    pk: &ColumnSchema,
    columns: &[&ColumnSchema],
) -> String {
    // IS NOT rather than <> so NULL transitions are captured.
    let when = columns
        .iter()
        .map(|c| format!("NEW.\"{name}\" IS NOT OLD.\"{name}\"", name = c.name))
        .collect::<Vec<_>>()
        .join(" OR ");
    let rows = columns
        .iter()
        .map(|c| {
            format!(
                "SELECT '{name}' AS field_name, {old} AS old_value, {new} AS new_value, (NEW.\"{name}\" IS NOT OLD.\"{name}\") AS changed",
                name = c.name,
                old = value_expr("OLD", c),
                new = value_expr("NEW", c),
            )
        })
        .collect::<Vec<_>>()
        .join("\n        UNION ALL ");
    let mut body = header_insert(config, table, 'U', "NEW", pk);
    body.push('\n');
    body.push_str(&detail_insert(config, &rows, "v.changed"));
    format!(
        "CREATE TRIGGER \"{name}\" AFTER UPDATE ON \"{table}\" FOR EACH ROW
WHEN {when}
BEGIN
{body}
END;",
        name = trigger_name(table, "u"),
        table = table.table_name,
        when = when,
        body = body,
    )
}

fn delete_trigger(
    config: &AuditConfig,
    table: &TableSchema,
    pk: &ColumnSchema,
    columns: &[&ColumnSchema],
) -> String {
    let mut body = header_insert(config, table, 'D', "OLD", pk);
    if !columns.is_empty() {
        // The pre-delete content goes in new_value; that is where the
        // reversion engine reads it from when restoring the row.
        let rows = columns
            .iter()
            .map(|c| {
                format!(
                    "SELECT '{}' AS field_name, NULL AS old_value, {} AS new_value",
                    c.name,
                    value_expr("OLD", c)
                )
            })
            .collect::<Vec<_>>()
            .join("\n        UNION ALL ");
        body.push('\n');
        body.push_str(&detail_insert(config, &rows, "v.new_value IS NOT NULL"));
    }
    format!(
        "CREATE TRIGGER \"{name}\" AFTER DELETE ON \"{table}\" FOR EACH ROW
BEGIN
{body}
END;",
        name = trigger_name(table, "d"),
        table = table.table_name,
        body = body,
    )
}

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::Connection;

use crate::error::AuditError;

/// Broad value families used when casting string-serialized log values back
/// into typed parameters. Unrecognized declared types fall into `Other` and
/// pass their raw string through unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Text,
    Temporal,
    Boolean,
    Float,
    Binary,
    Other,
}

#[derive(Clone, Debug)]
pub struct ColumnSchema {
    pub name: String,
    pub type_name: String,
    pub family: TypeFamily,
    pub nullable: bool,
    pub identity: bool,
    pub primary_key: bool,
    pub has_default: bool,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct TableSchema {
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// "schema.table", the form the log producer writes into header rows.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Quoted form for use in generated SQL.
    pub fn quoted_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema_name, self.table_name)
    }

    /// Case-insensitive column lookup, matching how the log producer and the
    /// database treat identifiers.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn has_identity_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key && c.identity)
    }
}

/// Read-only snapshot of table metadata, loaded once per reversion run.
/// Never cached across runs because the schema can change between sessions.
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    pub fn load(conn: &Connection, schema: &str) -> Result<Self> {
        let mut stmt = conn.prepare(&format!(
            "SELECT name, sql FROM \"{}\".sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
            schema
        ))?;
        let defs = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = BTreeMap::new();
        for (table_name, sql) in defs {
            let autoincrement = sql
                .map(|s| s.to_ascii_uppercase().contains("AUTOINCREMENT"))
                .unwrap_or(false);
            let columns = Self::load_columns(conn, schema, &table_name, autoincrement)?;
            let table = TableSchema {
                schema_name: schema.to_string(),
                table_name,
                columns,
            };
            tables.insert(table.qualified_name(), table);
        }

        log::debug!("schema catalog loaded with {} tables", tables.len());
        Ok(SchemaCatalog { tables })
    }

    fn load_columns(
        conn: &Connection,
        schema: &str,
        table_name: &str,
        autoincrement: bool,
    ) -> Result<Vec<ColumnSchema>> {
        let mut stmt = conn.prepare(&format!(
            "PRAGMA \"{}\".table_info(\"{}\")",
            schema, table_name
        ))?;
        let mut columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let type_name: String = row.get(2)?;
                let notnull: bool = row.get(3)?;
                let default: Option<rusqlite::types::Value> = row.get(4)?;
                let pk: i64 = row.get(5)?;

                let (family, length, precision, scale) = parse_declared_type(&type_name);
                Ok(ColumnSchema {
                    name,
                    type_name,
                    family,
                    nullable: !notnull,
                    identity: false,
                    primary_key: pk > 0,
                    has_default: !matches!(default, None | Some(rusqlite::types::Value::Null)),
                    length,
                    precision,
                    scale,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Only the single INTEGER primary key of an AUTOINCREMENT table is
        // engine-assigned state the reverter has to manage.
        let pk_count = columns.iter().filter(|c| c.primary_key).count();
        if autoincrement && pk_count == 1 {
            for column in &mut columns {
                if column.primary_key && column.family == TypeFamily::Integer {
                    column.identity = true;
                }
            }
        }

        Ok(columns)
    }

    /// Looks up a table by its qualified name, failing with a schema error
    /// when the log references a table that no longer exists.
    pub fn require(&self, qualified_name: &str) -> Result<&TableSchema> {
        self.tables
            .get(qualified_name)
            .ok_or_else(|| AuditError::Schema(qualified_name.to_string()).into())
    }

    pub fn get(&self, qualified_name: &str) -> Option<&TableSchema> {
        self.tables.get(qualified_name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }
}

fn parse_declared_type(declared: &str) -> (TypeFamily, Option<u32>, Option<u32>, Option<u32>) {
    let upper = declared.to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or("").trim().to_string();

    let family = if base.contains("BOOL") || base == "BIT" {
        TypeFamily::Boolean
    } else if base.contains("DATE") || base.contains("TIME") {
        TypeFamily::Temporal
    } else if base.contains("INT") {
        TypeFamily::Integer
    } else if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") {
        TypeFamily::Text
    } else if base.contains("BLOB") || base.contains("BINA") {
        TypeFamily::Binary
    } else if base.contains("REAL")
        || base.contains("FLOA")
        || base.contains("DOUB")
        || base.contains("DEC")
        || base.contains("NUM")
    {
        TypeFamily::Float
    } else {
        TypeFamily::Other
    };

    let args: Vec<u32> = upper
        .split_once('(')
        .and_then(|(_, rest)| rest.split(')').next())
        .map(|inner| {
            inner
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();

    match family {
        TypeFamily::Text | TypeFamily::Binary => (family, args.first().copied(), None, None),
        _ => (family, None, args.first().copied(), args.get(1).copied()),
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::error::AuditError;

    fn sample_db() -> anyhow::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            CREATE TABLE Artist (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                name     VARCHAR(75) NOT NULL,
                rating   DECIMAL(10, 2),
                active   BOOLEAN NOT NULL DEFAULT 1,
                created  DATETIME DEFAULT CURRENT_TIMESTAMP,
                artwork  BLOB
            );

            CREATE TABLE PlayCount (
                artist_id INTEGER NOT NULL,
                counted   INTEGER NOT NULL
            );
        ",
        )?;
        Ok(conn)
    }

    #[test]
    fn load_reports_column_flags() -> anyhow::Result<()> {
        let conn = sample_db()?;
        let catalog = SchemaCatalog::load(&conn, "main")?;
        let artist = catalog.require("main.Artist")?;

        let id = artist.column("id").unwrap();
        assert!(id.primary_key);
        assert!(id.identity);
        assert_eq!(id.family, TypeFamily::Integer);
        assert!(artist.has_identity_primary_key());

        let name = artist.column("name").unwrap();
        assert_eq!(name.family, TypeFamily::Text);
        assert_eq!(name.length, Some(75));
        assert!(!name.nullable);
        assert!(!name.has_default);

        let rating = artist.column("rating").unwrap();
        assert_eq!(rating.family, TypeFamily::Float);
        assert_eq!(rating.precision, Some(10));
        assert_eq!(rating.scale, Some(2));
        assert!(rating.nullable);

        let active = artist.column("active").unwrap();
        assert_eq!(active.family, TypeFamily::Boolean);
        assert!(active.has_default);

        let created = artist.column("created").unwrap();
        assert_eq!(created.family, TypeFamily::Temporal);
        assert!(created.has_default);

        let artwork = artist.column("artwork").unwrap();
        assert_eq!(artwork.family, TypeFamily::Binary);

        Ok(())
    }

    #[test]
    fn column_lookup_is_case_insensitive() -> anyhow::Result<()> {
        let conn = sample_db()?;
        let catalog = SchemaCatalog::load(&conn, "main")?;
        let artist = catalog.require("main.Artist")?;
        assert_eq!(artist.column("NAME").unwrap().name, "name");
        Ok(())
    }

    #[test]
    fn table_without_primary_key() -> anyhow::Result<()> {
        let conn = sample_db()?;
        let catalog = SchemaCatalog::load(&conn, "main")?;
        let counts = catalog.require("main.PlayCount")?;
        assert!(counts.primary_key().is_none());
        assert!(!counts.has_identity_primary_key());
        Ok(())
    }

    #[test]
    fn missing_table_is_a_schema_error() -> anyhow::Result<()> {
        let conn = sample_db()?;
        let catalog = SchemaCatalog::load(&conn, "main")?;
        let err = catalog.require("main.Dropped").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AuditError>(),
            Some(AuditError::Schema(_))
        ));
        Ok(())
    }

    #[test]
    fn plain_integer_key_is_not_identity() -> anyhow::Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE T (id INTEGER PRIMARY KEY, name TEXT);")?;
        let catalog = SchemaCatalog::load(&conn, "main")?;
        let t = catalog.require("main.T")?;
        assert!(t.primary_key().is_some());
        assert!(!t.has_identity_primary_key());
        Ok(())
    }
}

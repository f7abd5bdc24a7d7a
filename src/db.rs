use std::sync::{Arc, RwLock};

use anyhow::Result;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use serde::de::DeserializeOwned;

use crate::audit::trigger::{self, AuditConfig, Ignore};
use crate::audit::changelog;

#[derive(Clone)]
pub struct Db {
    pub(crate) conn: Arc<RwLock<Connection>>,
}

impl Db {
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Db {
            conn: Arc::new(RwLock::new(conn)),
        })
    }

    pub fn migrate(&self, migrations: &Migrations) -> Result<()> {
        let mut conn = self
            .conn
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock for migration"))?;

        migrations.to_latest(&mut conn)?;

        Ok(())
    }

    /// Shortcut to apply a list of SQL migrations in order.
    pub fn migrate_sql(&self, migrations: &[&str]) -> Result<()> {
        let migrations = Migrations::new(migrations.iter().map(|sql| M::up(sql)).collect());
        self.migrate(&migrations)
    }

    /// Creates the audit log tables and installs the capture triggers on
    /// every user table, using the default configuration and no ignore list.
    pub fn install_audit(&self) -> Result<()> {
        self.install_audit_with(&AuditConfig::default(), &[])
    }

    /// Creates the audit log tables and installs the capture triggers on
    /// every user table not excluded by `ignores`.
    pub fn install_audit_with(&self, config: &AuditConfig, ignores: &[Ignore]) -> Result<()> {
        let conn = self
            .conn
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
        changelog::init_log_tables(&conn, config)?;
        trigger::install_triggers(&conn, config, ignores)?;
        Ok(())
    }

    /// Stamps the audit context with the actor recorded on subsequent log
    /// entries. Uses the default configuration's table names.
    pub fn set_audit_user(&self, user_name: &str) -> Result<()> {
        let conn = self
            .conn
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
        changelog::set_audit_user(&conn, &AuditConfig::default(), user_name)
    }

    pub fn query<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>> {
        let conn = self
            .conn
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;

        let mut stmt = conn.prepare(sql)?;
        let results = serde_rusqlite::from_rows::<T>(stmt.query(params)?)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(results)
    }

    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        let conn = self
            .conn
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;

        log::debug!("SQL EXECUTE: {}", sql);
        let affected = conn.execute(sql, params)?;
        log::debug!("SQL EXECUTE RESULT: {} rows affected", affected);

        Ok(affected)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self
            .conn
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;

        conn.execute_batch(sql)?;
        Ok(())
    }
}

use std::thread;
use std::time::Duration;

use anyhow::Result;

use super::changelog;
use super::merge::merge_changes;
use super::schema::SchemaCatalog;
use super::statement::build_statements;
use super::trigger::AuditConfig;
use crate::db::Db;

/// Grace period before reading the log, letting in-flight writes that
/// started before the revert finish landing their audit rows.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Armed,
    Executing,
    Closed,
}

/// Hooks into the session lifecycle. All methods default to no-ops so an
/// observer implements only what it needs.
pub trait SessionObserver {
    fn session_opened(&self, _session: &RevertSession) -> Result<()> {
        Ok(())
    }

    fn before_revert(&self, _session: &RevertSession) -> Result<()> {
        Ok(())
    }

    fn after_revert(&self, _session: &RevertSession) -> Result<()> {
        Ok(())
    }
}

/// Stamps a fixed actor name into the audit context when the session opens,
/// so every change made during the session is attributed to it.
pub struct ActorIdentity {
    user_name: String,
}

impl ActorIdentity {
    pub fn new(user_name: impl Into<String>) -> Self {
        ActorIdentity {
            user_name: user_name.into(),
        }
    }
}

impl SessionObserver for ActorIdentity {
    fn session_opened(&self, session: &RevertSession) -> Result<()> {
        let conn = session
            .db
            .conn
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;
        changelog::set_audit_user(&conn, session.config(), &self.user_name)
    }
}

/// A checkpointed window of database changes that is rolled back when the
/// session closes. Opening the session records the current top of the change
/// log; closing it (or dropping it unclosed) reverts every change logged
/// after that point and prunes the consumed log rows.
pub struct RevertSession {
    db: Db,
    config: AuditConfig,
    checkpoint: i64,
    observers: Vec<Box<dyn SessionObserver>>,
    state: SessionState,
}

impl RevertSession {
    pub fn open(db: &Db) -> Result<Self> {
        Self::open_with_config(db, AuditConfig::default())
    }

    pub fn open_with_config(db: &Db, config: AuditConfig) -> Result<Self> {
        let checkpoint = {
            let conn = db
                .conn
                .read()
                .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;
            changelog::max_sequence(&conn, &config)?
        };
        log::debug!("revert session opened at checkpoint {}", checkpoint);
        Ok(RevertSession {
            db: db.clone(),
            config,
            checkpoint,
            observers: Vec::new(),
            state: SessionState::Armed,
        })
    }

    /// Attaches an observer and fires its `session_opened` hook.
    pub fn with_observer(mut self, observer: Box<dyn SessionObserver>) -> Result<Self> {
        observer.session_opened(&self)?;
        self.observers.push(observer);
        Ok(self)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// The log sequence the session will revert back to.
    pub fn checkpoint(&self) -> i64 {
        self.checkpoint
    }

    /// Reverts every change logged after the checkpoint and closes the
    /// session. On error nothing has been pruned: the log above the
    /// checkpoint is left intact for diagnosis, though statements that ran
    /// before the failure have already been applied.
    pub fn close(mut self) -> Result<()> {
        self.execute_revert()
    }

    fn execute_revert(&mut self) -> Result<()> {
        self.state = SessionState::Executing;
        for observer in &self.observers {
            observer.before_revert(self)?;
        }

        thread::sleep(SETTLE_DELAY);

        {
            let conn = self
                .db
                .conn
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
            let catalog = SchemaCatalog::load(&conn, &self.config.schema)?;
            let entries = changelog::read_since(&conn, &self.config, self.checkpoint)?;
            log::debug!(
                "reverting {} log entries above checkpoint {}",
                entries.len(),
                self.checkpoint
            );

            let mut reverts = merge_changes(&entries, &catalog)?;
            reverts.sort_by_key(|r| r.order);

            // Build everything up front so a bad entry aborts the run before
            // any statement has touched the database.
            let mut statements = Vec::new();
            for revert in &reverts {
                statements.extend(build_statements(revert)?);
            }

            for statement in &statements {
                log::debug!("SQL EXECUTE: {}", statement.sql);
                conn.execute(
                    &statement.sql,
                    rusqlite::params_from_iter(statement.params.iter()),
                )?;
            }

            changelog::prune(&conn, &self.config, self.checkpoint)?;
        }

        self.state = SessionState::Closed;
        for observer in &self.observers {
            observer.after_revert(self)?;
        }
        Ok(())
    }
}

impl Drop for RevertSession {
    /// An armed session that goes out of scope still reverts. Errors here
    /// can only be logged; a revert that must not be lost should go through
    /// `close` instead.
    fn drop(&mut self) {
        if self.state == SessionState::Armed {
            if let Err(e) = self.execute_revert() {
                log::error!("revert on drop failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::db::Db;

    fn artist_db() -> anyhow::Result<Db> {
        let db = Db::open_memory()?;
        db.migrate_sql(&[
            "CREATE TABLE Artist (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );",
        ])?;
        db.install_audit()?;
        Ok(db)
    }

    #[test]
    fn close_with_no_changes_is_a_no_op() -> anyhow::Result<()> {
        let db = artist_db()?;
        db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Alice"])?;

        let session = RevertSession::open(&db)?;
        session.close()?;

        let count: i64 = {
            let conn = db.conn.read().unwrap();
            conn.query_row("SELECT COUNT(*) FROM Artist", [], |row| row.get(0))?
        };
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn close_reverts_changes_made_inside_the_session() -> anyhow::Result<()> {
        let db = artist_db()?;
        db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Alice"])?;

        let session = RevertSession::open(&db)?;
        db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Bob"])?;
        db.execute("UPDATE Artist SET name = ?1 WHERE name = ?2", &[&"Ann", &"Alice"])?;
        session.close()?;

        let conn = db.conn.read().unwrap();
        let names: Vec<String> = conn
            .prepare("SELECT name FROM Artist ORDER BY id")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec!["Alice".to_string()]);
        Ok(())
    }

    #[test]
    fn drop_runs_the_revert() -> anyhow::Result<()> {
        let db = artist_db()?;
        {
            let _session = RevertSession::open(&db)?;
            db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Bob"])?;
        }

        let count: i64 = {
            let conn = db.conn.read().unwrap();
            conn.query_row("SELECT COUNT(*) FROM Artist", [], |row| row.get(0))?
        };
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn close_prunes_the_consumed_log() -> anyhow::Result<()> {
        let db = artist_db()?;
        db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Alice"])?;

        let session = RevertSession::open(&db)?;
        let checkpoint = session.checkpoint();
        db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Bob"])?;
        session.close()?;

        let conn = db.conn.read().unwrap();
        let max: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM _audit", [], |row| {
                row.get(0)
            })?;
        assert_eq!(max, checkpoint);
        Ok(())
    }

    #[test]
    fn actor_identity_stamps_the_audit_context() -> anyhow::Result<()> {
        let db = artist_db()?;
        let session = RevertSession::open(&db)?
            .with_observer(Box::new(ActorIdentity::new("service-account")))?;

        db.execute("INSERT INTO Artist (name) VALUES (?1)", &[&"Alice"])?;
        let user: String = {
            let conn = db.conn.read().unwrap();
            conn.query_row(
                "SELECT user_name FROM _audit ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )?
        };
        assert_eq!(user, "service-account");

        session.close()?;
        Ok(())
    }

    #[test]
    fn observer_hooks_fire_in_order() -> anyhow::Result<()> {
        struct Counter {
            opened: Arc<AtomicUsize>,
            before: Arc<AtomicUsize>,
            after: Arc<AtomicUsize>,
        }

        impl SessionObserver for Counter {
            fn session_opened(&self, _session: &RevertSession) -> Result<()> {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn before_revert(&self, _session: &RevertSession) -> Result<()> {
                self.before.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn after_revert(&self, _session: &RevertSession) -> Result<()> {
                self.after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let opened = Arc::new(AtomicUsize::new(0));
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let db = artist_db()?;
        let session = RevertSession::open(&db)?.with_observer(Box::new(Counter {
            opened: opened.clone(),
            before: before.clone(),
            after: after.clone(),
        }))?;

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(before.load(Ordering::SeqCst), 0);

        session.close()?;
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        Ok(())
    }
}

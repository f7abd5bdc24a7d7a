pub mod audit;
pub mod db;
pub mod error;

pub use audit::session::RevertSession;
pub use db::Db;
pub use error::AuditError;
pub use rusqlite;
pub use rusqlite_migration;
pub use serde_rusqlite;

pub mod changelog;
pub mod merge;
pub mod schema;
pub mod session;
pub mod statement;
pub mod trigger;

pub use changelog::{ChangeLogEntry, FieldChange, Operation};
pub use merge::{merge_changes, FieldRevert, PendingRevert, RevertKind};
pub use schema::{ColumnSchema, SchemaCatalog, TableSchema, TypeFamily};
pub use session::{ActorIdentity, RevertSession, SessionObserver};
pub use statement::{build_statements, RevertStatement};
pub use trigger::{AuditConfig, Ignore};

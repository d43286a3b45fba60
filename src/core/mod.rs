pub mod error;
pub mod types;

pub use error::{ErrorKind, MigrationError, Result};
pub use types::{MigrationRun, Phase, RunStats, RunStatus, validate_migration_id};

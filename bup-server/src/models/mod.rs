pub mod backup;
pub mod correlation;
pub mod status;

pub use backup::{Backup, Config};
pub use correlation::Correlation;
pub use status::{BackupStatus, Readiness, RunState, SourceStatus, StatusPatch};

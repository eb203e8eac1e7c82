pub mod archive;
pub mod crypto;
pub mod dump;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;

pub use dump::{Dumper, FakeDumper, PgDumper};
pub use models::{BackupJob, JobKind, JobStatus, RemoteFile};
pub use orchestrator::Orchestrator;
pub use scheduler::Scheduler;

pub mod scheduler;
pub mod storage;

pub use scheduler::{
    Assignment, Excl, ExclFamily, Job, JobStateCounts, Queue, Readynet, Target,
};
pub use storage::{
    Host, Note, NoteListItem, Service, ServiceListItem, Severity, StorageCounts, VersionInfo, Vuln,
};

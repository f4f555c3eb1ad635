//! Shared job model for the Recodex transcoding service.
//!
//! Everything that crosses a process boundary lives here: the event
//! vocabulary persisted by the server, the dispatch payloads carried by the
//! broker, and the worker-local task state written to status files so a
//! crashed worker can resume its pipeline.

pub mod events;
pub mod job;
pub mod pgs;
pub mod task;
pub mod worker;

mod serde_bytes;

pub use events::{EventKind, NotificationKind, Status, TaskEvent, TaskEvents, VocabularyError};
pub use job::{Job, JobRequest, JobUpdateNotification};
pub use pgs::{TaskPgs, TaskPgsResponse};
pub use task::{JobAction, JobControlEvent, TaskEncode, TaskStatus, WorkTaskEncode};
pub use worker::Worker;

//! `vectorsync-core` - domain building blocks for the embedding job queue.
//!
//! This crate contains **pure domain** types (no storage or I/O).

pub mod checkpoint;
pub mod error;
pub mod id;
pub mod job;
pub mod seen;
pub mod source;
pub mod work_item;

pub use checkpoint::Checkpoint;
pub use error::DomainError;
pub use id::{ClaimToken, JobId, SourceUuid, SourceVersion};
pub use job::{
    Job, JobKey, JobState, JobStats, JobType, NewJob, RetryPolicy, clamp_error_message,
};
pub use seen::{SeenObservation, SeenRecord};
pub use source::{
    DEFAULT_COLLECTION_KEY, EntryDescriptor, SourceRecord, is_safe_table_name,
    normalize_collection_key,
};
pub use work_item::{
    DomainMetadata, PayloadSnapshot, WorkAction, WorkItem, content_hash,
};

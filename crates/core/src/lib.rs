//! `filescan-core`: domain foundation for the file-scanning service.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the content digest, the letter-count result type, the job
//! entity with its state machine, and the error taxonomy.

pub mod counts;
pub mod digest;
pub mod error;
pub mod id;
pub mod job;

pub use counts::LetterCounts;
pub use digest::{ContentDigest, DigestHasher};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobSnapshot, JobStatus, ReleaseOutcome};

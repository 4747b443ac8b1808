//! Deciding what needs to be uploaded.

pub mod change;
pub mod checksum;

pub use change::{ChangeDecision, ChangeDetector, DetectError, Evaluation, UploadReason};
pub use checksum::{ChecksumAlgorithm, ChecksumHasher};

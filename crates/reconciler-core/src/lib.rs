//! Core domain algebra for the reconciler: the Document tree, the Diff
//! patch algebra, validated key types, and path-granular merge.

pub mod diff;
pub mod document;
pub mod key;
pub mod merge;

pub use diff::{diff, Diff, DiffMismatch, Operation};
pub use document::{Document, DocumentError, Path, PathError};
pub use key::{DiffId, EntityName, ForeignKey, InternalKey, KeyError, OperationId, SourceName};
pub use merge::{merge, Candidate, MergeDecision, MergeOutcome, MergeStrategy, RejectOnDisagreement};

//! Patch algebra over [`Document`]s: compute, apply, label (§4.2).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::{Document, Path};

/// A single per-path change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// The path was absent in the source Document and present in the target.
    Insert { path: Path, value: String },
    /// The path was present in the source Document and absent in the target.
    Delete { path: Path, old_value: String },
    /// The path was present in both, with a different value.
    Replace {
        path: Path,
        old_value: String,
        new_value: String,
    },
}

impl Operation {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Insert { path, .. } | Self::Delete { path, .. } | Self::Replace { path, .. } => {
                path
            }
        }
    }

    /// The value this operation leaves at `path` after application, or
    /// `None` for a `Delete`.
    #[must_use]
    pub fn final_value(&self) -> Option<&str> {
        match self {
            Self::Insert { value, .. } | Self::Replace { new_value: value, .. } => Some(value),
            Self::Delete { .. } => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { path, value } => write!(f, "Insert({path}, {value:?})"),
            Self::Delete { path, old_value } => write!(f, "Delete({path}, {old_value:?})"),
            Self::Replace {
                path,
                old_value,
                new_value,
            } => write!(f, "Replace({path}, {old_value:?} -> {new_value:?})"),
        }
    }
}

/// Opaque provenance tag attached to a [`Diff`]. Source-originated diffs are
/// labelled with the source name; the server-computed `applied` diff keeps
/// per-operation provenance rather than a single diff-wide label (see
/// `Diff::labels_by_path` and the reconciler's merge step).
pub type Label = String;

/// An ordered sequence of per-path operations (§3).
///
/// Operations are stored in deterministic (lexicographic-by-path) order so
/// that two Diffs describing the same change compare and serialize
/// identically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    operations: Vec<Operation>,
    /// Provenance label, if this Diff originated from a single source.
    pub label: Option<Label>,
}

/// Error returned when a [`Diff`] cannot be applied to a given [`Document`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffMismatch {
    /// The first operation that failed to apply.
    pub operation: Operation,
}

impl fmt::Display for DiffMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "diff cannot be applied: {} does not match document", self.operation)
    }
}

impl std::error::Error for DiffMismatch {}

impl Diff {
    /// The zero-length Diff.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Build a Diff from an already-sorted-by-path operation list. Used by
    /// [`diff`] and by the merge step, which both produce operations in
    /// path order by construction.
    #[must_use]
    pub fn from_sorted_operations(operations: Vec<Operation>) -> Self {
        debug_assert!(
            operations.windows(2).all(|w| w[0].path() <= w[1].path()),
            "operations must be sorted by path"
        );
        Self {
            operations,
            label: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<Label>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Return `true` if any operation in this Diff touches `path`.
    #[must_use]
    pub fn touches(&self, path: &Path) -> bool {
        self.operations.iter().any(|op| op.path() == path)
    }
}

/// Compute the minimal Diff `p` such that `apply(p, a) == b` (§4.2).
///
/// For every path in `paths(a) ∪ paths(b)`, exactly one operation is
/// emitted iff the path's value differs between `a` and `b`. Operations are
/// ordered lexicographically by path for deterministic storage/equality.
#[must_use]
pub fn diff(a: &Document, b: &Document) -> Diff {
    let mut all_paths: Vec<Path> = a.paths();
    for p in b.paths() {
        if !all_paths.contains(&p) {
            all_paths.push(p);
        }
    }
    all_paths.sort();

    let mut operations = Vec::new();
    for path in all_paths {
        let av = a.get(&path);
        let bv = b.get(&path);
        match (av, bv) {
            (None, Some(v)) => operations.push(Operation::Insert {
                path,
                value: v.to_owned(),
            }),
            (Some(v), None) => operations.push(Operation::Delete {
                path,
                old_value: v.to_owned(),
            }),
            (Some(old), Some(new)) if old != new => operations.push(Operation::Replace {
                path,
                old_value: old.to_owned(),
                new_value: new.to_owned(),
            }),
            _ => {}
        }
    }

    Diff::from_sorted_operations(operations)
}

/// Apply `diff` to `doc`, returning the resulting Document.
///
/// Total when every `Delete` and `Replace` operation's recorded old value
/// matches `doc`'s current value at that path; otherwise fails with
/// [`DiffMismatch`] identifying the first failing operation.
pub fn apply(patch: &Diff, doc: &Document) -> Result<Document, DiffMismatch> {
    let mut out = doc.clone();
    for op in patch.operations() {
        match op {
            Operation::Insert { path, value } => {
                out.set(path, value.clone());
            }
            Operation::Delete { path, old_value } => {
                if out.get(path) != Some(old_value.as_str()) {
                    return Err(DiffMismatch {
                        operation: op.clone(),
                    });
                }
                out.remove(path);
            }
            Operation::Replace {
                path,
                old_value,
                new_value,
            } => {
                if out.get(path) != Some(old_value.as_str()) {
                    return Err(DiffMismatch {
                        operation: op.clone(),
                    });
                }
                out.set(path, new_value.clone());
            }
        }
    }
    Ok(out)
}

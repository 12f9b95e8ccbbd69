//! Per-path merge of multiple source patches against a shared baseline
//! (§4.2).
//!
//! Each source's current Document is diffed against the baseline before it
//! reaches this module, producing one labeled [`Diff`] per source. `merge`
//! combines those patches path by path: a path touched by exactly one
//! source's patch (or by several sources proposing the same final value)
//! automerges; a path where two sources propose different final values is a
//! conflict and every operation touching it is rejected back to its source.

use std::collections::BTreeMap;

use crate::diff::{Diff, Operation};
use crate::document::Path;

/// A candidate operation on the way into a merge: its source label plus the
/// operation itself.
#[derive(Clone, Debug)]
pub struct Candidate<'a> {
    pub label: &'a str,
    pub operation: &'a Operation,
}

/// The decision a [`MergeStrategy`] makes for one path's set of candidate
/// operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeDecision {
    /// All candidates agree (or there is only one); apply this operation.
    Automerge(Operation),
    /// Candidates disagree; reject all of them for human adjudication.
    Conflict,
}

/// Pluggable merge policy for a single path's conflicting candidates.
///
/// The shipped [`RejectOnDisagreement`] strategy is the only one named by
/// configuration today; the trait exists so a future strategy (e.g.
/// last-writer-wins by source priority) can be registered per entity
/// without changing the merge loop.
pub trait MergeStrategy: Send + Sync {
    fn decide(&self, path: &Path, candidates: &[Candidate<'_>]) -> MergeDecision;
}

/// Accepts a path only when every candidate proposes the same final value
/// (including the all-delete case); otherwise rejects every candidate on
/// that path.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectOnDisagreement;

impl MergeStrategy for RejectOnDisagreement {
    fn decide(&self, _path: &Path, candidates: &[Candidate<'_>]) -> MergeDecision {
        let Some(first) = candidates.first() else {
            return MergeDecision::Conflict;
        };
        let agree = candidates
            .iter()
            .all(|c| c.operation.final_value() == first.operation.final_value());
        if agree {
            MergeDecision::Automerge(first.operation.clone())
        } else {
            MergeDecision::Conflict
        }
    }
}

/// The result of merging a baseline's source patches: the combined
/// automerged [`Diff`] to write back to every source, plus one rejected
/// [`Diff`] per source carrying the operations that source proposed but
/// that conflicted with another source's proposal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub applied: Diff,
    pub rejected: Vec<Diff>,
}

/// Merge a set of labeled, baseline-relative patches using `strategy`.
///
/// Patches must each carry a `label` (the source they came from); an
/// unlabeled patch is treated as an anonymous single-candidate source and
/// never conflicts with anything, since `label` grouping for the rejected
/// side falls back to an empty string.
#[must_use]
pub fn merge(patches: &[Diff], strategy: &dyn MergeStrategy) -> MergeOutcome {
    let mut by_path: BTreeMap<&Path, Vec<Candidate<'_>>> = BTreeMap::new();
    for patch in patches {
        let label = patch.label.as_deref().unwrap_or("");
        for op in patch.operations() {
            by_path.entry(op.path()).or_default().push(Candidate {
                label,
                operation: op,
            });
        }
    }

    let mut applied_ops = Vec::new();
    let mut rejected_by_label: BTreeMap<&str, Vec<Operation>> = BTreeMap::new();

    for (path, candidates) in by_path {
        match strategy.decide(path, &candidates) {
            MergeDecision::Automerge(op) => applied_ops.push(op),
            MergeDecision::Conflict => {
                for c in candidates {
                    rejected_by_label
                        .entry(c.label)
                        .or_default()
                        .push(c.operation.clone());
                }
            }
        }
    }

    let rejected = rejected_by_label
        .into_iter()
        .map(|(label, ops)| {
            let diff = Diff::from_sorted_operations(ops);
            if label.is_empty() {
                diff
            } else {
                diff.with_label(label.to_owned())
            }
        })
        .collect();

    MergeOutcome {
        applied: Diff::from_sorted_operations(applied_ops),
        rejected,
    }
}

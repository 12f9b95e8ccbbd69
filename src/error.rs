//! Unified error type for the reconciler.
//!
//! Defines [`ReconcileError`], used across the store, driver registry,
//! reconciler cycle, dispatcher, and server. Error messages are written to
//! be actionable: each variant's `Display` impl names what went wrong and
//! what to do about it. [`ReconcileError::to_wire_kind`] maps every variant
//! to the small set of error kinds the wire protocol exposes, so internal
//! detail (paths, stderr, source labels) never crosses the server boundary.

use std::fmt;
use std::path::PathBuf;

use reconciler_core::diff::DiffMismatch;
use reconciler_core::document::Path;
use reconciler_core::key::{EntityName, InternalKey, SourceName};

/// Unified error type for reconciler operations.
#[derive(Debug)]
pub enum ReconcileError {
    /// A wire message failed to decode or violated the protocol.
    InvalidMessage {
        /// Human-readable description of the malformed frame.
        detail: String,
    },

    /// The request named an entity with no matching `entities.<entity>`
    /// table in the configuration.
    UnknownEntity {
        /// The entity name that was requested.
        entity: EntityName,
    },

    /// The request named a source with no matching
    /// `entities.<entity>.<source>` table in the configuration.
    UnknownSource {
        /// The entity the source was requested under.
        entity: EntityName,
        /// The source name that was requested.
        source: SourceName,
    },

    /// No record exists for the given internal key.
    NotFound {
        /// The internal key that was not found.
        key: InternalKey,
    },

    /// A data source driver could not complete an operation right now, but
    /// may succeed on retry (connection refused, timeout, non-2xx, ...).
    Unavailable {
        /// The source that failed.
        source: SourceName,
        /// Human-readable description of the failure.
        detail: String,
    },

    /// A merge produced one or more rejected operations that are now
    /// parked for human adjudication.
    Conflict {
        /// The internal key the conflict belongs to.
        key: InternalKey,
        /// The paths that conflicted.
        paths: Vec<Path>,
    },

    /// A diff could not be applied because the document it targets no
    /// longer matches the diff's recorded prior state.
    DiffMismatch(DiffMismatch),

    /// A long-running operation (a flush, a worker loop) was cancelled
    /// before completing.
    Cancelled {
        /// What was in progress when cancellation was observed.
        detail: String,
    },

    /// A configuration file could not be loaded or parsed.
    ConfigError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// An I/O error occurred during a store, driver, or server operation.
    Io(std::io::Error),

    /// A condition the engine cannot recover from or attribute to any of
    /// the above: a broken store invariant, a poisoned lock, an unexpected
    /// combination of internal state.
    Internal {
        /// Human-readable description of the problem.
        detail: String,
    },
}

/// The error kinds exposed on the wire (§7). Internal detail — paths,
/// stderr, source names — is never sent to a client; only the kind and a
/// short message are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireErrorKind {
    InvalidMessage,
    UnknownEntity,
    UnknownSource,
    NotFound,
    Unavailable,
    Conflict,
    Internal,
}

impl ReconcileError {
    /// Map this error to the wire-level error kind a client should see.
    /// Used exclusively at the server response boundary.
    #[must_use]
    pub const fn to_wire_kind(&self) -> WireErrorKind {
        match self {
            Self::InvalidMessage { .. } => WireErrorKind::InvalidMessage,
            Self::UnknownEntity { .. } => WireErrorKind::UnknownEntity,
            Self::UnknownSource { .. } => WireErrorKind::UnknownSource,
            Self::NotFound { .. } => WireErrorKind::NotFound,
            Self::Unavailable { .. } => WireErrorKind::Unavailable,
            Self::Conflict { .. } => WireErrorKind::Conflict,
            Self::DiffMismatch(_) | Self::Cancelled { .. } | Self::ConfigError { .. } | Self::Io(_) | Self::Internal { .. } => {
                WireErrorKind::Internal
            }
        }
    }

    /// `true` for errors the dispatcher should retry with backoff rather
    /// than park the notification as a conflict.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMessage { detail } => {
                write!(
                    f,
                    "malformed request: {detail}\n  To fix: check the client's wire encoding against the protocol's frame layout."
                )
            }
            Self::UnknownEntity { entity } => {
                write!(
                    f,
                    "unknown entity '{entity}'.\n  To fix: add an `[entities.{entity}]` table to the configuration file."
                )
            }
            Self::UnknownSource { entity, source } => {
                write!(
                    f,
                    "unknown source '{source}' for entity '{entity}'.\n  To fix: add an `[entities.{entity}.{source}]` table to the configuration file."
                )
            }
            Self::NotFound { key } => {
                write!(
                    f,
                    "no record found for key '{key}'.\n  To fix: submit a Notify for this key from a tracking source first."
                )
            }
            Self::Unavailable { source, detail } => {
                write!(
                    f,
                    "source '{source}' is unavailable: {detail}\n  To fix: nothing — the dispatcher will retry with backoff."
                )
            }
            Self::Conflict { key, paths } => {
                write!(f, "key '{key}' has {} conflicting path(s):", paths.len())?;
                for p in paths {
                    write!(f, "\n  - {p}")?;
                }
                write!(
                    f,
                    "\n  To fix: call ListConflicts for '{key}' and Resolve each path."
                )
            }
            Self::DiffMismatch(inner) => {
                write!(
                    f,
                    "{inner}\n  To fix: re-fetch the current document and recompute the diff before applying."
                )
            }
            Self::Cancelled { detail } => {
                write!(f, "operation cancelled: {detail}")
            }
            Self::ConfigError { path, detail } => {
                write!(
                    f,
                    "configuration error in '{}': {}\n  To fix: edit the config file and correct the issue.",
                    path.display(),
                    detail
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions, the socket path, and disk space."
                )
            }
            Self::Internal { detail } => {
                write!(f, "internal error: {detail}")
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::DiffMismatch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DiffMismatch> for ReconcileError {
    fn from(err: DiffMismatch) -> Self {
        Self::DiffMismatch(err)
    }
}

impl From<crate::config::ConfigError> for ReconcileError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::ConfigError {
            path: err.path.unwrap_or_default(),
            detail: err.message,
        }
    }
}

//! Reconciler configuration (`config.toml`).
//!
//! Defines the typed configuration for a reconciler deployment: which
//! entities and sources it tracks, where the driver commands for each
//! source live, the dispatcher's concurrency/retry tunables, the merge
//! strategy, and the ambient logging/socket/database settings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use reconciler_core::key::{EntityName, SourceName};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level reconciler configuration.
///
/// Parsed from a TOML file named on the command line. Missing fields use
/// sensible defaults. Missing file → all defaults (no error).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Identifies the persistent store backend. The shipped reference store
    /// is in-process (`"memory"`); any other value is reserved for a
    /// durable backend that satisfies the same store contract.
    #[serde(default = "default_database")]
    pub database: String,

    /// Where to write logs when no OTLP endpoint is configured.
    #[serde(default)]
    pub logging: LoggingTarget,

    /// Path of the Unix domain socket the server listens on.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Per-entity tracking configuration, keyed by entity name.
    #[serde(default)]
    pub entities: BTreeMap<EntityName, EntityConfig>,

    /// Dispatcher concurrency and retry tunables.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Merge strategy selection.
    #[serde(default)]
    pub merge: MergeSettings,

    /// Per-driver-call timeout, in seconds (§5). A `get`/`set`/`delete`
    /// call that hasn't returned by this deadline is treated as
    /// [`crate::error::ReconcileError::Unavailable`] and left to the
    /// dispatcher's retry/backoff.
    #[serde(default = "default_driver_timeout_secs")]
    pub driver_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            logging: LoggingTarget::default(),
            socket: default_socket(),
            entities: BTreeMap::new(),
            dispatcher: DispatcherConfig::default(),
            merge: MergeSettings::default(),
            driver_timeout_secs: default_driver_timeout_secs(),
        }
    }
}

fn default_database() -> String {
    "memory".to_owned()
}

fn default_socket() -> PathBuf {
    PathBuf::from("reconciler.sock")
}

const fn default_driver_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// LoggingTarget
// ---------------------------------------------------------------------------

/// Where non-OTLP log output goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingTarget {
    /// Write human-readable logs to stderr (default).
    #[default]
    Stderr,
    /// Write human-readable logs to stdout.
    Stdout,
    /// Suppress non-OTLP log output entirely.
    None,
}

impl fmt::Display for LoggingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stderr => write!(f, "stderr"),
            Self::Stdout => write!(f, "stdout"),
            Self::None => write!(f, "none"),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityConfig / SourceConfig
// ---------------------------------------------------------------------------

/// Tracking configuration for one entity.
///
/// Each source the entity is tracked in is a nested table named after the
/// source, so `entities.customer.crm.read = "..."` deserializes as the
/// `"crm"` entry of `sources`. `#[serde(flatten)]` is required to capture
/// these dynamically-named source tables, which means this struct cannot
/// also carry `deny_unknown_fields` — `sources` absorbs everything that
/// isn't `enabled`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct EntityConfig {
    /// Whether the reconciler should act on notifications for this entity.
    #[serde(default = "default_entity_enabled")]
    pub enabled: bool,

    /// Source name → driver command configuration.
    #[serde(flatten)]
    pub sources: BTreeMap<SourceName, SourceConfig>,
}

const fn default_entity_enabled() -> bool {
    true
}

/// Driver command templates for one `(entity, source)` pair, consumed by
/// the shell driver. Each command is run with `%fk` substituted for the
/// foreign key and, for `create`/`update`, the Document supplied as JSON on
/// stdin.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Command to create a new record, given a Document on stdin.
    pub create: String,
    /// Command to read the current Document for a foreign key.
    pub read: String,
    /// Command to write an updated Document, given the Document on stdin.
    pub update: String,
    /// Command to delete the record for a foreign key.
    pub delete: String,
}

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

/// Dispatcher concurrency and retry tunables (§4.6).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Size of the bounded worker pool.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Maximum retry attempts before a notification is parked as a
    /// conflict rather than retried again.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_limit: default_retry_limit(),
        }
    }
}

const fn default_workers() -> u32 {
    4
}

const fn default_retry_limit() -> u32 {
    8
}

// ---------------------------------------------------------------------------
// MergeSettings
// ---------------------------------------------------------------------------

/// Merge strategy selection (§4.2).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
#[derive(Default)]
pub struct MergeSettings {
    /// Which merge strategy to use for every tracked entity.
    #[serde(default)]
    pub strategy: MergeStrategyKind,
}

/// The set of merge strategies the config schema can name. Only one ships
/// today; the slot exists so a future strategy doesn't need a schema
/// migration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategyKind {
    /// Automerge only when every source proposes the same final value;
    /// otherwise reject for human adjudication.
    #[default]
    RejectOnDisagreement,
}

impl fmt::Display for MergeStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RejectOnDisagreement => write!(f, "reject-on-disagreement"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a reconciler configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ReconcilerConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError { path: None, message }
        })
    }

    /// Load and merge several configuration files in order.
    ///
    /// Later files override earlier ones: scalar keys (`database`,
    /// `logging`, `socket`, ...) are replaced outright, and tables
    /// (`entities.*`, `dispatcher`, `merge`) are merged key by key,
    /// recursively, so a later file can add or override a single entity or
    /// source without repeating the rest. An empty `paths` slice yields
    /// [`ReconcilerConfig::default`].
    ///
    /// # Errors
    /// Returns `ConfigError` if any file exists but fails to parse as TOML.
    pub fn load_merged(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in paths {
            let contents = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ConfigError {
                        path: Some(path.clone()),
                        message: format!("could not read file: {e}"),
                    });
                }
            };
            let value: toml::Value = contents.parse().map_err(|e: toml::de::Error| ConfigError {
                path: Some(path.clone()),
                message: e.message().to_owned(),
            })?;
            merge_toml_tables(&mut merged, value);
        }
        ReconcilerConfig::deserialize(merged).map_err(|e: toml::de::Error| ConfigError {
            path: paths.last().cloned(),
            message: e.message().to_owned(),
        })
    }
}

/// Recursively merge `overlay` into `base`, with `overlay`'s values winning
/// on conflict. Non-table values simply replace; tables merge key by key.
fn merge_toml_tables(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_toml_tables(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

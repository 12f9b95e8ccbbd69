//! Data-source driver contract and the runtime registry that dispatches
//! over concrete drivers (§4.3).
//!
//! A driver owns CRUD access to one `(entity, source)` pair. The registry
//! is populated from the `entities.*` tables in [`crate::config`] at
//! startup — an entity/source combination with no matching driver is an
//! [`ReconcileError::UnknownSource`], not a panic, since the set of
//! entities is only known once the config file is read.

use std::collections::HashMap;

use reconciler_core::document::Document;
use reconciler_core::key::{EntityName, ForeignKey, SourceName};

use crate::config::ReconcilerConfig;
use crate::drivers::memory::MemoryDriver;
use crate::drivers::shell::ShellDriver;
use crate::error::ReconcileError;

/// Per-`(entity, source)` CRUD contract over a [`Document`].
pub trait DataSourceDriver: Send + Sync {
    /// Fetch the current Document for `fk`, or `None` if the source has no
    /// record for it.
    fn read(&self, fk: &ForeignKey) -> impl std::future::Future<Output = Result<Option<Document>, ReconcileError>> + Send;

    /// Create a new record at `fk` with the given Document.
    fn create(&self, fk: &ForeignKey, doc: &Document) -> impl std::future::Future<Output = Result<(), ReconcileError>> + Send;

    /// Overwrite the record at `fk` with the given Document.
    fn update(&self, fk: &ForeignKey, doc: &Document) -> impl std::future::Future<Output = Result<(), ReconcileError>> + Send;

    /// Delete the record at `fk`.
    fn delete(&self, fk: &ForeignKey) -> impl std::future::Future<Output = Result<(), ReconcileError>> + Send;
}

/// Enum-dispatch over the drivers this crate ships, so the registry can
/// hold a single concrete type without trait objects (native `async fn` in
/// traits isn't object-safe).
pub enum AnyDriver {
    Shell(ShellDriver),
    Memory(MemoryDriver),
}

impl DataSourceDriver for AnyDriver {
    async fn read(&self, fk: &ForeignKey) -> Result<Option<Document>, ReconcileError> {
        match self {
            Self::Shell(d) => d.read(fk).await,
            Self::Memory(d) => d.read(fk).await,
        }
    }

    async fn create(&self, fk: &ForeignKey, doc: &Document) -> Result<(), ReconcileError> {
        match self {
            Self::Shell(d) => d.create(fk, doc).await,
            Self::Memory(d) => d.create(fk, doc).await,
        }
    }

    async fn update(&self, fk: &ForeignKey, doc: &Document) -> Result<(), ReconcileError> {
        match self {
            Self::Shell(d) => d.update(fk, doc).await,
            Self::Memory(d) => d.update(fk, doc).await,
        }
    }

    async fn delete(&self, fk: &ForeignKey) -> Result<(), ReconcileError> {
        match self {
            Self::Shell(d) => d.delete(fk).await,
            Self::Memory(d) => d.delete(fk).await,
        }
    }
}

/// The set of drivers registered at startup, keyed by `(entity, source)`.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<(EntityName, SourceName), AnyDriver>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of shell drivers from every `entities.*.*` table in
    /// `config`.
    #[must_use]
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        let mut drivers = HashMap::new();
        for (entity, entity_cfg) in &config.entities {
            for (source, source_cfg) in &entity_cfg.sources {
                drivers.insert(
                    (entity.clone(), source.clone()),
                    AnyDriver::Shell(ShellDriver::new(source.clone(), source_cfg.clone())),
                );
            }
        }
        Self { drivers }
    }

    /// Register (or replace) a driver for `(entity, source)` directly —
    /// used by tests and by `--dry-run` to wire in [`MemoryDriver`]s.
    pub fn insert(&mut self, entity: impl Into<EntityName>, source: impl Into<SourceName>, driver: AnyDriver) {
        self.drivers.insert((entity.into(), source.into()), driver);
    }

    /// Look up the driver for `(entity, source)`.
    ///
    /// # Errors
    /// Returns [`ReconcileError::UnknownSource`] if no driver is
    /// registered for the pair.
    pub fn get(&self, entity: &str, source: &str) -> Result<&AnyDriver, ReconcileError> {
        self.drivers
            .get(&(entity.to_owned(), source.to_owned()))
            .ok_or_else(|| ReconcileError::UnknownSource {
                entity: entity.to_owned(),
                source: source.to_owned(),
            })
    }

    /// Every source name registered for `entity`, in no particular order.
    #[must_use]
    pub fn sources_for(&self, entity: &str) -> Vec<SourceName> {
        self.drivers
            .keys()
            .filter(|(e, _)| e == entity)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDriver;

    #[test]
    fn unknown_source_is_an_error() {
        let registry = DriverRegistry::new();
        let err = registry.get("customer", "crm").unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownSource { .. }));
    }

    #[test]
    fn sources_for_filters_by_entity() {
        let mut registry = DriverRegistry::new();
        registry.insert("customer", "crm", AnyDriver::Memory(MemoryDriver::new()));
        registry.insert("customer", "billing", AnyDriver::Memory(MemoryDriver::new()));
        registry.insert("invoice", "billing", AnyDriver::Memory(MemoryDriver::new()));

        let mut sources = registry.sources_for("customer");
        sources.sort();
        assert_eq!(sources, vec!["billing".to_owned(), "crm".to_owned()]);
    }
}

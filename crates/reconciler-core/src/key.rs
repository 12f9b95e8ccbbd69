//! Validated key types: [`InternalKey`], [`ForeignKey`], [`OperationId`],
//! [`DiffId`] (§3).
//!
//! `InternalKey` and `ForeignKey` both carry an `entity` marker so a key
//! minted for one entity can't be silently used to look up another. The
//! marker is a plain `String` compared at construction and lookup time
//! rather than a compile-time type parameter, because the entity set is
//! read from the config file at startup and isn't known at compile time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error returned when a key or identifier fails validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyError(pub String);

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid key: {}", self.0)
    }
}

impl std::error::Error for KeyError {}

fn validate_non_empty(kind: &str, s: &str) -> Result<(), KeyError> {
    if s.is_empty() {
        return Err(KeyError(format!("{kind} must not be empty")));
    }
    if s.chars().any(char::is_whitespace) {
        return Err(KeyError(format!("{kind} must not contain whitespace: {s:?}")));
    }
    Ok(())
}

/// The name of an entity type (e.g. `"customer"`), as declared under
/// `entities.<entity>` in the config file.
pub type EntityName = String;

/// The name of a data source tracking an entity (e.g. `"crm"`), as declared
/// under `entities.<entity>.<source>` in the config file.
pub type SourceName = String;

/// The reconciler's own identifier for one logical record, stable across
/// every source that tracks it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    entity: EntityName,
    id: String,
}

impl InternalKey {
    /// # Errors
    /// Returns [`KeyError`] if `entity` or `id` is empty or contains
    /// whitespace.
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Result<Self, KeyError> {
        let entity = entity.into();
        let id = id.into();
        validate_non_empty("entity name", &entity)?;
        validate_non_empty("internal key id", &id)?;
        Ok(Self { entity, id })
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `true` if this key was minted for `entity`.
    #[must_use]
    pub fn belongs_to(&self, entity: &str) -> bool {
        self.entity == entity
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.id)
    }
}

/// A source's own identifier for a record, scoped to `(entity, source)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    entity: EntityName,
    source: SourceName,
    id: String,
}

impl ForeignKey {
    /// # Errors
    /// Returns [`KeyError`] if `entity`, `source`, or `id` is empty or
    /// contains whitespace.
    pub fn new(
        entity: impl Into<String>,
        source: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let entity = entity.into();
        let source = source.into();
        let id = id.into();
        validate_non_empty("entity name", &entity)?;
        validate_non_empty("source name", &source)?;
        validate_non_empty("foreign key id", &id)?;
        Ok(Self { entity, source, id })
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn belongs_to(&self, entity: &str) -> bool {
        self.entity == entity
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.entity, self.source, self.id)
    }
}

/// The index of an operation within the `applied` or `rejected` list of the
/// `DiffRecord` it belongs to. Stable because `DiffRecord`s are immutable
/// once written; not meaningful outside the record that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Identifies one persisted `DiffRecord`, monotonically assigned by the
/// store at write time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiffId(pub u64);

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "diff#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_key_rejects_empty_parts() {
        assert!(InternalKey::new("", "42").is_err());
        assert!(InternalKey::new("customer", "").is_err());
    }

    #[test]
    fn internal_key_rejects_whitespace() {
        assert!(InternalKey::new("cust omer", "42").is_err());
    }

    #[test]
    fn internal_key_belongs_to_checks_entity() {
        let k = InternalKey::new("customer", "42").unwrap();
        assert!(k.belongs_to("customer"));
        assert!(!k.belongs_to("invoice"));
    }

    #[test]
    fn foreign_key_display_includes_all_parts() {
        let k = ForeignKey::new("customer", "crm", "cust_001").unwrap();
        assert_eq!(k.to_string(), "customer:crm:cust_001");
    }

    #[test]
    fn internal_key_ordering_is_deterministic() {
        let a = InternalKey::new("customer", "1").unwrap();
        let b = InternalKey::new("customer", "2").unwrap();
        assert!(a < b);
    }

    #[test]
    fn operation_id_display() {
        assert_eq!(OperationId(3).to_string(), "op#3");
    }
}

//! Canonical Document tree — a string-keyed, string-leaved value (§4.1).
//!
//! A [`Document`] is an unordered mapping from field path to text value.
//! Internally it is stored as a sorted tree so that two Documents built
//! from the same path→value mapping are byte-for-byte identical and
//! structurally `Eq`, regardless of insertion order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single non-empty path segment.
pub type Segment = String;

/// An ordered sequence of non-empty path segments identifying one field.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(Vec<Segment>);

impl Path {
    /// Build a path from segments. Panics if any segment is empty — callers
    /// construct paths from validated Document traversal or from
    /// [`Path::parse`], never from unchecked user input directly.
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        debug_assert!(
            segments.iter().all(|s| !s.is_empty()),
            "path segments must be non-empty"
        );
        Self(segments)
    }

    /// Parse a dotted path string (`"a.b.c"`) into segments.
    ///
    /// # Errors
    /// Returns an error if the string is empty or contains an empty segment
    /// (e.g. a leading, trailing, or doubled `.`).
    pub fn parse(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Err(PathError(s.to_owned()));
        }
        let segments: Vec<Segment> = s.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PathError(s.to_owned()));
        }
        Ok(Self(segments))
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    #[must_use]
    pub fn as_dotted(&self) -> String {
        self.0.join(".")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_dotted())
    }
}

/// Error returned when a dotted path string is malformed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathError(pub String);

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid path {:?}: segments must be non-empty", self.0)
    }
}

impl std::error::Error for PathError {}

/// A node in the Document tree: either a text leaf or a nested object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Leaf(String),
    Branch(BTreeMap<Segment, Node>),
}

/// The canonical Document tree (§3, §4.1).
///
/// Two Documents are equal exactly when they expose the same path→value
/// mapping; the `BTreeMap`-backed representation makes this `PartialEq`
/// derivation correct without a separate normalization pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Document {
    root: BTreeMap<Segment, Node>,
}

/// Error returned when a JSON value cannot be interpreted as a Document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentError(pub String);

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed document: {}", self.0)
    }
}

impl std::error::Error for DocumentError {}

impl Document {
    /// The empty Document — no paths.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up the value at `path`, if present.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&str> {
        let mut node_map = &self.root;
        let segments = path.segments();
        for (i, seg) in segments.iter().enumerate() {
            match node_map.get(seg) {
                Some(Node::Leaf(v)) if i == segments.len() - 1 => return Some(v),
                Some(Node::Branch(m)) if i != segments.len() - 1 => node_map = m,
                _ => return None,
            }
        }
        None
    }

    /// Return every path present in this Document, in deterministic
    /// (lexicographic) order.
    #[must_use]
    pub fn paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        collect_paths(&self.root, &mut Vec::new(), &mut out);
        out
    }

    /// Set (or overwrite) the value at `path`, creating intermediate
    /// branches as needed. Used internally by [`crate::diff::apply`].
    pub(crate) fn set(&mut self, path: &Path, value: String) {
        let segments = path.segments();
        let mut node_map = &mut self.root;
        for (i, seg) in segments.iter().enumerate() {
            if i == segments.len() - 1 {
                node_map.insert(seg.clone(), Node::Leaf(value));
                return;
            }
            let entry = node_map
                .entry(seg.clone())
                .or_insert_with(|| Node::Branch(BTreeMap::new()));
            match entry {
                Node::Branch(m) => node_map = m,
                Node::Leaf(_) => {
                    *entry = Node::Branch(BTreeMap::new());
                    let Node::Branch(m) = entry else { unreachable!() };
                    node_map = m;
                }
            }
        }
    }

    /// Remove the value at `path`. A no-op if the path is absent. Used
    /// internally by [`crate::diff::apply`].
    pub(crate) fn remove(&mut self, path: &Path) {
        remove_rec(&mut self.root, path.segments());
    }

    /// Parse a Document from its self-describing JSON-shaped text format:
    /// nested objects of string→(string|object). Paths are derived by
    /// flattening nested objects; values are coerced to text.
    ///
    /// # Errors
    /// Returns [`DocumentError`] if `value` is not an object, or contains
    /// anything other than strings and nested objects (arrays, numbers,
    /// booleans, and `null` are rejected as malformed input).
    pub fn from_json(value: &Value) -> Result<Self, DocumentError> {
        let Value::Object(map) = value else {
            return Err(DocumentError("top-level value must be an object".to_owned()));
        };
        let root = json_map_to_node_map(map)?;
        Ok(Self { root })
    }

    /// Serialize this Document back to its JSON-shaped text format.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(node_map_to_json(&self.root))
    }
}

impl Serialize for Document {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}

fn json_map_to_node_map(
    map: &serde_json::Map<String, Value>,
) -> Result<BTreeMap<Segment, Node>, DocumentError> {
    let mut out = BTreeMap::new();
    for (k, v) in map {
        if k.is_empty() {
            return Err(DocumentError("field names must be non-empty".to_owned()));
        }
        let node = match v {
            Value::String(s) => Node::Leaf(s.clone()),
            Value::Object(inner) => Node::Branch(json_map_to_node_map(inner)?),
            other => {
                return Err(DocumentError(format!(
                    "field {k:?}: expected string or object, found {other}"
                )));
            }
        };
        out.insert(k.clone(), node);
    }
    Ok(out)
}

fn node_map_to_json(map: &BTreeMap<Segment, Node>) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    for (k, v) in map {
        let value = match v {
            Node::Leaf(s) => Value::String(s.clone()),
            Node::Branch(m) => Value::Object(node_map_to_json(m)),
        };
        out.insert(k.clone(), value);
    }
    out
}

fn collect_paths(map: &BTreeMap<Segment, Node>, prefix: &mut Vec<Segment>, out: &mut Vec<Path>) {
    for (k, v) in map {
        prefix.push(k.clone());
        match v {
            Node::Leaf(_) => out.push(Path::new(prefix.clone())),
            Node::Branch(m) => collect_paths(m, prefix, out),
        }
        prefix.pop();
    }
}

fn remove_rec(map: &mut BTreeMap<Segment, Node>, segments: &[Segment]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(Node::Branch(inner)) = map.get_mut(head) {
        remove_rec(inner, rest);
        if inner.is_empty() {
            map.remove(head);
        }
    }
}

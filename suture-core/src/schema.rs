//! Expected schemas, observed shapes and structural fingerprints.
//!
//! The schema registry uses ArcSwap for lock-free reads. Lookups happen on
//! every proxied request while registrations happen at startup or from the
//! control plane, so readers must never contend with writers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

use crate::error::{Result, SutureError};

// ============================================================================
// JSON types
// ============================================================================

/// JSON type representation for schema fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum JsonType {
    Null = 0,
    #[serde(alias = "boolean")]
    Bool = 1,
    #[serde(alias = "integer", alias = "float")]
    Number = 2,
    String = 3,
    Array = 4,
    Object = 5,
}

impl JsonType {
    /// Classify a JSON value.
    #[inline]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonType::Null,
            Value::Bool(_) => JsonType::Bool,
            Value::Number(_) => JsonType::Number,
            Value::String(_) => JsonType::String,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Bool => "bool",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Expected schema
// ============================================================================

fn default_required() -> bool {
    true
}

/// One field of the client contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedField {
    pub name: Arc<str>,
    /// Type hint; `None` accepts any non-null value
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub json_type: Option<JsonType>,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl ExpectedField {
    pub fn required(name: &str, json_type: JsonType) -> Self {
        Self {
            name: Arc::from(name),
            json_type: Some(json_type),
            required: true,
        }
    }

    pub fn optional(name: &str, json_type: JsonType) -> Self {
        Self {
            name: Arc::from(name),
            json_type: Some(json_type),
            required: false,
        }
    }

    /// Whether `value` satisfies this field's type hint.
    ///
    /// Null is only assignable to optional fields.
    #[inline]
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return !self.required;
        }
        match self.json_type {
            None => true,
            Some(expected) => JsonType::of(value) == expected,
        }
    }
}

/// Ordered set of fields a client expects from an endpoint.
///
/// Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedSchema {
    /// Identity of the schema, part of every fingerprint computed against it
    pub id: Arc<str>,
    pub fields: Vec<ExpectedField>,
}

impl ExpectedSchema {
    pub fn new(id: &str, fields: Vec<ExpectedField>) -> Self {
        Self {
            id: Arc::from(id),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&ExpectedField> {
        self.fields.iter().find(|f| f.name.as_ref() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_ref())
    }
}

// ============================================================================
// Observed shape and fingerprint
// ============================================================================

/// Field names and primitive types present in one upstream object.
///
/// Stored sorted, so two objects with the same field/type set produce
/// equal shapes regardless of key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ObservedShape {
    fields: BTreeMap<String, JsonType>,
}

impl ObservedShape {
    pub fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            fields: object
                .iter()
                .map(|(k, v)| (k.clone(), JsonType::of(v)))
                .collect(),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, JsonType)>) -> Self {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, t)| (k.to_string(), t))
                .collect(),
        }
    }

    /// Add fields of `other` not yet present. Existing types win.
    pub fn merge(&mut self, other: &ObservedShape) {
        for (name, json_type) in &other.fields {
            self.fields.entry(name.clone()).or_insert(*json_type);
        }
    }

    pub fn get(&self, name: &str) -> Option<JsonType> {
        self.fields.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Fields in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, JsonType)> {
        self.fields.iter().map(|(k, t)| (k.as_str(), *t))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Structural fingerprint of an observed shape against one expected schema.
///
/// Computed as XxHash64 over the schema id and the sorted `(name, type)`
/// pairs. Extra fields and missing fields both change the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SchemaFingerprint(pub u64);

const UNIT_SEPARATOR: u8 = 0x1f;
const RECORD_SEPARATOR: u8 = 0x1e;

impl SchemaFingerprint {
    /// Fingerprint `shape` as observed for the schema identified by `schema_id`.
    pub fn compute(shape: &ObservedShape, schema_id: &str) -> Self {
        let mut buf = Vec::with_capacity(schema_id.len() + shape.len() * 16);
        buf.extend_from_slice(schema_id.as_bytes());
        buf.push(UNIT_SEPARATOR);
        for (name, json_type) in shape.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.push(RECORD_SEPARATOR);
            buf.push(json_type as u8);
            buf.push(UNIT_SEPARATOR);
        }
        Self(xxh64(&buf, 0))
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SchemaFingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(SchemaFingerprint)
    }
}

impl Serialize for SchemaFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Schema registry
// ============================================================================

/// Path pattern with `{param}` placeholder segments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

impl RoutePattern {
    fn parse(raw: &str) -> Self {
        let segments = split_path(raw)
            .map(|s| {
                if s.starts_with('{') && s.ends_with('}') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self {
            raw: normalize_path(raw),
            segments,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path);
        for segment in &self.segments {
            match (segment, parts.next()) {
                (Segment::Param, Some(_)) => {}
                (Segment::Literal(lit), Some(part)) if lit == part => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }

    fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn normalize_path(path: &str) -> String {
    let joined: Vec<&str> = split_path(path).collect();
    format!("/{}", joined.join("/"))
}

/// Immutable registry snapshot. Updates clone, modify and swap.
#[derive(Debug, Default, Clone)]
struct RegistryInner {
    exact: HashMap<String, Arc<ExpectedSchema>>,
    patterns: Vec<(RoutePattern, Arc<ExpectedSchema>)>,
    version: u64,
}

/// Lock-free registry mapping route patterns to expected schemas.
pub struct SchemaRegistry {
    inner: ArcSwap<RegistryInner>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(RegistryInner::default()),
        }
    }

    /// Registry preloaded with the built-in demo contracts.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let user = Arc::new(ExpectedSchema::new(
            "UserProfile",
            vec![
                ExpectedField::required("user_id", JsonType::Number),
                ExpectedField::required("name", JsonType::String),
                ExpectedField::optional("email", JsonType::String),
                ExpectedField::optional("created_at", JsonType::String),
            ],
        ));
        let product = Arc::new(ExpectedSchema::new(
            "Product",
            vec![
                ExpectedField::required("product_id", JsonType::Number),
                ExpectedField::required("title", JsonType::String),
                ExpectedField::required("price", JsonType::Number),
                ExpectedField::optional("in_stock", JsonType::Bool),
            ],
        ));
        let order = Arc::new(ExpectedSchema::new(
            "Order",
            vec![
                ExpectedField::required("order_id", JsonType::Number),
                ExpectedField::required("user_id", JsonType::Number),
                ExpectedField::required("total_amount", JsonType::Number),
                ExpectedField::required("status", JsonType::String),
            ],
        ));

        for route in ["/api/users", "/api/users/{id}", "/api/user", "/api/profile"] {
            registry.register_shared(route, Arc::clone(&user));
        }
        for route in ["/api/products", "/api/products/{id}", "/api/product"] {
            registry.register_shared(route, Arc::clone(&product));
        }
        for route in ["/api/orders", "/api/orders/{id}"] {
            registry.register_shared(route, Arc::clone(&order));
        }

        info!(routes = registry.len(), "Schema registry initialized with defaults");
        registry
    }

    /// Load contracts from a JSON schema file.
    ///
    /// ```json
    /// {"schemas": [{"id": "UserProfile", "routes": ["/api/users/{id}"],
    ///   "fields": [{"name": "user_id", "type": "number"}]}]}
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: SchemaFile = serde_json::from_str(raw)?;
        let registry = Self::new();
        for def in file.schemas {
            if def.fields.is_empty() {
                return Err(SutureError::config(
                    "SCHEMA_FILE",
                    format!("schema {} declares no fields", def.id),
                ));
            }
            let schema = Arc::new(ExpectedSchema::new(&def.id, def.fields));
            for route in &def.routes {
                registry.register_shared(route, Arc::clone(&schema));
            }
        }
        info!(routes = registry.len(), "Schema registry loaded from file");
        Ok(registry)
    }

    /// Register or replace the schema for a route pattern.
    pub fn register(&self, route: &str, schema: ExpectedSchema) {
        self.register_shared(route, Arc::new(schema));
    }

    fn register_shared(&self, route: &str, schema: Arc<ExpectedSchema>) {
        let pattern = RoutePattern::parse(route);

        // rcu retries the copy-on-write if another writer swapped first
        self.inner.rcu(|current| {
            let mut next = RegistryInner::clone(current);
            if pattern.is_literal() {
                next.exact.insert(pattern.raw.clone(), Arc::clone(&schema));
            } else {
                next.patterns.retain(|(p, _)| p.raw != pattern.raw);
                next.patterns.push((pattern.clone(), Arc::clone(&schema)));
            }
            next.version += 1;
            next
        });

        debug!(route = %pattern.raw, schema = %schema.id, "Registered expected schema");
    }

    /// Resolve the schema for a concrete request path.
    ///
    /// Exact routes win over patterns; patterns are tried in registration order.
    #[inline]
    pub fn resolve(&self, path: &str) -> Option<Arc<ExpectedSchema>> {
        let guard = self.inner.load();
        let normalized = normalize_path(path);
        if let Some(schema) = guard.exact.get(&normalized) {
            return Some(Arc::clone(schema));
        }
        guard
            .patterns
            .iter()
            .find(|(p, _)| p.matches(&normalized))
            .map(|(_, s)| Arc::clone(s))
    }

    /// All registered routes with their schema ids, sorted by route.
    pub fn routes(&self) -> Vec<(String, Arc<str>)> {
        let guard = self.inner.load();
        let mut routes: Vec<(String, Arc<str>)> = guard
            .exact
            .iter()
            .map(|(r, s)| (r.clone(), Arc::clone(&s.id)))
            .chain(
                guard
                    .patterns
                    .iter()
                    .map(|(p, s)| (p.raw.clone(), Arc::clone(&s.id))),
            )
            .collect();
        routes.sort();
        routes
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.load();
        guard.exact.len() + guard.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    schemas: Vec<SchemaDef>,
}

#[derive(Debug, Deserialize)]
struct SchemaDef {
    id: String,
    routes: Vec<String>,
    fields: Vec<ExpectedField>,
}

//! Drift detection: does an upstream body still satisfy its expected schema?
//!
//! No-drift is the fast path. It allocates nothing beyond the parse and
//! never touches fingerprints or the mapping cache.

use serde_json::{Map, Value};

use crate::schema::{ExpectedSchema, ObservedShape};

/// Outcome of comparing a body with its expected schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Drift {
    /// All required fields present and every present expected field assignable
    None,
    /// The body no longer matches the contract
    Drifted(DriftReport),
    /// Body is JSON but not an object or array of objects
    Unsupported,
}

impl Drift {
    pub fn is_drifted(&self) -> bool {
        matches!(self, Drift::Drifted(_))
    }
}

/// What differs between the observed object and the contract.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    /// Shape of the drifting object; for arrays, the union over drifting items
    pub shape: ObservedShape,
    /// Required fields absent from the object
    pub missing: Vec<String>,
    /// Expected fields present with a non-assignable value
    pub mistyped: Vec<String>,
    /// Fields the contract does not name
    pub unexpected: Vec<String>,
}

impl DriftReport {
    /// Fold another drifting item into this report.
    fn merge(&mut self, other: DriftReport) {
        self.shape.merge(&other.shape);
        extend_unique(&mut self.missing, other.missing);
        extend_unique(&mut self.mistyped, other.mistyped);
        extend_unique(&mut self.unexpected, other.unexpected);
    }

    /// Expected fields needing a source: missing plus mistyped.
    pub fn unsatisfied(&self) -> impl Iterator<Item = &str> {
        self.missing
            .iter()
            .chain(self.mistyped.iter())
            .map(String::as_str)
    }
}

/// Compare an upstream body with its expected schema.
///
/// Arrays are checked item by item; the report merges every drifting
/// object, so a field carried only by a later item still gets a source.
/// Conforming items do not contribute. An empty array never drifts.
pub fn detect(schema: &ExpectedSchema, body: &Value) -> Drift {
    match body {
        Value::Object(object) => match check_object(schema, object) {
            Some(report) => Drift::Drifted(report),
            None => Drift::None,
        },
        Value::Array(items) => {
            let mut saw_object = items.is_empty();
            let mut merged: Option<DriftReport> = None;
            for item in items {
                if let Value::Object(object) = item {
                    saw_object = true;
                    if let Some(report) = check_object(schema, object) {
                        match merged.as_mut() {
                            Some(acc) => acc.merge(report),
                            None => merged = Some(report),
                        }
                    }
                }
            }
            match merged {
                Some(report) => Drift::Drifted(report),
                None if saw_object => Drift::None,
                None => Drift::Unsupported,
            }
        }
        _ => Drift::Unsupported,
    }
}

fn extend_unique(into: &mut Vec<String>, from: Vec<String>) {
    for name in from {
        if !into.contains(&name) {
            into.push(name);
        }
    }
}

fn check_object(schema: &ExpectedSchema, object: &Map<String, Value>) -> Option<DriftReport> {
    let mut missing = Vec::new();
    let mut mistyped = Vec::new();

    for field in &schema.fields {
        match object.get(field.name.as_ref()) {
            None if field.required => missing.push(field.name.to_string()),
            None => {}
            Some(value) if !field.accepts(value) => mistyped.push(field.name.to_string()),
            Some(_) => {}
        }
    }

    if missing.is_empty() && mistyped.is_empty() {
        return None;
    }

    let unexpected = object
        .keys()
        .filter(|k| !schema.contains(k))
        .cloned()
        .collect();

    Some(DriftReport {
        shape: ObservedShape::from_object(object),
        missing,
        mistyped,
        unexpected,
    })
}

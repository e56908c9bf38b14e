//! Transformation applier: rewrites a drifted body into the expected shape.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::mapping::FieldMapping;
use crate::schema::{ExpectedSchema, SchemaFingerprint};

/// Metadata attached to every proxied response that went through the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealingMetadata {
    pub healed: bool,
    pub from_cache: bool,
    /// Version of the applied mapping; 0 when nothing was applied
    pub mapping_version: u64,
    /// Aggregate confidence of the applied mapping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<SchemaFingerprint>,
    /// Time spent in the engine, microseconds
    pub duration_us: u64,
}

impl HealingMetadata {
    pub fn passthrough(duration_us: u64) -> Self {
        Self {
            duration_us,
            ..Default::default()
        }
    }
}

/// Apply `mapping` to `body`.
///
/// Objects are rebuilt in expected-schema order. An expected field takes its
/// value from the mapped source, or keeps its own value if no correspondence
/// targets it or the source is absent from that object. Anything else is
/// dropped. Arrays are healed item by item;
/// other values are returned unchanged.
pub fn apply(schema: &ExpectedSchema, mapping: &FieldMapping, body: &Value) -> Value {
    match body {
        Value::Object(object) => Value::Object(apply_object(schema, mapping, object)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::Object(object) => Value::Object(apply_object(schema, mapping, object)),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn apply_object(
    schema: &ExpectedSchema,
    mapping: &FieldMapping,
    object: &Map<String, Value>,
) -> Map<String, Value> {
    let mut healed = Map::with_capacity(schema.fields.len());

    for field in &schema.fields {
        let name = field.name.as_ref();
        let mapped = mapping.source_for(name).and_then(|corr| {
            object.get(&corr.source).map(|raw| match corr.transform {
                Some(t) => t.apply(raw).unwrap_or_else(|| raw.clone()),
                None => raw.clone(),
            })
        });
        // an item without the mapped source keeps its own value
        let value = mapped.or_else(|| object.get(name).cloned());
        if let Some(value) = value {
            healed.insert(name.to_string(), value);
        }
    }

    healed
}

/// Expected required fields still absent or mistyped after healing.
pub fn unsatisfied_fields(schema: &ExpectedSchema, healed: &Value) -> Vec<String> {
    let first = match healed {
        Value::Object(o) => Some(o),
        Value::Array(items) => items.iter().find_map(Value::as_object),
        _ => None,
    };
    let Some(object) = first else {
        return Vec::new();
    };
    schema
        .fields
        .iter()
        .filter(|f| match object.get(f.name.as_ref()) {
            None => f.required,
            Some(v) => !f.accepts(v),
        })
        .map(|f| f.name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Correspondence, ValueTransform};
    use crate::schema::{ExpectedField, JsonType};
    use serde_json::json;

    fn schema() -> ExpectedSchema {
        ExpectedSchema::new(
            "User",
            vec![
                ExpectedField::required("user_id", JsonType::Number),
                ExpectedField::required("name", JsonType::String),
                ExpectedField::optional("email", JsonType::String),
            ],
        )
    }

    fn mapping() -> FieldMapping {
        FieldMapping::new(
            SchemaFingerprint(1),
            "User",
            vec![
                Correspondence::new("uid", "user_id", 0.9),
                Correspondence::new("full_name", "name", 0.85),
                Correspondence::new("email_address", "email", 0.95),
            ],
            0.85,
        )
    }

    #[test]
    fn test_renames_and_orders_fields() {
        let body = json!({"email_address": "d@x.com", "uid": 101, "full_name": "Deepanshu", "extra": 1});
        let healed = apply(&schema(), &mapping(), &body);
        assert_eq!(
            healed,
            json!({"user_id": 101, "name": "Deepanshu", "email": "d@x.com"})
        );
        let keys: Vec<_> = healed.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["user_id", "name", "email"]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let body = json!({"uid": 101, "full_name": "Deepanshu", "email_address": "d@x.com"});
        assert_eq!(apply(&schema(), &mapping(), &body), apply(&schema(), &mapping(), &body));
    }

    #[test]
    fn test_unresolved_fields_stay_absent() {
        let m = FieldMapping::new(
            SchemaFingerprint(1),
            "User",
            vec![Correspondence::new("uid", "user_id", 0.9)],
            0.9,
        );
        let healed = apply(&schema(), &m, &json!({"uid": 5, "nick": "n"}));
        assert_eq!(healed, json!({"user_id": 5}));
        assert_eq!(unsatisfied_fields(&schema(), &healed), vec!["name"]);
    }

    #[test]
    fn test_unmapped_expected_fields_carried_over() {
        let m = FieldMapping::new(
            SchemaFingerprint(1),
            "User",
            vec![Correspondence::new("full_name", "name", 0.9)],
            0.9,
        );
        let healed = apply(&schema(), &m, &json!({"user_id": 7, "full_name": "A"}));
        assert_eq!(healed, json!({"user_id": 7, "name": "A"}));
        assert!(unsatisfied_fields(&schema(), &healed).is_empty());
    }

    #[test]
    fn test_transforms_applied_and_failures_keep_value() {
        let m = FieldMapping::new(
            SchemaFingerprint(1),
            "User",
            vec![
                Correspondence::new("id", "user_id", 0.8).with_transform(ValueTransform::ToInt),
                Correspondence::new("label", "name", 0.8).with_transform(ValueTransform::ToInt),
            ],
            0.8,
        );
        let healed = apply(&schema(), &m, &json!({"id": "12", "label": "bob"}));
        assert_eq!(healed, json!({"user_id": 12, "name": "bob"}));
    }

    #[test]
    fn test_arrays_healed_per_item() {
        let body = json!([{"uid": 1, "full_name": "a"}, {"uid": 2, "full_name": "b"}, 3]);
        let healed = apply(&schema(), &mapping(), &body);
        assert_eq!(
            healed,
            json!([{"user_id": 1, "name": "a"}, {"user_id": 2, "name": "b"}, 3])
        );
    }

    #[test]
    fn test_conforming_items_in_mixed_list_keep_values() {
        let body = json!([
            {"user_id": 1, "name": "a"},
            {"uid": 2, "full_name": "b", "email_address": "b@x.io"}
        ]);
        let healed = apply(&schema(), &mapping(), &body);
        assert_eq!(
            healed,
            json!([
                {"user_id": 1, "name": "a"},
                {"user_id": 2, "name": "b", "email": "b@x.io"}
            ])
        );
    }
}

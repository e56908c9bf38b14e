//! Heuristic backend: name similarity ensemble plus type compatibility.
//!
//! Every unsatisfied expected field is scored against every observed field
//! the contract does not already accept, then pairs are assigned greedily
//! from the highest score down, one source per target. Costs nothing.

use crate::mapping::{CandidateMapping, Correspondence, ValueTransform};
use crate::schema::{ExpectedField, ExpectedSchema, JsonType, ObservedShape};

use super::synonym::{normalize_field_name, synonym_match};
use super::{InferFuture, MappingBackend};

/// Default floor below which a pair is not proposed at all.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.55;

pub struct HeuristicBackend {
    min_similarity: f32,
}

impl HeuristicBackend {
    pub fn new() -> Self {
        Self::with_min_similarity(DEFAULT_MIN_SIMILARITY)
    }

    pub fn with_min_similarity(min_similarity: f32) -> Self {
        Self { min_similarity }
    }

    fn propose(&self, schema: &ExpectedSchema, shape: &ObservedShape) -> CandidateMapping {
        let targets: Vec<&ExpectedField> = schema
            .fields
            .iter()
            .filter(|f| match shape.get(&f.name) {
                None => true,
                Some(observed) => !type_accepts(f, observed),
            })
            .collect();

        // observed fields the contract does not already consume
        let sources: Vec<(&str, JsonType)> = shape
            .iter()
            .filter(|(name, observed)| match schema.field(name) {
                None => true,
                Some(f) => !type_accepts(f, *observed),
            })
            .collect();

        let mut pairs = Vec::with_capacity(targets.len() * sources.len());
        for (ti, target) in targets.iter().enumerate() {
            for (si, (source, source_type)) in sources.iter().enumerate() {
                let score = match_confidence(target, source, *source_type);
                if score >= self.min_similarity {
                    pairs.push((score, ti, si));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut target_taken = vec![false; targets.len()];
        let mut source_taken = vec![false; sources.len()];
        let mut correspondences = Vec::new();
        for (score, ti, si) in pairs {
            if target_taken[ti] || source_taken[si] {
                continue;
            }
            target_taken[ti] = true;
            source_taken[si] = true;

            let target = targets[ti];
            let (source, source_type) = sources[si];
            let mut corr = Correspondence::new(source, &target.name, score);
            if let Some(t) = coercion(target, source_type) {
                corr = corr.with_transform(t);
            }
            correspondences.push(corr);
        }

        let unresolved: Vec<String> = targets
            .iter()
            .zip(&target_taken)
            .filter(|(_, taken)| !**taken)
            .map(|(t, _)| t.name.to_string())
            .collect();

        let analysis = if correspondences.is_empty() {
            "No observed field resembles the missing fields".to_string()
        } else {
            let renames: Vec<String> = correspondences
                .iter()
                .map(|c| format!("{} -> {}", c.source, c.target))
                .collect();
            format!("Upstream renamed or retyped fields: {}", renames.join(", "))
        };

        CandidateMapping {
            correspondences,
            unresolved,
            cost_usd: 0.0,
            analysis,
        }
    }
}

impl Default for HeuristicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingBackend for HeuristicBackend {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn infer<'a>(&'a self, schema: &'a ExpectedSchema, shape: &'a ObservedShape) -> InferFuture<'a> {
        Box::pin(async move { Ok(self.propose(schema, shape)) })
    }
}

fn type_accepts(field: &ExpectedField, observed: JsonType) -> bool {
    match (field.json_type, observed) {
        (_, JsonType::Null) => !field.required,
        (None, _) => true,
        (Some(expected), observed) => expected == observed,
    }
}

/// Name similarity ensemble over normalized names.
///
/// A synonym hit dominates; otherwise Jaro-Winkler and normalized
/// Levenshtein are blended.
pub fn name_similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    let norm_a = normalize_field_name(a);
    let norm_b = normalize_field_name(b);
    if norm_a == norm_b {
        return 1.0;
    }

    let synonym = synonym_match(&norm_a, &norm_b);
    let jw = strsim::jaro_winkler(&norm_a, &norm_b) as f32;
    let lev = strsim::normalized_levenshtein(&norm_a, &norm_b) as f32;

    if synonym > 0.5 {
        return synonym * 0.8 + (jw + lev) / 2.0 * 0.2;
    }
    jw * 0.55 + lev * 0.45
}

/// Type compatibility: how plausibly a value of `observed` can serve
/// a field of `expected`.
///
/// - 1.0 exact match
/// - 0.85 null on either side
/// - 0.75 string and number
/// - 0.6 bool and number
/// - 0.3 array and object
/// - 0.1 anything else
pub fn type_compatibility_score(expected: JsonType, observed: JsonType) -> f32 {
    match (expected, observed) {
        (a, b) if a == b => 1.0,
        (JsonType::String, JsonType::Number) | (JsonType::Number, JsonType::String) => 0.75,
        (JsonType::Null, _) | (_, JsonType::Null) => 0.85,
        (JsonType::Bool, JsonType::Number) | (JsonType::Number, JsonType::Bool) => 0.6,
        (JsonType::Array, JsonType::Object) | (JsonType::Object, JsonType::Array) => 0.3,
        _ => 0.1,
    }
}

fn match_confidence(target: &ExpectedField, source: &str, source_type: JsonType) -> f32 {
    let semantic = name_similarity(&target.name, source);
    let compat = match target.json_type {
        Some(expected) => type_compatibility_score(expected, source_type),
        None => 1.0,
    };
    (semantic * (0.7 + 0.3 * compat)).clamp(0.0, 1.0)
}

/// Conversion needed to move a `source_type` value into `target`.
fn coercion(target: &ExpectedField, source_type: JsonType) -> Option<ValueTransform> {
    let expected = target.json_type?;
    match (expected, source_type) {
        (a, b) if a == b => None,
        (_, JsonType::Null) => None,
        (JsonType::String, JsonType::Number | JsonType::Bool) => Some(ValueTransform::ToStr),
        (JsonType::Number, JsonType::String) if looks_integral(&target.name) => Some(ValueTransform::ToInt),
        (JsonType::Number, JsonType::String) => Some(ValueTransform::ToFloat),
        (JsonType::Number, JsonType::Bool) => Some(ValueTransform::ToInt),
        (JsonType::Bool, JsonType::Number | JsonType::String) => Some(ValueTransform::ToBool),
        _ => None,
    }
}

fn looks_integral(name: &str) -> bool {
    let norm = normalize_field_name(name);
    norm == "id"
        || norm.ends_with("_id")
        || norm.ends_with("count")
        || norm.ends_with("quantity")
        || norm.ends_with("qty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> ExpectedSchema {
        ExpectedSchema::new(
            "UserProfile",
            vec![
                ExpectedField::required("user_id", JsonType::Number),
                ExpectedField::required("name", JsonType::String),
                ExpectedField::optional("email", JsonType::String),
            ],
        )
    }

    fn shape(value: serde_json::Value) -> ObservedShape {
        ObservedShape::from_object(value.as_object().unwrap())
    }

    fn source_for<'a>(m: &'a CandidateMapping, target: &str) -> Option<&'a Correspondence> {
        m.correspondences.iter().find(|c| c.target == target)
    }

    #[test]
    fn test_renamed_fields_resolved() {
        let backend = HeuristicBackend::new();
        let m = backend.propose(
            &user_schema(),
            &shape(json!({"uid": 101, "full_name": "D", "email_address": "d@x.com"})),
        );
        assert_eq!(source_for(&m, "user_id").unwrap().source, "uid");
        assert_eq!(source_for(&m, "name").unwrap().source, "full_name");
        assert_eq!(source_for(&m, "email").unwrap().source, "email_address");
        assert!(m.unresolved.is_empty());
        assert_eq!(m.cost_usd, 0.0);
        assert!(m.correspondences.iter().all(|c| c.confidence >= 0.7));
    }

    #[test]
    fn test_camel_case_and_type_change() {
        let backend = HeuristicBackend::new();
        let m = backend.propose(&user_schema(), &shape(json!({"userId": "101", "name": "D"})));
        let corr = source_for(&m, "user_id").unwrap();
        assert_eq!(corr.source, "userId");
        assert_eq!(corr.transform, Some(ValueTransform::ToInt));
        // string for number costs confidence
        assert!(corr.confidence < 1.0);
        assert!(source_for(&m, "name").is_none());
    }

    #[test]
    fn test_retyped_field_maps_to_itself() {
        let backend = HeuristicBackend::new();
        let m = backend.propose(&user_schema(), &shape(json!({"user_id": "7", "name": "D"})));
        let corr = source_for(&m, "user_id").unwrap();
        assert_eq!(corr.source, "user_id");
        assert_eq!(corr.transform, Some(ValueTransform::ToInt));
    }

    #[test]
    fn test_one_source_per_target() {
        let backend = HeuristicBackend::new();
        let m = backend.propose(&user_schema(), &shape(json!({"uid": 1, "usr_id": 2, "full_name": "x"})));
        let used: Vec<_> = m.correspondences.iter().filter(|c| c.target == "user_id").collect();
        assert_eq!(used.len(), 1);
    }

    #[test]
    fn test_unrelated_fields_unresolved() {
        let backend = HeuristicBackend::new();
        let m = backend.propose(&user_schema(), &shape(json!({"zzz": 1, "qqq": "x"})));
        assert!(m.correspondences.is_empty());
        assert_eq!(m.unresolved, vec!["user_id", "name", "email"]);
    }

    #[test]
    fn test_type_compatibility_scores() {
        assert_eq!(type_compatibility_score(JsonType::String, JsonType::String), 1.0);
        assert_eq!(type_compatibility_score(JsonType::Number, JsonType::String), 0.75);
        assert_eq!(type_compatibility_score(JsonType::Bool, JsonType::Null), 0.85);
        assert_eq!(type_compatibility_score(JsonType::Number, JsonType::Bool), 0.6);
        assert_eq!(type_compatibility_score(JsonType::Array, JsonType::Object), 0.3);
        assert_eq!(type_compatibility_score(JsonType::String, JsonType::Array), 0.1);
    }
}

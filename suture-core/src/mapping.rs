//! Field mappings: source→target correspondences with per-field confidence.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::schema::SchemaFingerprint;

// ============================================================================
// Value transforms
// ============================================================================

/// Optional value conversion applied while relocating a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTransform {
    ToInt,
    ToStr,
    ToFloat,
    ToBool,
    /// ISO 8601 date, datetime or unix seconds → RFC 3339 UTC
    ParseDate,
}

impl ValueTransform {
    /// Parse the wire name used by reasoning backends (`"to_int"` etc).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "to_int" => Some(ValueTransform::ToInt),
            "to_str" => Some(ValueTransform::ToStr),
            "to_float" => Some(ValueTransform::ToFloat),
            "to_bool" => Some(ValueTransform::ToBool),
            "parse_date" => Some(ValueTransform::ParseDate),
            _ => None,
        }
    }

    /// Convert `value`, or `None` if it cannot be converted.
    ///
    /// Null always converts to null.
    pub fn apply(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            ValueTransform::ToInt => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                    .map(Value::from),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
                        .map(Value::from)
                }
                Value::Bool(b) => Some(Value::from(*b as i64)),
                _ => None,
            },
            ValueTransform::ToFloat => match value {
                Value::Number(n) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number),
                Value::Bool(b) => Number::from_f64(if *b { 1.0 } else { 0.0 }).map(Value::Number),
                _ => None,
            },
            ValueTransform::ToStr => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            ValueTransform::ToBool => match value {
                Value::Bool(_) => Some(value.clone()),
                Value::Number(n) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "y" => Some(Value::Bool(true)),
                    "false" | "0" | "no" | "n" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            ValueTransform::ParseDate => {
                let parsed = match value {
                    Value::String(s) => parse_date(s.trim()),
                    Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
                    _ => None,
                };
                parsed.map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            }
        }
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // offset-less values are taken as UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ============================================================================
// Correspondences
// ============================================================================

/// One proposed or accepted `source → target` relocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub source: String,
    pub target: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ValueTransform>,
}

impl Correspondence {
    pub fn new(source: &str, target: &str, confidence: f32) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: ValueTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl fmt::Display for Correspondence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} | Confidence: {:.2}",
            self.source, self.target, self.confidence
        )?;
        if let Some(t) = self.transform {
            write!(f, " | Transform: {:?}", t)?;
        }
        Ok(())
    }
}

/// Hypothesis returned by a reasoning backend for one drift.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateMapping {
    pub correspondences: Vec<Correspondence>,
    /// Expected fields the backend could not resolve
    pub unresolved: Vec<String>,
    /// Monetary cost of producing this hypothesis
    pub cost_usd: f64,
    /// Backend's one-line explanation of the drift
    pub analysis: String,
}

impl CandidateMapping {
    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }

    pub fn confidences(&self) -> impl Iterator<Item = f32> + '_ {
        self.correspondences.iter().map(|c| c.confidence)
    }
}

// ============================================================================
// Confidence aggregation
// ============================================================================

/// Rule turning per-field confidences into the single gating number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceAggregation {
    /// Weakest field decides
    #[default]
    #[serde(alias = "min")]
    Minimum,
    /// Arithmetic mean over all fields
    Mean,
}

impl ConfidenceAggregation {
    /// Aggregate a set of confidences. An empty set aggregates to 0.
    pub fn aggregate(&self, confidences: impl IntoIterator<Item = f32>) -> f32 {
        let mut count = 0usize;
        let mut sum = 0.0f32;
        let mut min = f32::INFINITY;
        for c in confidences {
            count += 1;
            sum += c;
            min = min.min(c);
        }
        if count == 0 {
            return 0.0;
        }
        match self {
            ConfidenceAggregation::Minimum => min,
            ConfidenceAggregation::Mean => sum / count as f32,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "min" | "minimum" => Some(ConfidenceAggregation::Minimum),
            "mean" | "avg" | "average" => Some(ConfidenceAggregation::Mean),
            _ => None,
        }
    }
}

// ============================================================================
// Accepted mapping
// ============================================================================

/// A mapping accepted for one fingerprint.
///
/// `version` is assigned by the mapping cache on store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMapping {
    pub fingerprint: SchemaFingerprint,
    pub schema_id: String,
    pub correspondences: Vec<Correspondence>,
    /// Aggregate confidence used for the gating decision
    pub confidence: f32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl FieldMapping {
    pub fn new(
        fingerprint: SchemaFingerprint,
        schema_id: &str,
        correspondences: Vec<Correspondence>,
        confidence: f32,
    ) -> Self {
        Self {
            fingerprint,
            schema_id: schema_id.to_string(),
            correspondences,
            confidence,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Correspondence whose target is `field`, if any.
    pub fn source_for(&self, field: &str) -> Option<&Correspondence> {
        self.correspondences.iter().find(|c| c.target == field)
    }

    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }
}

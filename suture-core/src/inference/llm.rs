//! OpenAI-compatible chat-completions backend.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SutureError};
use crate::mapping::{CandidateMapping, Correspondence, ValueTransform};
use crate::schema::{ExpectedSchema, ObservedShape};

use super::{InferFuture, MappingBackend};

/// USD per 1K prompt tokens.
pub const COST_PER_1K_INPUT: f64 = 0.00015;
/// USD per 1K completion tokens.
pub const COST_PER_1K_OUTPUT: f64 = 0.0006;

const SYSTEM_PROMPT: &str = r#"You are a Schema Healing Agent. An upstream API changed its response schema and you must map the new fields back to the fields the client expects.

Return ONLY a JSON object:
{"field_mappings": [{"source_field": "<field in response>", "target_field": "<expected field>", "transform": null, "confidence": 0.95}],
 "analysis": "<one sentence on what changed>",
 "can_heal": true}

Rules:
1. Match by similar names (user_id -> uid, userId), matching data types and semantic meaning.
2. Confidence in [0, 1]: 1.0 obvious, 0.8+ strong naming similarity, 0.5-0.8 plausible, below 0.5 uncertain.
3. transform is null or one of "to_int", "to_str", "to_float", "to_bool", "parse_date".
4. Never invent a source field that is not in the response.
5. If you cannot confidently map the missing fields, set can_heal to false."#;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

/// Structured answer the model is asked to produce.
#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    field_mappings: Vec<VerdictMapping>,
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    can_heal: bool,
}

#[derive(Debug, Deserialize)]
struct VerdictMapping {
    source_field: String,
    target_field: String,
    #[serde(default)]
    transform: Option<String>,
    #[serde(default)]
    confidence: f32,
}

pub struct LlmBackend {
    client: Client,
    config: LlmConfig,
}

impl LlmBackend {
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(SutureError::config("LLM_API_KEY", "required for the llm backend"));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SutureError::config("LLM_BASE_URL", e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| SutureError::InferenceFailed(format!("llm request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SutureError::InferenceFailed(format!(
                "llm server error: {}",
                response.status()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| SutureError::InferenceFailed(format!("llm response unreadable: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SutureError::InferenceFailed("llm returned no content".to_string()))
    }

    /// Call with up to `max_attempts` tries and exponential backoff (2s..10s).
    async fn call_with_retry(&self, prompt: &str) -> Result<String> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.call(prompt).await {
                Ok(content) => return Ok(content),
                Err(e) => {
                    warn!(attempt, error = %e, "LLM call failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SutureError::InferenceFailed("llm not called".to_string())))
    }
}

impl MappingBackend for LlmBackend {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn infer<'a>(&'a self, schema: &'a ExpectedSchema, shape: &'a ObservedShape) -> InferFuture<'a> {
        Box::pin(async move {
            let prompt = build_prompt(schema, shape)?;
            let content = self.call_with_retry(&prompt).await?;
            debug!(model = %self.config.model, chars = content.len(), "LLM response received");

            let cost = estimate_cost(SYSTEM_PROMPT.len() + prompt.len(), content.len());
            Ok(priced_verdict(&content, cost))
        })
    }
}

fn backoff(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).clamp(2, 10);
    Duration::from_secs(secs)
}

fn build_prompt(schema: &ExpectedSchema, shape: &ObservedShape) -> Result<String> {
    let expected: serde_json::Map<String, serde_json::Value> = schema
        .fields
        .iter()
        .map(|f| {
            let ty = f.json_type.map(|t| t.as_str()).unwrap_or("any");
            let ty = if f.required {
                ty.to_string()
            } else {
                format!("{ty} (optional)")
            };
            (f.name.to_string(), serde_json::Value::String(ty))
        })
        .collect();

    Ok(format!(
        "## Expected Schema ({})\n{}\n\n## Actual Response Fields\n{}\n\nProvide field mappings to heal this mismatch.",
        schema.id,
        serde_json::to_string_pretty(&expected)?,
        serde_json::to_string_pretty(shape)?,
    ))
}

/// Rough price of one call, tokens estimated as characters / 4.
pub fn estimate_cost(input_chars: usize, output_chars: usize) -> f64 {
    let input_tokens = (input_chars / 4) as f64;
    let output_tokens = (output_chars / 4) as f64;
    let cost = input_tokens / 1000.0 * COST_PER_1K_INPUT + output_tokens / 1000.0 * COST_PER_1K_OUTPUT;
    (cost * 1e6).round() / 1e6
}

/// Verdict of a completed call, charged `cost` whether or not it parses.
/// An unreadable verdict becomes an empty hypothesis, which the engine
/// reports as unhealable after charging.
fn priced_verdict(content: &str, cost: f64) -> CandidateMapping {
    let mut candidate = parse_verdict(content).unwrap_or_else(|e| {
        warn!(error = %e, "Discarding unreadable LLM verdict");
        CandidateMapping {
            analysis: e.to_string(),
            ..Default::default()
        }
    });
    candidate.cost_usd = cost;
    candidate
}

fn parse_verdict(content: &str) -> Result<CandidateMapping> {
    let verdict: Verdict = serde_json::from_str(content)
        .map_err(|e| SutureError::InferenceFailed(format!("llm verdict is not valid JSON: {e}")))?;

    if !verdict.can_heal {
        // empty hypothesis: the engine reports it as unhealable
        return Ok(CandidateMapping {
            analysis: verdict.analysis,
            ..Default::default()
        });
    }

    let correspondences = verdict
        .field_mappings
        .into_iter()
        .map(|m| {
            let mut corr = Correspondence::new(&m.source_field, &m.target_field, m.confidence);
            match m.transform.as_deref().map(ValueTransform::from_name) {
                Some(Some(t)) => corr = corr.with_transform(t),
                Some(None) => debug!(transform = ?m.transform, "Ignoring unsupported transform"),
                None => {}
            }
            corr
        })
        .collect();

    Ok(CandidateMapping {
        correspondences,
        unresolved: Vec::new(),
        cost_usd: 0.0,
        analysis: verdict.analysis,
    })
}

use super::{FailureContext, Judgment, RecoveryAction, RecoveryAdvice, VisionError, VisionJudge};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Default wait when a retry decision carries no usable wait time
const DEFAULT_RETRY_WAIT: f64 = 2.0;
const MAX_RETRY_WAIT: f64 = 5.0;

/// Vision judge backed by the Gemini `generateContent` REST API
pub struct GeminiJudge {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiJudge {
    /// Create a judge; `timeout` bounds each HTTP call
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: API_BASE.to_string(),
        })
    }

    /// Point the client at a different endpoint (proxies, test servers)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn generate(&self, prompt: &str, image: &[u8]) -> Result<String, VisionError> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/png", "data": STANDARD.encode(image) } }
                ]
            }],
            "generationConfig": { "temperature": 0.1 }
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &message));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| VisionError::InvalidResponse(e.to_string()))?;

        parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| VisionError::InvalidResponse("response has no text part".into()))
    }
}

#[async_trait]
impl VisionJudge for GeminiJudge {
    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn judge(&self, image: &[u8], description: &str) -> Result<Judgment, VisionError> {
        let prompt = format!(
            r#"You are verifying a mobile app screenshot.

Does this screenshot match the following description?
"{}"

Respond with JSON only (no markdown, no code blocks):
{{"pass": true/false, "reason": "brief explanation"}}"#,
            description
        );
        let text = self.generate(&prompt, image).await?;
        parse_judgment(&text)
    }

    async fn locate(
        &self,
        image: &[u8],
        description: &str,
        width: u32,
        height: u32,
    ) -> Result<Option<(i32, i32)>, VisionError> {
        let prompt = format!(
            r#"Find the UI element described as "{}" in this mobile app screenshot.

The screen dimensions are {}x{} pixels.

If you find the element, respond with its CENTER coordinates as percentages of screen dimensions.
If you cannot find the element, respond with null coordinates.

Respond with JSON only (no markdown, no code blocks):
{{"found": true/false, "x_percent": 0-100 or null, "y_percent": 0-100 or null, "reason": "brief explanation"}}"#,
            description, width, height
        );
        let text = self.generate(&prompt, image).await?;
        parse_location(&text, width, height)
    }

    async fn validate_at(
        &self,
        image: &[u8],
        description: &str,
        x_percent: f64,
        y_percent: f64,
    ) -> Result<Judgment, VisionError> {
        let prompt = format!(
            r#"Look at this mobile app screenshot.

Is there a UI element matching "{}" at approximately ({:.0}%, {:.0}%) of the screen
(percentages measured from the top-left corner)?

Respond with JSON only (no markdown, no code blocks):
{{"valid": true/false, "reason": "brief explanation"}}"#,
            description, x_percent, y_percent
        );
        let text = self.generate(&prompt, image).await?;
        parse_validation(&text)
    }

    async fn recover(
        &self,
        image: &[u8],
        failure: &FailureContext,
    ) -> Result<RecoveryAdvice, VisionError> {
        let prompt = format!(
            r#"You are analyzing a mobile UI test failure.

Action attempted: {} {}
Result: {}

Screenshot shows the current screen state.

Analyze and respond with JSON only (no markdown, no code blocks):
{{
  "action": "retry" | "alternative" | "fail",
  "reason": "brief explanation (1 sentence)",
  "wait_seconds": number or null,
  "alternative": "different element text" or null,
  "coordinates": [x_percent, y_percent] or null
}}

Decision guide:
- "retry" + wait_seconds (1-3): the screen is still loading (spinner, progress indicator, blank areas)
- "alternative" + alternative: a similar element exists with different text, e.g. "LOG IN" instead of "Login"
- "alternative" + coordinates: the element is visible but its text does not match exactly
- "fail": the element clearly does not exist on this fully loaded screen

Be decisive. Only suggest retry if you see clear loading indicators."#,
            failure.action, failure.target, failure.error
        );
        let text = self.generate(&prompt, image).await?;
        parse_recovery(&text)
    }
}

fn map_transport_error(err: reqwest::Error) -> VisionError {
    if err.is_timeout() {
        VisionError::Timeout
    } else {
        VisionError::Connection(err.to_string())
    }
}

fn map_status(status: u16, message: &str) -> VisionError {
    match status {
        429 => VisionError::RateLimited,
        408 => VisionError::Timeout,
        500..=599 => VisionError::Server { status },
        _ => VisionError::Rejected {
            status,
            message: message.chars().take(200).collect(),
        },
    }
}

/// Drop a surrounding ```json fence if the model added one
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

fn parse_object(text: &str) -> Result<serde_json::Map<String, Value>, VisionError> {
    let body = strip_code_fence(text);
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(VisionError::InvalidResponse(format!(
            "expected a JSON object: {}",
            truncate(body)
        ))),
        Err(e) => Err(VisionError::InvalidResponse(format!(
            "{}: {}",
            e,
            truncate(body)
        ))),
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(100).collect()
}

fn reason_of(map: &serde_json::Map<String, Value>) -> String {
    map.get("reason")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string()
}

fn percent_value(value: Option<&Value>) -> Option<f64> {
    let v = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok()?,
        _ => return None,
    };
    (0.0..=100.0).contains(&v).then_some(v)
}

/// Parse a `{"pass", "reason"}` verdict
pub fn parse_judgment(text: &str) -> Result<Judgment, VisionError> {
    let map = parse_object(text)?;
    let pass = map
        .get("pass")
        .and_then(Value::as_bool)
        .ok_or_else(|| VisionError::InvalidResponse("missing boolean 'pass'".into()))?;
    Ok(Judgment {
        pass,
        reason: reason_of(&map),
    })
}

/// Parse a `{"valid", "reason"}` coordinate validation verdict
pub fn parse_validation(text: &str) -> Result<Judgment, VisionError> {
    let map = parse_object(text)?;
    let valid = map
        .get("valid")
        .or_else(|| map.get("pass"))
        .and_then(Value::as_bool)
        .ok_or_else(|| VisionError::InvalidResponse("missing boolean 'valid'".into()))?;
    Ok(Judgment {
        pass: valid,
        reason: reason_of(&map),
    })
}

/// Parse a `{"found", "x_percent", "y_percent"}` answer into pixel coordinates
pub fn parse_location(
    text: &str,
    width: u32,
    height: u32,
) -> Result<Option<(i32, i32)>, VisionError> {
    let map = parse_object(text)?;
    if !map.get("found").and_then(Value::as_bool).unwrap_or(false) {
        log::debug!("Element not located visually: {}", reason_of(&map));
        return Ok(None);
    }

    match (
        percent_value(map.get("x_percent")),
        percent_value(map.get("y_percent")),
    ) {
        (Some(x), Some(y)) => Ok(Some((
            (x * width as f64 / 100.0) as i32,
            (y * height as f64 / 100.0) as i32,
        ))),
        _ => {
            log::warn!("Vision locate reported found without valid coordinates");
            Ok(None)
        }
    }
}

/// Parse recovery advice, normalising anything unusable to a safe decision
pub fn parse_recovery(text: &str) -> Result<RecoveryAdvice, VisionError> {
    let map = parse_object(text)?;
    let reason = reason_of(&map);
    let action = map.get("action").and_then(Value::as_str).unwrap_or("fail");

    let advice = match action {
        "retry" => {
            let wait = map
                .get("wait_seconds")
                .and_then(Value::as_f64)
                .filter(|w| *w > 0.0 && *w <= MAX_RETRY_WAIT)
                .unwrap_or(DEFAULT_RETRY_WAIT);
            RecoveryAdvice {
                action: RecoveryAction::Retry { wait_seconds: wait },
                reason,
            }
        }
        "alternative" => {
            let coords = match map.get("coordinates") {
                Some(Value::Array(pair)) if pair.len() == 2 => {
                    percent_value(pair.first()).zip(percent_value(pair.get(1)))
                }
                _ => percent_value(map.get("x_percent")).zip(percent_value(map.get("y_percent"))),
            };
            let alternative = map
                .get("alternative")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty());

            match (coords, alternative) {
                (Some((x_percent, y_percent)), _) => RecoveryAdvice {
                    action: RecoveryAction::AlternativeCoordinates {
                        x_percent,
                        y_percent,
                    },
                    reason,
                },
                (None, Some(alt)) => RecoveryAdvice {
                    action: RecoveryAction::AlternativeTarget(alt.to_string()),
                    reason,
                },
                (None, None) => {
                    log::warn!("Recovery suggested an alternative but provided no target/coords");
                    RecoveryAdvice::fail(format!("{} (no alternative provided)", reason))
                }
            }
        }
        "fail" => RecoveryAdvice::fail(reason),
        other => {
            log::warn!("Invalid recovery action '{}', defaulting to fail", other);
            RecoveryAdvice::fail(reason)
        }
    };

    Ok(advice)
}

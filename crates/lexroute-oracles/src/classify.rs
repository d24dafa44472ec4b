use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use lexroute_core::config::Config;
use lexroute_core::oracle::{Classifier, OracleError};
use lexroute_core::types::{ClassifyRequest, Complexity, Intake, Party, Urgency};

const SYSTEM_PROMPT: &str = "You are a legal intake classifier for a court case triage system. \
Given the text of a submitted case document, respond with ONLY a JSON object with these keys: \
parties (array of {name, role, email}), subject_matter (short phrase), \
risk_signals (array of strings), jurisdiction_signals (array of strings), \
suggested_expertise (array of practice-area tags like civil, criminal, financial, tax, labor, \
family, intellectual_property, cyber, environmental, real_estate, immigration, constitutional, \
administrative), urgency (URGENT, MODERATE or LOW), complexity (low, medium, high or very_high), \
confidence (number in [0,1]) and rationale (one sentence). No other text.";

/// Chat-completions-backed classifier. The HTTP layer reports typed
/// transport failures; malformed model output is repaired with defaults
/// instead of failing the stage.
pub struct HttpClassifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpClassifier {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.classifier_url.trim_end_matches('/').to_string(),
            api_key: config.classifier_api_key.clone(),
            model: config.classifier_model.clone(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, req: &ClassifyRequest) -> Result<Intake, OracleError> {
        if self.api_key.is_empty() {
            return Err(OracleError::ConfigError("CLASSIFIER_API_KEY is not set".into()));
        }

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!(
                    "Title: {}\nJurisdiction: {}\n\n{}",
                    req.title, req.jurisdiction, req.text
                )},
            ],
            "temperature": 0.0,
        });

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(format!("classifier request: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| OracleError::Unavailable(format!("classifier response body: {e}")))?;
        if !status.is_success() {
            return Err(map_http_error(status.as_u16(), &text));
        }

        let envelope: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| OracleError::Unavailable(format!("classifier returned non-JSON: {e}")))?;
        let content = envelope["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();

        let raw = parse_model_json(content).unwrap_or_else(|| {
            warn!("classifier output was not parseable JSON, using defaults");
            json!({})
        });
        Ok(normalize_intake(raw))
    }
}

fn map_http_error(status: u16, body: &str) -> OracleError {
    let detail: String = body.chars().take(300).collect();
    match status {
        401 | 403 => OracleError::ConfigError(format!("classifier rejected credentials: {detail}")),
        402 => OracleError::QuotaExceeded(detail),
        429 if body.contains("insufficient_quota") => OracleError::QuotaExceeded(detail),
        429 => OracleError::RateLimited(detail),
        _ => OracleError::Unavailable(format!("classifier HTTP {status}: {detail}")),
    }
}

/// Extract the JSON object from the model reply, tolerating markdown
/// fences and leading prose.
fn parse_model_json(content: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(content.trim()) {
        return Some(v);
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    serde_json::from_str(&content[start..=end]).ok()
}

/// Repair a raw classifier object into a valid `Intake`. Missing or
/// out-of-range fields fall back to documented defaults with a warning;
/// this function never fails.
pub fn normalize_intake(raw: serde_json::Value) -> Intake {
    let urgency = match raw["urgency"].as_str().and_then(Urgency::parse) {
        Some(u) => u,
        None => {
            warn!("classifier urgency missing or invalid, defaulting to MODERATE");
            Urgency::Moderate
        }
    };

    let confidence = match raw["confidence"].as_f64() {
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => {
            warn!("classifier confidence {c} out of range, defaulting to 0.5");
            0.5
        }
        None => 0.5,
    };

    let parties = raw["parties"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|p| {
                    let name = p["name"].as_str()?.trim().to_string();
                    if name.is_empty() {
                        return None;
                    }
                    Some(Party {
                        name,
                        role: p["role"].as_str().unwrap_or("unknown").to_string(),
                        email: p["email"]
                            .as_str()
                            .map(str::trim)
                            .filter(|e| !e.is_empty())
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Intake {
        parties,
        subject_matter: raw["subject_matter"].as_str().unwrap_or_default().to_string(),
        risk_signals: string_array(&raw["risk_signals"]),
        jurisdiction_signals: string_array(&raw["jurisdiction_signals"]),
        suggested_expertise: string_array(&raw["suggested_expertise"]),
        urgency,
        complexity: raw["complexity"]
            .as_str()
            .and_then(Complexity::parse)
            .unwrap_or_default(),
        confidence,
        rationale: raw["rationale"].as_str().unwrap_or_default().to_string(),
    }
}

fn string_array(v: &serde_json::Value) -> Vec<String> {
    v.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

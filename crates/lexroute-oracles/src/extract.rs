use async_trait::async_trait;
use serde::Deserialize;

use lexroute_core::config::Config;
use lexroute_core::oracle::{OracleError, TextExtractor};
use lexroute_core::types::Extraction;

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Client for the document extraction service. `/extract` does direct
/// text extraction; `/ocr` is the slower image-based fallback.
pub struct HttpExtractor {
    http: reqwest::Client,
    base_url: String,
}

impl HttpExtractor {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.extractor_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_document(&self, path: &str, raw: &[u8]) -> Result<Extraction, OracleError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("content-type", "application/octet-stream")
            .body(raw.to_vec())
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(format!("extractor request: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| OracleError::Unavailable(format!("extractor response body: {e}")))?;
        if !status.is_success() {
            let detail: String = text.chars().take(300).collect();
            return Err(match status.as_u16() {
                429 => OracleError::RateLimited(detail),
                _ => OracleError::Unavailable(format!("extractor HTTP {status}: {detail}")),
            });
        }

        let parsed: ExtractResponse = serde_json::from_str(&text)
            .map_err(|e| OracleError::Unavailable(format!("extractor returned non-JSON: {e}")))?;
        Ok(Extraction {
            text: parsed.text,
            method: if parsed.method.is_empty() {
                path.trim_start_matches('/').to_string()
            } else {
                parsed.method
            },
            confidence: parsed.confidence.clamp(0.0, 1.0),
            metadata: parsed.metadata,
        })
    }
}

#[async_trait]
impl TextExtractor for HttpExtractor {
    async fn extract(&self, raw: &[u8]) -> Result<Extraction, OracleError> {
        self.post_document("/extract", raw).await
    }

    async fn ocr(&self, raw: &[u8]) -> Result<Extraction, OracleError> {
        self.post_document("/ocr", raw).await
    }
}

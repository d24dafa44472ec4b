use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AssignmentNotice, ClassifyRequest, Extraction, Intake, NewsSignals};

/// Transport-level failure from an external oracle, discriminated so
/// operators can tell "try later" from "fix configuration".
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("oracle rate limited: {0}")]
    RateLimited(String),
    #[error("oracle configuration error: {0}")]
    ConfigError(String),
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

impl OracleError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::RateLimited(_) => "rate_limited",
            Self::ConfigError(_) => "config_error",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Extracts text from a raw submitted document. `ocr` is the fallback
/// path when plain extraction yields nothing usable.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, raw: &[u8]) -> Result<Extraction, OracleError>;

    async fn ocr(&self, raw: &[u8]) -> Result<Extraction, OracleError>;
}

/// Classifies extracted case text into a normalized intake result.
/// Implementations must be lenient: malformed oracle output is repaired
/// with defaults, only transport failures surface as errors.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, req: &ClassifyRequest) -> Result<Intake, OracleError>;
}

/// Assesses news sensitivity for a classified case.
#[async_trait]
pub trait NewsAssessor: Send + Sync {
    async fn assess(&self, intake: &Intake, jurisdiction: &str)
        -> Result<NewsSignals, OracleError>;
}

/// Delivers one assignment notice to one party. Failures never roll back
/// the assignment.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_assignment(&self, notice: &AssignmentNotice) -> Result<()>;
}

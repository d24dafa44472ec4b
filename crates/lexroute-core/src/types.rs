use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Case Lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Intake,
    Processing,
    Classified,
    Assigned,
    Accepted,
    InProgress,
    Completed,
    Archived,
    Error,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Processing => "processing",
            Self::Classified => "classified",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intake" => Some(Self::Intake),
            "processing" => Some(Self::Processing),
            "classified" => Some(Self::Classified),
            "assigned" => Some(Self::Assigned),
            "accepted" => Some(Self::Accepted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Case urgency. Escalation only ever moves toward `Urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    Urgent,
    Moderate,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "URGENT",
            Self::Moderate => "MODERATE",
            Self::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "URGENT" => Some(Self::Urgent),
            "MODERATE" => Some(Self::Moderate),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }

    /// Ordering rank for monotonic escalation checks (higher = more urgent).
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Moderate => 1,
            Self::Urgent => 2,
        }
    }
}

// ── Processing Stages ────────────────────────────────────────────────────

/// The named steps of the intake pipeline, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Upload,
    TextExtraction,
    OcrProcessing,
    AiClassification,
    NewsCheck,
    Assignment,
    Notification,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::TextExtraction => "text_extraction",
            Self::OcrProcessing => "ocr_processing",
            Self::AiClassification => "ai_classification",
            Self::NewsCheck => "news_check",
            Self::Assignment => "assignment",
            Self::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(Self::Upload),
            "text_extraction" => Some(Self::TextExtraction),
            "ocr_processing" => Some(Self::OcrProcessing),
            "ai_classification" => Some(Self::AiClassification),
            "news_check" => Some(Self::NewsCheck),
            "assignment" => Some(Self::Assignment),
            "notification" => Some(Self::Notification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transition for the same cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One live processing-stage record on a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStage {
    pub id: i64,
    pub case_id: i64,
    pub stage: StageName,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: String,
    /// Free-form JSON object, shallow-merged on update.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Intake (classification output) ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    /// e.g. "plaintiff", "defendant", "respondent".
    pub role: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Estimated case complexity, used in lawyer experience weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Complexity {
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Low => 0.5,
            Self::Medium => 1.0,
            Self::High => 1.5,
            Self::VeryHigh => 2.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "very_high" | "very high" => Some(Self::VeryHigh),
            _ => None,
        }
    }
}

/// Structured output of case classification. Produced once per case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intake {
    #[serde(default)]
    pub parties: Vec<Party>,
    #[serde(default)]
    pub subject_matter: String,
    #[serde(default)]
    pub risk_signals: Vec<String>,
    #[serde(default)]
    pub jurisdiction_signals: Vec<String>,
    /// Practice-area tags the classifier suggests for candidate matching.
    #[serde(default)]
    pub suggested_expertise: Vec<String>,
    pub urgency: Urgency,
    #[serde(default)]
    pub complexity: Complexity,
    /// Classifier confidence in [0,1].
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

// ── News Signals ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSource {
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Per-article contribution in [0,1].
    pub relevance: f64,
}

/// Sensitivity assessment derived from external news search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsSignals {
    /// Aggregate sensitivity score in [0,100].
    pub score: f64,
    #[serde(default)]
    pub sources: Vec<NewsSource>,
    #[serde(default)]
    pub geo_match: bool,
    #[serde(default)]
    pub political_sensitivity: bool,
    #[serde(default)]
    pub public_order_concern: bool,
}

// ── Candidates ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Judge,
    Lawyer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Judge => "judge",
            Self::Lawyer => "lawyer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "judge" => Some(Self::Judge),
            "lawyer" => Some(Self::Lawyer),
            _ => None,
        }
    }
}

/// Judge seniority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Junior,
    Senior,
    Chief,
}

impl Seniority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Junior => "junior",
            Self::Senior => "senior",
            Self::Chief => "chief",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "junior" => Some(Self::Junior),
            "senior" => Some(Self::Senior),
            "chief" => Some(Self::Chief),
            _ => None,
        }
    }
}

/// A conflict-of-interest entry on a candidate profile. A candidate is
/// excluded from any case whose client or party emails match, or whose
/// case number matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub email: String,
    pub case_number: String,
    pub reason: String,
}

/// A judge or lawyer profile eligible for assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub id: i64,
    pub role: Role,
    pub name: String,
    pub email: String,
    pub active: bool,
    pub expertise: Vec<String>,
    pub current_load: i64,
    pub max_capacity: i64,
    /// Rating in [0,5].
    pub rating: f64,
    /// Set for judges only.
    pub seniority: Option<Seniority>,
    /// Set for lawyers only.
    pub years_experience: i64,
    pub conflicts: Vec<Conflict>,
    pub created_at: DateTime<Utc>,
}

// ── Assignment ───────────────────────────────────────────────────────────

/// Itemized multi-factor score for one candidate. Total range is [0,120].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Expertise/tag overlap, [0,60].
    pub expertise_match: f64,
    /// Remaining capacity, [0,20].
    pub availability: f64,
    /// Load bias, [0,10]. Deliberately redundant with availability.
    pub load_balance: f64,
    /// Seniority (judges) or experience (lawyers), [0,5].
    pub seniority_weight: f64,
    /// Profile rating, [0,5].
    pub rating: f64,
    /// [0,10], non-zero only for URGENT cases.
    pub urgency_bonus: f64,
    /// [0,10], non-zero only when news sensitivity >= 50.
    pub news_sensitivity_bonus: f64,
    pub total: f64,
}

/// A committed judge/lawyer pairing for a case. Superseded on
/// reassignment, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub case_id: i64,
    pub judge_id: i64,
    pub lawyer_id: i64,
    pub judge_score: ScoreBreakdown,
    pub lawyer_score: ScoreBreakdown,
    pub judge_accepted: bool,
    pub lawyer_accepted: bool,
    pub reassignment_requested: bool,
    pub reassignment_reason: String,
    pub scheduled_slot: Option<String>,
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

/// What the assignment engine hands back on success.
#[derive(Debug, Clone)]
pub struct AssignmentOutcome {
    pub assignment_id: i64,
    pub judge_id: i64,
    pub judge_total: f64,
    pub lawyer_id: i64,
    pub lawyer_total: f64,
}

// ── Case ─────────────────────────────────────────────────────────────────

/// A submitted legal case as stored in the database. Stage records and
/// assignments live in their own tables and are queried separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: i64,
    pub case_number: String,
    pub title: String,
    pub jurisdiction: String,
    pub client_email: String,
    /// Path to the raw submitted document.
    pub raw_ref: String,
    pub extracted_text: String,
    pub status: CaseStatus,
    /// Set once classification completes; overwritten (never cleared) by
    /// escalation.
    pub final_urgency: Option<Urgency>,
    pub urgency_escalated: bool,
    pub escalation_reason: String,
    pub intake: Option<Intake>,
    pub news: Option<NewsSignals>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Case {
    /// Client email plus every party email from the intake, lowercased.
    /// This is the hard-exclusion set for conflict filtering.
    pub fn conflict_emails(&self) -> Vec<String> {
        let mut emails = Vec::new();
        if !self.client_email.is_empty() {
            emails.push(self.client_email.to_lowercase());
        }
        if let Some(intake) = &self.intake {
            for party in &intake.parties {
                if let Some(email) = &party.email {
                    if !email.is_empty() {
                        emails.push(email.to_lowercase());
                    }
                }
            }
        }
        emails
    }
}

// ── Oracle payloads ──────────────────────────────────────────────────────

/// Output of the text-extraction oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub text: String,
    /// e.g. "pdf_text", "ocr".
    pub method: String,
    /// Extraction confidence in [0,1].
    pub confidence: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Input to the classification oracle.
#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub text: String,
    pub title: String,
    pub jurisdiction: String,
}

/// One message to a notified party after a successful assignment.
#[derive(Debug, Clone)]
pub struct AssignmentNotice {
    pub recipient_email: String,
    pub recipient_name: String,
    pub case_number: String,
    pub title: String,
    pub urgency: Urgency,
    pub submitted_at: DateTime<Utc>,
    pub jurisdiction: String,
}

// ── Audit ────────────────────────────────────────────────────────────────

/// Append-only audit entry. The core emits one per stage failure, per
/// successful assignment, and per escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub case_id: Option<i64>,
    pub kind: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

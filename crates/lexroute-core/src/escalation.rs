use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::assignment::NoCandidateReport;
use crate::db::Db;
use crate::types::{Case, CaseStatus, NewsSignals, Urgency};

/// Evaluate the news escalation rules against the case's current urgency.
/// Rules are checked in priority order and the first match wins. Returns
/// the raised urgency and a human-readable reason, or `None` when no rule
/// fires. Escalation is monotonic: a result never lowers urgency.
pub fn evaluate_news_escalation(
    news: &NewsSignals,
    current: Urgency,
) -> Option<(Urgency, String)> {
    if news.score >= 80.0
        && (news.political_sensitivity || news.public_order_concern)
        && current != Urgency::Urgent
    {
        let signal = if news.political_sensitivity {
            "political sensitivity"
        } else {
            "public order concern"
        };
        return Some((
            Urgency::Urgent,
            format!(
                "news sensitivity {:.0} with {signal} while case was {}",
                news.score,
                current.as_str()
            ),
        ));
    }

    if news.score >= 60.0 && news.public_order_concern && current == Urgency::Low {
        return Some((
            Urgency::Moderate,
            format!(
                "news sensitivity {:.0} with public order concern on a LOW case",
                news.score
            ),
        ));
    }

    if news.score >= 70.0 && current == Urgency::Low {
        return Some((
            Urgency::Moderate,
            format!("news sensitivity {:.0} on a LOW case", news.score),
        ));
    }

    None
}

/// Applies escalation decisions to the store and records the audit trail
/// for conditions that need an administrator.
pub struct EscalationHandler {
    db: Arc<Db>,
}

impl EscalationHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Apply the news escalation rules to a case after its news check.
    /// Returns the raised urgency when one applied.
    pub fn apply_news_rules(&self, case: &Case, news: &NewsSignals) -> Result<Option<Urgency>> {
        let current = case
            .final_urgency
            .or_else(|| case.intake.as_ref().map(|i| i.urgency))
            .unwrap_or(Urgency::Moderate);

        let Some((raised, reason)) = evaluate_news_escalation(news, current) else {
            return Ok(None);
        };
        if raised.rank() <= current.rank() {
            warn!(
                "escalation rule produced non-raise {} -> {} on case #{}, ignoring",
                current.as_str(),
                raised.as_str(),
                case.id
            );
            return Ok(None);
        }

        self.db.escalate_urgency(case.id, raised, &reason)?;
        self.db.append_audit(
            Some(case.id),
            "urgency_escalated",
            &format!("{} -> {}: {reason}", current.as_str(), raised.as_str()),
            serde_json::json!({
                "from": current.as_str(),
                "to": raised.as_str(),
                "news_score": news.score,
            }),
        );
        Ok(Some(raised))
    }

    /// No viable judge/lawyer pair was found. Park the case in `error`
    /// with a full audit entry so an administrator can intervene;
    /// candidate loads are untouched.
    pub fn no_viable_candidates(&self, case: &Case, report: &NoCandidateReport) -> Result<()> {
        warn!(
            "case #{} has no viable candidates: {}",
            case.id, report.detail
        );
        self.db.append_audit(
            Some(case.id),
            "no_viable_candidates",
            &report.detail,
            serde_json::json!({
                "judges_considered": report.judges_considered,
                "judge_survivors": report.judge_survivors,
                "lawyers_considered": report.lawyers_considered,
                "lawyer_survivors": report.lawyer_survivors,
            }),
        );
        self.db.update_case_status(case.id, CaseStatus::Error)?;
        Ok(())
    }
}

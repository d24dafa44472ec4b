use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::db::Db;
use crate::types::{
    Assignment, AssignmentOutcome, CandidateProfile, Case, CaseStatus, Complexity, Intake, Role,
    ScoreBreakdown, Seniority, Urgency,
};

/// Candidates scoring below the role threshold are never assigned.
pub const MIN_JUDGE_SCORE: f64 = 40.0;
pub const MIN_LAWYER_SCORE: f64 = 35.0;

/// Subject-matter keyword → practice-area tag. Checked against the
/// lowercased subject matter; first column is a substring match.
const PRACTICE_AREA_KEYWORDS: &[(&str, &str)] = &[
    ("contract", "civil"),
    ("breach", "civil"),
    ("negligence", "civil"),
    ("tort", "civil"),
    ("defamation", "civil"),
    ("murder", "criminal"),
    ("assault", "criminal"),
    ("theft", "criminal"),
    ("homicide", "criminal"),
    ("narcotic", "criminal"),
    ("fraud", "financial"),
    ("embezzle", "financial"),
    ("securities", "financial"),
    ("money launder", "financial"),
    ("insolven", "financial"),
    ("bankrupt", "financial"),
    ("tax", "tax"),
    ("customs", "tax"),
    ("employment", "labor"),
    ("dismissal", "labor"),
    ("wage", "labor"),
    ("union", "labor"),
    ("custody", "family"),
    ("divorce", "family"),
    ("adoption", "family"),
    ("inheritance", "family"),
    ("patent", "intellectual_property"),
    ("trademark", "intellectual_property"),
    ("copyright", "intellectual_property"),
    ("data breach", "cyber"),
    ("hacking", "cyber"),
    ("ransomware", "cyber"),
    ("privacy", "cyber"),
    ("pollution", "environmental"),
    ("emissions", "environmental"),
    ("zoning", "real_estate"),
    ("land", "real_estate"),
    ("tenancy", "real_estate"),
    ("eviction", "real_estate"),
    ("asylum", "immigration"),
    ("deportation", "immigration"),
    ("visa", "immigration"),
    ("constitution", "constitutional"),
    ("judicial review", "constitutional"),
    ("procurement", "administrative"),
    ("licensing", "administrative"),
];

/// Derive the case's required practice-area tags: AI-suggested expertise
/// plus the keyword map over the subject matter. Defaults to `civil` when
/// nothing maps.
pub fn required_tags(intake: &Intake) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tags = Vec::new();

    for tag in &intake.suggested_expertise {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && seen.insert(tag.clone()) {
            tags.push(tag);
        }
    }

    let subject = intake.subject_matter.to_lowercase();
    for (keyword, area) in PRACTICE_AREA_KEYWORDS {
        if subject.contains(keyword) && seen.insert((*area).to_string()) {
            tags.push((*area).to_string());
        }
    }

    if tags.is_empty() {
        tags.push("civil".to_string());
    }
    tags
}

// ── Scoring ──────────────────────────────────────────────────────────────

/// Seniority multiplier for the urgency and news bonuses. Judges map by
/// tier; lawyers map by experience brackets onto the same scale.
fn seniority_multiplier(c: &CandidateProfile) -> f64 {
    match c.role {
        Role::Judge => match c.seniority {
            Some(Seniority::Junior) | None => 0.5,
            Some(Seniority::Senior) => 1.0,
            Some(Seniority::Chief) => 1.5,
        },
        Role::Lawyer => {
            if c.years_experience < 5 {
                0.5
            } else if c.years_experience < 15 {
                1.0
            } else {
                1.5
            }
        }
    }
}

fn seniority_weight(c: &CandidateProfile, urgency: Urgency, complexity: Complexity) -> f64 {
    match c.role {
        Role::Judge => {
            let base = match c.seniority {
                Some(Seniority::Junior) | None => 1.0,
                Some(Seniority::Senior) => 3.0,
                Some(Seniority::Chief) => 5.0,
            };
            let weighted: f64 = if urgency == Urgency::Urgent { base * 1.5 } else { base };
            weighted.min(5.0)
        }
        Role::Lawyer => {
            let experience = (c.years_experience as f64 / 20.0).min(1.0);
            (experience * complexity.multiplier()).min(5.0)
        }
    }
}

/// Compute the full score breakdown for one candidate against one case.
pub fn score_candidate(
    c: &CandidateProfile,
    required: &[String],
    urgency: Urgency,
    complexity: Complexity,
    news_score: f64,
) -> ScoreBreakdown {
    let capacity = c.max_capacity.max(1) as f64;
    let load = (c.current_load.max(0) as f64).min(capacity);

    let expertise_match = if required.is_empty() {
        30.0
    } else {
        let tags: HashSet<String> = c.expertise.iter().map(|t| t.to_lowercase()).collect();
        let overlap = required.iter().filter(|t| tags.contains(*t)).count();
        (overlap as f64 / required.len() as f64) * 60.0
    };

    let availability = ((capacity - load) / capacity) * 20.0;
    // Intentionally overlaps with availability to bias further toward
    // under-loaded candidates.
    let load_balance = (1.0 - load / capacity) * 10.0;

    let seniority_weight = seniority_weight(c, urgency, complexity);
    let rating = c.rating.clamp(0.0, 5.0);

    let multiplier = seniority_multiplier(c);
    let urgency_bonus = if urgency == Urgency::Urgent {
        (10.0 * multiplier).min(10.0)
    } else {
        0.0
    };
    let news_sensitivity_bonus = if news_score < 50.0 {
        0.0
    } else {
        (((news_score - 50.0) / 50.0) * 10.0 * multiplier).min(10.0)
    };

    let total = expertise_match
        + availability
        + load_balance
        + seniority_weight
        + rating
        + urgency_bonus
        + news_sensitivity_bonus;

    ScoreBreakdown {
        expertise_match,
        availability,
        load_balance,
        seniority_weight,
        rating,
        urgency_bonus,
        news_sensitivity_bonus,
        total,
    }
}

// ── Engine ───────────────────────────────────────────────────────────────

/// Candidate counts reported when assignment finds no viable pair; feeds
/// the escalation audit entry for manual admin reassignment.
#[derive(Debug, Clone)]
pub struct NoCandidateReport {
    pub judges_considered: usize,
    pub judge_survivors: usize,
    pub lawyers_considered: usize,
    pub lawyer_survivors: usize,
    pub detail: String,
}

#[derive(Debug)]
pub enum AssignmentDecision {
    Assigned(AssignmentOutcome),
    NoViableCandidates(NoCandidateReport),
}

pub struct AssignmentEngine {
    db: Arc<Db>,
}

struct Ranked {
    candidate: CandidateProfile,
    score: ScoreBreakdown,
}

impl AssignmentEngine {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Hard exclusion: any conflict entry matching the case's client or
    /// party emails, or the case number itself.
    fn has_conflict(c: &CandidateProfile, excluded_emails: &[String], case_number: &str) -> bool {
        c.conflicts.iter().any(|conflict| {
            let email = conflict.email.to_lowercase();
            (!email.is_empty() && excluded_emails.iter().any(|e| *e == email))
                || (!conflict.case_number.is_empty() && conflict.case_number == case_number)
        })
    }

    fn has_matching_tag(c: &CandidateProfile, required: &[String]) -> bool {
        let tags: HashSet<String> = c.expertise.iter().map(|t| t.to_lowercase()).collect();
        required.iter().any(|t| tags.contains(t))
    }

    /// Filter, score, and rank one role's candidates. Returns the ranked
    /// survivors (threshold applied) and how many were considered.
    fn rank_role(
        &self,
        role: Role,
        case: &Case,
        required: &[String],
        urgency: Urgency,
        complexity: Complexity,
        news_score: f64,
        threshold: f64,
    ) -> Result<(Vec<Ranked>, usize)> {
        let excluded = case.conflict_emails();
        let pool = self.db.list_available_candidates(role)?;
        let considered = pool.len();

        let mut ranked: Vec<Ranked> = pool
            .into_iter()
            .filter(|c| Self::has_matching_tag(c, required))
            .filter(|c| !Self::has_conflict(c, &excluded, &case.case_number))
            .map(|c| {
                let score = score_candidate(&c, required, urgency, complexity, news_score);
                Ranked { candidate: c, score }
            })
            .filter(|r| r.score.total >= threshold)
            .collect();

        // Deterministic order: total desc, then current load asc, then id.
        ranked.sort_by(|a, b| {
            b.score
                .total
                .partial_cmp(&a.score.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.candidate.current_load.cmp(&b.candidate.current_load))
                .then(a.candidate.id.cmp(&b.candidate.id))
        });

        Ok((ranked, considered))
    }

    /// Reserve capacity for the best-ranked candidate that still has room,
    /// walking down the ranking if a concurrent assignment won the race.
    fn reserve_best(&self, ranked: &[Ranked]) -> Result<Option<usize>> {
        for (idx, r) in ranked.iter().enumerate() {
            if self.db.reserve_capacity(r.candidate.id)? {
                if idx > 0 {
                    info!(
                        "{} #{} was filled concurrently, picked next-ranked #{}",
                        r.candidate.role.as_str(),
                        ranked[0].candidate.id,
                        r.candidate.id
                    );
                }
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    /// Run the full assignment algorithm for a classified case. On success
    /// the assignment is committed, both loads are incremented (atomically,
    /// at the storage boundary), and the case moves to `assigned`.
    /// On no-viable-candidates nothing is mutated; the caller routes the
    /// report to the escalation handler.
    pub fn assign(&self, case: &Case) -> Result<AssignmentDecision> {
        let Some(intake) = &case.intake else {
            bail!("assign: case #{} has no intake result", case.id);
        };
        let urgency = case.final_urgency.unwrap_or(intake.urgency);
        let complexity = intake.complexity;
        let news_score = case.news.as_ref().map(|n| n.score).unwrap_or(0.0);
        let required = required_tags(intake);

        let (judges, judges_considered) = self.rank_role(
            Role::Judge, case, &required, urgency, complexity, news_score, MIN_JUDGE_SCORE,
        )?;
        let (lawyers, lawyers_considered) = self.rank_role(
            Role::Lawyer, case, &required, urgency, complexity, news_score, MIN_LAWYER_SCORE,
        )?;

        if judges.is_empty() || lawyers.is_empty() {
            let detail = format!(
                "required tags [{}]: {}/{} judges and {}/{} lawyers survived filtering",
                required.join(", "),
                judges.len(),
                judges_considered,
                lawyers.len(),
                lawyers_considered,
            );
            return Ok(AssignmentDecision::NoViableCandidates(NoCandidateReport {
                judges_considered,
                judge_survivors: judges.len(),
                lawyers_considered,
                lawyer_survivors: lawyers.len(),
                detail,
            }));
        }

        // Loads are only incremented here, after full validation, through
        // the store's conditional increment.
        let Some(judge_idx) = self.reserve_best(&judges)? else {
            return Ok(AssignmentDecision::NoViableCandidates(NoCandidateReport {
                judges_considered,
                judge_survivors: 0,
                lawyers_considered,
                lawyer_survivors: lawyers.len(),
                detail: "all surviving judges reached capacity concurrently".into(),
            }));
        };
        let judge = &judges[judge_idx];

        let lawyer_idx = match self.reserve_best(&lawyers)? {
            Some(idx) => idx,
            None => {
                if !self.db.release_capacity(judge.candidate.id)? {
                    warn!("release after failed lawyer reservation changed no rows");
                }
                return Ok(AssignmentDecision::NoViableCandidates(NoCandidateReport {
                    judges_considered,
                    judge_survivors: judges.len(),
                    lawyers_considered,
                    lawyer_survivors: 0,
                    detail: "all surviving lawyers reached capacity concurrently".into(),
                }));
            }
        };
        let lawyer = &lawyers[lawyer_idx];

        let assignment = Assignment {
            id: 0,
            case_id: case.id,
            judge_id: judge.candidate.id,
            lawyer_id: lawyer.candidate.id,
            judge_score: judge.score.clone(),
            lawyer_score: lawyer.score.clone(),
            judge_accepted: false,
            lawyer_accepted: false,
            reassignment_requested: false,
            reassignment_reason: String::new(),
            scheduled_slot: None,
            superseded: false,
            created_at: Utc::now(),
        };
        let assignment_id = match self.db.insert_assignment(&assignment) {
            Ok(id) => id,
            Err(e) => {
                // Undo both reservations before surfacing the failure.
                let _ = self.db.release_capacity(judge.candidate.id);
                let _ = self.db.release_capacity(lawyer.candidate.id);
                return Err(e).context("commit assignment");
            }
        };

        self.db.update_case_status(case.id, CaseStatus::Assigned)?;
        self.db.append_audit(
            Some(case.id),
            "assignment_committed",
            &format!(
                "assigned judge #{} ({:.1}) and lawyer #{} ({:.1})",
                judge.candidate.id, judge.score.total, lawyer.candidate.id, lawyer.score.total
            ),
            serde_json::json!({
                "assignment_id": assignment_id,
                "judge_id": judge.candidate.id,
                "judge_total": judge.score.total,
                "lawyer_id": lawyer.candidate.id,
                "lawyer_total": lawyer.score.total,
                "required_tags": required,
            }),
        );

        info!(
            "case #{} assigned: judge #{} ({:.1}), lawyer #{} ({:.1})",
            case.id, judge.candidate.id, judge.score.total, lawyer.candidate.id, lawyer.score.total
        );

        Ok(AssignmentDecision::Assigned(AssignmentOutcome {
            assignment_id,
            judge_id: judge.candidate.id,
            judge_total: judge.score.total,
            lawyer_id: lawyer.candidate.id,
            lawyer_total: lawyer.score.total,
        }))
    }

    /// Release the live assignment's load contributions and supersede it.
    /// Loads decrement only here; releases are floored at zero with a warn.
    pub fn release_current(&self, case_id: i64, reason: &str) -> Result<()> {
        let Some(prior) = self.db.current_assignment(case_id)? else {
            return Ok(());
        };
        if !self.db.release_capacity(prior.judge_id)? {
            warn!("release case #{case_id}: judge #{} load already zero", prior.judge_id);
        }
        if !self.db.release_capacity(prior.lawyer_id)? {
            warn!("release case #{case_id}: lawyer #{} load already zero", prior.lawyer_id);
        }
        self.db.supersede_assignment(prior.id, reason)?;
        self.db.append_audit(
            Some(case_id),
            "reassignment",
            &format!("assignment #{} superseded: {reason}", prior.id),
            serde_json::json!({
                "superseded_assignment_id": prior.id,
                "judge_id": prior.judge_id,
                "lawyer_id": prior.lawyer_id,
            }),
        );
        Ok(())
    }

    /// Release the current assignment's load contributions, supersede it,
    /// revert the case to `classified`, and re-run the full algorithm.
    pub fn reassign(&self, case_id: i64, reason: &str) -> Result<AssignmentDecision> {
        let Some(case) = self.db.get_case(case_id)? else {
            bail!("reassign: case #{case_id} not found");
        };

        self.release_current(case_id, reason)?;

        self.db.update_case_status(case_id, CaseStatus::Classified)?;
        let case = self
            .db
            .get_case(case_id)?
            .unwrap_or(case);
        self.assign(&case)
    }
}

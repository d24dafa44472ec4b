use std::sync::Arc;

use chrono::Utc;
use lexroute_core::assignment::NoCandidateReport;
use lexroute_core::db::Db;
use lexroute_core::escalation::{evaluate_news_escalation, EscalationHandler};
use lexroute_core::types::{Case, CaseStatus, Complexity, Intake, NewsSignals, Urgency};

fn news(score: f64, political: bool, public_order: bool) -> NewsSignals {
    NewsSignals {
        score,
        sources: Vec::new(),
        geo_match: false,
        political_sensitivity: political,
        public_order_concern: public_order,
    }
}

// ── Rule evaluation ──────────────────────────────────────────────────────

#[test]
fn test_high_score_political_escalates_to_urgent() {
    let result = evaluate_news_escalation(&news(85.0, true, false), Urgency::Low);
    let (urgency, reason) = result.unwrap();
    assert_eq!(urgency, Urgency::Urgent);
    assert!(reason.contains("political"));

    let from_moderate = evaluate_news_escalation(&news(85.0, false, true), Urgency::Moderate);
    assert_eq!(from_moderate.unwrap().0, Urgency::Urgent);
}

#[test]
fn test_urgent_case_never_reescalates() {
    assert!(evaluate_news_escalation(&news(99.0, true, true), Urgency::Urgent).is_none());
}

#[test]
fn test_public_order_rule_raises_low_to_moderate() {
    let result = evaluate_news_escalation(&news(65.0, false, true), Urgency::Low);
    assert_eq!(result.unwrap().0, Urgency::Moderate);

    // Same signals but the case is already MODERATE: nothing to raise.
    assert!(evaluate_news_escalation(&news(65.0, false, true), Urgency::Moderate).is_none());
}

#[test]
fn test_plain_score_rule_raises_low_to_moderate() {
    let result = evaluate_news_escalation(&news(72.0, false, false), Urgency::Low);
    assert_eq!(result.unwrap().0, Urgency::Moderate);

    assert!(evaluate_news_escalation(&news(72.0, false, false), Urgency::Moderate).is_none());
}

#[test]
fn test_quiet_news_never_escalates() {
    assert!(evaluate_news_escalation(&news(40.0, false, false), Urgency::Low).is_none());
    assert!(evaluate_news_escalation(&news(59.9, false, true), Urgency::Low).is_none());
    assert!(evaluate_news_escalation(&news(69.9, false, false), Urgency::Low).is_none());
}

#[test]
fn test_first_matching_rule_wins() {
    // Score 85 with public order on a LOW case matches all three rules;
    // the URGENT rule takes priority.
    let result = evaluate_news_escalation(&news(85.0, false, true), Urgency::Low);
    assert_eq!(result.unwrap().0, Urgency::Urgent);
}

// ── Handler ──────────────────────────────────────────────────────────────

fn test_db() -> Arc<Db> {
    let db = Db::open_in_memory().unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn seed_case(db: &Db, urgency: Urgency) -> Case {
    let intake = Intake {
        parties: Vec::new(),
        subject_matter: "land dispute".into(),
        risk_signals: Vec::new(),
        jurisdiction_signals: Vec::new(),
        suggested_expertise: Vec::new(),
        urgency,
        complexity: Complexity::Medium,
        confidence: 0.8,
        rationale: String::new(),
    };
    let id = db
        .insert_case(&Case {
            id: 0,
            case_number: format!("LX-E-{}", urgency.as_str()),
            title: "Escalation case".into(),
            jurisdiction: "Metro District".into(),
            client_email: String::new(),
            raw_ref: String::new(),
            extracted_text: "body".into(),
            status: CaseStatus::Processing,
            final_urgency: Some(urgency),
            urgency_escalated: false,
            escalation_reason: String::new(),
            intake: Some(intake),
            news: None,
            created_at: Utc::now(),
            updated_at: None,
        })
        .unwrap();
    db.get_case(id).unwrap().unwrap()
}

#[test]
fn test_apply_news_rules_persists_escalation() {
    let db = test_db();
    let handler = EscalationHandler::new(Arc::clone(&db));
    let case = seed_case(&db, Urgency::Low);

    let raised = handler.apply_news_rules(&case, &news(85.0, true, false)).unwrap();
    assert_eq!(raised, Some(Urgency::Urgent));

    let updated = db.get_case(case.id).unwrap().unwrap();
    assert_eq!(updated.final_urgency, Some(Urgency::Urgent));
    assert!(updated.urgency_escalated);
    assert!(!updated.escalation_reason.is_empty());

    let audit = db.list_audit(case.id).unwrap();
    assert!(audit.iter().any(|e| e.kind == "urgency_escalated"));
}

#[test]
fn test_apply_news_rules_noop_below_thresholds() {
    let db = test_db();
    let handler = EscalationHandler::new(Arc::clone(&db));
    let case = seed_case(&db, Urgency::Low);

    let raised = handler.apply_news_rules(&case, &news(30.0, false, false)).unwrap();
    assert_eq!(raised, None);

    let updated = db.get_case(case.id).unwrap().unwrap();
    assert_eq!(updated.final_urgency, Some(Urgency::Low));
    assert!(!updated.urgency_escalated);
}

#[test]
fn test_no_viable_candidates_parks_case_in_error() {
    let db = test_db();
    let handler = EscalationHandler::new(Arc::clone(&db));
    let case = seed_case(&db, Urgency::Moderate);

    let report = NoCandidateReport {
        judges_considered: 3,
        judge_survivors: 0,
        lawyers_considered: 2,
        lawyer_survivors: 2,
        detail: "no judge cleared the score threshold".into(),
    };
    handler.no_viable_candidates(&case, &report).unwrap();

    let updated = db.get_case(case.id).unwrap().unwrap();
    assert_eq!(updated.status, CaseStatus::Error);

    let audit = db.list_audit(case.id).unwrap();
    let entry = audit.iter().find(|e| e.kind == "no_viable_candidates").unwrap();
    assert_eq!(entry.metadata["judges_considered"], 3);
    assert_eq!(entry.metadata["lawyer_survivors"], 2);
}

use std::sync::Arc;

use chrono::Utc;
use lexroute_core::assignment::{
    required_tags, score_candidate, AssignmentDecision, AssignmentEngine, MIN_JUDGE_SCORE,
};
use lexroute_core::db::Db;
use lexroute_core::types::{
    CandidateProfile, Case, CaseStatus, Complexity, Conflict, Intake, NewsSignals, Party, Role,
    Seniority, Urgency,
};

fn test_db() -> Arc<Db> {
    let db = Db::open_in_memory().unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn make_intake(subject: &str, urgency: Urgency, expertise: &[&str]) -> Intake {
    Intake {
        parties: Vec::new(),
        subject_matter: subject.to_string(),
        risk_signals: Vec::new(),
        jurisdiction_signals: Vec::new(),
        suggested_expertise: expertise.iter().map(|s| s.to_string()).collect(),
        urgency,
        complexity: Complexity::Medium,
        confidence: 0.9,
        rationale: String::new(),
    }
}

fn seed_case(db: &Db, number: &str, intake: Intake, news: Option<NewsSignals>) -> Case {
    let id = db
        .insert_case(&Case {
            id: 0,
            case_number: number.to_string(),
            title: "Test matter".into(),
            jurisdiction: "Metro District".into(),
            client_email: "client@example.com".into(),
            raw_ref: String::new(),
            extracted_text: "body".into(),
            status: CaseStatus::Classified,
            final_urgency: Some(intake.urgency),
            urgency_escalated: false,
            escalation_reason: String::new(),
            intake: Some(intake),
            news,
            created_at: Utc::now(),
            updated_at: None,
        })
        .unwrap();
    db.get_case(id).unwrap().unwrap()
}

#[allow(clippy::too_many_arguments)]
fn candidate(
    role: Role,
    name: &str,
    expertise: &[&str],
    load: i64,
    cap: i64,
    rating: f64,
    seniority: Option<Seniority>,
    years: i64,
) -> CandidateProfile {
    CandidateProfile {
        id: 0,
        role,
        name: name.to_string(),
        email: format!("{}@court.example", name.to_lowercase().replace(' ', ".")),
        active: true,
        expertise: expertise.iter().map(|s| s.to_string()).collect(),
        current_load: load,
        max_capacity: cap,
        rating,
        seniority,
        years_experience: years,
        conflicts: Vec::new(),
        created_at: Utc::now(),
    }
}

fn seed_judge(db: &Db, name: &str, expertise: &[&str], rating: f64, tier: Seniority) -> i64 {
    db.insert_candidate(&candidate(Role::Judge, name, expertise, 0, 10, rating, Some(tier), 0))
        .unwrap()
}

fn seed_lawyer(db: &Db, name: &str, expertise: &[&str], rating: f64, years: i64) -> i64 {
    db.insert_candidate(&candidate(Role::Lawyer, name, expertise, 0, 10, rating, None, years))
        .unwrap()
}

// ── Required tags ────────────────────────────────────────────────────────

#[test]
fn test_required_tags_from_suggestions_and_keywords() {
    let intake = make_intake("breach of contract with fraud claims", Urgency::Moderate, &["Labor"]);
    let tags = required_tags(&intake);
    assert!(tags.contains(&"labor".to_string()));
    assert!(tags.contains(&"civil".to_string()));
    assert!(tags.contains(&"financial".to_string()));
}

#[test]
fn test_required_tags_default_civil() {
    let intake = make_intake("completely unmappable subject", Urgency::Low, &[]);
    assert_eq!(required_tags(&intake), vec!["civil".to_string()]);
}

#[test]
fn test_required_tags_dedup() {
    let intake = make_intake("contract dispute", Urgency::Low, &["civil", "CIVIL"]);
    let tags = required_tags(&intake);
    assert_eq!(tags.iter().filter(|t| *t == "civil").count(), 1);
}

// ── Score components ─────────────────────────────────────────────────────

#[test]
fn test_score_breakdown_senior_judge() {
    let judge = candidate(
        Role::Judge, "A", &["civil"], 0, 10, 4.0, Some(Seniority::Senior), 0,
    );
    let required = vec!["civil".to_string()];
    let score = score_candidate(&judge, &required, Urgency::Moderate, Complexity::Medium, 0.0);
    assert_eq!(score.expertise_match, 60.0);
    assert_eq!(score.availability, 20.0);
    assert_eq!(score.load_balance, 10.0);
    assert_eq!(score.seniority_weight, 3.0);
    assert_eq!(score.rating, 4.0);
    assert_eq!(score.urgency_bonus, 0.0);
    assert_eq!(score.news_sensitivity_bonus, 0.0);
    assert_eq!(score.total, 97.0);
}

#[test]
fn test_urgent_judge_seniority_weight_caps_at_five() {
    let required = vec!["civil".to_string()];
    let senior = candidate(Role::Judge, "S", &["civil"], 0, 10, 0.0, Some(Seniority::Senior), 0);
    let chief = candidate(Role::Judge, "C", &["civil"], 0, 10, 0.0, Some(Seniority::Chief), 0);

    let ss = score_candidate(&senior, &required, Urgency::Urgent, Complexity::Medium, 0.0);
    assert_eq!(ss.seniority_weight, 4.5);
    // Chief base 5 times the urgent factor would exceed the component range.
    let cs = score_candidate(&chief, &required, Urgency::Urgent, Complexity::Medium, 0.0);
    assert_eq!(cs.seniority_weight, 5.0);
}

#[test]
fn test_partial_expertise_overlap() {
    let judge = candidate(
        Role::Judge, "A", &["financial"], 0, 10, 3.0, Some(Seniority::Junior), 0,
    );
    let required = vec!["civil".to_string(), "financial".to_string()];
    let score = score_candidate(&judge, &required, Urgency::Low, Complexity::Medium, 0.0);
    assert_eq!(score.expertise_match, 30.0);
}

#[test]
fn test_urgency_bonus_scales_and_clamps() {
    let required = vec!["civil".to_string()];
    let junior = candidate(Role::Judge, "J", &["civil"], 0, 10, 0.0, Some(Seniority::Junior), 0);
    let chief = candidate(Role::Judge, "C", &["civil"], 0, 10, 0.0, Some(Seniority::Chief), 0);

    let js = score_candidate(&junior, &required, Urgency::Urgent, Complexity::Medium, 0.0);
    let cs = score_candidate(&chief, &required, Urgency::Urgent, Complexity::Medium, 0.0);
    assert_eq!(js.urgency_bonus, 5.0);
    // Chief multiplier would give 15; the component is capped at 10.
    assert_eq!(cs.urgency_bonus, 10.0);

    let moderate = score_candidate(&chief, &required, Urgency::Moderate, Complexity::Medium, 0.0);
    assert_eq!(moderate.urgency_bonus, 0.0);
}

#[test]
fn test_news_bonus_requires_threshold() {
    let required = vec!["civil".to_string()];
    let judge = candidate(Role::Judge, "A", &["civil"], 0, 10, 0.0, Some(Seniority::Senior), 0);

    let quiet = score_candidate(&judge, &required, Urgency::Moderate, Complexity::Medium, 49.9);
    assert_eq!(quiet.news_sensitivity_bonus, 0.0);

    let noisy = score_candidate(&judge, &required, Urgency::Moderate, Complexity::Medium, 75.0);
    assert_eq!(noisy.news_sensitivity_bonus, 5.0);
}

#[test]
fn test_lawyer_experience_weight_uses_complexity() {
    let required = vec!["civil".to_string()];
    let veteran = candidate(Role::Lawyer, "V", &["civil"], 0, 10, 0.0, None, 20);

    let medium = score_candidate(&veteran, &required, Urgency::Low, Complexity::Medium, 0.0);
    assert_eq!(medium.seniority_weight, 1.0);

    let very_high = score_candidate(&veteran, &required, Urgency::Low, Complexity::VeryHigh, 0.0);
    assert_eq!(very_high.seniority_weight, 2.0);
}

#[test]
fn test_availability_shrinks_with_load() {
    let required = vec!["civil".to_string()];
    let busy = candidate(Role::Judge, "B", &["civil"], 8, 10, 0.0, Some(Seniority::Junior), 0);
    let score = score_candidate(&busy, &required, Urgency::Low, Complexity::Medium, 0.0);
    assert!((score.availability - 4.0).abs() < 1e-9);
    assert!((score.load_balance - 2.0).abs() < 1e-9);
}

// ── Assignment algorithm ─────────────────────────────────────────────────

#[test]
fn test_assign_commits_best_pair() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    let strong_judge = seed_judge(&db, "Strong Judge", &["civil"], 4.5, Seniority::Senior);
    let weak_judge = seed_judge(&db, "Weak Judge", &["civil"], 1.0, Seniority::Junior);
    let strong_lawyer = seed_lawyer(&db, "Strong Lawyer", &["civil"], 4.0, 18);
    let _weak_lawyer = seed_lawyer(&db, "Weak Lawyer", &["civil"], 1.0, 2);

    let case = seed_case(
        &db,
        "LX-100",
        make_intake("breach of contract", Urgency::Moderate, &[]),
        None,
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(outcome) => {
            assert_eq!(outcome.judge_id, strong_judge);
            assert_eq!(outcome.lawyer_id, strong_lawyer);
        }
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    }

    let judge = db.get_candidate(strong_judge).unwrap().unwrap();
    let lawyer = db.get_candidate(strong_lawyer).unwrap().unwrap();
    let loser = db.get_candidate(weak_judge).unwrap().unwrap();
    assert_eq!(judge.current_load, 1);
    assert_eq!(lawyer.current_load, 1);
    assert_eq!(loser.current_load, 0);

    let updated = db.get_case(case.id).unwrap().unwrap();
    assert_eq!(updated.status, CaseStatus::Assigned);

    let assignment = db.current_assignment(case.id).unwrap().unwrap();
    assert_eq!(assignment.judge_id, strong_judge);
    assert!(!assignment.superseded);
    assert!(assignment.judge_score.total >= MIN_JUDGE_SCORE);

    let audit = db.list_audit(case.id).unwrap();
    assert!(audit.iter().any(|e| e.kind == "assignment_committed"));
}

#[test]
fn test_conflict_of_interest_is_hard_exclusion() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    // The conflicted judge would win on score if eligible.
    let mut conflicted = candidate(
        Role::Judge, "Conflicted", &["civil"], 0, 10, 5.0, Some(Seniority::Chief), 0,
    );
    conflicted.conflicts.push(Conflict {
        email: "client@example.com".into(),
        case_number: String::new(),
        reason: "former counsel".into(),
    });
    db.insert_candidate(&conflicted).unwrap();
    let clean_judge = seed_judge(&db, "Clean", &["civil"], 2.0, Seniority::Junior);
    let _lawyer = seed_lawyer(&db, "Lawyer", &["civil"], 3.0, 10);

    let case = seed_case(
        &db,
        "LX-101",
        make_intake("contract dispute", Urgency::Moderate, &[]),
        None,
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(outcome) => assert_eq!(outcome.judge_id, clean_judge),
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    }
}

#[test]
fn test_party_email_conflict_excludes() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    let mut conflicted = candidate(
        Role::Lawyer, "Tied", &["civil"], 0, 10, 5.0, None, 20,
    );
    conflicted.conflicts.push(Conflict {
        email: "defendant@example.com".into(),
        case_number: String::new(),
        reason: "relative".into(),
    });
    db.insert_candidate(&conflicted).unwrap();
    let clean_lawyer = seed_lawyer(&db, "Clean Lawyer", &["civil"], 1.0, 5);
    let _judge = seed_judge(&db, "Judge", &["civil"], 3.0, Seniority::Senior);

    let mut intake = make_intake("contract dispute", Urgency::Moderate, &[]);
    intake.parties.push(Party {
        name: "Dana Defendant".into(),
        role: "defendant".into(),
        email: Some("Defendant@Example.com".into()),
    });
    let case = seed_case(&db, "LX-102", intake, None);

    match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(outcome) => assert_eq!(outcome.lawyer_id, clean_lawyer),
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    }
}

#[test]
fn test_no_viable_candidates_leaves_loads_untouched() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    // Judges exist but no lawyer matches the required tags.
    let judge_id = seed_judge(&db, "Judge", &["tax"], 4.0, Seniority::Senior);
    let lawyer_id = seed_lawyer(&db, "Lawyer", &["family"], 4.0, 10);

    let case = seed_case(
        &db,
        "LX-103",
        make_intake("tax assessment appeal", Urgency::Moderate, &[]),
        None,
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::NoViableCandidates(report) => {
            assert_eq!(report.judges_considered, 1);
            assert_eq!(report.judge_survivors, 1);
            assert_eq!(report.lawyer_survivors, 0);
        }
        AssignmentDecision::Assigned(_) => panic!("expected no viable candidates"),
    }

    assert_eq!(db.get_candidate(judge_id).unwrap().unwrap().current_load, 0);
    assert_eq!(db.get_candidate(lawyer_id).unwrap().unwrap().current_load, 0);
    // The engine itself does not move the case; that is the caller's call.
    let case = db.get_case(case.id).unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Classified);
}

#[test]
fn test_below_threshold_candidates_are_rejected() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    // Half tag overlap, nearly full load, junior, unrated: 30 + 2 + 1 + 1 = 34.
    db.insert_candidate(&candidate(
        Role::Judge, "Marginal", &["financial"], 9, 10, 0.0, Some(Seniority::Junior), 0,
    ))
    .unwrap();
    seed_lawyer(&db, "Lawyer", &["civil", "financial"], 4.0, 10);

    let case = seed_case(
        &db,
        "LX-104",
        make_intake("contract fraud", Urgency::Moderate, &[]),
        None,
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::NoViableCandidates(report) => {
            assert_eq!(report.judges_considered, 1);
            assert_eq!(report.judge_survivors, 0);
        }
        AssignmentDecision::Assigned(_) => panic!("expected threshold rejection"),
    }
}

#[test]
fn test_tie_break_prefers_lower_id() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    let first = seed_judge(&db, "First", &["civil"], 3.0, Seniority::Senior);
    let _second = seed_judge(&db, "Second", &["civil"], 3.0, Seniority::Senior);
    let _lawyer = seed_lawyer(&db, "Lawyer", &["civil"], 3.0, 10);

    let case = seed_case(
        &db,
        "LX-105",
        make_intake("contract dispute", Urgency::Moderate, &[]),
        None,
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(outcome) => assert_eq!(outcome.judge_id, first),
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    }
}

#[test]
fn test_full_capacity_candidates_never_selected() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    db.insert_candidate(&candidate(
        Role::Judge, "Full", &["civil"], 10, 10, 5.0, Some(Seniority::Chief), 0,
    ))
    .unwrap();
    let open_judge = seed_judge(&db, "Open", &["civil"], 2.0, Seniority::Junior);
    let _lawyer = seed_lawyer(&db, "Lawyer", &["civil"], 3.0, 10);

    let case = seed_case(
        &db,
        "LX-106",
        make_intake("contract dispute", Urgency::Moderate, &[]),
        None,
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(outcome) => assert_eq!(outcome.judge_id, open_judge),
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    }
}

#[test]
fn test_reserve_capacity_is_bounded() {
    let db = test_db();
    let id = db
        .insert_candidate(&candidate(
            Role::Judge, "Bounded", &["civil"], 9, 10, 0.0, Some(Seniority::Junior), 0,
        ))
        .unwrap();

    assert!(db.reserve_capacity(id).unwrap());
    // Now at capacity; further reservations must fail atomically.
    assert!(!db.reserve_capacity(id).unwrap());
    assert_eq!(db.get_candidate(id).unwrap().unwrap().current_load, 10);

    assert!(db.release_capacity(id).unwrap());
    assert_eq!(db.get_candidate(id).unwrap().unwrap().current_load, 9);
}

#[test]
fn test_release_capacity_floors_at_zero() {
    let db = test_db();
    let id = seed_judge(&db, "Idle", &["civil"], 0.0, Seniority::Junior);
    assert!(!db.release_capacity(id).unwrap());
    assert_eq!(db.get_candidate(id).unwrap().unwrap().current_load, 0);
}

// ── Reassignment ─────────────────────────────────────────────────────────

#[test]
fn test_reassign_supersedes_and_rebalances() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    seed_judge(&db, "Judge A", &["civil"], 4.0, Seniority::Senior);
    seed_judge(&db, "Judge B", &["civil"], 3.9, Seniority::Senior);
    seed_lawyer(&db, "Lawyer A", &["civil"], 4.0, 15);
    seed_lawyer(&db, "Lawyer B", &["civil"], 3.9, 15);

    let case = seed_case(
        &db,
        "LX-107",
        make_intake("contract dispute", Urgency::Moderate, &[]),
        None,
    );

    let first = match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(o) => o,
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    };

    let second = match engine.reassign(case.id, "judge recusal").unwrap() {
        AssignmentDecision::Assigned(o) => o,
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected reassignment, got: {}", report.detail)
        }
    };
    assert_ne!(first.assignment_id, second.assignment_id);

    // Exactly one live assignment; system-wide load is one per role.
    let current = db.current_assignment(case.id).unwrap().unwrap();
    assert_eq!(current.id, second.assignment_id);
    let total_judge_load: i64 = [1i64, 2, 3, 4]
        .iter()
        .filter_map(|id| db.get_candidate(*id).unwrap())
        .filter(|c| c.role == Role::Judge)
        .map(|c| c.current_load)
        .sum();
    assert_eq!(total_judge_load, 1);

    let updated = db.get_case(case.id).unwrap().unwrap();
    assert_eq!(updated.status, CaseStatus::Assigned);

    let audit = db.list_audit(case.id).unwrap();
    assert!(audit.iter().any(|e| e.kind == "reassignment"));
}

#[test]
fn test_news_sensitive_case_prefers_senior_bench() {
    let db = test_db();
    let engine = AssignmentEngine::new(Arc::clone(&db));

    // Equal ratings; only seniority separates them once the news bonus is live.
    let chief = seed_judge(&db, "Chief", &["civil"], 3.0, Seniority::Chief);
    let _junior = seed_judge(&db, "Junior", &["civil"], 3.0, Seniority::Junior);
    let _lawyer = seed_lawyer(&db, "Lawyer", &["civil"], 3.0, 10);

    let news = NewsSignals {
        score: 90.0,
        sources: Vec::new(),
        geo_match: true,
        political_sensitivity: true,
        public_order_concern: false,
    };
    let case = seed_case(
        &db,
        "LX-108",
        make_intake("contract dispute", Urgency::Moderate, &[]),
        Some(news),
    );

    match engine.assign(&case).unwrap() {
        AssignmentDecision::Assigned(outcome) => assert_eq!(outcome.judge_id, chief),
        AssignmentDecision::NoViableCandidates(report) => {
            panic!("expected assignment, got: {}", report.detail)
        }
    }
}

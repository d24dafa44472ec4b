use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use tracing::warn;

use crate::types::{
    Assignment, AuditEntry, Case, CandidateProfile, CaseStatus, Conflict, Intake, NewsSignals,
    ProcessingStage, Role, ScoreBreakdown, Seniority, StageName, StageStatus, Urgency,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn ts_str(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<Case> {
    let status_str: String = row.get(7)?;
    let urgency_str: Option<String> = row.get(8)?;
    let intake_json: Option<String> = row.get(11)?;
    let news_json: Option<String> = row.get(12)?;
    let created_at_str: String = row.get(13)?;
    let updated_at_str: Option<String> = row.get(14)?;
    Ok(Case {
        id: row.get(0)?,
        case_number: row.get(1)?,
        title: row.get(2)?,
        jurisdiction: row.get(3)?,
        client_email: row.get(4)?,
        raw_ref: row.get(5)?,
        extracted_text: row.get(6)?,
        status: CaseStatus::parse(&status_str).unwrap_or(CaseStatus::Error),
        final_urgency: urgency_str.as_deref().and_then(Urgency::parse),
        urgency_escalated: row.get::<_, i64>(9)? != 0,
        escalation_reason: row.get(10)?,
        intake: intake_json.as_deref().and_then(|s| serde_json::from_str::<Intake>(s).ok()),
        news: news_json.as_deref().and_then(|s| serde_json::from_str::<NewsSignals>(s).ok()),
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts_opt(updated_at_str),
    })
}

fn row_to_stage(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessingStage> {
    let stage_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let metadata_str: String = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    Ok(ProcessingStage {
        id: row.get(0)?,
        case_id: row.get(1)?,
        stage: StageName::parse(&stage_str).unwrap_or(StageName::Upload),
        status: StageStatus::parse(&status_str).unwrap_or(StageStatus::Pending),
        started_at: parse_ts_opt(row.get(4)?),
        completed_at: parse_ts_opt(row.get(5)?),
        error: row.get(6)?,
        metadata: serde_json::from_str(&metadata_str)
            .unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_candidate(row: &rusqlite::Row<'_>) -> rusqlite::Result<CandidateProfile> {
    let role_str: String = row.get(1)?;
    let expertise_str: String = row.get(5)?;
    let seniority_str: Option<String> = row.get(9)?;
    let created_at_str: String = row.get(11)?;
    Ok(CandidateProfile {
        id: row.get(0)?,
        role: Role::parse(&role_str).unwrap_or(Role::Lawyer),
        name: row.get(2)?,
        email: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        expertise: serde_json::from_str(&expertise_str).unwrap_or_default(),
        current_load: row.get(6)?,
        max_capacity: row.get(7)?,
        rating: row.get(8)?,
        seniority: seniority_str.as_deref().and_then(Seniority::parse),
        years_experience: row.get(10)?,
        conflicts: Vec::new(),
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_assignment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assignment> {
    let judge_score_str: String = row.get(4)?;
    let lawyer_score_str: String = row.get(5)?;
    let created_at_str: String = row.get(12)?;
    Ok(Assignment {
        id: row.get(0)?,
        case_id: row.get(1)?,
        judge_id: row.get(2)?,
        lawyer_id: row.get(3)?,
        judge_score: serde_json::from_str::<ScoreBreakdown>(&judge_score_str)
            .unwrap_or_default(),
        lawyer_score: serde_json::from_str::<ScoreBreakdown>(&lawyer_score_str)
            .unwrap_or_default(),
        judge_accepted: row.get::<_, i64>(6)? != 0,
        lawyer_accepted: row.get::<_, i64>(7)? != 0,
        reassignment_requested: row.get::<_, i64>(8)? != 0,
        reassignment_reason: row.get(9)?,
        scheduled_slot: row.get(10)?,
        superseded: row.get::<_, i64>(11)? != 0,
        created_at: parse_ts(&created_at_str),
    })
}

const CASE_COLUMNS: &str = "id, case_number, title, jurisdiction, client_email, raw_ref, \
     extracted_text, status, final_urgency, urgency_escalated, escalation_reason, \
     intake_json, news_json, created_at, updated_at";

const STAGE_COLUMNS: &str =
    "id, case_id, stage, status, started_at, completed_at, error, metadata, created_at";

const CANDIDATE_COLUMNS: &str = "id, role, name, email, active, expertise, current_load, \
     max_capacity, rating, seniority, years_experience, created_at";

const ASSIGNMENT_COLUMNS: &str = "id, case_id, judge_id, lawyer_id, judge_score, lawyer_score, \
     judge_accepted, lawyer_accepted, reassignment_requested, reassignment_reason, \
     scheduled_slot, superseded, created_at";

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Cases ─────────────────────────────────────────────────────────────

    pub fn insert_case(&self, case: &Case) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO cases \
             (case_number, title, jurisdiction, client_email, raw_ref, extracted_text, \
              status, final_urgency, urgency_escalated, escalation_reason, \
              intake_json, news_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                case.case_number,
                case.title,
                case.jurisdiction,
                case.client_email,
                case.raw_ref,
                case.extracted_text,
                case.status.as_str(),
                case.final_urgency.map(|u| u.as_str()),
                case.urgency_escalated as i64,
                case.escalation_reason,
                case.intake.as_ref().and_then(|i| serde_json::to_string(i).ok()),
                case.news.as_ref().and_then(|n| serde_json::to_string(n).ok()),
                ts_str(case.created_at),
            ],
        )
        .context("insert_case")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_case(&self, id: i64) -> Result<Option<Case>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1"),
                params![id],
                row_to_case,
            )
            .optional()
            .context("get_case")?;
        Ok(result)
    }

    pub fn get_case_by_number(&self, case_number: &str) -> Result<Option<Case>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {CASE_COLUMNS} FROM cases WHERE case_number = ?1"),
                params![case_number],
                row_to_case,
            )
            .optional()
            .context("get_case_by_number")?;
        Ok(result)
    }

    pub fn list_cases_with_status(&self, status: CaseStatus) -> Result<Vec<Case>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE status = ?1 ORDER BY id ASC"
        ))?;
        let cases = stmt
            .query_map(params![status.as_str()], row_to_case)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_cases_with_status")?;
        Ok(cases)
    }

    pub fn update_case_status(&self, id: i64, status: CaseStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cases SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_str(), id],
        )
        .context("update_case_status")?;
        Ok(())
    }

    pub fn set_extracted_text(&self, id: i64, text: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cases SET extracted_text = ?1, updated_at = ?2 WHERE id = ?3",
            params![text, now_str(), id],
        )
        .context("set_extracted_text")?;
        Ok(())
    }

    /// Store the intake result and set the case's final urgency from it.
    pub fn set_intake(&self, id: i64, intake: &Intake) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let json = serde_json::to_string(intake).context("serialize intake")?;
        conn.execute(
            "UPDATE cases SET intake_json = ?1, final_urgency = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![json, intake.urgency.as_str(), now_str(), id],
        )
        .context("set_intake")?;
        Ok(())
    }

    pub fn set_news(&self, id: i64, news: &NewsSignals) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let json = serde_json::to_string(news).context("serialize news signals")?;
        conn.execute(
            "UPDATE cases SET news_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, now_str(), id],
        )
        .context("set_news")?;
        Ok(())
    }

    /// Raise the case urgency and record the escalation reason. The caller
    /// is responsible for the monotonicity check.
    pub fn escalate_urgency(&self, id: i64, urgency: Urgency, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cases SET final_urgency = ?1, urgency_escalated = 1, \
             escalation_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![urgency.as_str(), reason, now_str(), id],
        )
        .context("escalate_urgency")?;
        Ok(())
    }

    // ── Processing stages ─────────────────────────────────────────────────

    /// Insert a stage record, or reset the existing one for this stage name
    /// to start a new cycle. Exactly one row per (case, stage) ever exists.
    pub fn upsert_stage(&self, case_id: i64, stage: StageName, status: StageStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO processing_stages (case_id, stage, status, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(case_id, stage) DO UPDATE SET \
               status = excluded.status, started_at = NULL, completed_at = NULL, \
               error = '', metadata = '{}', created_at = excluded.created_at",
            params![case_id, stage.as_str(), status.as_str(), now_str()],
        )
        .context("upsert_stage")?;
        Ok(())
    }

    pub fn get_stage(&self, case_id: i64, stage: StageName) -> Result<Option<ProcessingStage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "SELECT {STAGE_COLUMNS} FROM processing_stages \
                     WHERE case_id = ?1 AND stage = ?2"
                ),
                params![case_id, stage.as_str()],
                row_to_stage,
            )
            .optional()
            .context("get_stage")?;
        Ok(result)
    }

    pub fn list_stages(&self, case_id: i64) -> Result<Vec<ProcessingStage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {STAGE_COLUMNS} FROM processing_stages WHERE case_id = ?1 ORDER BY id ASC"
        ))?;
        let stages = stmt
            .query_map(params![case_id], row_to_stage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_stages")?;
        Ok(stages)
    }

    /// Persist a stage record previously loaded with `get_stage`.
    pub fn save_stage(&self, stage: &ProcessingStage) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE processing_stages SET status = ?1, started_at = ?2, completed_at = ?3, \
             error = ?4, metadata = ?5 WHERE id = ?6",
            params![
                stage.status.as_str(),
                stage.started_at.map(ts_str),
                stage.completed_at.map(ts_str),
                stage.error,
                serde_json::to_string(&stage.metadata).unwrap_or_else(|_| "{}".into()),
                stage.id,
            ],
        )
        .context("save_stage")?;
        Ok(())
    }

    // ── Candidates ────────────────────────────────────────────────────────

    pub fn insert_candidate(&self, c: &CandidateProfile) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO candidates \
             (role, name, email, active, expertise, current_load, max_capacity, \
              rating, seniority, years_experience, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                c.role.as_str(),
                c.name,
                c.email,
                c.active as i64,
                serde_json::to_string(&c.expertise).unwrap_or_else(|_| "[]".into()),
                c.current_load,
                c.max_capacity,
                c.rating,
                c.seniority.map(|s| s.as_str()),
                c.years_experience,
                ts_str(c.created_at),
            ],
        )
        .context("insert_candidate")?;
        let id = conn.last_insert_rowid();
        drop(conn);
        for conflict in &c.conflicts {
            self.add_conflict(id, conflict)?;
        }
        Ok(id)
    }

    pub fn add_conflict(&self, candidate_id: i64, conflict: &Conflict) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO conflicts (candidate_id, email, case_number, reason) \
             VALUES (?1, ?2, ?3, ?4)",
            params![candidate_id, conflict.email, conflict.case_number, conflict.reason],
        )
        .context("add_conflict")?;
        Ok(())
    }

    fn load_conflicts(conn: &Connection, candidate_id: i64) -> rusqlite::Result<Vec<Conflict>> {
        let mut stmt = conn.prepare(
            "SELECT email, case_number, reason FROM conflicts \
             WHERE candidate_id = ?1 ORDER BY id ASC",
        )?;
        let conflicts = stmt
            .query_map(params![candidate_id], |row| {
                Ok(Conflict {
                    email: row.get(0)?,
                    case_number: row.get(1)?,
                    reason: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn get_candidate(&self, id: i64) -> Result<Option<CandidateProfile>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = ?1"),
                params![id],
                row_to_candidate,
            )
            .optional()
            .context("get_candidate")?;
        match result {
            Some(mut c) => {
                c.conflicts = Self::load_conflicts(&conn, c.id).context("load_conflicts")?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    /// Active candidates of a role with remaining capacity, in stable id
    /// order, with conflict lists attached. Tag and conflict filtering
    /// happen in the assignment engine.
    pub fn list_available_candidates(&self, role: Role) -> Result<Vec<CandidateProfile>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates \
             WHERE role = ?1 AND active = 1 AND current_load < max_capacity \
             ORDER BY id ASC"
        ))?;
        let mut candidates = stmt
            .query_map(params![role.as_str()], row_to_candidate)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_available_candidates")?;
        for c in &mut candidates {
            c.conflicts = Self::load_conflicts(&conn, c.id).context("load_conflicts")?;
        }
        Ok(candidates)
    }

    /// Atomic conditional increment: succeeds only while load < capacity.
    /// This is the storage-boundary guarantee that prevents the
    /// read-then-write capacity race between concurrent assignments.
    pub fn reserve_capacity(&self, candidate_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE candidates SET current_load = current_load + 1 \
                 WHERE id = ?1 AND current_load < max_capacity",
                params![candidate_id],
            )
            .context("reserve_capacity")?;
        Ok(changed == 1)
    }

    /// Atomic conditional decrement, floored at zero.
    pub fn release_capacity(&self, candidate_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE candidates SET current_load = current_load - 1 \
                 WHERE id = ?1 AND current_load > 0",
                params![candidate_id],
            )
            .context("release_capacity")?;
        Ok(changed == 1)
    }

    // ── Assignments ───────────────────────────────────────────────────────

    pub fn insert_assignment(&self, a: &Assignment) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO assignments \
             (case_id, judge_id, lawyer_id, judge_score, lawyer_score, judge_accepted, \
              lawyer_accepted, reassignment_requested, reassignment_reason, scheduled_slot, \
              superseded, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                a.case_id,
                a.judge_id,
                a.lawyer_id,
                serde_json::to_string(&a.judge_score).context("serialize judge score")?,
                serde_json::to_string(&a.lawyer_score).context("serialize lawyer score")?,
                a.judge_accepted as i64,
                a.lawyer_accepted as i64,
                a.reassignment_requested as i64,
                a.reassignment_reason,
                a.scheduled_slot,
                a.superseded as i64,
                ts_str(a.created_at),
            ],
        )
        .context("insert_assignment")?;
        Ok(conn.last_insert_rowid())
    }

    /// The case's single non-superseded assignment, if any.
    pub fn current_assignment(&self, case_id: i64) -> Result<Option<Assignment>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM assignments \
                     WHERE case_id = ?1 AND superseded = 0 ORDER BY id DESC LIMIT 1"
                ),
                params![case_id],
                row_to_assignment,
            )
            .optional()
            .context("current_assignment")?;
        Ok(result)
    }

    pub fn supersede_assignment(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE assignments SET superseded = 1, reassignment_requested = 1, \
             reassignment_reason = ?1 WHERE id = ?2",
            params![reason, id],
        )
        .context("supersede_assignment")?;
        Ok(())
    }

    // ── Audit log ─────────────────────────────────────────────────────────

    /// Append an audit entry. Failures are logged but never propagated:
    /// an audit-sink error must not mask the error being audited.
    pub fn append_audit(
        &self,
        case_id: Option<i64>,
        kind: &str,
        message: &str,
        metadata: serde_json::Value,
    ) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn.execute(
            "INSERT INTO audit_log (case_id, kind, message, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                case_id,
                kind,
                message,
                metadata.to_string(),
                now_str(),
            ],
        );
        if let Err(e) = result {
            warn!("audit append failed (kind={kind}): {e}");
        }
    }

    pub fn list_audit(&self, case_id: i64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, case_id, kind, message, metadata, created_at \
             FROM audit_log WHERE case_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![case_id], |row| {
                let metadata_str: String = row.get(4)?;
                let created_at_str: String = row.get(5)?;
                Ok(AuditEntry {
                    id: row.get(0)?,
                    case_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    metadata: serde_json::from_str(&metadata_str)
                        .unwrap_or_else(|_| serde_json::json!({})),
                    created_at: parse_ts(&created_at_str),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_audit")?;
        Ok(entries)
    }
}

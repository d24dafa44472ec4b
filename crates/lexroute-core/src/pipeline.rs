use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    assignment::{AssignmentDecision, AssignmentEngine},
    config::Config,
    db::Db,
    escalation::EscalationHandler,
    oracle::{Classifier, NewsAssessor, Notifier, OracleError, TextExtractor},
    stages::StageTracker,
    types::{
        AssignmentNotice, Case, CaseStatus, ClassifyRequest, Extraction, StageName, StageStatus,
        Urgency,
    },
};

/// Extraction output below this confidence is retried through OCR.
const OCR_FALLBACK_CONFIDENCE: f64 = 0.5;

/// How a stage failure affects the rest of the case's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePolicy {
    /// Fatal: the case goes to `error` and processing stops.
    Halt,
    /// Degraded but survivable: record the failure and keep going.
    Continue,
}

enum StageOutcome {
    Completed,
    Failed(String, FailurePolicy),
}

/// Drives every submitted case through its processing stages. One tick
/// dispatches ready cases up to the configured concurrency; each case runs
/// its remaining stages in canonical order on its own task.
pub struct Pipeline {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    extractor: Arc<dyn TextExtractor>,
    classifier: Arc<dyn Classifier>,
    news: Arc<dyn NewsAssessor>,
    notifier: Arc<dyn Notifier>,
    tracker: StageTracker,
    engine: AssignmentEngine,
    escalation: EscalationHandler,
    in_flight: Mutex<HashSet<i64>>,
}

impl Pipeline {
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        extractor: Arc<dyn TextExtractor>,
        classifier: Arc<dyn Classifier>,
        news: Arc<dyn NewsAssessor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tracker: StageTracker::new(Arc::clone(&db)),
            engine: AssignmentEngine::new(Arc::clone(&db)),
            escalation: EscalationHandler::new(Arc::clone(&db)),
            db,
            config,
            extractor,
            classifier,
            news,
            notifier,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn active_case_count(&self) -> usize {
        self.in_flight.try_lock().map(|g| g.len()).unwrap_or(0)
    }

    // ── Main loop ─────────────────────────────────────────────────────────

    /// Main tick: dispatch cases awaiting processing, up to the concurrency
    /// cap. `intake` cases start fresh; `processing` cases (crash recovery)
    /// resume from their first unfinished stage.
    pub async fn tick(self: Arc<Self>) -> Result<()> {
        let mut ready = self.db.list_cases_with_status(CaseStatus::Intake)?;
        ready.extend(self.db.list_cases_with_status(CaseStatus::Processing)?);
        let max_cases = self.config.pipeline_max_cases as usize;

        for case in ready {
            let mut guard = self.in_flight.lock().await;
            if guard.len() >= max_cases {
                break;
            }
            if guard.contains(&case.id) {
                continue;
            }
            guard.insert(case.id);
            drop(guard);

            let pipeline = Arc::clone(&self);
            let case_id = case.id;
            tokio::spawn(async move {
                if let Err(e) = pipeline.process_case(case).await {
                    error!("process_case #{case_id} error: {e}");
                }
                pipeline.in_flight.lock().await.remove(&case_id);
            });
        }

        Ok(())
    }

    // ── Case driver ───────────────────────────────────────────────────────

    /// Run one case through its remaining stages. The case is reloaded
    /// between stages so each handler sees the previous one's writes.
    async fn process_case(&self, case: Case) -> Result<()> {
        info!("pipeline dispatching case #{} [{}]", case.id, case.status.as_str());

        if case.status == CaseStatus::Intake {
            self.db.update_case_status(case.id, CaseStatus::Processing)?;
        }
        // The upload stage is recorded at submission; close it out if the
        // process died before it was marked.
        self.close_upload_stage(case.id)?;

        if !self.run_extraction_stages(case.id).await? {
            return Ok(());
        }
        if !self.run_stage(case.id, StageName::AiClassification).await? {
            return Ok(());
        }
        // News is survivable; escalation happens inside the handler.
        self.run_stage(case.id, StageName::NewsCheck).await?;

        self.db.update_case_status(case.id, CaseStatus::Classified)?;

        if !self.run_stage(case.id, StageName::Assignment).await? {
            return Ok(());
        }
        self.run_stage(case.id, StageName::Notification).await?;

        info!("case #{} fully processed", case.id);
        Ok(())
    }

    fn close_upload_stage(&self, case_id: i64) -> Result<()> {
        match self.db.get_stage(case_id, StageName::Upload)? {
            Some(rec) if !rec.status.is_terminal() => {
                self.tracker
                    .update_stage(case_id, StageName::Upload, StageStatus::InProgress, None, None)?;
                self.tracker
                    .update_stage(case_id, StageName::Upload, StageStatus::Completed, None, None)
            }
            Some(_) => Ok(()),
            None => {
                self.tracker.add_stage(case_id, StageName::Upload, StageStatus::Pending)?;
                self.tracker
                    .update_stage(case_id, StageName::Upload, StageStatus::InProgress, None, None)?;
                self.tracker
                    .update_stage(case_id, StageName::Upload, StageStatus::Completed, None, None)
            }
        }
    }

    /// Text extraction with conditional OCR fallback. Returns false when the
    /// case halted.
    async fn run_extraction_stages(&self, case_id: i64) -> Result<bool> {
        if !self.run_stage(case_id, StageName::TextExtraction).await? {
            return Ok(false);
        }
        let Some(case) = self.db.get_case(case_id)? else {
            bail!("case #{case_id} vanished mid-pipeline");
        };
        let needs_ocr = case.extracted_text.trim().is_empty()
            || self.extraction_confidence(case_id)? < OCR_FALLBACK_CONFIDENCE;
        if needs_ocr {
            info!("case #{case_id}: extraction output unusable, falling back to OCR");
            if !self.run_stage(case_id, StageName::OcrProcessing).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn extraction_confidence(&self, case_id: i64) -> Result<f64> {
        let conf = self
            .db
            .get_stage(case_id, StageName::TextExtraction)?
            .and_then(|s| s.metadata.get("confidence").and_then(|v| v.as_f64()))
            .unwrap_or(0.0);
        Ok(conf)
    }

    /// Run a single stage: skip if already completed (resume path), track
    /// the state machine around the handler, and apply the stage's failure
    /// policy. Returns false when the case must stop.
    async fn run_stage(&self, case_id: i64, stage: StageName) -> Result<bool> {
        if let Some(rec) = self.db.get_stage(case_id, stage)? {
            if rec.status == StageStatus::Completed {
                return Ok(true);
            }
        }
        let Some(case) = self.db.get_case(case_id)? else {
            bail!("case #{case_id} vanished mid-pipeline");
        };

        self.tracker.add_stage(case_id, stage, StageStatus::Pending)?;
        self.tracker
            .update_stage(case_id, stage, StageStatus::InProgress, None, None)?;

        let outcome = match stage {
            StageName::Upload => StageOutcome::Completed,
            StageName::TextExtraction => self.handle_extraction(&case, false).await,
            StageName::OcrProcessing => self.handle_extraction(&case, true).await,
            StageName::AiClassification => self.handle_classification(&case).await,
            StageName::NewsCheck => self.handle_news_check(&case).await,
            StageName::Assignment => self.handle_assignment(&case).await?,
            StageName::Notification => self.handle_notification(&case).await,
        };

        match outcome {
            StageOutcome::Completed => {
                self.tracker
                    .update_stage(case_id, stage, StageStatus::Completed, None, None)?;
                Ok(true)
            }
            StageOutcome::Failed(err, policy) => {
                self.tracker
                    .update_stage(case_id, stage, StageStatus::Failed, Some(&err), None)?;
                self.db.append_audit(
                    Some(case_id),
                    "stage_failed",
                    &format!("{} failed: {err}", stage.as_str()),
                    serde_json::json!({ "stage": stage.as_str() }),
                );
                match policy {
                    FailurePolicy::Halt => {
                        error!("case #{case_id}: {} failed fatally: {err}", stage.as_str());
                        self.db.update_case_status(case_id, CaseStatus::Error)?;
                        Ok(false)
                    }
                    FailurePolicy::Continue => {
                        warn!("case #{case_id}: {} failed, continuing: {err}", stage.as_str());
                        Ok(true)
                    }
                }
            }
        }
    }

    // ── Stage handlers ────────────────────────────────────────────────────

    async fn handle_extraction(&self, case: &Case, ocr: bool) -> StageOutcome {
        let raw = match std::fs::read(&case.raw_ref) {
            Ok(raw) => raw,
            Err(e) => {
                return StageOutcome::Failed(
                    format!("read raw document {:?}: {e}", case.raw_ref),
                    FailurePolicy::Halt,
                );
            }
        };

        let result = if ocr {
            self.with_timeout(self.extractor.ocr(&raw)).await
        } else {
            self.with_timeout(self.extractor.extract(&raw)).await
        };
        let stage = if ocr { StageName::OcrProcessing } else { StageName::TextExtraction };

        match result {
            Ok(extraction) => {
                if ocr && extraction.text.trim().is_empty() {
                    return StageOutcome::Failed(
                        "OCR produced no text".into(),
                        FailurePolicy::Halt,
                    );
                }
                if let Err(e) = self.record_extraction(case.id, stage, &extraction) {
                    return StageOutcome::Failed(e.to_string(), FailurePolicy::Halt);
                }
                StageOutcome::Completed
            }
            Err(e) => StageOutcome::Failed(oracle_error_text(&e), FailurePolicy::Halt),
        }
    }

    fn record_extraction(
        &self,
        case_id: i64,
        stage: StageName,
        extraction: &Extraction,
    ) -> Result<()> {
        self.db.set_extracted_text(case_id, &extraction.text)?;
        self.tracker.update_stage(
            case_id,
            stage,
            StageStatus::InProgress,
            None,
            Some(serde_json::json!({
                "method": extraction.method,
                "confidence": extraction.confidence,
                "chars": extraction.text.len(),
            })),
        )
    }

    async fn handle_classification(&self, case: &Case) -> StageOutcome {
        let Some(fresh) = self.db.get_case(case.id).ok().flatten() else {
            return StageOutcome::Failed("case not found".into(), FailurePolicy::Halt);
        };
        if fresh.extracted_text.trim().is_empty() {
            return StageOutcome::Failed(
                "no extracted text to classify".into(),
                FailurePolicy::Halt,
            );
        }

        let req = ClassifyRequest {
            text: fresh.extracted_text.clone(),
            title: fresh.title.clone(),
            jurisdiction: fresh.jurisdiction.clone(),
        };
        match self.with_timeout(self.classifier.classify(&req)).await {
            Ok(intake) => {
                if let Err(e) = self.db.set_intake(case.id, &intake) {
                    return StageOutcome::Failed(e.to_string(), FailurePolicy::Halt);
                }
                let _ = self.tracker.update_stage(
                    case.id,
                    StageName::AiClassification,
                    StageStatus::InProgress,
                    None,
                    Some(serde_json::json!({
                        "urgency": intake.urgency.as_str(),
                        "confidence": intake.confidence,
                        "subject_matter": intake.subject_matter,
                    })),
                );
                StageOutcome::Completed
            }
            Err(e) => StageOutcome::Failed(oracle_error_text(&e), FailurePolicy::Halt),
        }
    }

    async fn handle_news_check(&self, case: &Case) -> StageOutcome {
        let Some(fresh) = self.db.get_case(case.id).ok().flatten() else {
            return StageOutcome::Failed("case not found".into(), FailurePolicy::Continue);
        };
        let Some(intake) = fresh.intake.clone() else {
            return StageOutcome::Failed("no intake result".into(), FailurePolicy::Continue);
        };

        match self
            .with_timeout(self.news.assess(&intake, &fresh.jurisdiction))
            .await
        {
            Ok(news) => {
                if let Err(e) = self.db.set_news(case.id, &news) {
                    return StageOutcome::Failed(e.to_string(), FailurePolicy::Continue);
                }
                let escalated = match self.escalation.apply_news_rules(&fresh, &news) {
                    Ok(raised) => raised,
                    Err(e) => {
                        warn!("case #{}: escalation rules failed: {e}", case.id);
                        None
                    }
                };
                let _ = self.tracker.update_stage(
                    case.id,
                    StageName::NewsCheck,
                    StageStatus::InProgress,
                    None,
                    Some(serde_json::json!({
                        "score": news.score,
                        "sources": news.sources.len(),
                        "escalated_to": escalated.map(|u| u.as_str()),
                    })),
                );
                StageOutcome::Completed
            }
            // The case proceeds without news signals; it simply earns no
            // news bonuses and no escalation.
            Err(e) => StageOutcome::Failed(oracle_error_text(&e), FailurePolicy::Continue),
        }
    }

    async fn handle_assignment(&self, case: &Case) -> Result<StageOutcome> {
        let Some(fresh) = self.db.get_case(case.id)? else {
            bail!("case #{} vanished before assignment", case.id);
        };
        match self.engine.assign(&fresh)? {
            AssignmentDecision::Assigned(outcome) => {
                let _ = self.tracker.update_stage(
                    case.id,
                    StageName::Assignment,
                    StageStatus::InProgress,
                    None,
                    Some(serde_json::json!({
                        "assignment_id": outcome.assignment_id,
                        "judge_id": outcome.judge_id,
                        "lawyer_id": outcome.lawyer_id,
                    })),
                );
                Ok(StageOutcome::Completed)
            }
            AssignmentDecision::NoViableCandidates(report) => {
                self.escalation.no_viable_candidates(&fresh, &report)?;
                Ok(StageOutcome::Failed(report.detail, FailurePolicy::Halt))
            }
        }
    }

    async fn handle_notification(&self, case: &Case) -> StageOutcome {
        let Some(fresh) = self.db.get_case(case.id).ok().flatten() else {
            return StageOutcome::Failed("case not found".into(), FailurePolicy::Continue);
        };
        let notices = match self.build_notices(&fresh) {
            Ok(n) => n,
            Err(e) => return StageOutcome::Failed(e.to_string(), FailurePolicy::Continue),
        };

        let mut failures = Vec::new();
        for notice in &notices {
            if let Err(e) = self.notifier.notify_assignment(notice).await {
                warn!(
                    "case #{}: notify {} failed: {e}",
                    case.id, notice.recipient_email
                );
                failures.push(notice.recipient_email.clone());
            }
        }

        let _ = self.tracker.update_stage(
            case.id,
            StageName::Notification,
            StageStatus::InProgress,
            None,
            Some(serde_json::json!({
                "recipients": notices.len(),
                "failures": failures,
            })),
        );

        if failures.len() == notices.len() && !notices.is_empty() {
            StageOutcome::Failed(
                format!("all {} notifications failed", notices.len()),
                FailurePolicy::Continue,
            )
        } else {
            StageOutcome::Completed
        }
    }

    /// One notice per recipient: the client, the judge, and the lawyer.
    fn build_notices(&self, case: &Case) -> Result<Vec<AssignmentNotice>> {
        let Some(assignment) = self.db.current_assignment(case.id)? else {
            bail!("case #{} has no current assignment to notify", case.id);
        };
        let urgency = case
            .final_urgency
            .or_else(|| case.intake.as_ref().map(|i| i.urgency))
            .unwrap_or(Urgency::Moderate);

        let mut notices = Vec::new();
        let make = |email: String, name: String| AssignmentNotice {
            recipient_email: email,
            recipient_name: name,
            case_number: case.case_number.clone(),
            title: case.title.clone(),
            urgency,
            submitted_at: case.created_at,
            jurisdiction: case.jurisdiction.clone(),
        };

        if !case.client_email.is_empty() {
            notices.push(make(case.client_email.clone(), "Client".into()));
        }
        if let Some(judge) = self.db.get_candidate(assignment.judge_id)? {
            notices.push(make(judge.email, judge.name));
        }
        if let Some(lawyer) = self.db.get_candidate(assignment.lawyer_id)? {
            notices.push(make(lawyer.email, lawyer.name));
        }
        Ok(notices)
    }

    // ── Operator surface ──────────────────────────────────────────────────

    /// Re-run the full stage sequence for a case from the top. Existing
    /// stage records are reset cycle by cycle as the driver reaches them.
    pub async fn reprocess(&self, case_id: i64) -> Result<()> {
        let Some(case) = self.db.get_case(case_id)? else {
            bail!("reprocess: case #{case_id} not found");
        };
        {
            let mut guard = self.in_flight.lock().await;
            if guard.contains(&case_id) {
                bail!("reprocess: case #{case_id} is already being processed");
            }
            guard.insert(case_id);
        }

        // Release any live assignment first so the re-run's assignment
        // stage starts from a clean ledger, then reset every stage so
        // run_stage does not skip completed records.
        let reset: Result<()> = async {
            self.engine.release_current(case_id, "superseded by reprocess")?;
            for rec in self.db.list_stages(case_id)? {
                self.tracker.add_stage(case_id, rec.stage, StageStatus::Pending)?;
            }
            self.db.update_case_status(case_id, CaseStatus::Processing)?;
            self.db.append_audit(
                Some(case_id),
                "reprocess",
                "operator requested full reprocessing",
                serde_json::json!({}),
            );
            Ok(())
        }
        .await;
        if let Err(e) = reset {
            self.in_flight.lock().await.remove(&case_id);
            return Err(e);
        }

        let result = self.process_case(case).await;
        self.in_flight.lock().await.remove(&case_id);
        result
    }

    /// Re-run only the news check (and its escalation rules) for a case
    /// that already has an intake result.
    pub async fn refresh_news(&self, case_id: i64) -> Result<()> {
        let Some(case) = self.db.get_case(case_id)? else {
            bail!("refresh_news: case #{case_id} not found");
        };
        if case.intake.is_none() {
            bail!("refresh_news: case #{case_id} has not been classified yet");
        }

        self.tracker.add_stage(case_id, StageName::NewsCheck, StageStatus::Pending)?;
        self.db.append_audit(
            Some(case_id),
            "refresh_news",
            "operator requested news refresh",
            serde_json::json!({}),
        );
        self.run_stage(case_id, StageName::NewsCheck).await?;
        Ok(())
    }

    /// Supersede the case's current assignment and run a fresh one,
    /// escalating when no viable pair remains.
    pub async fn reassign(&self, case_id: i64, reason: &str) -> Result<()> {
        match self.engine.reassign(case_id, reason)? {
            AssignmentDecision::Assigned(outcome) => {
                info!(
                    "case #{case_id} reassigned: judge #{}, lawyer #{}",
                    outcome.judge_id, outcome.lawyer_id
                );
                self.tracker.add_stage(case_id, StageName::Notification, StageStatus::Pending)?;
                self.run_stage(case_id, StageName::Notification).await?;
                Ok(())
            }
            AssignmentDecision::NoViableCandidates(report) => {
                let case = self
                    .db
                    .get_case(case_id)?
                    .context("reassign: case disappeared")?;
                self.escalation.no_viable_candidates(&case, &report)?;
                Ok(())
            }
        }
    }

    // ── Oracle plumbing ───────────────────────────────────────────────────

    /// Bound every oracle round trip so a hung oracle cannot pin a case's
    /// pipeline slot forever.
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, OracleError>>,
    ) -> Result<T, OracleError> {
        let timeout = Duration::from_secs(self.config.oracle_timeout_s);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Unavailable(format!(
                "oracle timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

fn oracle_error_text(e: &OracleError) -> String {
    format!("{} ({})", e, e.kind())
}

// ── Case submission ──────────────────────────────────────────────────────

/// Record a newly submitted case and its upload stage. The pipeline picks
/// it up on the next tick.
pub fn submit_case(db: &Db, case: &Case) -> Result<i64> {
    if db.get_case_by_number(&case.case_number)?.is_some() {
        bail!("case number {:?} already exists", case.case_number);
    }
    let id = db.insert_case(case).context("submit_case")?;
    db.upsert_stage(id, StageName::Upload, StageStatus::Pending)?;
    db.append_audit(
        Some(id),
        "case_submitted",
        &format!("case {} submitted", case.case_number),
        serde_json::json!({ "case_number": case.case_number }),
    );
    info!("case #{id} ({}) submitted", case.case_number);
    Ok(id)
}

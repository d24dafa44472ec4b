use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::warn;

use crate::db::Db;
use crate::types::{StageName, StageStatus};

/// Per-stage state machine over a case's processing-stage records.
///
/// States: pending → in_progress → {completed, failed}. There is no
/// transition out of a terminal state for the same cycle; a retry resets
/// the record through `add_stage` instead. Every accepted update is
/// persisted immediately.
pub struct StageTracker {
    db: Arc<Db>,
}

impl StageTracker {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Append a stage record for the case (or reset the existing record for
    /// this stage name, starting a new cycle). Fails only when the case
    /// does not exist.
    pub fn add_stage(&self, case_id: i64, stage: StageName, initial: StageStatus) -> Result<()> {
        if self.db.get_case(case_id)?.is_none() {
            bail!("add_stage: case #{case_id} not found");
        }
        self.db.upsert_stage(case_id, stage, initial)
    }

    /// Move a stage to `status`, recording timestamps and merging metadata.
    ///
    /// A missing record, or a transition out of a terminal state, is a
    /// logged-warning no-op. Repeating the current status only merges
    /// metadata, so terminal updates are idempotent.
    pub fn update_stage(
        &self,
        case_id: i64,
        stage: StageName,
        status: StageStatus,
        error: Option<&str>,
        metadata_patch: Option<serde_json::Value>,
    ) -> Result<()> {
        let Some(mut record) = self.db.get_stage(case_id, stage)? else {
            warn!(
                "update_stage: no {} record on case #{case_id}, ignoring update to {}",
                stage.as_str(),
                status.as_str()
            );
            return Ok(());
        };

        if record.status.is_terminal() && status != record.status {
            warn!(
                "update_stage: {} on case #{case_id} is already {}, ignoring transition to {}",
                stage.as_str(),
                record.status.as_str(),
                status.as_str()
            );
            return Ok(());
        }

        if !valid_transition(record.status, status) {
            warn!(
                "update_stage: invalid transition {} -> {} for {} on case #{case_id}, ignoring",
                record.status.as_str(),
                status.as_str(),
                stage.as_str()
            );
            return Ok(());
        }

        if status == StageStatus::InProgress && record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        if status.is_terminal() && record.completed_at.is_none() {
            record.completed_at = Some(Utc::now());
        }
        if let Some(e) = error {
            record.error = e.to_string();
        }
        if let Some(patch) = metadata_patch {
            merge_metadata(&mut record.metadata, patch);
        }
        record.status = status;

        self.db.save_stage(&record)
    }
}

/// pending → in_progress → {completed, failed}; same-status repeats are
/// accepted (metadata merge only).
fn valid_transition(from: StageStatus, to: StageStatus) -> bool {
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (StageStatus::Pending, StageStatus::InProgress)
            | (StageStatus::InProgress, StageStatus::Completed)
            | (StageStatus::InProgress, StageStatus::Failed)
    )
}

/// Shallow merge: keys in `patch` overwrite keys in `base`. Non-object
/// patches replace the whole value.
fn merge_metadata(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base.as_object_mut(), patch) {
        (Some(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k, v);
            }
        }
        (_, patch) => *base = patch,
    }
}

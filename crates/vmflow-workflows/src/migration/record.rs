// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The persisted migration record and its compare-and-swap store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use vmflow_clients::AgentProcess;
use vmflow_core::TaskError;

use crate::services::Services;

/// Number of `record_history` entries kept.
pub const RECORD_HISTORY_LIMIT: usize = 50;

// ============================================================================
// Enums
// ============================================================================

/// Phase of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    /// Target reserved and provisioned
    Begin,
    /// Filesystem data copied
    Sync,
    /// Sync interrupted
    Pause,
    /// Target promoted
    Switch,
    /// Target discarded
    Abort,
    /// Source promoted back
    Rollback,
}

impl MigrationPhase {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Begin => "begin",
            MigrationPhase::Sync => "sync",
            MigrationPhase::Pause => "pause",
            MigrationPhase::Switch => "switch",
            MigrationPhase::Abort => "abort",
            MigrationPhase::Rollback => "rollback",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    /// An action is in progress
    Running,
    /// Waiting for the next action
    Paused,
    /// Switch or rollback completed
    Successful,
    /// The last action failed
    Failed,
    /// Aborted
    Aborted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Running => "running",
            MigrationState::Paused => "paused",
            MigrationState::Successful => "successful",
            MigrationState::Failed => "failed",
            MigrationState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A requested migration action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationAction {
    /// Reserve and provision the target
    Begin,
    /// Copy data to the target
    Sync,
    /// Interrupt a running sync
    Pause,
    /// Promote the target
    Switch,
    /// Discard the target
    Abort,
    /// Undo a switch
    Rollback,
    /// Begin, sync and switch in one job
    Full,
    /// Begin followed by one sync
    Start,
}

impl MigrationAction {
    /// Every action, in catalog order.
    pub const ALL: [MigrationAction; 8] = [
        MigrationAction::Begin,
        MigrationAction::Sync,
        MigrationAction::Pause,
        MigrationAction::Switch,
        MigrationAction::Abort,
        MigrationAction::Rollback,
        MigrationAction::Full,
        MigrationAction::Start,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationAction::Begin => "begin",
            MigrationAction::Sync => "sync",
            MigrationAction::Pause => "pause",
            MigrationAction::Switch => "switch",
            MigrationAction::Abort => "abort",
            MigrationAction::Rollback => "rollback",
            MigrationAction::Full => "full",
            MigrationAction::Start => "start",
        }
    }

    /// Whether the action creates a new migration.
    pub fn creates_record(&self) -> bool {
        matches!(
            self,
            MigrationAction::Begin | MigrationAction::Full | MigrationAction::Start
        )
    }

    /// Name of the workflow running this action.
    pub fn workflow_name(&self) -> String {
        format!("migrate-{}", self.as_str())
    }
}

impl fmt::Display for MigrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationAction {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(MigrationAction::Begin),
            "sync" => Ok(MigrationAction::Sync),
            "pause" => Ok(MigrationAction::Pause),
            "switch" => Ok(MigrationAction::Switch),
            "abort" => Ok(MigrationAction::Abort),
            "rollback" => Ok(MigrationAction::Rollback),
            "full" => Ok(MigrationAction::Full),
            "start" => Ok(MigrationAction::Start),
            other => Err(TaskError::validation(
                "migration_action",
                format!("unknown migration action '{}'", other),
            )),
        }
    }
}

/// State of one progress entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    /// In progress
    Running,
    /// Finished
    Success,
    /// Failed
    Failed,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressState::Running => "running",
            ProgressState::Success => "success",
            ProgressState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Record
// ============================================================================

fn progress_type() -> String {
    "progress".to_string()
}

/// One action's entry in `progress_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Entry type
    #[serde(rename = "type", default = "progress_type")]
    pub kind: String,
    /// Phase the entry tracks
    pub phase: MigrationPhase,
    /// Entry state
    pub state: ProgressState,
    /// Latest message
    #[serde(default)]
    pub message: String,
    /// When the action started
    pub started_timestamp: DateTime<Utc>,
    /// When the action finished
    #[serde(default)]
    pub finished_timestamp: Option<DateTime<Utc>>,
    /// Bytes copied so far
    #[serde(default)]
    pub current_progress: u64,
    /// Bytes to copy
    #[serde(default)]
    pub total_progress: u64,
    /// Job running the action
    #[serde(default)]
    pub job_uuid: Option<String>,
    /// Failure reason
    #[serde(default)]
    pub error: Option<String>,
    /// Retrying the action is unsafe
    #[serde(default)]
    pub disallow_retry: bool,
}

/// One entry of the `record_history` debug trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Store time
    pub timestamp: DateTime<Utc>,
    /// Job that stored the record
    #[serde(default)]
    pub job_uuid: Option<String>,
    /// Phase at store time
    pub phase: MigrationPhase,
    /// State at store time
    pub state: MigrationState,
}

/// A target IP reserved during switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedIp {
    /// Network
    pub network_uuid: String,
    /// Address
    pub ip: String,
}

/// Persistent state of one VM migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration id
    pub id: String,
    /// VM being migrated
    pub vm_uuid: String,
    /// Every action requested, in order
    #[serde(rename = "action", default)]
    pub actions: Vec<MigrationAction>,
    /// Current phase
    pub phase: MigrationPhase,
    /// Current state
    pub state: MigrationState,
    /// Server the VM started on
    pub source_server_uuid: String,
    /// Server the VM moves to
    pub target_server_uuid: String,
    /// uuid of the target copy
    pub target_vm_uuid: String,
    /// Sending process on the source server
    #[serde(default)]
    pub source_process: Option<AgentProcess>,
    /// Receiving process on the target server
    #[serde(default)]
    pub target_process: Option<AgentProcess>,
    /// One entry per action run
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
    /// Completed syncs
    #[serde(default)]
    pub num_sync_phases: u32,
    /// IPs reserved on the target's networks
    #[serde(default)]
    pub reserved_network_ips: Vec<ReservedIp>,
    /// Recent stores, oldest first
    #[serde(default)]
    pub record_history: Vec<HistoryEntry>,
    /// Last failure
    #[serde(default)]
    pub error: Option<String>,
    /// The VM was running when the migration began
    #[serde(default)]
    pub vm_was_running: bool,
    /// Actions chain on their own
    #[serde(default)]
    pub automatic: bool,
    /// Creation time
    pub created_timestamp: DateTime<Utc>,
    /// Time the migration reached a final state
    #[serde(default)]
    pub finished_timestamp: Option<DateTime<Utc>>,
    /// Version the record was read at
    #[serde(default)]
    pub version: u64,
}

impl MigrationRecord {
    /// A new record in `running/begin`.
    pub fn new(
        vm_uuid: impl Into<String>,
        source_server_uuid: impl Into<String>,
        target_server_uuid: impl Into<String>,
    ) -> Self {
        let vm_uuid = vm_uuid.into();
        Self {
            id: Uuid::new_v4().to_string(),
            target_vm_uuid: vm_uuid.clone(),
            vm_uuid,
            actions: Vec::new(),
            phase: MigrationPhase::Begin,
            state: MigrationState::Running,
            source_server_uuid: source_server_uuid.into(),
            target_server_uuid: target_server_uuid.into(),
            source_process: None,
            target_process: None,
            progress_history: Vec::new(),
            num_sync_phases: 0,
            reserved_network_ips: Vec::new(),
            record_history: Vec::new(),
            error: None,
            vm_was_running: false,
            automatic: false,
            created_timestamp: Utc::now(),
            finished_timestamp: None,
            version: 0,
        }
    }

    /// Whether a new migration may replace this one.
    pub fn is_finished(&self) -> bool {
        match self.state {
            MigrationState::Aborted => true,
            MigrationState::Successful => self.phase == MigrationPhase::Rollback,
            _ => false,
        }
    }

    /// Append a running progress entry and return its index.
    pub fn start_progress(
        &mut self,
        phase: MigrationPhase,
        job_uuid: impl Into<String>,
        message: impl Into<String>,
    ) -> usize {
        self.progress_history.push(ProgressEntry {
            kind: progress_type(),
            phase,
            state: ProgressState::Running,
            message: message.into(),
            started_timestamp: Utc::now(),
            finished_timestamp: None,
            current_progress: 0,
            total_progress: 0,
            job_uuid: Some(job_uuid.into()),
            error: None,
            disallow_retry: false,
        });
        self.progress_history.len() - 1
    }

    /// Close a progress entry.
    pub fn finish_progress(&mut self, index: usize, state: ProgressState, message: impl Into<String>) {
        if let Some(entry) = self.progress_history.get_mut(index) {
            entry.state = state;
            entry.message = message.into();
            entry.finished_timestamp = Some(Utc::now());
        }
    }

    /// Progress entries of `phase` that are still running.
    pub fn running_entries(&self, phase: MigrationPhase) -> Vec<usize> {
        self.progress_history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.phase == phase && e.state == ProgressState::Running)
            .map(|(i, _)| i)
            .collect()
    }

    /// Append a history entry, keeping the last [`RECORD_HISTORY_LIMIT`].
    pub fn push_history(&mut self, job_uuid: Option<String>) {
        self.record_history.push(HistoryEntry {
            timestamp: Utc::now(),
            job_uuid,
            phase: self.phase,
            state: self.state,
        });
        if self.record_history.len() > RECORD_HISTORY_LIMIT {
            let excess = self.record_history.len() - RECORD_HISTORY_LIMIT;
            self.record_history.drain(..excess);
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Read the record of `vm_uuid`, if there is one.
pub async fn find_record(svc: &Services, vm_uuid: &str) -> Result<Option<MigrationRecord>, TaskError> {
    let raw = match svc.vmapi().get_migration(vm_uuid).await {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_value(raw)
        .map(Some)
        .map_err(|e| TaskError::validation("migration", format!("invalid migration record: {}", e)))
}

/// Read the record of `vm_uuid`; a missing record is a validation error.
pub async fn load_record(svc: &Services, vm_uuid: &str) -> Result<MigrationRecord, TaskError> {
    find_record(svc, vm_uuid).await?.ok_or_else(|| {
        TaskError::validation("migration", format!("no migration found for VM {}", vm_uuid))
    })
}

/// Store `record` if nobody wrote it since it was read.
///
/// On success `record.version` is the stored version. A concurrent write
/// surfaces as a retryable conflict; the retry reads the record again.
pub async fn store_record(
    svc: &Services,
    job_uuid: Option<&str>,
    record: &mut MigrationRecord,
) -> Result<(), TaskError> {
    record.push_history(job_uuid.map(str::to_string));
    let doc = serde_json::to_value(&*record).map_err(|e| {
        TaskError::validation("migration", format!("cannot serialize record: {}", e))
    })?;
    record.version = svc.vmapi().store_migration(&record.vm_uuid, &doc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_parsing() {
        assert_eq!("switch".parse::<MigrationAction>().unwrap(), MigrationAction::Switch);
        assert_eq!(MigrationAction::Full.workflow_name(), "migrate-full");
        assert!(MigrationAction::Start.creates_record());
        assert!(!MigrationAction::Sync.creates_record());

        let err = "teleport".parse::<MigrationAction>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_finished_records() {
        let mut record = MigrationRecord::new("vm-1", "cn-1", "cn-2");
        assert!(!record.is_finished());

        record.state = MigrationState::Aborted;
        assert!(record.is_finished());

        record.state = MigrationState::Successful;
        record.phase = MigrationPhase::Switch;
        assert!(!record.is_finished());

        record.phase = MigrationPhase::Rollback;
        assert!(record.is_finished());
    }

    #[test]
    fn test_progress_entries() {
        let mut record = MigrationRecord::new("vm-1", "cn-1", "cn-2");
        let begin = record.start_progress(MigrationPhase::Begin, "job-1", "begin");
        let sync = record.start_progress(MigrationPhase::Sync, "job-2", "sync");
        record.finish_progress(begin, ProgressState::Success, "done");

        assert_eq!(record.running_entries(MigrationPhase::Sync), vec![sync]);
        assert!(record.running_entries(MigrationPhase::Begin).is_empty());
        assert!(record.progress_history[begin].finished_timestamp.is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut record = MigrationRecord::new("vm-1", "cn-1", "cn-2");
        for _ in 0..(RECORD_HISTORY_LIMIT + 7) {
            record.push_history(Some("job".to_string()));
        }
        assert_eq!(record.record_history.len(), RECORD_HISTORY_LIMIT);
    }

    #[test]
    fn test_wire_format() {
        let mut record = MigrationRecord::new("vm-1", "cn-1", "cn-2");
        record.actions.push(MigrationAction::Begin);
        record.start_progress(MigrationPhase::Begin, "job-1", "reserving");

        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["action"], json!(["begin"]));
        assert_eq!(doc["phase"], json!("begin"));
        assert_eq!(doc["state"], json!("running"));
        assert_eq!(doc["progress_history"][0]["type"], json!("progress"));
        assert_eq!(doc["progress_history"][0]["state"], json!("running"));

        let back: MigrationRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, record);
    }
}

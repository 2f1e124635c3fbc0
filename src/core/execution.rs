use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::parameters::JobParameters;

/// State of a job or step execution.
///
/// A run moves `Idle → Validating → Running → {Completed | Failed | Stopped}`.
/// Steps skip `Validating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Created, not started yet.
    Idle,
    /// Run parameters are being validated.
    Validating,
    /// Steps are executing.
    Running,
    /// Every step ran to the end of its source.
    Completed,
    /// The run ended on an unrecoverable error.
    Failed,
    /// The run ended at a chunk boundary after a stop request.
    Stopped,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Stopped
        )
    }

    /// A run in this state may be restarted from its checkpoints.
    ///
    /// Non-terminal states are restartable: they are only observed in a repository
    /// when the process died mid-run.
    pub fn is_restartable(&self) -> bool {
        !matches!(self, BatchStatus::Completed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BatchStatus::Idle => "IDLE",
            BatchStatus::Validating => "VALIDATING",
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        };
        write!(f, "{}", label)
    }
}

/// Stage of the pipeline where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    Validation,
    Source,
    Transform,
    Sink,
    Tasklet,
    Repository,
}

/// Why a run failed and where it can be resumed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub stage: FailureStage,
    /// Name of the failing step, `None` for validation failures.
    pub step: Option<String>,
    /// Ordering key of the record being processed, when one is known.
    pub key: Option<Value>,
    /// Last durably committed ordering key.
    pub last_checkpoint: Option<Value>,
    pub message: String,
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failure", self.stage)?;
        if let Some(step) = &self.step {
            write!(f, " in step {}", step)?;
        }
        if let Some(key) = &self.key {
            write!(f, " at key {}", key)?;
        }
        match &self.last_checkpoint {
            Some(checkpoint) => write!(f, " (last checkpoint: {})", checkpoint)?,
            None => write!(f, " (no checkpoint)")?,
        }
        write!(f, ": {}", self.message)
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(FailureDetail),
    Stopped,
}

impl RunOutcome {
    /// Process exit status: 0 completed, 1 failed, 2 stopped.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed(_) => 1,
            RunOutcome::Stopped => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "COMPLETED"),
            RunOutcome::Failed(detail) => write!(f, "FAILED ({})", detail),
            RunOutcome::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Last durably committed position of a chunk step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Ordering key of the last source record covered by a committed chunk.
    pub last_key: Option<Value>,
    /// Number of target records committed.
    pub committed_items: usize,
    /// Number of chunks committed.
    pub committed_chunks: usize,
}

/// Execution record of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Number of source records read
    pub read_count: usize,
    /// Number of target records committed
    pub write_count: usize,
    /// Number of records the transformer deliberately skipped
    pub filter_count: usize,
    /// Number of records the transformer failed on
    pub process_error_count: usize,
    /// Number of pages fetched
    pub page_count: usize,
    /// Number of successful sink commits
    pub commit_count: usize,
    /// Number of failed sink commits
    pub rollback_count: usize,
    pub checkpoint: Checkpoint,
    pub failure: Option<FailureDetail>,
}

impl StepExecution {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: BatchStatus::Idle,
            start_time: None,
            end_time: None,
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            process_error_count: 0,
            page_count: 0,
            commit_count: 0,
            rollback_count: 0,
            checkpoint: Checkpoint::default(),
            failure: None,
        }
    }

    /// Creates the execution of a restarted step, resuming from `previous`'s checkpoint.
    pub fn resume_from(previous: &StepExecution) -> Self {
        let mut execution = Self::new(&previous.name);
        execution.checkpoint = previous.checkpoint.clone();
        execution
    }
}

/// Execution record of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_name: String,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub step_executions: Vec<StepExecution>,
    pub failure: Option<FailureDetail>,
}

impl JobExecution {
    pub fn new(job_name: &str, parameters: JobParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            parameters,
            status: BatchStatus::Idle,
            start_time: None,
            end_time: None,
            step_executions: Vec::new(),
            failure: None,
        }
    }

    pub fn step_execution(&self, name: &str) -> Option<&StepExecution> {
        self.step_executions.iter().find(|step| step.name == name)
    }

    /// Inserts or replaces the execution of the step with the same name.
    pub fn upsert_step_execution(&mut self, step_execution: StepExecution) {
        match self
            .step_executions
            .iter_mut()
            .find(|step| step.name == step_execution.name)
        {
            Some(existing) => *existing = step_execution,
            None => self.step_executions.push(step_execution),
        }
    }

    /// Terminal outcome; `None` while the run has not finished.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.status {
            BatchStatus::Completed => Some(RunOutcome::Completed),
            BatchStatus::Stopped => Some(RunOutcome::Stopped),
            BatchStatus::Failed => Some(RunOutcome::Failed(self.failure.clone().unwrap_or(
                FailureDetail {
                    stage: FailureStage::Repository,
                    step: None,
                    key: None,
                    last_checkpoint: None,
                    message: "failure detail was not recorded".to_string(),
                },
            ))),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn exit_codes_reflect_outcome() {
        let failure = FailureDetail {
            stage: FailureStage::Sink,
            step: Some("migrate".to_string()),
            key: Some(json!(7)),
            last_checkpoint: Some(json!(5)),
            message: "disk full".to_string(),
        };

        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::Failed(failure).exit_code(), 1);
        assert_eq!(RunOutcome::Stopped.exit_code(), 2);
    }

    #[test]
    fn failure_detail_reports_checkpoint_and_key() {
        let failure = FailureDetail {
            stage: FailureStage::Transform,
            step: Some("migrate".to_string()),
            key: Some(json!(7)),
            last_checkpoint: Some(json!(5)),
            message: "bad amount".to_string(),
        };

        assert_eq!(
            failure.to_string(),
            "Transform failure in step migrate at key 7 (last checkpoint: 5): bad amount"
        );
    }

    #[test]
    fn only_completed_is_not_restartable() {
        assert!(!BatchStatus::Completed.is_restartable());
        assert!(BatchStatus::Failed.is_restartable());
        assert!(BatchStatus::Stopped.is_restartable());
        assert!(BatchStatus::Running.is_restartable());
    }

    #[test]
    fn outcome_is_none_until_terminal() {
        let mut execution = JobExecution::new("job", JobParameters::new());
        assert_eq!(execution.outcome(), None);

        execution.status = BatchStatus::Completed;
        assert_eq!(execution.outcome(), Some(RunOutcome::Completed));
    }

    #[test]
    fn upsert_replaces_step_with_same_name() {
        let mut execution = JobExecution::new("job", JobParameters::new());
        execution.upsert_step_execution(StepExecution::new("a"));

        let mut updated = StepExecution::new("a");
        updated.read_count = 3;
        execution.upsert_step_execution(updated);
        execution.upsert_step_execution(StepExecution::new("b"));

        assert_eq!(execution.step_executions.len(), 2);
        assert_eq!(execution.step_execution("a").map(|s| s.read_count), Some(3));
    }

    #[test]
    fn resumed_step_keeps_checkpoint_only() {
        let mut previous = StepExecution::new("a");
        previous.read_count = 10;
        previous.checkpoint.last_key = Some(json!(10));
        previous.status = BatchStatus::Failed;

        let resumed = StepExecution::resume_from(&previous);
        assert_eq!(resumed.checkpoint.last_key, Some(json!(10)));
        assert_eq!(resumed.read_count, 0);
        assert_eq!(resumed.status, BatchStatus::Idle);
        assert_ne!(resumed.id, previous.id);
    }
}

//! Persistence of job and step executions.
//!
//! The repository records run identity, timestamps, status and the checkpoint of
//! every step so that a failed or interrupted run can be restarted where its last
//! committed chunk ended.

use std::sync::Mutex;

use uuid::Uuid;

use crate::{
    BatchError,
    core::execution::{JobExecution, StepExecution},
};

#[cfg(feature = "json")]
/// File based repository storing executions as JSON.
pub mod json;

#[cfg(feature = "json")]
pub use json::JsonFileJobRepository;

/// Store of job executions.
pub trait JobRepository {
    /// Inserts the execution, or replaces the stored one with the same id.
    fn save_job_execution(&self, execution: &JobExecution) -> Result<(), BatchError>;

    /// Replaces the step of the given job execution having the same step name.
    ///
    /// Called after every committed chunk; this is what makes a checkpoint durable.
    fn update_step_execution(
        &self,
        job_execution_id: Uuid,
        step_execution: &StepExecution,
    ) -> Result<(), BatchError>;

    /// All executions of a job, oldest first.
    fn job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>, BatchError>;

    /// Most recent execution of the job instance identified by `job_name` and
    /// [`JobParameters::identity`](crate::core::parameters::JobParameters::identity).
    fn last_job_execution(
        &self,
        job_name: &str,
        identity: &str,
    ) -> Result<Option<JobExecution>, BatchError> {
        Ok(self
            .job_executions(job_name)?
            .into_iter()
            .rev()
            .find(|execution| execution.parameters.identity() == identity))
    }

    /// Most recent execution of the job, whatever its parameters.
    fn latest_job_execution(&self, job_name: &str) -> Result<Option<JobExecution>, BatchError> {
        Ok(self.job_executions(job_name)?.pop())
    }
}

pub(crate) fn upsert_job_execution(executions: &mut Vec<JobExecution>, execution: &JobExecution) {
    match executions.iter_mut().find(|stored| stored.id == execution.id) {
        Some(stored) => *stored = execution.clone(),
        None => executions.push(execution.clone()),
    }
}

pub(crate) fn upsert_step_execution(
    executions: &mut [JobExecution],
    job_execution_id: Uuid,
    step_execution: &StepExecution,
) -> Result<(), BatchError> {
    let execution = executions
        .iter_mut()
        .find(|stored| stored.id == job_execution_id)
        .ok_or_else(|| {
            BatchError::Repository(format!("unknown job execution {}", job_execution_id))
        })?;
    execution.upsert_step_execution(step_execution.clone());
    Ok(())
}

/// Repository keeping executions in memory for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryJobRepository {
    executions: Mutex<Vec<JobExecution>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<JobExecution>>, BatchError> {
        self.executions
            .lock()
            .map_err(|error| BatchError::Repository(error.to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn save_job_execution(&self, execution: &JobExecution) -> Result<(), BatchError> {
        upsert_job_execution(&mut *self.lock()?, execution);
        Ok(())
    }

    fn update_step_execution(
        &self,
        job_execution_id: Uuid,
        step_execution: &StepExecution,
    ) -> Result<(), BatchError> {
        upsert_step_execution(&mut *self.lock()?, job_execution_id, step_execution)
    }

    fn job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>, BatchError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|execution| execution.job_name == job_name)
            .cloned()
            .collect())
    }
}

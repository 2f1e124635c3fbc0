use chrono::Utc;
use log::{error, info};

use crate::BatchError;

use super::{
    execution::{BatchStatus, FailureDetail, FailureStage, StepExecution},
    step::{Step, StepContext},
};

/// Tells the tasklet step whether to call the tasklet again.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RepeatStatus {
    /// The tasklet has more work and must be called again.
    Continuable,
    /// The tasklet has finished executing.
    Finished,
}

/// A single unit of work, for steps that do not read and write records.
pub trait Tasklet {
    fn execute(
        &self,
        step_execution: &StepExecution,
        context: &StepContext,
    ) -> Result<RepeatStatus, BatchError>;
}

/// Step calling its tasklet until it reports [`RepeatStatus::Finished`].
///
/// A stop request is honoured between two calls.
pub struct TaskletStep<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
}

impl Step for TaskletStep<'_> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<(), BatchError> {
        step_execution.status = BatchStatus::Running;
        step_execution.start_time = Some(Utc::now());
        step_execution.failure = None;

        info!("Start of step: {}, id: {}", self.name, step_execution.id);

        let result = loop {
            if context.is_stop_requested() {
                step_execution.status = BatchStatus::Stopped;
                break Ok(());
            }

            match self.tasklet.execute(step_execution, context) {
                Ok(RepeatStatus::Finished) => {
                    step_execution.status = BatchStatus::Completed;
                    break Ok(());
                }
                Ok(RepeatStatus::Continuable) => {}
                Err(error) => {
                    error!("Tasklet of step {} failed: {}", self.name, error);
                    step_execution.status = BatchStatus::Failed;
                    step_execution.failure = Some(FailureDetail {
                        stage: FailureStage::Tasklet,
                        step: Some(self.name.clone()),
                        key: None,
                        last_checkpoint: None,
                        message: error.to_string(),
                    });
                    break Err(error);
                }
            }
        };

        step_execution.end_time = Some(Utc::now());
        info!(
            "End of step: {}, id: {}, status: {}",
            self.name, step_execution.id, step_execution.status
        );

        result
    }
}

pub struct TaskletStepBuilder<'a> {
    name: String,
    tasklet: Option<&'a dyn Tasklet>,
}

impl<'a> TaskletStepBuilder<'a> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasklet: None,
        }
    }

    pub fn tasklet(mut self, tasklet: &'a dyn Tasklet) -> Self {
        self.tasklet = Some(tasklet);
        self
    }

    pub fn build(self) -> Result<TaskletStep<'a>, BatchError> {
        let tasklet = self.tasklet.ok_or_else(|| {
            BatchError::Configuration("a tasklet is required for building a step".to_string())
        })?;

        Ok(TaskletStep {
            name: self.name,
            tasklet,
        })
    }
}

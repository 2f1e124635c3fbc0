use std::panic::{self, AssertUnwindSafe};

use log::{info, warn};

use crate::BatchError;

use super::execution::{JobExecution, RunOutcome, StepExecution};

/// Observes the lifecycle of a run.
///
/// Listeners are pure side-effect hooks: an error returned (or a panic raised)
/// by a listener is logged and ignored, it never changes the outcome of a run.
pub trait RunListener {
    fn on_start(&self, _execution: &JobExecution) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_chunk_committed(&self, _step_execution: &StepExecution) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_end(&self, _execution: &JobExecution, _outcome: &RunOutcome) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Calls every listener in registration order, swallowing their failures.
pub(crate) fn notify<F>(listeners: &[&dyn RunListener], hook: &str, call: F)
where
    F: Fn(&dyn RunListener) -> Result<(), BatchError>,
{
    for listener in listeners {
        match panic::catch_unwind(AssertUnwindSafe(|| call(*listener))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("Listener {} failed: {}", hook, error),
            Err(_) => warn!("Listener {} panicked", hook),
        }
    }
}

/// Logs the start and the end of every run.
#[derive(Default)]
pub struct LoggingRunListener;

impl RunListener for LoggingRunListener {
    fn on_start(&self, execution: &JobExecution) -> Result<(), BatchError> {
        info!("{} Job is Running", execution.job_name);
        Ok(())
    }

    fn on_end(&self, execution: &JobExecution, outcome: &RunOutcome) -> Result<(), BatchError> {
        info!(
            "{} Job is Done. (Status : {})",
            execution.job_name, execution.status
        );

        if let RunOutcome::Failed(detail) = outcome {
            info!("Job is Failed: {}", detail);
        }
        Ok(())
    }
}

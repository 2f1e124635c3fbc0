use chrono::Utc;
use log::{error, info, warn};

use crate::{
    BatchError,
    repository::{InMemoryJobRepository, JobRepository},
};

use super::{
    build_name,
    execution::{BatchStatus, FailureDetail, FailureStage, JobExecution, StepExecution},
    listener::{RunListener, notify},
    parameters::{JobParameters, JobParametersIncrementer},
    step::{Step, StepContext, StopSignal},
    validator::ParameterValidator,
};

/// Result of building or running a job.
type JobResult<T> = Result<T, BatchError>;

/// A runnable job.
///
/// A job is an ordered list of steps run with a set of [`JobParameters`]. The
/// job name plus the identifying parameters form a job instance: a job
/// instance runs until one of its executions completes, and can be restarted
/// as many times as needed until then.
pub trait Job {
    /// Name of the job, used to find previous executions in the repository.
    fn get_name(&self) -> &str;

    /// Runs the job instance identified by the job name and `parameters`.
    ///
    /// # Returns
    /// - `Ok(JobExecution)` once the run reached a terminal status, failed runs
    ///   included; [`JobExecution::outcome`] tells how it ended
    /// - `Err(BatchError)` when the run could not be started or recorded, or
    ///   when the job instance already completed
    fn run(&self, parameters: JobParameters) -> JobResult<JobExecution>;
}

/// An ordered list of steps, executed one after the other.
///
/// A run goes through `Idle → Validating → Running` and ends `Completed`,
/// `Failed` or `Stopped`. Every transition is saved in the job repository.
///
/// When the last execution of the same job instance did not complete, the run
/// restarts it: steps completed by the previous execution are skipped and the
/// interrupted step resumes after its checkpoint. An execution left running by
/// a crashed process is marked `Failed` before being restarted.
///
/// # Lifecycle
///
/// A job instance is created through the [`JobBuilder`] and executed by
/// calling [`Job::run`]. The job can be run again with the same parameters
/// after a failure or a stop; once completed, a run with the same parameters
/// is rejected with [`BatchError::JobInstanceAlreadyComplete`], unless an
/// incrementer gives every run new parameters.
pub struct JobInstance<'a> {
    name: String,
    steps: Vec<&'a dyn Step>,
    validator: Option<&'a dyn ParameterValidator>,
    listeners: Vec<&'a dyn RunListener>,
    repository: Option<&'a dyn JobRepository>,
    default_repository: InMemoryJobRepository,
    incrementer: Option<&'a dyn JobParametersIncrementer>,
    stop_signal: StopSignal,
}

impl Job for JobInstance<'_> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn run(&self, parameters: JobParameters) -> JobResult<JobExecution> {
        let repository = self.repository();
        let parameters = self.resolve_parameters(repository, parameters)?;
        let identity = parameters.identity();

        let previous = repository.last_job_execution(&self.name, &identity)?;
        if let Some(previous) = &previous {
            if previous.status == BatchStatus::Completed {
                return Err(BatchError::JobInstanceAlreadyComplete {
                    job: self.name.clone(),
                    parameters: identity,
                });
            }
            if !previous.status.is_terminal() {
                self.abandon(repository, previous)?;
            }
            info!(
                "Restarting job: {} after execution {} ended {}",
                self.name, previous.id, previous.status
            );
        }

        let mut execution = JobExecution::new(&self.name, parameters);
        execution.start_time = Some(Utc::now());
        repository.save_job_execution(&execution)?;

        info!("Start of job: {}, id: {}", self.name, execution.id);
        notify(&self.listeners, "on_start", |listener| listener.on_start(&execution));

        execution.status = BatchStatus::Validating;
        repository.save_job_execution(&execution)?;

        if let Some(validator) = self.validator {
            if let Err(error) = validator.validate(&execution.parameters) {
                error!("Job {} rejected its parameters: {}", self.name, error);
                execution.status = BatchStatus::Failed;
                execution.failure = Some(FailureDetail {
                    stage: FailureStage::Validation,
                    step: None,
                    key: None,
                    last_checkpoint: None,
                    message: error.to_string(),
                });
                return self.finish(repository, execution);
            }
        }

        execution.status = BatchStatus::Running;
        repository.save_job_execution(&execution)?;

        self.run_steps(repository, &mut execution, previous.as_ref())?;

        self.finish(repository, execution)
    }
}

impl JobInstance<'_> {
    /// Handle used to stop the running job at the next chunk boundary.
    ///
    /// The handle can be moved to another thread, or to a listener, and
    /// requested there while `run` is executing.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    fn repository(&self) -> &dyn JobRepository {
        match self.repository {
            Some(repository) => repository,
            None => &self.default_repository,
        }
    }

    fn resolve_parameters(
        &self,
        repository: &dyn JobRepository,
        supplied: JobParameters,
    ) -> JobResult<JobParameters> {
        let Some(incrementer) = self.incrementer else {
            return Ok(supplied);
        };

        match repository.latest_job_execution(&self.name)? {
            Some(latest) if latest.status.is_restartable() => {
                Ok(latest.parameters.merge(&supplied))
            }
            latest => Ok(incrementer
                .get_next(latest.as_ref().map(|execution| &execution.parameters))
                .merge(&supplied)),
        }
    }

    /// Marks an execution left running by a dead process as failed.
    fn abandon(&self, repository: &dyn JobRepository, previous: &JobExecution) -> JobResult<()> {
        warn!(
            "Execution {} of job {} was left {}, marking it as failed",
            previous.id, self.name, previous.status
        );

        let mut abandoned = previous.clone();
        abandoned.status = BatchStatus::Failed;
        abandoned.end_time = Some(Utc::now());
        if abandoned.failure.is_none() {
            abandoned.failure = Some(FailureDetail {
                stage: FailureStage::Repository,
                step: None,
                key: None,
                last_checkpoint: None,
                message: "execution was interrupted".to_string(),
            });
        }
        repository.save_job_execution(&abandoned)
    }

    fn run_steps(
        &self,
        repository: &dyn JobRepository,
        execution: &mut JobExecution,
        previous: Option<&JobExecution>,
    ) -> JobResult<()> {
        let parameters = execution.parameters.clone();

        for step in &self.steps {
            let name = step.get_name();
            let previous_step = previous.and_then(|previous| previous.step_execution(name));

            let mut step_execution = match previous_step {
                Some(done) if done.status == BatchStatus::Completed => {
                    info!("Step {} already completed, skipping", name);
                    execution.upsert_step_execution(done.clone());
                    continue;
                }
                Some(interrupted) => StepExecution::resume_from(interrupted),
                None => StepExecution::new(name),
            };

            execution.upsert_step_execution(step_execution.clone());
            repository.save_job_execution(execution)?;

            let context = StepContext::new(
                execution.id,
                &parameters,
                repository,
                &self.listeners,
                &self.stop_signal,
            );
            let result = step.execute(&mut step_execution, &context);

            let status = step_execution.status;
            let failure = match &result {
                Err(error) => Some(
                    step_execution
                        .failure
                        .clone()
                        .unwrap_or_else(|| unreported_failure(name, error.to_string())),
                ),
                Ok(()) if status == BatchStatus::Completed || status == BatchStatus::Stopped => {
                    None
                }
                Ok(()) => Some(unreported_failure(
                    name,
                    format!("step ended with status {}", status),
                )),
            };

            if let Some(failure) = &failure {
                step_execution.status = BatchStatus::Failed;
                step_execution.failure = Some(failure.clone());
            }
            execution.upsert_step_execution(step_execution);

            if failure.is_some() {
                execution.status = BatchStatus::Failed;
                execution.failure = failure;
                return Ok(());
            }
            if status == BatchStatus::Stopped {
                execution.status = BatchStatus::Stopped;
                return Ok(());
            }
        }

        execution.status = BatchStatus::Completed;
        Ok(())
    }

    fn finish(
        &self,
        repository: &dyn JobRepository,
        mut execution: JobExecution,
    ) -> JobResult<JobExecution> {
        execution.end_time = Some(Utc::now());
        repository.save_job_execution(&execution)?;

        let outcome = execution
            .outcome()
            .ok_or_else(|| BatchError::Step(format!("job ended with status {}", execution.status)))?;

        notify(&self.listeners, "on_end", |listener| {
            listener.on_end(&execution, &outcome)
        });

        info!(
            "End of job: {}, id: {}, outcome: {}",
            self.name, execution.id, outcome
        );
        Ok(execution)
    }
}

fn unreported_failure(step: &str, message: String) -> FailureDetail {
    FailureDetail {
        stage: FailureStage::Tasklet,
        step: Some(step.to_string()),
        key: None,
        last_checkpoint: None,
        message,
    }
}

/// Builder of [`JobInstance`].
///
/// ```
/// use batch_etl_rs::core::{
///     job::{Job, JobBuilder},
///     item::PassThroughTransformer,
///     parameters::JobParameters,
///     step::StepBuilder,
/// };
/// use batch_etl_rs::item::memory::{InMemoryPagedSource, InMemorySink};
///
/// let source = InMemoryPagedSource::new(vec![1u32, 2, 3]);
/// let sink = InMemorySink::new();
/// let step = StepBuilder::new("copy")
///     .chunk::<u32, u32>(2)
///     .source(&source)
///     .transformer(&PassThroughTransformer)
///     .sink(&sink)
///     .build()
///     .unwrap();
///
/// let job = JobBuilder::new().name("copyJob").start(&step).build().unwrap();
/// let execution = job.run(JobParameters::new()).unwrap();
///
/// assert_eq!(execution.outcome().map(|o| o.exit_code()), Some(0));
/// assert_eq!(sink.items(), vec![1, 2, 3]);
/// ```
#[derive(Default)]
pub struct JobBuilder<'a> {
    name: Option<String>,
    steps: Vec<&'a dyn Step>,
    validator: Option<&'a dyn ParameterValidator>,
    listeners: Vec<&'a dyn RunListener>,
    repository: Option<&'a dyn JobRepository>,
    incrementer: Option<&'a dyn JobParametersIncrementer>,
    stop_signal: Option<StopSignal>,
}

impl<'a> JobBuilder<'a> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the job name; a random name is generated when none is given.
    ///
    /// Restarting requires a stable name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the first step of the job.
    pub fn start(mut self, step: &'a dyn Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a step after the previous ones.
    pub fn next(mut self, step: &'a dyn Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the validator checking the parameters before any step runs.
    ///
    /// Combine several with a
    /// [`CompositeParameterValidator`](crate::core::validator::CompositeParameterValidator).
    pub fn validator(mut self, validator: &'a dyn ParameterValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Registers a listener; listeners are notified in registration order.
    pub fn listener(mut self, listener: &'a dyn RunListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Store of executions; an in-memory repository is used when none is set.
    pub fn repository(mut self, repository: &'a dyn JobRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sets how the parameters of the next run are computed.
    ///
    /// With a [`RunIdIncrementer`](crate::core::parameters::RunIdIncrementer),
    /// every run after a completed one gets a new `run.id` and therefore
    /// starts a new job instance.
    pub fn incrementer(mut self, incrementer: &'a dyn JobParametersIncrementer) -> Self {
        self.incrementer = Some(incrementer);
        self
    }

    /// Shares `stop_signal` with the job instead of creating a new one.
    pub fn stop_signal(mut self, stop_signal: StopSignal) -> Self {
        self.stop_signal = Some(stop_signal);
        self
    }

    /// Builds the job.
    ///
    /// # Errors
    /// `BatchError::Configuration` when no step was added.
    pub fn build(self) -> JobResult<JobInstance<'a>> {
        if self.steps.is_empty() {
            return Err(BatchError::Configuration(
                "a job needs at least one step".to_string(),
            ));
        }

        Ok(JobInstance {
            name: self.name.unwrap_or_else(build_name),
            steps: self.steps,
            validator: self.validator,
            listeners: self.listeners,
            repository: self.repository,
            default_repository: InMemoryJobRepository::new(),
            incrementer: self.incrementer,
            stop_signal: self.stop_signal.unwrap_or_default(),
        })
    }
}

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::{BatchError, repository::JobRepository};

use super::{
    build_name,
    chunk::{Chunk, ChunkStatus},
    execution::{BatchStatus, FailureDetail, FailureStage, StepExecution},
    item::{BatchSink, Keyed, PagedSource, RecordTransformer},
    listener::{RunListener, notify},
    parameters::JobParameters,
    tasklet::{Tasklet, TaskletStepBuilder},
};

/// A phase of a job.
///
/// A step leaves its execution in a terminal status: `Completed`, `Stopped`, or
/// `Failed` with [`StepExecution::failure`] filled in. `execute` returns an error
/// exactly when the step failed.
pub trait Step {
    /// Name of the step, unique within its job.
    ///
    /// Restarts match step executions by this name.
    fn get_name(&self) -> &str;

    /// Executes the step.
    ///
    /// # Parameters
    /// - `step_execution`: the execution to update; on restart it carries the
    ///   checkpoint and counters of the interrupted execution
    /// - `context`: job parameters, stop signal and checkpoint persistence
    ///
    /// # Returns
    /// - `Ok(())` when the step completed or was stopped
    /// - `Err(BatchError)` when the step failed
    fn execute(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<(), BatchError>;
}

/// Cooperative cancellation flag shared between a running job and its controller.
///
/// Steps only look at it between chunks, so a stop never interrupts a commit.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    /// Creates a signal with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the running step to stop after its current chunk.
    ///
    /// Every clone of the signal sees the request.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`request_stop`](Self::request_stop) was called.
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// What a step sees of the run executing it.
///
/// Built by the job for every step it executes. Tasklets read job parameters
/// from it; chunk steps persist their checkpoint through it.
pub struct StepContext<'a> {
    job_execution_id: Uuid,
    parameters: &'a JobParameters,
    repository: &'a dyn JobRepository,
    listeners: &'a [&'a dyn RunListener],
    stop_signal: &'a StopSignal,
}

impl<'a> StepContext<'a> {
    /// Creates the context of a step run by the job execution `job_execution_id`.
    pub fn new(
        job_execution_id: Uuid,
        parameters: &'a JobParameters,
        repository: &'a dyn JobRepository,
        listeners: &'a [&'a dyn RunListener],
        stop_signal: &'a StopSignal,
    ) -> Self {
        Self {
            job_execution_id,
            parameters,
            repository,
            listeners,
            stop_signal,
        }
    }

    /// Id of the job execution running the step.
    pub fn job_execution_id(&self) -> Uuid {
        self.job_execution_id
    }

    /// Parameters of the run, after incrementation.
    pub fn parameters(&self) -> &JobParameters {
        self.parameters
    }

    /// Whether the job was asked to stop.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_signal.is_stop_requested()
    }

    /// Persists the step execution, then tells listeners a chunk was committed.
    ///
    /// # Errors
    /// Returns the repository error when the checkpoint could not be saved;
    /// listeners are not notified in that case.
    pub fn chunk_committed(&self, step_execution: &StepExecution) -> Result<(), BatchError> {
        self.repository
            .update_step_execution(self.job_execution_id, step_execution)?;
        notify(self.listeners, "on_chunk_committed", |listener| {
            listener.on_chunk_committed(step_execution)
        });
        Ok(())
    }
}

/// How many times a failed chunk commit is retried, and how long to wait.
///
/// The wait doubles after every attempt. The default policy never retries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use batch_etl_rs::core::step::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100));
///
/// assert_eq!(policy.delay(1), Duration::from_millis(100));
/// assert_eq!(policy.delay(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Commits attempted after the first one failed.
    pub max_retries: usize,
    /// Wait before the first retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Retries a failed commit up to `max_retries` times, waiting `backoff`
    /// before the first retry.
    pub fn new(max_retries: usize, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Delay before retry number `attempt` (starting at 1).
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.backoff.saturating_mul(2u32.pow(exponent))
    }
}

/// Read position of a chunk step: the buffered part of the current page and the
/// key after which the next page starts.
struct PageCursor<I: Keyed> {
    buffer: VecDeque<I>,
    after_key: Option<I::Key>,
    exhausted: bool,
}

impl<I: Keyed> PageCursor<I> {
    fn new(after_key: Option<I::Key>) -> Self {
        Self {
            buffer: VecDeque::new(),
            after_key,
            exhausted: false,
        }
    }

    fn is_drained(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }
}

fn key_to_value<K: serde::Serialize>(key: &K) -> Result<Value, BatchError> {
    serde_json::to_value(key).map_err(|error| BatchError::Checkpoint(error.to_string()))
}

/// Step reading pages, transforming records and committing them chunk by chunk.
///
/// The checkpoint of the step execution always holds the key of the last source
/// record covered by a committed chunk. A restarted step resumes paging after it.
pub struct ChunkOrientedStep<'a, I: Keyed, O> {
    name: String,
    source: &'a dyn PagedSource<I>,
    transformer: &'a dyn RecordTransformer<I, O>,
    sink: &'a dyn BatchSink<O>,
    chunk_size: usize,
    page_size: usize,
    skip_limit: usize,
    retry_policy: RetryPolicy,
}

impl<I: Keyed, O> Step for ChunkOrientedStep<'_, I, O> {
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

        let result = self.run_chunks(step_execution, context);

        if let Err(error) = self.sink.close() {
            warn!("Non-fatal error while closing sink: {}", error);
        }

        step_execution.end_time = Some(Utc::now());

        info!(
            "End of step: {}, id: {}, status: {}",
            self.name, step_execution.id, step_execution.status
        );

        result
    }
}

impl<I: Keyed, O> ChunkOrientedStep<'_, I, O> {
    fn run_chunks(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<(), BatchError> {
        self.sink
            .open()
            .map_err(|error| self.fail(step_execution, FailureStage::Sink, None, error))?;

        let after_key = self.restore_checkpoint(step_execution)?;
        if after_key.is_some() {
            info!(
                "Resuming step {} after key {:?}",
                self.name, step_execution.checkpoint.last_key
            );
        }
        let mut cursor = PageCursor::new(after_key);

        loop {
            if context.is_stop_requested() {
                info!("Stop requested, step {} stopped at a chunk boundary", self.name);
                step_execution.status = BatchStatus::Stopped;
                return Ok(());
            }

            let (chunk, chunk_status) = self.read_chunk(step_execution, &mut cursor)?;

            if chunk.consumed() == 0 {
                step_execution.status = BatchStatus::Completed;
                return Ok(());
            }

            self.commit_chunk(step_execution, &chunk)?;
            self.advance_checkpoint(step_execution, &chunk, context)?;

            if chunk_status == ChunkStatus::Finished {
                step_execution.status = BatchStatus::Completed;
                return Ok(());
            }
        }
    }

    fn restore_checkpoint(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<Option<I::Key>, BatchError> {
        match step_execution.checkpoint.last_key.clone() {
            None => Ok(None),
            Some(value) => serde_json::from_value::<I::Key>(value)
                .map(Some)
                .map_err(|error| {
                    self.fail(
                        step_execution,
                        FailureStage::Repository,
                        None,
                        BatchError::Checkpoint(error.to_string()),
                    )
                }),
        }
    }

    /// Consumes source records until the chunk holds `chunk_size` items or the
    /// source is exhausted.
    fn read_chunk(
        &self,
        step_execution: &mut StepExecution,
        cursor: &mut PageCursor<I>,
    ) -> Result<(Chunk<O>, ChunkStatus), BatchError> {
        debug!("Start reading chunk");
        let mut chunk = Chunk::new(self.chunk_size);

        while !chunk.is_full() {
            let record = match cursor.buffer.pop_front() {
                Some(record) => record,
                None if cursor.exhausted => {
                    debug!("End reading chunk: FINISHED");
                    return Ok((chunk, ChunkStatus::Finished));
                }
                None => {
                    self.fetch_page(step_execution, cursor)?;
                    continue;
                }
            };

            let key = record.key();
            let key_value = key_to_value(&key).map_err(|error| {
                self.fail(step_execution, FailureStage::Repository, None, error)
            })?;

            step_execution.read_count += 1;
            chunk.consume(key_value.clone());

            match self.transformer.transform(&record) {
                Ok(Some(item)) => chunk.add_item(item),
                Ok(None) => {
                    debug!("Record {:?} filtered", key);
                    step_execution.filter_count += 1;
                }
                Err(error) => {
                    warn!("Error transforming record {:?}: {}", key, error);
                    step_execution.process_error_count += 1;

                    if step_execution.process_error_count > self.skip_limit {
                        return Err(self.fail(
                            step_execution,
                            FailureStage::Transform,
                            Some(key_value),
                            error,
                        ));
                    }
                }
            }
        }

        let status = if cursor.is_drained() {
            ChunkStatus::Finished
        } else {
            ChunkStatus::Full
        };
        debug!("End reading chunk: {:?}", status);
        Ok((chunk, status))
    }

    fn fetch_page(
        &self,
        step_execution: &mut StepExecution,
        cursor: &mut PageCursor<I>,
    ) -> Result<(), BatchError> {
        let page = self
            .source
            .next_page(cursor.after_key.as_ref(), self.page_size)
            .map_err(|error| {
                let key = cursor.after_key.as_ref().and_then(|k| key_to_value(k).ok());
                self.fail(step_execution, FailureStage::Source, key, error)
            })?;

        step_execution.page_count += 1;
        debug!(
            "Fetched page {} with {} records after key {:?}",
            step_execution.page_count,
            page.len(),
            cursor.after_key
        );

        let mut previous = cursor.after_key.clone();
        for record in &page {
            let key = record.key();
            if let Some(previous_key) = &previous {
                if key <= *previous_key {
                    let message = format!(
                        "page is not strictly ascending: key {:?} follows {:?}",
                        key, previous_key
                    );
                    return Err(self.fail(
                        step_execution,
                        FailureStage::Source,
                        key_to_value(&key).ok(),
                        BatchError::Source(message),
                    ));
                }
            }
            previous = Some(key);
        }

        if page.len() < self.page_size {
            cursor.exhausted = true;
        }
        cursor.after_key = previous;
        cursor.buffer.extend(page);
        Ok(())
    }

    fn commit_chunk(
        &self,
        step_execution: &mut StepExecution,
        chunk: &Chunk<O>,
    ) -> Result<(), BatchError> {
        if chunk.is_empty() {
            debug!("No items to commit, skipping sink");
            return Ok(());
        }

        debug!("Committing chunk of {} items", chunk.len());
        let mut attempt = 0;
        loop {
            match self.sink.commit(chunk) {
                Ok(()) => {
                    step_execution.commit_count += 1;
                    step_execution.write_count += chunk.len();
                    return Ok(());
                }
                Err(error) => {
                    step_execution.rollback_count += 1;

                    if attempt >= self.retry_policy.max_retries {
                        return Err(self.fail(
                            step_execution,
                            FailureStage::Sink,
                            chunk.last_key().cloned(),
                            error,
                        ));
                    }

                    attempt += 1;
                    let delay = self.retry_policy.delay(attempt);
                    warn!(
                        "Commit failed, chunk rolled back; retry {}/{} in {:?}: {}",
                        attempt, self.retry_policy.max_retries, delay, error
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    fn advance_checkpoint(
        &self,
        step_execution: &mut StepExecution,
        chunk: &Chunk<O>,
        context: &StepContext,
    ) -> Result<(), BatchError> {
        let previous = step_execution.checkpoint.clone();

        step_execution.checkpoint.last_key = chunk.last_key().cloned();
        step_execution.checkpoint.committed_items += chunk.len();
        if !chunk.is_empty() {
            step_execution.checkpoint.committed_chunks += 1;
        }

        if let Err(error) = context.chunk_committed(step_execution) {
            step_execution.checkpoint = previous;
            return Err(self.fail(
                step_execution,
                FailureStage::Repository,
                chunk.last_key().cloned(),
                error,
            ));
        }

        debug!("Checkpoint advanced to {:?}", step_execution.checkpoint.last_key);
        Ok(())
    }

    fn fail(
        &self,
        step_execution: &mut StepExecution,
        stage: FailureStage,
        key: Option<Value>,
        error: BatchError,
    ) -> BatchError {
        error!("Step {} failed during {:?}: {}", self.name, stage, error);

        step_execution.status = BatchStatus::Failed;
        step_execution.failure = Some(FailureDetail {
            stage,
            step: Some(self.name.clone()),
            key,
            last_checkpoint: step_execution.checkpoint.last_key.clone(),
            message: error.to_string(),
        });
        error
    }
}

/// Builder of [`ChunkOrientedStep`].
///
/// Usually obtained from [`StepBuilder::chunk`]. A source, a transformer and a
/// sink are required.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use batch_etl_rs::core::{
///     item::PassThroughTransformer,
///     step::{RetryPolicy, StepBuilder},
/// };
/// use batch_etl_rs::item::memory::{InMemoryPagedSource, InMemorySink};
///
/// let source = InMemoryPagedSource::new((1..=100).collect::<Vec<u32>>());
/// let sink = InMemorySink::new();
///
/// let step = StepBuilder::new("copy")
///     .chunk::<u32, u32>(25)
///     .page_size(50)
///     .skip_limit(3)
///     .retry_policy(RetryPolicy::new(2, Duration::from_millis(10)))
///     .source(&source)
///     .transformer(&PassThroughTransformer)
///     .sink(&sink)
///     .build();
///
/// assert!(step.is_ok());
/// ```
pub struct ChunkOrientedStepBuilder<'a, I: Keyed, O> {
    name: String,
    source: Option<&'a dyn PagedSource<I>>,
    transformer: Option<&'a dyn RecordTransformer<I, O>>,
    sink: Option<&'a dyn BatchSink<O>>,
    chunk_size: usize,
    page_size: Option<usize>,
    skip_limit: usize,
    retry_policy: RetryPolicy,
}

impl<'a, I: Keyed, O> ChunkOrientedStepBuilder<'a, I, O> {
    /// Chunk size used when none is given.
    pub const DEFAULT_CHUNK_SIZE: usize = 10;

    /// Creates a builder for a step named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            transformer: None,
            sink: None,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            page_size: None,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Sets the source paged by the step.
    ///
    /// The source must return records strictly ascending by key; the step fails
    /// with a `Source` failure on the first page breaking that order.
    pub fn source(mut self, source: &'a dyn PagedSource<I>) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the transformer applied to every source record.
    pub fn transformer(mut self, transformer: &'a dyn RecordTransformer<I, O>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Sets the sink committing each chunk.
    pub fn sink(mut self, sink: &'a dyn BatchSink<O>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Maximum number of target records committed per transaction.
    ///
    /// Must be at least 1. Filtered records do not count.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Number of records fetched per page; defaults to the chunk size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Number of transform failures tolerated before the step fails.
    pub fn skip_limit(mut self, skip_limit: usize) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    /// Sets how failed chunk commits are retried.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Builds the step.
    ///
    /// # Errors
    /// `BatchError::Configuration` when the source, the transformer or the sink
    /// is missing, or when the chunk or page size is 0.
    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        let source = self
            .source
            .ok_or_else(|| BatchError::Configuration("a paged source is required".to_string()))?;
        let transformer = self.transformer.ok_or_else(|| {
            BatchError::Configuration("a record transformer is required".to_string())
        })?;
        let sink = self
            .sink
            .ok_or_else(|| BatchError::Configuration("a batch sink is required".to_string()))?;

        if self.chunk_size == 0 {
            return Err(BatchError::Configuration(
                "chunk size must be at least 1".to_string(),
            ));
        }

        let page_size = self.page_size.unwrap_or(self.chunk_size);
        if page_size == 0 {
            return Err(BatchError::Configuration(
                "page size must be at least 1".to_string(),
            ));
        }

        Ok(ChunkOrientedStep {
            name: self.name,
            source,
            transformer,
            sink,
            chunk_size: self.chunk_size,
            page_size,
            skip_limit: self.skip_limit,
            retry_policy: self.retry_policy,
        })
    }
}

/// Entry point for building steps.
///
/// ```
/// use batch_etl_rs::core::{
///     item::PassThroughTransformer,
///     step::{Step, StepBuilder},
/// };
/// use batch_etl_rs::item::memory::{InMemoryPagedSource, InMemorySink};
///
/// let source = InMemoryPagedSource::new(vec![1u32, 2, 3]);
/// let sink = InMemorySink::new();
///
/// let step = StepBuilder::new("copy")
///     .chunk::<u32, u32>(2)
///     .source(&source)
///     .transformer(&PassThroughTransformer)
///     .sink(&sink)
///     .build()
///     .unwrap();
///
/// assert_eq!(step.get_name(), "copy");
/// ```
pub struct StepBuilder {
    name: String,
}

impl StepBuilder {
    /// Starts building a step named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Step with a random name.
    pub fn unnamed() -> Self {
        Self { name: build_name() }
    }

    /// Continues as a chunk oriented step committing `chunk_size` records at a time.
    pub fn chunk<'a, I: Keyed, O>(self, chunk_size: usize) -> ChunkOrientedStepBuilder<'a, I, O> {
        ChunkOrientedStepBuilder::new(&self.name).chunk_size(chunk_size)
    }

    /// Continues as a step running `tasklet`.
    pub fn tasklet<'a>(self, tasklet: &'a dyn Tasklet) -> TaskletStepBuilder<'a> {
        TaskletStepBuilder::new(&self.name).tasklet(tasklet)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use serde_json::json;

    use super::*;
    use crate::{
        core::item::{PassThroughTransformer, TransformResult},
        item::memory::{InMemoryPagedSource, InMemorySink},
        repository::InMemoryJobRepository,
    };

    struct Harness {
        parameters: JobParameters,
        repository: InMemoryJobRepository,
        stop_signal: StopSignal,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                parameters: JobParameters::new(),
                repository: InMemoryJobRepository::new(),
                stop_signal: StopSignal::new(),
            }
        }

        fn execute(&self, step: &dyn Step, step_execution: &mut StepExecution) -> Result<(), BatchError> {
            let job_execution =
                crate::core::execution::JobExecution::new("test-job", JobParameters::new());
            self.repository.save_job_execution(&job_execution)?;
            let listeners: Vec<&dyn RunListener> = Vec::new();
            let context = StepContext::new(
                job_execution.id,
                &self.parameters,
                &self.repository,
                &listeners,
                &self.stop_signal,
            );
            step.execute(step_execution, &context)
        }
    }

    struct FailOn {
        keys: Vec<u32>,
    }

    impl RecordTransformer<u32, u32> for FailOn {
        fn transform(&self, item: &u32) -> TransformResult<u32> {
            if self.keys.contains(item) {
                Err(BatchError::Transform(format!("cannot transform {}", item)))
            } else {
                Ok(Some(*item))
            }
        }
    }

    struct KeepEven;

    impl RecordTransformer<u32, u32> for KeepEven {
        fn transform(&self, item: &u32) -> TransformResult<u32> {
            Ok(if item % 2 == 0 { Some(*item) } else { None })
        }
    }

    #[test]
    fn should_commit_in_chunks_and_complete() -> Result<(), BatchError> {
        let source = InMemoryPagedSource::new((1..=12).collect::<Vec<u32>>());
        let sink = InMemorySink::new();
        let step = StepBuilder::new("copy")
            .chunk::<u32, u32>(5)
            .page_size(5)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build()?;

        let mut execution = StepExecution::new("copy");
        Harness::new().execute(&step, &mut execution)?;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(sink.commit_sizes(), vec![5, 5, 2]);
        assert_eq!(execution.checkpoint.last_key, Some(json!(12)));
        assert_eq!(execution.checkpoint.committed_items, 12);
        assert_eq!(execution.checkpoint.committed_chunks, 3);
        assert_eq!(execution.read_count, 12);
        assert_eq!(execution.write_count, 12);
        assert_eq!(execution.page_count, 3);
        Ok(())
    }

    #[test]
    fn transform_errors_within_skip_limit_are_tolerated() -> Result<(), BatchError> {
        let source = InMemoryPagedSource::new((1..=6).collect::<Vec<u32>>());
        let sink = InMemorySink::new();
        let transformer = FailOn { keys: vec![2, 5] };
        let step = StepBuilder::new("skip")
            .chunk::<u32, u32>(3)
            .source(&source)
            .transformer(&transformer)
            .sink(&sink)
            .skip_limit(2)
            .build()?;

        let mut execution = StepExecution::new("skip");
        Harness::new().execute(&step, &mut execution)?;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.process_error_count, 2);
        assert_eq!(sink.items(), vec![1, 3, 4, 6]);
        Ok(())
    }

    #[test]
    fn exceeding_skip_limit_fails_with_record_key() -> Result<(), BatchError> {
        let source = InMemoryPagedSource::new((1..=6).collect::<Vec<u32>>());
        let sink = InMemorySink::new();
        let transformer = FailOn { keys: vec![2, 5] };
        let step = StepBuilder::new("skip")
            .chunk::<u32, u32>(3)
            .source(&source)
            .transformer(&transformer)
            .sink(&sink)
            .skip_limit(1)
            .build()?;

        let mut execution = StepExecution::new("skip");
        let result = Harness::new().execute(&step, &mut execution);

        assert!(matches!(result, Err(BatchError::Transform(_))));
        assert_eq!(execution.status, BatchStatus::Failed);
        let failure = execution.failure.expect("failure detail");
        assert_eq!(failure.stage, FailureStage::Transform);
        assert_eq!(failure.key, Some(json!(5)));
        assert_eq!(failure.last_checkpoint, Some(json!(4)));
        assert_eq!(sink.items(), vec![1, 3, 4]);
        Ok(())
    }

    #[test]
    fn filtered_records_advance_checkpoint_without_commit() -> Result<(), BatchError> {
        let source = InMemoryPagedSource::new(vec![1u32, 3, 5, 7, 8]);
        let sink = InMemorySink::new();
        let step = StepBuilder::new("filter")
            .chunk::<u32, u32>(2)
            .page_size(2)
            .source(&source)
            .transformer(&KeepEven)
            .sink(&sink)
            .build()?;

        let mut execution = StepExecution::new("filter");
        Harness::new().execute(&step, &mut execution)?;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.filter_count, 4);
        assert_eq!(sink.commit_sizes(), vec![1]);
        assert_eq!(execution.checkpoint.last_key, Some(json!(8)));
        Ok(())
    }

    #[test]
    fn sink_failure_is_retried_with_policy() -> Result<(), BatchError> {
        let source = InMemoryPagedSource::new((1..=4).collect::<Vec<u32>>());
        let sink = InMemorySink::new().fail_on_commits(&[1, 2]);
        let step = StepBuilder::new("retry")
            .chunk::<u32, u32>(2)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .retry_policy(RetryPolicy::new(2, Duration::from_millis(1)))
            .build()?;

        let mut execution = StepExecution::new("retry");
        Harness::new().execute(&step, &mut execution)?;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.rollback_count, 2);
        assert_eq!(execution.commit_count, 2);
        assert_eq!(sink.items(), vec![1, 2, 3, 4]);
        Ok(())
    }

    struct UnorderedSource;

    impl PagedSource<u32> for UnorderedSource {
        fn next_page(&self, _after_key: Option<&u32>, _page_size: usize) -> Result<Vec<u32>, BatchError> {
            Ok(vec![3, 1])
        }
    }

    #[test]
    fn unordered_page_fails_the_step() -> Result<(), BatchError> {
        let source = UnorderedSource;
        let sink = InMemorySink::new();
        let step = StepBuilder::new("unordered")
            .chunk::<u32, u32>(5)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build()?;

        let mut execution = StepExecution::new("unordered");
        let result = Harness::new().execute(&step, &mut execution);

        assert!(matches!(result, Err(BatchError::Source(_))));
        assert_eq!(execution.failure.map(|f| f.stage), Some(FailureStage::Source));
        assert!(sink.items().is_empty());
        Ok(())
    }

    struct CountingSource {
        inner: InMemoryPagedSource<u32>,
        calls: Cell<usize>,
        after_keys: RefCell<Vec<Option<u32>>>,
    }

    impl PagedSource<u32> for CountingSource {
        fn next_page(&self, after_key: Option<&u32>, page_size: usize) -> Result<Vec<u32>, BatchError> {
            self.calls.set(self.calls.get() + 1);
            self.after_keys.borrow_mut().push(after_key.copied());
            self.inner.next_page(after_key, page_size)
        }
    }

    #[test]
    fn short_page_terminates_without_another_fetch() -> Result<(), BatchError> {
        let source = CountingSource {
            inner: InMemoryPagedSource::new(vec![1u32, 2, 3]),
            calls: Cell::new(0),
            after_keys: RefCell::new(Vec::new()),
        };
        let sink = InMemorySink::new();
        let step = StepBuilder::new("short")
            .chunk::<u32, u32>(10)
            .page_size(5)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build()?;

        let mut execution = StepExecution::new("short");
        Harness::new().execute(&step, &mut execution)?;

        assert_eq!(source.calls.get(), 1);
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(sink.items(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn resumed_step_pages_after_checkpoint() -> Result<(), BatchError> {
        let source = CountingSource {
            inner: InMemoryPagedSource::new((1..=6).collect::<Vec<u32>>()),
            calls: Cell::new(0),
            after_keys: RefCell::new(Vec::new()),
        };
        let sink = InMemorySink::new();
        let step = StepBuilder::new("resume")
            .chunk::<u32, u32>(3)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build()?;

        let mut execution = StepExecution::new("resume");
        execution.checkpoint.last_key = Some(json!(3));
        Harness::new().execute(&step, &mut execution)?;

        assert_eq!(source.after_keys.borrow()[0], Some(3));
        assert_eq!(sink.items(), vec![4, 5, 6]);
        Ok(())
    }

    #[test]
    fn stop_request_is_honoured_before_first_chunk() -> Result<(), BatchError> {
        let source = InMemoryPagedSource::new((1..=6).collect::<Vec<u32>>());
        let sink = InMemorySink::new();
        let step = StepBuilder::new("stop")
            .chunk::<u32, u32>(3)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build()?;

        let harness = Harness::new();
        harness.stop_signal.request_stop();
        let mut execution = StepExecution::new("stop");
        harness.execute(&step, &mut execution)?;

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert!(sink.items().is_empty());
        Ok(())
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let source = InMemoryPagedSource::new(vec![1u32]);
        let sink = InMemorySink::new();

        let zero_chunk = StepBuilder::new("bad")
            .chunk::<u32, u32>(0)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build();
        assert!(matches!(zero_chunk, Err(BatchError::Configuration(_))));

        let zero_page = StepBuilder::new("bad")
            .chunk::<u32, u32>(1)
            .page_size(0)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .sink(&sink)
            .build();
        assert!(matches!(zero_page, Err(BatchError::Configuration(_))));

        let missing_sink = StepBuilder::new("bad")
            .chunk::<u32, u32>(1)
            .source(&source)
            .transformer(&PassThroughTransformer)
            .build();
        assert!(matches!(missing_sink, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn retry_delay_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
    }
}

#![allow(dead_code)]

mod mocks;

use std::cell::{Cell, RefCell};

use batch_etl_rs::{
    BatchError,
    core::{
        execution::{JobExecution, RunOutcome, StepExecution},
        item::{PageResult, PagedSource},
        listener::RunListener,
    },
    item::memory::InMemoryPagedSource,
};

pub use mocks::*;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Paged source recording every page request.
pub struct RecordingSource {
    inner: InMemoryPagedSource<u32>,
    calls: Cell<usize>,
    after_keys: RefCell<Vec<Option<u32>>>,
}

impl RecordingSource {
    pub fn new(records: Vec<u32>) -> Self {
        Self {
            inner: InMemoryPagedSource::new(records),
            calls: Cell::new(0),
            after_keys: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn after_keys(&self) -> Vec<Option<u32>> {
        self.after_keys.borrow().clone()
    }
}

impl PagedSource<u32> for RecordingSource {
    fn next_page(&self, after_key: Option<&u32>, page_size: usize) -> PageResult<u32> {
        self.calls.set(self.calls.get() + 1);
        self.after_keys.borrow_mut().push(after_key.copied());
        self.inner.next_page(after_key, page_size)
    }
}

/// Listener keeping the name of every notification it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: RefCell<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

impl RunListener for RecordingListener {
    fn on_start(&self, execution: &JobExecution) -> Result<(), BatchError> {
        self.events
            .borrow_mut()
            .push(format!("start:{}", execution.job_name));
        Ok(())
    }

    fn on_chunk_committed(&self, step_execution: &StepExecution) -> Result<(), BatchError> {
        self.events.borrow_mut().push(format!(
            "chunk:{}",
            step_execution
                .checkpoint
                .last_key
                .as_ref()
                .map(|key| key.to_string())
                .unwrap_or_default()
        ));
        Ok(())
    }

    fn on_end(&self, _execution: &JobExecution, outcome: &RunOutcome) -> Result<(), BatchError> {
        self.events.borrow_mut().push(format!("end:{}", outcome));
        Ok(())
    }
}

use std::cell::{Cell, RefCell};

use log::debug;

use crate::{
    BatchError,
    core::{
        chunk::Chunk,
        item::{BatchSink, Keyed, PageResult, PagedSource, SinkResult},
    },
};

/// Paged source over records held in memory.
///
/// Records are sorted by key and deduplicated when the source is built, so
/// every page honours the [`PagedSource`] ordering contract.
///
/// # Examples
///
/// ```
/// use batch_etl_rs::core::item::PagedSource;
/// use batch_etl_rs::item::memory::InMemoryPagedSource;
///
/// let source = InMemoryPagedSource::new(vec![3u32, 1, 2, 3]);
///
/// assert_eq!(source.next_page(None, 2).unwrap(), vec![1, 2]);
/// assert_eq!(source.next_page(Some(&2), 2).unwrap(), vec![3]);
/// assert!(source.next_page(Some(&3), 2).unwrap().is_empty());
/// ```
pub struct InMemoryPagedSource<T: Keyed> {
    records: Vec<T>,
}

impl<T: Keyed> InMemoryPagedSource<T> {
    pub fn new(mut records: Vec<T>) -> Self {
        records.sort_by_key(|record| record.key());
        records.dedup_by(|a, b| a.key() == b.key());
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T: Keyed + Clone> PagedSource<T> for InMemoryPagedSource<T> {
    fn next_page(&self, after_key: Option<&T::Key>, page_size: usize) -> PageResult<T> {
        let start = match after_key {
            Some(after_key) => self
                .records
                .partition_point(|record| record.key() <= *after_key),
            None => 0,
        };

        Ok(self.records[start..]
            .iter()
            .take(page_size)
            .cloned()
            .collect())
    }
}

/// Sink appending committed chunks to a vector.
///
/// A commit either appends the whole chunk or nothing. Commits can be told to
/// fail, by attempt number starting at 1, to exercise rollback and restart.
pub struct InMemorySink<O> {
    items: RefCell<Vec<O>>,
    commit_sizes: RefCell<Vec<usize>>,
    attempts: Cell<usize>,
    failing_attempts: Vec<usize>,
}

impl<O> InMemorySink<O> {
    pub fn new() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
            commit_sizes: RefCell::new(Vec::new()),
            attempts: Cell::new(0),
            failing_attempts: Vec::new(),
        }
    }

    /// Makes the given commit attempts fail; attempts are counted from 1.
    pub fn fail_on_commits(mut self, attempts: &[usize]) -> Self {
        self.failing_attempts = attempts.to_vec();
        self
    }

    /// Size of every successful commit, in order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.commit_sizes.borrow().clone()
    }

    /// Number of commit attempts, failed ones included.
    pub fn commit_attempts(&self) -> usize {
        self.attempts.get()
    }
}

impl<O: Clone> InMemorySink<O> {
    /// Every committed item, in commit order.
    pub fn items(&self) -> Vec<O> {
        self.items.borrow().clone()
    }
}

impl<O> Default for InMemorySink<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Clone> BatchSink<O> for InMemorySink<O> {
    fn commit(&self, chunk: &Chunk<O>) -> SinkResult {
        let attempt = self.attempts.get() + 1;
        self.attempts.set(attempt);

        if self.failing_attempts.contains(&attempt) {
            return Err(BatchError::Sink(format!(
                "commit attempt {} rejected",
                attempt
            )));
        }

        self.items.borrow_mut().extend(chunk.iter().cloned());
        self.commit_sizes.borrow_mut().push(chunk.len());
        debug!("Committed {} items in memory", chunk.len());
        Ok(())
    }
}

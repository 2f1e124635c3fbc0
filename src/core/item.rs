use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};

use crate::BatchError;

use super::chunk::Chunk;

/// Represents the result of fetching one page from a [`PagedSource`].
pub type PageResult<I> = Result<Vec<I>, BatchError>;

/// Represents the result of transforming one record.
///
/// `Ok(None)` means the record is deliberately skipped (filtered), not failed.
pub type TransformResult<O> = Result<Option<O>, BatchError>;

/// Represents the result of committing one chunk.
pub type SinkResult = Result<(), BatchError>;

/// A record carrying a unique, totally ordered key used for paging and checkpoints.
///
/// The key is serialized into the persisted checkpoint, so it must round-trip
/// through `serde_json`.
pub trait Keyed {
    type Key: Ord + Clone + Debug + Serialize + DeserializeOwned;

    fn key(&self) -> Self::Key;
}

macro_rules! impl_keyed_for_self {
    ($($t:ty),*) => {
        $(
            impl Keyed for $t {
                type Key = $t;

                fn key(&self) -> Self::Key {
                    self.clone()
                }
            }
        )*
    };
}

impl_keyed_for_self!(i32, i64, u32, u64, usize, String);

/// A restartable, ordered source of records read one page at a time.
///
/// # Contract
///
/// - records of a page are strictly ascending by [`Keyed::key`] and strictly
///   greater than `after_key`
/// - calling `next_page` twice with the same `after_key` yields the same records
///   as long as the underlying store did not change
/// - an empty page, or a page shorter than `page_size`, means the source is exhausted
///
/// Implementations that page over a store must be configured with a unique sort
/// key; paging without one can skip or duplicate records across page boundaries.
pub trait PagedSource<I: Keyed> {
    /// Fetches up to `page_size` records whose key is greater than `after_key`.
    ///
    /// `after_key == None` starts from the beginning of the source.
    fn next_page(&self, after_key: Option<&I::Key>, page_size: usize) -> PageResult<I>;
}

/// Maps one source record to zero or one target record.
///
/// Implementations must not keep mutable state between invocations, so that a
/// chunk can be replayed after a failure.
pub trait RecordTransformer<I, O> {
    fn transform(&self, item: &I) -> TransformResult<O>;
}

/// Persists chunks of records, one transaction per chunk.
pub trait BatchSink<O> {
    /// Durably persists every item of the chunk, or none of them.
    ///
    /// When an error is returned the sink has rolled back the whole chunk.
    fn commit(&self, chunk: &Chunk<O>) -> SinkResult;

    /// Called once before the first chunk of a step.
    fn open(&self) -> Result<(), BatchError> {
        Ok(())
    }

    /// Called once after the last chunk of a step, whatever the outcome.
    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Transformer returning a clone of every record.
#[derive(Default)]
pub struct PassThroughTransformer;

impl<I: Clone> RecordTransformer<I, I> for PassThroughTransformer {
    fn transform(&self, item: &I) -> TransformResult<I> {
        Ok(Some(item.clone()))
    }
}

/// Chains two transformers: the output of `first` is the input of `second`.
///
/// A record skipped by `first` is never handed to `second`.
pub struct CompositeTransformer<'a, I, M, O> {
    first: &'a dyn RecordTransformer<I, M>,
    second: &'a dyn RecordTransformer<M, O>,
}

impl<'a, I, M, O> CompositeTransformer<'a, I, M, O> {
    pub fn new(
        first: &'a dyn RecordTransformer<I, M>,
        second: &'a dyn RecordTransformer<M, O>,
    ) -> Self {
        Self { first, second }
    }
}

impl<I, M, O> RecordTransformer<I, O> for CompositeTransformer<'_, I, M, O> {
    fn transform(&self, item: &I) -> TransformResult<O> {
        match self.first.transform(item)? {
            Some(intermediate) => self.second.transform(&intermediate),
            None => Ok(None),
        }
    }
}

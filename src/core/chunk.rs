use serde_json::Value;

/// Tells whether the source still has records after the chunk was assembled.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkStatus {
    /// The chunk reached its size; the source may hold more records.
    Full,
    /// The source is exhausted; this is the last chunk of the step.
    Finished,
}

/// A bounded, ordered batch of target records committed as one transaction.
#[derive(Debug)]
pub struct Chunk<O> {
    items: Vec<O>,
    chunk_size: usize,
    consumed: usize,
    last_key: Option<Value>,
}

impl<O> Chunk<O> {
    pub fn new(chunk_size: usize) -> Chunk<O> {
        Chunk {
            items: Vec::with_capacity(chunk_size),
            chunk_size,
            consumed: 0,
            last_key: None,
        }
    }

    /// Records that a source record with `key` was consumed into this chunk,
    /// whether or not it produced an item.
    pub fn consume(&mut self, key: Value) {
        self.consumed += 1;
        self.last_key = Some(key);
    }

    pub fn add_item(&mut self, item: O) {
        self.items.push(item);
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.chunk_size
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Number of source records consumed, including skipped and failed ones.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Ordering key of the last source record consumed, as stored in checkpoints.
    pub fn last_key(&self) -> Option<&Value> {
        self.last_key.as_ref()
    }

    pub fn get_items(&self) -> &[O] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, O> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<O> {
        self.items
    }
}

impl<'a, O> IntoIterator for &'a Chunk<O> {
    type Item = &'a O;
    type IntoIter = std::slice::Iter<'a, O>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

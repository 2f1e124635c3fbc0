use std::fmt::Debug;

use log::info;

use crate::core::{
    chunk::Chunk,
    item::{BatchSink, SinkResult},
};

/// Sink printing every record of a chunk through the `log` facade.
#[derive(Default)]
pub struct LoggerSink;

impl<O: Debug> BatchSink<O> for LoggerSink {
    fn commit(&self, chunk: &Chunk<O>) -> SinkResult {
        chunk.iter().for_each(|item| info!("Record:{:?}", item));
        Ok(())
    }
}

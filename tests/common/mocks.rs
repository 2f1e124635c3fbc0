//! Mocks of the item traits and of std::fs::File.
use mockall::mock;

use std::io::{self, Write};

use batch_etl_rs::{
    BatchError,
    core::{
        chunk::Chunk,
        execution::{JobExecution, RunOutcome, StepExecution},
        item::{BatchSink, SinkResult},
        listener::RunListener,
        parameters::JobParameters,
        validator::ParameterValidator,
    },
    item::csv::CsvDestination,
};

mock! {
    pub File {}
    impl Write for File {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
        fn flush(&mut self) -> io::Result<()>;
    }
    impl CsvDestination for File {
        fn written_len(&mut self) -> io::Result<u64>;
        fn truncate(&mut self, len: u64) -> io::Result<()>;
    }
}

mock! {
    pub Sink {}
    impl BatchSink<u32> for Sink {
        fn commit(&self, chunk: &Chunk<u32>) -> SinkResult;
    }
}

mock! {
    pub Validator {}
    impl ParameterValidator for Validator {
        fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError>;
    }
}

mock! {
    pub Listener {}
    impl RunListener for Listener {
        fn on_start(&self, execution: &JobExecution) -> Result<(), BatchError>;
        fn on_chunk_committed(&self, step_execution: &StepExecution) -> Result<(), BatchError>;
        fn on_end(&self, execution: &JobExecution, outcome: &RunOutcome) -> Result<(), BatchError>;
    }
}

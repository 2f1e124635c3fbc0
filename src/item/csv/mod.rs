/// CSV output for chunk oriented steps.
///
/// [`CsvSink`](csv_sink::CsvSink) serializes each chunk with serde into an
/// in-memory buffer and appends the buffer to its destination with a single
/// write, so a chunk that cannot be serialized leaves the destination untouched.
/// A write that fails halfway is undone through [`CsvDestination`](csv_sink::CsvDestination).
pub mod csv_sink;

pub use csv_sink::{CsvDestination, CsvSink, CsvSinkBuilder};

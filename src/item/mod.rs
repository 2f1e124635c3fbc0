/// In-memory source and sink, for tests and small jobs.
pub mod memory;

#[cfg(feature = "logger")]
/// Sink logging every committed record.
pub mod logger;

#[cfg(feature = "csv")]
/// CSV sink.
pub mod csv;

#[cfg(feature = "rdbc")]
/// Keyset paged source and transactional sink over SQL databases.
pub mod rdbc;

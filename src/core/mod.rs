use rand::distr::{Alphanumeric, SampleString};

/// Chunks of target records committed together.
pub mod chunk;

/// Execution records, statuses, checkpoints and outcomes.
pub mod execution;

/// Traits for reading, transforming and writing records.
pub mod item;

/// Jobs and their builder.
pub mod job;

/// Hooks notified along a run.
pub mod listener;

/// Run parameters and parameter incrementers.
pub mod parameters;

/// Chunk oriented steps.
pub mod step;

/// Steps running a single unit of work.
pub mod tasklet;

/// Validation of run parameters.
pub mod validator;

/// Random eight character name for unnamed jobs and steps.
fn build_name() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}

#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
 # Batch ETL for Rust

 A toolkit for moving records from a source store to a target store in
 bounded, checkpointed chunks. A run can be stopped, can fail halfway, and
 can be restarted: it resumes right after the last chunk that was durably
 committed, without re-reading or re-writing committed records.

 ## Core Concepts

- **Job:** an ordered list of steps, run with a set of `JobParameters`. A job
  name plus its identifying parameters is a job instance; a job instance that
  completed cannot run again.
- **Step:** a phase of a job. A chunk oriented step pages a source, transforms
  each record and commits the results chunk by chunk. A tasklet step runs a
  single unit of work.
- **PagedSource:** reads records one page at a time, strictly ordered by a
  unique key; the key of the last committed record is the step checkpoint.
- **RecordTransformer:** maps one source record to zero or one target record.
- **BatchSink:** commits one chunk atomically.
- **ParameterValidator:** rejects a run before any record is read.
- **RunListener:** observes the start of a run, every committed chunk and the
  outcome of the run.
- **JobRepository:** stores executions and checkpoints so that runs can be
  restarted.

 ## Features

| **Feature**   | **Description**                                                 |
|---------------|-----------------------------------------------------------------|
| rdbc-sqlite   | Enables the keyset paged `PagedSource` and the `BatchSink` for SQLite |
| csv           | Enables the CSV `BatchSink`                                     |
| json          | Enables the JSON file `JobRepository`                           |
| logger        | Enables a `BatchSink` logging every record                      |
| full          | Enables all available features                                  |

 ## Getting Started

```rust
# use batch_etl_rs::{
#     core::{
#         execution::RunOutcome,
#         item::{RecordTransformer, TransformResult},
#         job::{Job, JobBuilder},
#         listener::LoggingRunListener,
#         parameters::JobParameters,
#         step::StepBuilder,
#         validator::SuffixParameterValidator,
#     },
#     item::memory::{InMemoryPagedSource, InMemorySink},
#     BatchError,
# };
struct Cents;

impl RecordTransformer<u32, String> for Cents {
    fn transform(&self, amount: &u32) -> TransformResult<String> {
        Ok(Some(format!("{}.{:02}", amount / 100, amount % 100)))
    }
}

fn main() -> Result<(), BatchError> {
    let source = InMemoryPagedSource::new((100..112).collect::<Vec<u32>>());
    let sink = InMemorySink::new();

    let step = StepBuilder::new("migrate")
        .chunk::<u32, String>(5) // commit every 5 records
        .page_size(5)
        .source(&source)
        .transformer(&Cents)
        .sink(&sink)
        .build()?;

    let validator = SuffixParameterValidator::new("fileName", "csv");
    let listener = LoggingRunListener;

    let job = JobBuilder::new()
        .name("migrationJob")
        .validator(&validator)
        .listener(&listener)
        .start(&step)
        .build()?;

    let parameters = JobParameters::from_args(["fileName=orders.csv"])?;
    let execution = job.run(parameters)?;

    assert_eq!(execution.outcome(), Some(RunOutcome::Completed));
    assert_eq!(sink.commit_sizes(), vec![5, 5, 2]);
    Ok(())
}
```

 ## License
 Licensed under either of

 -   Apache License, Version 2.0
     ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
 -   MIT license
     ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)

 at your option.
 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Sources and sinks (in memory, csv, SQLite)
pub mod item;

/// Stores of job executions and checkpoints
pub mod repository;

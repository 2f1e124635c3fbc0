use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::debug;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::{
    BatchError,
    core::execution::{JobExecution, StepExecution},
};

use super::{JobRepository, upsert_job_execution, upsert_step_execution};

/// Repository persisting every execution in a single JSON document.
///
/// Each write rewrites the whole file through a temporary file renamed over the
/// target, so a crash never leaves a half-written document behind.
///
/// # Examples
///
/// ```
/// use batch_etl_rs::repository::{JobRepository, JsonFileJobRepository};
/// use batch_etl_rs::core::{execution::JobExecution, parameters::JobParameters};
///
/// let dir = tempfile::tempdir().unwrap();
/// let repository = JsonFileJobRepository::new(dir.path().join("executions.json"));
///
/// let execution = JobExecution::new("trMigrationJob", JobParameters::new());
/// repository.save_job_execution(&execution).unwrap();
///
/// assert_eq!(repository.job_executions("trMigrationJob").unwrap().len(), 1);
/// ```
pub struct JsonFileJobRepository {
    path: PathBuf,
}

impl JsonFileJobRepository {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<Vec<JobExecution>, BatchError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(BatchError::Repository(error.to_string())),
        };

        serde_json::from_reader(BufReader::new(file))
            .map_err(|error| BatchError::Repository(error.to_string()))
    }

    fn store(&self, executions: &[JobExecution]) -> Result<(), BatchError> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&directory).map_err(|error| BatchError::Repository(error.to_string()))?;

        let temp_file = NamedTempFile::new_in(&directory)
            .map_err(|error| BatchError::Repository(error.to_string()))?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            serde_json::to_writer_pretty(&mut writer, executions)
                .map_err(|error| BatchError::Repository(error.to_string()))?;
            writer
                .flush()
                .map_err(|error| BatchError::Repository(error.to_string()))?;
        }
        temp_file
            .as_file()
            .sync_all()
            .map_err(|error| BatchError::Repository(error.to_string()))?;
        temp_file
            .persist(&self.path)
            .map_err(|error| BatchError::Repository(error.to_string()))?;

        debug!(
            "Stored {} job executions in {}",
            executions.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl JobRepository for JsonFileJobRepository {
    fn save_job_execution(&self, execution: &JobExecution) -> Result<(), BatchError> {
        let mut executions = self.load()?;
        upsert_job_execution(&mut executions, execution);
        self.store(&executions)
    }

    fn update_step_execution(
        &self,
        job_execution_id: Uuid,
        step_execution: &StepExecution,
    ) -> Result<(), BatchError> {
        let mut executions = self.load()?;
        upsert_step_execution(&mut executions, job_execution_id, step_execution)?;
        self.store(&executions)
    }

    fn job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>, BatchError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|execution| execution.job_name == job_name)
            .collect())
    }
}

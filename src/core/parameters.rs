use std::{collections::BTreeMap, fmt};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{BatchError, error::ValidationError};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A typed run parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum JobParameter {
    String(String),
    Long(i64),
    Double(f64),
    Date(NaiveDate),
}

impl fmt::Display for JobParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobParameter::String(value) => write!(f, "{}", value),
            JobParameter::Long(value) => write!(f, "{}", value),
            JobParameter::Double(value) => write!(f, "{}", value),
            JobParameter::Date(value) => write!(f, "{}", value.format(DATE_FORMAT)),
        }
    }
}

/// Immutable set of parameters supplied when a run is started.
///
/// Once built there is no way to change a `JobParameters`; [`JobParameters::merge`]
/// returns a new instance.
///
/// # Examples
///
/// ```
/// use batch_etl_rs::core::parameters::JobParameters;
///
/// let parameters = JobParameters::from_args(["-fileName=test.csv", "count(long)=3"]).unwrap();
///
/// assert_eq!(parameters.get_string("fileName"), Some("test.csv"));
/// assert_eq!(parameters.get_long("count"), Some(3));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses command-line tokens of the form `key=value` or `key(type)=value`.
    ///
    /// Supported types are `string`, `long`, `double` and `date` (`YYYY-MM-DD`).
    /// Leading dashes on the key are ignored.
    pub fn from_args<I, S>(args: I) -> Result<Self, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parameters = BTreeMap::new();
        for arg in args {
            let (key, value) = parse_token(arg.as_ref())?;
            parameters.insert(key, value);
        }
        Ok(Self { parameters })
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.parameters.get(key) {
            Some(JobParameter::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key) {
            Some(JobParameter::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.parameters.get(key) {
            Some(JobParameter::Double(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<NaiveDate> {
        match self.parameters.get(key) {
            Some(JobParameter::Date(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Returns a new set holding these parameters overlaid with `overrides`.
    pub fn merge(&self, overrides: &JobParameters) -> JobParameters {
        let mut parameters = self.parameters.clone();
        for (key, value) in &overrides.parameters {
            parameters.insert(key.clone(), value.clone());
        }
        JobParameters { parameters }
    }

    /// Canonical representation identifying a job instance together with the job name.
    pub fn identity(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.identity())
    }
}

fn parse_token(token: &str) -> Result<(String, JobParameter), BatchError> {
    let (raw_key, raw_value) = token
        .split_once('=')
        .ok_or_else(|| ValidationError::new(token, "expected key=value"))?;

    let raw_key = raw_key.trim_start_matches('-');

    let (key, kind) = match raw_key.split_once('(') {
        Some((key, rest)) => {
            let kind = rest
                .strip_suffix(')')
                .ok_or_else(|| ValidationError::new(key, "unterminated type declaration"))?;
            (key, kind.to_lowercase())
        }
        None => (raw_key, "string".to_string()),
    };

    if key.is_empty() {
        return Err(ValidationError::new(token, "empty parameter name").into());
    }

    let value = match kind.as_str() {
        "string" => JobParameter::String(raw_value.to_string()),
        "long" => raw_value
            .parse::<i64>()
            .map(JobParameter::Long)
            .map_err(|err| ValidationError::new(key, err.to_string()))?,
        "double" => raw_value
            .parse::<f64>()
            .map(JobParameter::Double)
            .map_err(|err| ValidationError::new(key, err.to_string()))?,
        "date" => NaiveDate::parse_from_str(raw_value, DATE_FORMAT)
            .map(JobParameter::Date)
            .map_err(|err| ValidationError::new(key, err.to_string()))?,
        other => {
            return Err(ValidationError::new(key, format!("unknown type '{}'", other)).into());
        }
    };

    Ok((key.to_string(), value))
}

/// Builder for [`JobParameters`].
#[derive(Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::String(value.to_string()));
        self
    }

    pub fn add_long(mut self, key: &str, value: i64) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Long(value));
        self
    }

    pub fn add_double(mut self, key: &str, value: f64) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Double(value));
        self
    }

    pub fn add_date(mut self, key: &str, value: NaiveDate) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Date(value));
        self
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

/// Computes the parameters of the next job instance from the previous ones.
pub trait JobParametersIncrementer {
    fn get_next(&self, previous: Option<&JobParameters>) -> JobParameters;
}

/// Increments a `run.id` long parameter so the same job can be launched again.
pub struct RunIdIncrementer {
    key: String,
}

impl RunIdIncrementer {
    pub const DEFAULT_KEY: &'static str = "run.id";

    pub fn new() -> Self {
        Self {
            key: Self::DEFAULT_KEY.to_string(),
        }
    }

    pub fn with_key(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl Default for RunIdIncrementer {
    fn default() -> Self {
        Self::new()
    }
}

impl JobParametersIncrementer for RunIdIncrementer {
    fn get_next(&self, previous: Option<&JobParameters>) -> JobParameters {
        let previous = previous.cloned().unwrap_or_default();
        let next_id = previous.get_long(&self.key).unwrap_or(0) + 1;
        let run_id = JobParametersBuilder::new()
            .add_long(&self.key, next_id)
            .build();
        previous.merge(&run_id)
    }
}

use std::collections::BTreeSet;

use crate::{BatchError, error::ValidationError};

use super::parameters::JobParameters;

/// Checks the parameters of a run before anything else happens.
///
/// A validator must be side-effect free: it is called before any source or sink
/// is touched and a rejected run performs no work at all.
pub trait ParameterValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError>;
}

/// Runs several validators in order and returns the first violation.
#[derive(Default)]
pub struct CompositeParameterValidator<'a> {
    validators: Vec<&'a dyn ParameterValidator>,
}

impl<'a> CompositeParameterValidator<'a> {
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    pub fn validator(mut self, validator: &'a dyn ParameterValidator) -> Self {
        self.validators.push(validator);
        self
    }
}

impl ParameterValidator for CompositeParameterValidator<'_> {
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        for validator in &self.validators {
            validator.validate(parameters)?;
        }
        Ok(())
    }
}

/// Checks required keys and, when optional keys are declared, rejects unknown keys.
#[derive(Default)]
pub struct DefaultParametersValidator {
    required_keys: BTreeSet<String>,
    optional_keys: BTreeSet<String>,
}

impl DefaultParametersValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required_key(mut self, key: &str) -> Self {
        self.required_keys.insert(key.to_string());
        self
    }

    pub fn optional_key(mut self, key: &str) -> Self {
        self.optional_keys.insert(key.to_string());
        self
    }
}

impl ParameterValidator for DefaultParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        for key in &self.required_keys {
            if !parameters.contains_key(key) {
                return Err(ValidationError::new(key, "required parameter is missing").into());
            }
        }

        if !self.optional_keys.is_empty() {
            for key in parameters.keys() {
                if !self.required_keys.contains(key) && !self.optional_keys.contains(key) {
                    return Err(ValidationError::new(key, "parameter is not allowed").into());
                }
            }
        }

        Ok(())
    }
}

/// Requires a string parameter ending with a given suffix.
///
/// The comparison ignores case unless [`SuffixParameterValidator::case_sensitive`]
/// is set.
///
/// # Examples
///
/// ```
/// use batch_etl_rs::core::{
///     parameters::JobParameters,
///     validator::{ParameterValidator, SuffixParameterValidator},
/// };
///
/// let validator = SuffixParameterValidator::new("fileName", "csv");
///
/// let accepted = JobParameters::from_args(["fileName=orders.CSV"]).unwrap();
/// assert!(validator.validate(&accepted).is_ok());
///
/// let rejected = JobParameters::from_args(["fileName=orders.json"]).unwrap();
/// assert!(validator.validate(&rejected).is_err());
/// ```
pub struct SuffixParameterValidator {
    key: String,
    suffix: String,
    case_sensitive: bool,
}

impl SuffixParameterValidator {
    pub fn new(key: &str, suffix: &str) -> Self {
        Self {
            key: key.to_string(),
            suffix: suffix.to_string(),
            case_sensitive: false,
        }
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    fn ends_with_suffix(&self, value: &str) -> bool {
        if self.case_sensitive {
            value.ends_with(&self.suffix)
        } else {
            value.to_lowercase().ends_with(&self.suffix.to_lowercase())
        }
    }
}

impl ParameterValidator for SuffixParameterValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        match parameters.get_string(&self.key) {
            None => Err(ValidationError::new(
                &self.key,
                format!("required string parameter ending with '{}'", self.suffix),
            )
            .into()),
            Some(value) if !self.ends_with_suffix(value) => Err(ValidationError::new(
                &self.key,
                format!("'{}' does not end with '{}'", value, self.suffix),
            )
            .into()),
            Some(_) => Ok(()),
        }
    }
}

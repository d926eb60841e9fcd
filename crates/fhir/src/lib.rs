//! FHIR output boundary for the conversion engine.
//!
//! This crate provides the **output object model** and the **output sink**:
//! - [`ResourceHandle`]: one produced resource (type, id, body) with its `(type, id)` identity
//! - [`Bundle`]: the deduplicated collection handed over at the end of a conversion run,
//!   rendered as a FHIR `collection` bundle in JSON or YAML
//!
//! This crate does not validate resources against FHIR profiles. It only guarantees that
//! every entry carries `resourceType` and `id` and can report dangling references.

pub mod bundle;
pub mod resource;

pub use bundle::{Bundle, OutputFormat};
pub use resource::{value_to_json, ResourceHandle, REFERENCE_KEY};

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

use std::path::PathBuf;

/// Load-time errors. Every one of them is fatal: a template set that fails to load is never
/// used for conversion.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to read {path}: {source}", path = path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {template}: schema mismatch at {path}: {message}")]
    Schema {
        template: String,
        path: String,
        message: String,
    },

    #[error("template {template}, field {field}: invalid spec '{spec}': {reason}")]
    InvalidSpec {
        template: String,
        field: String,
        spec: String,
        reason: String,
    },

    #[error("template {template}, field {field}: invalid condition '{condition}': {reason}")]
    InvalidCondition {
        template: String,
        field: String,
        condition: String,
        reason: String,
    },

    #[error("template {template}, field {field}: invalid script '{script}': {reason}")]
    InvalidScript {
        template: String,
        field: String,
        script: String,
        reason: String,
    },

    #[error("template {template}, field {field}: unknown type '{type_tag}'")]
    UnknownType {
        template: String,
        field: String,
        type_tag: String,
    },

    #[error("template {template}: unknown template reference '{target}'")]
    UnknownTemplate { template: String, target: String },

    #[error("template reference cycle: {0}")]
    Cycle(String),

    #[error("message template {message}, resource {resource}: {reason}")]
    InvalidBinding {
        message: String,
        resource: String,
        reason: String,
    },

    #[error("invalid terminology: {0}")]
    Terminology(String),

    #[error("structure definitions: {0}")]
    Structure(#[from] hl7::Hl7Error),
}

/// Malformed spec, condition or script text. The template loader wraps it with the template
/// and field it came from.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SyntaxError(pub String);

impl SyntaxError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Field-level failures. The engine logs these and downgrades the field to absent.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("value '{value}' is not a valid {type_tag}")]
    InvalidValue { type_tag: String, value: String },

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("script '{script}' failed: {reason}")]
    Script { script: String, reason: String },
}

/// A required field produced nothing while its condition held.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("required field '{field}' produced no value")]
pub struct RequiredFieldMissing {
    pub field: String,
}

/// Top-level conversion failures.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("failed to parse message: {0}")]
    Parse(#[from] hl7::Hl7Error),

    #[error("no message template for structure '{0}'")]
    NoTemplate(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type ConversionResult<T> = std::result::Result<T, ConversionError>;

//! # h2f Core
//!
//! Template-driven conversion of HL7 v2 messages into FHIR resources.
//!
//! This crate contains the conversion engine and everything it needs at load time:
//! - YAML template loading and validation ([`template`])
//! - the spec path resolver, conditions and variables ([`spec`], [`condition`], [`binder`])
//! - segment/group extraction through repeating groups ([`extraction`])
//! - the recursive expression evaluator and the two-pass resource composer ([`engine`],
//!   [`composer`])
//! - leaf type resolvers, terminology tables and built-in scripts
//!
//! **No I/O during conversion**: templates, terminology and structure definitions are read
//! once by [`Converter::new`]; the parser lives in `hl7` and the output model in `fhir`.

pub mod binder;
pub mod composer;
pub mod condition;
pub mod config;
pub mod constants;
pub mod context;
pub mod converter;
pub mod engine;
pub mod error;
pub mod expression;
pub mod extraction;
pub mod ids;
pub mod resolvers;
pub mod script;
pub mod spec;
pub mod template;
pub mod terminology;

#[cfg(test)]
mod testing;

pub use config::{resolve_template_dir, ConverterConfig, IdStrategy};
pub use context::{Context, EvaluationResult, SideResource};
pub use converter::Converter;
pub use error::{
    ConfigError, ConfigResult, ConversionError, ConversionResult, ExtractionError,
    RequiredFieldMissing, SyntaxError,
};
pub use expression::{Expression, ExpressionKind, Variable};
pub use extraction::{extract, SegmentGroup};
pub use resolvers::TypeRegistry;
pub use script::{BuiltinScripts, ScriptEvaluator};
pub use template::{MessageTemplate, ResourceTemplate, SegmentBinding, TemplateSet};
pub use terminology::Terminology;

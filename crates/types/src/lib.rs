//! Shared types for the HL7 v2 to FHIR conversion workspace.
//!
//! This crate holds the common currency used by every other crate:
//! - [`Value`] and its scalar/source-location variants
//! - [`NonEmptyText`] for validated template and resource names

pub mod text;
pub mod value;

pub use text::{NonEmptyText, TextError};
pub use value::{FieldValue, Granularity, Scalar, StructureHandle, Value};

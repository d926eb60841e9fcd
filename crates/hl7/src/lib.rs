//! HL7 v2 wire/boundary support.
//!
//! This crate turns pipe-delimited message text into the addressable, read-only structure tree
//! that the conversion engine in `h2f-core` walks:
//! - [`parser`] splits text into segments and decodes delimiters/escapes
//! - [`structure`] arranges segments into (repeating) groups using YAML structure definitions
//! - [`message`] exposes the resulting tree through [`StructureHandle`]s
//!
//! The crate does not validate data types against the HL7 standard. Structuring is lenient:
//! a message that does not match its structure definition still parses, with unexpected
//! segments kept where they appeared.

pub mod message;
pub mod parser;
pub mod structure;

pub use h2f_types::StructureHandle;
pub use message::{Field, Message};
pub use parser::Delimiters;
pub use structure::{Element, StructureDefinition, StructureRegistry};

/// Errors returned by the `hl7` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum Hl7Error {
    #[error("message is empty")]
    Empty,

    #[error("message must start with an MSH segment, found '{0}'")]
    MissingHeader(String),

    #[error("MSH segment does not declare encoding characters")]
    InvalidEncoding,

    #[error("invalid segment name '{name}' on line {line}")]
    InvalidSegmentName { name: String, line: usize },

    #[error("structure definition error: {0}")]
    Structure(String),
}

/// Type alias for Results that can fail with an [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;

/// Structure name declared by a header: `MSH-9.3` when present, otherwise
/// `<MSH-9.1>_<MSH-9.2>`.
fn declared_structure(segments: &[parser::RawSegment]) -> String {
    let Some(msh9) = segments
        .first()
        .and_then(|msh| msh.fields.get(8))
        .and_then(|reps| reps.first())
    else {
        return String::new();
    };
    let component = |i: usize| {
        msh9.component_at(i)
            .map(|c| c.text())
            .filter(|t| !t.is_empty())
    };
    match (component(3), component(1), component(2)) {
        (Some(structure), _, _) => structure,
        (None, Some(kind), Some(trigger)) => format!("{kind}_{trigger}"),
        (None, Some(kind), None) => kind,
        _ => String::new(),
    }
}

/// Parses message text and arranges it by its declared structure.
///
/// Messages whose structure is not in `registry` are returned flat: every segment is a direct
/// child of the root, so group-scoped templates find nothing (a source-variant mismatch, not
/// an error).
///
/// # Errors
///
/// Returns [`Hl7Error`] when the text is empty, does not start with `MSH`, declares no
/// encoding characters, or contains a malformed segment name.
pub fn parse(text: &str, registry: &StructureRegistry) -> Hl7Result<Message> {
    let (_, segments) = parser::split_segments(text)?;
    let declared = declared_structure(&segments);

    match registry.get(&declared) {
        Some(definition) => Ok(definition.build(segments)),
        None => {
            let flat = StructureDefinition::flat(registry.canonical_name(&declared));
            Ok(flat.build(segments))
        }
    }
}

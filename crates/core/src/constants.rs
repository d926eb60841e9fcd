//! Constants used throughout the conversion engine.
//!
//! Binding names the engine injects into evaluation contexts and the file layout of a
//! template directory live here so that templates, loader and engine agree on them.

/// Binding holding the correlation id of the occurrence being composed.
pub const GROUP_ID: &str = "GROUP_ID";

/// Binding holding the group instance that encloses the primary segment of the occurrence.
pub const GROUP_SCOPE: &str = "GROUP_SCOPE";

/// Type tag used when a field declares none: the value passes through unchanged.
pub const DEFAULT_TYPE: &str = "Object";

/// Field whose scalar value becomes the resource id.
pub const ID_FIELD: &str = "id";

/// Default template directory, relative to the working directory or a workspace ancestor.
pub const TEMPLATE_DIR: &str = "templates";

/// Sub-directory holding one message template per message structure.
pub const MESSAGE_TEMPLATE_DIR: &str = "message";

/// Optional terminology overrides inside a template directory.
pub const TERMINOLOGY_FILENAME: &str = "terminology.yml";

/// Optional structure definitions inside a template directory.
pub const STRUCTURE_FILENAME: &str = "structure.yml";

/// Extensions recognised for template files.
pub const TEMPLATE_EXTENSIONS: &[&str] = &["yml", "yaml"];

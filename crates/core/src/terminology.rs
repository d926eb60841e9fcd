//! Code system URLs and code maps.
//!
//! Defaults are embedded in the crate; a template directory may add or override entries
//! with its own `terminology.yml` using the same schema:
//!
//! ```yaml
//! codeSystems:
//!   LN: http://loinc.org
//! tables:
//!   AdministrativeGender:
//!     F: female
//! ```

use crate::error::{ConfigError, ConfigResult};
use serde::Deserialize;
use std::collections::HashMap;

const DEFAULT_TERMINOLOGY: &str = include_str!("../terminology/default.yml");

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct TerminologyWire {
    #[serde(default)]
    code_systems: HashMap<String, String>,
    #[serde(default)]
    tables: HashMap<String, HashMap<String, String>>,
}

/// Code systems and code maps, read-only once loaded.
#[derive(Clone, Debug, Default)]
pub struct Terminology {
    code_systems: HashMap<String, String>,
    tables: HashMap<String, HashMap<String, String>>,
}

impl Terminology {
    /// The embedded default tables.
    pub fn with_defaults() -> ConfigResult<Self> {
        let mut terminology = Self::default();
        terminology.merge_yaml(DEFAULT_TERMINOLOGY)?;
        Ok(terminology)
    }

    /// Adds (or replaces) code systems and table entries from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Terminology`] with the failing YAML path when the text does not
    /// match the schema.
    pub fn merge_yaml(&mut self, yaml_text: &str) -> ConfigResult<()> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let wire: TerminologyWire =
            serde_path_to_error::deserialize(deserializer).map_err(|err| {
                let path = err.path().to_string();
                ConfigError::Terminology(format!("schema mismatch at {path}: {}", err.into_inner()))
            })?;

        self.code_systems.extend(wire.code_systems);
        for (name, entries) in wire.tables {
            self.tables.entry(name).or_default().extend(entries);
        }
        Ok(())
    }

    /// Canonical URL for a code system identifier (case-insensitive).
    pub fn system_url(&self, identifier: &str) -> Option<&str> {
        let identifier = identifier.trim();
        self.code_systems
            .get(identifier)
            .or_else(|| {
                self.code_systems
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(identifier))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// Maps `code` through `table`: exact match first, then case-insensitive.
    pub fn lookup(&self, table: &str, code: &str) -> Option<&str> {
        let entries = self.tables.get(table)?;
        let code = code.trim();
        entries
            .get(code)
            .or_else(|| {
                entries
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(code))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_codes_and_systems() {
        let terminology = Terminology::with_defaults().expect("defaults");
        assert_eq!(terminology.system_url("LN"), Some("http://loinc.org"));
        assert_eq!(terminology.system_url("ucum"), Some("http://unitsofmeasure.org"));
        assert_eq!(terminology.lookup("AdministrativeGender", "F"), Some("female"));
        assert_eq!(terminology.lookup("ObservationStatus", "f"), Some("final"));
        assert_eq!(terminology.lookup("ObservationStatus", "Q"), None);
        assert!(terminology.table_names().any(|t| t == "IDENTIFIER_USE"));
    }

    #[test]
    fn overrides_merge_into_defaults() {
        let mut terminology = Terminology::with_defaults().expect("defaults");
        terminology
            .merge_yaml("tables:\n  AdministrativeGender:\n    X: other\n  Local:\n    A: alpha\n")
            .expect("override");
        assert_eq!(terminology.lookup("AdministrativeGender", "X"), Some("other"));
        assert_eq!(terminology.lookup("AdministrativeGender", "M"), Some("male"));
        assert_eq!(terminology.lookup("Local", "A"), Some("alpha"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut terminology = Terminology::default();
        let err = terminology
            .merge_yaml("codesystems:\n  LN: http://loinc.org\n")
            .expect_err("unknown key");
        assert!(matches!(err, ConfigError::Terminology(msg) if msg.contains("schema mismatch")));
    }
}

//! Conversion entry point.
//!
//! A [`Converter`] is built once from a [`ConverterConfig`]: it loads the terminology and
//! structure overrides of the template directory, compiles every template and then serves any
//! number of conversions. Everything it holds is read-only and shared, so one converter can be
//! used from several threads at once.

use crate::composer::compose_message;
use crate::config::ConverterConfig;
use crate::constants::{STRUCTURE_FILENAME, TERMINOLOGY_FILENAME};
use crate::engine::Session;
use crate::error::{ConfigError, ConfigResult, ConversionError, ConversionResult};
use crate::ids::IdGenerator;
use crate::resolvers::TypeRegistry;
use crate::script::{BuiltinScripts, ScriptEvaluator};
use crate::template::TemplateSet;
use crate::terminology::Terminology;
use fhir::Bundle;
use hl7::{Message, StructureRegistry};
use std::path::Path;
use std::sync::Arc;

/// Template-driven HL7 v2 to FHIR converter.
#[derive(Clone)]
pub struct Converter {
    config: ConverterConfig,
    structures: Arc<StructureRegistry>,
    templates: Arc<TemplateSet>,
    types: Arc<TypeRegistry>,
    scripts: Arc<dyn ScriptEvaluator>,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("config", &self.config)
            .field("templates", &self.templates.definition_count())
            .finish_non_exhaustive()
    }
}

impl Converter {
    /// Loads the template directory of `config` with the built-in script functions.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any template, terminology or structure file is unreadable or
    /// invalid.
    pub fn new(config: ConverterConfig) -> ConfigResult<Self> {
        Self::with_scripts(config, Arc::new(BuiltinScripts))
    }

    /// Like [`Converter::new`], with a caller-provided script evaluator.
    pub fn with_scripts(config: ConverterConfig, scripts: Arc<dyn ScriptEvaluator>) -> ConfigResult<Self> {
        let dir = config.template_dir();

        let mut terminology = Terminology::with_defaults()?;
        if let Some(text) = read_optional(&dir.join(TERMINOLOGY_FILENAME))? {
            terminology.merge_yaml(&text)?;
        }

        let mut structures = StructureRegistry::with_defaults()?;
        if let Some(text) = read_optional(&dir.join(STRUCTURE_FILENAME))? {
            structures.load_yaml(&text)?;
        }

        let types = TypeRegistry::with_defaults(terminology);
        let templates = TemplateSet::load_dir(dir, &types, scripts.as_ref())?;
        for structure in templates.message_structures() {
            if structures.get(structure).is_none() {
                tracing::warn!(structure, "message template has no structure definition; groups will not match");
            }
        }

        Ok(Self {
            config,
            structures: Arc::new(structures),
            templates: Arc::new(templates),
            types: Arc::new(types),
            scripts,
        })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    pub fn structures(&self) -> &StructureRegistry {
        &self.structures
    }

    /// Parses message text with this converter's structure definitions.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Parse`] for text that is not an HL7 v2 message.
    pub fn parse(&self, text: &str) -> ConversionResult<Message> {
        Ok(hl7::parse(text, &self.structures)?)
    }

    /// Parses and converts one message.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] when the text does not parse or no message template exists
    /// for its structure. Problems inside the message only drop fields or occurrences.
    pub fn convert(&self, text: &str) -> ConversionResult<Bundle> {
        let message = self.parse(text)?;
        self.convert_message(&message)
    }

    /// Converts an already parsed message.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::NoTemplate`] when no message template exists for the
    /// message's structure.
    pub fn convert_message(&self, message: &Message) -> ConversionResult<Bundle> {
        let structure = message.structure();
        let template = self
            .templates
            .message(structure)
            .ok_or_else(|| ConversionError::NoTemplate(structure.to_owned()))?;

        let ids = IdGenerator::new(self.config.id_strategy());
        let session = Session::new(
            &self.templates,
            &self.types,
            self.scripts.as_ref(),
            &ids,
            message,
        );
        let bundle = Bundle::from_resources(compose_message(&session, template));

        tracing::info!(structure, resources = bundle.len(), "message converted");
        for reference in bundle.unresolved_references() {
            tracing::debug!(%reference, "reference points outside the bundle");
        }
        Ok(bundle)
    }
}

fn read_optional(path: &Path) -> ConfigResult<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    std::fs::read_to_string(path)
        .map(Some)
        .map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdStrategy;

    fn write(root: &Path, relative: &str, text: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, text).expect("write");
    }

    fn converter(root: &Path) -> Converter {
        let config = ConverterConfig::new(root.to_path_buf(), IdStrategy::Sequential).expect("config");
        Converter::new(config).expect("converter")
    }

    #[test]
    fn loads_overrides_from_the_template_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "terminology.yml", "tables:\n  Flag:\n    Y: yes-flag\n");
        write(
            root,
            "structure.yml",
            "structures:\n  ZZZ_Z01:\n    - MSH\n    - group: ITEM\n      repeats: true\n      children:\n        - ZIT\n",
        );
        write(root, "resource/Item.yml", "resourceType: Basic\nflag:\n  type: Flag\n  specs: ZIT.2\n");
        write(
            root,
            "message/ZZZ_Z01.yml",
            "resources:\n  - resourceName: Item\n    resourcePath: resource/Item\n    segment: ZIT\n    group: ITEM\n    repeats: true\n",
        );

        let converter = converter(root);
        let bundle = converter
            .convert("MSH|^~\\&|A|B|||20240101||ZZZ^Z01|1|P|2.5.1\rZIT|1|Y\rZIT|2|N\r")
            .expect("convert");

        assert_eq!(bundle.len(), 1);
        let item = &bundle.resources()[0];
        assert_eq!(item.id(), "Basic-1");
        assert_eq!(item.to_json()["flag"], "yes-flag");
    }

    #[test]
    fn unknown_structures_and_bad_text_are_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join("message")).expect("mkdir");
        let converter = converter(root);

        assert!(matches!(
            converter.convert("MSH|^~\\&|A|B|||20240101||ADT^A01|1|P|2.5.1\rPID|1\r"),
            Err(ConversionError::NoTemplate(structure)) if structure == "ADT_A01"
        ));
        assert!(matches!(converter.convert("PID|1"), Err(ConversionError::Parse(_))));
    }
}

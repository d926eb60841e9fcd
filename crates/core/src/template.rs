//! Template loading and load-time validation.
//!
//! A template directory holds three kinds of YAML file:
//!
//! - `message/<STRUCTURE>.yml` lists the resources produced from one message structure and
//!   binds each one to its primary segment, group and additional segments;
//! - `resource/<Name>.yml` and `datatype/<Name>.yml` define the fields of a resource or of an
//!   embedded datatype.
//!
//! ```yaml
//! # message/ORU_R01.yml
//! resources:
//!   - resourceName: Observation
//!     resourcePath: resource/Observation
//!     segment: OBX
//!     group: PATIENT_RESULT.ORDER_OBSERVATION.OBSERVATION
//!     repeats: true
//!     correlationGroup: PATIENT_RESULT.ORDER_OBSERVATION
//!     additionalSegments:
//!       - PATIENT_RESULT.ORDER_OBSERVATION.OBR
//!       - .NTE*
//! ```
//!
//! ```yaml
//! # resource/Observation.yml
//! resourceType: Observation
//! status:
//!   type: ObservationStatus
//!   specs: OBX.11
//!   required: true
//! code:
//!   valueOf: datatype/CodeableConcept
//!   type: CWE
//!   specs: OBX.3
//! ```
//!
//! Additional segment paths are absolute from the message root, or relative to the primary
//! segment's group when they start with `.`; a trailing `*` attaches every occurrence.
//!
//! Everything a conversion could trip over is rejected here instead: malformed specs,
//! conditions and scripts, unknown type tags, missing template references, reference cycles
//! and inconsistent segment bindings.

use crate::condition::Condition;
use crate::constants::{
    DEFAULT_TYPE, MESSAGE_TEMPLATE_DIR, STRUCTURE_FILENAME, TEMPLATE_EXTENSIONS,
    TERMINOLOGY_FILENAME,
};
use crate::error::{ConfigError, ConfigResult, SyntaxError};
use crate::expression::{Expression, ExpressionKind, Variable};
use crate::resolvers::TypeRegistry;
use crate::script::ScriptEvaluator;
use crate::spec::{self, check_identifier, is_structural_path, SpecTarget};
use h2f_types::{NonEmptyText, Scalar, Value};
use hl7::message::ROOT_NAME;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ExpressionWire {
    #[serde(rename = "type")]
    type_tag: Option<String>,
    value_of: Option<String>,
    expression_type: Option<String>,
    specs: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default, alias = "generateMultiple")]
    generate_list: bool,
    #[serde(default)]
    evaluate_later: bool,
    default: Option<serde_yaml::Value>,
    #[serde(default)]
    vars: BTreeMap<String, VariableWire>,
    condition: Option<String>,
    #[serde(default)]
    constants: BTreeMap<String, String>,
    expressions: Option<BTreeMap<String, ExpressionWire>>,
    expressions_list: Option<Vec<ExpressionWire>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VariableWire {
    Spec(String),
    Expression(Box<ExpressionWire>),
}

#[derive(Debug, Deserialize)]
struct DefinitionWire {
    #[serde(rename = "resourceType")]
    resource_type: Option<NonEmptyText>,
    #[serde(flatten)]
    fields: BTreeMap<String, ExpressionWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MessageTemplateWire {
    resources: Vec<ResourceTemplateWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ResourceTemplateWire {
    resource_name: NonEmptyText,
    resource_path: String,
    segment: String,
    group: Option<String>,
    #[serde(default)]
    additional_segments: Vec<AdditionalSegmentWire>,
    #[serde(default)]
    repeats: bool,
    #[serde(default)]
    ignore_empty: bool,
    correlation_group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AdditionalSegmentWire {
    Path(String),
    Declared(AdditionalDeclarationWire),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdditionalDeclarationWire {
    segment: String,
    group: Option<String>,
    #[serde(default)]
    repeats: bool,
    name: Option<String>,
}

fn from_yaml<T: serde::de::DeserializeOwned>(template: &str, text: &str) -> ConfigResult<T> {
    let deserializer = serde_yaml::Deserializer::from_str(text);
    serde_path_to_error::deserialize(deserializer).map_err(|err| ConfigError::Schema {
        template: template.to_owned(),
        path: err.path().to_string(),
        message: err.into_inner().to_string(),
    })
}

// ============================================================================
// Compiled templates
// ============================================================================

/// Fields of a resource or datatype template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateDefinition {
    path: String,
    resource_type: NonEmptyText,
    fields: Vec<Expression>,
}

impl TemplateDefinition {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn resource_type(&self) -> &NonEmptyText {
        &self.resource_type
    }

    pub fn fields(&self) -> &[Expression] {
        &self.fields
    }

    pub fn has_deferred_fields(&self) -> bool {
        self.fields.iter().any(|f| f.evaluate_later)
    }
}

/// How a resource template finds its source segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentBinding {
    pub primary_segment: String,
    pub group_path: Vec<String>,
    pub additional: Vec<AdditionalSegment>,
    pub repeats: bool,
    pub ignore_empty: bool,
    pub correlation_group_path: Vec<String>,
}

impl SegmentBinding {
    /// A binding with no additional segments, correlated on its own group.
    pub fn new(primary_segment: &str, group_path: &[&str]) -> Self {
        let group_path: Vec<String> = group_path.iter().map(|g| (*g).to_owned()).collect();
        Self {
            primary_segment: primary_segment.to_owned(),
            correlation_group_path: group_path.clone(),
            group_path,
            additional: Vec::new(),
            repeats: true,
            ignore_empty: false,
        }
    }
}

/// A segment bound alongside the primary one under `name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdditionalSegment {
    pub name: String,
    pub group_path: Vec<String>,
    pub segment: String,
    pub repeats: bool,
}

/// One entry of a message template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceTemplate {
    resource_name: NonEmptyText,
    resource_path: String,
    binding: SegmentBinding,
}

impl ResourceTemplate {
    pub fn resource_name(&self) -> &str {
        self.resource_name.as_str()
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn binding(&self) -> &SegmentBinding {
        &self.binding
    }
}

/// The resources produced from one message structure, in evaluation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageTemplate {
    structure: String,
    resources: Vec<ResourceTemplate>,
}

impl MessageTemplate {
    pub fn structure(&self) -> &str {
        &self.structure
    }

    pub fn resources(&self) -> &[ResourceTemplate] {
        &self.resources
    }
}

/// Every template of a directory, validated and immutable.
#[derive(Clone, Debug, Default)]
pub struct TemplateSet {
    definitions: HashMap<String, TemplateDefinition>,
    messages: HashMap<String, MessageTemplate>,
}

impl TemplateSet {
    /// Loads every template file under `dir`.
    ///
    /// `terminology.yml` and `structure.yml` at the top level are not templates and are
    /// skipped; the converter loads them separately.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] for unreadable files and any validation error of
    /// [`TemplateSet::from_sources`].
    pub fn load_dir(
        dir: &Path,
        types: &TypeRegistry,
        scripts: &dyn ScriptEvaluator,
    ) -> ConfigResult<Self> {
        let sources = read_template_files(dir)?;
        let set = Self::from_sources(sources, types, scripts)?;
        tracing::info!(
            dir = %dir.display(),
            definitions = set.definitions.len(),
            messages = set.messages.len(),
            "loaded templates"
        );
        Ok(set)
    }

    /// Builds a set from `(relative path, YAML text)` pairs, e.g.
    /// `("resource/Patient.yml", "...")`.
    pub fn from_sources<I, P, T>(
        sources: I,
        types: &TypeRegistry,
        scripts: &dyn ScriptEvaluator,
    ) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (P, T)>,
        P: AsRef<str>,
        T: AsRef<str>,
    {
        let mut set = Self::default();
        let mut message_wires = Vec::new();

        for (path, text) in sources {
            let key = template_key(path.as_ref());
            let structure = key
                .strip_prefix(&format!("{MESSAGE_TEMPLATE_DIR}/"))
                .map(str::to_owned);
            match structure {
                Some(structure) => {
                    let wire: MessageTemplateWire = from_yaml(&key, text.as_ref())?;
                    message_wires.push((structure, key, wire));
                }
                None => {
                    let wire: DefinitionWire = from_yaml(&key, text.as_ref())?;
                    let compiler = Compiler {
                        types,
                        scripts,
                        template: &key,
                    };
                    let definition = compiler.definition(wire)?;
                    set.definitions.insert(key, definition);
                }
            }
        }

        for (structure, key, wire) in message_wires {
            let message = compile_message(&structure, wire)?;
            for resource in &message.resources {
                if !set.definitions.contains_key(&resource.resource_path) {
                    return Err(ConfigError::UnknownTemplate {
                        template: key.clone(),
                        target: resource.resource_path.clone(),
                    });
                }
            }
            set.messages.insert(structure, message);
        }

        set.check_references()?;
        set.check_cycles()?;
        Ok(set)
    }

    pub fn definition(&self, path: &str) -> Option<&TemplateDefinition> {
        self.definitions.get(path)
    }

    pub fn message(&self, structure: &str) -> Option<&MessageTemplate> {
        self.messages.get(structure)
    }

    pub fn message_structures(&self) -> impl Iterator<Item = &str> {
        self.messages.keys().map(String::as_str)
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    fn check_references(&self) -> ConfigResult<()> {
        for (key, definition) in &self.definitions {
            for field in &definition.fields {
                for target in field.template_references() {
                    if !self.definitions.contains_key(target) {
                        return Err(ConfigError::UnknownTemplate {
                            template: key.clone(),
                            target: target.to_owned(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_cycles(&self) -> ConfigResult<()> {
        let mut keys: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        for key in keys {
            self.visit(key, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        key: &'a str,
        marks: &mut HashMap<&'a str, bool>,
        stack: &mut Vec<&'a str>,
    ) -> ConfigResult<()> {
        match marks.get(key) {
            Some(true) => return Ok(()),
            Some(false) => {
                let start = stack.iter().position(|k| *k == key).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(key);
                return Err(ConfigError::Cycle(cycle.join(" -> ")));
            }
            None => {}
        }

        marks.insert(key, false);
        stack.push(key);
        if let Some(definition) = self.definitions.get(key) {
            for field in &definition.fields {
                for target in field.template_references() {
                    self.visit(target, marks, stack)?;
                }
            }
        }
        stack.pop();
        marks.insert(key, true);
        Ok(())
    }
}

/// `resource/Patient.yml` → `resource/Patient`.
fn template_key(path: &str) -> String {
    let path = path.replace('\\', "/");
    let path = path.trim_start_matches("./");
    let stem = TEMPLATE_EXTENSIONS
        .iter()
        .find_map(|ext| path.strip_suffix(&format!(".{ext}")))
        .unwrap_or(path);
    stem.to_owned()
}

fn read_template_files(dir: &Path) -> ConfigResult<Vec<(String, String)>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> ConfigResult<()> {
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::FileRead {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| ConfigError::FileRead {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            if path.is_dir() {
                walk(root, &path, out)?;
                continue;
            }
            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| TEMPLATE_EXTENSIONS.contains(&e));
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let is_reserved = relative == Path::new(TERMINOLOGY_FILENAME)
                || relative == Path::new(STRUCTURE_FILENAME);
            if !is_template || is_reserved {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
                path: path.clone(),
                source,
            })?;
            out.push((relative.to_string_lossy().into_owned(), text));
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

// ============================================================================
// Expression compilation
// ============================================================================

struct Compiler<'a> {
    types: &'a TypeRegistry,
    scripts: &'a dyn ScriptEvaluator,
    template: &'a str,
}

impl Compiler<'_> {
    fn definition(&self, wire: DefinitionWire) -> ConfigResult<TemplateDefinition> {
        let resource_type = match wire.resource_type {
            Some(name) => name,
            None => {
                let file_name = self.template.rsplit('/').next().unwrap_or(self.template);
                NonEmptyText::new(file_name).map_err(|_| {
                    ConfigError::InvalidInput(format!("template {} has no resourceType", self.template))
                })?
            }
        };

        let fields = wire
            .fields
            .into_iter()
            .map(|(name, field)| self.expression(&name, field))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(TemplateDefinition {
            path: self.template.to_owned(),
            resource_type,
            fields,
        })
    }

    fn spec_error(&self, field: &str, spec: &str, err: SyntaxError) -> ConfigError {
        ConfigError::InvalidSpec {
            template: self.template.to_owned(),
            field: field.to_owned(),
            spec: spec.to_owned(),
            reason: err.0,
        }
    }

    fn missing(&self, field: &str, what: &str) -> ConfigError {
        ConfigError::Schema {
            template: self.template.to_owned(),
            path: field.to_owned(),
            message: format!("{what} is required"),
        }
    }

    fn expression(&self, name: &str, wire: ExpressionWire) -> ConfigResult<Expression> {
        let type_tag = wire.type_tag.unwrap_or_else(|| DEFAULT_TYPE.to_owned());
        let generate_multiple = wire.generate_list;

        let specs = match &wire.specs {
            Some(text) => {
                spec::parse(text, generate_multiple).map_err(|e| self.spec_error(name, text, e))?
            }
            None => Vec::new(),
        };

        let variables = wire
            .vars
            .into_iter()
            .map(|(var_name, var)| self.variable(name, var_name, var))
            .collect::<ConfigResult<Vec<_>>>()?;

        let condition = wire
            .condition
            .as_deref()
            .map(|text| {
                Condition::parse(text).map_err(|e| ConfigError::InvalidCondition {
                    template: self.template.to_owned(),
                    field: name.to_owned(),
                    condition: text.to_owned(),
                    reason: e.0,
                })
            })
            .transpose()?;

        let mut specs = specs;
        let kind = match wire.expression_type.as_deref().map(str::to_lowercase) {
            Some(explicit) => match explicit.as_str() {
                "hl7spec" | "spec" => {
                    if let Some(text) = &wire.value_of {
                        if !specs.is_empty() {
                            return Err(self.missing(name, "only one of specs or valueOf"));
                        }
                        specs = spec::parse(text, generate_multiple)
                            .map_err(|e| self.spec_error(name, text, e))?;
                    }
                    ExpressionKind::SourceSpec
                }
                "resource" => ExpressionKind::Resource {
                    template: wire.value_of.ok_or_else(|| self.missing(name, "valueOf"))?,
                },
                "reference" => ExpressionKind::Reference {
                    template: wire.value_of.ok_or_else(|| self.missing(name, "valueOf"))?,
                },
                "script" | "jexl" => {
                    let script = wire.value_of.ok_or_else(|| self.missing(name, "valueOf"))?;
                    self.check_script(name, &script)?;
                    ExpressionKind::Script { script }
                }
                "context" => {
                    let text = wire.value_of.ok_or_else(|| self.missing(name, "valueOf"))?;
                    self.context_fetch(name, &text, generate_multiple)?
                }
                "simple" => ExpressionKind::Simple {
                    value_of: wire.value_of,
                },
                "nested" => self.nested(name, wire.expressions, wire.expressions_list)?,
                other => {
                    return Err(ConfigError::Schema {
                        template: self.template.to_owned(),
                        path: format!("{name}.expressionType"),
                        message: format!("unknown expression type '{other}'"),
                    })
                }
            },
            None if wire.expressions.is_some() || wire.expressions_list.is_some() => {
                self.nested(name, wire.expressions, wire.expressions_list)?
            }
            None => match wire.value_of {
                Some(text) if text.starts_with('$') && text.contains(':') => {
                    self.context_fetch(name, &text, generate_multiple)?
                }
                Some(text) if text.starts_with('$') => {
                    check_identifier(&text[1..]).map_err(|e| self.spec_error(name, &text, e))?;
                    ExpressionKind::Simple {
                        value_of: Some(text),
                    }
                }
                Some(text) if looks_like_template_path(&text) => {
                    ExpressionKind::Resource { template: text }
                }
                Some(text) if is_structural_path(&text) => {
                    if !specs.is_empty() {
                        return Err(self.missing(name, "only one of specs or valueOf"));
                    }
                    specs = spec::parse(&text, generate_multiple)
                        .map_err(|e| self.spec_error(name, &text, e))?;
                    ExpressionKind::SourceSpec
                }
                Some(text) => ExpressionKind::Simple {
                    value_of: Some(text),
                },
                None if !specs.is_empty() => ExpressionKind::SourceSpec,
                None => ExpressionKind::Simple { value_of: None },
            },
        };

        if matches!(kind, ExpressionKind::Simple { .. } | ExpressionKind::SourceSpec)
            && !self.types.contains(&type_tag)
        {
            return Err(ConfigError::UnknownType {
                template: self.template.to_owned(),
                field: name.to_owned(),
                type_tag,
            });
        }

        Ok(Expression {
            name: name.to_owned(),
            type_tag,
            required: wire.required,
            generate_multiple,
            evaluate_later: wire.evaluate_later,
            default_value: wire.default.map(yaml_to_value),
            specs,
            variables,
            condition,
            constants: wire.constants,
            kind,
        })
    }

    fn variable(&self, field: &str, name: String, wire: VariableWire) -> ConfigResult<Variable> {
        let path = format!("{field}.vars.{name}");
        check_identifier(&name).map_err(|e| self.spec_error(&path, &name, e))?;
        let expression = match wire {
            VariableWire::Spec(text) => {
                let specs = spec::parse(&text, false).map_err(|e| self.spec_error(&path, &text, e))?;
                let mut expression = Expression::new(&name, DEFAULT_TYPE, ExpressionKind::SourceSpec);
                expression.generate_multiple = specs.iter().any(|s| s.extract_multiple());
                expression.specs = specs;
                expression
            }
            VariableWire::Expression(wire) => self.expression(&path, *wire)?,
        };
        Ok(Variable { name, expression })
    }

    fn context_fetch(&self, name: &str, text: &str, generate_multiple: bool) -> ConfigResult<ExpressionKind> {
        let mut specs = spec::parse(text, generate_multiple).map_err(|e| self.spec_error(name, text, e))?;
        match specs.as_slice() {
            [only] if matches!(only.target(), SpecTarget::Fetch { .. }) => Ok(ExpressionKind::ContextFetch {
                fetch: specs.remove(0),
            }),
            _ => Err(self.spec_error(
                name,
                text,
                SyntaxError::new("a context expression takes a single '$name[:key]'"),
            )),
        }
    }

    fn check_script(&self, name: &str, script: &str) -> ConfigResult<()> {
        self.scripts
            .validate(script)
            .map_err(|e| ConfigError::InvalidScript {
                template: self.template.to_owned(),
                field: name.to_owned(),
                script: script.to_owned(),
                reason: e.0,
            })
    }

    fn nested(
        &self,
        name: &str,
        expressions: Option<BTreeMap<String, ExpressionWire>>,
        expressions_list: Option<Vec<ExpressionWire>>,
    ) -> ConfigResult<ExpressionKind> {
        match (expressions, expressions_list) {
            (Some(children), None) => Ok(ExpressionKind::NestedMap {
                children: children
                    .into_iter()
                    .map(|(child, wire)| self.expression(&child, wire).map_err(|e| nest_error(name, e)))
                    .collect::<ConfigResult<Vec<_>>>()?,
            }),
            (None, Some(children)) => Ok(ExpressionKind::NestedList {
                children: children
                    .into_iter()
                    .enumerate()
                    .map(|(i, wire)| self.expression(&format!("{name}[{i}]"), wire))
                    .collect::<ConfigResult<Vec<_>>>()?,
            }),
            _ => Err(self.missing(name, "exactly one of expressions or expressionsList")),
        }
    }
}

/// `datatype/CodeableConcept`, but not `http://loinc.org`.
fn looks_like_template_path(text: &str) -> bool {
    text.contains('/') && !text.contains(':') && !text.contains(char::is_whitespace)
}

/// Prefixes the field of a child's error with its parent's name.
fn nest_error(parent: &str, err: ConfigError) -> ConfigError {
    let nest = |field: String| format!("{parent}.{field}");
    match err {
        ConfigError::InvalidSpec {
            template,
            field,
            spec,
            reason,
        } => ConfigError::InvalidSpec {
            template,
            field: nest(field),
            spec,
            reason,
        },
        ConfigError::InvalidCondition {
            template,
            field,
            condition,
            reason,
        } => ConfigError::InvalidCondition {
            template,
            field: nest(field),
            condition,
            reason,
        },
        ConfigError::UnknownType {
            template,
            field,
            type_tag,
        } => ConfigError::UnknownType {
            template,
            field: nest(field),
            type_tag,
        },
        other => other,
    }
}

fn yaml_to_value(yaml: serde_yaml::Value) -> Value {
    match yaml {
        serde_yaml::Value::Null => Value::Absent,
        serde_yaml::Value::Bool(b) => Value::from(b),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Scalar(Scalar::Integer(i)),
            None => Value::Scalar(Scalar::Decimal(n.to_string())),
        },
        serde_yaml::Value::String(s) => Value::text(s),
        serde_yaml::Value::Sequence(items) => Value::List(items.into_iter().map(yaml_to_value).collect()),
        serde_yaml::Value::Mapping(map) => Value::Map(
            map.into_iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_owned(), yaml_to_value(v))))
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(tagged.value),
    }
}

// ============================================================================
// Message template compilation
// ============================================================================

fn parse_group_path(text: Option<&str>) -> Vec<String> {
    match text.map(str::trim) {
        None | Some("") => Vec::new(),
        Some(text) if text == ROOT_NAME => Vec::new(),
        Some(text) => text.split('.').map(|g| g.trim().to_owned()).collect(),
    }
}

fn compile_message(structure: &str, wire: MessageTemplateWire) -> ConfigResult<MessageTemplate> {
    let resources = wire
        .resources
        .into_iter()
        .map(|resource| compile_resource(structure, resource))
        .collect::<ConfigResult<Vec<_>>>()?;
    Ok(MessageTemplate {
        structure: structure.to_owned(),
        resources,
    })
}

fn compile_resource(structure: &str, wire: ResourceTemplateWire) -> ConfigResult<ResourceTemplate> {
    let invalid = |reason: String| ConfigError::InvalidBinding {
        message: structure.to_owned(),
        resource: wire.resource_name.to_string(),
        reason,
    };

    let (group_path, primary_segment) = match wire.group.as_deref() {
        Some(group) => (parse_group_path(Some(group)), wire.segment.trim().to_owned()),
        None => {
            let mut parts = parse_group_path(Some(&wire.segment));
            let segment = parts.pop().unwrap_or_default();
            (parts, segment)
        }
    };
    for name in group_path.iter().chain(std::iter::once(&primary_segment)) {
        check_identifier(name).map_err(|e| invalid(e.0))?;
    }

    let correlation_group_path = match wire.correlation_group.as_deref() {
        Some(text) => parse_group_path(Some(text)),
        None => group_path.clone(),
    };
    if !group_path.starts_with(&correlation_group_path) {
        return Err(invalid(format!(
            "correlation group '{}' does not enclose group '{}'",
            correlation_group_path.join("."),
            group_path.join(".")
        )));
    }

    let mut additional: Vec<AdditionalSegment> = Vec::new();
    for declaration in wire.additional_segments {
        let segment = additional_segment(&group_path, declaration).map_err(|e| invalid(e.0))?;
        if segment.name == primary_segment {
            return Err(invalid(format!(
                "additional segment '{}' clashes with the primary segment",
                segment.name
            )));
        }
        if let Some(existing) = additional.iter().find(|a| a.name == segment.name) {
            let reason = if existing.group_path == segment.group_path {
                format!("additional segment '{}' is declared twice", segment.name)
            } else {
                format!(
                    "additional segment '{}' is declared at '{}' and '{}'; give one of them a name",
                    segment.name,
                    display_path(&existing.group_path),
                    display_path(&segment.group_path)
                )
            };
            return Err(invalid(reason));
        }
        additional.push(segment);
    }

    Ok(ResourceTemplate {
        resource_name: wire.resource_name,
        resource_path: template_key(wire.resource_path.trim()),
        binding: SegmentBinding {
            primary_segment,
            group_path,
            additional,
            repeats: wire.repeats,
            ignore_empty: wire.ignore_empty,
            correlation_group_path,
        },
    })
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        ROOT_NAME.to_owned()
    } else {
        path.join(".")
    }
}

fn additional_segment(
    primary_group: &[String],
    wire: AdditionalSegmentWire,
) -> Result<AdditionalSegment, SyntaxError> {
    let (mut path, repeats, name) = match wire {
        AdditionalSegmentWire::Path(text) => {
            let text = text.trim();
            let (text, repeats) = match text.strip_suffix('*') {
                Some(rest) => (rest, true),
                None => (text, false),
            };
            (text.to_owned(), repeats, None)
        }
        AdditionalSegmentWire::Declared(declared) => {
            let path = match declared.group.as_deref().map(str::trim) {
                Some(group) if !group.is_empty() => format!("{group}.{}", declared.segment.trim()),
                _ => declared.segment.trim().to_owned(),
            };
            (path, declared.repeats, declared.name)
        }
    };

    let relative = path.starts_with('.');
    if relative {
        path.remove(0);
    }
    let mut tokens: Vec<String> = path.split('.').map(|t| t.trim().to_owned()).collect();
    let segment = tokens.pop().unwrap_or_default();
    for token in tokens.iter().chain(std::iter::once(&segment)) {
        check_identifier(token)?;
    }
    let group_path = if relative {
        primary_group.iter().cloned().chain(tokens).collect()
    } else {
        tokens
    };
    let name = name.unwrap_or_else(|| segment.clone());
    check_identifier(&name)?;

    Ok(AdditionalSegment {
        name,
        group_path,
        segment,
        repeats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::BuiltinScripts;
    use crate::terminology::Terminology;

    fn types() -> TypeRegistry {
        TypeRegistry::with_defaults(Terminology::with_defaults().expect("terminology"))
    }

    fn load(sources: &[(&str, &str)]) -> ConfigResult<TemplateSet> {
        TemplateSet::from_sources(sources.iter().copied(), &types(), &BuiltinScripts)
    }

    const PATIENT: &str = r#"
resourceType: Patient
gender:
  type: AdministrativeGender
  specs: PID.8
name:
  valueOf: datatype/HumanName
  type: XPN
  specs: PID.5
  generateList: true
birthDate:
  type: DATE
  valueOf: PID.7
managingOrganization:
  valueOf: $Organization:reference
  evaluateLater: true
active:
  type: BOOLEAN
  valueOf: "true"
"#;

    const HUMAN_NAME: &str = r#"
family:
  type: STRING
  specs: XPN.1
given:
  expressionsList:
    - type: STRING
      specs: XPN.2
    - type: STRING
      specs: XPN.3
  vars:
    given: XPN.2
  condition: $given NOT_NULL
"#;

    const MESSAGE: &str = r#"
resources:
  - resourceName: Patient
    resourcePath: resource/Patient.yml
    segment: PATIENT_RESULT.PATIENT.PID
    additionalSegments:
      - MSH
      - .PD1
      - segment: NTE
        group: PATIENT_RESULT.PATIENT
        repeats: true
        name: NOTES
"#;

    #[test]
    fn loads_and_infers_expression_kinds() {
        let set = load(&[
            ("resource/Patient.yml", PATIENT),
            ("datatype/HumanName.yml", HUMAN_NAME),
            ("message/ORU_R01.yml", MESSAGE),
        ])
        .expect("templates load");

        let patient = set.definition("resource/Patient").expect("patient");
        assert_eq!(patient.resource_type().as_str(), "Patient");
        assert!(patient.has_deferred_fields());
        let kind = |name: &str| {
            patient
                .fields()
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.kind.label())
                .expect("field")
        };
        assert_eq!(kind("gender"), "HL7Spec");
        assert_eq!(kind("name"), "resource");
        assert_eq!(kind("birthDate"), "HL7Spec");
        assert_eq!(kind("managingOrganization"), "context");
        assert_eq!(kind("active"), "simple");

        let human_name = set.definition("datatype/HumanName").expect("datatype");
        assert_eq!(human_name.resource_type().as_str(), "HumanName");

        let message = set.message("ORU_R01").expect("message template");
        let binding = message.resources()[0].binding();
        assert_eq!(binding.group_path, vec!["PATIENT_RESULT", "PATIENT"]);
        assert_eq!(binding.primary_segment, "PID");
        assert!(!binding.repeats);
        let names: Vec<(&str, String, bool)> = binding
            .additional
            .iter()
            .map(|a| (a.name.as_str(), a.group_path.join("."), a.repeats))
            .collect();
        assert_eq!(
            names,
            vec![
                ("MSH", String::new(), false),
                ("PD1", "PATIENT_RESULT.PATIENT".to_owned(), false),
                ("NOTES", "PATIENT_RESULT.PATIENT".to_owned(), true),
            ]
        );
    }

    #[test]
    fn reports_schema_mismatches_with_their_path() {
        let err = load(&[("resource/Patient.yml", "gender:\n  spec: PID.8\n")])
            .expect_err("unknown key");
        assert!(
            matches!(&err, ConfigError::Schema { template, .. } if template == "resource/Patient"),
            "{err}"
        );
    }

    #[test]
    fn rejects_bad_specs_conditions_and_types() {
        let bad_spec = load(&[("resource/A.yml", "x:\n  specs: PID.0\n")]).expect_err("spec");
        assert!(matches!(bad_spec, ConfigError::InvalidSpec { .. }));

        let bad_condition = load(&[(
            "resource/A.yml",
            "x:\n  specs: PID.3\n  condition: $x LIKE y\n",
        )])
        .expect_err("condition");
        assert!(matches!(bad_condition, ConfigError::InvalidCondition { .. }));

        let bad_type = load(&[("resource/A.yml", "x:\n  type: NOPE\n  specs: PID.3\n")])
            .expect_err("type");
        assert!(matches!(bad_type, ConfigError::UnknownType { type_tag, .. } if type_tag == "NOPE"));

        let bad_script = load(&[(
            "resource/A.yml",
            "x:\n  expressionType: JEXL\n  valueOf: shout($x)\n",
        )])
        .expect_err("script");
        assert!(matches!(bad_script, ConfigError::InvalidScript { .. }));

        let nested = load(&[(
            "resource/A.yml",
            "x:\n  expressions:\n    y:\n      type: NOPE\n",
        )])
        .expect_err("nested type");
        assert!(matches!(nested, ConfigError::UnknownType { field, .. } if field == "x.y"));
    }

    #[test]
    fn rejects_missing_templates_and_cycles() {
        let missing = load(&[("resource/A.yml", "x:\n  valueOf: datatype/Nope\n")])
            .expect_err("missing");
        assert!(matches!(missing, ConfigError::UnknownTemplate { target, .. } if target == "datatype/Nope"));

        let cycle = load(&[
            ("datatype/A.yml", "x:\n  valueOf: datatype/B\n"),
            ("datatype/B.yml", "y:\n  valueOf: datatype/A\n"),
        ])
        .expect_err("cycle");
        assert!(matches!(&cycle, ConfigError::Cycle(path) if path.contains("datatype/A -> datatype/B")));

        let unbound = load(&[(
            "message/ADT_A01.yml",
            "resources:\n  - resourceName: Patient\n    resourcePath: resource/Patient\n    segment: PID\n",
        )])
        .expect_err("unknown resource path");
        assert!(matches!(unbound, ConfigError::UnknownTemplate { .. }));
    }

    #[test]
    fn blank_names_are_schema_errors() {
        let message = "resources:\n  - resourceName: '  '\n    resourcePath: resource/Patient\n    segment: PID\n";
        let err = load(&[
            ("resource/Patient.yml", "gender:\n  specs: PID.8\n"),
            ("message/ADT_A01.yml", message),
        ])
        .expect_err("blank resourceName");
        assert!(
            matches!(&err, ConfigError::Schema { template, .. } if template == "message/ADT_A01"),
            "{err}"
        );
        assert!(err.to_string().contains("cannot be empty"), "{err}");

        let err = load(&[("resource/Patient.yml", "resourceType: ' '\ngender:\n  specs: PID.8\n")])
            .expect_err("blank resourceType");
        assert!(matches!(&err, ConfigError::Schema { .. }), "{err}");
    }

    #[test]
    fn rejects_inconsistent_bindings() {
        let with = |extra: &str| {
            let message = format!(
                "resources:\n  - resourceName: Observation\n    resourcePath: resource/A\n    segment: OBX\n    group: PATIENT_RESULT.ORDER_OBSERVATION.OBSERVATION\n{extra}"
            );
            load(&[("resource/A.yml", "x:\n  specs: OBX.3\n"), ("message/ORU_R01.yml", &message)])
        };

        assert!(with("").is_ok());
        let conflict = with(
            "    additionalSegments:\n      - PATIENT_RESULT.ORDER_OBSERVATION.NTE\n      - .NTE\n",
        )
        .expect_err("same name, different scopes");
        assert!(matches!(&conflict, ConfigError::InvalidBinding { reason, .. } if reason.contains("give one of them a name")));

        let renamed = with(
            "    additionalSegments:\n      - PATIENT_RESULT.ORDER_OBSERVATION.NTE\n      - segment: .NTE\n        name: OBX_NOTES\n",
        );
        assert!(renamed.is_ok());

        let correlation = with("    correlationGroup: PATIENT_RESULT.PATIENT\n")
            .expect_err("correlation outside group path");
        assert!(matches!(correlation, ConfigError::InvalidBinding { .. }));
    }

    #[test]
    fn loads_directories_and_skips_reserved_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join("message")).expect("mkdir");
        std::fs::create_dir_all(root.join("resource")).expect("mkdir");
        std::fs::write(root.join("resource/Patient.yml"), "gender:\n  specs: PID.8\n")
            .expect("write");
        std::fs::write(
            root.join("message/ADT_A01.yml"),
            "resources:\n  - resourceName: Patient\n    resourcePath: resource/Patient\n    segment: PID\n",
        )
        .expect("write");
        std::fs::write(root.join("terminology.yml"), "tables: {}\n").expect("write");
        std::fs::write(root.join("README.md"), "not a template").expect("write");

        let set = TemplateSet::load_dir(root, &types(), &BuiltinScripts).expect("load dir");
        assert_eq!(set.definition_count(), 1);
        assert!(set.message("ADT_A01").is_some());
    }
}

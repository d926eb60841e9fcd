//! Spec paths: the compact syntax templates use to point into the source message or
//! into the evaluation context.
//!
//! ```text
//! PID.5.1              component 1 of the first repetition of PID-5
//! PID.3(2).1           component 1 of the second repetition of PID-3
//! OBX.5*               every repetition of OBX-5
//! .OBSERVATION.OBX.3   OBX-3 found by walking the OBSERVATION group under the current scope
//! NTE.3&               NTE-3, keeping blank values
//! PID.13 | PID.14      first alternative that yields something
//! $Patient:reference   key `reference` of the `Patient` binding
//! $Encounter(group)    the `Encounter_<GROUP_ID>` binding
//! ```
//!
//! Responsibilities:
//! - parse alternatives and their `*`/`&` modifiers (in either order)
//! - address bound values first, fall back to a structural search under `GROUP_SCOPE`
//! - turn missing groups, segments, fields and blank text into [`Value::Absent`]

use crate::constants::{GROUP_ID, GROUP_SCOPE};
use crate::context::Context;
use crate::error::SyntaxError;
use h2f_types::{FieldValue, Granularity, Scalar, StructureHandle, Value};
use hl7::Message;

/// One parsed alternative.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spec {
    target: SpecTarget,
    extract_multiple: bool,
    retain_empty: bool,
    use_group: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpecTarget {
    /// A segment (or bound value) addressed by field/component/subcomponent.
    Structural(SourcePath),
    /// A context binding, optionally narrowed to one key of its map value(s).
    Fetch { binding: String, key: Option<String> },
}

/// `[.GROUP.GROUP.]NAME[.FIELD[(REP)][.COMP[.SUB]]]`, all indices 1-based.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcePath {
    pub group_path: Vec<String>,
    pub name: String,
    pub field: Option<usize>,
    pub repetition: Option<usize>,
    pub component: Option<usize>,
    pub subcomponent: Option<usize>,
}

/// Parses `|`-separated alternatives.
///
/// `generate_multiple_default` is the owning expression's multiplicity; a trailing `*` turns
/// it on for one alternative.
///
/// # Errors
///
/// Returns [`SyntaxError`] for empty alternatives, malformed names or indices, and group paths
/// that do not start with `.`.
pub fn parse(text: &str, generate_multiple_default: bool) -> Result<Vec<Spec>, SyntaxError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SyntaxError::new("spec is empty"));
    }
    text.split('|')
        .map(|alternative| parse_alternative(alternative.trim(), generate_multiple_default))
        .collect()
}

/// True when `text` parses as a structural path (used to infer expression variants).
pub fn is_structural_path(text: &str) -> bool {
    parse(text, false).is_ok_and(|specs| {
        specs.iter().all(|s| {
            matches!(&s.target, SpecTarget::Structural(path)
                if path.field.is_some() || !path.group_path.is_empty() || looks_like_segment(&path.name))
        })
    })
}

fn looks_like_segment(name: &str) -> bool {
    name.len() == 3
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn parse_alternative(text: &str, extract_default: bool) -> Result<Spec, SyntaxError> {
    let mut body = text;
    let mut extract_multiple = extract_default;
    let mut retain_empty = false;
    loop {
        if let Some(rest) = body.strip_suffix('*') {
            extract_multiple = true;
            body = rest.trim_end();
        } else if let Some(rest) = body.strip_suffix('&') {
            retain_empty = true;
            body = rest.trim_end();
        } else {
            break;
        }
    }
    if body.is_empty() {
        return Err(SyntaxError::new(format!("alternative '{text}' is empty")));
    }

    let (target, use_group) = match body.strip_prefix('$') {
        Some(rest) => parse_fetch(rest)?,
        None => (SpecTarget::Structural(parse_path(body)?), false),
    };
    Ok(Spec {
        target,
        extract_multiple,
        retain_empty,
        use_group,
    })
}

fn parse_fetch(text: &str) -> Result<(SpecTarget, bool), SyntaxError> {
    let (name_part, key) = match text.split_once(':') {
        Some((name, key)) => (name.trim(), Some(key.trim())),
        None => (text.trim(), None),
    };
    let (binding, use_group) = match name_part.strip_suffix("(group)") {
        Some(name) => (name, true),
        None => (name_part, false),
    };
    check_identifier(binding)?;
    if let Some(key) = key {
        check_identifier(key)?;
    }
    Ok((
        SpecTarget::Fetch {
            binding: binding.to_owned(),
            key: key.map(str::to_owned),
        },
        use_group,
    ))
}

fn parse_path(text: &str) -> Result<SourcePath, SyntaxError> {
    let (relative, body) = match text.strip_prefix('.') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let tokens: Vec<&str> = body.split('.').map(str::trim).collect();
    let names = tokens
        .iter()
        .take_while(|t| !t.starts_with(|c: char| c.is_ascii_digit()))
        .count();
    if names == 0 {
        return Err(SyntaxError::new(format!("'{text}' has no segment or binding name")));
    }
    if names > 1 && !relative {
        return Err(SyntaxError::new(format!(
            "group path in '{text}' must start with '.'"
        )));
    }
    for name in &tokens[..names] {
        check_identifier(name)?;
    }

    let indices = &tokens[names..];
    if indices.len() > 3 {
        return Err(SyntaxError::new(format!(
            "'{text}' addresses deeper than subcomponent level"
        )));
    }
    let (field, repetition) = match indices.first() {
        Some(token) => {
            let (field, repetition) = parse_field_token(token)?;
            (Some(field), repetition)
        }
        None => (None, None),
    };
    let component = indices.get(1).map(|t| parse_index(t)).transpose()?;
    let subcomponent = indices.get(2).map(|t| parse_index(t)).transpose()?;

    Ok(SourcePath {
        group_path: tokens[..names - 1].iter().map(|t| (*t).to_owned()).collect(),
        name: tokens[names - 1].to_owned(),
        field,
        repetition,
        component,
        subcomponent,
    })
}

fn parse_field_token(token: &str) -> Result<(usize, Option<usize>), SyntaxError> {
    match token.split_once('(') {
        Some((field, rest)) => {
            let repetition = rest
                .strip_suffix(')')
                .ok_or_else(|| SyntaxError::new(format!("unclosed repetition in '{token}'")))?;
            Ok((parse_index(field)?, Some(parse_index(repetition)?)))
        }
        None => Ok((parse_index(token)?, None)),
    }
}

fn parse_index(token: &str) -> Result<usize, SyntaxError> {
    match token.trim().parse::<usize>() {
        Ok(index) if index > 0 => Ok(index),
        _ => Err(SyntaxError::new(format!(
            "'{token}' is not a 1-based index"
        ))),
    }
}

pub(crate) fn check_identifier(name: &str) -> Result<(), SyntaxError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SyntaxError::new(format!("'{name}' is not a valid name")))
    }
}

/// The group instance the current occurrence lives in, if one is bound.
pub(crate) fn current_scope(context: &Context) -> Option<StructureHandle> {
    match context.value(GROUP_SCOPE)? {
        Value::Scalar(Scalar::Group(handle)) => Some(*handle),
        _ => None,
    }
}

impl Spec {
    pub fn target(&self) -> &SpecTarget {
        &self.target
    }

    pub fn extract_multiple(&self) -> bool {
        self.extract_multiple
    }

    pub fn retain_empty(&self) -> bool {
        self.retain_empty
    }

    pub fn use_group(&self) -> bool {
        self.use_group
    }

    /// Resolves this alternative. Never fails: anything missing is [`Value::Absent`].
    ///
    /// Several matches give a [`Value::List`] in source order when `extract_multiple` is set,
    /// otherwise the first match.
    pub fn resolve(&self, source: &Message, context: &Context) -> Value {
        let items = match &self.target {
            SpecTarget::Structural(path) => self.resolve_path(path, source, context),
            SpecTarget::Fetch { binding, key } => self.fetch(binding, key.as_deref(), context),
        };

        let mut items: Vec<Value> = items
            .into_iter()
            .filter(|v| !v.is_absent() && (self.retain_empty || !v.is_empty()))
            .collect();
        match items.len() {
            0 => Value::Absent,
            1 => items.remove(0),
            _ if self.extract_multiple => Value::List(items),
            _ => items.remove(0),
        }
    }

    fn resolve_path(&self, path: &SourcePath, source: &Message, context: &Context) -> Vec<Value> {
        if path.group_path.is_empty() {
            if let Some(bound) = context.value(&path.name) {
                return bound
                    .clone()
                    .into_items()
                    .into_iter()
                    .flat_map(|item| self.address_bound(item, path, source))
                    .collect();
            }
        }

        let scope = current_scope(context).unwrap_or_else(|| source.root());
        source
            .find_segments(scope, &path.group_path, &path.name)
            .into_iter()
            .flat_map(|segment| self.address_segment(segment, path, source))
            .collect()
    }

    fn address_bound(&self, item: Value, path: &SourcePath, source: &Message) -> Vec<Value> {
        let indexed = path.field.is_some();
        match item {
            Value::Scalar(Scalar::Segment(segment)) => self.address_segment(segment, path, source),
            Value::Scalar(Scalar::Field(field)) => vec![self.address_field(&field, path)],
            Value::Scalar(Scalar::Text(text)) if indexed => {
                vec![self.address_field(&FieldValue::parse_field(&text), path)]
            }
            other if !indexed => vec![other],
            _ => Vec::new(),
        }
    }

    fn address_segment(&self, segment: StructureHandle, path: &SourcePath, source: &Message) -> Vec<Value> {
        let Some(field) = path.field else {
            return vec![Value::segment(segment)];
        };
        let Some(repetitions) = source.field(segment, field) else {
            return Vec::new();
        };
        let selected: Vec<&FieldValue> = match path.repetition {
            Some(repetition) => repetitions.get(repetition - 1).into_iter().collect(),
            None if self.extract_multiple => repetitions.iter().collect(),
            None => repetitions.first().into_iter().collect(),
        };
        selected
            .into_iter()
            .map(|repetition| narrow(repetition, path.component, path.subcomponent))
            .collect()
    }

    /// Bound field values are addressed one level down: the first index selects a component
    /// of a field, or a subcomponent of a component.
    fn address_field(&self, field: &FieldValue, path: &SourcePath) -> Value {
        match field.granularity() {
            Granularity::Field if path.subcomponent.is_none() => {
                narrow(field, path.field, path.component)
            }
            Granularity::Component if path.component.is_none() => match path.field {
                Some(subcomponent) => narrow(field, Some(1), Some(subcomponent)),
                None => narrow(field, None, None),
            },
            Granularity::Subcomponent if path.field.unwrap_or(1) == 1 && path.component.is_none() => {
                narrow(field, None, None)
            }
            _ => Value::Absent,
        }
    }

    fn fetch(&self, binding: &str, key: Option<&str>, context: &Context) -> Vec<Value> {
        let name = if self.use_group {
            match context.value(GROUP_ID).and_then(Value::to_text) {
                Some(group_id) => format!("{binding}_{group_id}"),
                None => return Vec::new(),
            }
        } else {
            binding.to_owned()
        };
        let Some(value) = context.value(&name) else {
            return Vec::new();
        };

        let items = value.clone().into_items();
        match key {
            None => items,
            Some(key) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Map(mut map) => map.remove(key),
                    _ => None,
                })
                .collect(),
        }
    }
}

fn narrow(field: &FieldValue, component: Option<usize>, subcomponent: Option<usize>) -> Value {
    let narrowed = match (component, subcomponent) {
        (None, _) => Some(field.clone()),
        (Some(c), None) => field.component_at(c),
        (Some(c), Some(s)) => field.subcomponent_at(c, s),
    };
    narrowed.map_or(Value::Absent, Value::field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvaluationResult;
    use crate::testing::{parse as parse_message, ORU};
    use std::collections::BTreeMap;

    fn one(text: &str) -> Spec {
        let mut specs = parse(text, false).expect("valid spec");
        assert_eq!(specs.len(), 1);
        specs.remove(0)
    }

    fn text_of(value: &Value) -> Option<String> {
        value.to_text()
    }

    #[test]
    fn parses_modifiers_in_either_order() {
        for text in ["OBX.5*&", "OBX.5&*"] {
            let spec = one(text);
            assert!(spec.extract_multiple());
            assert!(spec.retain_empty());
        }
        assert!(!one("OBX.5").extract_multiple());
        assert!(parse("OBX.5", true).expect("spec")[0].extract_multiple());
    }

    #[test]
    fn parses_group_paths_and_repetitions() {
        let spec = one(".ORDER_OBSERVATION.OBSERVATION.OBX.3(2).1.2");
        let SpecTarget::Structural(path) = spec.target() else {
            panic!("expected structural spec");
        };
        assert_eq!(path.group_path, vec!["ORDER_OBSERVATION", "OBSERVATION"]);
        assert_eq!(path.name, "OBX");
        assert_eq!(path.field, Some(3));
        assert_eq!(path.repetition, Some(2));
        assert_eq!(path.component, Some(1));
        assert_eq!(path.subcomponent, Some(2));
    }

    #[test]
    fn parses_fetch_specs() {
        let spec = one("$Patient(group):reference");
        assert!(spec.use_group());
        assert_eq!(
            spec.target(),
            &SpecTarget::Fetch {
                binding: "Patient".into(),
                key: Some("reference".into())
            }
        );
        assert_eq!(parse("PID.3 | $ident", false).expect("alternatives").len(), 2);
    }

    #[test]
    fn rejects_malformed_specs() {
        for text in ["", "PID.0", "PID.x", "PATIENT.PID.3", "PID.3(2", "PID.1.2.3.4", "$", "PID.3|"] {
            assert!(parse(text, false).is_err(), "'{text}' should not parse");
        }
    }

    #[test]
    fn recognises_structural_paths() {
        assert!(is_structural_path("PID.5"));
        assert!(is_structural_path("MSH"));
        assert!(is_structural_path(".PATIENT.PID"));
        assert!(!is_structural_path("final"));
        assert!(!is_structural_path("$Patient"));
    }

    #[test]
    fn missing_locations_are_absent() {
        let message = parse_message(ORU);
        let context = Context::new();
        for text in ["ZZZ.1", "PID.99", "PID.5.9", ".NOPE.PID.3", "PID.3(5)"] {
            assert_eq!(one(text).resolve(&message, &context), Value::Absent, "{text}");
        }
    }

    #[test]
    fn addresses_bound_segments_and_fields() {
        let message = parse_message(ORU);
        let pid = message.find_segments(message.root(), &["PATIENT_RESULT", "PATIENT"], "PID")[0];
        let context = Context::new().with(EvaluationResult::new("PID", Value::segment(pid)));

        assert_eq!(text_of(&one("PID.5.2").resolve(&message, &context)), Some("JANE".into()));
        assert_eq!(
            text_of(&one("PID.3(2).4").resolve(&message, &context)),
            Some("NHS".into())
        );

        let multiple = one("PID.3.1*").resolve(&message, &context);
        let ids: Vec<String> = multiple.into_items().iter().filter_map(Value::to_text).collect();
        assert_eq!(ids, vec!["12345", "99"]);

        let name = one("PID.5").resolve(&message, &context);
        let context = context.with(EvaluationResult::new("XPN", name));
        assert_eq!(text_of(&one("XPN.1").resolve(&message, &context)), Some("DOE".into()));
        assert_eq!(text_of(&one("XPN").resolve(&message, &context)), Some("DOE^JANE^Q".into()));
    }

    #[test]
    fn structural_search_honours_group_scope() {
        let message = parse_message(ORU);
        let orders = message.group_instances(message.root(), &["PATIENT_RESULT", "ORDER_OBSERVATION"]);
        let context = Context::new().with(EvaluationResult::new(
            GROUP_SCOPE,
            Value::Scalar(Scalar::Group(orders[0])),
        ));

        let codes = one(".OBSERVATION.OBX.3.1*").resolve(&message, &context);
        let codes: Vec<String> = codes.into_items().iter().filter_map(Value::to_text).collect();
        assert_eq!(codes, vec!["2093-3", "2571-8"]);

        let first = one(".OBSERVATION.OBX.3.1").resolve(&message, &context);
        assert_eq!(first.to_text(), Some("2093-3".into()));
    }

    #[test]
    fn blank_values_are_absent_unless_retained() {
        let message = parse_message("MSH|^~\\&\rPID|1||||^^^\r");
        let pid = message.child_segments(message.root(), "PID")[0];
        let context = Context::new().with(EvaluationResult::new("PID", Value::segment(pid)));

        assert_eq!(one("PID.5").resolve(&message, &context), Value::Absent);
        let retained = one("PID.5&").resolve(&message, &context);
        assert!(!retained.is_absent());
        assert!(retained.is_empty());
    }

    #[test]
    fn fetches_keys_from_maps_and_group_bindings() {
        let message = parse_message(ORU);
        let patient = Value::Map(BTreeMap::from([(
            "reference".to_owned(),
            Value::text("Patient/p1"),
        )]));
        let context = Context::new().extend(vec![
            EvaluationResult::new(GROUP_ID, Value::text("PATIENT_RESULT[0]")),
            EvaluationResult::new("Patient_PATIENT_RESULT[0]", patient.clone()),
            EvaluationResult::new("Patient", Value::List(vec![patient.clone(), patient])),
        ]);

        assert_eq!(
            one("$Patient(group):reference").resolve(&message, &context),
            Value::text("Patient/p1")
        );
        let all = one("$Patient:reference*").resolve(&message, &context);
        assert_eq!(all.into_items().len(), 2);
        assert_eq!(one("$Missing:reference").resolve(&message, &context), Value::Absent);
    }
}

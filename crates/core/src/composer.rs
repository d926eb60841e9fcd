//! Resource assembly.
//!
//! Composition runs in two passes over every resource template of a message template:
//!
//! 1. every occurrence of every template evaluates its non-deferred fields; the occurrences
//!    that survive are registered under their resource name;
//! 2. the registry is bound into each occurrence's context and the deferred
//!    (`evaluateLater`) fields are evaluated.
//!
//! A registry entry is a map with `id`, `resourceType` and `reference`. It is bound as
//! `<resourceName>` (every occurrence) and as `<resourceName>_<GROUP_ID>` (the occurrences of
//! one correlation group), a single map for one occurrence and a list for several.
//!
//! A required field that produces nothing discards its occurrence and nothing else.

use crate::constants::{GROUP_ID, GROUP_SCOPE, ID_FIELD};
use crate::context::{merge_side_resources, Context, EvaluationResult, SideResource};
use crate::engine::Session;
use crate::error::{ExtractionError, RequiredFieldMissing};
use crate::expression::Expression;
use crate::extraction::{extract, SegmentGroup};
use crate::template::{MessageTemplate, ResourceTemplate, TemplateDefinition};
use fhir::ResourceHandle;
use h2f_types::{Scalar, Value};
use std::collections::BTreeMap;

/// One occurrence of a resource template between the two passes.
struct Draft<'t> {
    template: &'t ResourceTemplate,
    definition: &'t TemplateDefinition,
    group_id: String,
    context: Context,
    base: EvaluationResult,
    id: String,
    body: BTreeMap<String, Value>,
    side_resources: Vec<SideResource>,
}

impl Draft<'_> {
    fn registry_entry(&self) -> Value {
        let handle = ResourceHandle::new(
            self.definition.resource_type().clone(),
            self.id.clone(),
            BTreeMap::new(),
        );
        Value::Map(BTreeMap::from([
            ("id".to_owned(), Value::text(&self.id)),
            ("resourceType".to_owned(), Value::text(handle.resource_type())),
            ("reference".to_owned(), Value::text(handle.reference())),
        ]))
    }
}

/// Composes every resource of `message`: top-level resources in template order, each
/// followed by the standalone resources its references produced.
pub fn compose_message<'t>(session: &Session<'t>, message: &'t MessageTemplate) -> Vec<ResourceHandle> {
    let root = Context::new();
    let drafts: Vec<Draft<'_>> = message
        .resources()
        .iter()
        .flat_map(|template| first_pass(session, template, &root))
        .collect();

    let registry = registry_bindings(&drafts);
    let mut output = Vec::new();
    for draft in drafts {
        let Some((handle, side_resources)) = second_pass(session, draft, &registry) else {
            continue;
        };
        output.push(handle);
        output.extend(
            side_resources
                .into_iter()
                .filter(|side| side.registered)
                .map(|side| side.handle),
        );
    }
    output
}

fn first_pass<'t>(
    session: &Session<'t>,
    template: &'t ResourceTemplate,
    context: &Context,
) -> Vec<Draft<'t>> {
    let Some(definition) = session.templates.definition(template.resource_path()) else {
        let err = ExtractionError::UnknownTemplate(template.resource_path().to_owned());
        tracing::warn!(resource = template.resource_name(), error = %err, "resource skipped");
        return Vec::new();
    };
    let binding = template.binding();

    let mut groups: Vec<SegmentGroup> = extract(binding, session.source)
        .into_iter()
        .filter(|group| {
            let empty = binding.ignore_empty && session.source.is_segment_empty(group.primary);
            if empty {
                tracing::debug!(
                    resource = template.resource_name(),
                    group_id = %group.group_id,
                    "empty primary segment skipped"
                );
            }
            !empty
        })
        .collect();
    if !binding.repeats {
        groups.truncate(1);
    }

    let mut drafts = Vec::new();
    for group in groups {
        let reserved = session.ids.next(definition.resource_type().as_str());
        let base = EvaluationResult::new(&binding.primary_segment, Value::segment(group.primary));
        let context = occurrence_context(context, &group, &base);
        let mut body = BTreeMap::new();
        let mut side_resources = Vec::new();
        let fields = definition.fields().iter().filter(|f| !f.evaluate_later);
        if let Err(missing) = evaluate_fields(session, fields, &context, &base, &mut body, &mut side_resources) {
            tracing::debug!(
                resource = template.resource_name(),
                group_id = %group.group_id,
                %missing,
                "occurrence discarded"
            );
            continue;
        }
        if body.is_empty() && !definition.has_deferred_fields() {
            continue;
        }

        let id = resource_id(&body, reserved);
        drafts.push(Draft {
            template,
            definition,
            group_id: group.group_id,
            context,
            base,
            id,
            body,
            side_resources,
        });
    }
    drafts
}

fn second_pass(
    session: &Session<'_>,
    mut draft: Draft<'_>,
    registry: &[EvaluationResult],
) -> Option<(ResourceHandle, Vec<SideResource>)> {
    if draft.definition.has_deferred_fields() {
        let context = draft.context.extend(registry.to_vec());
        let fields = draft.definition.fields().iter().filter(|f| f.evaluate_later);
        let evaluated = evaluate_fields(
            session,
            fields,
            &context,
            &draft.base,
            &mut draft.body,
            &mut draft.side_resources,
        );
        if let Err(missing) = evaluated {
            tracing::debug!(
                resource = draft.template.resource_name(),
                group_id = %draft.group_id,
                %missing,
                "occurrence discarded"
            );
            return None;
        }
    }
    if draft.body.is_empty() {
        return None;
    }

    let handle = ResourceHandle::new(draft.definition.resource_type().clone(), draft.id, draft.body);
    Some((handle, draft.side_resources))
}

/// Bindings of one occurrence: additional segments, `GROUP_ID`, `GROUP_SCOPE` and the primary
/// segment under its own name.
fn occurrence_context(context: &Context, group: &SegmentGroup, base: &EvaluationResult) -> Context {
    let mut bindings: Vec<EvaluationResult> = group
        .additional
        .iter()
        .map(|(name, handles)| {
            let value = match handles.as_slice() {
                [] => Value::Absent,
                [only] => Value::segment(*only),
                many => Value::List(many.iter().copied().map(Value::segment).collect()),
            };
            EvaluationResult::new(name, value)
        })
        .collect();
    bindings.push(EvaluationResult::new(GROUP_ID, Value::text(&group.group_id)));
    bindings.push(EvaluationResult::new(
        GROUP_SCOPE,
        Value::Scalar(Scalar::Group(group.scope)),
    ));
    bindings.push(base.clone());
    context.extend(bindings)
}

fn registry_bindings(drafts: &[Draft<'_>]) -> Vec<EvaluationResult> {
    let mut entries: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for draft in drafts.iter().filter(|d| !d.body.is_empty()) {
        let name = draft.template.resource_name();
        let entry = draft.registry_entry();
        entries
            .entry(format!("{name}_{}", draft.group_id))
            .or_default()
            .push(entry.clone());
        entries.entry(name.to_owned()).or_default().push(entry);
    }

    entries
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                values.swap_remove(0)
            } else {
                Value::List(values)
            };
            EvaluationResult::new(name, value)
        })
        .collect()
}

fn evaluate_fields<'e>(
    session: &Session<'_>,
    fields: impl Iterator<Item = &'e Expression>,
    context: &Context,
    base: &EvaluationResult,
    body: &mut BTreeMap<String, Value>,
    side_resources: &mut Vec<SideResource>,
) -> Result<(), RequiredFieldMissing> {
    for field in fields {
        let (value, produced) = session.evaluate(field, context, base)?.into_parts();
        merge_side_resources(side_resources, produced);
        if !value.is_empty() {
            body.insert(field.name.clone(), value);
        }
    }
    Ok(())
}

/// The produced `id` field when it is a scalar, otherwise the id reserved for the occurrence.
///
/// Ids are reserved before any field runs, so a discarded occurrence still uses up its slot.
fn resource_id(body: &BTreeMap<String, Value>, reserved: String) -> String {
    body.get(ID_FIELD)
        .and_then(|id| match id {
            Value::Scalar(scalar) => scalar.to_text(),
            _ => None,
        })
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .unwrap_or(reserved)
}

// ============================================================================
// Inner templates
// ============================================================================

/// Composes the template at `path` against `base` inside `context`.
///
/// Deferred fields of inner templates run right after the others: an inner template is
/// composed in whichever pass its owning field runs in.
fn compose_inner(
    session: &Session<'_>,
    path: &str,
    context: &Context,
    base: &EvaluationResult,
) -> Option<(ResourceHandle, Vec<SideResource>)> {
    let Some(definition) = session.templates.definition(path) else {
        let err = ExtractionError::UnknownTemplate(path.to_owned());
        tracing::warn!(error = %err, "inner template skipped");
        return None;
    };

    let reserved = session.ids.next(definition.resource_type().as_str());
    let mut body = BTreeMap::new();
    let mut side_resources = Vec::new();
    let (immediate, deferred): (Vec<&Expression>, Vec<&Expression>) =
        definition.fields().iter().partition(|f| !f.evaluate_later);
    let evaluated = evaluate_fields(
        session,
        immediate.into_iter().chain(deferred),
        context,
        base,
        &mut body,
        &mut side_resources,
    );
    if let Err(missing) = evaluated {
        tracing::debug!(template = path, %missing, "inner template left empty");
        return None;
    }
    if body.is_empty() {
        return None;
    }

    let id = resource_id(&body, reserved);
    Some((
        ResourceHandle::new(definition.resource_type().clone(), id, body),
        side_resources,
    ))
}

/// `Resource` fields: the inner body becomes the field value.
pub(crate) fn embed(
    session: &Session<'_>,
    path: &str,
    context: &Context,
    base: &EvaluationResult,
) -> (Value, Vec<SideResource>) {
    let Some((handle, inner)) = compose_inner(session, path, context, base) else {
        return (Value::Absent, Vec::new());
    };
    let value = Value::Map(handle.body().clone());
    let mut side_resources = vec![SideResource {
        handle,
        registered: false,
    }];
    merge_side_resources(&mut side_resources, inner);
    (value, side_resources)
}

/// `Reference` fields: the inner resource is emitted on its own and the field points at it.
pub(crate) fn refer(
    session: &Session<'_>,
    path: &str,
    context: &Context,
    base: &EvaluationResult,
) -> (Value, Vec<SideResource>) {
    let Some((handle, inner)) = compose_inner(session, path, context, base) else {
        return (Value::Absent, Vec::new());
    };
    let value = handle.reference_value();
    let mut side_resources = vec![SideResource {
        handle,
        registered: true,
    }];
    merge_side_resources(&mut side_resources, inner);
    (value, side_resources)
}

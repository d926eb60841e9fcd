//! Evaluation results and the layered binding context.
//!
//! A [`Context`] is a persistent stack of binding layers. Extending it pushes one layer on top
//! of a shared parent and returns a new snapshot, so every nested evaluation can add bindings
//! without copying or mutating what its caller sees. Lookups walk from the innermost layer
//! outwards; within a layer the last binding with a name wins.

use fhir::ResourceHandle;
use h2f_types::Value;
use std::sync::Arc;

/// A resource produced while evaluating a field, carried up to the composer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideResource {
    pub handle: ResourceHandle,
    /// Registered resources are emitted as standalone output; unregistered ones only exist
    /// embedded in their parent.
    pub registered: bool,
}

/// Adds side resources to `into`, skipping identities it already holds.
///
/// A resource seen first as embedded and later as registered becomes registered.
pub fn merge_side_resources(into: &mut Vec<SideResource>, from: impl IntoIterator<Item = SideResource>) {
    for resource in from {
        match into
            .iter_mut()
            .find(|r| r.handle.identity() == resource.handle.identity())
        {
            Some(existing) => existing.registered |= resource.registered,
            None => into.push(resource),
        }
    }
}

/// Outcome of evaluating one expression. Immutable once built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvaluationResult {
    name: String,
    value: Value,
    side_resources: Vec<SideResource>,
}

impl EvaluationResult {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            side_resources: Vec::new(),
        }
    }

    /// The explicit empty marker: bound, but holding nothing.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Value::Absent)
    }

    pub fn with_side_resources(mut self, side_resources: Vec<SideResource>) -> Self {
        self.side_resources = side_resources;
        self
    }

    /// The same result bound under another name.
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn side_resources(&self) -> &[SideResource] {
        &self.side_resources
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_parts(self) -> (Value, Vec<SideResource>) {
        (self.value, self.side_resources)
    }
}

#[derive(Debug)]
struct Layer {
    bindings: Vec<EvaluationResult>,
    parent: Option<Arc<Layer>>,
}

/// Persistent name → [`EvaluationResult`] bindings.
#[derive(Clone, Debug, Default)]
pub struct Context {
    top: Option<Arc<Layer>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new snapshot with `bindings` layered on top. Empty input returns a cheap clone.
    pub fn extend(&self, bindings: Vec<EvaluationResult>) -> Context {
        if bindings.is_empty() {
            return self.clone();
        }
        Context {
            top: Some(Arc::new(Layer {
                bindings,
                parent: self.top.clone(),
            })),
        }
    }

    /// A new snapshot with one binding on top.
    pub fn with(&self, result: EvaluationResult) -> Context {
        self.extend(vec![result])
    }

    pub fn get(&self, name: &str) -> Option<&EvaluationResult> {
        let mut layer = self.top.as_deref();
        while let Some(current) = layer {
            if let Some(found) = current.bindings.iter().rev().find(|b| b.name == name) {
                return Some(found);
            }
            layer = current.parent.as_deref();
        }
        None
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).map(EvaluationResult::value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of layers, innermost included.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut layer = self.top.as_deref();
        while let Some(current) = layer {
            depth += 1;
            layer = current.parent.as_deref();
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2f_types::NonEmptyText;
    use std::collections::BTreeMap;

    #[test]
    fn inner_layers_shadow_outer_ones() {
        let outer = Context::new().with(EvaluationResult::new("code", Value::text("outer")));
        let inner = outer.with(EvaluationResult::new("code", Value::text("inner")));

        assert_eq!(inner.value("code"), Some(&Value::text("inner")));
        assert_eq!(outer.value("code"), Some(&Value::text("outer")));
        assert_eq!(inner.depth(), 2);
    }

    #[test]
    fn empty_marker_is_bound_but_empty() {
        let context = Context::new().with(EvaluationResult::empty("missing"));
        let bound = context.get("missing").expect("marker bound");
        assert!(bound.is_empty());
        assert!(context.get("other").is_none());
    }

    #[test]
    fn later_binding_in_a_layer_wins() {
        let context = Context::new().extend(vec![
            EvaluationResult::new("x", Value::text("1")),
            EvaluationResult::new("x", Value::text("2")),
        ]);
        assert_eq!(context.value("x"), Some(&Value::text("2")));
        assert_eq!(context.extend(Vec::new()).depth(), 1);
    }

    #[test]
    fn merging_side_resources_deduplicates_and_upgrades() {
        let handle = ResourceHandle::new(
            NonEmptyText::new("Practitioner").expect("type"),
            "pr-1",
            BTreeMap::new(),
        );
        let mut side = vec![SideResource {
            handle: handle.clone(),
            registered: false,
        }];
        merge_side_resources(
            &mut side,
            [SideResource {
                handle,
                registered: true,
            }],
        );
        assert_eq!(side.len(), 1);
        assert!(side[0].registered);
    }
}

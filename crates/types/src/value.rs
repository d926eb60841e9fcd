//! The value model shared by the source tree, the evaluation engine and the output sink.
//!
//! A [`Value`] is either absent, a scalar, a list or a map. Absence is distinct from an empty
//! string: the resolver normalises blank source text to [`Value::Absent`] unless a spec asks
//! for blanks to be retained, and absent entries are dropped when values are aggregated.
//!
//! Source locations are carried as [`FieldValue`]s: owned copies of a single field repetition
//! together with the [`Granularity`] they were extracted at. Keeping the granularity lets
//! condition evaluation compare "the whole field" and "its first component" independently of
//! how the value was extracted.

use std::collections::BTreeMap;

/// Arena index of a group or segment inside a parsed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructureHandle(pub usize);

/// Levels of a source location, coarsest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Segment,
    Field,
    Component,
    Subcomponent,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Granularity::Segment => "SEGMENT",
            Granularity::Field => "FIELD",
            Granularity::Component => "COMPONENT",
            Granularity::Subcomponent => "SUBCOMPONENT",
        };
        f.write_str(name)
    }
}

/// One repetition of a source field, or a component/subcomponent narrowed out of one.
///
/// `components` always holds the subcomponents of each component. A component-level value
/// holds exactly one component; a subcomponent-level value holds one component with one
/// subcomponent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldValue {
    granularity: Granularity,
    components: Vec<Vec<String>>,
}

impl FieldValue {
    /// A whole field repetition.
    pub fn field(components: Vec<Vec<String>>) -> Self {
        Self {
            granularity: Granularity::Field,
            components,
        }
    }

    /// A single component with its subcomponents.
    pub fn component(subcomponents: Vec<String>) -> Self {
        Self {
            granularity: Granularity::Component,
            components: vec![subcomponents],
        }
    }

    /// A single subcomponent.
    pub fn subcomponent(text: impl Into<String>) -> Self {
        Self {
            granularity: Granularity::Subcomponent,
            components: vec![vec![text.into()]],
        }
    }

    /// Splits canonical `^`/`&` delimited text into a field value.
    pub fn parse_field(text: &str) -> Self {
        Self::field(
            text.split('^')
                .map(|c| c.split('&').map(str::to_owned).collect())
                .collect(),
        )
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn components(&self) -> &[Vec<String>] {
        &self.components
    }

    /// True when every subcomponent is blank.
    pub fn is_blank(&self) -> bool {
        self.components
            .iter()
            .flatten()
            .all(|s| s.trim().is_empty())
    }

    /// Canonical text at this value's own granularity, with trailing empty parts removed.
    pub fn text(&self) -> String {
        let mut components: Vec<String> = self
            .components
            .iter()
            .map(|subs| join_trimmed(subs, '&'))
            .collect();
        while components.last().is_some_and(|c| c.is_empty()) {
            components.pop();
        }
        components.join("^")
    }

    /// Narrows to a component (1-based) of a field-level value.
    ///
    /// A component-level value only answers for index 1 (itself); a subcomponent-level value
    /// never answers because it exists at a finer granularity.
    pub fn component_at(&self, index: usize) -> Option<FieldValue> {
        match self.granularity {
            Granularity::Field => self
                .components
                .get(index.checked_sub(1)?)
                .map(|subs| FieldValue::component(subs.clone())),
            Granularity::Component if index == 1 => Some(self.clone()),
            _ => None,
        }
    }

    /// Narrows to a subcomponent (1-based component, 1-based subcomponent).
    pub fn subcomponent_at(&self, component: usize, subcomponent: usize) -> Option<FieldValue> {
        let subs = match self.granularity {
            Granularity::Field => self.components.get(component.checked_sub(1)?)?,
            Granularity::Component if component == 1 => self.components.first()?,
            Granularity::Subcomponent if component == 1 && subcomponent == 1 => {
                return Some(self.clone());
            }
            _ => return None,
        };
        subs.get(subcomponent.checked_sub(1)?)
            .map(|s| FieldValue::subcomponent(s.clone()))
    }

    /// Views this value at the requested granularity.
    ///
    /// Returns `None` when the requested granularity is coarser than the value's own one: a
    /// value that only exists as a component cannot answer for the whole field.
    pub fn at(&self, granularity: Granularity, component: usize, subcomponent: usize) -> Option<FieldValue> {
        if granularity < self.granularity {
            return None;
        }
        match granularity {
            Granularity::Segment => None,
            Granularity::Field => Some(self.clone()),
            Granularity::Component => self.component_at(component),
            Granularity::Subcomponent => self.subcomponent_at(component, subcomponent),
        }
    }
}

fn join_trimmed(parts: &[String], separator: char) -> String {
    let end = parts
        .iter()
        .rposition(|p| !p.is_empty())
        .map_or(0, |i| i + 1);
    parts[..end].join(&separator.to_string())
}

/// Leaf values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scalar {
    Text(String),
    Boolean(bool),
    Integer(i64),
    /// Decimal kept as validated text so no precision is lost.
    Decimal(String),
    Field(FieldValue),
    Segment(StructureHandle),
    Group(StructureHandle),
}

impl Scalar {
    /// Text rendering of the scalar, `None` for structure handles.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Scalar::Text(s) | Scalar::Decimal(s) => Some(s.clone()),
            Scalar::Boolean(b) => Some(b.to_string()),
            Scalar::Integer(i) => Some(i.to_string()),
            Scalar::Field(f) => Some(f.text()),
            Scalar::Segment(_) | Scalar::Group(_) => None,
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Scalar::Text(s) => s.trim().is_empty(),
            Scalar::Field(f) => f.is_blank(),
            _ => false,
        }
    }
}

/// The common currency of the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Value {
    #[default]
    Absent,
    Scalar(Scalar),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn text(text: impl Into<String>) -> Self {
        Value::Scalar(Scalar::Text(text.into()))
    }

    pub fn field(field: FieldValue) -> Self {
        Value::Scalar(Scalar::Field(field))
    }

    pub fn segment(handle: StructureHandle) -> Self {
        Value::Scalar(Scalar::Segment(handle))
    }

    /// Builds a list from items, dropping empty ones; no surviving items gives `Absent`.
    pub fn from_items(items: impl IntoIterator<Item = Value>) -> Self {
        let items: Vec<Value> = items.into_iter().filter(|v| !v.is_empty()).collect();
        if items.is_empty() {
            Value::Absent
        } else {
            Value::List(items)
        }
    }

    /// True for absence, blank text, and lists or maps with no non-empty entries.
    ///
    /// Blank text only arises when a spec retained it explicitly; it still counts as empty
    /// for aggregation and required-field checks.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Absent => true,
            Value::Scalar(s) => s.is_blank(),
            Value::List(items) => items.iter().all(Value::is_empty),
            Value::Map(map) => map.values().all(Value::is_empty),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    /// Splits a value into its items: lists are flattened one level, absence yields nothing.
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Value::Absent => Vec::new(),
            Value::List(items) => items,
            other => vec![other],
        }
    }

    /// The first non-empty item (the value itself when it is not a list).
    pub fn first(&self) -> Option<&Value> {
        match self {
            Value::List(items) => items.iter().find(|v| !v.is_empty()),
            Value::Absent => None,
            other if other.is_empty() => None,
            other => Some(other),
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Text of the first non-empty scalar.
    pub fn to_text(&self) -> Option<String> {
        match self.first()? {
            Value::Scalar(s) => s.to_text(),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::text(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Scalar(Scalar::Boolean(value))
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_text_trims_trailing_empty_parts() {
        let field = FieldValue::parse_field("A^B&&^^");
        assert_eq!(field.text(), "A^B");
    }

    #[test]
    fn component_value_cannot_answer_for_the_whole_field() {
        let field = FieldValue::parse_field("A^B^C");
        let first = field.component_at(1).expect("component 1");

        assert_eq!(first.text(), "A");
        assert!(first.at(Granularity::Field, 1, 1).is_none());
        assert_eq!(
            first.at(Granularity::Component, 1, 1).map(|f| f.text()),
            Some("A".to_owned())
        );
    }

    #[test]
    fn field_narrows_to_subcomponents() {
        let field = FieldValue::parse_field("A&x^B");
        let sub = field
            .at(Granularity::Subcomponent, 1, 2)
            .expect("subcomponent 1.2");
        assert_eq!(sub.text(), "x");
        assert!(field.at(Granularity::Subcomponent, 3, 1).is_none());
    }

    #[test]
    fn from_items_drops_empty_entries() {
        let value = Value::from_items([Value::Absent, Value::text("a"), Value::text("  ")]);
        assert_eq!(value, Value::List(vec![Value::text("a")]));
        assert_eq!(Value::from_items(Vec::new()), Value::Absent);
    }

    #[test]
    fn blank_fields_are_empty() {
        assert!(Value::field(FieldValue::parse_field("^&^")).is_empty());
        assert!(!Value::field(FieldValue::parse_field("^x")).is_empty());
    }
}

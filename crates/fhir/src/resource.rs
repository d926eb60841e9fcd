//! Produced resources and the references that point at them.
//!
//! A [`ResourceHandle`] is one output record: its type, its id and a body of named values.
//! Handles are identified by `(type, id)`; two handles with the same identity are the same
//! resource no matter which template path produced them.

use h2f_types::{NonEmptyText, Scalar, Value};
use std::collections::BTreeMap;

/// Key that carries the `Type/id` pointer inside a reference value.
pub const REFERENCE_KEY: &str = "reference";

/// One produced resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceHandle {
    resource_type: NonEmptyText,
    id: String,
    body: BTreeMap<String, Value>,
}

impl ResourceHandle {
    pub fn new(resource_type: NonEmptyText, id: impl Into<String>, body: BTreeMap<String, Value>) -> Self {
        Self {
            resource_type,
            id: id.into(),
            body,
        }
    }

    pub fn resource_type(&self) -> &str {
        self.resource_type.as_str()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &BTreeMap<String, Value> {
        &self.body
    }

    /// Deduplication identity.
    pub fn identity(&self) -> (&str, &str) {
        (self.resource_type(), &self.id)
    }

    /// `Type/id`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Lightweight pointer value: `{ reference: "Type/id", type: "Type" }`.
    pub fn reference_value(&self) -> Value {
        Value::Map(BTreeMap::from([
            (REFERENCE_KEY.to_owned(), Value::text(self.reference())),
            ("type".to_owned(), Value::text(self.resource_type())),
        ]))
    }

    /// The body with `resourceType` and `id` filled in, as a value.
    pub fn to_value(&self) -> Value {
        let mut body = self.body.clone();
        body.insert("resourceType".to_owned(), Value::text(self.resource_type()));
        body.insert("id".to_owned(), Value::text(self.id.clone()));
        Value::Map(body)
    }

    /// JSON rendering of [`ResourceHandle::to_value`].
    pub fn to_json(&self) -> serde_json::Value {
        value_to_json(&self.to_value()).unwrap_or(serde_json::Value::Null)
    }
}

/// Converts an engine value to JSON; `None` for values with nothing to render.
///
/// Structure handles (segments and groups) never reach the output: they are evaluation-time
/// pointers into the source message.
pub fn value_to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Absent => None,
        Value::Scalar(scalar) => match scalar {
            Scalar::Text(s) => Some(serde_json::Value::String(s.clone())),
            Scalar::Boolean(b) => Some(serde_json::Value::Bool(*b)),
            Scalar::Integer(i) => Some(serde_json::Value::from(*i)),
            Scalar::Decimal(d) => Some(
                d.parse::<serde_json::Number>()
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|_| serde_json::Value::String(d.clone())),
            ),
            Scalar::Field(f) => {
                let text = f.text();
                (!text.is_empty()).then_some(serde_json::Value::String(text))
            }
            Scalar::Segment(_) | Scalar::Group(_) => None,
        },
        Value::List(items) => {
            let items: Vec<serde_json::Value> = items.iter().filter_map(value_to_json).collect();
            (!items.is_empty()).then_some(serde_json::Value::Array(items))
        }
        Value::Map(map) => {
            let object: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter_map(|(k, v)| value_to_json(v).map(|j| (k.clone(), j)))
                .collect();
            (!object.is_empty()).then_some(serde_json::Value::Object(object))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2f_types::{FieldValue, StructureHandle};

    fn handle() -> ResourceHandle {
        ResourceHandle::new(
            NonEmptyText::new("Observation").expect("type"),
            "obs-1",
            BTreeMap::from([
                ("status".to_owned(), Value::text("final")),
                ("note".to_owned(), Value::Absent),
            ]),
        )
    }

    #[test]
    fn reference_value_is_a_pointer_not_a_body() {
        let reference = handle().reference_value();
        let map = reference.as_map().expect("map");
        assert_eq!(map.get(REFERENCE_KEY), Some(&Value::text("Observation/obs-1")));
        assert!(!map.contains_key("status"));
    }

    #[test]
    fn json_rendering_skips_absent_and_structure_values() {
        let mut body = handle().body().clone();
        body.extend([
            ("segment".to_owned(), Value::segment(StructureHandle(3))),
            (
                "valueQuantity".to_owned(),
                Value::Map(BTreeMap::from([(
                    "value".to_owned(),
                    Value::Scalar(Scalar::Decimal("196.5".to_owned())),
                )])),
            ),
            (
                "code".to_owned(),
                Value::field(FieldValue::parse_field("2093-3^Cholesterol^LN")),
            ),
        ]);
        let handle = ResourceHandle::new(NonEmptyText::new("Observation").expect("type"), "obs-1", body);

        let json = handle.to_json();
        assert_eq!(json["resourceType"], "Observation");
        assert_eq!(json["id"], "obs-1");
        assert_eq!(json["status"], "final");
        assert_eq!(json["valueQuantity"]["value"], 196.5);
        assert_eq!(json["code"], "2093-3^Cholesterol^LN");
        assert!(json.get("note").is_none());
        assert!(json.get("segment").is_none());
    }
}

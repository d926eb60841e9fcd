//! FHIR `Bundle` output sink.
//!
//! The conversion engine hands over its final list of resources (top-level resources plus every
//! registered reference target). This module deduplicates them by identity, renders them as a
//! `collection` bundle in JSON or YAML, and reports references that point at nothing in the
//! bundle.

use crate::resource::{ResourceHandle, REFERENCE_KEY};
use crate::{FhirError, FhirResult};
use h2f_types::Value;
use std::collections::HashSet;

/// Output serialisation formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = FhirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(FhirError::InvalidInput(format!(
                "unknown output format '{other}' (expected json or yaml)"
            ))),
        }
    }
}

/// An ordered, deduplicated set of resources.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bundle {
    entries: Vec<ResourceHandle>,
}

impl Bundle {
    /// Builds a bundle, keeping the first resource seen for each `(type, id)`.
    pub fn from_resources(resources: impl IntoIterator<Item = ResourceHandle>) -> Self {
        let mut seen = HashSet::new();
        let entries = resources
            .into_iter()
            .filter(|r| seen.insert((r.resource_type().to_owned(), r.id().to_owned())))
            .collect();
        Self { entries }
    }

    pub fn resources(&self) -> &[ResourceHandle] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resources of one type, in bundle order.
    pub fn of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a ResourceHandle> {
        self.entries
            .iter()
            .filter(move |r| r.resource_type() == resource_type)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|r| {
                serde_json::json!({
                    "fullUrl": r.reference(),
                    "resource": r.to_json(),
                })
            })
            .collect();
        serde_json::json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": entries,
        })
    }

    /// Renders the bundle in the requested format.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] if serialisation fails.
    pub fn render(&self, format: OutputFormat) -> FhirResult<String> {
        let json = self.to_json();
        match format {
            OutputFormat::Json => serde_json::to_string_pretty(&json)
                .map_err(|e| FhirError::Translation(format!("failed to serialise bundle: {e}"))),
            OutputFormat::Yaml => Ok(serde_yaml::to_string(&json)?),
        }
    }

    /// `Type/id` references found in resource bodies that match no entry of this bundle.
    pub fn unresolved_references(&self) -> Vec<String> {
        let known: HashSet<String> = self.entries.iter().map(ResourceHandle::reference).collect();
        let mut missing = Vec::new();
        for entry in &self.entries {
            for value in entry.body().values() {
                collect_references(value, &mut missing);
            }
        }
        missing.retain(|r| !known.contains(r));
        missing.dedup();
        missing
    }
}

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Map(map) => {
            if let Some(reference) = map.get(REFERENCE_KEY).and_then(Value::to_text) {
                out.push(reference);
            }
            map.values().for_each(|v| collect_references(v, out));
        }
        Value::List(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Absent | Value::Scalar(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2f_types::NonEmptyText;
    use std::collections::BTreeMap;

    fn resource(kind: &str, id: &str, body: Vec<(&str, Value)>) -> ResourceHandle {
        ResourceHandle::new(
            NonEmptyText::new(kind).expect("type"),
            id,
            body.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
        )
    }

    #[test]
    fn deduplicates_by_identity() {
        let bundle = Bundle::from_resources([
            resource("Patient", "p1", vec![("gender", Value::text("female"))]),
            resource("Patient", "p1", vec![("gender", Value::text("male"))]),
            resource("Practitioner", "p1", vec![]),
        ]);
        assert_eq!(bundle.len(), 2);
        assert_eq!(
            bundle.resources()[0].body().get("gender"),
            Some(&Value::text("female"))
        );
    }

    #[test]
    fn reports_dangling_references() {
        let patient = resource("Patient", "p1", vec![]);
        let subject = patient.reference_value();
        let bundle = Bundle::from_resources([
            patient,
            resource(
                "Observation",
                "o1",
                vec![
                    ("subject", subject),
                    (
                        "performer",
                        Value::List(vec![Value::Map(BTreeMap::from([(
                            REFERENCE_KEY.to_owned(),
                            Value::text("Practitioner/x"),
                        )]))]),
                    ),
                ],
            ),
        ]);
        assert_eq!(bundle.unresolved_references(), vec!["Practitioner/x".to_owned()]);
    }

    #[test]
    fn renders_collection_bundle() {
        let bundle = Bundle::from_resources([resource("Patient", "p1", vec![])]);
        let json: serde_json::Value =
            serde_json::from_str(&bundle.render(OutputFormat::Json).expect("render"))
                .expect("valid json");
        assert_eq!(json["type"], "collection");
        assert_eq!(json["entry"][0]["fullUrl"], "Patient/p1");
        assert_eq!(json["entry"][0]["resource"]["resourceType"], "Patient");

        let yaml = bundle.render(OutputFormat::Yaml).expect("render yaml");
        assert!(yaml.contains("resourceType: Bundle"));
    }

    #[test]
    fn parses_output_format_names() {
        assert_eq!("YAML".parse::<OutputFormat>().expect("yaml"), OutputFormat::Yaml);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}

//! Recursive expression evaluation.
//!
//! A [`Session`] carries everything one conversion reads from: the compiled templates, the
//! leaf resolvers, the script evaluator, the id generator and the parsed message. Evaluating an
//! expression never mutates any of them; results come back as immutable
//! [`EvaluationResult`]s.
//!
//! Responsibilities:
//! - layer constants, the base value, the candidate and variables onto the inherited context
//! - pick candidates from the specs (or the base value) and honour multiplicity
//! - gate each candidate on the condition and dispatch on the expression kind
//! - downgrade leaf failures to absence and report required fields that produced nothing

use crate::binder;
use crate::composer;
use crate::context::{merge_side_resources, Context, EvaluationResult, SideResource};
use crate::error::RequiredFieldMissing;
use crate::expression::{Expression, ExpressionKind};
use crate::ids::IdGenerator;
use crate::resolvers::TypeRegistry;
use crate::script::ScriptEvaluator;
use crate::template::TemplateSet;
use h2f_types::Value;
use hl7::Message;
use std::collections::BTreeMap;

/// Read-only state shared by every evaluation of one message.
pub struct Session<'a> {
    pub(crate) templates: &'a TemplateSet,
    pub(crate) types: &'a TypeRegistry,
    pub(crate) scripts: &'a dyn ScriptEvaluator,
    pub(crate) ids: &'a IdGenerator,
    pub(crate) source: &'a Message,
}

impl<'a> Session<'a> {
    pub fn new(
        templates: &'a TemplateSet,
        types: &'a TypeRegistry,
        scripts: &'a dyn ScriptEvaluator,
        ids: &'a IdGenerator,
        source: &'a Message,
    ) -> Self {
        Self {
            templates,
            types,
            scripts,
            ids,
            source,
        }
    }

    pub fn source(&self) -> &'a Message {
        self.source
    }

    /// Evaluates `expression` with `base` as its default input.
    ///
    /// Missing data is never an error: the result is simply empty. The one failure reported
    /// to the caller is a required expression whose condition held for some candidate but
    /// that still produced nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RequiredFieldMissing`] as described above, including when a required child
    /// of a nested expression fails.
    pub fn evaluate(
        &self,
        expression: &Expression,
        context: &Context,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, RequiredFieldMissing> {
        let constants = expression
            .constants
            .iter()
            .map(|(name, value)| EvaluationResult::new(name, Value::text(value)))
            .collect();
        let working = context.extend(constants).with(base.clone());

        let candidates = self.candidates(expression, &working, base);
        let dispatchable = !candidates.is_empty();
        let candidates = if dispatchable {
            candidates
        } else {
            vec![(Value::Absent, false)]
        };

        let mut satisfied = false;
        let mut values = Vec::new();
        let mut side_resources = Vec::new();
        for (candidate, retain_empty) in candidates {
            let bound = EvaluationResult::new(&expression.type_tag, candidate);
            let scope = working.with(bound.clone());
            let scope = binder::resolve_variables(self, &expression.variables, &scope, &bound);
            let holds = expression
                .condition
                .as_ref()
                .map_or(true, |condition| condition.evaluate(&scope, self.source));
            if !holds {
                continue;
            }
            satisfied = true;
            if !dispatchable {
                break;
            }

            let (value, produced) = self.dispatch(expression, &scope, &bound)?;
            merge_side_resources(&mut side_resources, produced);
            if value.is_absent() || (value.is_empty() && !retain_empty) {
                continue;
            }
            values.push(value);
            if !expression.generate_multiple {
                break;
            }
        }

        let value = if values.is_empty() {
            expression.default_value.clone().unwrap_or_default()
        } else if expression.generate_multiple {
            Value::from_items(values.into_iter().flat_map(Value::into_items))
        } else {
            values.swap_remove(0)
        };

        if expression.required && satisfied && value.is_empty() {
            return Err(RequiredFieldMissing {
                field: expression.name.clone(),
            });
        }
        Ok(EvaluationResult::new(&expression.name, value).with_side_resources(side_resources))
    }

    /// Values the expression is evaluated for.
    ///
    /// Without specs the base value is the only candidate. Alternatives are tried in order and
    /// the first that finds something wins, unless the expression produces several values, in
    /// which case every alternative contributes its items. Each candidate carries whether
    /// its spec keeps blank values (`&`).
    fn candidates(
        &self,
        expression: &Expression,
        context: &Context,
        base: &EvaluationResult,
    ) -> Vec<(Value, bool)> {
        if expression.specs.is_empty() {
            return vec![(base.value().clone(), false)];
        }

        let mut candidates = Vec::new();
        for spec in &expression.specs {
            let value = spec.resolve(self.source, context);
            if value.is_absent() {
                continue;
            }
            let retain_empty = spec.retain_empty();
            if expression.generate_multiple {
                candidates.extend(value.into_items().into_iter().map(|item| (item, retain_empty)));
            } else {
                candidates.push((value, retain_empty));
                break;
            }
        }
        candidates
    }

    fn dispatch(
        &self,
        expression: &Expression,
        context: &Context,
        candidate: &EvaluationResult,
    ) -> Result<(Value, Vec<SideResource>), RequiredFieldMissing> {
        let produced = match &expression.kind {
            ExpressionKind::Simple { value_of } => {
                let input = match value_of.as_deref() {
                    None => candidate.value().clone(),
                    Some(text) => match text.strip_prefix('$') {
                        Some(name) => context.value(name).cloned().unwrap_or_default(),
                        None => Value::text(text),
                    },
                };
                (self.coerce(expression, &input), Vec::new())
            }
            ExpressionKind::SourceSpec => (self.coerce(expression, candidate.value()), Vec::new()),
            ExpressionKind::Resource { template } => composer::embed(self, template, context, candidate),
            ExpressionKind::Reference { template } => composer::refer(self, template, context, candidate),
            ExpressionKind::NestedMap { children } => {
                let mut map = BTreeMap::new();
                let mut side_resources = Vec::new();
                for child in children {
                    let (value, produced) = self.evaluate(child, context, candidate)?.into_parts();
                    merge_side_resources(&mut side_resources, produced);
                    if !value.is_empty() {
                        map.insert(child.name.clone(), value);
                    }
                }
                let value = if map.is_empty() {
                    Value::Absent
                } else {
                    Value::Map(map)
                };
                (value, side_resources)
            }
            ExpressionKind::NestedList { children } => {
                let mut items = Vec::new();
                let mut side_resources = Vec::new();
                for child in children {
                    let (value, produced) = self.evaluate(child, context, candidate)?.into_parts();
                    merge_side_resources(&mut side_resources, produced);
                    items.extend(value.into_items());
                }
                (Value::from_items(items), side_resources)
            }
            ExpressionKind::ContextFetch { fetch } => (fetch.resolve(self.source, context), Vec::new()),
            ExpressionKind::Script { script } => {
                let value = self.scripts.evaluate(script, context).unwrap_or_else(|err| {
                    tracing::warn!(field = %expression.name, error = %err, "script failed; field dropped");
                    Value::Absent
                });
                (value, Vec::new())
            }
        };
        Ok(produced)
    }

    fn coerce(&self, expression: &Expression, value: &Value) -> Value {
        self.types
            .resolve(&expression.type_tag, value)
            .unwrap_or_else(|err| {
                tracing::warn!(
                    field = %expression.name,
                    type_tag = %expression.type_tag,
                    error = %err,
                    "value could not be resolved; field dropped"
                );
                Value::Absent
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::config::IdStrategy;
    use crate::script::BuiltinScripts;
    use crate::spec;
    use crate::terminology::Terminology;
    use crate::testing::{parse, ORU};
    use h2f_types::Scalar;

    struct Fixture {
        templates: TemplateSet,
        types: TypeRegistry,
        ids: IdGenerator,
        message: Message,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                templates: TemplateSet::default(),
                types: TypeRegistry::with_defaults(Terminology::with_defaults().expect("terminology")),
                ids: IdGenerator::new(IdStrategy::Sequential),
                message: parse(ORU),
            }
        }

        fn session(&self) -> Session<'_> {
            Session::new(&self.templates, &self.types, &BuiltinScripts, &self.ids, &self.message)
        }

        /// The first PID segment bound as the base value.
        fn pid(&self) -> EvaluationResult {
            let pid = self.message.find_segments(
                self.message.root(),
                &["PATIENT_RESULT", "PATIENT"],
                "PID",
            );
            EvaluationResult::new("PID", Value::segment(pid[0]))
        }
    }

    fn spec_expression(name: &str, type_tag: &str, specs: &str, multiple: bool) -> Expression {
        let mut expression = Expression::new(name, type_tag, ExpressionKind::SourceSpec);
        expression.generate_multiple = multiple;
        expression.specs = spec::parse(specs, multiple).expect("spec");
        expression
    }

    #[test]
    fn missing_source_data_is_absent_not_an_error() {
        let fixture = Fixture::new();
        let expression = spec_expression("maritalStatus", "STRING", "PID.16", false);
        let result = fixture
            .session()
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("optional field");
        assert!(result.is_empty());
        assert_eq!(result.name(), "maritalStatus");
    }

    #[test]
    fn multiplicity_toggles_between_first_and_all() {
        let fixture = Fixture::new();
        let session = fixture.session();

        let single = spec_expression("identifier", "STRING", "PID.3.1", false);
        let value = session
            .evaluate(&single, &Context::new(), &fixture.pid())
            .expect("single");
        assert_eq!(value.value(), &Value::text("12345"));

        let multiple = spec_expression("identifier", "STRING", "PID.3.1", true);
        let value = session
            .evaluate(&multiple, &Context::new(), &fixture.pid())
            .expect("multiple");
        assert_eq!(
            value.value(),
            &Value::List(vec![Value::text("12345"), Value::text("99")])
        );
    }

    #[test]
    fn alternatives_fall_through_to_the_first_present_one() {
        let fixture = Fixture::new();
        let expression = spec_expression("phone", "STRING", "PID.13 | PID.5.2", false);
        let value = fixture
            .session()
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("alternatives");
        assert_eq!(value.value(), &Value::text("JANE"));
    }

    #[test]
    fn required_fields_fail_only_when_their_condition_held() {
        let fixture = Fixture::new();
        let session = fixture.session();

        let mut expression = spec_expression("deceased", "STRING", "PID.30", false);
        expression.required = true;
        let err = session
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect_err("required and missing");
        assert_eq!(err.field, "deceased");

        expression.condition = Some(Condition::parse("$PID NULL").expect("condition"));
        let skipped = session
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("condition did not hold");
        assert!(skipped.is_empty());
    }

    #[test]
    fn defaults_fill_empty_results() {
        let fixture = Fixture::new();
        let mut expression = spec_expression("status", "STRING", "PID.30", false);
        expression.default_value = Some(Value::text("unknown"));
        let value = fixture
            .session()
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("default");
        assert_eq!(value.value(), &Value::text("unknown"));
    }

    #[test]
    fn variables_and_conditions_gate_each_candidate() {
        let fixture = Fixture::new();
        let mut expression = Expression::new(
            "mrn",
            "STRING",
            ExpressionKind::Simple {
                value_of: Some("$value".to_owned()),
            },
        );
        expression.generate_multiple = true;
        expression.specs = spec::parse("PID.3", true).expect("spec");
        expression.variables = vec![
            crate::expression::Variable {
                name: "value".to_owned(),
                expression: spec_expression("value", "Object", "CX.1", false),
            },
            crate::expression::Variable {
                name: "authority".to_owned(),
                expression: spec_expression("authority", "Object", "CX.4", false),
            },
        ];
        expression.type_tag = "CX".to_owned();
        expression.condition = Some(Condition::parse("$authority EQUALS HOSP").expect("condition"));

        // Candidates are bound under CX, so CX needs a resolver of its own.
        let mut types = TypeRegistry::with_defaults(Terminology::default());
        types.register("CX", |v, _| Ok(v.to_text().map_or(Value::Absent, Value::text)));
        let session = Session::new(&fixture.templates, &types, &BuiltinScripts, &fixture.ids, &fixture.message);
        let value = session
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("evaluate");
        assert_eq!(value.value(), &Value::List(vec![Value::text("12345")]));
    }

    #[test]
    fn constants_and_literals_bind_into_the_context() {
        let fixture = Fixture::new();
        let mut expression = Expression::new(
            "system",
            "SYSTEM_URL",
            ExpressionKind::Simple {
                value_of: Some("$code".to_owned()),
            },
        );
        expression.constants.insert("code".to_owned(), "LN".to_owned());
        let value = fixture
            .session()
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("constant");
        assert_eq!(value.value(), &Value::text("http://loinc.org"));

        let literal = Expression::new(
            "active",
            "BOOLEAN",
            ExpressionKind::Simple {
                value_of: Some("true".to_owned()),
            },
        );
        let value = fixture
            .session()
            .evaluate(&literal, &Context::new(), &fixture.pid())
            .expect("literal");
        assert_eq!(value.value(), &Value::Scalar(Scalar::Boolean(true)));
    }

    #[test]
    fn nested_maps_drop_empty_children_and_propagate_required_failures() {
        let fixture = Fixture::new();
        let session = fixture.session();
        let children = vec![
            spec_expression("family", "STRING", "PID.5.1", false),
            spec_expression("suffix", "STRING", "PID.5.4", false),
        ];
        let name = Expression::new("name", "Object", ExpressionKind::NestedMap { children });
        let value = session
            .evaluate(&name, &Context::new(), &fixture.pid())
            .expect("nested");
        let map = value.value().as_map().expect("map");
        assert_eq!(map.get("family"), Some(&Value::text("DOE")));
        assert!(!map.contains_key("suffix"));

        let mut required = spec_expression("suffix", "STRING", "PID.5.4", false);
        required.required = true;
        let failing = Expression::new(
            "name",
            "Object",
            ExpressionKind::NestedMap {
                children: vec![required],
            },
        );
        assert!(session.evaluate(&failing, &Context::new(), &fixture.pid()).is_err());
    }

    #[test]
    fn leaf_failures_are_downgraded_to_absent() {
        let fixture = Fixture::new();
        let expression = spec_expression("birthDate", "INTEGER", "PID.5.1", false);
        let value = fixture
            .session()
            .evaluate(&expression, &Context::new(), &fixture.pid())
            .expect("downgraded");
        assert!(value.is_empty());
    }

    #[test]
    fn context_fetches_and_scripts_read_bindings() {
        let fixture = Fixture::new();
        let context = Context::new().with(EvaluationResult::new(
            "Patient",
            Value::Map(BTreeMap::from([(
                "reference".to_owned(),
                Value::text("Patient/p1"),
            )])),
        ));

        let mut fetch_specs = spec::parse("$Patient:reference", false).expect("fetch");
        let fetch = Expression::new(
            "subject",
            "Object",
            ExpressionKind::ContextFetch {
                fetch: fetch_specs.remove(0),
            },
        );
        let value = fixture
            .session()
            .evaluate(&fetch, &context, &fixture.pid())
            .expect("fetch");
        assert_eq!(value.value(), &Value::text("Patient/p1"));

        let script = Expression::new(
            "text",
            "Object",
            ExpressionKind::Script {
                script: "upper($family)".to_owned(),
            },
        );
        let mut with_family = script.clone();
        with_family.variables = vec![crate::expression::Variable {
            name: "family".to_owned(),
            expression: spec_expression("family", "Object", "PID.5.1", false),
        }];
        let value = fixture
            .session()
            .evaluate(&with_family, &context, &fixture.pid())
            .expect("script");
        assert_eq!(value.value().to_text().as_deref(), Some("DOE"));
    }
}

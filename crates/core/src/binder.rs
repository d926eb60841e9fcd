//! Variable resolution.
//!
//! Variables of one expression are evaluated in declaration order, each against the context
//! as it was before any of them was bound, and then layered on together. A variable that
//! produces nothing, or whose own required constraint fails, is bound to the empty marker so
//! that conditions see it as bound-but-empty rather than falling back to an outer binding.

use crate::context::{Context, EvaluationResult};
use crate::engine::Session;
use crate::expression::Variable;

/// Returns `context` with one binding per variable on top.
pub fn resolve_variables(
    session: &Session<'_>,
    variables: &[Variable],
    context: &Context,
    base: &EvaluationResult,
) -> Context {
    if variables.is_empty() {
        return context.clone();
    }

    let bindings = variables
        .iter()
        .map(|variable| match session.evaluate(&variable.expression, context, base) {
            Ok(result) if !result.value().is_absent() => result.renamed(&variable.name),
            Ok(_) => EvaluationResult::empty(&variable.name),
            Err(missing) => {
                tracing::debug!(variable = %variable.name, %missing, "variable left empty");
                EvaluationResult::empty(&variable.name)
            }
        })
        .collect();
    context.extend(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdStrategy;
    use crate::expression::{Expression, ExpressionKind};
    use crate::ids::IdGenerator;
    use crate::resolvers::TypeRegistry;
    use crate::script::BuiltinScripts;
    use crate::spec;
    use crate::template::TemplateSet;
    use crate::terminology::Terminology;
    use crate::testing::{parse, ORU};
    use h2f_types::Value;

    fn variable(name: &str, specs: &str) -> Variable {
        let mut expression = Expression::new(name, "Object", ExpressionKind::SourceSpec);
        expression.specs = spec::parse(specs, false).expect("spec");
        Variable {
            name: name.to_owned(),
            expression,
        }
    }

    #[test]
    fn binds_values_and_empty_markers_against_the_outer_context() {
        let templates = TemplateSet::default();
        let types = TypeRegistry::with_defaults(Terminology::default());
        let ids = IdGenerator::new(IdStrategy::Sequential);
        let message = parse(ORU);
        let session = Session::new(&templates, &types, &BuiltinScripts, &ids, &message);

        let pid = message.find_segments(message.root(), &["PATIENT_RESULT", "PATIENT"], "PID");
        let base = EvaluationResult::new("PID", Value::segment(pid[0]));
        let outer = Context::new()
            .with(base.clone())
            .with(EvaluationResult::new("suffix", Value::text("outer")));

        let context = resolve_variables(
            &session,
            &[
                variable("family", "PID.5.1"),
                variable("suffix", "PID.5.4"),
                // Sees the outer `family`, which does not exist: variables do not chain.
                variable("copy", "$family"),
            ],
            &outer,
            &base,
        );

        assert_eq!(
            context.value("family").and_then(Value::to_text).as_deref(),
            Some("DOE")
        );
        assert!(context.contains("suffix"));
        assert!(context.value("suffix").is_some_and(Value::is_absent));
        assert!(context.value("copy").is_some_and(Value::is_absent));
    }

    #[test]
    fn retained_blank_values_stay_bound() {
        let templates = TemplateSet::default();
        let types = TypeRegistry::with_defaults(Terminology::default());
        let ids = IdGenerator::new(IdStrategy::Sequential);
        let message = parse("MSH|^~\\&\rPID|1||||^^^\r");
        let session = Session::new(&templates, &types, &BuiltinScripts, &ids, &message);

        let pid = message.child_segments(message.root(), "PID")[0];
        let base = EvaluationResult::new("PID", Value::segment(pid));
        let context = resolve_variables(
            &session,
            &[variable("kept", "PID.5&"), variable("dropped", "PID.5")],
            &Context::new().with(base.clone()),
            &base,
        );

        let kept = context.value("kept").expect("bound");
        assert!(!kept.is_absent());
        assert!(kept.is_empty());
        assert!(context.value("dropped").is_some_and(Value::is_absent));
    }
}

//! Compiled template expressions.
//!
//! Templates are parsed and validated once; the engine only ever sees these immutable
//! values. Every expression shares one set of attributes and carries exactly one
//! [`ExpressionKind`].

use crate::condition::Condition;
use crate::spec::Spec;
use h2f_types::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpressionKind {
    /// A literal (`valueOf: final`), a context binding (`valueOf: $code`) or the candidate
    /// itself, through the leaf resolver.
    Simple { value_of: Option<String> },
    /// The candidate extracted by the specs, through the leaf resolver.
    SourceSpec,
    /// An inner template embedded as the field value.
    Resource { template: String },
    /// An inner template emitted as its own resource and pointed at.
    Reference { template: String },
    /// Children combined into a list, empty ones dropped and list children spliced.
    NestedList { children: Vec<Expression> },
    /// Children combined into a map keyed by child name.
    NestedMap { children: Vec<Expression> },
    /// A `$name[:key]` fetch evaluated against the child context, no coercion.
    ContextFetch { fetch: Spec },
    /// Script text handed to the script evaluator.
    Script { script: String },
}

impl ExpressionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ExpressionKind::Simple { .. } => "simple",
            ExpressionKind::SourceSpec => "HL7Spec",
            ExpressionKind::Resource { .. } => "resource",
            ExpressionKind::Reference { .. } => "reference",
            ExpressionKind::NestedList { .. } => "nestedList",
            ExpressionKind::NestedMap { .. } => "nested",
            ExpressionKind::ContextFetch { .. } => "context",
            ExpressionKind::Script { .. } => "script",
        }
    }
}

/// One field (or nested child, or variable) of a template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    pub name: String,
    /// Leaf resolver tag; also the name the candidate is bound under while evaluating.
    pub type_tag: String,
    pub required: bool,
    pub generate_multiple: bool,
    pub evaluate_later: bool,
    pub default_value: Option<Value>,
    pub specs: Vec<Spec>,
    pub variables: Vec<Variable>,
    pub condition: Option<Condition>,
    pub constants: BTreeMap<String, String>,
    pub kind: ExpressionKind,
}

impl Expression {
    /// An expression with default attributes.
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>, kind: ExpressionKind) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            required: false,
            generate_multiple: false,
            evaluate_later: false,
            default_value: None,
            specs: Vec::new(),
            variables: Vec::new(),
            condition: None,
            constants: BTreeMap::new(),
            kind,
        }
    }

    /// Templates referenced by this expression and its children and variables.
    pub fn template_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match &self.kind {
            ExpressionKind::Resource { template } | ExpressionKind::Reference { template } => {
                out.push(template);
            }
            ExpressionKind::NestedList { children } | ExpressionKind::NestedMap { children } => {
                children.iter().for_each(|c| c.collect_references(out));
            }
            _ => {}
        }
        self.variables
            .iter()
            .for_each(|v| v.expression.collect_references(out));
    }
}

/// A named expression resolved before the owning expression's condition is checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub expression: Expression,
}

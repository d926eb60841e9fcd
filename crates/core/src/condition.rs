//! Granularity-qualified conditions.
//!
//! ```text
//! $code NOT_NULL && $status IN [F, C]
//! $obx5@COMPONENT.2 EQUALS 'mg/dL' || $kind STARTS_WITH Z
//! ```
//!
//! `&&` binds tighter than `||`. Operands are context bindings, optionally qualified with the
//! granularity the value should be viewed at: `@SEGMENT`, `@FIELD`, `@COMPONENT[.n]` or
//! `@SUBCOMPONENT[.c.s]`. A value that only exists at a finer granularity than the one asked
//! for makes the whole predicate false, whatever the operator.

use crate::context::Context;
use crate::error::SyntaxError;
use crate::spec::check_identifier;
use h2f_types::{Granularity, Scalar, Value};
use hl7::Message;

/// Boolean tree of predicates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Any(Vec<Condition>),
    All(Vec<Condition>),
    Predicate(Predicate),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Null,
    NotNull,
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        let operator = match token {
            "NULL" => Self::Null,
            "NOT_NULL" => Self::NotNull,
            "EQUALS" => Self::Equals,
            "NOT_EQUALS" => Self::NotEquals,
            "IN" => Self::In,
            "NOT_IN" => Self::NotIn,
            "CONTAINS" => Self::Contains,
            "NOT_CONTAINS" => Self::NotContains,
            "STARTS_WITH" => Self::StartsWith,
            _ => return None,
        };
        Some(operator)
    }

    fn is_unary(self) -> bool {
        matches!(self, Self::Null | Self::NotNull)
    }

    fn takes_list(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// `$name[@GRANULARITY] OPERATOR [literal | [literal, ...]]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
    pub binding: String,
    pub granularity: Option<Granularity>,
    pub component: usize,
    pub subcomponent: usize,
    pub operator: Operator,
    pub literals: Vec<String>,
}

/// What an operand looks like once viewed at the requested granularity.
enum Observed {
    /// Unbound, empty, or nothing at the requested position.
    Missing,
    /// The value cannot be viewed at the requested granularity.
    Mismatch,
    /// Present, but not comparable as text (maps, groups).
    Opaque,
    Text(String),
}

impl Condition {
    /// Parses condition text.
    ///
    /// # Errors
    ///
    /// Returns [`SyntaxError`] for unknown operators or granularities, missing operands and
    /// unbalanced quotes or brackets.
    pub fn parse(text: &str) -> Result<Self, SyntaxError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyntaxError::new("condition is empty"));
        }
        let mut any = split_top_level(text, "||")?
            .into_iter()
            .map(|part| {
                let mut all = split_top_level(part, "&&")?
                    .into_iter()
                    .map(|p| parse_predicate(p).map(Condition::Predicate))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if all.len() == 1 {
                    all.remove(0)
                } else {
                    Condition::All(all)
                })
            })
            .collect::<Result<Vec<_>, SyntaxError>>()?;
        Ok(if any.len() == 1 {
            any.remove(0)
        } else {
            Condition::Any(any)
        })
    }

    /// Evaluates against the context. `source` renders segment-level operands as text.
    pub fn evaluate(&self, context: &Context, source: &Message) -> bool {
        match self {
            Condition::Any(parts) => parts.iter().any(|c| c.evaluate(context, source)),
            Condition::All(parts) => parts.iter().all(|c| c.evaluate(context, source)),
            Condition::Predicate(predicate) => predicate.evaluate(context, source),
        }
    }
}

impl Predicate {
    pub fn evaluate(&self, context: &Context, source: &Message) -> bool {
        let observed = match context.value(&self.binding) {
            Some(value) => self.observe(value, source),
            None => Observed::Missing,
        };

        match observed {
            Observed::Mismatch => false,
            Observed::Missing => matches!(
                self.operator,
                Operator::Null | Operator::NotEquals | Operator::NotIn | Operator::NotContains
            ),
            Observed::Opaque => matches!(
                self.operator,
                Operator::NotNull | Operator::NotEquals | Operator::NotIn | Operator::NotContains
            ),
            Observed::Text(text) => self.compare(&text),
        }
    }

    fn compare(&self, text: &str) -> bool {
        let first = self.literals.first().map(String::as_str).unwrap_or_default();
        match self.operator {
            Operator::Null => false,
            Operator::NotNull => true,
            Operator::Equals => text == first,
            Operator::NotEquals => text != first,
            Operator::In => self.literals.iter().any(|l| l == text),
            Operator::NotIn => !self.literals.iter().any(|l| l == text),
            Operator::Contains => text.contains(first),
            Operator::NotContains => !text.contains(first),
            Operator::StartsWith => text.starts_with(first),
        }
    }

    fn observe(&self, value: &Value, source: &Message) -> Observed {
        let Some(item) = value.first() else {
            return Observed::Missing;
        };
        let scalar = match item {
            Value::Scalar(scalar) => scalar,
            Value::Map(_) | Value::List(_) => return Observed::Opaque,
            Value::Absent => return Observed::Missing,
        };

        match (scalar, self.granularity) {
            (Scalar::Field(field), None) => non_blank(field.text()),
            (Scalar::Field(_), Some(Granularity::Segment)) => Observed::Mismatch,
            (Scalar::Field(field), Some(granularity)) => {
                if granularity < field.granularity() {
                    return Observed::Mismatch;
                }
                match field.at(granularity, self.component, self.subcomponent) {
                    Some(narrowed) => non_blank(narrowed.text()),
                    None => Observed::Missing,
                }
            }
            (Scalar::Segment(segment), None | Some(Granularity::Segment)) => {
                non_blank(source.segment_text(*segment))
            }
            (Scalar::Segment(_), Some(_)) => Observed::Mismatch,
            (Scalar::Group(_), _) => Observed::Opaque,
            (other, None | Some(Granularity::Field)) => {
                other.to_text().map_or(Observed::Missing, non_blank)
            }
            (_, Some(_)) => Observed::Mismatch,
        }
    }
}

fn non_blank(text: String) -> Observed {
    if text.trim().is_empty() {
        Observed::Missing
    } else {
        Observed::Text(text)
    }
}

fn parse_predicate(text: &str) -> Result<Predicate, SyntaxError> {
    let text = text.trim();
    let (operand, rest) = text
        .split_once(char::is_whitespace)
        .ok_or_else(|| SyntaxError::new(format!("'{text}' has no operator")))?;
    let rest = rest.trim_start();
    let (operator_token, argument) = match rest.split_once(char::is_whitespace) {
        Some((op, arg)) => (op, arg.trim()),
        None => (rest, ""),
    };
    let operator = Operator::parse(operator_token)
        .ok_or_else(|| SyntaxError::new(format!("unknown operator '{operator_token}'")))?;

    let operand = operand
        .strip_prefix('$')
        .ok_or_else(|| SyntaxError::new(format!("operand '{operand}' must start with '$'")))?;
    let (binding, qualifier) = match operand.split_once('@') {
        Some((binding, qualifier)) => (binding, Some(qualifier)),
        None => (operand, None),
    };
    check_identifier(binding)?;
    let (granularity, component, subcomponent) = match qualifier {
        Some(q) => parse_granularity(q)?,
        None => (None, 1, 1),
    };

    let literals = if operator.is_unary() {
        if !argument.is_empty() {
            return Err(SyntaxError::new(format!(
                "{operator_token} takes no argument, found '{argument}'"
            )));
        }
        Vec::new()
    } else if let Some(list) = argument.strip_prefix('[') {
        let list = list
            .strip_suffix(']')
            .ok_or_else(|| SyntaxError::new(format!("unclosed list in '{argument}'")))?;
        split_top_level(list, ",")?
            .into_iter()
            .map(unquote)
            .collect::<Result<Vec<_>, _>>()?
    } else if argument.is_empty() {
        return Err(SyntaxError::new(format!("{operator_token} needs an argument")));
    } else {
        vec![unquote(argument)?]
    };
    if !operator.takes_list() && literals.len() > 1 {
        return Err(SyntaxError::new(format!("{operator_token} takes a single value")));
    }

    Ok(Predicate {
        binding: binding.to_owned(),
        granularity,
        component,
        subcomponent,
        operator,
        literals,
    })
}

fn parse_granularity(qualifier: &str) -> Result<(Option<Granularity>, usize, usize), SyntaxError> {
    let mut parts = qualifier.split('.');
    let name = parts.next().unwrap_or_default();
    let indices = parts
        .map(|p| match p.parse::<usize>() {
            Ok(i) if i > 0 => Ok(i),
            _ => Err(SyntaxError::new(format!("'{p}' is not a 1-based index"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (granularity, max_indices) = match name {
        "SEGMENT" => (Granularity::Segment, 0),
        "FIELD" => (Granularity::Field, 0),
        "COMPONENT" => (Granularity::Component, 1),
        "SUBCOMPONENT" => (Granularity::Subcomponent, 2),
        other => return Err(SyntaxError::new(format!("unknown granularity '{other}'"))),
    };
    if indices.len() > max_indices {
        return Err(SyntaxError::new(format!("too many indices in '@{qualifier}'")));
    }
    let component = indices.first().copied().unwrap_or(1);
    let subcomponent = indices.get(1).copied().unwrap_or(1);
    Ok((Some(granularity), component, subcomponent))
}

fn unquote(token: &str) -> Result<String, SyntaxError> {
    let token = token.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = token.strip_prefix(quote) {
            return inner
                .strip_suffix(quote)
                .map(str::to_owned)
                .ok_or_else(|| SyntaxError::new(format!("unbalanced quote in {token}")));
        }
    }
    if token.is_empty() {
        return Err(SyntaxError::new("empty literal"));
    }
    Ok(token.to_owned())
}

/// Splits on `separator` outside quotes and brackets.
fn split_top_level<'a>(text: &'a str, separator: &str) -> Result<Vec<&'a str>, SyntaxError> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SyntaxError::new(format!("unbalanced ']' in '{text}'")))?;
            }
            (None, _) if depth == 0 && text[i..].starts_with(separator) => {
                parts.push(text[start..i].trim());
                start = i + separator.len();
                for _ in 1..separator.len() {
                    chars.next();
                }
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(SyntaxError::new(format!("unbalanced quote in '{text}'")));
    }
    if depth != 0 {
        return Err(SyntaxError::new(format!("unclosed '[' in '{text}'")));
    }
    parts.push(text[start..].trim());
    if parts.iter().any(|p| p.is_empty()) {
        return Err(SyntaxError::new(format!("empty clause in '{text}'")));
    }
    Ok(parts)
}

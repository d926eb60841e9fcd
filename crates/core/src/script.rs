//! Script expressions.
//!
//! The engine treats scripts as opaque text handed to a [`ScriptEvaluator`]. The bundled
//! [`BuiltinScripts`] evaluator understands a small function-call language, enough for the
//! value shaping templates commonly need:
//!
//! ```text
//! concat($given, ' ', $family)
//! coalesce($preferred, $fallback, 'unknown')
//! upper(trim($code))
//! uuid()
//! now()
//! ```
//!
//! Arguments are `$name` bindings (the binding's text), quoted literals, or nested calls.

use crate::context::Context;
use crate::error::{ExtractionError, SyntaxError};
use crate::spec::check_identifier;
use h2f_types::Value;

/// Evaluates script text against a context.
///
/// Implementations are shared read-only across concurrent conversions.
pub trait ScriptEvaluator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ExtractionError::Script`] when the script cannot be evaluated. The engine logs
    /// the error and treats the field as absent.
    fn evaluate(&self, script: &str, context: &Context) -> Result<Value, ExtractionError>;

    /// Load-time check of script text. The default accepts everything.
    fn validate(&self, _script: &str) -> Result<(), SyntaxError> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Term {
    Binding(String),
    Literal(String),
    Call { function: Function, args: Vec<Term> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Function {
    Uuid,
    Now,
    Concat,
    Upper,
    Lower,
    Trim,
    Coalesce,
}

impl Function {
    fn parse(name: &str) -> Option<Self> {
        let function = match name {
            "uuid" => Self::Uuid,
            "now" => Self::Now,
            "concat" => Self::Concat,
            "upper" => Self::Upper,
            "lower" => Self::Lower,
            "trim" => Self::Trim,
            "coalesce" => Self::Coalesce,
            _ => return None,
        };
        Some(function)
    }

    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Uuid | Self::Now => (0, Some(0)),
            Self::Upper | Self::Lower | Self::Trim => (1, Some(1)),
            Self::Concat | Self::Coalesce => (1, None),
        }
    }
}

/// The bundled function-call evaluator.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinScripts;

impl ScriptEvaluator for BuiltinScripts {
    fn evaluate(&self, script: &str, context: &Context) -> Result<Value, ExtractionError> {
        let term = parse(script).map_err(|e| ExtractionError::Script {
            script: script.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(eval(&term, context).map_or(Value::Absent, Value::text))
    }

    fn validate(&self, script: &str) -> Result<(), SyntaxError> {
        parse(script).map(|_| ())
    }
}

fn eval(term: &Term, context: &Context) -> Option<String> {
    match term {
        Term::Literal(text) => Some(text.clone()),
        Term::Binding(name) => context
            .value(name)
            .and_then(Value::to_text)
            .filter(|t| !t.trim().is_empty()),
        Term::Call { function, args } => match function {
            Function::Uuid => Some(uuid::Uuid::new_v4().to_string()),
            Function::Now => Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            Function::Concat => {
                let joined: String = args.iter().filter_map(|a| eval(a, context)).collect();
                (!joined.is_empty()).then_some(joined)
            }
            Function::Coalesce => args.iter().find_map(|a| eval(a, context)),
            Function::Upper => eval(&args[0], context).map(|t| t.to_uppercase()),
            Function::Lower => eval(&args[0], context).map(|t| t.to_lowercase()),
            Function::Trim => eval(&args[0], context)
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty()),
        },
    }
}

fn parse(script: &str) -> Result<Term, SyntaxError> {
    let mut parser = Parser {
        input: script.trim(),
        pos: 0,
    };
    let term = parser.term()?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        return Err(SyntaxError::new(format!(
            "unexpected '{}' at offset {}",
            &parser.input[parser.pos..],
            parser.pos
        )));
    }
    match term {
        Term::Call { .. } => Ok(term),
        _ => Err(SyntaxError::new("a script must be a function call")),
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), SyntaxError> {
        self.skip_whitespace();
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            Ok(())
        } else {
            Err(SyntaxError::new(format!(
                "expected '{expected}' at offset {}",
                self.pos
            )))
        }
    }

    fn name(&mut self) -> &str {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn term(&mut self) -> Result<Term, SyntaxError> {
        self.skip_whitespace();
        match self.peek() {
            Some('$') => {
                self.pos += 1;
                let name = self.name().to_owned();
                check_identifier(&name)?;
                Ok(Term::Binding(name))
            }
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let rest = &self.input[self.pos..];
                let end = rest
                    .find(quote)
                    .ok_or_else(|| SyntaxError::new("unterminated string literal"))?;
                let literal = rest[..end].to_owned();
                self.pos += end + 1;
                Ok(Term::Literal(literal))
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let name = self.name().to_owned();
                let function = Function::parse(&name)
                    .ok_or_else(|| SyntaxError::new(format!("unknown function '{name}'")))?;
                self.expect('(')?;
                let mut args = Vec::new();
                self.skip_whitespace();
                if self.peek() == Some(')') {
                    self.pos += 1;
                } else {
                    loop {
                        args.push(self.term()?);
                        self.skip_whitespace();
                        match self.peek() {
                            Some(',') => self.pos += 1,
                            Some(')') => {
                                self.pos += 1;
                                break;
                            }
                            _ => {
                                return Err(SyntaxError::new(format!(
                                    "expected ',' or ')' at offset {}",
                                    self.pos
                                )))
                            }
                        }
                    }
                }
                let (min, max) = function.arity();
                if args.len() < min || max.is_some_and(|max| args.len() > max) {
                    return Err(SyntaxError::new(format!(
                        "{name}() called with {} argument(s)",
                        args.len()
                    )));
                }
                Ok(Term::Call { function, args })
            }
            _ => Err(SyntaxError::new(format!(
                "expected a binding, literal or call at offset {}",
                self.pos
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvaluationResult;

    fn context() -> Context {
        Context::new().extend(vec![
            EvaluationResult::new("given", Value::text("Jane")),
            EvaluationResult::new("family", Value::text("Doe")),
            EvaluationResult::empty("nothing"),
        ])
    }

    fn run(script: &str) -> Value {
        BuiltinScripts
            .evaluate(script, &context())
            .expect("script evaluates")
    }

    #[test]
    fn concatenates_bindings_and_literals() {
        assert_eq!(
            run("concat($given, ' ', upper($family))"),
            Value::text("Jane DOE")
        );
        assert_eq!(run("concat($nothing)"), Value::Absent);
    }

    #[test]
    fn coalesce_takes_the_first_present_argument() {
        assert_eq!(run("coalesce($nothing, $missing, 'fallback')"), Value::text("fallback"));
        assert_eq!(run("lower(coalesce($family))"), Value::text("doe"));
    }

    #[test]
    fn generates_ids_and_timestamps() {
        let id = run("uuid()").to_text().expect("uuid text");
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        let now = run("now()").to_text().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }

    #[test]
    fn validation_rejects_bad_scripts() {
        for script in ["", "$given", "'text'", "shout($given)", "upper()", "uuid(1)", "concat($a", "concat('a) "] {
            assert!(BuiltinScripts.validate(script).is_err(), "'{script}' should not validate");
        }
        assert!(BuiltinScripts.validate("trim( $given )").is_ok());
    }
}

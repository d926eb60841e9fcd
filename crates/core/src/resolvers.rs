//! Leaf type resolvers.
//!
//! A field's `type` tag names the function that turns an extracted source value into the
//! output value: `STRING` renders text, `DATE_TIME` reformats HL7 timestamps, a terminology
//! table name maps codes, and so on. Resolvers run once per item; lists are mapped item by
//! item and absent input stays absent.
//!
//! Responsibilities:
//! - register the built-in tags and one tag per terminology table
//! - let callers register their own tags before the registry is shared
//! - report unknown tags so template loading can reject them

use crate::constants::DEFAULT_TYPE;
use crate::error::ExtractionError;
use crate::terminology::Terminology;
use chrono::{NaiveDate, NaiveDateTime};
use h2f_types::{Granularity, Scalar, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A leaf resolver: one non-list, non-absent value in, one value out.
pub type LeafResolver =
    Arc<dyn Fn(&Value, &Terminology) -> Result<Value, ExtractionError> + Send + Sync>;

/// Registry of type tags, shared read-only across conversions.
#[derive(Clone)]
pub struct TypeRegistry {
    resolvers: HashMap<String, LeafResolver>,
    terminology: Arc<Terminology>,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&String> = self.resolvers.keys().collect();
        tags.sort();
        f.debug_struct("TypeRegistry").field("tags", &tags).finish()
    }
}

impl TypeRegistry {
    /// Built-in tags plus one tag per table of `terminology`.
    pub fn with_defaults(terminology: Terminology) -> Self {
        let mut registry = Self {
            resolvers: HashMap::new(),
            terminology: Arc::new(terminology),
        };

        registry.register(DEFAULT_TYPE, |v, _| Ok(v.clone()));
        registry.register("STRING", |v, _| Ok(v.to_text().map_or(Value::Absent, Value::text)));
        registry.register("BOOLEAN", |v, _| boolean(v));
        registry.register("INTEGER", |v, _| integer(v));
        registry.register("DECIMAL", |v, _| decimal(v));
        registry.register("DATE", |v, _| date(v));
        registry.register("DATE_TIME", |v, _| date_time(v, false));
        registry.register("INSTANT", |v, _| date_time(v, true));
        registry.register("CODE", |v, _| Ok(code_text(v).map_or(Value::Absent, Value::text)));
        registry.register("SYSTEM_URL", |v, t| Ok(system_url(v, t)));

        let tables: Vec<String> = registry
            .terminology
            .table_names()
            .map(str::to_owned)
            .collect();
        for table in tables {
            let name = table.clone();
            registry.register(&table, move |v, t| {
                Ok(code_text(v)
                    .and_then(|code| t.lookup(&name, &code))
                    .map_or(Value::Absent, Value::text))
            });
        }
        registry
    }

    /// Registers (or replaces) a tag.
    pub fn register<F>(&mut self, tag: &str, resolver: F)
    where
        F: Fn(&Value, &Terminology) -> Result<Value, ExtractionError> + Send + Sync + 'static,
    {
        self.resolvers.insert(tag.to_owned(), Arc::new(resolver));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.resolvers.contains_key(tag)
    }

    pub fn terminology(&self) -> &Terminology {
        &self.terminology
    }

    /// Applies the resolver for `tag` to every item of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::UnknownType`] for unregistered tags and whatever the
    /// resolver reports for values it cannot convert.
    pub fn resolve(&self, tag: &str, value: &Value) -> Result<Value, ExtractionError> {
        let resolver = self
            .resolvers
            .get(tag)
            .ok_or_else(|| ExtractionError::UnknownType(tag.to_owned()))?;
        match value {
            Value::Absent => Ok(Value::Absent),
            Value::List(items) => {
                let resolved = items
                    .iter()
                    .filter(|item| !item.is_absent())
                    .map(|item| resolver(item, &self.terminology))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::from_items(resolved))
            }
            other => resolver(other, &self.terminology),
        }
    }
}

fn invalid(type_tag: &str, value: &Value) -> ExtractionError {
    ExtractionError::InvalidValue {
        type_tag: type_tag.to_owned(),
        value: value.to_text().unwrap_or_default(),
    }
}

/// Text of the first component for field values, the plain text otherwise.
fn code_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Scalar(Scalar::Field(field)) if field.granularity() == Granularity::Field => {
            field.component_at(1).map(|c| c.text())?
        }
        other => other.to_text()?,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

fn boolean(value: &Value) -> Result<Value, ExtractionError> {
    if let Value::Scalar(Scalar::Boolean(_)) = value {
        return Ok(value.clone());
    }
    let Some(text) = code_text(value) else {
        return Ok(Value::Absent);
    };
    match text.to_lowercase().as_str() {
        "y" | "yes" | "true" | "t" | "1" => Ok(Value::from(true)),
        "n" | "no" | "false" | "f" | "0" => Ok(Value::from(false)),
        _ => Err(invalid("BOOLEAN", value)),
    }
}

fn integer(value: &Value) -> Result<Value, ExtractionError> {
    let Some(text) = code_text(value) else {
        return Ok(Value::Absent);
    };
    text.parse::<i64>()
        .map(|i| Value::Scalar(Scalar::Integer(i)))
        .map_err(|_| invalid("INTEGER", value))
}

fn decimal(value: &Value) -> Result<Value, ExtractionError> {
    let Some(text) = code_text(value) else {
        return Ok(Value::Absent);
    };
    let text = text.strip_prefix('+').unwrap_or(&text);
    match text.parse::<f64>() {
        Ok(number) if number.is_finite() && !text.contains(['e', 'E']) => {
            Ok(Value::Scalar(Scalar::Decimal(text.to_owned())))
        }
        _ => Err(invalid("DECIMAL", value)),
    }
}

/// Splits an HL7 `DT`/`DTM` into its digits and an optional `+HHMM`/`-HHMM` offset.
fn split_timestamp(text: &str) -> (String, Option<&str>) {
    let (stamp, offset) = match text.find(['+', '-']) {
        Some(i) => (&text[..i], Some(&text[i..])),
        None => (text, None),
    };
    let digits = stamp.split('.').next().unwrap_or_default().to_owned();
    (digits, offset)
}

fn format_date(digits: &str) -> Option<String> {
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        4 => Some(digits.to_owned()),
        6 => {
            let month: u32 = digits[4..6].parse().ok()?;
            (1..=12)
                .contains(&month)
                .then(|| format!("{}-{}", &digits[..4], &digits[4..6]))
        }
        8 => NaiveDate::parse_from_str(digits, "%Y%m%d")
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string()),
        _ => None,
    }
}

fn format_offset(offset: &str) -> Option<String> {
    let (sign, rest) = offset.split_at(1);
    if rest.len() != 4 || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{sign}{}:{}", &rest[..2], &rest[2..]))
}

fn date(value: &Value) -> Result<Value, ExtractionError> {
    let Some(text) = code_text(value) else {
        return Ok(Value::Absent);
    };
    let (digits, _) = split_timestamp(&text);
    let digits = &digits[..digits.len().min(8)];
    format_date(digits)
        .map(Value::text)
        .ok_or_else(|| invalid("DATE", value))
}

/// `DATE_TIME` keeps partial dates as they are; `INSTANT` needs seconds and defaults the
/// offset to UTC.
fn date_time(value: &Value, instant: bool) -> Result<Value, ExtractionError> {
    let type_tag = if instant { "INSTANT" } else { "DATE_TIME" };
    let Some(text) = code_text(value) else {
        return Ok(Value::Absent);
    };
    let (digits, offset) = split_timestamp(&text);

    if digits.len() <= 8 && !instant {
        return format_date(&digits)
            .map(Value::text)
            .ok_or_else(|| invalid(type_tag, value));
    }

    let padded = match digits.len() {
        10 => format!("{digits}0000"),
        12 => format!("{digits}00"),
        14 => digits.clone(),
        _ => return Err(invalid(type_tag, value)),
    };
    if instant && digits.len() < 14 {
        return Err(invalid(type_tag, value));
    }
    let parsed = NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
        .map_err(|_| invalid(type_tag, value))?;
    let offset = match offset {
        Some(o) => format_offset(o).ok_or_else(|| invalid(type_tag, value))?,
        None if instant => "Z".to_owned(),
        None => String::new(),
    };
    Ok(Value::text(format!(
        "{}{offset}",
        parsed.format("%Y-%m-%dT%H:%M:%S")
    )))
}

fn system_url(value: &Value, terminology: &Terminology) -> Value {
    let Some(text) = code_text(value) else {
        return Value::Absent;
    };
    if let Some(url) = terminology.system_url(&text) {
        return Value::text(url);
    }
    if text.contains("://") || text.starts_with("urn:") {
        Value::text(text)
    } else {
        Value::text(format!("urn:id:{text}"))
    }
}

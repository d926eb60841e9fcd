//! Pipe-delimited message text to flat segments.
//!
//! The header declares the delimiters: the character after `MSH` is the field separator and
//! `MSH-2` lists component, repetition, escape and subcomponent characters in that order.
//! Leaf strings are decoded for the standard delimiter escapes (`\F\ \S\ \T\ \R\ \E\`);
//! unrecognised escapes are kept verbatim.

use crate::message::Field;
use crate::Hl7Error;
use h2f_types::FieldValue;

/// Delimiters declared by a message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// Reads the delimiters from a header line.
    fn from_header(line: &str) -> Result<Self, Hl7Error> {
        let mut chars = line.chars().skip(3);
        let field = chars.next().ok_or(Hl7Error::InvalidEncoding)?;
        let encoding: Vec<char> = chars.take_while(|&c| c != field).collect();
        if encoding.is_empty() {
            return Err(Hl7Error::InvalidEncoding);
        }
        let defaults = Self::default();
        Ok(Self {
            field,
            component: encoding[0],
            repetition: encoding.get(1).copied().unwrap_or(defaults.repetition),
            escape: encoding.get(2).copied().unwrap_or(defaults.escape),
            subcomponent: encoding.get(3).copied().unwrap_or(defaults.subcomponent),
        })
    }

    fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }
}

/// A segment before group structuring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawSegment {
    pub name: String,
    pub fields: Vec<Field>,
}

/// Splits message text into segments.
pub(crate) fn split_segments(text: &str) -> Result<(Delimiters, Vec<RawSegment>), Hl7Error> {
    let mut lines = text
        .split(['\r', '\n'])
        .map(str::trim_end)
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .peekable();

    let Some((_, header)) = lines.peek().copied() else {
        return Err(Hl7Error::Empty);
    };
    if !header.starts_with("MSH") {
        return Err(Hl7Error::MissingHeader(
            header.chars().take(3).collect::<String>(),
        ));
    }
    let delimiters = Delimiters::from_header(header)?;

    let mut segments = Vec::new();
    for (index, line) in lines {
        let line = line.trim_start();
        let mut parts = line.split(delimiters.field);
        let name = parts.next().unwrap_or_default().to_owned();
        if name.len() != 3 || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Hl7Error::InvalidSegmentName {
                name,
                line: index + 1,
            });
        }

        let fields = if name == "MSH" {
            let mut fields: Vec<Field> = vec![
                vec![FieldValue::subcomponent(delimiters.field.to_string())],
                vec![FieldValue::subcomponent(delimiters.encoding_characters())],
            ];
            fields.extend(parts.skip(1).map(|f| parse_field(f, &delimiters)));
            fields
        } else {
            parts.map(|f| parse_field(f, &delimiters)).collect()
        };
        segments.push(RawSegment { name, fields });
    }

    Ok((delimiters, segments))
}

/// Splits one field into repetitions, components and subcomponents.
pub(crate) fn parse_field(text: &str, delimiters: &Delimiters) -> Field {
    if text.is_empty() {
        return Vec::new();
    }
    text.split(delimiters.repetition)
        .map(|rep| {
            FieldValue::field(
                rep.split(delimiters.component)
                    .map(|comp| {
                        comp.split(delimiters.subcomponent)
                            .map(|sub| unescape(sub, delimiters))
                            .collect()
                    })
                    .collect(),
            )
        })
        .collect()
}

/// Decodes the standard delimiter escape sequences.
pub(crate) fn unescape(text: &str, delimiters: &Delimiters) -> String {
    if !text.contains(delimiters.escape) {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(delimiters.escape) {
        out.push_str(&rest[..start]);
        let after = &rest[start + delimiters.escape.len_utf8()..];
        let Some(end) = after.find(delimiters.escape) else {
            out.push_str(&rest[start..]);
            return out;
        };
        let decoded = match &after[..end] {
            "F" => Some(delimiters.field),
            "S" => Some(delimiters.component),
            "T" => Some(delimiters.subcomponent),
            "R" => Some(delimiters.repetition),
            "E" => Some(delimiters.escape),
            _ => None,
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&rest[start..start + 2 * delimiters.escape.len_utf8() + end]),
        }
        rest = &after[end + delimiters.escape.len_utf8()..];
    }
    out.push_str(rest);
    out
}

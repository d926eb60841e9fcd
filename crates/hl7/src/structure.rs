//! Message structure definitions and group structuring.
//!
//! A structure definition lists the segments and (possibly repeating, possibly optional)
//! groups of one message structure, in order. Definitions are YAML:
//!
//! ```yaml
//! aliases:
//!   ADT_A04: ADT_A01
//! structures:
//!   ORU_R01:
//!     - MSH
//!     - SFT*
//!     - group: PATIENT_RESULT
//!       repeats: true
//!       children:
//!         - PID
//!         - OBR
//! ```
//!
//! Segment entries take an optional suffix: `?` optional, `*` optional and repeating,
//! `+` required and repeating.
//!
//! Structuring is greedy and lenient: it never rejects a message. Segments the definition does
//! not know about (Z-segments, for example) stay in the group being filled; known segments that
//! arrive out of order are attached to the root.

use crate::message::Message;
use crate::parser::RawSegment;
use crate::Hl7Error;
use h2f_types::StructureHandle;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

const DEFAULT_STRUCTURES: &str = include_str!("../structures/default.yml");

/// One element of a structure definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Element {
    Segment {
        name: String,
        optional: bool,
        repeats: bool,
    },
    Group {
        name: String,
        optional: bool,
        repeats: bool,
        children: Vec<Element>,
    },
}

impl Element {
    fn optional(&self) -> bool {
        match self {
            Element::Segment { optional, .. } | Element::Group { optional, .. } => *optional,
        }
    }

    fn repeats(&self) -> bool {
        match self {
            Element::Segment { repeats, .. } | Element::Group { repeats, .. } => *repeats,
        }
    }

    /// Names of the segments that can open this element.
    fn starts(&self) -> HashSet<&str> {
        match self {
            Element::Segment { name, .. } => HashSet::from([name.as_str()]),
            Element::Group { children, .. } => {
                let mut names = HashSet::new();
                for child in children {
                    names.extend(child.starts());
                    if !child.optional() {
                        break;
                    }
                }
                names
            }
        }
    }

    fn collect_names<'a>(&'a self, names: &mut HashSet<&'a str>) {
        match self {
            Element::Segment { name, .. } => {
                names.insert(name);
            }
            Element::Group { children, .. } => {
                children.iter().for_each(|c| c.collect_names(names));
            }
        }
    }
}

/// A complete message structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructureDefinition {
    name: String,
    elements: Vec<Element>,
}

impl StructureDefinition {
    /// A definition with no elements: every segment lands directly under the root.
    pub(crate) fn flat(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            elements: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Arranges flat segments into the group tree of this structure.
    pub(crate) fn build(&self, segments: Vec<RawSegment>) -> Message {
        let mut known = HashSet::new();
        self.elements.iter().for_each(|e| e.collect_names(&mut known));

        let mut message = Message::new(self.name.clone());
        let mut filler = Filler {
            known,
            segments,
            pos: 0,
        };
        let root = message.root();
        while filler.pos < filler.segments.len() {
            filler.fill(&mut message, root, &self.elements);
            if filler.pos < filler.segments.len() {
                // Out-of-order known segment: keep it rather than drop data.
                filler.attach(&mut message, root);
            }
        }
        message
    }
}

struct Filler<'d> {
    known: HashSet<&'d str>,
    segments: Vec<RawSegment>,
    pos: usize,
}

impl Filler<'_> {
    fn attach(&mut self, message: &mut Message, parent: StructureHandle) {
        let segment = &mut self.segments[self.pos];
        let fields = std::mem::take(&mut segment.fields);
        message.push_segment(parent, &segment.name, fields);
        self.pos += 1;
    }

    fn fill(&mut self, message: &mut Message, parent: StructureHandle, elements: &[Element]) {
        let mut next = 0;
        while self.pos < self.segments.len() {
            let name = self.segments[self.pos].name.clone();
            let matched = (next..elements.len()).find(|&j| elements[j].starts().contains(name.as_str()));
            match matched {
                Some(j) => {
                    match &elements[j] {
                        Element::Segment { .. } => self.attach(message, parent),
                        Element::Group { name, children, .. } => {
                            let group = message.push_group(parent, name);
                            self.fill(message, group, children);
                        }
                    }
                    next = if elements[j].repeats() { j } else { j + 1 };
                }
                None if !self.known.contains(name.as_str()) => self.attach(message, parent),
                None => return,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ElementWire {
    Segment(String),
    Group(GroupWire),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupWire {
    group: String,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    repeats: bool,
    children: Vec<ElementWire>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryWire {
    #[serde(default)]
    aliases: HashMap<String, String>,
    #[serde(default)]
    structures: HashMap<String, Vec<ElementWire>>,
}

fn element_from_wire(wire: ElementWire) -> Result<Element, Hl7Error> {
    match wire {
        ElementWire::Segment(text) => {
            let text = text.trim();
            let (name, optional, repeats) = match text.chars().last() {
                Some('?') => (&text[..text.len() - 1], true, false),
                Some('*') => (&text[..text.len() - 1], true, true),
                Some('+') => (&text[..text.len() - 1], false, true),
                _ => (text, false, false),
            };
            if name.len() != 3 {
                return Err(Hl7Error::Structure(format!(
                    "invalid segment entry '{text}'"
                )));
            }
            Ok(Element::Segment {
                name: name.to_owned(),
                optional,
                repeats,
            })
        }
        ElementWire::Group(group) => {
            if group.children.is_empty() {
                return Err(Hl7Error::Structure(format!(
                    "group '{}' has no children",
                    group.group
                )));
            }
            Ok(Element::Group {
                name: group.group,
                optional: group.optional,
                repeats: group.repeats,
                children: group
                    .children
                    .into_iter()
                    .map(element_from_wire)
                    .collect::<Result<_, _>>()?,
            })
        }
    }
}

/// Known message structures, keyed by structure name, plus trigger aliases.
#[derive(Clone, Debug, Default)]
pub struct StructureRegistry {
    structures: HashMap<String, StructureDefinition>,
    aliases: HashMap<String, String>,
}

impl StructureRegistry {
    /// Registry holding the bundled definitions (`ADT_A01` and its aliases, `ORU_R01`,
    /// `VXU_V04`).
    pub fn with_defaults() -> Result<Self, Hl7Error> {
        let mut registry = Self::default();
        registry.load_yaml(DEFAULT_STRUCTURES)?;
        Ok(registry)
    }

    /// Adds (or replaces) definitions and aliases from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::Structure`] with the failing YAML path when the text does not match
    /// the definition schema, or when an entry is malformed.
    pub fn load_yaml(&mut self, yaml_text: &str) -> Result<(), Hl7Error> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let wire: RegistryWire = serde_path_to_error::deserialize(deserializer).map_err(|err| {
            let path = err.path().to_string();
            Hl7Error::Structure(format!("schema mismatch at {path}: {}", err.into_inner()))
        })?;

        for (name, elements) in wire.structures {
            let elements = elements
                .into_iter()
                .map(element_from_wire)
                .collect::<Result<Vec<_>, _>>()?;
            self.structures
                .insert(name.clone(), StructureDefinition { name, elements });
        }
        self.aliases.extend(wire.aliases);
        Ok(())
    }

    /// Looks up a structure by name or alias.
    pub fn get(&self, name: &str) -> Option<&StructureDefinition> {
        self.structures.get(name).or_else(|| {
            self.aliases
                .get(name)
                .and_then(|target| self.structures.get(target))
        })
    }

    /// Canonical structure name for a name or alias.
    pub fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        if self.structures.contains_key(name) {
            name
        } else {
            self.aliases.get(name).map_or(name, String::as_str)
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.structures.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::split_segments;

    fn registry(yaml: &str) -> StructureRegistry {
        let mut registry = StructureRegistry::default();
        registry.load_yaml(yaml).expect("valid structure yaml");
        registry
    }

    const NESTED: &str = r#"
structures:
  TST_T01:
    - MSH
    - group: OUTER
      repeats: true
      children:
        - PID
        - group: INNER
          repeats: true
          children:
            - OBR
            - OBX*
"#;

    fn build(text: &str) -> Message {
        let registry = registry(NESTED);
        let (_, segments) = split_segments(text).expect("split");
        registry.get("TST_T01").expect("structure").build(segments)
    }

    #[test]
    fn repeating_groups_open_new_instances() {
        let message = build("MSH|^~\\&\rPID|1\rOBR|1\rOBX|1\rOBX|2\rOBR|2\rPID|2\rOBR|3\r");
        let root = message.root();

        let outer = message.child_groups(root, "OUTER");
        assert_eq!(outer.len(), 2);
        assert_eq!(message.child_groups(outer[0], "INNER").len(), 2);
        assert_eq!(message.child_groups(outer[1], "INNER").len(), 1);
        assert_eq!(message.find_segments(root, &["OUTER", "INNER"], "OBX").len(), 2);
    }

    #[test]
    fn unknown_segments_stay_in_current_group() {
        let message = build("MSH|^~\\&\rPID|1\rOBR|1\rZXT|custom\rOBX|1\r");
        let inner = message.group_instances(message.root(), &["OUTER", "INNER"]);
        assert_eq!(inner.len(), 1);
        let names: Vec<&str> = message
            .children(inner[0])
            .iter()
            .map(|&c| message.name(c))
            .collect();
        assert_eq!(names, vec!["OBR", "ZXT", "OBX"]);
    }

    #[test]
    fn out_of_order_known_segments_are_kept_at_root() {
        let message = build("MSH|^~\\&\rPID|1\rMSH|^~\\&|again\r");
        assert_eq!(message.child_segments(message.root(), "MSH").len(), 2);
    }

    #[test]
    fn rejects_bad_segment_entries() {
        let mut registry = StructureRegistry::default();
        let err = registry
            .load_yaml("structures:\n  X:\n    - TOOLONG\n")
            .expect_err("bad entry");
        assert!(matches!(err, Hl7Error::Structure(msg) if msg.contains("TOOLONG")));
    }

    #[test]
    fn defaults_resolve_aliases() {
        let registry = StructureRegistry::with_defaults().expect("defaults");
        assert_eq!(registry.canonical_name("ADT_A04"), "ADT_A01");
        assert!(registry.get("ADT_A08").is_some());
        assert!(registry.get("ORU_R01").is_some());
        assert!(registry.get("VXU_V04").is_some());
    }
}

//! Addressable, read-only message tree.
//!
//! A parsed [`Message`] is an arena of group and segment nodes. Handles
//! ([`StructureHandle`]) are plain indices, so values produced during evaluation can point back
//! into the tree without borrowing it.
//!
//! The root node is an unnamed group that holds the top-level segments and groups of the
//! message structure. Group paths used by callers never include the root.

use h2f_types::{FieldValue, StructureHandle};

/// Name given to the root group in instance paths.
pub const ROOT_NAME: &str = "ROOT";

/// All repetitions of one field, in source order.
pub type Field = Vec<FieldValue>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Group { children: Vec<StructureHandle> },
    Segment { fields: Vec<Field> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Node {
    pub name: String,
    pub parent: Option<StructureHandle>,
    pub kind: NodeKind,
}

/// A parsed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    structure: String,
    nodes: Vec<Node>,
}

impl Message {
    /// Creates a message holding only the root group.
    pub(crate) fn new(structure: impl Into<String>) -> Self {
        Self {
            structure: structure.into(),
            nodes: vec![Node {
                name: ROOT_NAME.to_owned(),
                parent: None,
                kind: NodeKind::Group {
                    children: Vec::new(),
                },
            }],
        }
    }

    pub(crate) fn push_group(&mut self, parent: StructureHandle, name: &str) -> StructureHandle {
        self.push(
            parent,
            Node {
                name: name.to_owned(),
                parent: Some(parent),
                kind: NodeKind::Group {
                    children: Vec::new(),
                },
            },
        )
    }

    pub(crate) fn push_segment(
        &mut self,
        parent: StructureHandle,
        name: &str,
        fields: Vec<Field>,
    ) -> StructureHandle {
        self.push(
            parent,
            Node {
                name: name.to_owned(),
                parent: Some(parent),
                kind: NodeKind::Segment { fields },
            },
        )
    }

    fn push(&mut self, parent: StructureHandle, node: Node) -> StructureHandle {
        let handle = StructureHandle(self.nodes.len());
        self.nodes.push(node);
        if let Some(NodeKind::Group { children }) = self.nodes.get_mut(parent.0).map(|n| &mut n.kind)
        {
            children.push(handle);
        }
        handle
    }

    fn node(&self, handle: StructureHandle) -> Option<&Node> {
        self.nodes.get(handle.0)
    }

    /// Name of the message structure this tree was built with (for example `ORU_R01`).
    pub fn structure(&self) -> &str {
        &self.structure
    }

    pub fn root(&self) -> StructureHandle {
        StructureHandle(0)
    }

    /// Group or segment name; empty for an unknown handle.
    pub fn name(&self, handle: StructureHandle) -> &str {
        self.node(handle).map_or("", |n| n.name.as_str())
    }

    pub fn parent(&self, handle: StructureHandle) -> Option<StructureHandle> {
        self.node(handle).and_then(|n| n.parent)
    }

    pub fn is_group(&self, handle: StructureHandle) -> bool {
        matches!(self.node(handle).map(|n| &n.kind), Some(NodeKind::Group { .. }))
    }

    pub fn is_segment(&self, handle: StructureHandle) -> bool {
        matches!(self.node(handle).map(|n| &n.kind), Some(NodeKind::Segment { .. }))
    }

    /// Direct children of a group; empty for segments.
    pub fn children(&self, handle: StructureHandle) -> &[StructureHandle] {
        match self.node(handle).map(|n| &n.kind) {
            Some(NodeKind::Group { children }) => children,
            _ => &[],
        }
    }

    /// Direct child segments of `scope` with the given name, in source order.
    pub fn child_segments(&self, scope: StructureHandle, name: &str) -> Vec<StructureHandle> {
        self.children(scope)
            .iter()
            .copied()
            .filter(|&c| self.is_segment(c) && self.name(c) == name)
            .collect()
    }

    /// Direct child groups of `scope` with the given name, in source order.
    pub fn child_groups(&self, scope: StructureHandle, name: &str) -> Vec<StructureHandle> {
        self.children(scope)
            .iter()
            .copied()
            .filter(|&c| self.is_group(c) && self.name(c) == name)
            .collect()
    }

    /// Every group instance reached by walking `group_path` down from `scope`, through every
    /// repetition of each group on the way. An empty path yields `scope` itself.
    pub fn group_instances<S: AsRef<str>>(
        &self,
        scope: StructureHandle,
        group_path: &[S],
    ) -> Vec<StructureHandle> {
        let mut current = vec![scope];
        for name in group_path {
            current = current
                .into_iter()
                .flat_map(|g| self.child_groups(g, name.as_ref()))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// Every segment named `segment` directly under a group reached through `group_path`.
    pub fn find_segments<S: AsRef<str>>(
        &self,
        scope: StructureHandle,
        group_path: &[S],
        segment: &str,
    ) -> Vec<StructureHandle> {
        self.group_instances(scope, group_path)
            .into_iter()
            .flat_map(|g| self.child_segments(g, segment))
            .collect()
    }

    /// True when walking `group_path` from the root reaches at least one group instance.
    pub fn has_group_path<S: AsRef<str>>(&self, group_path: &[S]) -> bool {
        !self.group_instances(self.root(), group_path).is_empty()
    }

    /// Chain of ancestors from the root down to (and excluding) `handle`.
    pub fn ancestors(&self, handle: StructureHandle) -> Vec<StructureHandle> {
        let mut chain = Vec::new();
        let mut current = self.parent(handle);
        while let Some(h) = current {
            chain.push(h);
            current = self.parent(h);
        }
        chain.reverse();
        chain
    }

    /// Names of the groups between the root and `handle` (exclusive of both ends for segments,
    /// inclusive of `handle` itself when it is a group).
    pub fn group_path(&self, handle: StructureHandle) -> Vec<&str> {
        let mut path: Vec<&str> = self
            .ancestors(handle)
            .into_iter()
            .skip(1)
            .map(|h| self.name(h))
            .collect();
        if self.is_group(handle) && handle != self.root() {
            path.push(self.name(handle));
        }
        path
    }

    /// Zero-based position of `handle` among its same-named siblings.
    pub fn occurrence_index(&self, handle: StructureHandle) -> usize {
        let Some(parent) = self.parent(handle) else {
            return 0;
        };
        let name = self.name(handle);
        self.children(parent)
            .iter()
            .take_while(|&&c| c != handle)
            .filter(|&&c| self.name(c) == name)
            .count()
    }

    /// Stable textual identity of a node, e.g. `PATIENT_RESULT[0].ORDER_OBSERVATION[1]`.
    ///
    /// Two handles share an instance path only if they are the same node.
    pub fn instance_path(&self, handle: StructureHandle) -> String {
        if handle == self.root() {
            return ROOT_NAME.to_owned();
        }
        let mut parts: Vec<String> = self
            .ancestors(handle)
            .into_iter()
            .skip(1)
            .map(|h| format!("{}[{}]", self.name(h), self.occurrence_index(h)))
            .collect();
        parts.push(format!(
            "{}[{}]",
            self.name(handle),
            self.occurrence_index(handle)
        ));
        parts.join(".")
    }

    /// All repetitions of field `field` (1-based) of a segment.
    ///
    /// For `MSH`, field 1 is the field separator and field 2 the encoding characters.
    pub fn field(&self, segment: StructureHandle, field: usize) -> Option<&Field> {
        match self.node(segment).map(|n| &n.kind) {
            Some(NodeKind::Segment { fields }) => fields.get(field.checked_sub(1)?),
            _ => None,
        }
    }

    /// One repetition (1-based) of a field.
    pub fn field_repetition(
        &self,
        segment: StructureHandle,
        field: usize,
        repetition: usize,
    ) -> Option<&FieldValue> {
        self.field(segment, field)?.get(repetition.checked_sub(1)?)
    }

    /// Number of fields present on a segment.
    pub fn field_count(&self, segment: StructureHandle) -> usize {
        match self.node(segment).map(|n| &n.kind) {
            Some(NodeKind::Segment { fields }) => fields.len(),
            _ => 0,
        }
    }

    /// Indices (1-based) of the fields that carry content.
    ///
    /// Blank components and HL7 explicit nulls (`""`) are not content, and neither are the
    /// `MSH-1`/`MSH-2` delimiter placeholders that every header carries.
    pub fn populated_fields(&self, segment: StructureHandle) -> Vec<usize> {
        let is_header = self.name(segment) == "MSH";
        (1..=self.field_count(segment))
            .filter(|&i| !(is_header && i <= 2))
            .filter(|&i| {
                self.field(segment, i).is_some_and(|reps| {
                    reps.iter().any(|r| !r.is_blank() && r.text() != "\"\"")
                })
            })
            .collect()
    }

    /// True when the segment carries no content (see [`Message::populated_fields`]).
    pub fn is_segment_empty(&self, segment: StructureHandle) -> bool {
        self.populated_fields(segment).is_empty()
    }

    /// Canonical text of a segment using the standard delimiters.
    pub fn segment_text(&self, segment: StructureHandle) -> String {
        let Some(NodeKind::Segment { fields }) = self.node(segment).map(|n| &n.kind) else {
            return String::new();
        };
        let is_header = self.name(segment) == "MSH";
        let mut parts = vec![self.name(segment).to_owned()];
        for (i, reps) in fields.iter().enumerate() {
            if is_header && i == 0 {
                continue;
            }
            let text: Vec<String> = reps.iter().map(FieldValue::text).collect();
            parts.push(text.join("~"));
        }
        let end = parts
            .iter()
            .rposition(|p| !p.is_empty())
            .map_or(1, |i| i + 1);
        parts[..end].join("|")
    }

    /// Indented outline of the group tree, one node per line.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        self.outline_into(self.root(), 0, &mut out);
        out
    }

    fn outline_into(&self, handle: StructureHandle, depth: usize, out: &mut String) {
        for &child in self.children(handle) {
            let indent = "  ".repeat(depth);
            if self.is_group(child) {
                out.push_str(&format!(
                    "{indent}{}[{}]\n",
                    self.name(child),
                    self.occurrence_index(child)
                ));
                self.outline_into(child, depth + 1, out);
            } else {
                out.push_str(&format!("{indent}{}\n", self.segment_text(child)));
            }
        }
    }
}

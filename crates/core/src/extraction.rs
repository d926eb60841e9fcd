//! Segment/group extraction.
//!
//! Enumerates the occurrences a resource template is composed from. Every occurrence of the
//! primary segment, across every repetition of every group on its path, becomes one
//! [`SegmentGroup`]. Additional segments are attached according to where they live relative
//! to the primary segment:
//!
//! - in an ancestor group (or at the message root): the matches under that ancestor instance,
//!   shared by every occurrence below it;
//! - in the primary segment's own group: matched by position, the i-th additional segment
//!   with the i-th primary one. Repeating declarations take the run of occurrences that follow
//!   this primary segment up to the next one;
//! - anywhere else: found by walking down from the deepest group instance both paths share.

use crate::template::{AdditionalSegment, SegmentBinding};
use h2f_types::StructureHandle;
use hl7::Message;
use std::collections::BTreeMap;

/// One occurrence of a template's primary segment and everything bound with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentGroup {
    /// Instance path of the correlation group, e.g. `PATIENT_RESULT[0]`.
    pub group_id: String,
    pub primary: StructureHandle,
    /// The group instance that directly contains `primary`.
    pub scope: StructureHandle,
    pub additional: BTreeMap<String, Vec<StructureHandle>>,
}

/// Enumerates the occurrences of `binding` in `source`.
///
/// A group path the message does not contain yields no occurrences.
pub fn extract(binding: &SegmentBinding, source: &Message) -> Vec<SegmentGroup> {
    if !source.has_group_path(&binding.group_path) {
        return Vec::new();
    }

    let mut groups = Vec::new();
    for scope in source.group_instances(source.root(), &binding.group_path) {
        let mut lineage = source.ancestors(scope);
        lineage.push(scope);

        let primaries = source.child_segments(scope, &binding.primary_segment);
        let group_id = source.instance_path(lineage[binding.correlation_group_path.len()]);
        for index in 0..primaries.len() {
            let additional = binding
                .additional
                .iter()
                .map(|declaration| {
                    let matches = match_additional(declaration, binding, source, &lineage, &primaries, index);
                    (declaration.name.clone(), matches)
                })
                .collect();
            groups.push(SegmentGroup {
                group_id: group_id.clone(),
                primary: primaries[index],
                scope,
                additional,
            });
        }
    }
    groups
}

fn common_prefix(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// `lineage[k]` is the group instance at depth `k` on the primary segment's path; `lineage[0]`
/// is the message root.
fn match_additional(
    declaration: &AdditionalSegment,
    binding: &SegmentBinding,
    source: &Message,
    lineage: &[StructureHandle],
    primaries: &[StructureHandle],
    index: usize,
) -> Vec<StructureHandle> {
    let common = common_prefix(&declaration.group_path, &binding.group_path);
    let anchor = lineage[common];

    if common < declaration.group_path.len() {
        let found = source.find_segments(anchor, &declaration.group_path[common..], &declaration.segment);
        return first_or_all(found, declaration.repeats);
    }

    let candidates = source.child_segments(anchor, &declaration.segment);
    if common < binding.group_path.len() {
        return first_or_all(candidates, declaration.repeats);
    }

    // Same group as the primary segment.
    if declaration.repeats {
        let after = if index == 0 { None } else { Some(primaries[index]) };
        let before = primaries.get(index + 1).copied();
        candidates
            .into_iter()
            .filter(|c| after.map_or(true, |a| *c > a) && before.map_or(true, |b| *c < b))
            .collect()
    } else {
        candidates.get(index).copied().into_iter().collect()
    }
}

fn first_or_all(found: Vec<StructureHandle>, all: bool) -> Vec<StructureHandle> {
    if all {
        found
    } else {
        found.into_iter().take(1).collect()
    }
}

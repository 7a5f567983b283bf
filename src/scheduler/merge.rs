//! Merged-read planning
//!
//! Many individually-addressed points collapse into the minimum number of
//! read requests per cycle. Merging works per (slave, object kind) group
//! over points sorted by request address; a request never exceeds the
//! protocol's maximum addressable span for its object kind.

use std::collections::BTreeMap;

use crate::client::SpanLimits;
use crate::interface::PointHandle;
use crate::point::ObjectKind;

/// One point's contribution to the read plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpan {
    pub handle: PointHandle,
    pub slave: u8,
    pub kind: ObjectKind,
    /// Actual request address (window override or the point's own address)
    pub start: u16,
    /// Actual request length in addressable units
    pub length: u16,
}

impl ReadSpan {
    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.length)
    }
}

/// One physical read covering several points' windows
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub slave: u8,
    pub kind: ObjectKind,
    pub start: u16,
    pub length: u16,
    /// Points whose windows fall inside `[start, start + length)`
    pub members: Vec<ReadSpan>,
}

/// Merge behavior knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// When disabled, one request per distinct (address, length) group is
    /// issued instead; duplicates still collapse but gaps are never spanned
    pub enabled: bool,
    /// Adjacent-but-not-contiguous points within this many units still
    /// share one request
    pub span_tolerance: u16,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            span_tolerance: 0,
        }
    }
}

/// Compute the per-cycle read plan for the given spans
pub fn build_read_plan(
    spans: &[ReadSpan],
    limits: &SpanLimits,
    options: &MergeOptions,
) -> Vec<ReadRequest> {
    // Deterministic group order: slave, then object kind.
    let mut groups: BTreeMap<(u8, u8), Vec<ReadSpan>> = BTreeMap::new();
    for span in spans {
        groups
            .entry((span.slave, kind_rank(span.kind)))
            .or_default()
            .push(*span);
    }

    let mut plan = Vec::new();
    for ((_, _), mut group) in groups {
        group.sort_by_key(|s| (s.start, s.length));
        let kind = group[0].kind;
        let max_span = u32::from(limits.max_span(kind));
        if options.enabled {
            merge_group(&group, max_span, u32::from(options.span_tolerance), &mut plan);
        } else {
            dedupe_group(&group, &mut plan);
        }
    }
    plan
}

fn kind_rank(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::BitWritable => 0,
        ObjectKind::BitReadOnly => 1,
        ObjectKind::WordWritable => 2,
        ObjectKind::WordReadOnly => 3,
    }
}

fn merge_group(group: &[ReadSpan], max_span: u32, tolerance: u32, plan: &mut Vec<ReadRequest>) {
    let mut start = 0u32;
    let mut end = 0u32;
    let mut members: Vec<ReadSpan> = Vec::new();

    for span in group {
        if !members.is_empty() {
            let split = (end - start) > max_span
                || u32::from(span.start) > end + tolerance
                || span.end() - start > max_span;
            if split {
                plan.push(emit(start, end, std::mem::take(&mut members)));
            }
        }
        if members.is_empty() {
            start = u32::from(span.start);
            end = span.end();
        } else {
            end = end.max(span.end());
        }
        members.push(*span);
    }
    if !members.is_empty() {
        plan.push(emit(start, end, members));
    }
}

fn dedupe_group(group: &[ReadSpan], plan: &mut Vec<ReadRequest>) {
    let mut distinct: BTreeMap<(u16, u16), Vec<ReadSpan>> = BTreeMap::new();
    for span in group {
        distinct
            .entry((span.start, span.length))
            .or_default()
            .push(*span);
    }
    for ((start, length), members) in distinct {
        plan.push(emit(
            u32::from(start),
            u32::from(start) + u32::from(length),
            members,
        ));
    }
}

fn emit(start: u32, end: u32, members: Vec<ReadSpan>) -> ReadRequest {
    let first = members[0];
    ReadRequest {
        slave: first.slave,
        kind: first.kind,
        start: start as u16,
        length: (end - start) as u16,
        members,
    }
}

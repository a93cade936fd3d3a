//! History matcher: portable element references that survive re-rendering.
//!
//! A [`HistoryRecord`] captures what an element looked like in one snapshot;
//! [`find_current`] locates the same element in a later one. Everything here
//! is pure over immutable snapshot data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::dom::{truncate, ElementNode, NodeId};
use crate::snapshot::PageState;

/// Attributes that tend to survive re-renders. Anything else (class, style,
/// generated ids on data-* attributes) is too volatile to match on.
const STABLE_ATTRIBUTES: &[&str] = &[
    "id",
    "name",
    "type",
    "role",
    "aria-label",
    "placeholder",
    "href",
    "title",
    "alt",
    "for",
    "data-testid",
];

/// Attributes that, when they differ, mean "different element" regardless of position.
const IDENTITY_ATTRIBUTES: &[&str] = &["id", "name", "data-testid"];

/// How many interactive elements feed a state signature.
const SIGNATURE_SAMPLE: usize = 16;

const RECORD_TEXT_LEN: usize = 100;

/// SHA-256 over NUL-separated parts, hex encoded.
pub(crate) fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Snapshot-independent description of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub tag: String,
    /// Stable attribute subset, see `STABLE_ATTRIBUTES`.
    pub attributes: BTreeMap<String, String>,
    pub branch_path_hash: String,
    /// Per-level segment hashes from the root down, kept for diagnostics.
    #[serde(default)]
    pub branch_path: Vec<String>,
    pub depth: usize,
    pub sibling_index: usize,
    pub xpath: String,
    /// Index the element had when the record was taken.
    pub interaction_index: Option<u32>,
    #[serde(default)]
    pub text: String,
}

impl HistoryRecord {
    fn has_identity(&self) -> bool {
        IDENTITY_ATTRIBUTES
            .iter()
            .any(|k| self.attributes.contains_key(*k))
    }
}

/// How a record was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Same branch path hash.
    Exact,
    /// Tag and attributes matched near the original depth.
    Similar { score: usize },
}

/// A record resolved against a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub index: u32,
    pub node: NodeId,
    pub kind: MatchKind,
}

/// Describe `id` in `state` as a portable record.
pub fn to_history_record(state: &PageState, id: NodeId) -> Option<HistoryRecord> {
    let el = state.tree.element(id)?;

    let mut chain: Vec<&ElementNode> = vec![el];
    chain.extend(state.tree.ancestors(id).map(|(_, a)| a));
    chain.reverse();
    let branch_path = chain
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let parent_tag = if i == 0 { "" } else { chain[i - 1].tag.as_str() };
            hash_parts(&[parent_tag, &node.tag, &node.sibling_index.to_string()])
        })
        .collect();

    Some(HistoryRecord {
        tag: el.tag.clone(),
        attributes: stable_attributes(el),
        branch_path_hash: el.branch_path_hash.clone(),
        branch_path,
        depth: el.depth,
        sibling_index: el.sibling_index,
        xpath: el.xpath.clone(),
        interaction_index: el.interaction_index,
        text: truncate(&state.tree.text_until_next_interactive(id), RECORD_TEXT_LEN),
    })
}

/// Record for the element at interaction `index`.
pub fn record_for_index(state: &PageState, index: u32) -> Option<HistoryRecord> {
    let (id, _) = state.element(index)?;
    to_history_record(state, id)
}

/// Find the element `record` describes among the indexed elements of `state`.
///
/// Exact branch-path match first; otherwise the best attribute match of the
/// same tag within one level of the original depth. `None` means the element
/// is gone.
pub fn find_current(record: &HistoryRecord, state: &PageState) -> Option<Match> {
    let candidates = || {
        state.selector_map.iter().filter_map(|(&index, &id)| {
            let el = state.tree.element(id)?;
            Some((index, id, el))
        })
    };

    if let Some((index, id, el)) = candidates()
        .find(|(_, _, el)| el.branch_path_hash == record.branch_path_hash && el.tag == record.tag)
    {
        let text = state.tree.text_until_next_interactive(id);
        if !conflicts(record, &stable_attributes(el), &text) {
            return Some(Match {
                index,
                node: id,
                kind: MatchKind::Exact,
            });
        }
        debug!(index, xpath = %record.xpath, "branch path matched a different element");
    }

    let needed = record.attributes.len();
    let mut best: Option<(usize, usize, u32, NodeId)> = None;
    for (index, id, el) in candidates() {
        if el.tag != record.tag || el.depth.abs_diff(record.depth) > 1 {
            continue;
        }
        let attrs = stable_attributes(el);
        let text = state.tree.text_until_next_interactive(id);
        if conflicts(record, &attrs, &text) {
            continue;
        }
        let score = record
            .attributes
            .iter()
            .filter(|(k, v)| attrs.get(*k) == Some(*v))
            .count();
        if score == 0 || score * 2 < needed {
            continue;
        }
        let distance = el.sibling_index.abs_diff(record.sibling_index);
        let better = match best {
            None => true,
            Some((s, d, _, _)) => score > s || (score == s && distance < d),
        };
        if better {
            best = Some((score, distance, index, id));
        }
    }

    best.map(|(score, _, index, node)| {
        debug!(index, score, xpath = %record.xpath, "element re-identified by attributes");
        Match {
            index,
            node,
            kind: MatchKind::Similar { score },
        }
    })
}

/// Fingerprint of a page state: URL plus a sample of interactive branch hashes.
/// Two snapshots with the same signature show the same content.
pub fn state_signature(state: &PageState) -> String {
    let mut parts: Vec<&str> = vec![state.url.as_str()];
    parts.extend(
        state
            .selector_map
            .values()
            .take(SIGNATURE_SAMPLE)
            .filter_map(|id| state.tree.element(*id))
            .map(|el| el.branch_path_hash.as_str()),
    );
    hash_parts(&parts)
}

fn stable_attributes(el: &ElementNode) -> BTreeMap<String, String> {
    el.attributes
        .iter()
        .filter(|(k, _)| STABLE_ATTRIBUTES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn conflicts(record: &HistoryRecord, attrs: &BTreeMap<String, String>, text: &str) -> bool {
    for key in IDENTITY_ATTRIBUTES {
        if let Some(v) = record.attributes.get(*key) {
            if attrs.get(*key) != Some(v) {
                return true;
            }
        }
    }
    if let (Some(a), Some(b)) = (record.attributes.get("type"), attrs.get("type")) {
        if !a.eq_ignore_ascii_case(b) {
            return true;
        }
    }
    if !record.has_identity() {
        let text = truncate(text, RECORD_TEXT_LEN);
        if !record.text.is_empty() && !text.is_empty() && record.text != text {
            return true;
        }
    }
    false
}

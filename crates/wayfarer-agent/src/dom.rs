//! Element node model: an arena-backed mirror of the live document.
//!
//! Nodes are owned by the [`DomTree`] arena; parent links are plain
//! [`NodeId`]s, so a tree can be shared across threads behind an `Arc`
//! without any interior mutability.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a node inside its [`DomTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Bounding box in viewport coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// Zero-area boxes are never interactable.
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Center point, used for hover and overlay placement.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// An element in the snapshot tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    /// Lowercase tag name.
    pub tag: String,
    /// Attributes, ordered by name so that iteration is deterministic.
    pub attributes: BTreeMap<String, String>,
    /// Rendered with a non-empty box and no hidden ancestor.
    pub is_visible: bool,
    /// Passed the interactability test (independent of viewport filtering).
    pub is_interactive: bool,
    /// Inside the (expanded) viewport at capture time.
    pub is_in_viewport: bool,
    /// A file input, or an element wrapping one within a few levels.
    pub is_file_uploader: bool,
    /// Absolute XPath, e.g. `/html[1]/body[1]/div[2]/button[1]`.
    pub xpath: String,
    /// Hash of the sibling-position chain from the root.
    pub branch_path_hash: String,
    /// Bounding box, if the node was laid out.
    pub rect: Option<Rect>,
    /// Parent element, `None` for the root.
    pub parent: Option<NodeId>,
    /// Element and text children, in document order.
    pub children: Vec<NodeId>,
    /// Index the model uses to target this element. Unique within one snapshot.
    pub interaction_index: Option<u32>,
    /// Distance from the root (root is 0).
    pub depth: usize,
    /// 1-based position among same-tag element siblings.
    pub sibling_index: usize,
}

impl ElementNode {
    /// Attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// Input type, lowercased. Only meaningful for `<input>`.
    pub fn input_type(&self) -> Option<String> {
        self.attr("type").map(|t| t.to_ascii_lowercase())
    }
}

/// A text run between elements.
#[derive(Debug, Clone, PartialEq)]
pub struct TextNode {
    pub text: String,
    pub is_visible: bool,
    pub parent: Option<NodeId>,
}

/// Either kind of node stored in the arena.
#[derive(Debug, Clone, PartialEq)]
pub enum DomNode {
    Element(ElementNode),
    Text(TextNode),
}

impl DomNode {
    pub fn as_element(&self) -> Option<&ElementNode> {
        match self {
            DomNode::Element(e) => Some(e),
            DomNode::Text(_) => None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            DomNode::Element(e) => e.parent,
            DomNode::Text(t) => t.parent,
        }
    }
}

/// Immutable document tree. Built once by the snapshot builder.
#[derive(Debug, Clone, PartialEq)]
pub struct DomTree {
    nodes: Vec<DomNode>,
    root: NodeId,
}

impl DomTree {
    pub(crate) fn new(nodes: Vec<DomNode>, root: NodeId) -> Self {
        Self { nodes, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&DomNode> {
        self.nodes.get(id.0)
    }

    pub fn element(&self, id: NodeId) -> Option<&ElementNode> {
        self.node(id).and_then(DomNode::as_element)
    }

    /// All elements in arena (pre-order) order.
    pub fn elements(&self) -> impl Iterator<Item = (NodeId, &ElementNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_element().map(|e| (NodeId(i), e)))
    }

    /// Walk from `id`'s parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.node(id).and_then(DomNode::parent),
        }
    }

    /// CSS path equivalent to the element's XPath (`nth-of-type` per level).
    pub fn css_selector(&self, id: NodeId) -> Option<String> {
        let el = self.element(id)?;
        let mut parts = vec![format!("{}:nth-of-type({})", el.tag, el.sibling_index)];
        for (_, anc) in self.ancestors(id) {
            parts.push(format!("{}:nth-of-type({})", anc.tag, anc.sibling_index));
        }
        parts.reverse();
        Some(parts.join(" > "))
    }

    /// Visible text beneath `id`, stopping at nested indexed elements so a
    /// container does not swallow the labels of its own controls.
    pub fn text_until_next_interactive(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut stack: Vec<NodeId> = match self.element(id) {
            Some(el) => el.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            match self.node(next) {
                Some(DomNode::Text(t)) if t.is_visible => {
                    let trimmed = t.text.trim();
                    if !trimmed.is_empty() {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(trimmed);
                    }
                }
                Some(DomNode::Element(e)) if e.interaction_index.is_none() => {
                    stack.extend(e.children.iter().rev().copied());
                }
                _ => {}
            }
        }
        collapse_whitespace(&out)
    }
}

/// Iterator returned by [`DomTree::ancestors`].
pub struct Ancestors<'a> {
    tree: &'a DomTree,
    next: Option<NodeId>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = (NodeId, &'a ElementNode);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let el = self.tree.element(id)?;
        self.next = el.parent;
        Some((id, el))
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One line of the element list the model reads, e.g.
/// `[3] <input type="email"> "Email" placeholder="you@example.com"`.
pub struct ElementLine<'a> {
    pub index: u32,
    pub element: &'a ElementNode,
    pub text: String,
}

impl fmt::Display for ElementLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let el = self.element;
        write!(f, "[{}] <{}", self.index, el.tag)?;
        if el.tag == "input" {
            if let Some(t) = el.input_type() {
                if t != "text" {
                    write!(f, " type=\"{}\"", t)?;
                }
            }
        }
        f.write_str(">")?;
        if el.attributes.contains_key("checked") {
            f.write_str(" [checked]")?;
        }
        if el.is_file_uploader {
            f.write_str(" [file]")?;
        }
        let label = el
            .attr("aria-label")
            .map(str::to_string)
            .unwrap_or_else(|| self.text.clone());
        if !label.is_empty() {
            write!(f, " \"{}\"", truncate(&label, 60))?;
        }
        if let Some(v) = el.attr("value").filter(|v| !v.is_empty()) {
            if el.input_type().as_deref() != Some("password") {
                write!(f, " value=\"{}\"", truncate(v, 40))?;
            }
        }
        if let Some(p) = el.attr("placeholder") {
            write!(f, " placeholder=\"{}\"", p)?;
        }
        if let Some(r) = el.attr("role") {
            let redundant = (r == "button" && el.tag == "button")
                || (r == "link" && el.tag == "a")
                || (r == "menuitem" && el.tag == "a");
            if !redundant {
                write!(f, " role=\"{}\"", r)?;
            }
        }
        Ok(())
    }
}

/// Char-boundary-safe truncation with a trailing ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

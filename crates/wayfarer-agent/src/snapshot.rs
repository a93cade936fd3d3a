//! Snapshot builder: turns a raw document capture into an indexed [`PageState`].
//!
//! The live side ([`Surface::capture`]) only reports what the browser knows:
//! tags, attributes, boxes, computed visibility. Everything derived (XPath,
//! branch-path hashes, interactability, interaction indices) is computed
//! here, in Rust, so two captures of the same document always produce the
//! same tree.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dom::{DomNode, DomTree, ElementLine, ElementNode, NodeId, Rect, TextNode};
use crate::history::hash_parts;
use crate::surface::{ElementTarget, Highlight, Surface, SurfaceId};
use crate::{Error, Result};

/// How deep below an element we look for a file input.
const FILE_UPLOADER_DEPTH: usize = 3;

const INTERACTIVE_TAGS: &[&str] = &["a", "button", "input", "select", "textarea", "summary"];

const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "tab",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "checkbox",
    "radio",
    "switch",
    "option",
    "combobox",
    "textbox",
    "searchbox",
    "slider",
    "spinbutton",
    "treeitem",
];

/// One node as reported by the capture script, in document pre-order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    /// Index of the parent in the capture's node list. `None` only for the root.
    #[serde(default)]
    pub parent: Option<usize>,
    /// Lowercase tag; empty for text nodes.
    #[serde(default)]
    pub tag: String,
    /// Set for text nodes only.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attrs: Vec<(String, String)>,
    #[serde(default)]
    pub rect: Option<Rect>,
    /// The node itself computes to `display:none` / `visibility:hidden`.
    #[serde(default)]
    pub hidden: bool,
    /// Computed `cursor: pointer` not inherited from the parent.
    #[serde(default)]
    pub pointer: bool,
}

/// Flat document capture plus scroll metrics.
///
/// The list is flat (parent links, not nesting) so deep documents do not run
/// into the JSON parser's recursion limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub url: String,
    pub title: String,
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub scroll_y: f64,
    #[serde(default)]
    pub scroll_height: f64,
    #[serde(default)]
    pub viewport_height: f64,
    #[serde(default)]
    pub viewport_width: f64,
}

impl RawCapture {
    /// Empty capture with a default 1280x720 viewport.
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            nodes: Vec::new(),
            scroll_y: 0.0,
            scroll_height: 720.0,
            viewport_height: 720.0,
            viewport_width: 1280.0,
        }
    }

    /// Append an element and return its position.
    pub fn push_element(
        &mut self,
        parent: Option<usize>,
        tag: &str,
        attrs: &[(&str, &str)],
        rect: Option<Rect>,
    ) -> usize {
        self.nodes.push(RawNode {
            parent,
            tag: tag.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            rect,
            ..Default::default()
        });
        self.nodes.len() - 1
    }

    /// Append a text node and return its position.
    pub fn push_text(&mut self, parent: usize, text: &str) -> usize {
        self.nodes.push(RawNode {
            parent: Some(parent),
            text: Some(text.to_string()),
            ..Default::default()
        });
        self.nodes.len() - 1
    }
}

/// Options for [`SnapshotBuilder::build`].
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub include_screenshot: bool,
    /// Highlight only this index in the screenshot.
    pub focus_index: Option<u32>,
    /// Pixels above/below the viewport still indexed; negative indexes the whole page.
    pub viewport_expansion: i64,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            include_screenshot: false,
            focus_index: None,
            viewport_expansion: 500,
        }
    }
}

/// Immutable, indexed snapshot of one surface.
#[derive(Debug, Clone)]
pub struct PageState {
    pub surface_id: SurfaceId,
    pub url: String,
    pub title: String,
    pub tree: DomTree,
    /// Interaction index → element.
    pub selector_map: BTreeMap<u32, NodeId>,
    pub screenshot: Option<Vec<u8>>,
    pub scroll_y: f64,
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl PageState {
    /// Element carrying `index`, if any.
    pub fn element(&self, index: u32) -> Option<(NodeId, &ElementNode)> {
        let id = *self.selector_map.get(&index)?;
        self.tree.element(id).map(|el| (id, el))
    }

    /// Locators for the element at `index`.
    pub fn target(&self, index: u32) -> Option<ElementTarget> {
        let (id, el) = self.element(index)?;
        Some(ElementTarget {
            index,
            css: self.tree.css_selector(id)?,
            xpath: el.xpath.clone(),
            rect: el.rect,
        })
    }

    /// Compact text list for LLM consumption, one indexed element per line.
    pub fn element_list(&self) -> String {
        let mut out = String::with_capacity(self.selector_map.len() * 40);
        for (&index, &id) in &self.selector_map {
            if let Some(el) = self.tree.element(id) {
                let line = ElementLine {
                    index,
                    element: el,
                    text: self.tree.text_until_next_interactive(id),
                };
                out.push_str(&line.to_string());
                out.push('\n');
            }
        }
        out
    }

    pub fn pixels_above(&self) -> f64 {
        self.scroll_y.max(0.0)
    }

    pub fn pixels_below(&self) -> f64 {
        (self.scroll_height - self.scroll_y - self.viewport_height).max(0.0)
    }
}

/// Builds [`PageState`]s.
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Capture `surface` and build a snapshot of it.
    pub async fn build(surface: &dyn Surface, options: &SnapshotOptions) -> Result<PageState> {
        if surface.is_closed() {
            return Err(Error::SurfaceUnavailable(surface.id().to_string()));
        }
        let capture = surface.capture(options.viewport_expansion).await?;
        let mut state =
            Self::from_capture(surface.id().clone(), capture, options.viewport_expansion)?;

        if options.include_screenshot {
            let highlights: Vec<Highlight> = state
                .selector_map
                .iter()
                .filter(|(i, _)| options.focus_index.map_or(true, |f| f == **i))
                .filter_map(|(&index, &id)| {
                    let rect = state.tree.element(id)?.rect?;
                    Some(Highlight { index, rect })
                })
                .collect();
            state.screenshot = Some(surface.screenshot(&highlights).await?);
        }

        debug!(
            surface = %state.surface_id,
            url = %state.url,
            nodes = state.tree.len(),
            indexed = state.selector_map.len(),
            "snapshot built"
        );
        Ok(state)
    }

    /// Pure part of [`build`](Self::build): derive the tree from a capture.
    pub fn from_capture(
        surface_id: SurfaceId,
        capture: RawCapture,
        viewport_expansion: i64,
    ) -> Result<PageState> {
        let RawCapture {
            url,
            title,
            nodes: raw,
            scroll_y,
            scroll_height,
            viewport_height,
            ..
        } = capture;

        validate_order(&raw)?;

        let mut nodes: Vec<DomNode> = Vec::with_capacity(raw.len());
        let mut hidden = vec![false; raw.len()];
        let mut same_tag_counts: HashMap<(usize, String), usize> = HashMap::new();

        for (i, r) in raw.iter().enumerate() {
            let parent = r.parent;
            hidden[i] = r.hidden || parent.map_or(false, |p| hidden[p]);

            if let Some(text) = &r.text {
                nodes.push(DomNode::Text(TextNode {
                    text: text.clone(),
                    is_visible: !hidden[i],
                    parent: parent.map(NodeId),
                }));
                if let Some(p) = parent {
                    push_child(&mut nodes, p, i);
                }
                continue;
            }

            let tag = r.tag.to_ascii_lowercase();
            let (depth, sibling_index, xpath, branch_path_hash) = match parent {
                Some(p) => {
                    let parent_el = match &nodes[p] {
                        DomNode::Element(e) => e,
                        DomNode::Text(_) => {
                            return Err(Error::Capture(format!("node {} has a text parent", i)))
                        }
                    };
                    let count = same_tag_counts.entry((p, tag.clone())).or_insert(0);
                    *count += 1;
                    let sibling_index = *count;
                    let segment = hash_parts(&[&parent_el.tag, &tag, &sibling_index.to_string()]);
                    (
                        parent_el.depth + 1,
                        sibling_index,
                        format!("{}/{}[{}]", parent_el.xpath, tag, sibling_index),
                        hash_parts(&[&parent_el.branch_path_hash, &segment]),
                    )
                }
                None => {
                    let segment = hash_parts(&["", &tag, "1"]);
                    (0, 1, format!("/{}[1]", tag), hash_parts(&["", &segment]))
                }
            };

            let visible = !hidden[i] && r.rect.map_or(false, |b| !b.is_empty());
            let in_viewport = viewport_expansion < 0
                || r.rect.map_or(false, |b| {
                    let margin = viewport_expansion as f64;
                    b.y + b.height > -margin && b.y < viewport_height + margin
                });

            nodes.push(DomNode::Element(ElementNode {
                tag,
                attributes: r.attrs.iter().cloned().collect(),
                is_visible: visible,
                is_interactive: false,
                is_in_viewport: in_viewport,
                is_file_uploader: false,
                xpath,
                branch_path_hash,
                rect: r.rect,
                parent: parent.map(NodeId),
                children: Vec::new(),
                interaction_index: None,
                depth,
                sibling_index,
            }));
            if let Some(p) = parent {
                push_child(&mut nodes, p, i);
            }
        }

        // Interactability and uploader flags need complete child lists.
        let flags: Vec<(bool, bool)> = (0..nodes.len())
            .map(|i| match &nodes[i] {
                DomNode::Element(el) => (
                    is_interactable(&nodes, el, raw[i].pointer),
                    is_file_uploader(&nodes, el, FILE_UPLOADER_DEPTH),
                ),
                DomNode::Text(_) => (false, false),
            })
            .collect();

        let mut selector_map = BTreeMap::new();
        let mut next_index = 0u32;
        for (i, (interactive, uploader)) in flags.into_iter().enumerate() {
            if let DomNode::Element(el) = &mut nodes[i] {
                el.is_interactive = interactive;
                el.is_file_uploader = uploader;
                if interactive && el.is_in_viewport {
                    el.interaction_index = Some(next_index);
                    selector_map.insert(next_index, NodeId(i));
                    next_index += 1;
                }
            }
        }

        Ok(PageState {
            surface_id,
            url,
            title,
            tree: DomTree::new(nodes, NodeId(0)),
            selector_map,
            screenshot: None,
            scroll_y,
            scroll_height,
            viewport_height,
        })
    }
}

fn validate_order(raw: &[RawNode]) -> Result<()> {
    match raw.first() {
        None => return Err(Error::Capture("empty document".into())),
        Some(root) if root.parent.is_some() || root.text.is_some() => {
            return Err(Error::Capture("first node must be the root element".into()))
        }
        _ => {}
    }
    for (i, r) in raw.iter().enumerate().skip(1) {
        match r.parent {
            Some(p) if p < i => {}
            _ => {
                return Err(Error::Capture(format!(
                    "node {} is not in pre-order (parent {:?})",
                    i, r.parent
                )))
            }
        }
    }
    Ok(())
}

fn push_child(nodes: &mut [DomNode], parent: usize, child: usize) {
    if let DomNode::Element(p) = &mut nodes[parent] {
        p.children.push(NodeId(child));
    }
}

fn is_interactable(nodes: &[DomNode], el: &ElementNode, pointer: bool) -> bool {
    if !el.is_visible {
        return false;
    }
    if el.attributes.contains_key("disabled") || el.attr("aria-disabled") == Some("true") {
        return false;
    }
    if el.tag == "input" && el.input_type().as_deref() == Some("hidden") {
        return false;
    }
    // A link or button wrapping exactly one native control defers to the control.
    if el.tag == "a" || el.tag == "button" {
        let element_children: Vec<&ElementNode> = el
            .children
            .iter()
            .filter_map(|c| nodes.get(c.0).and_then(DomNode::as_element))
            .collect();
        if let [only] = element_children.as_slice() {
            if only.tag == "button" || only.tag == "input" {
                return false;
            }
        }
    }

    INTERACTIVE_TAGS.contains(&el.tag.as_str())
        || el
            .attr("role")
            .map_or(false, |r| INTERACTIVE_ROLES.contains(&r))
        || el.attributes.contains_key("onclick")
        || el
            .attr("contenteditable")
            .map_or(false, |v| v.is_empty() || v == "true")
        || el
            .attr("tabindex")
            .and_then(|t| t.parse::<i32>().ok())
            .map_or(false, |t| t >= 0)
        || pointer
}

fn is_file_input(el: &ElementNode) -> bool {
    (el.tag == "input" && el.input_type().as_deref() == Some("file"))
        || el.attributes.contains_key("accept")
}

fn is_file_uploader(nodes: &[DomNode], el: &ElementNode, max_depth: usize) -> bool {
    if is_file_input(el) {
        return true;
    }
    if max_depth == 0 {
        return false;
    }
    el.children.iter().any(|c| match nodes.get(c.0) {
        Some(DomNode::Element(child)) => is_file_uploader(nodes, child, max_depth - 1),
        _ => false,
    })
}

//! Page access.
//!
//! The watcher never talks to a rendering engine directly. It goes through
//! [`Dom`] for reading the tree and [`MutationSource`] for subscribing to
//! insertions. [`Document`] is an arena-backed implementation of both, used by
//! the command line (pages loaded from JSON snapshots) and by the tests.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::selector::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

/// Resolved style properties inspected by the color predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StyleChannel {
    BackgroundColor,
    Color,
    BorderColor,
    Fill,
    Stroke,
}

impl StyleChannel {
    pub const ALL: [StyleChannel; 5] = [
        StyleChannel::BackgroundColor,
        StyleChannel::Color,
        StyleChannel::BorderColor,
        StyleChannel::Fill,
        StyleChannel::Stroke,
    ];

    pub fn property(self) -> &'static str {
        match self {
            StyleChannel::BackgroundColor => "background-color",
            StyleChannel::Color => "color",
            StyleChannel::BorderColor => "border-color",
            StyleChannel::Fill => "fill",
            StyleChannel::Stroke => "stroke",
        }
    }

    /// Inherited properties resolve from the nearest ancestor that sets them.
    pub fn is_inherited(self) -> bool {
        matches!(self, StyleChannel::Color | StyleChannel::Fill | StyleChannel::Stroke)
    }
}

/// One insertion observed under the document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub added_nodes: Vec<NodeId>,
}

/// All records queued for one observer since the previous delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    pub observer: ObserverId,
    pub records: Vec<MutationRecord>,
}

pub type MutationSink = mpsc::UnboundedSender<MutationBatch>;

/// Read access to a rendered page.
pub trait Dom {
    fn url(&self) -> &str;

    fn is_element(&self, node: NodeId) -> bool;

    fn parent_element(&self, node: NodeId) -> Option<NodeId>;

    /// Element children in document order.
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Uppercase tag name, as the page reports it.
    fn tag_name(&self, node: NodeId) -> Option<&str>;

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str>;

    /// Rendered text; block boundaries become newlines.
    fn rendered_text(&self, node: NodeId) -> String;

    fn computed_style(&self, node: NodeId, channel: StyleChannel) -> Option<String>;

    fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        selector.matches(self, node)
    }

    /// Matching descendants of `node`, excluding `node` itself.
    fn query_selector_all(&self, node: NodeId, selector: &Selector) -> Vec<NodeId> {
        let mut out = self.subtree(node);
        out.remove(0);
        out.retain(|n| self.matches(*n, selector));
        out
    }

    /// `node` followed by every element below it, pre-order.
    fn subtree(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).into_iter().rev());
        }
        out
    }
}

/// Subscription to insertions under the document root.
pub trait MutationSource {
    fn observe(&mut self, sink: MutationSink) -> ObserverId;

    fn disconnect(&mut self, observer: ObserverId);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("node {0:?} cannot have children")]
    NotAContainer(NodeId),
    #[error("node {0:?} is already attached")]
    AlreadyAttached(NodeId),
    #[error("appending {child:?} under {parent:?} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
}

/// Serialized page fragment.
///
/// ```json
/// {"tag": "div", "attrs": {"class": "cal"},
///  "style": {"background-color": "rgb(20, 163, 139)"},
///  "children": ["Available now"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NodeSnapshot {
    Text(String),
    Element(ElementSnapshot),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ElementSnapshot {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub style: HashMap<StyleChannel, String>,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

/// A whole page: its URL and the children of `<body>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageSnapshot {
    #[serde(default = "default_page_url")]
    pub url: String,
    #[serde(default)]
    pub body: Vec<NodeSnapshot>,
}

fn default_page_url() -> String {
    "about:blank".to_string()
}

#[derive(Debug, Clone)]
struct ElementData {
    tag: String,
    attrs: BTreeMap<String, String>,
    style: HashMap<StyleChannel, String>,
}

#[derive(Debug, Clone)]
enum NodeData {
    Element(ElementData),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

/// In-memory page.
#[derive(Debug)]
pub struct Document {
    url: String,
    nodes: Vec<Node>,
    body: NodeId,
    observers: BTreeMap<ObserverId, Observer>,
    next_observer: u64,
}

/// A subscriber and the records queued for it since the last flush.
#[derive(Debug)]
struct Observer {
    sink: MutationSink,
    pending: Vec<MutationRecord>,
}

impl Document {
    pub fn new(url: impl Into<String>) -> Self {
        let body = Node {
            parent: None,
            children: Vec::new(),
            data: NodeData::Element(ElementData {
                tag: "BODY".to_string(),
                attrs: BTreeMap::new(),
                style: HashMap::new(),
            }),
        };
        Self {
            url: url.into(),
            nodes: vec![body],
            body: NodeId(0),
            observers: BTreeMap::new(),
            next_observer: 1,
        }
    }

    pub fn from_snapshot(page: &PageSnapshot) -> Self {
        let mut doc = Self::new(page.url.clone());
        for child in &page.body {
            let id = doc.build(child);
            doc.attach(doc.body, id);
        }
        doc
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeData::Element(ElementData {
            tag: tag.to_ascii_uppercase(),
            attrs: BTreeMap::new(),
            style: HashMap::new(),
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(element) = self.element_mut(node) {
            element.attrs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_style(&mut self, node: NodeId, channel: StyleChannel, value: &str) {
        if let Some(element) = self.element_mut(node) {
            element.style.insert(channel, value.to_string());
        }
    }

    /// Build a detached subtree from a snapshot.
    pub fn build(&mut self, snapshot: &NodeSnapshot) -> NodeId {
        match snapshot {
            NodeSnapshot::Text(text) => self.create_text(text),
            NodeSnapshot::Element(element) => {
                let id = self.push(NodeData::Element(ElementData {
                    tag: element.tag.to_ascii_uppercase(),
                    attrs: element.attrs.clone(),
                    style: element.style.clone(),
                }));
                for child in &element.children {
                    let child_id = self.build(child);
                    self.attach(id, child_id);
                }
                id
            }
        }
    }

    /// Build `snapshot` and append it under `parent`.
    pub fn insert_snapshot(
        &mut self,
        parent: NodeId,
        snapshot: &NodeSnapshot,
    ) -> Result<NodeId, DomError> {
        self.check_container(parent)?;
        let id = self.build(snapshot);
        self.append_child(parent, id)?;
        Ok(id)
    }

    /// Append `child` under `parent`. Insertions into the connected tree are
    /// queued as mutation records until [`Document::flush_mutations`].
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.check_container(parent)?;
        let node = self.nodes.get(child.0).ok_or(DomError::UnknownNode(child))?;
        if node.parent.is_some() || child == self.body {
            return Err(DomError::AlreadyAttached(child));
        }
        if self.ancestors_and_self(parent).any(|n| n == child) {
            return Err(DomError::Cycle { parent, child });
        }

        self.attach(parent, child);
        if self.is_connected(parent) {
            for observer in self.observers.values_mut() {
                observer.pending.push(MutationRecord {
                    added_nodes: vec![child],
                });
            }
        }
        Ok(())
    }

    /// Deliver each observer's queued records to it as one batch.
    pub fn flush_mutations(&mut self) {
        self.observers.retain(|id, observer| {
            if observer.pending.is_empty() {
                return true;
            }
            observer
                .sink
                .send(MutationBatch {
                    observer: *id,
                    records: std::mem::take(&mut observer.pending),
                })
                .is_ok()
        });
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            data,
        });
        NodeId(self.nodes.len() - 1)
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    fn check_container(&self, node: NodeId) -> Result<(), DomError> {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Element(_)) => Ok(()),
            Some(NodeData::Text(_)) => Err(DomError::NotAContainer(node)),
            None => Err(DomError::UnknownNode(node)),
        }
    }

    fn element(&self, node: NodeId) -> Option<&ElementData> {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node: NodeId) -> Option<&mut ElementData> {
        match self.nodes.get_mut(node.0).map(|n| &mut n.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn ancestors_and_self(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(node), move |n| {
            self.nodes.get(n.0).and_then(|node| node.parent)
        })
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.ancestors_and_self(node).any(|n| n == self.body)
    }

    fn collect_text(&self, node: NodeId, out: &mut String) {
        let Some(n) = self.nodes.get(node.0) else {
            return;
        };
        match &n.data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Element(element) if element.tag == "BR" => out.push('\n'),
            NodeData::Element(element) => {
                let block = !is_inline(&element.tag);
                if block {
                    out.push('\n');
                }
                for child in &n.children {
                    self.collect_text(*child, out);
                }
                if block {
                    out.push('\n');
                }
            }
        }
    }
}

/// Elements laid out inline; their text runs on without a break.
fn is_inline(tag: &str) -> bool {
    matches!(
        tag,
        "A" | "ABBR" | "B" | "BDI" | "BDO" | "BUTTON" | "CITE" | "CODE" | "DATA" | "DFN" | "EM"
            | "FONT" | "I" | "IMG" | "INPUT" | "KBD" | "LABEL" | "MARK" | "Q" | "S" | "SAMP"
            | "SELECT" | "SMALL" | "SPAN" | "STRONG" | "SUB" | "SUP" | "SVG" | "TEXTAREA"
            | "TIME" | "U" | "VAR"
    )
}

impl Dom for Document {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_element(&self, node: NodeId) -> bool {
        self.element(node).is_some()
    }

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node.0)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|c| self.is_element(*c))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tag_name(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|e| e.tag.as_str())
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node)
            .and_then(|e| e.attrs.get(name))
            .map(String::as_str)
    }

    fn rendered_text(&self, node: NodeId) -> String {
        let mut raw = String::new();
        self.collect_text(node, &mut raw);
        raw.split('\n')
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn computed_style(&self, node: NodeId, channel: StyleChannel) -> Option<String> {
        if !channel.is_inherited() {
            return self.element(node)?.style.get(&channel).cloned();
        }
        self.ancestors_and_self(node)
            .find_map(|n| self.element(n).and_then(|e| e.style.get(&channel)))
            .cloned()
    }
}

impl MutationSource for Document {
    fn observe(&mut self, sink: MutationSink) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.insert(
            id,
            Observer {
                sink,
                pending: Vec::new(),
            },
        );
        id
    }

    fn disconnect(&mut self, observer: ObserverId) {
        // Records not yet flushed to this observer are dropped with it.
        self.observers.remove(&observer);
    }
}

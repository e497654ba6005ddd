//! In-process model of a rendered page.
//!
//! Nodes live in an arena owned by [`Document`] and are addressed by
//! [`NodeId`]. Ids stay valid after a node is detached, which lets tracked
//! paragraphs hold a non-owning reference to an element the page may remove
//! at any time.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub struct ElementData {
    tag: String,
    attributes: BTreeMap<String, String>,
}

impl ElementData {
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Document,
    Element(ElementData),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Structural change reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomMutation {
    /// An element (with its subtree) was inserted into the connected tree.
    ElementAdded(NodeId),
}

pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    subscribers: Vec<mpsc::UnboundedSender<DomMutation>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
            root: NodeId(0),
            body: NodeId(0),
            subscribers: Vec::new(),
        };
        let html = doc.create_element("html");
        let body = doc.create_element("body");
        doc.attach(doc.root, html);
        doc.attach(html, body);
        doc.body = body;
        doc
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Registers for insertion notifications. Dropped receivers are pruned on
    /// the next mutation.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DomMutation> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element(ElementData {
            tag: tag.to_ascii_uppercase(),
            attributes: BTreeMap::new(),
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Comment(text.to_string()))
    }

    /// Moves `child` under `parent`. Subscribers hear about it when the
    /// parent is connected and the child is an element.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.attach(parent, child);
        if self.is_element(child) && self.is_connected(parent) {
            let mutation = DomMutation::ElementAdded(child);
            self.subscribers.retain(|tx| tx.send(mutation).is_ok());
        }
    }

    pub fn append_element(&mut self, parent: NodeId, tag: &str) -> NodeId {
        let element = self.create_element(tag);
        self.append_child(parent, element);
        element
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        let node = self.create_text(text);
        self.append_child(parent, node);
        node
    }

    /// Detaches `node` from its parent. The node and its subtree stay
    /// addressable.
    pub fn remove(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|&c| c != node);
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        let mut current = node;
        loop {
            if current == self.root {
                return true;
            }
            match self.nodes[current.0].parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    pub fn kind(&self, node: NodeId) -> &NodeKind {
        &self.nodes[node.0].kind
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        matches!(self.nodes[node.0].kind, NodeKind::Element(_))
    }

    /// Upper-case tag name, `None` for non-elements.
    pub fn tag_name(&self, node: NodeId) -> Option<&str> {
        match &self.nodes[node.0].kind {
            NodeKind::Element(data) => Some(data.tag()),
            _ => None,
        }
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes[node.0].kind {
            NodeKind::Element(data) => data.attributes.get(name).map(String::as_str),
            _ => None,
        }
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let NodeKind::Element(data) = &mut self.nodes[node.0].kind {
            data.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .map(|list| list.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if self.has_class(node, class) || !self.is_element(node) {
            return;
        }
        let updated = match self.attribute(node, "class") {
            Some(existing) if !existing.trim().is_empty() => format!("{existing} {class}"),
            _ => class.to_string(),
        };
        self.set_attribute(node, "class", &updated);
    }

    pub fn child_nodes(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    pub fn element_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[node.0]
            .children
            .iter()
            .copied()
            .filter(|&child| self.is_element(child))
    }

    /// Descendants in document order, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[node.0].children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.nodes[current.0].children.iter().rev().copied());
        }
        out
    }

    /// First of `node` and its ancestors matching `pred`.
    pub fn closest<F>(&self, node: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(&Document, NodeId) -> bool,
    {
        let mut current = Some(node);
        while let Some(candidate) = current {
            if self.is_element(candidate) && pred(self, candidate) {
                return Some(candidate);
            }
            current = self.nodes[candidate.0].parent;
        }
        None
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, node: NodeId) -> String {
        if let NodeKind::Text(text) = &self.nodes[node.0].kind {
            return text.clone();
        }
        let mut out = String::new();
        for descendant in self.descendants(node) {
            if let NodeKind::Text(text) = &self.nodes[descendant.0].kind {
                out.push_str(text);
            }
        }
        out
    }

    /// Replaces every child of `node` with a single text node.
    pub fn set_text_content(&mut self, node: NodeId, text: &str) {
        let children = std::mem::take(&mut self.nodes[node.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
        if !text.is_empty() {
            let text_node = self.create_text(text);
            self.attach(node, text_node);
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.remove(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_skips_comments() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, "Hello ");
        let b = doc.append_element(p, "b");
        doc.append_text(b, "world");
        let comment = doc.create_comment("ignored");
        doc.append_child(p, comment);

        assert_eq!(doc.text_content(p), "Hello world");
    }

    #[test]
    fn set_text_content_detaches_children() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        let span = doc.append_element(p, "span");
        doc.set_text_content(p, "plain");

        assert_eq!(doc.text_content(p), "plain");
        assert_eq!(doc.element_children(p).count(), 0);
        assert!(!doc.is_connected(span));
    }

    #[test]
    fn subscribers_only_hear_connected_insertions() {
        let mut doc = Document::new();
        let mut rx = doc.subscribe();

        let detached = doc.create_element("div");
        let inner = doc.append_element(detached, "p");
        assert!(rx.try_recv().is_err());

        doc.append_child(doc.body(), detached);
        assert_eq!(rx.try_recv().unwrap(), DomMutation::ElementAdded(detached));
        assert!(rx.try_recv().is_err());
        assert!(doc.is_connected(inner));
    }

    #[test]
    fn closest_includes_self() {
        let mut doc = Document::new();
        let popup = doc.append_element(doc.body(), "div");
        doc.set_attribute(popup, "id", "esm-popup");
        let label = doc.append_element(popup, "label");

        let found = doc.closest(label, |d, n| d.attribute(n, "id") == Some("esm-popup"));
        assert_eq!(found, Some(popup));
        assert_eq!(
            doc.closest(popup, |d, n| d.attribute(n, "id") == Some("esm-popup")),
            Some(popup)
        );
    }

    #[test]
    fn classes_are_deduplicated() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.add_class(p, "a");
        doc.add_class(p, "b");
        doc.add_class(p, "a");
        assert_eq!(doc.attribute(p, "class"), Some("a b"));
        assert!(doc.has_class(p, "b"));
    }
}

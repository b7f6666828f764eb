//! The uniform node tree both builders produce and the matcher walks.
//!
//! Nodes live in an arena owned by [`Tree`]; [`NodeId`] is an index into it.
//! Parent references and node links are ids rather than pointers, so the
//! tree is freely shareable and immutable once built. Walks borrow it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

pub mod html;
pub mod json;

/// Errors reported while building a tree from an input payload.
///
/// A build error is fatal for the payload: no partial tree is observable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The input payload was empty.
    #[error("input payload is empty")]
    Empty,

    /// The input payload was not valid JSON.
    #[error("parse input as json")]
    Json(#[from] serde_json::Error),
}

/// Which builder produced a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    /// Element nodes from the HTML builder.
    Html,
    /// Keyed nodes from the JSON builder.
    Json,
}

/// Identifies a node within its tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display,
)]
#[display(fmt = "#{}", _0)]
pub struct NodeId(pub(crate) usize);

/// How a keyed node is addressed by its parent: integer indices under list
/// parents, strings under object parents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// A list position.
    Index(i64),
    /// An object member name.
    Name(String),
}

impl Key {
    /// The key as a runtime value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Index(n) => Value::Int(*n),
            Key::Name(s) => Value::String(s.clone()),
        }
    }

    /// Whether the key equals the given runtime value.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Key::Index(n), Value::Int(v)) => n == v,
            (Key::Name(s), Value::String(v)) => s == v,
            _ => false,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Index(n) => write!(f, "{n}"),
            Key::Name(s) => write!(f, "{s}"),
        }
    }
}

/// The payload of a keyed node.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A leaf scalar (null, bool, number or string).
    Scalar(Value),
    /// A list container; children carry integer keys.
    List,
    /// An object container; children carry string keys.
    Object,
}

/// Type-specific node content.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    /// An HTML element.
    Element {
        /// Lowercased tag name.
        tag: String,
        /// Lowercased attribute names mapped to raw values; `class` and `id`
        /// first, remaining attributes in declaration order.
        attrs: IndexMap<String, String>,
        /// Character data before the first child.
        text: String,
        /// Character data after this element's close tag.
        tail: String,
    },
    /// A JSON value addressed by its parent.
    Keyed {
        /// The parent's addressing of this node.
        key: Key,
        /// Scalar payload or container kind.
        payload: Payload,
    },
}

/// A single node in the arena.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) index: usize,
    pub(crate) depth: usize,
    pub(crate) data: NodeData,
}

impl Node {
    /// The parent node, absent at the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Ordered child ids.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The node's position among its siblings.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Distance from the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Type-specific content.
    pub fn data(&self) -> &NodeData {
        &self.data
    }

    /// Lowercased tag name, for element nodes.
    pub fn tag(&self) -> Option<&str> {
        match &self.data {
            NodeData::Element { tag, .. } => Some(tag),
            NodeData::Keyed { .. } => None,
        }
    }

    /// Attribute value by lowercased name, for element nodes.
    pub fn attr(&self, name: &str) -> Option<&str> {
        match &self.data {
            NodeData::Element { attrs, .. } => attrs.get(&name.to_lowercase()).map(String::as_str),
            NodeData::Keyed { .. } => None,
        }
    }

    /// Text before the first child, for element nodes.
    pub fn text(&self) -> &str {
        match &self.data {
            NodeData::Element { text, .. } => text,
            NodeData::Keyed { .. } => "",
        }
    }

    /// Text after the close tag, for element nodes.
    pub fn tail(&self) -> &str {
        match &self.data {
            NodeData::Element { tail, .. } => tail,
            NodeData::Keyed { .. } => "",
        }
    }

    /// The parent's addressing of this node, for keyed nodes.
    pub fn key(&self) -> Option<&Key> {
        match &self.data {
            NodeData::Keyed { key, .. } => Some(key),
            NodeData::Element { .. } => None,
        }
    }

    /// The scalar payload, for keyed leaves; [`Value::Null`] for containers
    /// and element nodes.
    pub fn scalar(&self) -> Value {
        match &self.data {
            NodeData::Keyed {
                payload: Payload::Scalar(value),
                ..
            } => value.clone(),
            _ => Value::Null,
        }
    }
}

/// An immutable document tree.
#[derive(Debug, Clone)]
pub struct Tree {
    kind: TreeKind,
    nodes: Vec<Node>,
}

impl Tree {
    /// Parse an HTML payload into a tree. See [`html::build`].
    pub fn from_html(
        input: &str,
        options: &html::Options,
    ) -> Result<(Tree, flagset::FlagSet<crate::status::Soft>), BuildError> {
        html::build(input, options)
    }

    /// Parse a JSON payload into a tree. See [`json::build_str`].
    pub fn from_json_str(
        input: &str,
        sorts: &[json::SortDirective],
    ) -> Result<(Tree, flagset::FlagSet<crate::status::Soft>), BuildError> {
        json::build_str(input, sorts)
    }

    /// Build a tree from an already-parsed JSON payload. See [`json::build`].
    pub fn from_json(
        payload: serde_json::Value,
        sorts: &[json::SortDirective],
    ) -> (Tree, flagset::FlagSet<crate::status::Soft>) {
        json::build(payload, sorts)
    }

    pub(crate) fn new(kind: TreeKind, root: NodeData) -> Self {
        Self {
            kind,
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                index: 0,
                depth: 0,
                data: root,
            }],
        }
    }

    /// Which builder produced this tree.
    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Total node count, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Ordered children of a node.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// The child of a keyed node addressed by the given key value.
    pub fn child_by_key(&self, id: NodeId, key: &Value) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|child| self.node(*child).key().is_some_and(|k| k.matches(key)))
    }

    pub(crate) fn push(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        let index = self.nodes[parent.0].children.len();
        let depth = self.nodes[parent.0].depth + 1;
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            index,
            depth,
            data,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn fmt_node(&self, f: &mut std::fmt::Formatter<'_>, id: NodeId) -> std::fmt::Result {
        let node = self.node(id);
        let pad = "    ".repeat(node.depth);
        match &node.data {
            NodeData::Element {
                tag,
                attrs,
                text,
                tail,
            } => {
                let attrs = attrs
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{v}\""))
                    .collect::<Vec<_>>()
                    .join(" ");
                write!(f, "{pad}{}: <{tag}", node.depth)?;
                if !attrs.is_empty() {
                    write!(f, " {attrs}")?;
                }
                write!(f, "> [{}]", node.index)?;
                if !text.is_empty() {
                    write!(f, " {text:?}")?;
                }
                if !tail.is_empty() {
                    write!(f, " tail={tail:?}")?;
                }
                writeln!(f)?;
            }
            NodeData::Keyed { key, payload } => {
                let shown = match payload {
                    Payload::Scalar(value) => format!("{value}"),
                    Payload::List => "\"list\"".to_owned(),
                    Payload::Object => "\"dict\"".to_owned(),
                };
                writeln!(f, "{pad}{key} = {shown}")?;
            }
        }
        for child in &node.children {
            self.fmt_node(f, *child)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Tree {
    /// Renders the whole tree with one indented line per node, for data
    /// definition development.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_node(f, self.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree {
        let mut tree = Tree::new(
            TreeKind::Html,
            NodeData::Element {
                tag: "root".into(),
                attrs: IndexMap::new(),
                text: String::new(),
                tail: String::new(),
            },
        );
        let ul = tree.push(
            tree.root(),
            NodeData::Element {
                tag: "ul".into(),
                attrs: IndexMap::new(),
                text: String::new(),
                tail: String::new(),
            },
        );
        for label in ["a", "b"] {
            tree.push(
                ul,
                NodeData::Element {
                    tag: "li".into(),
                    attrs: IndexMap::new(),
                    text: label.into(),
                    tail: String::new(),
                },
            );
        }
        tree
    }

    #[test]
    fn sibling_indices_are_dense() {
        let tree = sample();
        let ul = tree.children(tree.root())[0];
        let indexes: Vec<_> = tree
            .children(ul)
            .iter()
            .map(|id| tree.node(*id).index())
            .collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn depth_tracks_ancestry() {
        let tree = sample();
        let ul = tree.children(tree.root())[0];
        let li = tree.children(ul)[0];
        assert_eq!(tree.node(tree.root()).depth(), 0);
        assert_eq!(tree.node(ul).depth(), 1);
        assert_eq!(tree.node(li).depth(), 2);
        assert!(tree.node(tree.root()).parent().is_none());
    }
}

//! Walks a tree under the guidance of a compiled path.
//!
//! The walk processes path steps left to right, recursing over matching
//! candidates. Candidate order is the tree's declared sibling order
//! (reversed under the `last` modifier), disjunctions evaluate left to
//! right, and conjunctions short-circuit, so a walk over an immutable tree
//! is fully deterministic.
//!
//! Link conditions inside predicates are runtime-recoverable: a predicate
//! consulting a link that no earlier step stored simply fails its candidate
//! and reports a parse warning. The compile-time registries make this rare;
//! it still happens when a storing step matched nothing.

use std::collections::HashMap;

use tracing::trace;

use crate::def::model::{
    Axis, EntryTest, LinkId, LinkRef, NodeStep, PathDef, Relation, Selector, ValueRef,
};
use crate::def::TreeConfig;
use crate::pipeline::Anchor;
use crate::tree::{Node, NodeData, NodeId, Tree};
use crate::value::Value;
use crate::warn::{Category, Severity, Warner};

/// The mutable state of one walk: captured values and node back-references,
/// both keyed by link id. Visible to every later step of the same walk.
#[derive(Debug, Clone, Default)]
pub struct LinkEnv {
    /// Captured values, consulted by predicates and seeded into records.
    pub values: HashMap<LinkId, Value>,

    /// Node back-references, usable as the start of a relative path.
    pub nodes: HashMap<LinkId, NodeId>,
}

/// One terminal result of a walk.
#[derive(Debug, Clone)]
pub struct LeafHit {
    /// The node the walk ended on.
    pub node: NodeId,

    /// The captured value, when the path ended in a value capture.
    pub value: Option<Value>,

    /// Snapshot of the link environment at the moment of emission.
    pub env: LinkEnv,
}

/// A walk result: a leaf, or one level of grouping produced by a
/// name-capture step.
#[derive(Debug, Clone)]
pub enum Hit {
    /// A terminal node, with its captured value.
    Leaf(LeafHit),

    /// Results grouped under a computed name.
    Group {
        /// The computed group name.
        name: String,
        /// The grouped results.
        hits: Vec<Hit>,
    },
}

/// Collect every leaf in order, descending into groups.
pub fn leaves<'a>(hits: &'a [Hit]) -> Vec<&'a LeafHit> {
    let mut found = Vec::new();
    fn descend<'a>(hits: &'a [Hit], found: &mut Vec<&'a LeafHit>) {
        for hit in hits {
            match hit {
                Hit::Leaf(leaf) => found.push(leaf),
                Hit::Group { hits, .. } => descend(hits, found),
            }
        }
    }
    descend(hits, &mut found);
    found
}

/// Everything a walk needs to read: the tree, the definition's formatting
/// defaults, the current-date anchor, and the warning handle.
pub struct Walker<'a> {
    pub(crate) tree: &'a Tree,
    pub(crate) config: &'a TreeConfig,
    pub(crate) anchor: &'a Anchor,
    pub(crate) warner: &'a Warner,
}

impl<'a> Walker<'a> {
    /// Bundle up walk state.
    pub fn new(
        tree: &'a Tree,
        config: &'a TreeConfig,
        anchor: &'a Anchor,
        warner: &'a Warner,
    ) -> Self {
        Self {
            tree,
            config,
            anchor,
            warner,
        }
    }

    /// Walk a compiled path from the given start node.
    ///
    /// An empty path yields the start node as a single leaf with no value.
    #[tracing::instrument(skip_all, fields(start = %start, steps = path.steps.len()))]
    pub fn walk(&self, start: NodeId, path: &PathDef, env: &mut LinkEnv) -> Vec<Hit> {
        let mut out = Vec::new();
        self.walk_steps(start, &path.steps, env, &mut out);
        out
    }

    fn walk_steps(
        &self,
        node: NodeId,
        steps: &[NodeStep],
        env: &mut LinkEnv,
        out: &mut Vec<Hit>,
    ) {
        let Some((step, rest)) = steps.split_first() else {
            out.push(Hit::Leaf(LeafHit {
                node,
                value: None,
                env: env.clone(),
            }));
            return;
        };

        match step {
            NodeStep::Select(selector) => self.select(node, selector, rest, env, out),
            NodeStep::StoreNode(id) => {
                env.nodes.insert(*id, node);
                self.walk_steps(node, rest, env, out);
            }
            NodeStep::Name(capture) => {
                let name = self.value(node, capture, env);
                let mut grouped = Vec::new();
                self.walk_steps(node, rest, env, &mut grouped);
                if name.is_null() {
                    out.extend(grouped);
                } else {
                    out.push(Hit::Group {
                        name: name.render(),
                        hits: grouped,
                    });
                }
            }
            NodeStep::Value(capture) => {
                let value = self.value(node, capture, env);
                if let Some(id) = capture.link {
                    env.values.insert(id, value.clone());
                }
                if capture.emit {
                    trace!(node = %node, value = %value, "emit");
                    out.push(Hit::Leaf(LeafHit {
                        node,
                        value: Some(value),
                        env: env.clone(),
                    }));
                } else {
                    self.walk_steps(node, rest, env, out);
                }
            }
        }
    }

    fn select(
        &self,
        node: NodeId,
        selector: &Selector,
        rest: &[NodeStep],
        env: &mut LinkEnv,
        out: &mut Vec<Hit>,
    ) {
        match selector.axis {
            // All-children only widens the candidate set; populated
            // predicates still apply to each candidate.
            Axis::Children | Axis::AllChildren => {
                let children = self.tree.children(node);
                let ordered: Vec<NodeId> = if selector.last {
                    children.iter().rev().copied().collect()
                } else {
                    children.to_vec()
                };
                for candidate in ordered {
                    if !self.matches(candidate, selector, env) {
                        continue;
                    }
                    self.store_capture(candidate, selector, env);
                    let before = out.len();
                    self.walk_steps(candidate, rest, env, out);
                    if (selector.first || selector.last) && out.len() > before {
                        break;
                    }
                }
            }
            Axis::Parent => {
                if let Some(parent) = self.tree.node(node).parent() {
                    self.store_capture(parent, selector, env);
                    self.walk_steps(parent, rest, env, out);
                }
            }
            Axis::Root => {
                let root = self.tree.root();
                self.store_capture(root, selector, env);
                self.walk_steps(root, rest, env, out);
            }
            Axis::SavedLink(id) => match env.nodes.get(&id).copied() {
                Some(saved) => {
                    self.store_capture(saved, selector, env);
                    self.walk_steps(saved, rest, env, out);
                }
                None => {
                    self.warner.warn(
                        Category::Parse,
                        Severity::InvalidData,
                        format!("node link {id} consulted before any step stores it"),
                    );
                }
            },
        }
    }

    fn store_capture(&self, node: NodeId, selector: &Selector, env: &mut LinkEnv) {
        if let Some(store) = &selector.store {
            let value = self.value(node, &store.capture, env);
            env.values.insert(store.id, value);
        }
    }

    /// Evaluate every populated predicate against a candidate; conjunctions
    /// short-circuit on the first failure.
    fn matches(&self, candidate: NodeId, selector: &Selector, env: &LinkEnv) -> bool {
        let node = self.tree.node(candidate);

        if let Some(index) = &selector.index {
            if !self.index_matches(node.index(), index, env) {
                return false;
            }
        }

        match node.data() {
            NodeData::Element { .. } => self.matches_element(node, selector, env),
            NodeData::Keyed { .. } => self.matches_keyed(candidate, node, selector, env),
        }
    }

    fn matches_element(&self, node: &Node, selector: &Selector, env: &LinkEnv) -> bool {
        // Keyed-tree predicates never hold on an element.
        if selector.key.is_some()
            || !selector.keys.is_empty()
            || !selector.child_keys.is_empty()
            || !selector.not_child_keys.is_empty()
        {
            return false;
        }

        if let Some(expected) = &selector.tag {
            match self.resolve(expected, env) {
                // A null tag matches any element.
                Some(Value::Null) => {}
                Some(value) => {
                    if node.tag() != Some(value.render().to_lowercase().as_str()) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if !selector.tags.is_empty() {
            let Some(tag) = node.tag() else { return false };
            if !selector.tags.iter().any(|t| t == tag) {
                return false;
            }
        }

        if let Some(text) = &selector.text {
            if node.text().to_lowercase() != *text {
                return false;
            }
        }
        if let Some(tail) = &selector.tail {
            if node.tail().to_lowercase() != *tail {
                return false;
            }
        }

        if !selector.attrs.is_empty()
            && !selector
                .attrs
                .iter()
                .any(|conjunction| self.attrs_hold(node, conjunction, env))
        {
            return false;
        }
        if selector
            .not_attrs
            .iter()
            .any(|conjunction| self.attrs_hold(node, conjunction, env))
        {
            return false;
        }

        true
    }

    fn attrs_hold(
        &self,
        node: &Node,
        conjunction: &indexmap::IndexMap<String, EntryTest>,
        env: &LinkEnv,
    ) -> bool {
        conjunction.iter().all(|(name, test)| match test {
            EntryTest::Present => node.attr(name).is_some(),
            EntryTest::AnyOf(allowed) => match node.attr(name) {
                Some(value) => allowed.iter().any(|candidate| {
                    self.resolve(candidate, env).is_some_and(|resolved| {
                        resolved.render().to_lowercase() == value.to_lowercase()
                    })
                }),
                None => false,
            },
            EntryTest::NoneOf(rejected) => match node.attr(name) {
                Some(value) => !rejected
                    .iter()
                    .any(|candidate| candidate.render().to_lowercase() == value.to_lowercase()),
                None => true,
            },
        })
    }

    fn matches_keyed(
        &self,
        candidate: NodeId,
        node: &Node,
        selector: &Selector,
        env: &LinkEnv,
    ) -> bool {
        // Element-tree predicates never hold on a keyed node.
        if selector.tag.is_some()
            || !selector.tags.is_empty()
            || selector.text.is_some()
            || selector.tail.is_some()
            || !selector.attrs.is_empty()
            || !selector.not_attrs.is_empty()
        {
            return false;
        }

        let Some(key) = node.key() else { return false };

        if let Some(expected) = &selector.key {
            match self.resolve(expected, env) {
                Some(value) if key.matches(&value) => {}
                _ => return false,
            }
        }
        if !selector.keys.is_empty() && !selector.keys.iter().any(|k| key.matches(k)) {
            return false;
        }

        if !selector.child_keys.is_empty()
            && !selector
                .child_keys
                .iter()
                .any(|conjunction| self.child_keys_hold(candidate, conjunction, env))
        {
            return false;
        }
        if selector
            .not_child_keys
            .iter()
            .any(|conjunction| self.child_keys_hold(candidate, conjunction, env))
        {
            return false;
        }

        true
    }

    fn child_keys_hold(
        &self,
        node: NodeId,
        conjunction: &indexmap::IndexMap<String, EntryTest>,
        env: &LinkEnv,
    ) -> bool {
        conjunction.iter().all(|(name, test)| {
            let child = self.tree.child_by_key(node, &Value::from(name.as_str()));
            match test {
                EntryTest::Present => child.is_some(),
                EntryTest::AnyOf(allowed) => match child {
                    Some(child) => {
                        let stored = self.tree.node(child).scalar();
                        allowed.iter().any(|candidate| {
                            self.resolve(candidate, env)
                                .is_some_and(|resolved| resolved == stored)
                        })
                    }
                    None => false,
                },
                EntryTest::NoneOf(rejected) => match child {
                    Some(child) => {
                        let stored = self.tree.node(child).scalar();
                        !rejected.iter().any(|candidate| *candidate == stored)
                    }
                    None => true,
                },
            }
        })
    }

    fn index_matches(&self, index: usize, expected: &ValueRef, env: &LinkEnv) -> bool {
        match expected {
            ValueRef::Literal(Value::Int(n)) => index as i64 == *n,
            ValueRef::Literal(_) => false,
            ValueRef::Link(link) => {
                let Some(stored) = env.values.get(&link.id) else {
                    self.warner.warn(
                        Category::Parse,
                        Severity::InvalidData,
                        format!("index link {} consulted before any step stores it", link.id),
                    );
                    return false;
                };
                let Value::Int(stored) = stored else {
                    self.warner.warn(
                        Category::Parse,
                        Severity::InvalidData,
                        format!("index link {} holds a non-integer value", link.id),
                    );
                    return false;
                };
                let target = stored + link.delta;
                match link.relation {
                    Relation::Exact => index as i64 == target,
                    Relation::Next => index as i64 > target,
                    Relation::Previous => (index as i64) < target,
                }
            }
        }
    }

    /// Resolve a predicate payload: literals pass through, links read the
    /// environment. A missing link fails the candidate with a parse
    /// warning; the walk continues.
    pub(crate) fn resolve(&self, reference: &ValueRef, env: &LinkEnv) -> Option<Value> {
        match reference {
            ValueRef::Literal(value) => Some(value.clone()),
            ValueRef::Link(LinkRef { id, delta, .. }) => match env.values.get(id) {
                Some(value) => {
                    if *delta != 0 {
                        match value.to_int() {
                            Some(n) => Some(Value::Int(n + delta)),
                            None => Some(value.clone()),
                        }
                    } else {
                        Some(value.clone())
                    }
                }
                None => {
                    self.warner.warn(
                        Category::Parse,
                        Severity::InvalidData,
                        format!("value link {id} consulted before any step stores it"),
                    );
                    None
                }
            },
        }
    }
}

//! Builds a [`Tree`] from a JSON payload.
//!
//! Objects become keyed nodes of kind object, arrays become keyed nodes of
//! kind list (children carry their positions as integer keys), and scalars
//! become leaves. The root receives the synthetic key `ROOT`.

use flagset::FlagSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::status::Soft;
use crate::tree::{BuildError, Key, NodeData, NodeId, Payload, Tree, TreeKind};
use crate::value::Value;

/// Synthetic key assigned to the root node.
pub const ROOT_KEY: &str = "ROOT";

/// Asks the builder to sort one list in the payload before the tree is
/// built: the list at `path` is stably ordered by the values of up to three
/// child keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortDirective {
    /// Object member names and list positions leading to the list.
    pub path: Vec<Value>,

    /// Child keys to order by: primary first.
    pub keys: Vec<String>,
}

/// Parse a JSON payload and build a tree from it.
pub fn build_str(
    input: &str,
    sorts: &[SortDirective],
) -> Result<(Tree, FlagSet<Soft>), BuildError> {
    if input.trim().is_empty() {
        return Err(BuildError::Empty);
    }
    let parsed: serde_json::Value = serde_json::from_str(input)?;
    Ok(build(parsed, sorts))
}

/// Build a tree from an already-parsed JSON payload.
#[tracing::instrument(skip_all, fields(sorts = sorts.len()))]
pub fn build(mut payload: serde_json::Value, sorts: &[SortDirective]) -> (Tree, FlagSet<Soft>) {
    let mut flags = FlagSet::default();
    for directive in sorts {
        if !apply_sort(&mut payload, directive) {
            debug!(?directive.path, "sort directive did not resolve to a sortable list");
            flags |= Soft::SortFailed;
        }
    }

    let mut tree = Tree::new(
        TreeKind::Json,
        root_data(&payload),
    );
    let root = tree.root();
    grow(&mut tree, root, &payload);
    (tree, flags)
}

fn root_data(payload: &serde_json::Value) -> NodeData {
    NodeData::Keyed {
        key: Key::Name(ROOT_KEY.to_owned()),
        payload: payload_kind(payload),
    }
}

fn payload_kind(value: &serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Array(_) => Payload::List,
        serde_json::Value::Object(_) => Payload::Object,
        scalar => Payload::Scalar(Value::from_json(scalar)),
    }
}

fn grow(tree: &mut Tree, node: NodeId, value: &serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => {
            for (position, item) in items.iter().enumerate() {
                let child = tree.push(
                    node,
                    NodeData::Keyed {
                        key: Key::Index(position as i64),
                        payload: payload_kind(item),
                    },
                );
                grow(tree, child, item);
            }
        }
        serde_json::Value::Object(entries) => {
            for (name, item) in entries {
                let child = tree.push(
                    node,
                    NodeData::Keyed {
                        key: Key::Name(name.clone()),
                        payload: payload_kind(item),
                    },
                );
                grow(tree, child, item);
            }
        }
        _ => {}
    }
}

/// Resolve the directive path and stably sort the list it names.
/// Reports whether the sort was applied.
fn apply_sort(payload: &mut serde_json::Value, directive: &SortDirective) -> bool {
    let mut target = payload;
    for step in &directive.path {
        target = match (step, target) {
            (Value::String(name), serde_json::Value::Object(entries)) => {
                match entries.get_mut(name) {
                    Some(next) => next,
                    None => return false,
                }
            }
            (Value::Int(position), serde_json::Value::Array(items)) => {
                match items.get_mut(*position as usize) {
                    Some(next) => next,
                    None => return false,
                }
            }
            _ => return false,
        };
    }

    let serde_json::Value::Array(items) = target else {
        return false;
    };
    if directive.keys.is_empty() {
        return false;
    }

    items.sort_by(|a, b| {
        let rank = |item: &serde_json::Value| {
            directive
                .keys
                .iter()
                .map(|key| item.get(key).map(Value::from_json).unwrap_or(Value::Null))
                .collect::<Vec<_>>()
        };
        compare_rank(&rank(a), &rank(b))
    });
    true
}

/// Total order over sort ranks: nulls first, then booleans, numbers,
/// strings; anything else compares equal.
fn compare_rank(a: &[Value], b: &[Value]) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn class(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }

    for (left, right) in a.iter().zip(b.iter()) {
        let ordered = match (left, right) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (x, y) => match (x.to_float(), y.to_float()) {
                (Some(fx), Some(fy)) => fx.partial_cmp(&fy).unwrap_or(Ordering::Equal),
                _ => class(x).cmp(&class(y)),
            },
        };
        if ordered != Ordering::Equal {
            return ordered;
        }
    }
    a.len().cmp(&b.len())
}

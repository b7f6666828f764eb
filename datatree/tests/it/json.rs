//! Extraction against JSON payloads.

use datatree::Value;
use pretty_assertions::assert_eq;

use crate::run_json;

#[test]
fn key_iteration_with_link_and_parent_origin() {
    // The key path ends on the `id` leaf inside each item; value paths then
    // start from the containing object, so sibling fields are in reach.
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id", "link": 7}],
                "values": [[{"key": "v"}]],
            }]
        },
        "values": {"id": 0, "v": 1},
    });
    let input = r#"{"items": [{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]}"#;

    let (records, status) = run_json(definition, input);
    assert!(status.is_ok(), "status: {status}");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], Value::Int(1));
    assert_eq!(records[0]["v"], Value::from("a"));
    assert_eq!(records[1]["id"], Value::Int(2));
    assert_eq!(records[1]["v"], Value::from("b"));
}

#[test]
fn child_key_assertions_filter_objects() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"key": "items"},
                    {"path": "all", "childkeys": {"kind": "show"}},
                    {"key": "name"},
                ],
            }]
        },
    });
    let input = r#"{"items": [
        {"kind": "show", "name": "news"},
        {"kind": "ad", "name": "soap"},
        {"kind": "show", "name": "film"}
    ]}"#;

    let (records, _) = run_json(definition, input);
    let names: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    assert_eq!(names, vec![&Value::from("news"), &Value::from("film")]);
}

#[test]
fn negated_child_keys_reject_objects() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"key": "items"},
                    {"path": "all", "notchildkeys": {"kind": ["ad"]}},
                    {"key": "name"},
                ],
            }]
        },
    });
    let input = r#"{"items": [
        {"kind": "show", "name": "news"},
        {"kind": "ad", "name": "soap"}
    ]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["0"], Value::from("news"));
}

#[test]
fn sort_directives_order_key_nodes() {
    let definition = serde_json::json!({
        "sort": [{"path": ["items"], "childkeys": ["start"]}],
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "name"}],
            }]
        },
    });
    let input = r#"{"items": [
        {"start": 20, "name": "late"},
        {"start": 10, "name": "early"}
    ]}"#;

    let (records, _) = run_json(definition, input);
    let names: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    assert_eq!(names, vec![&Value::from("early"), &Value::from("late")]);
}

#[test]
fn key_set_membership() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"keys": ["first", "third"]}],
            }]
        },
    });
    let input = r#"{"first": 1, "second": 2, "third": 3}"#;

    let (records, _) = run_json(definition, input);
    let picked: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    assert_eq!(picked, vec![&Value::Int(1), &Value::Int(3)]);
}

#[test]
fn records_keep_declaration_and_tree_order() {
    let definition = serde_json::json!({
        "data": {
            "iter": [
                {"key-path": [{"key": "b"}, {"path": "all"}]},
                {"key-path": [{"key": "a"}, {"path": "all"}]},
            ]
        },
    });
    let input = r#"{"a": [1, 2], "b": [3, 4]}"#;

    let (records, _) = run_json(definition, input);
    let values: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    // Blocks in declaration order (b first), key nodes in tree order.
    assert_eq!(
        values,
        vec![&Value::Int(3), &Value::Int(4), &Value::Int(1), &Value::Int(2)]
    );
}

#[test]
fn extraction_is_deterministic() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id"}],
                "values": [[{"key": "v"}]],
            }]
        },
        "values": {"id": 0, "v": 1},
    });
    let input = r#"{"items": [{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]}"#;

    let (first, _) = run_json(definition.clone(), input);
    let (second, _) = run_json(definition, input);
    assert_eq!(first, second);
}

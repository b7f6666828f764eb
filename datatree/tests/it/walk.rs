//! Matcher behavior: links, index navigation, relative paths, grouping,
//! and the boundary cases of path evaluation.

use datatree::def::model::{NodeStep, PathDef, Selector, Source, ValueDef, ValueRef};
use datatree::def::TreeConfig;
use datatree::matcher::{leaves, Hit, LinkEnv, Walker};
use datatree::pipeline::Anchor;
use datatree::warn::Warner;
use datatree::{Tree, Value};
use pretty_assertions::assert_eq;

use crate::{compile, run_json};

#[test]
fn index_link_with_previous_accepts_lower_indices() {
    // Link 3 holds 2; `previous` means strictly lower sibling indices.
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"key": "n", "link": 3},
                    {"path": "root"},
                    {"key": "items"},
                    {"index": {"link": 3, "previous": true}},
                ],
            }]
        },
    });
    let input = r#"{"n": 2, "items": [10, 11, 12, 13, 14]}"#;

    let (records, _) = run_json(definition, input);
    let picked: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    assert_eq!(picked, vec![&Value::Int(10), &Value::Int(11)]);
}

#[test]
fn index_link_with_delta() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"key": "n", "link": 3},
                    {"path": "root"},
                    {"key": "items"},
                    {"index": {"link": 3, "calc": ["plus", 2]}},
                ],
            }]
        },
    });
    let input = r#"{"n": 1, "items": [10, 11, 12, 13, 14]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["0"], Value::Int(13));
}

#[test]
fn saved_node_links_restart_the_walk() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"key": "meta", "node": 1},
                    {"path": "root"},
                    {"key": "items"},
                    {"path": "all"},
                ],
                "values": [
                    [{"path": {"link": 1}}, {"key": "version"}],
                ],
            }]
        },
        "values": {"item": 0, "version": 1},
    });
    let input = r#"{"meta": {"version": 9}, "items": [1, 2]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["version"], Value::Int(9));
    assert_eq!(records[1]["version"], Value::Int(9));
}

#[test]
fn first_and_last_select_single_results() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id"}],
                "values": [
                    [{"path": "parent"}, {"path": "all"}, {"key": "v", "first": true}],
                    [{"path": "parent"}, {"path": "all"}, {"key": "v", "last": true}],
                ],
            }]
        },
        "values": {"id": 0, "first_v": 1, "last_v": 2},
    });
    let input = r#"{"items": [{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["first_v"], Value::from("a"));
    assert_eq!(records[0]["last_v"], Value::from("b"));
}

#[test]
fn presence_means_exactly_one() {
    for (input, expected) in [
        (r#"{"items": [{"id": 1}]}"#, true),
        (r#"{"items": []}"#, false),
        (r#"{"items": [{"id": 1}, {"id": 2}]}"#, false),
    ] {
        let definition = serde_json::json!({
            "data": {
                "iter": [{
                    "key-path": [{"key": "items"}],
                    "values": [
                        [{"key": "items"}, {"path": "all"}, {"key": "id", "select": "presence"}],
                    ],
                }]
            },
            "values": {"one": 1},
        });
        let (records, _) = run_json(definition, input);
        assert_eq!(records[0]["one"], Value::Bool(expected), "input: {input}");
    }
}

#[test]
fn empty_path_yields_start_node_without_value() {
    let (tree, _) = Tree::from_json_str(r#"{"a": 1}"#, &[]).expect("fixture must build");
    let config = TreeConfig::default();
    let anchor = Anchor::new(
        &config,
        chrono::NaiveDate::from_ymd_opt(2016, 5, 25).expect("valid date"),
    );
    let warner = Warner::default();
    let walker = Walker::new(&tree, &config, &anchor, &warner);

    let mut env = LinkEnv::default();
    let hits = walker.walk(tree.root(), &PathDef::default(), &mut env);
    let found = leaves(&hits);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].node, tree.root());
    assert!(found[0].value.is_none());
}

#[test]
fn name_capture_groups_results() {
    let (tree, _) = Tree::from_html(
        r#"<div id="box"><span>one</span><span>two</span></div>"#,
        &datatree::tree::html::Options::default(),
    )
    .expect("fixture must build");
    let config = TreeConfig::default();
    let anchor = Anchor::new(
        &config,
        chrono::NaiveDate::from_ymd_opt(2016, 5, 25).expect("valid date"),
    );
    let warner = Warner::default();
    let walker = Walker::new(&tree, &config, &anchor, &warner);

    let path = PathDef {
        steps: vec![
            NodeStep::Select(Selector {
                tag: Some(ValueRef::literal("div")),
                ..Selector::default()
            }),
            NodeStep::Name(Box::new(ValueDef::of(Source::Attr(ValueRef::literal("id"))))),
            NodeStep::Select(Selector {
                tag: Some(ValueRef::literal("span")),
                ..Selector::default()
            }),
            NodeStep::Value(Box::new({
                let mut def = ValueDef::of(Source::Text);
                def.emit = true;
                def
            })),
        ],
    };

    let mut env = LinkEnv::default();
    let hits = walker.walk(tree.root(), &path, &mut env);
    assert_eq!(hits.len(), 1);
    let Hit::Group { name, hits } = &hits[0] else {
        panic!("expected a named group");
    };
    assert_eq!(name, "box");
    assert_eq!(leaves(hits).len(), 2);
}

#[test]
fn missing_runtime_link_recovers_with_warning() {
    use datatree::warn::{self, Category, Sink};
    use std::sync::mpsc::sync_channel;

    let (tx, rx) = sync_channel(16);
    warn::set_sink(7001, Sink::Queue(tx));

    // Link 5 is only stored when a `zero` key exists; this input has none,
    // so the second value path consults an unstored link at runtime. That
    // rejects the candidates and warns, but the record still comes out.
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}],
                "values": [
                    [{"keys": ["zero"], "link": 5}],
                    [{"path": "all"}, {"index": {"link": 5}}],
                ],
            }]
        },
    });
    let def = compile(definition);
    let (tree, _) =
        Tree::from_json_str(r#"{"items": [1, 2]}"#, &def.sorts).expect("fixture must build");
    let mut extractor = datatree::Extractor::new(&tree, &def).with_caller(7001);
    let records = extractor.extract();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["2"], Value::Null);
    let warning = rx.try_recv().expect("a parse warning must be delivered");
    assert_eq!(warning.category, Category::Parse);
    warn::clear_sink(7001);
}

#[test]
fn zero_child_list_request_returns_empty_list() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}],
                "values": [
                    [{"path": "all"}, {"key": "name", "type": "list"}],
                    [{"path": "all"}, {"key": "name", "default": "none"}],
                ],
            }]
        },
        "values": {"listed": 1, "defaulted": 2},
    });
    let input = r#"{"items": []}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["listed"], Value::List(vec![]));
    assert_eq!(records[0]["defaulted"], Value::from("none"));
}

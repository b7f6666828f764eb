//! Extractor orchestration: the link stage, cancellation, progress,
//! extension dispatch, and request building.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;

use datatree::{Extension, ExtensionResult, Extractor, Fatal, Tree, Value};
use pretty_assertions::assert_eq;

use crate::{compile, run_json};

#[test]
fn link_functions_combine_variables() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id"}],
                "values": [[{"key": "first"}], [{"key": "last"}]],
            }]
        },
        "values": {
            "id": 0,
            "full": {"funcid": 2, "data": [1, {"value": " "}, 2]},
            "label": {"funcid": 5, "data": [1, {"value": "x"}, {"value": "has-x"}, {"value": "no-x"}]},
        },
    });
    let input = r#"{"items": [{"id": 1, "first": "axel", "last": "f"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["full"], Value::from("axel f"));
    assert_eq!(records[0]["label"], Value::from("has-x"));
}

#[test]
fn link_def_post_stages_apply() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id"}],
                "values": [[{"key": "title"}]],
            }]
        },
        "values": {
            "short": {"varid": 1, "max-length": 4, "default": "cut"},
            "typed": {"varid": 0, "type": "string"},
        },
    });
    let input = r#"{"items": [{"id": 9, "title": "much too long"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["short"], Value::from("cut"));
    assert_eq!(records[0]["typed"], Value::from("9"));
}

#[test]
fn extension_dispatch_and_remap() {
    struct Doubler;
    impl Extension for Doubler {
        fn link_function(&self, id: u32, args: &[Value]) -> ExtensionResult {
            match id {
                100 => ExtensionResult::Value(Value::Int(
                    args.first().and_then(Value::to_int).unwrap_or(0) * 2,
                )),
                // Remap onto the built-in concat.
                101 => ExtensionResult::Remap {
                    id: 2,
                    args: args.to_vec(),
                },
                _ => ExtensionResult::Unhandled,
            }
        }

        fn url_function(&self, _id: u32, _args: &[Value]) -> Option<String> {
            None
        }
    }

    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id"}],
            }]
        },
        "values": {
            "doubled": {"funcid": 100, "data": [0]},
            "joined": {"funcid": 101, "data": [0, {"value": "!"}]},
        },
    });
    let def = compile(definition);
    let (tree, _) =
        Tree::from_json_str(r#"{"items": [{"id": 21}]}"#, &def.sorts).expect("fixture must build");

    let extension = Doubler;
    let mut extractor = Extractor::new(&tree, &def).with_extension(&extension);
    let records = extractor.extract();

    assert_eq!(records[0]["doubled"], Value::Int(42));
    assert_eq!(records[0]["joined"], Value::from("21!"));
}

#[test]
fn progress_reports_per_key_node() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
            }]
        },
    });
    let def = compile(definition);
    let (tree, _) =
        Tree::from_json_str(r#"{"items": [1, 2, 3]}"#, &def.sorts).expect("fixture must build");

    let (tx, rx) = sync_channel(16);
    let mut extractor = Extractor::new(&tree, &def).with_progress(tx);
    let records = extractor.extract();
    assert_eq!(records.len(), 3);

    let reported: Vec<(usize, usize)> = rx.try_iter().collect();
    assert_eq!(reported, vec![(1, 3), (2, 3), (3, 3)]);
}

#[test]
fn quit_flag_stops_between_key_nodes() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
            }]
        },
    });
    let def = compile(definition);
    let (tree, _) =
        Tree::from_json_str(r#"{"items": [1, 2, 3]}"#, &def.sorts).expect("fixture must build");

    let quit = Arc::new(AtomicBool::new(true));
    let mut extractor = Extractor::new(&tree, &def).with_quit(Arc::clone(&quit));
    let records = extractor.extract();

    assert!(records.is_empty());
    assert_eq!(extractor.status().fatal(), Fatal::Quit);
    quit.store(false, Ordering::Relaxed);
}

#[test]
fn build_request_assembles_url_and_headers() {
    let definition = serde_json::json!({
        "url": [
            "https://example.test/listings?channel=",
            {"fun": 0, "data": ["channel"]},
            "&range=",
            {"fun": 1, "data": []},
        ],
        "url-header": {"User-Agent": "datatree"},
        "accept-header": "application/json",
        "default-item-count": 5,
        "data": {
            "iter": [{"key-path": [{"key": "items"}, {"path": "all"}]}],
        },
    });
    let def = compile(definition);
    let (tree, _) =
        Tree::from_json_str(r#"{"items": [1]}"#, &def.sorts).expect("fixture must build");
    let extractor = Extractor::new(&tree, &def);

    let mut params = indexmap::IndexMap::new();
    params.insert("channel".to_owned(), Value::from("npo1"));

    let request = extractor.build_request(&params).expect("definition has a url");
    assert_eq!(request.url(), "https://example.test/listings?channel=npo1&range=1-5");
    assert_eq!(request.accept().as_deref(), Some("application/json"));
    assert_eq!(
        request.headers().get("User-Agent").map(String::as_str),
        Some("datatree")
    );
}

#[test]
fn current_date_override_flags_bad_input() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{"key-path": [{"key": "items"}, {"path": "all"}]}],
        },
    });
    let def = compile(definition);
    let (tree, _) =
        Tree::from_json_str(r#"{"items": [1]}"#, &def.sorts).expect("fixture must build");

    let extractor = Extractor::new(&tree, &def).with_current_date("not-a-date");
    assert!(extractor
        .status()
        .soft()
        .contains(datatree::Soft::CurrentDateFailed));
}

#[test]
fn compile_errors_map_to_status_bits() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"tag": "li", "index": {"link": 9}}],
            }]
        },
    });
    let err = datatree::DataDef::compile(&definition, &datatree::warn::Warner::default())
        .expect_err("unstored link must fail to compile");

    let mut status = datatree::Status::default();
    status.set_fatal(Fatal::InvalidDataDef);
    status.flag(err.soft());
    assert_eq!(status.check_errors(), 8 | (1 << 9));
}

#[test]
fn positional_fields_without_a_values_map() {
    let (records, _) = run_json(
        serde_json::json!({
            "data": {
                "iter": [{
                    "key-path": [{"key": "items"}, {"path": "all"}, {"key": "id"}],
                    "values": [[{"key": "v"}]],
                }]
            },
        }),
        r#"{"items": [{"id": 1, "v": "a"}]}"#,
    );
    let record = &records[0];
    let names: Vec<&String> = record.keys().collect();
    assert_eq!(names, vec!["0", "1"]);
    assert_eq!(record["0"], Value::Int(1));
    assert_eq!(record["1"], Value::from("a"));
}

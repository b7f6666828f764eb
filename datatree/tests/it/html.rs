//! Extraction against HTML payloads: tokenizer behavior observed through
//! the engine's public surface.

use datatree::{Fatal, Value};
use pretty_assertions::assert_eq;

use crate::run_html;

#[test]
fn tag_attr_and_text_selection() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"tag": "ul"}, {"tag": "li", "select": "text"}],
                "values": [[{"attr": "class"}]],
            }]
        },
        "values": {"text": 0, "class": 1},
    });
    let input = r#"<ul><li class="a">x</li><li class="b">y</li></ul>"#;

    let (records, status) = run_html(definition, input);
    assert!(status.is_ok(), "status: {status}");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["text"], Value::from("x"));
    assert_eq!(records[0]["class"], Value::from("a"));
    assert_eq!(records[1]["text"], Value::from("y"));
    assert_eq!(records[1]["class"], Value::from("b"));
}

#[test]
fn attribute_disjunction_picks_matching_items() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"tag": "ul"},
                    {"tag": "li", "attrs": [{"class": ["a", "c"]}], "select": "text"},
                ],
            }]
        },
    });
    let input = r#"<ul><li class="a">x</li><li class="b">y</li><li class="c">z</li></ul>"#;

    let (records, _) = run_html(definition, input);
    let texts: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    assert_eq!(texts, vec![&Value::from("x"), &Value::from("z")]);
}

#[test]
fn negated_attributes_reject_matching_items() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"tag": "ul"},
                    {"tag": "li", "notattrs": {"class": ["b"]}, "select": "text"},
                ],
            }]
        },
    });
    let input = r#"<ul><li class="a">x</li><li class="b">y</li><li>z</li></ul>"#;

    let (records, _) = run_html(definition, input);
    let texts: Vec<&Value> = records.iter().map(|r| &r["0"]).collect();
    assert_eq!(texts, vec![&Value::from("x"), &Value::from("z")]);
}

#[test]
fn present_any_value_attribute() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"tag": "ul"},
                    {"tag": "li", "attrs": {"data-id": {"value": null}}, "select": "text"},
                ],
            }]
        },
    });
    let input = r#"<ul><li data-id="7">x</li><li>y</li></ul>"#;

    let (records, _) = run_html(definition, input);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["0"], Value::from("x"));
}

#[test]
fn inclusive_text_with_exclude() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{
                    "tag": "p",
                    "select": "inclusive text",
                    "depth": 2,
                    "exclude": ["script"],
                }],
            }]
        },
    });
    let input = "<p>hi <script>bad</script> there<i>!</i></p>";

    let (records, _) = run_html(definition, input);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["0"], Value::from("hi there !"));
}

#[test]
fn missing_close_tags_recover() {
    // The pre-scan promotes `li` (never closed) into the auto-close set, so
    // each li becomes a sibling instead of nesting.
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"tag": "ul"}, {"tag": "li", "select": "tail"}],
            }]
        },
    });
    let input = "<ul><li>x<li>y</ul>";

    let (records, _) = run_html(definition, input);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["0"], Value::from("x"));
    assert_eq!(records[1]["0"], Value::from("y"));
}

#[test]
fn truncated_body_recovers() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [
                    {"tag": "html"},
                    {"tag": "body"},
                    {"tag": "p", "select": "text"},
                ],
            }]
        },
    });
    let input = "<html><body><p>cut off</p>";

    let (records, status) = run_html(definition, input);
    assert!(status.is_ok(), "status: {status}");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["0"], Value::from("cut off"));
}

#[test]
fn entities_decode_in_text_and_attributes() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"tag": "a", "select": "text"}],
                "values": [[{"attr": "href"}]],
            }]
        },
        "values": {"text": 0, "href": 1},
    });
    let input = r#"<a href="?a=1&amp;b=2">fish &amp; chips &#33;</a>"#;

    let (records, _) = run_html(definition, input);
    assert_eq!(records[0]["text"], Value::from("fish & chips !"));
    assert_eq!(records[0]["href"], Value::from("?a=1&b=2"));
}

#[test]
fn empty_payload_is_fatal() {
    let def = crate::compile(serde_json::json!({
        "data": {"iter": [{"key-path": [{"tag": "p"}]}]},
    }));
    let err = datatree::Tree::from_html("   ", &def.html_options());
    assert!(err.is_err());
}

#[test]
fn no_matches_reports_no_data() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"tag": "article", "select": "text"}],
            }]
        },
    });
    let (records, status) = run_html(definition, "<p>nothing here</p>");
    assert!(records.is_empty());
    assert_eq!(status.fatal(), Fatal::NoData);
}

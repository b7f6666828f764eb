//! The value pipeline end to end: calc stages, defaults, type coercions,
//! and the membership filter.

use chrono::{NaiveDate, NaiveTime};
use datatree::{Extractor, Tree, Value};
use pretty_assertions::assert_eq;

use crate::{compile, run_html, run_json};

#[test]
fn calc_then_type_pipeline() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{
                    "tag": "span",
                    "rstrip": "kg",
                    "sub": [",", "."],
                    "type": "float",
                }],
            }]
        },
    });
    let input = "<span>  12,5 kg </span>";

    let (records, _) = run_html(definition, input);
    assert_eq!(records[0]["0"], Value::Float(12.5));
}

#[test]
fn split_projects_and_rejoins() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{
                    "tag": "span",
                    "split": ["/", 0, -1],
                }],
            }]
        },
    });
    let (records, _) = run_html(definition, "<span>a/b/c</span>");
    assert_eq!(records[0]["0"], Value::from("a/c"));
}

#[test]
fn replace_misses_collapse_to_default() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[
                    {"key": "state", "replace": {"on": 1, "off": 0}, "default": -1},
                ]],
            }]
        },
        "values": {"state": 1},
    });
    let input = r#"{"items": [{"state": "On"}, {"state": "broken"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["state"], Value::Int(1));
    assert_eq!(records[1]["state"], Value::Int(-1));
}

#[test]
fn empty_values_collapse_before_defaults() {
    let definition = serde_json::json!({
        "empty-values": ["", "-"],
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[{"key": "genre", "default": "unknown"}]],
            }]
        },
        "values": {"genre": 1},
    });
    let input = r#"{"items": [{"genre": "-"}, {"genre": "drama"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["genre"], Value::from("unknown"));
    assert_eq!(records[1]["genre"], Value::from("drama"));
}

#[test]
fn membership_filter_drops_whole_records() {
    let definition = serde_json::json!({
        "value-filters": {"genres": ["drama", "news"]},
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}, {"key": "name"}],
                "values": [[{"key": "genre", "member-off": "genres"}]],
            }]
        },
        "values": {"name": 0, "genre": 1},
    });
    let input = r#"{"items": [
        {"name": "a", "genre": "drama"},
        {"name": "b", "genre": "sports"},
        {"name": "c", "genre": "news"}
    ]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records.len(), 2, "the off-list record is dropped entirely");
    assert_eq!(records[0]["name"], Value::from("a"));
    assert_eq!(records[1]["name"], Value::from("c"));
}

#[test]
fn date_parsing_with_textual_months() {
    let definition = serde_json::json!({
        "month-names": ["jan", "feb", "mar", "apr", "mei", "jun",
                        "jul", "aug", "sep", "okt", "nov", "dec"],
        "date-sequence": ["d", "m", "y"],
        "date-splitter": " ",
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[{"key": "date", "type": "date"}]],
            }]
        },
        "values": {"date": 1},
    });
    let input = r#"{"items": [{"date": "5 mei 2016"}, {"date": "5 11 2016"}]}"#;

    let (records, _) = run_json(definition, input);
    let mei = NaiveDate::from_ymd_opt(2016, 5, 5).expect("valid date");
    let nov = NaiveDate::from_ymd_opt(2016, 11, 5).expect("valid date");
    assert_eq!(records[0]["date"], Value::Date(mei));
    assert_eq!(records[1]["date"], Value::Date(nov));
}

#[test]
fn time_with_twelve_hour_clock() {
    let definition = serde_json::json!({
        "time-type": [12, "am", "pm"],
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[{"key": "t", "type": "time"}]],
            }]
        },
        "values": {"t": 1},
    });
    let input = r#"{"items": [{"t": "8:30 PM"}, {"t": "12:15 am"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(
        records[0]["t"],
        Value::Time(NaiveTime::from_hms_opt(20, 30, 0).expect("valid time"))
    );
    assert_eq!(
        records[1]["t"],
        Value::Time(NaiveTime::from_hms_opt(0, 15, 0).expect("valid time"))
    );
}

#[test]
fn timestamp_with_multiplier() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[{"key": "start", "type": "timestamp", "multiplier": 1000}]],
            }]
        },
        "values": {"start": 1},
    });
    let input = r#"{"items": [{"start": 1464480000000}]}"#;

    let (records, _) = run_json(definition, input);
    let Value::DateTime(instant) = &records[0]["start"] else {
        panic!("expected a datetime, found {:?}", records[0]["start"]);
    };
    assert_eq!(instant.timestamp(), 1_464_480_000);
}

#[test]
fn datetimestring_honors_definition_timezone() {
    let definition = serde_json::json!({
        "timezone": "+02:00",
        "datetimestring": "%Y-%m-%d %H:%M",
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[{"key": "when", "type": "datetimestring"}]],
            }]
        },
        "values": {"when": 1},
    });
    let input = r#"{"items": [{"when": "2016-05-29 14:00"}]}"#;

    let (records, _) = run_json(definition, input);
    let Value::DateTime(instant) = &records[0]["when"] else {
        panic!("expected a datetime");
    };
    assert_eq!(instant.to_rfc3339(), "2016-05-29T12:00:00+00:00");
}

#[test]
fn relative_weekday_resolves_against_anchor() {
    let definition = serde_json::json!({
        "weekdays": ["monday", "tuesday", "wednesday", "thursday",
                     "friday", "saturday", "sunday"],
        "relative-weekdays": {"today": 0, "tomorrow": 1},
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [[{"key": "day", "type": "relative-weekday"}]],
            }]
        },
        "values": {"day": 1},
    });
    let input = r#"{"items": [{"day": "Tomorrow"}, {"day": "friday"}]}"#;

    let def = compile(definition);
    let (tree, _) = Tree::from_json_str(input, &def.sorts).expect("fixture must build");
    // 2016-05-25 is a Wednesday.
    let mut extractor = Extractor::new(&tree, &def).with_current_date("2016-05-25");
    let records = extractor.extract();

    assert_eq!(
        records[0]["day"],
        Value::Date(NaiveDate::from_ymd_opt(2016, 5, 26).expect("valid date"))
    );
    assert_eq!(
        records[1]["day"],
        Value::Date(NaiveDate::from_ymd_opt(2016, 5, 27).expect("valid date"))
    );
}

#[test]
fn lower_ascii_and_str_list() {
    let definition = serde_json::json!({
        "data": {
            "iter": [{
                "key-path": [{"key": "items"}, {"path": "all"}],
                "values": [
                    [{"key": "name", "type": "lower-ascii"}],
                    [{"key": "tags", "type": "str-list"}],
                ],
            }]
        },
        "values": {"name": 1, "tags": 2},
    });
    let input = r#"{"items": [{"name": "Café Noir/Brun", "tags": "a,b,c"}]}"#;

    let (records, _) = run_json(definition, input);
    assert_eq!(records[0]["name"], Value::from("cafe_noir_brun"));
    assert_eq!(
        records[0]["tags"],
        Value::List(vec![Value::from("a"), Value::from("b"), Value::from("c")])
    );
}

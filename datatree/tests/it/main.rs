//! Entry point for integration tests.
//!
//! Note: `cargo` "integration tests" mean "tests as the library consumer
//! uses the library", not e.g. "tests using remote resources". Everything
//! here drives the engine through its public surface: compile a definition,
//! build a tree, extract, inspect records and status.
//!
//! Tests that want engine diagnostics can call [`tracing::setup`] and run
//! with a `RUST_LOG` setting.

use datatree::warn::Warner;
use datatree::{DataDef, Extractor, Record, Status, Tree};

mod extract;
mod html;
mod json;
mod pipeline;
mod tracing;
mod walk;

/// Compile a definition, asserting a clean compile.
pub fn compile(definition: serde_json::Value) -> DataDef {
    let (def, flags) =
        DataDef::compile(&definition, &Warner::default()).expect("definition must compile");
    assert!(flags.is_empty(), "unexpected compile flags: {flags:?}");
    def
}

/// Compile, build an HTML tree, extract, and hand back records + status.
pub fn run_html(definition: serde_json::Value, input: &str) -> (Vec<Record>, Status) {
    let def = compile(definition);
    let (tree, flags) =
        Tree::from_html(input, &def.html_options()).expect("html input must build");
    assert!(flags.is_empty(), "unexpected build flags: {flags:?}");
    let mut extractor = Extractor::new(&tree, &def);
    let records = extractor.extract();
    (records, extractor.status())
}

/// Compile, build a JSON tree, extract, and hand back records + status.
pub fn run_json(definition: serde_json::Value, input: &str) -> (Vec<Record>, Status) {
    let def = compile(definition);
    let (tree, flags) = Tree::from_json_str(input, &def.sorts).expect("json input must build");
    assert!(flags.is_empty(), "unexpected build flags: {flags:?}");
    let mut extractor = Extractor::new(&tree, &def);
    let records = extractor.extract();
    (records, extractor.status())
}

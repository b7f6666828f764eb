//! Extracts structured records from HTML and JSON documents, driven by a
//! declarative data definition.
//!
//! The engine reads a payload into a uniform node tree, then walks that
//! tree under the guidance of a compiled definition: an initial path
//! selects a start node, a key path enumerates one record per matched
//! node, value paths collect the record's variables, and a link stage
//! combines the variables into clean, typed, named fields.
//!
//! # Quick start
//!
//! ```
//! use datatree::{DataDef, Extractor, Tree};
//! use datatree::warn::Warner;
//!
//! let definition = serde_json::json!({
//!     "data": {
//!         "iter": [{
//!             "key-path": [{"tag": "ul"}, {"tag": "li", "select": "text"}],
//!         }]
//!     },
//! });
//! let (def, _) = DataDef::compile(&definition, &Warner::default())?;
//!
//! let (tree, _) = Tree::from_html("<ul><li>x</li><li>y</li></ul>", &def.html_options())?;
//! let mut extractor = Extractor::new(&tree, &def);
//! let records = extractor.extract();
//!
//! assert_eq!(records.len(), 2);
//! assert_eq!(records[0]["0"], datatree::Value::from("x"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Recovery model
//!
//! Three strata, none of which use unwinding for control flow:
//!
//! 1. Compile-time problems come back as [`DefError`] plus non-fatal
//!    status bits; the definition must be fixed.
//! 2. Tree-build problems are fatal for the payload
//!    ([`tree::BuildError`]); no partial tree is observable.
//! 3. Walk-time conditions (a missing link, a failed coercion) recover
//!    locally: the predicate fails or the value falls back, a warning is
//!    reported through [`warn`], and the walk continues.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod def;
pub mod extract;
pub mod matcher;
pub mod pipeline;
pub mod status;
pub mod tree;
pub mod url;
pub mod value;
pub mod warn;

pub use def::{DataDef, DefError};
pub use extract::{Extension, ExtensionResult, Extractor};
pub use status::{Fatal, Soft, Status};
pub use tree::{Tree, TreeKind};
pub use url::Request;
pub use value::Value;

/// One extracted record: field names mapped to typed values, in the
/// declaration order of the definition's `values` map.
pub type Record = indexmap::IndexMap<String, Value>;

/// The engine version, stamped into compiled definitions as `dtversion`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

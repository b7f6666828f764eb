//! Data definitions: the declarative documents that drive extraction.
//!
//! A definition arrives as JSON, is compiled once into the typed form under
//! [`model`], and is immutable afterwards. [`DataDef`] is the compiled
//! whole: the initial path, the iteration blocks, the formatting defaults
//! lifted from the definition root, and the opaque request-builder and
//! tree-builder setup the matcher never looks at.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::tree::html;
use crate::tree::json::SortDirective;
use crate::tree::TreeKind;
use crate::value::Value;

pub mod model;

pub(crate) mod compile;

pub use compile::DefError;

use model::{DateField, IterBlock, PathDef, Pattern, UrlDef};

/// Formatting and lookup defaults resolved from the definition root.
///
/// Individual type coercions may override the formatting entries; the
/// lookup lists are shared by every coercion in the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// strftime-style format for the datetime-string coercion.
    pub datetimestring: String,

    /// Separator for the time coercion.
    pub time_splitter: Pattern,

    /// 12 or 24; under a 12-hour clock a trailing AM/PM suffix is honored.
    pub time_hours: u8,

    /// The AM suffix under a 12-hour clock.
    pub am: String,

    /// The PM suffix under a 12-hour clock.
    pub pm: String,

    /// Date component order for the date coercion.
    pub date_sequence: Vec<DateField>,

    /// Separator for the date coercion.
    pub date_splitter: Pattern,

    /// Separator for the string-list coercion.
    pub str_list_splitter: Pattern,

    /// Month names, used when a date piece is textual. A 13-entry list is
    /// taken as placeholder-first (entry 1 is January); a 12-entry list
    /// starts at January directly.
    pub month_names: Vec<String>,

    /// Weekday names, Monday first, resolved against the current-date
    /// anchor.
    pub weekdays: Vec<String>,

    /// Relative day names mapped to offsets from the current-date anchor.
    pub relative_weekdays: IndexMap<String, i64>,

    /// Definition timezone as seconds east of UTC.
    pub tz_offset_secs: i32,

    /// Named whitelists consulted by the membership filter.
    pub value_filters: IndexMap<String, Vec<Value>>,

    /// Values collapsed to null before default substitution.
    pub empty_values: Vec<Value>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            datetimestring: "%Y-%m-%d %H:%M:%S".to_owned(),
            time_splitter: Pattern::new(":").expect("default time splitter must compile"),
            time_hours: 24,
            am: "am".to_owned(),
            pm: "pm".to_owned(),
            date_sequence: vec![DateField::Year, DateField::Month, DateField::Day],
            date_splitter: Pattern::new("-").expect("default date splitter must compile"),
            str_list_splitter: Pattern::new(",").expect("default list splitter must compile"),
            month_names: Vec::new(),
            weekdays: Vec::new(),
            relative_weekdays: IndexMap::new(),
            tz_offset_secs: 0,
            value_filters: IndexMap::new(),
            empty_values: Vec::new(),
        }
    }
}

/// Raw-payload preprocessing for the HTML builder, lifted from the
/// definition root.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HtmlSetup {
    /// Seed for the auto-close set.
    pub autoclose: Vec<String>,

    /// Regex substitutions applied to the payload before parsing.
    pub text_replace: Vec<(Pattern, String)>,

    /// Patterns whose first capture group gets its markup escaped.
    pub unquote: Vec<Pattern>,

    /// Wrap the payload in `<html>…</html>`.
    pub enclose: bool,
}

/// A compiled data definition.
///
/// Produced by [`DataDef::compile`]; immutable afterwards. Serializable, so
/// callers may persist it and hand it back later: compiling an
/// already-compiled definition is a no-op apart from a version-advisory
/// warning when the stamp differs from the running compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDef {
    /// Compiler version stamp.
    #[serde(rename = "dtversion")]
    pub version: String,

    /// Tree type the definition is written against, when detectable.
    pub tree_kind: Option<TreeKind>,

    /// Walked from the root to select the start node.
    pub init_path: PathDef,

    /// Iteration blocks, in declaration order.
    pub blocks: Vec<IterBlock>,

    /// Formatting and lookup defaults.
    pub config: TreeConfig,

    /// Sort directives for the JSON builder.
    pub sorts: Vec<SortDirective>,

    /// Preprocessing for the HTML builder.
    pub html: HtmlSetup,

    /// Request-builder setup, when the definition carries one.
    pub url: Option<UrlDef>,
}

impl DataDef {
    /// The HTML builder options this definition asks for.
    pub fn html_options(&self) -> html::Options {
        html::Options::builder()
            .autoclose(self.html.autoclose.clone())
            .text_replace(self.html.text_replace.clone())
            .unquote(self.html.unquote.clone())
            .enclose_html(self.html.enclose)
            .build()
    }
}

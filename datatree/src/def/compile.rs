//! Lowers an authored JSON data definition into the compiled form.
//!
//! Compilation is pure and deterministic: the same document always lowers to
//! the same [`DataDef`]. Link references are validated left to right while
//! each path compiles: a step may only consult links that an earlier step
//! stored, and violations are compile errors rather than runtime surprises.
//! Recoverable oddities (an unparseable timezone, a bad rewrite pattern)
//! are reported in the returned flag set and compilation continues.

use std::collections::BTreeSet;

use flagset::FlagSet;
use indexmap::IndexMap;
use serde_json::Value as Json;
use thiserror::Error;
use tracing::debug;

use crate::def::model::{
    Axis, CalcOp, CaseMode, Conjunction, DateField, EntryTest, Field, IterBlock, LinkCapture,
    LinkDef, LinkKind, LinkRef, NodeStep, PathDef, Pattern, Relation, Selector, Source, SplitRule,
    SplitTake, TextScan, TypeOp, UrlDateType, UrlDef, UrlPiece, ValueDef, ValueRef,
};
use crate::def::{DataDef, HtmlSetup, TreeConfig};
use crate::status::Soft;
use crate::tree::json::SortDirective;
use crate::tree::TreeKind;
use crate::value::Value;
use crate::warn::{Category, Severity, Warner};

/// Highest built-in link function id; ids between this and the extension
/// threshold are unknown.
pub(crate) const MAX_BUILTIN_FUN: u32 = 12;

/// Function ids from here on dispatch to the host extension untouched.
pub(crate) const EXTENSION_FUN_BASE: u32 = 100;

/// Errors that abort compilation of a data definition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DefError {
    /// The definition document is not a JSON object.
    #[error("data definition is not a json object")]
    NotAnObject,

    /// The definition carries neither an iteration list nor a single block.
    #[error("data definition has no data block")]
    MissingData,

    /// A step referenced a value link no earlier step stored.
    #[error("value link {id} referenced before any step stores it")]
    UnknownValueLink {
        /// The offending link id.
        id: u32,
    },

    /// A step referenced a node link no earlier step stored.
    #[error("node link {id} referenced before any step stores it")]
    UnknownNodeLink {
        /// The offending link id.
        id: u32,
    },

    /// Directives for both tree types appeared in one definition.
    #[error("directive '{directive}' conflicts with the {existing:?} tree type")]
    TreeTypeConflict {
        /// The directive that introduced the conflict.
        directive: String,
        /// The tree type established by earlier directives.
        existing: TreeKind,
    },

    /// A link definition referenced a variable the block does not produce.
    #[error("variable {index} referenced but the block only produces {count}")]
    BadVarIndex {
        /// The referenced variable.
        index: usize,
        /// Variables the block produces.
        count: usize,
    },

    /// A link definition named a function id outside the built-in set and
    /// below the extension threshold.
    #[error("unknown link function {id}")]
    UnknownFunction {
        /// The offending function id.
        id: u32,
    },

    /// A directive payload had an unusable shape.
    #[error("directive '{directive}': {reason}")]
    BadDirective {
        /// The directive that failed to compile.
        directive: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl DefError {
    /// The non-fatal status bits this error corresponds to; callers fold
    /// these into their status next to the fatal `InvalidDataDef` code.
    pub fn soft(&self) -> FlagSet<Soft> {
        match self {
            DefError::UnknownValueLink { .. } => Soft::InvalidValueLink.into(),
            DefError::UnknownNodeLink { .. } => Soft::InvalidNodeLink.into(),
            DefError::BadVarIndex { .. } | DefError::UnknownFunction { .. } => {
                Soft::InvalidLinkDef.into()
            }
            DefError::TreeTypeConflict { .. } | DefError::BadDirective { .. } => {
                Soft::InvalidPathDef.into()
            }
            DefError::NotAnObject | DefError::MissingData => FlagSet::default(),
        }
    }
}

/// Links visible at a given point of a path compile, in stored order.
#[derive(Debug, Default, Clone)]
struct LinkScope {
    values: BTreeSet<u32>,
    nodes: BTreeSet<u32>,
}

/// The role a path plays, which decides whether a trailing value capture is
/// synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathRole {
    /// Selects the start node; produces nodes, never values.
    Init,
    /// Enumerates key nodes; the tail captures the key value.
    Key,
    /// Produces one record variable; the tail captures the value.
    Value,
}

struct Compiler<'a> {
    warner: &'a Warner,
    flags: FlagSet<Soft>,
    kind: Option<TreeKind>,
}

impl DataDef {
    /// Compile an authored definition, or accept back an already-compiled
    /// one.
    ///
    /// A document carrying a `dtversion` stamp is deserialized as a compiled
    /// definition; a stamp differing from the running compiler version only
    /// produces an advisory warning.
    pub fn compile(raw: &Json, warner: &Warner) -> Result<(DataDef, FlagSet<Soft>), DefError> {
        let Some(root) = raw.as_object() else {
            return Err(DefError::NotAnObject);
        };

        if root.contains_key("dtversion") {
            let compiled: DataDef = serde_json::from_value(raw.clone()).map_err(|err| {
                DefError::BadDirective {
                    directive: "dtversion".to_owned(),
                    reason: format!("stamped definition does not deserialize: {err}"),
                }
            })?;
            if compiled.version != crate::VERSION {
                warner.warn(
                    Category::DataDef,
                    Severity::Serious,
                    format!(
                        "definition was compiled by version {}, running {}",
                        compiled.version,
                        crate::VERSION
                    ),
                );
            }
            return Ok((compiled, FlagSet::default()));
        }

        let mut compiler = Compiler {
            warner,
            flags: FlagSet::default(),
            kind: None,
        };

        compiler.detect_kind(raw)?;
        let config = compiler.compile_config(root);
        let html = compiler.compile_html_setup(root);
        let sorts = compiler.compile_sorts(root);
        let url = compiler.compile_url(root)?;

        let data = root.get("data").ok_or(DefError::MissingData)?;
        let init_path = match data.get("init-path") {
            Some(raw_path) => {
                compiler.compile_path(raw_path, &mut LinkScope::default(), PathRole::Init)?
            }
            None => PathDef::default(),
        };

        let raw_blocks: Vec<&Json> = match data.get("iter") {
            Some(Json::Array(items)) => items.iter().collect(),
            Some(other) => {
                return Err(DefError::BadDirective {
                    directive: "iter".to_owned(),
                    reason: format!("expected a list, found {other}"),
                })
            }
            None if data.get("key-path").is_some() => vec![data],
            None => return Err(DefError::MissingData),
        };

        let field_defs = root.get("values");
        let mut blocks = Vec::with_capacity(raw_blocks.len());
        for raw_block in raw_blocks {
            blocks.push(compiler.compile_block(raw_block, field_defs)?);
        }

        debug!(kind = ?compiler.kind, blocks = blocks.len(), "definition compiled");
        Ok((
            DataDef {
                version: crate::VERSION.to_owned(),
                tree_kind: compiler.kind,
                init_path,
                blocks,
                config,
                sorts,
                html,
                url,
            },
            compiler.flags,
        ))
    }
}

/// Directives only meaningful against element trees.
const HTML_MARKERS: [&str; 7] = ["tag", "tags", "attrs", "notattrs", "text", "tail", "attr"];

/// Directives only meaningful against keyed trees.
const JSON_MARKERS: [&str; 4] = ["key", "keys", "childkeys", "notchildkeys"];

impl Compiler<'_> {
    /// Scan the whole document for tree-type markers; a conflict is a
    /// compile error, and `data-format` decides when no directive does.
    fn detect_kind(&mut self, raw: &Json) -> Result<(), DefError> {
        fn scan(compiler: &mut Compiler<'_>, value: &Json) -> Result<(), DefError> {
            match value {
                Json::Object(entries) => {
                    for (name, nested) in entries {
                        if HTML_MARKERS.contains(&name.as_str()) {
                            compiler.note_kind(TreeKind::Html, name)?;
                        }
                        if JSON_MARKERS.contains(&name.as_str()) {
                            compiler.note_kind(TreeKind::Json, name)?;
                        }
                        if name == "select" {
                            match nested.as_str() {
                                Some("text" | "tail" | "tag")
                                | Some("inclusive text" | "inclusive-text") => {
                                    compiler.note_kind(TreeKind::Html, "select")?;
                                }
                                Some("key" | "value") => {
                                    compiler.note_kind(TreeKind::Json, "select")?;
                                }
                                _ => {}
                            }
                        }
                        scan(compiler, nested)?;
                    }
                }
                Json::Array(items) => {
                    for item in items {
                        scan(compiler, item)?;
                    }
                }
                _ => {}
            }
            Ok(())
        }

        // Only the data section holds path directives; the `values` map
        // carries field names, which are free to collide with directive
        // names.
        if let Some(data) = raw.get("data") {
            scan(self, data)?;
        }

        if self.kind.is_none() {
            self.kind = match raw.get("data-format").and_then(Json::as_str) {
                Some("html") => Some(TreeKind::Html),
                Some("json") => Some(TreeKind::Json),
                Some(other) => {
                    self.warner.warn(
                        Category::DataDef,
                        Severity::InvalidDef,
                        format!("unknown data-format '{other}'"),
                    );
                    None
                }
                None => None,
            };
        }
        Ok(())
    }

    fn note_kind(&mut self, kind: TreeKind, directive: &str) -> Result<(), DefError> {
        match self.kind {
            None => {
                self.kind = Some(kind);
                Ok(())
            }
            Some(existing) if existing == kind => Ok(()),
            Some(existing) => Err(DefError::TreeTypeConflict {
                directive: directive.to_owned(),
                existing,
            }),
        }
    }

    /// The source a value capture falls back to when the definition names
    /// none.
    fn default_source(&self) -> Source {
        match self.kind {
            Some(TreeKind::Json) => Source::Scalar,
            _ => Source::Text,
        }
    }

    fn compile_config(&mut self, root: &serde_json::Map<String, Json>) -> TreeConfig {
        let mut config = TreeConfig::default();

        if let Some(format) = str_key(root, "datetimestring") {
            config.datetimestring = format.to_owned();
        }
        if let Some(pattern) = self.pattern_key(root, "time-splitter") {
            config.time_splitter = pattern;
        }
        if let Some(pattern) = self.pattern_key(root, "date-splitter") {
            config.date_splitter = pattern;
        }
        if let Some(pattern) = self.pattern_key(root, "str-list-splitter") {
            config.str_list_splitter = pattern;
        }
        if let Some(sequence) = root.get("date-sequence").and_then(Json::as_array) {
            config.date_sequence = sequence
                .iter()
                .filter_map(Json::as_str)
                .filter_map(|field| match field.to_lowercase().as_str() {
                    "d" | "day" => Some(DateField::Day),
                    "m" | "month" => Some(DateField::Month),
                    "y" | "year" => Some(DateField::Year),
                    _ => None,
                })
                .collect();
        }

        match root.get("time-type") {
            Some(Json::Array(parts)) => {
                if let Some(hours) = parts.first().and_then(Json::as_i64) {
                    config.time_hours = hours as u8;
                }
                if let Some(am) = parts.get(1).and_then(Json::as_str) {
                    config.am = am.to_lowercase();
                }
                if let Some(pm) = parts.get(2).and_then(Json::as_str) {
                    config.pm = pm.to_lowercase();
                }
            }
            Some(Json::Number(hours)) => {
                if let Some(hours) = hours.as_i64() {
                    config.time_hours = hours as u8;
                }
            }
            _ => {}
        }

        if let Some(names) = root.get("month-names").and_then(Json::as_array) {
            config.month_names = names
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_lowercase)
                .collect();
        }
        if let Some(names) = root.get("weekdays").and_then(Json::as_array) {
            config.weekdays = names
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_lowercase)
                .collect();
        }
        if let Some(relative) = root.get("relative-weekdays").and_then(Json::as_object) {
            config.relative_weekdays = relative
                .iter()
                .filter_map(|(name, offset)| {
                    offset.as_i64().map(|days| (name.to_lowercase(), days))
                })
                .collect();
        }

        if let Some(timezone) = str_key(root, "timezone") {
            match parse_timezone(timezone) {
                Some(offset) => config.tz_offset_secs = offset,
                None => {
                    self.flags |= Soft::TimeZoneFailed;
                    self.warner.warn(
                        Category::DataDef,
                        Severity::InvalidDef,
                        format!("timezone '{timezone}' not recognized, using utc"),
                    );
                }
            }
        }

        if let Some(filters) = root.get("value-filters").and_then(Json::as_object) {
            config.value_filters = filters
                .iter()
                .filter_map(|(name, list)| {
                    list.as_array().map(|items| {
                        (
                            name.clone(),
                            items.iter().map(Value::from_json).collect::<Vec<_>>(),
                        )
                    })
                })
                .collect();
        }
        if let Some(empty) = root.get("empty-values").and_then(Json::as_array) {
            config.empty_values = empty.iter().map(Value::from_json).collect();
        }

        config
    }

    fn compile_html_setup(&mut self, root: &serde_json::Map<String, Json>) -> HtmlSetup {
        let mut setup = HtmlSetup::default();

        if let Some(tags) = root.get("autoclose-tags").and_then(Json::as_array) {
            setup.autoclose = tags
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_lowercase)
                .collect();
        }
        setup.enclose = root
            .get("enclose-with-html-tag")
            .and_then(Json::as_bool)
            .unwrap_or(false);

        if let Some(pairs) = root.get("text_replace").and_then(Json::as_array) {
            for pair in pairs {
                let compiled = pair.as_array().and_then(|pair| {
                    let source = pair.first()?.as_str()?;
                    let replacement = pair.get(1)?.as_str()?;
                    Pattern::new(source).ok().map(|p| (p, replacement.to_owned()))
                });
                match compiled {
                    Some(entry) => setup.text_replace.push(entry),
                    None => {
                        self.flags |= Soft::TextReplaceFailed;
                        self.warner.warn(
                            Category::DataDef,
                            Severity::InvalidDef,
                            format!("text_replace entry {pair} is unusable"),
                        );
                    }
                }
            }
        }

        if let Some(patterns) = root.get("unquote_html").and_then(Json::as_array) {
            for raw in patterns {
                let compiled = raw.as_str().and_then(|source| Pattern::new(source).ok());
                match compiled {
                    Some(pattern) => setup.unquote.push(pattern),
                    None => {
                        self.flags |= Soft::UnquoteFailed;
                        self.warner.warn(
                            Category::DataDef,
                            Severity::InvalidDef,
                            format!("unquote_html entry {raw} is unusable"),
                        );
                    }
                }
            }
        }

        setup
    }

    fn compile_sorts(&mut self, root: &serde_json::Map<String, Json>) -> Vec<SortDirective> {
        let Some(entries) = root.get("sort").and_then(Json::as_array) else {
            return Vec::new();
        };
        let mut sorts = Vec::new();
        for entry in entries {
            let compiled = entry.as_object().and_then(|entry| {
                let path = entry
                    .get("path")?
                    .as_array()?
                    .iter()
                    .map(Value::from_json)
                    .collect();
                let keys = entry
                    .get("childkeys")?
                    .as_array()?
                    .iter()
                    .filter_map(Json::as_str)
                    .map(str::to_owned)
                    .collect();
                Some(SortDirective { path, keys })
            });
            match compiled {
                Some(directive) => sorts.push(directive),
                None => {
                    self.flags |= Soft::SortFailed;
                    self.warner.warn(
                        Category::DataDef,
                        Severity::InvalidDef,
                        format!("sort directive {entry} is unusable"),
                    );
                }
            }
        }
        sorts
    }

    fn compile_url(&mut self, root: &serde_json::Map<String, Json>) -> Result<Option<UrlDef>, DefError> {
        let Some(raw_url) = root.get("url") else {
            return Ok(None);
        };

        let mut url = UrlDef {
            date_multiplier: 1,
            item_splitter: "-".to_owned(),
            date_splitter: "-".to_owned(),
            default_count: 1,
            ..UrlDef::default()
        };

        let raw_pieces: Vec<&Json> = match raw_url {
            Json::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        for piece in raw_pieces {
            match piece {
                Json::String(text) => url.pieces.push(UrlPiece::Literal(text.clone())),
                Json::Object(call) => {
                    let id = call.get("fun").and_then(Json::as_u64).ok_or_else(|| {
                        DefError::BadDirective {
                            directive: "url".to_owned(),
                            reason: format!("url function call {piece} has no 'fun' id"),
                        }
                    })? as u32;
                    let args = call
                        .get("data")
                        .and_then(Json::as_array)
                        .map(|items| items.iter().map(Value::from_json).collect())
                        .unwrap_or_default();
                    url.pieces.push(UrlPiece::Fun { id, args });
                }
                other => {
                    return Err(DefError::BadDirective {
                        directive: "url".to_owned(),
                        reason: format!("unusable url piece {other}"),
                    })
                }
            }
        }

        if let Some(headers) = root.get("url-header").and_then(Json::as_object) {
            url.headers = headers
                .iter()
                .filter_map(|(name, value)| {
                    value.as_str().map(|value| (name.clone(), value.to_owned()))
                })
                .collect();
        }
        url.accept = str_key(root, "accept-header").map(str::to_owned);
        if let Some(data) = root.get("url-data").and_then(Json::as_object) {
            url.data = data
                .iter()
                .map(|(name, value)| (name.clone(), Value::from_json(value)))
                .collect();
        }

        url.date_type = match root.get("url-date-type").and_then(Json::as_i64) {
            None | Some(0) => UrlDateType::Offset,
            Some(1) => UrlDateType::Epoch,
            Some(2) => UrlDateType::Weekday,
            Some(other) => {
                self.warner.warn(
                    Category::Url,
                    Severity::InvalidDef,
                    format!("unknown url-date-type {other}, using offset"),
                );
                UrlDateType::Offset
            }
        };
        url.date_format = str_key(root, "url-date-format").map(str::to_owned);
        if let Some(multiplier) = root.get("url-date-multiplier").and_then(Json::as_i64) {
            url.date_multiplier = multiplier;
        }
        if let Some(weekdays) = root.get("url-weekdays").and_then(Json::as_array) {
            url.weekdays = weekdays
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_owned)
                .collect();
        }
        if let Some(relative) = root.get("url-relative-weekdays").and_then(Json::as_object) {
            url.relative_weekdays = relative
                .iter()
                .filter_map(|(name, offset)| {
                    offset.as_i64().map(|days| (name.to_lowercase(), days))
                })
                .collect();
        }
        if let Some(splitter) = str_key(root, "item-range-splitter") {
            url.item_splitter = splitter.to_owned();
        }
        if let Some(splitter) = str_key(root, "date-range-splitter") {
            url.date_splitter = splitter.to_owned();
        }
        if let Some(count) = root.get("default-item-count").and_then(Json::as_i64) {
            url.default_count = count;
        }

        Ok(Some(url))
    }

    fn compile_block(
        &mut self,
        raw_block: &Json,
        field_defs: Option<&Json>,
    ) -> Result<IterBlock, DefError> {
        let key_raw = raw_block.get("key-path").ok_or_else(|| DefError::BadDirective {
            directive: "key-path".to_owned(),
            reason: "iteration block has no key path".to_owned(),
        })?;

        let mut scope = LinkScope::default();
        let key_path = self.compile_path(key_raw, &mut scope, PathRole::Key)?;

        let mut value_paths = Vec::new();
        if let Some(raw_values) = raw_block.get("values").and_then(Json::as_array) {
            for raw_path in raw_values {
                value_paths.push(self.compile_path(raw_path, &mut scope, PathRole::Value)?);
            }
        }

        let var_count = 1 + value_paths.len();
        let mut fields = Vec::new();
        if let Some(defs) = field_defs.and_then(Json::as_object) {
            for (name, raw_def) in defs {
                fields.push(Field {
                    name: name.clone(),
                    def: self.compile_link_def(raw_def, var_count)?,
                });
            }
        }

        Ok(IterBlock {
            key_path,
            value_paths,
            fields,
        })
    }

    fn compile_path(
        &mut self,
        raw: &Json,
        scope: &mut LinkScope,
        role: PathRole,
    ) -> Result<PathDef, DefError> {
        let dicts: Vec<&Json> = match raw {
            Json::Array(items) => items.iter().collect(),
            single @ Json::Object(_) => vec![single],
            other => {
                return Err(DefError::BadDirective {
                    directive: "path".to_owned(),
                    reason: format!("expected a list of steps, found {other}"),
                })
            }
        };

        let mut path = PathDef::default();
        let count = dicts.len();
        for (position, raw_step) in dicts.into_iter().enumerate() {
            let is_last = position + 1 == count;
            let step = raw_step.as_object().ok_or_else(|| DefError::BadDirective {
                directive: "path".to_owned(),
                reason: format!("step {position} is not an object"),
            })?;

            if let Some(raw_name) = step.get("name") {
                let capture = self.compile_value_def(raw_name, scope)?;
                path.steps.push(NodeStep::Name(Box::new(capture)));
            }

            let selector = self.compile_selector(step, scope, is_last && role != PathRole::Init)?;
            if let Some(selector) = selector {
                path.steps.push(NodeStep::Select(selector));
            }

            if let Some(id) = step.get("node").and_then(Json::as_u64) {
                let id = id as u32;
                path.steps.push(NodeStep::StoreNode(id));
                scope.nodes.insert(id);
            }

            if is_last && role != PathRole::Init {
                let mut capture = self.compile_value_def(raw_step, scope)?;
                capture.emit = true;
                if let Some(id) = capture.link {
                    scope.values.insert(id);
                }
                path.steps.push(NodeStep::Value(Box::new(capture)));
            } else if !is_last {
                // A mid-path step that selects nothing can still store a
                // link value from the current node.
                if selector_is_empty(step) {
                    if let Some(id) = step.get("link").and_then(Json::as_u64) {
                        let mut capture = self.compile_value_def(raw_step, scope)?;
                        capture.link = Some(id as u32);
                        scope.values.insert(id as u32);
                        path.steps.push(NodeStep::Value(Box::new(capture)));
                    }
                }
            }
        }
        Ok(path)
    }

    /// Compile the selector half of a step. Returns `None` when the step has
    /// no selecting directive at all (it is then a pure capture or store).
    fn compile_selector(
        &mut self,
        step: &serde_json::Map<String, Json>,
        scope: &mut LinkScope,
        is_value_tail: bool,
    ) -> Result<Option<Selector>, DefError> {
        if selector_is_empty(step) {
            return Ok(None);
        }

        let mut selector = Selector::default();

        if let Some(raw_axis) = step.get("path") {
            selector.axis = match raw_axis {
                Json::String(axis) => match axis.as_str() {
                    "all" => Axis::AllChildren,
                    "parent" => Axis::Parent,
                    "root" => Axis::Root,
                    other => {
                        return Err(DefError::BadDirective {
                            directive: "path".to_owned(),
                            reason: format!("unknown relative path '{other}'"),
                        })
                    }
                },
                Json::Object(call) => {
                    let id = call.get("link").and_then(Json::as_u64).ok_or_else(|| {
                        DefError::BadDirective {
                            directive: "path".to_owned(),
                            reason: "relative path object has no 'link' id".to_owned(),
                        }
                    })? as u32;
                    if !scope.nodes.contains(&id) {
                        return Err(DefError::UnknownNodeLink { id });
                    }
                    Axis::SavedLink(id)
                }
                other => {
                    return Err(DefError::BadDirective {
                        directive: "path".to_owned(),
                        reason: format!("unusable relative path {other}"),
                    })
                }
            };
        }

        if let Some(raw_tag) = step.get("tag") {
            selector.tag = Some(self.compile_value_ref(raw_tag, scope, "tag")?);
        }
        if let Some(tags) = step.get("tags").and_then(Json::as_array) {
            selector.tags = tags
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_lowercase)
                .collect();
        }

        if let Some(raw_key) = step.get("key") {
            selector.key = Some(self.compile_value_ref(raw_key, scope, "key")?);
        }
        match step.get("keys") {
            Some(Json::Array(keys)) => {
                selector.keys = keys.iter().map(Value::from_json).collect();
            }
            // The original vocabulary spelled child-key assertions as a
            // "keys" object; keep accepting that form.
            Some(conjunctions @ Json::Object(_)) => {
                selector.child_keys = self.compile_conjunctions(conjunctions, scope, "keys")?;
            }
            _ => {}
        }
        if let Some(conjunctions) = step.get("childkeys") {
            selector.child_keys = self.compile_conjunctions(conjunctions, scope, "childkeys")?;
        }
        if let Some(conjunctions) = step.get("notchildkeys") {
            selector.not_child_keys =
                self.compile_conjunctions(conjunctions, scope, "notchildkeys")?;
        }

        if let Some(conjunctions) = step.get("attrs") {
            selector.attrs = self.compile_conjunctions(conjunctions, scope, "attrs")?;
        }
        if let Some(conjunctions) = step.get("notattrs") {
            selector.not_attrs = self.compile_conjunctions(conjunctions, scope, "notattrs")?;
        }

        if let Some(text) = str_key(step, "text") {
            selector.text = Some(text.to_lowercase());
        }
        if let Some(tail) = str_key(step, "tail") {
            selector.tail = Some(tail.to_lowercase());
        }

        if let Some(raw_index) = step.get("index") {
            selector.index = Some(self.compile_index(raw_index, scope)?);
        }

        selector.first = step.contains_key("first");
        selector.last = step.contains_key("last");

        // A "link" on a selecting step stores the matched node's captured
        // value; on a value tail the link belongs to the value capture
        // instead.
        if !is_value_tail {
            if let Some(id) = step.get("link").and_then(Json::as_u64) {
                let id = id as u32;
                let capture = self.compile_value_def(&Json::Object(step.clone()), scope)?;
                selector.store = Some(LinkCapture {
                    id,
                    capture: Box::new(capture),
                });
                scope.values.insert(id);
            }
        }

        Ok(Some(selector))
    }

    fn compile_index(&mut self, raw: &Json, scope: &LinkScope) -> Result<ValueRef, DefError> {
        match raw {
            Json::Number(_) => Ok(ValueRef::Literal(Value::from_json(raw))),
            Json::Object(index) => {
                let id = index.get("link").and_then(Json::as_u64).ok_or_else(|| {
                    DefError::BadDirective {
                        directive: "index".to_owned(),
                        reason: "index object has no 'link' id".to_owned(),
                    }
                })? as u32;
                if !scope.values.contains(&id) {
                    return Err(DefError::UnknownValueLink { id });
                }

                let relation = if index.contains_key("previous") {
                    Relation::Previous
                } else if index.contains_key("next") {
                    Relation::Next
                } else {
                    Relation::Exact
                };

                let delta = match index.get("calc").and_then(Json::as_array) {
                    Some(calc) if calc.len() == 2 => {
                        let amount = calc[1].as_i64().unwrap_or(0);
                        match calc[0].as_str() {
                            Some("plus") => amount,
                            Some("min") => -amount,
                            _ => 0,
                        }
                    }
                    _ => 0,
                };

                Ok(ValueRef::Link(LinkRef {
                    id,
                    delta,
                    relation,
                }))
            }
            other => Err(DefError::BadDirective {
                directive: "index".to_owned(),
                reason: format!("unusable index {other}"),
            }),
        }
    }

    fn compile_value_ref(
        &mut self,
        raw: &Json,
        scope: &LinkScope,
        directive: &str,
    ) -> Result<ValueRef, DefError> {
        match raw {
            Json::Object(payload) if payload.contains_key("link") => {
                let id = payload
                    .get("link")
                    .and_then(Json::as_u64)
                    .ok_or_else(|| DefError::BadDirective {
                        directive: directive.to_owned(),
                        reason: "link id is not an integer".to_owned(),
                    })? as u32;
                if !scope.values.contains(&id) {
                    return Err(DefError::UnknownValueLink { id });
                }
                let delta = match payload.get("calc").and_then(Json::as_array) {
                    Some(calc) if calc.len() == 2 => {
                        let amount = calc[1].as_i64().unwrap_or(0);
                        match calc[0].as_str() {
                            Some("plus") => amount,
                            Some("min") => -amount,
                            _ => 0,
                        }
                    }
                    _ => 0,
                };
                Ok(ValueRef::Link(LinkRef {
                    id,
                    delta,
                    relation: Relation::Exact,
                }))
            }
            literal => Ok(ValueRef::Literal(Value::from_json(literal))),
        }
    }

    fn compile_conjunctions(
        &mut self,
        raw: &Json,
        scope: &LinkScope,
        directive: &str,
    ) -> Result<Vec<Conjunction>, DefError> {
        let groups: Vec<&Json> = match raw {
            Json::Array(items) => items.iter().collect(),
            single @ Json::Object(_) => vec![single],
            other => {
                return Err(DefError::BadDirective {
                    directive: directive.to_owned(),
                    reason: format!("expected an object or list of objects, found {other}"),
                })
            }
        };

        let mut conjunctions = Vec::with_capacity(groups.len());
        for group in groups {
            let entries = group.as_object().ok_or_else(|| DefError::BadDirective {
                directive: directive.to_owned(),
                reason: format!("conjunction {group} is not an object"),
            })?;

            let mut conjunction = Conjunction::new();
            for (name, raw_test) in entries {
                let test = match raw_test {
                    Json::Null => EntryTest::Present,
                    Json::Object(payload) if payload.get("value") == Some(&Json::Null) => {
                        EntryTest::Present
                    }
                    Json::Object(payload) if payload.contains_key("not") => {
                        let rejected = payload
                            .get("not")
                            .and_then(Json::as_array)
                            .map(|items| items.iter().map(Value::from_json).collect())
                            .unwrap_or_default();
                        EntryTest::NoneOf(rejected)
                    }
                    Json::Array(allowed) => EntryTest::AnyOf(
                        allowed
                            .iter()
                            .map(|item| self.compile_value_ref(item, scope, directive))
                            .collect::<Result<_, _>>()?,
                    ),
                    single => {
                        EntryTest::AnyOf(vec![self.compile_value_ref(single, scope, directive)?])
                    }
                };
                conjunction.insert(name.to_lowercase(), test);
            }
            conjunctions.push(conjunction);
        }
        Ok(conjunctions)
    }

    fn compile_value_def(&mut self, raw: &Json, scope: &mut LinkScope) -> Result<ValueDef, DefError> {
        let Some(step) = raw.as_object() else {
            return Err(DefError::BadDirective {
                directive: "value".to_owned(),
                reason: format!("value capture {raw} is not an object"),
            });
        };

        let source = if let Some(literal) = step.get("value") {
            Source::Literal(Value::from_json(literal))
        } else if let Some(raw_attr) = step.get("attr") {
            Source::Attr(self.compile_value_ref(raw_attr, scope, "attr")?)
        } else if let Some(select) = str_key(step, "select") {
            match select {
                "text" => Source::Text,
                "tail" => Source::Tail,
                "tag" => Source::Tag,
                "key" => Source::Key,
                "value" => Source::Scalar,
                "index" => Source::Index,
                "presence" => Source::Presence,
                "inclusive text" | "inclusive-text" => Source::InclusiveText(TextScan {
                    depth: step.get("depth").and_then(Json::as_u64).unwrap_or(1) as usize,
                    include: string_list(step.get("include")),
                    exclude: string_list(step.get("exclude")),
                }),
                other => {
                    self.warner.warn(
                        Category::DataDef,
                        Severity::InvalidDef,
                        format!("unknown select '{other}', using the node default"),
                    );
                    self.default_source()
                }
            }
        } else {
            self.default_source()
        };

        let mut def = ValueDef::of(source);
        def.calc = self.compile_calc(step)?;
        def.default = step.get("default").map(Value::from_json);
        def.coerce = self.compile_type(step)?;
        def.member_of = str_key(step, "member-off").map(str::to_owned);
        def.link = step.get("link").and_then(Json::as_u64).map(|id| id as u32);
        def.first = step.contains_key("first");
        def.last = step.contains_key("last");
        Ok(def)
    }

    /// Build the calc pipeline in its fixed encoded order.
    fn compile_calc(&mut self, step: &serde_json::Map<String, Json>) -> Result<Vec<CalcOp>, DefError> {
        let mut ops = Vec::new();

        for (name, mode) in [
            ("lower", CaseMode::Lower),
            ("upper", CaseMode::Upper),
            ("capitalize", CaseMode::Capitalize),
        ] {
            if step.contains_key(name) {
                ops.push(CalcOp::Case(mode));
            }
        }

        if let Some(fold) = step.get("ascii-replace").and_then(Json::as_array) {
            if !fold.is_empty() {
                let replacement = fold
                    .first()
                    .and_then(Json::as_str)
                    .unwrap_or("_")
                    .to_owned();
                let pre = if fold.len() > 2 {
                    let source = fold[2].as_str().unwrap_or("");
                    let replacement = fold[1].as_str().unwrap_or("").to_owned();
                    Some((self.pattern(source, "ascii-replace")?, replacement))
                } else {
                    None
                };
                ops.push(CalcOp::AsciiFold { replacement, pre });
            }
        }

        if let Some(prefix) = str_key(step, "lstrip") {
            ops.push(CalcOp::LStrip(prefix.to_owned()));
        }
        if let Some(suffix) = str_key(step, "rstrip") {
            ops.push(CalcOp::RStrip(suffix.to_owned()));
        }

        if let Some(subs) = step.get("sub").and_then(Json::as_array) {
            let mut pairs = Vec::new();
            for pair in subs.chunks(2) {
                if let [pattern, replacement] = pair {
                    let source = pattern.as_str().unwrap_or("");
                    pairs.push((
                        self.pattern(source, "sub")?,
                        replacement.as_str().unwrap_or("").to_owned(),
                    ));
                }
            }
            if !pairs.is_empty() {
                ops.push(CalcOp::Sub(pairs));
            }
        }

        if let Some(raw_split) = step.get("split").filter(|s| s.is_array()) {
            let items = raw_split.as_array().expect("checked above");
            let rules: Vec<&Json> = if items.first().map(|item| item.is_array()).unwrap_or(false) {
                items.iter().collect()
            } else {
                vec![raw_split]
            };
            let mut compiled = Vec::new();
            for rule in rules {
                let Some(parts) = rule.as_array() else { continue };
                if parts.len() < 2 {
                    continue;
                }
                let Some(separator) = parts[0].as_str() else { continue };
                let take = if parts[1].as_str() == Some("list-all") {
                    SplitTake::All
                } else {
                    SplitTake::Indexes(
                        parts[1..]
                            .iter()
                            .filter_map(Json::as_i64)
                            .collect(),
                    )
                };
                compiled.push(SplitRule {
                    sep: self.pattern(separator, "split")?,
                    take,
                });
            }
            if !compiled.is_empty() {
                ops.push(CalcOp::Split(compiled));
            }
        }

        let coercion = str_key(step, "type");
        let multiplier_feeds_type = matches!(coercion, Some("timestamp" | "datestamp"));
        if let Some(multiplier) = step.get("multiplier").and_then(Json::as_i64) {
            if !multiplier_feeds_type {
                ops.push(CalcOp::Multiply(multiplier));
            }
        }
        if let Some(divider) = step.get("divider").and_then(Json::as_i64) {
            if divider != 0 {
                ops.push(CalcOp::Divide(divider));
            }
        }

        if let Some(lookup) = step.get("replace").and_then(Json::as_object) {
            ops.push(CalcOp::Replace(
                lookup
                    .iter()
                    .map(|(from, to)| (from.to_lowercase(), Value::from_json(to)))
                    .collect(),
            ));
        }

        Ok(ops)
    }

    fn compile_type(&mut self, step: &serde_json::Map<String, Json>) -> Result<Option<TypeOp>, DefError> {
        let Some(name) = str_key(step, "type") else {
            return Ok(None);
        };
        let multiplier = step
            .get("multiplier")
            .and_then(Json::as_i64)
            .filter(|m| *m != 0)
            .unwrap_or(1);

        let op = match name {
            "" => return Ok(None),
            "timestamp" => TypeOp::Timestamp { multiplier },
            "datetimestring" => TypeOp::DateTimeString {
                format: str_key(step, "datetimestring").map(str::to_owned),
            },
            "time" => TypeOp::Time {
                splitter: self.pattern_key(step, "time-splitter"),
            },
            "timedelta" => TypeOp::TimeDelta,
            "date" => TypeOp::Date {
                splitter: self.pattern_key(step, "date-splitter"),
                sequence: step.get("date-sequence").and_then(Json::as_array).map(|parts| {
                    parts
                        .iter()
                        .filter_map(Json::as_str)
                        .filter_map(|field| match field.to_lowercase().as_str() {
                            "d" | "day" => Some(DateField::Day),
                            "m" | "month" => Some(DateField::Month),
                            "y" | "year" => Some(DateField::Year),
                            _ => None,
                        })
                        .collect()
                }),
            },
            "datestamp" => TypeOp::DateStamp { multiplier },
            "relative-weekday" => TypeOp::RelativeWeekday,
            "string" => TypeOp::Str,
            "int" => TypeOp::Int,
            "float" => TypeOp::Float,
            "boolean" => TypeOp::Bool,
            "lower-ascii" => TypeOp::LowerAscii,
            "str-list" => TypeOp::StrList {
                splitter: self.pattern_key(step, "str-list-splitter"),
                omit_empty: step
                    .get("omit-empty")
                    .and_then(Json::as_bool)
                    .unwrap_or(false),
            },
            "list" => TypeOp::List,
            "lower" => TypeOp::Lower,
            "upper" => TypeOp::Upper,
            "capitalize" => TypeOp::Capitalize,
            other => {
                self.warner.warn(
                    Category::DataDef,
                    Severity::InvalidDef,
                    format!("unknown type '{other}' ignored"),
                );
                return Ok(None);
            }
        };
        Ok(Some(op))
    }

    fn compile_link_def(&mut self, raw: &Json, var_count: usize) -> Result<LinkDef, DefError> {
        let kind = match raw {
            Json::Number(index) => {
                let index = index.as_u64().ok_or_else(|| DefError::BadDirective {
                    directive: "values".to_owned(),
                    reason: format!("variable reference {index} is not a whole number"),
                })? as usize;
                if index >= var_count {
                    return Err(DefError::BadVarIndex {
                        index,
                        count: var_count,
                    });
                }
                LinkKind::Var(index)
            }
            Json::Object(def) => {
                if let Some(index) = def.get("varid").and_then(Json::as_u64) {
                    let index = index as usize;
                    if index >= var_count {
                        return Err(DefError::BadVarIndex {
                            index,
                            count: var_count,
                        });
                    }
                    LinkKind::Var(index)
                } else if let Some(id) = def.get("funcid").and_then(Json::as_u64) {
                    let id = id as u32;
                    if id > MAX_BUILTIN_FUN && id < EXTENSION_FUN_BASE {
                        return Err(DefError::UnknownFunction { id });
                    }
                    let args = match def.get("data").and_then(Json::as_array) {
                        Some(items) => items
                            .iter()
                            .map(|item| self.compile_link_def(item, var_count))
                            .collect::<Result<_, _>>()?,
                        None => Vec::new(),
                    };
                    LinkKind::Fun { id, args }
                } else if let Some(literal) = def.get("value") {
                    LinkKind::Literal(Value::from_json(literal))
                } else {
                    return Err(DefError::BadDirective {
                        directive: "values".to_owned(),
                        reason: format!("link definition {raw} has no production"),
                    });
                }
            }
            literal => LinkKind::Literal(Value::from_json(literal)),
        };

        let mut def = LinkDef::of(kind);
        if let Some(step) = raw.as_object() {
            def.default = step.get("default").map(Value::from_json);
            if let Some(source) = str_key(step, "regex") {
                def.regex = Some(self.pattern(source, "regex")?);
            }
            def.coerce = self.compile_type(step)?;
            def.calc = self.compile_calc(step)?;
            def.max_length = step.get("max-length").and_then(Json::as_u64).map(|n| n as usize);
            def.min_length = step.get("min-length").and_then(Json::as_u64).map(|n| n as usize);
        }
        Ok(def)
    }

    fn pattern(&mut self, source: &str, directive: &str) -> Result<Pattern, DefError> {
        Pattern::new(source).map_err(|err| DefError::BadDirective {
            directive: directive.to_owned(),
            reason: format!("pattern '{source}' does not compile: {err}"),
        })
    }

    /// Splitters are authored as separators but evaluated as patterns, so a
    /// separator that does not compile falls back to the root default with
    /// a warning.
    fn pattern_key(
        &mut self,
        step: &serde_json::Map<String, Json>,
        name: &str,
    ) -> Option<Pattern> {
        let source = str_key(step, name)?;
        match Pattern::new(source) {
            Ok(pattern) => Some(pattern),
            Err(_) => {
                self.warner.warn(
                    Category::DataDef,
                    Severity::InvalidDef,
                    format!("splitter '{source}' for '{name}' does not compile"),
                );
                None
            }
        }
    }
}

fn selector_is_empty(step: &serde_json::Map<String, Json>) -> bool {
    const SELECTING: [&str; 12] = [
        "path",
        "tag",
        "tags",
        "key",
        "keys",
        "childkeys",
        "notchildkeys",
        "attrs",
        "notattrs",
        "text",
        "tail",
        "index",
    ];
    !SELECTING.iter().any(|name| step.contains_key(*name))
}

fn str_key<'a>(step: &'a serde_json::Map<String, Json>, name: &str) -> Option<&'a str> {
    step.get(name).and_then(Json::as_str)
}

fn string_list(raw: Option<&Json>) -> Vec<String> {
    raw.and_then(Json::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_timezone(name: &str) -> Option<i32> {
    let trimmed = name.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return Some(0);
    }
    let (sign, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => (1, rest),
        None => (-1, trimmed.strip_prefix('-')?),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

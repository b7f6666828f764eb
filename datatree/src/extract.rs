//! The extractor: orchestrates a full run over one tree.
//!
//! A run selects the start node with the initial path, walks each iteration
//! block's key path to enumerate records, evaluates the block's value paths
//! per key node, and hands the collected variables to the link stage which
//! assembles the named record. Cancellation is cooperative (checked between
//! key nodes) and progress is push-based through a bounded queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::def::model::{LinkDef, LinkKind, PathDef, Source, TypeOp};
use crate::def::DataDef;
use crate::matcher::{leaves, Hit, LinkEnv, Walker};
use crate::pipeline::Anchor;
use crate::status::{Fatal, Soft, Status};
use crate::tree::{NodeId, Tree, TreeKind};
use crate::url::Request;
use crate::value::Value;
use crate::warn::{Category, Severity, Warner};
use crate::Record;

mod linkfn;

/// Host-supplied dispatch for function ids at or above the reserved
/// threshold (100). The engine calls in and interprets the result
/// uniformly.
pub trait Extension {
    /// Handle a link function call.
    fn link_function(&self, id: u32, args: &[Value]) -> ExtensionResult;

    /// Handle a URL-builder function call, returning the rendered piece.
    fn url_function(&self, id: u32, args: &[Value]) -> Option<String>;
}

/// What an extension did with a dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionResult {
    /// The extension produced the value itself.
    Value(Value),

    /// Re-enter the built-in pipeline with a base function id and remapped
    /// arguments.
    Remap {
        /// The built-in function to run.
        id: u32,
        /// Its arguments.
        args: Vec<Value>,
    },

    /// The extension does not know the id.
    Unhandled,
}

/// Runs extractions over one tree with one compiled definition.
pub struct Extractor<'a> {
    tree: &'a Tree,
    def: &'a DataDef,
    warner: Warner,
    anchor: Anchor,
    status: Status,
    progress: Option<SyncSender<(usize, usize)>>,
    quit: Option<Arc<AtomicBool>>,
    extension: Option<&'a dyn Extension>,
}

impl<'a> Extractor<'a> {
    /// Create an extractor anchored to today's date in the definition
    /// timezone.
    pub fn new(tree: &'a Tree, def: &'a DataDef) -> Self {
        let warner = Warner::default();
        let offset = chrono::FixedOffset::east_opt(def.config.tz_offset_secs)
            .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).expect("utc offset is valid"));
        let today = Utc::now().with_timezone(&offset).date_naive();
        Self {
            tree,
            def,
            warner,
            anchor: Anchor::new(&def.config, today),
            status: Status::default(),
            progress: None,
            quit: None,
            extension: None,
        }
    }

    /// Report warnings under this caller id.
    pub fn with_caller(mut self, caller: u32) -> Self {
        self.warner = Warner::new(caller);
        self
    }

    /// Publish `(processed, total)` per key node onto this queue. Tuples
    /// that do not fit are dropped rather than blocking the walk.
    pub fn with_progress(mut self, progress: SyncSender<(usize, usize)>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Observe this flag between key nodes; when set, the run returns early
    /// with the quitting status.
    pub fn with_quit(mut self, quit: Arc<AtomicBool>) -> Self {
        self.quit = Some(quit);
        self
    }

    /// Dispatch reserved function ids to this extension.
    pub fn with_extension(mut self, extension: &'a dyn Extension) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Override the current-date anchor with a `YYYY-MM-DD` date. An
    /// unparseable date keeps today and flags `CurrentDateFailed`.
    pub fn with_current_date(mut self, date: &str) -> Self {
        match NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d") {
            Ok(parsed) => self.anchor.set_date(&self.def.config, parsed),
            Err(_) => {
                self.status.flag(Soft::CurrentDateFailed);
                self.warner.warn(
                    Category::General,
                    Severity::InvalidData,
                    format!("current date '{date}' does not parse, keeping today"),
                );
            }
        }
        self
    }

    /// Move the current-date anchor; the relative-day table recomputes.
    pub fn set_current_date(&mut self, date: NaiveDate) {
        self.anchor.set_date(&self.def.config, date);
    }

    /// The combined status so far.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Fold an external status (tree build flags, compile flags) into the
    /// combined status.
    pub fn merge_status(&mut self, other: Status) {
        self.status.merge(other);
    }

    /// Accumulate non-fatal flags into the combined status.
    pub fn flag(&mut self, soft: impl Into<flagset::FlagSet<Soft>>) {
        self.status.flag(soft);
    }

    fn walker(&self) -> Walker<'_> {
        Walker::new(self.tree, &self.def.config, &self.anchor, &self.warner)
    }

    /// Walk the initial path from the root; its first hit is the start
    /// node. When nothing matches, extraction starts at the root and a
    /// parse warning is reported.
    pub fn find_start_node(&self) -> NodeId {
        if self.def.init_path.is_empty() {
            return self.tree.root();
        }
        let walker = self.walker();
        let mut env = LinkEnv::default();
        let hits = walker.walk(self.tree.root(), &self.def.init_path, &mut env);
        match leaves(&hits).first() {
            Some(first) => first.node,
            None => {
                self.warner.warn(
                    Category::Parse,
                    Severity::Serious,
                    "initial path matched nothing, starting at the root",
                );
                self.tree.root()
            }
        }
    }

    /// Run the full extraction.
    ///
    /// Records appear in iteration order: blocks in declaration order, key
    /// nodes in tree order. On a fatal condition the record list is empty
    /// and [`Extractor::status`] carries the code.
    #[tracing::instrument(skip_all, fields(blocks = self.def.blocks.len()))]
    pub fn extract(&mut self) -> Vec<Record> {
        let mut status = self.status;
        let mut records = Vec::new();
        let start = self.find_start_node();
        // Built inline so the borrow stays on the anchor and warner fields,
        // leaving the status field assignable below.
        let walker = Walker::new(self.tree, &self.def.config, &self.anchor, &self.warner);

        for (position, block) in self.def.blocks.iter().enumerate() {
            debug!(block = position, "walking key path");
            let mut key_env = LinkEnv::default();
            let hits = walker.walk(start, &block.key_path, &mut key_env);
            let keys = leaves(&hits);
            let total = keys.len();

            'keys: for (processed, key_hit) in keys.iter().enumerate() {
                if let Some(quit) = &self.quit {
                    if quit.load(Ordering::Relaxed) {
                        status.set_fatal(Fatal::Quit);
                        self.status = status;
                        return records;
                    }
                }
                if let Some(progress) = &self.progress {
                    let _ = progress.try_send((processed + 1, total));
                }

                let key_value = key_hit.value.clone().unwrap_or(Value::Null);
                if contains_filtered(&key_value) {
                    continue 'keys;
                }

                let origin = match self.tree.kind() {
                    TreeKind::Json => self
                        .tree
                        .node(key_hit.node)
                        .parent()
                        .unwrap_or(key_hit.node),
                    TreeKind::Html => key_hit.node,
                };

                let mut env = key_hit.env.clone();
                let mut vars = vec![key_value];
                for path in &block.value_paths {
                    let value = self.find_data_value(&walker, path, origin, &mut env);
                    if contains_filtered(&value) {
                        continue 'keys;
                    }
                    vars.push(value);
                }

                records.push(self.link_record(&walker, block, &vars));
            }
        }

        if records.is_empty() {
            status.set_fatal(Fatal::NoData);
        }
        self.status = status;
        records
    }

    /// Assemble the outgoing request described by the definition's URL
    /// directives, or `None` when the definition carries none.
    pub fn build_request(
        &self,
        params: &indexmap::IndexMap<String, Value>,
    ) -> Option<Request> {
        let def = self.def.url.as_ref()?;
        Some(crate::url::build(
            def,
            &self.anchor,
            params,
            self.extension,
            &self.warner,
        ))
    }

    /// Evaluate a single compiled value path from the start node, outside
    /// any iteration block.
    pub fn query(&self, path: &PathDef) -> Value {
        let walker = self.walker();
        let mut env = LinkEnv::default();
        let origin = self.find_start_node();
        self.find_data_value(&walker, path, origin, &mut env)
    }

    /// Walk a value path and reduce its hits to one value: the presence
    /// test, first/last selection, list assembly, and the no-match default
    /// all live here.
    fn find_data_value(
        &self,
        walker: &Walker<'_>,
        path: &PathDef,
        origin: NodeId,
        env: &mut LinkEnv,
    ) -> Value {
        if path.is_empty() {
            return Value::Null;
        }

        let hits = walker.walk(origin, path, env);
        let tail = path.tail_value();

        if matches!(tail.map(|t| &t.source), Some(Source::Presence)) {
            // Documented guarantee: presence means exactly one match.
            return Value::Bool(leaves(&hits).len() == 1);
        }

        let as_list = matches!(tail.and_then(|t| t.coerce.as_ref()), Some(TypeOp::List));

        let mut values: Vec<Value> = hits.iter().map(hit_value).collect();
        if let Some(tail) = tail {
            if tail.first && values.len() > 1 {
                values.truncate(1);
            } else if tail.last && values.len() > 1 {
                values.drain(..values.len() - 1);
            }
        }

        if values.is_empty() {
            return if as_list {
                Value::List(Vec::new())
            } else {
                tail.and_then(|t| t.default.clone()).unwrap_or(Value::Null)
            };
        }
        if values.len() > 1 || as_list {
            return Value::List(values);
        }
        values.remove(0)
    }

    fn link_record(&self, walker: &Walker<'_>, block: &crate::def::model::IterBlock, vars: &[Value]) -> Record {
        let mut record = Record::new();
        if block.fields.is_empty() {
            for (position, value) in vars.iter().enumerate() {
                record.insert(position.to_string(), value.clone());
            }
            return record;
        }

        for field in &block.fields {
            if let Some(value) = self.link_value(walker, &field.def, vars) {
                record.insert(field.name.clone(), value);
            }
        }
        record
    }

    /// Compute one record field. Returns `None` when a bounds check fails
    /// and the definition declares no default: the field is dropped.
    fn link_value(&self, walker: &Walker<'_>, def: &LinkDef, vars: &[Value]) -> Option<Value> {
        let mut value = match &def.kind {
            LinkKind::Var(position) => match vars.get(*position) {
                Some(value) => value.clone(),
                None => {
                    self.warner.warn(
                        Category::Link,
                        Severity::InvalidData,
                        format!("variable {position} not produced for this record"),
                    );
                    Value::Null
                }
            },
            LinkKind::Literal(value) => value.clone(),
            LinkKind::Fun { id, args } => {
                let computed: Vec<Value> = args
                    .iter()
                    .map(|arg| self.link_value(walker, arg, vars).unwrap_or(Value::Null))
                    .collect();
                self.call_function(walker, *id, computed)
            }
        };

        if value.is_null() {
            if let Some(default) = &def.default {
                value = default.clone();
            }
        }

        if let Some(pattern) = &def.regex {
            if let Some(text) = value.as_str() {
                if let Some(captures) = pattern.regex().captures(text) {
                    if let Some(found) = captures.get(1).or_else(|| captures.get(0)) {
                        value = Value::String(found.as_str().to_owned());
                    }
                }
            }
        }

        if let Some(op) = &def.coerce {
            value = walker.coerce(value, op);
        }
        value = walker.apply_calc(value, &def.calc);

        if let Value::String(text) = &value {
            let too_long = def.max_length.is_some_and(|max| text.chars().count() > max);
            let too_short = def.min_length.is_some_and(|min| text.chars().count() < min);
            if too_long || too_short {
                return def.default.clone();
            }
        }

        Some(value)
    }
}

fn hit_value(hit: &Hit) -> Value {
    match hit {
        Hit::Leaf(leaf) => leaf.value.clone().unwrap_or(Value::Null),
        Hit::Group { name, hits } => {
            let grouped: Vec<Value> = hits.iter().map(hit_value).collect();
            let mut map = indexmap::IndexMap::new();
            map.insert(name.clone(), Value::List(grouped));
            Value::Map(map)
        }
    }
}

/// Whether the filtered sentinel appears anywhere in a value.
fn contains_filtered(value: &Value) -> bool {
    match value {
        Value::Filtered => true,
        Value::List(items) => items.iter().any(contains_filtered),
        Value::Map(entries) => entries.values().any(contains_filtered),
        _ => false,
    }
}

//! The compiled form of a data definition.
//!
//! The compiler lowers the authored JSON document into these types once;
//! the matcher and the value pipeline only ever see this form. Everything
//! here serializes with serde so callers may persist a compiled definition
//! and hand it back later (the [`crate::def::DataDef`] root carries the
//! compiler version stamp used to detect stale persisted copies).

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::Display;

use crate::value::Value;

/// Names a stored link: a captured value or a node back-reference.
pub type LinkId = u32;

/// A regex carried in compiled form: the source pattern plus its compiled
/// expression. Serializes as the source pattern alone.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern.
    pub fn new(source: impl Into<String>) -> Result<Self, regex::Error> {
        let source = source.into();
        let regex = Regex::new(&source)?;
        Ok(Self { source, regex })
    }

    /// The source pattern.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The compiled expression.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(source).map_err(serde::de::Error::custom)
    }
}

/// An ordered sequence of steps driving the matcher from a start node to one
/// or more target nodes, optionally producing a value at the end.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathDef {
    /// Steps, processed left to right.
    pub steps: Vec<NodeStep>,
}

impl PathDef {
    /// Whether the path has no steps at all.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The trailing value capture, if the path ends in one.
    pub fn tail_value(&self) -> Option<&ValueDef> {
        match self.steps.last() {
            Some(NodeStep::Value(def)) => Some(def),
            _ => None,
        }
    }
}

/// One step in a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeStep {
    /// Match nodes and descend into the remaining path.
    Select(Selector),

    /// Register the current node in the walk environment under a link id.
    StoreNode(LinkId),

    /// Compute a name from the current node and group the results of the
    /// remaining path under it.
    Name(Box<ValueDef>),

    /// Compute a value from the current node.
    Value(Box<ValueDef>),
}

/// Where a selector draws its candidates from.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Axis {
    /// The current node's children, filtered by the predicates.
    #[default]
    Children,

    /// Every child, unconditionally.
    AllChildren,

    /// The current node's parent.
    Parent,

    /// The tree root.
    Root,

    /// A node stored earlier in the walk.
    SavedLink(LinkId),
}

/// How a predicate payload resolves at match time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueRef {
    /// A value fixed at compile time.
    Literal(Value),

    /// A value stored earlier in the walk.
    Link(LinkRef),
}

impl ValueRef {
    /// Shorthand for a literal string payload.
    pub fn literal(value: impl Into<Value>) -> Self {
        ValueRef::Literal(value.into())
    }
}

/// A reference to a stored link value, with optional integer arithmetic and
/// an ordering relation used by index predicates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkRef {
    /// The stored link consulted at match time.
    pub id: LinkId,

    /// Added to numeric link values before comparing.
    pub delta: i64,

    /// How the candidate compares against the resolved value.
    pub relation: Relation,
}

/// Ordering relation for index predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Relation {
    /// The candidate index equals the resolved value.
    #[default]
    Exact,

    /// The candidate index is greater than the resolved value.
    Next,

    /// The candidate index is less than the resolved value.
    Previous,
}

/// One test within an attribute or child-key conjunction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryTest {
    /// The entry must be present, any value.
    Present,

    /// The entry must be present with one of these values.
    AnyOf(Vec<ValueRef>),

    /// The entry must be absent, or present with none of these values.
    NoneOf(Vec<Value>),
}

/// A conjunction of entry tests, keyed by attribute name or child key.
pub type Conjunction = IndexMap<String, EntryTest>;

/// Predicates and modifiers for one matching step.
///
/// Unused predicate slots stay empty; the matcher only evaluates populated
/// ones. Which slots may be populated together is constrained by the tree
/// type detected at compile time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Selector {
    /// Candidate source.
    pub axis: Axis,

    /// Element tag equality (string literal or link).
    pub tag: Option<ValueRef>,

    /// Element tag membership.
    pub tags: Vec<String>,

    /// Keyed-node key equality (literal or link).
    pub key: Option<ValueRef>,

    /// Keyed-node key membership.
    pub keys: Vec<Value>,

    /// Sibling index assertion.
    pub index: Option<ValueRef>,

    /// Element text equality, lowercased.
    pub text: Option<String>,

    /// Element tail equality, lowercased.
    pub tail: Option<String>,

    /// Attribute assertions: a disjunction of conjunctions.
    pub attrs: Vec<Conjunction>,

    /// Negated attribute assertions: any matching conjunction rejects.
    pub not_attrs: Vec<Conjunction>,

    /// Child-key assertions: a disjunction of conjunctions over child keys
    /// and their scalar values.
    pub child_keys: Vec<Conjunction>,

    /// Negated child-key assertions.
    pub not_child_keys: Vec<Conjunction>,

    /// Stop at the first candidate whose remaining path succeeds.
    pub first: bool,

    /// Iterate candidates in reverse and stop at the first success.
    pub last: bool,

    /// Store a value captured from each matched node under this link id.
    pub store: Option<LinkCapture>,
}

/// A value capture attached to a matching step as a side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCapture {
    /// The link id written into the walk environment.
    pub id: LinkId,

    /// How the stored value is computed from the matched node.
    pub capture: Box<ValueDef>,
}

/// Where a value capture reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Source {
    /// Element text.
    Text,

    /// Element tail.
    Tail,

    /// Element tag name.
    Tag,

    /// An element attribute; the name may itself be linked.
    Attr(ValueRef),

    /// Text and tails assembled across descendants.
    InclusiveText(TextScan),

    /// Keyed-node key.
    Key,

    /// Keyed-node scalar payload.
    Scalar,

    /// The node's sibling index.
    Index,

    /// A fixed value.
    Literal(Value),

    /// `true` when the walk reaches the node; the caller turns this into
    /// the exactly-one-match guarantee.
    Presence,
}

/// Bounds for inclusive-text assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextScan {
    /// How many levels of descendants contribute.
    pub depth: usize,

    /// When non-empty, only these tags contribute their subtree text.
    pub include: Vec<String>,

    /// These tags never contribute their subtree text; their tails still
    /// belong to the parent.
    pub exclude: Vec<String>,
}

/// A value capture: source selection plus the post-processing stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDef {
    /// Where the raw value comes from.
    pub source: Source,

    /// Calc operations, applied in order.
    pub calc: Vec<CalcOp>,

    /// Substituted when the value is null after the calc stage.
    pub default: Option<Value>,

    /// Final type coercion.
    pub coerce: Option<TypeOp>,

    /// Name of the value-filter list the result must belong to.
    pub member_of: Option<String>,

    /// Store the result in the walk environment under this link id.
    pub link: Option<LinkId>,

    /// Emit the result as a terminal walk hit.
    pub emit: bool,

    /// Keep only the first produced result.
    pub first: bool,

    /// Keep only the last produced result.
    pub last: bool,
}

impl ValueDef {
    /// A capture reading the given source with no post-processing.
    pub fn of(source: Source) -> Self {
        Self {
            source,
            calc: Vec::new(),
            default: None,
            coerce: None,
            member_of: None,
            link: None,
            emit: false,
            first: false,
            last: false,
        }
    }
}

/// One calc operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalcOp {
    /// Change case and trim.
    Case(CaseMode),

    /// Fold to ASCII: optional pre-substitution, then encode with the
    /// replacement string standing in for residual non-ASCII characters.
    AsciiFold {
        /// Replacement for characters that do not fold.
        replacement: String,
        /// Applied before folding.
        pre: Option<(Pattern, String)>,
    },

    /// Remove a case-insensitive prefix, then trim.
    LStrip(String),

    /// Remove a case-insensitive suffix, then trim.
    RStrip(String),

    /// Regex substitutions applied in order.
    Sub(Vec<(Pattern, String)>),

    /// Split rules applied in order.
    Split(Vec<SplitRule>),

    /// Multiply the integer-coerced value.
    Multiply(i64),

    /// Integer-divide the integer-coerced value.
    Divide(i64),

    /// Map the trimmed, lowercased value through a lookup; misses collapse
    /// to null so a later default applies.
    Replace(IndexMap<String, Value>),
}

/// Case change modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum CaseMode {
    /// Lowercase.
    Lower,
    /// Uppercase.
    Upper,
    /// First character uppercased, rest lowercased.
    Capitalize,
}

/// One split rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRule {
    /// The separator pattern.
    pub sep: Pattern,

    /// What to keep from the split pieces.
    pub take: SplitTake,
}

/// Projection applied after a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitTake {
    /// Keep every piece as a list.
    All,

    /// Keep the piece at the first index, with the pieces at the remaining
    /// indexes concatenated onto it using the join character (the separator
    /// itself, or a space for whitespace separators).
    Indexes(Vec<i64>),
}

/// Date component order for the date coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum DateField {
    /// Day of month.
    Day,
    /// Month number or name.
    Month,
    /// Year.
    Year,
}

/// Final type coercion applied by a value capture or a link definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeOp {
    /// Epoch seconds (divided by the multiplier) to a UTC instant.
    Timestamp {
        /// Input units per second, e.g. 1000 for milliseconds.
        multiplier: i64,
    },

    /// Parse with a strftime-style format in the definition timezone and
    /// return in UTC. `None` uses the root `datetimestring` format.
    DateTimeString {
        /// Override for the root format.
        format: Option<String>,
    },

    /// Split on the time splitter; missing components default to zero.
    Time {
        /// Override for the root splitter.
        splitter: Option<Pattern>,
    },

    /// Whole seconds.
    TimeDelta,

    /// Split on the date splitter and map pieces by field order; textual
    /// months resolve through the month-names list; missing pieces come
    /// from the current date.
    Date {
        /// Override for the root splitter.
        splitter: Option<Pattern>,
        /// Override for the root field order.
        sequence: Option<Vec<DateField>>,
    },

    /// Epoch seconds (divided by the multiplier) to a calendar date.
    DateStamp {
        /// Input units per second.
        multiplier: i64,
    },

    /// Resolve a lowercased weekday or relative-day name against the
    /// current-date anchor.
    RelativeWeekday,

    /// Render as a string.
    Str,

    /// Coerce to an integer; failures fall back to 0.
    Int,

    /// Coerce to a float; failures fall back to 0.
    Float,

    /// Coerce to a boolean.
    Bool,

    /// Lowercase, fold accented Latin-1 letters to ASCII, replace spaces and
    /// slashes with underscores, and drop a small punctuation set.
    LowerAscii,

    /// Split into a list of strings.
    StrList {
        /// Override for the root string-list splitter.
        splitter: Option<Pattern>,
        /// Drop empty entries.
        omit_empty: bool,
    },

    /// Identity, marking that the caller receives a list even on a single
    /// match.
    List,

    /// Lowercase without trimming.
    Lower,

    /// Uppercase without trimming.
    Upper,

    /// Capitalize without trimming.
    Capitalize,
}

/// One `(key path, value paths)` block: yields one record per key node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterBlock {
    /// Enumerates the key nodes.
    pub key_path: PathDef,

    /// Evaluated per key node; results become variables 1..=n
    /// (the key value is variable 0).
    pub value_paths: Vec<PathDef>,

    /// Field name and link definition per record field, in declaration
    /// order.
    pub fields: Vec<Field>,
}

/// A named record field computed by the link stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// The record key.
    pub name: String,

    /// How the value is computed from the block's variables.
    pub def: LinkDef,
}

/// A link definition: how one record field derives from the variables
/// collected for a key node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDef {
    /// The value production.
    pub kind: LinkKind,

    /// Substituted when the produced value is null, and when a bounds check
    /// fails.
    pub default: Option<Value>,

    /// Keeps the first capture group of the first match.
    pub regex: Option<Pattern>,

    /// Type coercion applied after the regex.
    pub coerce: Option<TypeOp>,

    /// Calc operations applied after the coercion.
    pub calc: Vec<CalcOp>,

    /// Maximum string length accepted.
    pub max_length: Option<usize>,

    /// Minimum string length accepted.
    pub min_length: Option<usize>,
}

impl LinkDef {
    /// A bare production with no post-processing.
    pub fn of(kind: LinkKind) -> Self {
        Self {
            kind,
            default: None,
            regex: None,
            coerce: None,
            calc: Vec::new(),
            max_length: None,
            min_length: None,
        }
    }
}

/// The production side of a link definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkKind {
    /// One of the block's variables by position.
    Var(usize),

    /// A link function applied to recursively computed arguments.
    Fun {
        /// Function id; ids below 100 are built-ins, the rest dispatch to
        /// the host extension.
        id: u32,
        /// Argument definitions.
        args: Vec<LinkDef>,
    },

    /// A fixed value.
    Literal(Value),
}

/// How the URL date functions render a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UrlDateType {
    /// Format the offset date with the URL date format.
    #[default]
    Offset,

    /// Midnight epoch seconds times the URL date multiplier.
    Epoch,

    /// The weekday name from the URL weekday list.
    Weekday,
}

/// One piece of the request URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UrlPiece {
    /// Emitted verbatim.
    Literal(String),

    /// A URL-builder function call.
    Fun {
        /// Function id; ids below 100 are built-ins, the rest dispatch to
        /// the host extension.
        id: u32,
        /// Fixed arguments from the definition.
        args: Vec<Value>,
    },
}

/// Everything the request builder needs, lifted from the definition root.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UrlDef {
    /// URL pieces, concatenated in order.
    pub pieces: Vec<UrlPiece>,

    /// Structured header map (`url-header`).
    pub headers: IndexMap<String, String>,

    /// Bare accept header (`accept-header`); kept separate from the header
    /// map, never conflated.
    pub accept: Option<String>,

    /// Default runtime variables (`url-data`), overridable per request.
    pub data: IndexMap<String, Value>,

    /// How the date functions render.
    pub date_type: UrlDateType,

    /// Format for [`UrlDateType::Offset`].
    pub date_format: Option<String>,

    /// Multiplier for [`UrlDateType::Epoch`].
    pub date_multiplier: i64,

    /// Weekday names for [`UrlDateType::Weekday`], Monday first.
    pub weekdays: Vec<String>,

    /// Relative day names accepted by the date functions, mapped to offsets
    /// from the current-date anchor.
    pub relative_weekdays: IndexMap<String, i64>,

    /// Joins the pieces of a count range.
    pub item_splitter: String,

    /// Joins the two pieces of a date range.
    pub date_splitter: String,

    /// Item count when the caller supplies none.
    pub default_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_serializes_as_source() {
        let pattern = Pattern::new(r"\d+").expect("pattern must compile");
        let json = serde_json::to_string(&pattern).expect("serialize");
        assert_eq!(json, r#""\\d+""#);

        let back: Pattern = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, pattern);
        assert!(back.regex().is_match("42"));
    }

    #[test]
    fn pattern_rejects_bad_source_on_deserialize() {
        let result: Result<Pattern, _> = serde_json::from_str(r#""(""#);
        assert!(result.is_err());
    }

    #[test]
    fn path_tail_value() {
        let mut path = PathDef::default();
        assert!(path.tail_value().is_none());

        path.steps.push(NodeStep::Select(Selector::default()));
        path.steps.push(NodeStep::Value(Box::new(ValueDef::of(Source::Text))));
        assert!(path.tail_value().is_some());
    }

    #[test]
    fn compiled_path_round_trips_through_serde() {
        let mut selector = Selector {
            tag: Some(ValueRef::literal("li")),
            ..Selector::default()
        };
        selector.attrs.push(
            [("class".to_owned(), EntryTest::AnyOf(vec![ValueRef::literal("a")]))]
                .into_iter()
                .collect(),
        );
        let path = PathDef {
            steps: vec![
                NodeStep::Select(selector),
                NodeStep::Value(Box::new(ValueDef::of(Source::Text))),
            ],
        };

        let json = serde_json::to_string(&path).expect("serialize");
        let back: PathDef = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, path);
    }
}

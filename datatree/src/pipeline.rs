//! The value pipeline: from a matched node to a clean, typed value.
//!
//! Stages run in a fixed order, each conditional on the compiled capture:
//! source select, inclusive-text assembly, the calc pipeline, empty-value
//! collapse, default substitution, string cleanup, type coercion, and the
//! membership filter. Stages that fail keep the prior value and report a
//! warning; nothing here aborts a walk.

use chrono::{Datelike, Duration, FixedOffset, NaiveDate};
use indexmap::IndexMap;

use crate::def::model::{CalcOp, CaseMode, Source, SplitTake, TextScan, ValueDef};
use crate::def::TreeConfig;
use crate::matcher::{LinkEnv, Walker};
use crate::tree::NodeId;
use crate::value::Value;
use crate::warn::{Category, Severity};

pub(crate) mod coerce;

/// The current-date anchor: the date every relative lookup resolves
/// against, plus the definition timezone and the resolved relative-day
/// table.
///
/// The table is recomputed on every date change: named offsets from the
/// definition add to the anchor, and weekday names pin to their next
/// occurrence at or after the anchor's weekday.
#[derive(Debug, Clone)]
pub struct Anchor {
    current: NaiveDate,
    offset: FixedOffset,
    relative: IndexMap<String, NaiveDate>,
}

impl Anchor {
    /// Build the anchor for a definition at the given date.
    pub fn new(config: &TreeConfig, today: NaiveDate) -> Self {
        let offset =
            FixedOffset::east_opt(config.tz_offset_secs).unwrap_or_else(|| {
                FixedOffset::east_opt(0).expect("zero offset is always valid")
            });
        let mut anchor = Self {
            current: today,
            offset,
            relative: IndexMap::new(),
        };
        anchor.set_date(config, today);
        anchor
    }

    /// Move the anchor and recompute the relative-day table.
    pub fn set_date(&mut self, config: &TreeConfig, date: NaiveDate) {
        self.current = date;
        self.relative.clear();

        for (name, days) in &config.relative_weekdays {
            self.relative
                .insert(name.clone(), date + Duration::days(*days));
        }

        let today = date.weekday().num_days_from_monday() as i64;
        for (position, name) in config.weekdays.iter().enumerate() {
            let position = position as i64;
            let ahead = if position < today {
                position + 7 - today
            } else {
                position - today
            };
            self.relative
                .insert(name.clone(), date + Duration::days(ahead));
        }
    }

    /// The anchor date.
    pub fn current(&self) -> NaiveDate {
        self.current
    }

    /// The definition timezone.
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Resolve a lowercased relative-day or weekday name.
    pub fn relative(&self, name: &str) -> Option<NaiveDate> {
        self.relative.get(name).copied()
    }
}

impl Walker<'_> {
    /// Compute a captured value from a node, running the full pipeline.
    pub fn value(&self, node: NodeId, def: &ValueDef, env: &LinkEnv) -> Value {
        let mut value = self.source_value(node, def, env);
        value = self.apply_calc(value, &def.calc);

        if !self.config.empty_values.is_empty() && self.config.empty_values.contains(&value) {
            value = Value::Null;
        }
        if value.is_null() {
            if let Some(default) = &def.default {
                value = default.clone();
            }
        }
        value = clean_string(value);

        if let Some(op) = &def.coerce {
            value = self.coerce(value, op);
        }

        if let Some(filter) = &def.member_of {
            if let Some(allowed) = self.config.value_filters.get(filter) {
                if !allowed.contains(&value) {
                    value = Value::Filtered;
                }
            }
        }
        value
    }

    fn source_value(&self, node: NodeId, def: &ValueDef, env: &LinkEnv) -> Value {
        let data = self.tree.node(node);
        match &def.source {
            Source::Text => Value::String(data.text().to_owned()),
            Source::Tail => Value::String(data.tail().to_owned()),
            Source::Tag => match data.tag() {
                Some(tag) => Value::String(tag.to_owned()),
                None => Value::Null,
            },
            Source::Attr(name) => {
                let Some(resolved) = self.resolve(name, env) else {
                    return Value::Null;
                };
                match data.attr(&resolved.render()) {
                    Some(value) => Value::String(value.to_owned()),
                    None => Value::Null,
                }
            }
            Source::InclusiveText(scan) => Value::String(self.inclusive_text(node, scan)),
            Source::Key => match data.key() {
                Some(key) => key.to_value(),
                None => Value::Null,
            },
            Source::Scalar => data.scalar(),
            Source::Index => Value::Int(data.index() as i64),
            Source::Literal(value) => value.clone(),
            Source::Presence => Value::Bool(true),
        }
    }

    /// Concatenate text and tails across descendants, bounded by depth and
    /// the include/exclude tag lists. An excluded child contributes nothing
    /// from its subtree, but its tail still belongs to this node's content.
    /// Whitespace normalizes to single spaces between fragments.
    fn inclusive_text(&self, node: NodeId, scan: &TextScan) -> String {
        fn allowed(tag: Option<&str>, scan: &TextScan) -> bool {
            let Some(tag) = tag else { return false };
            if scan.exclude.iter().any(|t| t == tag) {
                return false;
            }
            scan.include.is_empty() || scan.include.iter().any(|t| t == tag)
        }

        fn collect(walker: &Walker<'_>, node: NodeId, depth: usize, scan: &TextScan, parts: &mut Vec<String>) {
            parts.push(walker.tree.node(node).text().to_owned());
            if depth == 0 {
                return;
            }
            for child in walker.tree.children(node) {
                if allowed(walker.tree.node(*child).tag(), scan) {
                    collect(walker, *child, depth - 1, scan, parts);
                }
                parts.push(walker.tree.node(*child).tail().to_owned());
            }
        }

        let mut parts = Vec::new();
        collect(self, node, scan.depth, scan, &mut parts);
        parts
            .iter()
            .flat_map(|part| part.split_whitespace())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Apply calc operations in their encoded order. String operations pass
    /// non-strings through untouched; numeric operations that fail keep the
    /// prior value with a warning.
    pub(crate) fn apply_calc(&self, mut value: Value, ops: &[CalcOp]) -> Value {
        for op in ops {
            value = self.apply_one(value, op);
        }
        value
    }

    fn apply_one(&self, value: Value, op: &CalcOp) -> Value {
        match op {
            CalcOp::Case(mode) => match value {
                Value::String(s) => {
                    let trimmed = s.trim();
                    Value::String(match mode {
                        CaseMode::Lower => trimmed.to_lowercase(),
                        CaseMode::Upper => trimmed.to_uppercase(),
                        CaseMode::Capitalize => capitalize(trimmed),
                    })
                }
                other => other,
            },

            CalcOp::AsciiFold { replacement, pre } => match value {
                Value::String(s) => {
                    let mut folded = s.to_lowercase();
                    if let Some((pattern, with)) = pre {
                        folded = pattern.regex().replace_all(&folded, with.as_str()).into_owned();
                    }
                    Value::String(
                        folded
                            .chars()
                            .map(|c| {
                                if c.is_ascii() {
                                    c.to_string()
                                } else {
                                    replacement.clone()
                                }
                            })
                            .collect(),
                    )
                }
                other => other,
            },

            CalcOp::LStrip(prefix) => match value {
                Value::String(s) => {
                    let trimmed = s.trim();
                    match strip_affix(trimmed, prefix, true) {
                        Some(stripped) => Value::String(stripped.trim().to_owned()),
                        None => Value::String(trimmed.to_owned()),
                    }
                }
                other => other,
            },

            CalcOp::RStrip(suffix) => match value {
                Value::String(s) => {
                    let trimmed = s.trim();
                    match strip_affix(trimmed, suffix, false) {
                        Some(stripped) => Value::String(stripped.trim().to_owned()),
                        None => Value::String(trimmed.to_owned()),
                    }
                }
                other => other,
            },

            CalcOp::Sub(pairs) => match value {
                Value::String(mut s) => {
                    for (pattern, replacement) in pairs {
                        s = pattern
                            .regex()
                            .replace_all(&s, replacement.as_str())
                            .trim()
                            .to_owned();
                    }
                    Value::String(s)
                }
                other => other,
            },

            CalcOp::Split(rules) => {
                let mut value = value;
                for rule in rules {
                    let Value::String(current) = &value else { break };
                    let whitespace_sep =
                        matches!(rule.sep.as_str(), r"\s" | r"\t" | r"\n" | r"\r" | r"\f" | r"\v" | " ");
                    let subject = if whitespace_sep {
                        current.trim().to_owned()
                    } else {
                        current.clone()
                    };
                    let fill = if whitespace_sep {
                        " ".to_owned()
                    } else {
                        rule.sep.as_str().to_owned()
                    };
                    let pieces: Vec<&str> = rule.sep.regex().split(&subject).collect();
                    match &rule.take {
                        SplitTake::All => {
                            value = Value::List(
                                pieces.iter().map(|p| Value::from(*p)).collect(),
                            );
                        }
                        SplitTake::Indexes(indexes) => {
                            let Some(first) = indexes.first() else { continue };
                            let Some(primary) = pick(&pieces, *first) else {
                                self.warner.warn(
                                    Category::Calc,
                                    Severity::InvalidData,
                                    format!("split index {first} out of range for '{subject}'"),
                                );
                                continue;
                            };
                            let mut assembled = primary.to_owned();
                            for position in &indexes[1..] {
                                if let Some(piece) = pick(&pieces, *position) {
                                    assembled.push_str(&fill);
                                    assembled.push_str(piece);
                                }
                            }
                            value = Value::String(assembled);
                        }
                    }
                }
                value
            }

            CalcOp::Multiply(by) => match value.to_int() {
                Some(n) => Value::Int(n * by),
                None => {
                    self.warner.warn(
                        Category::Calc,
                        Severity::InvalidData,
                        format!("cannot multiply non-numeric value '{value}'"),
                    );
                    value
                }
            },

            CalcOp::Divide(by) => match value.to_int() {
                Some(n) => Value::Int(n / by),
                None => {
                    self.warner.warn(
                        Category::Calc,
                        Severity::InvalidData,
                        format!("cannot divide non-numeric value '{value}'"),
                    );
                    value
                }
            },

            CalcOp::Replace(lookup) => match &value {
                Value::String(s) => match lookup.get(&s.trim().to_lowercase()) {
                    Some(mapped) => mapped.clone(),
                    None => Value::Null,
                },
                _ => value,
            },
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Remove a case-insensitive affix. Returns `None` when the affix is not
/// present.
fn strip_affix<'a>(s: &'a str, affix: &str, from_start: bool) -> Option<&'a str> {
    if affix.is_empty() || s.len() < affix.len() {
        return None;
    }
    if from_start {
        let boundary = s.is_char_boundary(affix.len());
        if boundary && s[..affix.len()].eq_ignore_ascii_case(affix) {
            return Some(&s[affix.len()..]);
        }
        s.strip_prefix(affix)
    } else {
        let split = s.len() - affix.len();
        let boundary = s.is_char_boundary(split);
        if boundary && s[split..].eq_ignore_ascii_case(affix) {
            return Some(&s[..split]);
        }
        s.strip_suffix(affix)
    }
}

fn pick<'a>(pieces: &[&'a str], position: i64) -> Option<&'a str> {
    let len = pieces.len() as i64;
    let resolved = if position < 0 { len + position } else { position };
    if (0..len).contains(&resolved) {
        Some(pieces[resolved as usize])
    } else {
        None
    }
}

/// Strings leaving the pipeline are entity-decoded once and freed of
/// embedded carriage returns and newlines.
fn clean_string(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let decoded = html_escape::decode_html_entities(&s);
            let cleaned: String = decoded
                .chars()
                .filter(|c| *c != '\r' && *c != '\n')
                .collect();
            Value::String(cleaned.trim().to_owned())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("test date must be valid")
    }

    #[test]
    fn relative_weekdays_pin_forward() {
        let mut config = TreeConfig::default();
        config.weekdays = ["monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        config.relative_weekdays = [("today".to_owned(), 0), ("tomorrow".to_owned(), 1)]
            .into_iter()
            .collect();

        // 2016-05-25 is a Wednesday.
        let anchor = Anchor::new(&config, date(2016, 5, 25));
        assert_eq!(anchor.relative("today"), Some(date(2016, 5, 25)));
        assert_eq!(anchor.relative("tomorrow"), Some(date(2016, 5, 26)));
        assert_eq!(anchor.relative("wednesday"), Some(date(2016, 5, 25)));
        assert_eq!(anchor.relative("friday"), Some(date(2016, 5, 27)));
        // Monday already passed this week, so it pins to next week.
        assert_eq!(anchor.relative("monday"), Some(date(2016, 5, 30)));
    }

    #[test]
    fn capitalize_matches_python_semantics() {
        assert_eq!(capitalize("hello WORLD"), "Hello world");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn strip_affix_is_case_insensitive_and_exact() {
        assert_eq!(strip_affix("12,5 kg", "KG", false), Some("12,5 "));
        assert_eq!(strip_affix("kilogram", "kg", false), None);
        assert_eq!(strip_affix("Re: subject", "re:", true), Some(" subject"));
    }

    #[test]
    fn clean_string_decodes_and_strips() {
        let cleaned = clean_string(Value::from(" a &amp; b\r\n "));
        assert_eq!(cleaned, Value::from("a & b"));
        assert_eq!(clean_string(Value::Int(3)), Value::Int(3));
    }

    #[test]
    fn pick_supports_negative_positions() {
        let pieces = ["a", "b", "c"];
        assert_eq!(pick(&pieces, 0), Some("a"));
        assert_eq!(pick(&pieces, -1), Some("c"));
        assert_eq!(pick(&pieces, 3), None);
        assert_eq!(pick(&pieces, -4), None);
    }
}

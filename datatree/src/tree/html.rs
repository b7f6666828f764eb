//! Builds a [`Tree`] from an HTML payload.
//!
//! The builder is deliberately forgiving: real-world listing pages arrive
//! truncated, with unclosed tags, or with markup embedded in script strings.
//! It works in two passes. A pre-scan counts start and close occurrences per
//! tag name and promotes tags that are opened but never closed into the
//! *auto-close set*; the feed pass then treats those tags as self-closing.
//! Close tags that do not match the open element recursively close the open
//! element first, and a fixed recovery step appends closers for `body`,
//! `html` and `xml` so a truncated fetch still parses.

use std::collections::{HashMap, HashSet};

use flagset::FlagSet;
use once_cell::sync::Lazy;
use regex::Regex;
use tap::Pipe;
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::def::model::Pattern;
use crate::status::Soft;
use crate::tree::{BuildError, NodeData, NodeId, Tree, TreeKind};

/// Caller-tunable knobs for the HTML builder, all resolved from the data
/// definition root.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct Options {
    /// Tags to seed the auto-close set with; the pre-scan only extends it.
    #[builder(default)]
    pub autoclose: Vec<String>,

    /// Regex substitutions applied to the raw payload before parsing.
    #[builder(default)]
    pub text_replace: Vec<(Pattern, String)>,

    /// Patterns whose first capture group is rewritten with `"`, `<` and `>`
    /// escaped, so markup embedded in attribute strings does not derail the
    /// tokenizer.
    #[builder(default)]
    pub unquote: Vec<Pattern>,

    /// Wrap the payload in `<html>…</html>` before parsing.
    #[builder(default)]
    pub enclose_html: bool,
}

/// Parse an HTML payload into a tree.
///
/// Recoverable preprocessing problems are reported in the returned flag set;
/// only an empty payload is fatal.
#[tracing::instrument(skip_all, fields(len = input.len()))]
pub fn build(input: &str, options: &Options) -> Result<(Tree, FlagSet<Soft>), BuildError> {
    if input.trim().is_empty() {
        return Err(BuildError::Empty);
    }

    let mut flags = FlagSet::default();
    let mut html = input.to_owned();

    for (pattern, replacement) in &options.text_replace {
        html = pattern
            .regex()
            .replace_all(&html, replacement.as_str())
            .into_owned();
    }

    for pattern in &options.unquote {
        if pattern.regex().captures_len() < 2 {
            flags |= Soft::UnquoteFailed;
            continue;
        }
        html = pattern
            .regex()
            .replace_all(&html, |caps: &regex::Captures<'_>| {
                let whole = &caps[0];
                match caps.get(1) {
                    Some(group) => {
                        // Group offsets are relative to the haystack; rebase
                        // onto the whole match.
                        let base = caps.get(0).map(|m| m.start()).unwrap_or(0);
                        let start = group.start() - base;
                        let end = group.end() - base;
                        let escaped = group
                            .as_str()
                            .replace('"', "&quot;")
                            .replace('<', "&lt;")
                            .replace('>', "&gt;");
                        format!("{}{}{}", &whole[..start], escaped, &whole[end..])
                    }
                    None => whole.to_owned(),
                }
            })
            .into_owned();
    }

    if options.enclose_html {
        html = format!("<html>{html}</html>");
    }

    append_recovery_closers(&mut html);

    let mut autoclose: HashSet<String> = options
        .autoclose
        .iter()
        .map(|tag| tag.to_lowercase())
        .collect();
    prescan(&html, &mut autoclose);
    debug!(autoclose = ?autoclose, "pre-scan complete");

    let mut feeder = Feeder::new(&autoclose);
    feeder.feed(&html);
    (feeder.finish(), flags).pipe(Ok)
}

/// Tags appended when opened but never closed, tolerating truncated fetches.
const RECOVERY_TAGS: [&str; 3] = ["body", "html", "xml"];

fn append_recovery_closers(html: &mut String) {
    for tag in RECOVERY_TAGS {
        let lower = html.to_lowercase();
        let opened = lower.contains(&format!("<{tag}"));
        let closed = lower.contains(&format!("</{tag}"));
        if opened && !closed {
            html.push_str(&format!("</{tag}>"));
        }
    }
}

static TAG_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<(.*?)>").expect("tag token expression must compile"));

/// Count start/close/self-closing occurrences per tag name and extend the
/// auto-close set with tags that are opened but never closed. Running the
/// scan twice yields the same set.
fn prescan(html: &str, autoclose: &mut HashSet<String>) {
    #[derive(Default)]
    struct Counts {
        start: usize,
        close: usize,
        auto: usize,
    }

    let mut counts: HashMap<String, Counts> = HashMap::new();
    for capture in TAG_TOKENS.captures_iter(html) {
        let mut token = &capture[1];
        // Markup escaped inside script strings, e.g. `<\/div>`.
        token = token.strip_prefix('\\').unwrap_or(token);
        if token.is_empty()
            || token.starts_with('!')
            || token.starts_with('?')
        {
            continue;
        }

        if let Some(rest) = token.strip_prefix('/') {
            let name = first_token(rest);
            if !name.is_empty() {
                counts.entry(name).or_default().close += 1;
            }
        } else if token.trim_end().ends_with('/') {
            let name = first_token(token.trim_end().trim_end_matches('/'));
            if !name.is_empty() {
                counts.entry(name).or_default().auto += 1;
            }
        } else {
            let name = first_token(token);
            if !name.is_empty() {
                counts.entry(name).or_default().start += 1;
            }
        }
    }

    for (tag, count) in counts {
        if count.close == 0 && (count.start > 0 || count.auto > 0) {
            autoclose.insert(tag);
        }
    }
}

fn first_token(tag: &str) -> String {
    tag.split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase()
}

struct Feeder<'a> {
    tree: Tree,
    current: NodeId,
    last: Option<NodeId>,
    is_tail: bool,
    text: String,
    open: HashMap<String, usize>,
    autoclose: &'a HashSet<String>,
}

impl<'a> Feeder<'a> {
    fn new(autoclose: &'a HashSet<String>) -> Self {
        let tree = Tree::new(
            TreeKind::Html,
            NodeData::Element {
                tag: "root".to_owned(),
                attrs: indexmap::IndexMap::new(),
                text: String::new(),
                tail: String::new(),
            },
        );
        let root = tree.root();
        Self {
            tree,
            current: root,
            last: None,
            is_tail: false,
            text: String::new(),
            open: HashMap::new(),
            autoclose,
        }
    }

    fn feed(&mut self, html: &str) {
        let mut rest = html;
        while let Some(lt) = rest.find('<') {
            self.text.push_str(&rest[..lt]);
            rest = &rest[lt..];

            if rest.starts_with("<!--") {
                rest = match rest.find("-->") {
                    Some(end) => &rest[end + 3..],
                    None => "",
                };
                continue;
            }
            if rest.starts_with("<!") || rest.starts_with("<?") {
                rest = match rest.find('>') {
                    Some(end) => &rest[end + 1..],
                    None => "",
                };
                continue;
            }

            // A bare '<' that does not begin markup is character data.
            let markup = rest[1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '/');
            if !markup {
                self.text.push('<');
                rest = &rest[1..];
                continue;
            }

            let Some(end) = tag_end(rest) else {
                // Unterminated markup at the end of a truncated payload.
                self.text.push_str(rest);
                rest = "";
                continue;
            };
            let inner = &rest[1..end];
            rest = &rest[end + 1..];

            if let Some(name) = inner.strip_prefix('/') {
                let name = first_token(name);
                if !name.is_empty() {
                    self.end_tag(&name);
                }
            } else {
                let self_closing = inner.trim_end().ends_with('/');
                let body = inner.trim_end().trim_end_matches('/');
                let raw_name = body.split_whitespace().next().unwrap_or("");
                if raw_name.is_empty() {
                    continue;
                }
                let name = raw_name.to_lowercase();
                let attrs = parse_attrs(&body[raw_name.len()..]);
                self.start_tag(&name, attrs, self_closing);
            }
        }
        self.text.push_str(rest);
        self.flush_text();
    }

    fn start_tag(&mut self, name: &str, attrs: Vec<(String, String)>, self_closing: bool) {
        *self.open.entry(name.to_owned()).or_insert(0) += 1;

        let mut ordered = indexmap::IndexMap::new();
        let plain: indexmap::IndexMap<String, String> = attrs.into_iter().collect();
        for special in ["class", "id"] {
            if let Some(value) = plain.get(special) {
                ordered.insert(special.to_owned(), value.clone());
            }
        }
        for (key, value) in plain {
            ordered.entry(key).or_insert(value);
        }

        let node = self.tree.push(
            self.current,
            NodeData::Element {
                tag: name.to_owned(),
                attrs: ordered,
                text: String::new(),
                tail: String::new(),
            },
        );
        self.flush_text();
        self.current = node;
        self.is_tail = false;

        if self_closing || self.autoclose.contains(name) {
            self.end_tag(name);
        }
    }

    fn end_tag(&mut self, name: &str) {
        match self.open.get(name) {
            Some(count) if *count > 0 => {}
            _ => return,
        }

        // Close open elements until the named one is current, tolerating
        // missing close tags for everything in between.
        while self.current != self.tree.root()
            && self.tree.node(self.current).tag() != Some(name)
        {
            if let Some(tag) = self.tree.node(self.current).tag().map(str::to_owned) {
                if let Some(count) = self.open.get_mut(&tag) {
                    *count = count.saturating_sub(1);
                }
            }
            self.close_current();
        }
        if self.current == self.tree.root() {
            return;
        }

        if let Some(count) = self.open.get_mut(name) {
            *count = count.saturating_sub(1);
        }
        self.close_current();
    }

    fn close_current(&mut self) {
        self.flush_text();
        self.last = Some(self.current);
        self.is_tail = true;
        self.current = self
            .tree
            .node(self.current)
            .parent()
            .unwrap_or_else(|| self.tree.root());
    }

    fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let decoded = html_escape::decode_html_entities(&self.text);
        let cleaned: String = decoded.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let cleaned = cleaned.trim();
        if !cleaned.is_empty() {
            let target = if self.is_tail { self.last } else { Some(self.current) };
            if let Some(id) = target {
                if let NodeData::Element { text, tail, .. } = &mut self.tree.node_mut(id).data {
                    if self.is_tail {
                        tail.push_str(cleaned);
                    } else {
                        text.push_str(cleaned);
                    }
                }
            }
        }
        self.text.clear();
    }

    fn finish(self) -> Tree {
        self.tree
    }
}

/// Find the byte offset of the `>` closing the tag that starts at offset 0,
/// skipping over quoted attribute values.
fn tag_end(markup: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, c) in markup.char_indices().skip(1) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '>' => return Some(offset),
                _ => {}
            },
        }
    }
    None
}

fn parse_attrs(mut rest: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '=' || c == '/')
            .unwrap_or(rest.len());
        if name_len == 0 {
            rest = &rest[1..];
            continue;
        }
        let name = rest[..name_len].to_lowercase();
        rest = rest[name_len..].trim_start();

        let value = if let Some(after) = rest.strip_prefix('=') {
            let after = after.trim_start();
            if let Some(stripped) = after.strip_prefix(['"', '\'']) {
                let quote = after.chars().next().unwrap_or('"');
                match stripped.find(quote) {
                    Some(end) => {
                        rest = &stripped[end + 1..];
                        stripped[..end].to_owned()
                    }
                    None => {
                        rest = "";
                        stripped.to_owned()
                    }
                }
            } else {
                let end = after
                    .find(|c: char| c.is_whitespace() || c == '/')
                    .unwrap_or(after.len());
                rest = &after[end..];
                after[..end].to_owned()
            }
        } else {
            String::new()
        };

        let value = html_escape::decode_html_entities(&value).into_owned();
        attrs.push((name, value));
    }
    attrs
}

#[cfg(test)]
mod tests {
    //! Tests for tokenizer internals; whole-payload behavior is covered by
    //! the integration suite.

    use super::*;

    #[test]
    fn prescan_promotes_unclosed_tags() {
        let mut set = HashSet::new();
        prescan("<ul><li>a<li>b</ul><br/>", &mut set);
        assert!(set.contains("li"));
        assert!(set.contains("br"));
        assert!(!set.contains("ul"));
    }

    #[test]
    fn prescan_is_idempotent() {
        let html = "<div><img src='x'><p>text</div>";
        let mut once = HashSet::new();
        prescan(html, &mut once);
        let mut twice = once.clone();
        prescan(html, &mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn prescan_skips_comments_and_decls() {
        let mut set = HashSet::new();
        prescan("<!-- <fake> --><!DOCTYPE html><?pi x?><a href='y'>z</a>", &mut set);
        assert!(!set.contains("fake"));
        assert!(!set.contains("doctype"));
        assert!(!set.contains("a"));
    }

    #[test]
    fn tag_end_skips_quoted_gt() {
        assert_eq!(tag_end("<a title=\"x > y\">"), Some(16));
        assert_eq!(tag_end("<br>"), Some(3));
        assert_eq!(tag_end("<br"), None);
    }

    #[test]
    fn attrs_parse_in_declared_order() {
        let attrs = parse_attrs(" href='x' Class=\"big\" disabled data-n=3");
        assert_eq!(
            attrs,
            vec![
                ("href".to_owned(), "x".to_owned()),
                ("class".to_owned(), "big".to_owned()),
                ("disabled".to_owned(), String::new()),
                ("data-n".to_owned(), "3".to_owned()),
            ]
        );
    }

    #[test]
    fn recovery_appends_missing_body_closer() {
        let mut html = "<html><body><p>cut off".to_owned();
        append_recovery_closers(&mut html);
        assert!(html.ends_with("</body></html>") || html.ends_with("</html></body>"));
    }
}

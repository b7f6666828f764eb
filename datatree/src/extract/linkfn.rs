//! The closed set of built-in link functions, plus extension dispatch.
//!
//! Function ids 0 through 12 cover the value-combining operations a record
//! needs; ids from 100 on are handed to the host [`Extension`], whose
//! result may remap onto a built-in id and re-enter the pipeline.

use itertools::Itertools;

use crate::def::compile::{EXTENSION_FUN_BASE, MAX_BUILTIN_FUN};
use crate::matcher::Walker;
use crate::pipeline::coerce::{combine_local, next_day};
use crate::value::Value;
use crate::warn::{Category, Severity};

use super::{Extension, ExtensionResult, Extractor};

impl Extractor<'_> {
    pub(super) fn call_function(&self, walker: &Walker<'_>, id: u32, args: Vec<Value>) -> Value {
        if id >= EXTENSION_FUN_BASE {
            return self.call_extension(walker, id, args);
        }
        if id > MAX_BUILTIN_FUN {
            self.warner.warn(
                Category::Link,
                Severity::InvalidDef,
                format!("unknown link function {id}"),
            );
            return Value::Null;
        }
        self.builtin(walker, id, args)
    }

    fn call_extension(&self, walker: &Walker<'_>, id: u32, args: Vec<Value>) -> Value {
        let Some(extension) = self.extension else {
            self.warner.warn(
                Category::Link,
                Severity::InvalidDef,
                format!("link function {id} needs a host extension, none installed"),
            );
            return Value::Null;
        };
        match extension.link_function(id, &args) {
            ExtensionResult::Value(value) => value,
            ExtensionResult::Remap { id, args } if id <= MAX_BUILTIN_FUN => {
                self.builtin(walker, id, args)
            }
            ExtensionResult::Remap { id, .. } => {
                self.warner.warn(
                    Category::Link,
                    Severity::InvalidDef,
                    format!("extension remapped onto {id}, which is not a built-in"),
                );
                Value::Null
            }
            ExtensionResult::Unhandled => {
                self.warner.warn(
                    Category::Link,
                    Severity::InvalidDef,
                    format!("extension does not handle link function {id}"),
                );
                Value::Null
            }
        }
    }

    fn builtin(&self, walker: &Walker<'_>, id: u32, args: Vec<Value>) -> Value {
        match id {
            // Identity: the first argument unchanged.
            0 => args.into_iter().next().unwrap_or(Value::Null),

            1 => strip_affixes(&args),
            2 => Value::String(args.iter().map(Value::render).collect::<String>()),
            3 => split_project(&args),
            4 => self.combine_date_time(walker, &args),
            5 => substring_branch(&args),
            6 => equality_branch(&args),
            7 => bool_branch(&args),
            8 => longest_string(&args),
            9 => first_non_empty(args),
            10 => parallel_lookup(&args),
            11 => map_list_lookup(&args),
            12 => remove_substring(&args),

            other => {
                self.warner.warn(
                    Category::Link,
                    Severity::InvalidDef,
                    format!("unknown link function {other}"),
                );
                Value::Null
            }
        }
    }

    /// Function 4: combine a date and a time in the definition timezone.
    /// With a third time argument as reference, a time earlier than the
    /// reference is taken to have rolled past midnight and lands on the
    /// next day.
    fn combine_date_time(&self, walker: &Walker<'_>, args: &[Value]) -> Value {
        let (Some(Value::Date(date)), Some(Value::Time(time))) = (args.first(), args.get(1))
        else {
            self.warner.warn(
                Category::Link,
                Severity::InvalidData,
                "date-time combine needs a date and a time",
            );
            return Value::Null;
        };

        let mut date = *date;
        if let Some(Value::Time(reference)) = args.get(2) {
            if time < reference {
                date = next_day(date);
            }
        }

        match combine_local(date, *time, walker.anchor.offset()) {
            Some(instant) => Value::DateTime(instant),
            None => {
                self.warner.warn(
                    Category::Link,
                    Severity::InvalidData,
                    "date-time combine landed on a nonexistent local time",
                );
                Value::Null
            }
        }
    }
}

/// Function 1: strip a prefix (second argument) and a suffix (third
/// argument) from the first argument, case-insensitively.
fn strip_affixes(args: &[Value]) -> Value {
    let Some(text) = args.first().and_then(Value::as_str) else {
        return args.first().cloned().unwrap_or(Value::Null);
    };
    let mut text = text.trim().to_owned();
    if let Some(prefix) = args.get(1).and_then(Value::as_str) {
        if !prefix.is_empty()
            && text.len() >= prefix.len()
            && text.is_char_boundary(prefix.len())
            && text[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            text = text[prefix.len()..].trim().to_owned();
        }
    }
    if let Some(suffix) = args.get(2).and_then(Value::as_str) {
        let split = text.len().saturating_sub(suffix.len());
        if !suffix.is_empty()
            && text.len() >= suffix.len()
            && text.is_char_boundary(split)
            && text[split..].eq_ignore_ascii_case(suffix)
        {
            text = text[..split].trim().to_owned();
        }
    }
    Value::String(text)
}

/// Function 3: split the first argument on the second and project the
/// components named by the remaining integer arguments (negative counts
/// from the end). One component comes back bare, several as a list, none
/// as the full component list.
fn split_project(args: &[Value]) -> Value {
    let (Some(text), Some(separator)) = (
        args.first().and_then(Value::as_str),
        args.get(1).and_then(Value::as_str),
    ) else {
        return args.first().cloned().unwrap_or(Value::Null);
    };
    let pieces: Vec<&str> = if separator.is_empty() {
        vec![text]
    } else {
        text.split(separator).collect()
    };

    let wanted: Vec<i64> = args[2..].iter().filter_map(Value::to_int).collect();
    if wanted.is_empty() {
        return Value::List(pieces.into_iter().map(Value::from).collect());
    }

    let len = pieces.len() as i64;
    let picked: Vec<Value> = wanted
        .iter()
        .filter_map(|position| {
            let resolved = if *position < 0 { len + position } else { *position };
            (0..len).contains(&resolved).then(|| Value::from(pieces[resolved as usize]))
        })
        .collect();
    match picked.len() {
        0 => Value::Null,
        1 => picked.into_iter().next().expect("length checked"),
        _ => Value::List(picked),
    }
}

/// Function 5: when the second argument occurs inside the first, the third
/// argument; otherwise the fourth.
fn substring_branch(args: &[Value]) -> Value {
    let found = match (args.first().and_then(Value::as_str), args.get(1).and_then(Value::as_str)) {
        (Some(haystack), Some(needle)) => haystack.contains(needle),
        _ => false,
    };
    branch(found, args.get(2), args.get(3))
}

/// Function 6: when the first two arguments are equal, the third argument;
/// otherwise the fourth.
fn equality_branch(args: &[Value]) -> Value {
    let equal = match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    branch(equal, args.get(2), args.get(3))
}

/// Function 7: the second argument when the first is true, the third
/// otherwise.
fn bool_branch(args: &[Value]) -> Value {
    let condition = args.first().map(Value::truthy).unwrap_or(false);
    branch(condition, args.get(1), args.get(2))
}

fn branch(condition: bool, if_true: Option<&Value>, if_false: Option<&Value>) -> Value {
    let chosen = if condition { if_true } else { if_false };
    chosen.cloned().unwrap_or(Value::Null)
}

/// Function 8: the longest non-empty string argument; earlier arguments win
/// ties.
fn longest_string(args: &[Value]) -> Value {
    args.iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .fold(None::<&str>, |best, candidate| match best {
            Some(best) if candidate.chars().count() <= best.chars().count() => Some(best),
            _ => Some(candidate),
        })
        .map(Value::from)
        .unwrap_or(Value::Null)
}

/// Function 9: the first argument that is neither null nor an empty string.
fn first_non_empty(args: Vec<Value>) -> Value {
    args.into_iter()
        .find(|value| match value {
            Value::Null | Value::Filtered => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
        .unwrap_or(Value::Null)
}

/// Function 10: find the first argument in the key list (second argument)
/// and return the value at the same position in the value list (third
/// argument); otherwise the fourth argument.
fn parallel_lookup(args: &[Value]) -> Value {
    let fallback = || args.get(3).cloned().unwrap_or(Value::Null);
    let (Some(needle), Some(Value::List(keys)), Some(Value::List(values))) =
        (args.first(), args.get(1), args.get(2))
    else {
        return fallback();
    };
    match keys.iter().find_position(|key| *key == needle) {
        Some((position, _)) => values.get(position).cloned().unwrap_or_else(fallback),
        None => fallback(),
    }
}

/// Function 11: scan a list of single-entry maps (second argument) for one
/// holding the key named by the first argument; otherwise the third
/// argument.
fn map_list_lookup(args: &[Value]) -> Value {
    let fallback = || args.get(2).cloned().unwrap_or(Value::Null);
    let (Some(needle), Some(Value::List(maps))) = (
        args.first().and_then(Value::as_str),
        args.get(1),
    ) else {
        return fallback();
    };
    for entry in maps {
        if let Value::Map(map) = entry {
            if let Some(found) = map.get(needle) {
                return found.clone();
            }
        }
    }
    fallback()
}

/// Function 12: remove every occurrence of the second argument from the
/// first.
fn remove_substring(args: &[Value]) -> Value {
    match (args.first().and_then(Value::as_str), args.get(1).and_then(Value::as_str)) {
        (Some(text), Some(unwanted)) if !unwanted.is_empty() => {
            Value::String(text.replace(unwanted, "").trim().to_owned())
        }
        _ => args.first().cloned().unwrap_or(Value::Null),
    }
}

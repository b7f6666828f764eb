//! Synthesizes an outgoing request from the definition's URL directives.
//!
//! The engine never performs the HTTP transaction; it only assembles the
//! URL string and the header set from the compiled pieces and the runtime
//! parameters the caller supplies.

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Duration, TimeZone};
use getset::Getters;
use indexmap::IndexMap;

use crate::def::compile::EXTENSION_FUN_BASE;
use crate::def::model::{UrlDateType, UrlDef, UrlPiece};
use crate::extract::Extension;
use crate::pipeline::Anchor;
use crate::value::Value;
use crate::warn::{Category, Severity, Warner};

/// A fully assembled outgoing request.
///
/// The bare accept header and the structured header map are kept separate;
/// callers relying on either form lose nothing.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct Request {
    /// The assembled URL.
    #[getset(get = "pub")]
    url: String,

    /// The bare `accept-header` value, when the definition carries one.
    #[getset(get = "pub")]
    accept: Option<String>,

    /// The structured `url-header` map.
    #[getset(get = "pub")]
    headers: IndexMap<String, String>,
}

/// Assemble a request from compiled URL directives and runtime parameters.
pub(crate) fn build(
    def: &UrlDef,
    anchor: &Anchor,
    params: &IndexMap<String, Value>,
    extension: Option<&dyn Extension>,
    warner: &Warner,
) -> Request {
    let mut url = String::new();
    for piece in &def.pieces {
        match piece {
            UrlPiece::Literal(text) => url.push_str(text),
            UrlPiece::Fun { id, args } => {
                url.push_str(&evaluate(def, anchor, params, extension, warner, *id, args));
            }
        }
    }
    Request {
        url,
        accept: def.accept.clone(),
        headers: def.headers.clone(),
    }
}

fn evaluate(
    def: &UrlDef,
    anchor: &Anchor,
    params: &IndexMap<String, Value>,
    extension: Option<&dyn Extension>,
    warner: &Warner,
    id: u32,
    args: &[Value],
) -> String {
    if id >= EXTENSION_FUN_BASE {
        if let Some(extension) = extension {
            if let Some(piece) = extension.url_function(id, args) {
                return piece;
            }
        }
        warner.warn(
            Category::Url,
            Severity::InvalidDef,
            format!("url function {id} has no handler"),
        );
        return String::new();
    }

    match id {
        // Substitute a named runtime variable; lists and maps join with
        // commas.
        0 => {
            let name = args.first().map(Value::render).unwrap_or_default();
            match params.get(&name).or_else(|| def.data.get(&name)) {
                Some(value) => value.render(),
                None => {
                    warner.warn(
                        Category::Url,
                        Severity::InvalidData,
                        format!("url variable '{name}' is not set"),
                    );
                    String::new()
                }
            }
        }

        // A count range: cnt-offset · cnt + 1 through + cnt.
        1 => {
            let count = lookup_int(def, params, "cnt").unwrap_or(def.default_count);
            let offset = lookup_int(def, params, "cnt-offset").unwrap_or(0);
            let low = offset * count + 1;
            let high = offset * count + count;
            format!("{low}{}{high}", def.item_splitter)
        }

        // A single date piece at an offset from the current-date anchor.
        2 => date_piece(def, anchor, params, warner, args.first()),

        // A date range: two date pieces joined by the range splitter.
        3 => {
            let from = date_piece(def, anchor, params, warner, args.first());
            let to = date_piece(def, anchor, params, warner, args.get(1));
            format!("{from}{}{to}", def.date_splitter)
        }

        other => {
            warner.warn(
                Category::Url,
                Severity::InvalidDef,
                format!("unknown url function {other}"),
            );
            String::new()
        }
    }
}

fn lookup_int(def: &UrlDef, params: &IndexMap<String, Value>, name: &str) -> Option<i64> {
    params
        .get(name)
        .or_else(|| def.data.get(name))
        .and_then(Value::to_int)
}

/// Resolve one date argument to a day offset and render it according to the
/// definition's date type.
fn date_piece(
    def: &UrlDef,
    anchor: &Anchor,
    params: &IndexMap<String, Value>,
    warner: &Warner,
    arg: Option<&Value>,
) -> String {
    let days = match arg {
        None => 0,
        Some(Value::Int(days)) => *days,
        Some(Value::String(name)) => {
            let lowered = name.trim().to_lowercase();
            match def.relative_weekdays.get(&lowered) {
                Some(days) => *days,
                None => match params.get(name).and_then(Value::to_int) {
                    Some(days) => days,
                    None => {
                        warner.warn(
                            Category::Url,
                            Severity::InvalidData,
                            format!("date argument '{name}' resolves to no offset"),
                        );
                        0
                    }
                },
            }
        }
        Some(other) => other.to_int().unwrap_or(0),
    };

    let date = anchor.current() + Duration::days(days);
    match def.date_type {
        UrlDateType::Offset => {
            let format = def.date_format.as_deref().unwrap_or("%Y-%m-%d");
            let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                warner.warn(
                    Category::Url,
                    Severity::InvalidDef,
                    format!("url date format '{format}' is invalid, using %Y-%m-%d"),
                );
                return date.format("%Y-%m-%d").to_string();
            }
            date.format(format).to_string()
        }
        UrlDateType::Epoch => {
            let midnight = date.and_hms_opt(0, 0, 0).map(|naive| {
                anchor
                    .offset()
                    .from_local_datetime(&naive)
                    .single()
                    .map(|local| local.timestamp())
                    .unwrap_or(0)
            });
            let seconds = midnight.unwrap_or(0);
            (seconds * def.date_multiplier).to_string()
        }
        UrlDateType::Weekday => {
            let position = date.weekday().num_days_from_monday() as usize;
            match def.weekdays.get(position) {
                Some(name) => name.clone(),
                None => {
                    warner.warn(
                        Category::Url,
                        Severity::InvalidDef,
                        "url-weekdays does not cover the requested day",
                    );
                    String::new()
                }
            }
        }
    }
}

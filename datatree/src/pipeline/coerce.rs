//! Type coercions, the final pipeline stage.
//!
//! Each coercion is a pure function of the value, the definition's
//! formatting defaults, and the current-date anchor. Failures report a
//! conversion warning and fall back: numeric coercions to zero, everything
//! else to the input unchanged.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::def::model::{DateField, Pattern, TypeOp};
use crate::matcher::Walker;
use crate::value::Value;
use crate::warn::{Category, Severity};

impl Walker<'_> {
    /// Apply one type coercion.
    pub(crate) fn coerce(&self, value: Value, op: &TypeOp) -> Value {
        match op {
            TypeOp::Timestamp { multiplier } => self.epoch(value, *multiplier, false),
            TypeOp::DateStamp { multiplier } => self.epoch(value, *multiplier, true),
            TypeOp::DateTimeString { format } => self.datetime_string(value, format.as_deref()),
            TypeOp::Time { splitter } => self.time(value, splitter.as_ref()),
            TypeOp::TimeDelta => match value.to_int() {
                Some(seconds) => Value::Duration(seconds),
                None => self.conversion_failed(value, "timedelta"),
            },
            TypeOp::Date { splitter, sequence } => {
                self.date(value, splitter.as_ref(), sequence.as_deref())
            }
            TypeOp::RelativeWeekday => match value.as_str() {
                Some(name) => match self.anchor.relative(&name.trim().to_lowercase()) {
                    Some(date) => Value::Date(date),
                    None => self.conversion_failed(value, "relative-weekday"),
                },
                None => self.conversion_failed(value, "relative-weekday"),
            },
            TypeOp::Str => Value::String(value.render()),
            TypeOp::Int => match value.to_int() {
                Some(n) => Value::Int(n),
                None => {
                    self.warn_conversion(&value, "int");
                    Value::Int(0)
                }
            },
            TypeOp::Float => match value.to_float() {
                Some(f) => Value::Float(f),
                None => {
                    self.warn_conversion(&value, "float");
                    Value::Float(0.0)
                }
            },
            TypeOp::Bool => Value::Bool(value.truthy()),
            TypeOp::LowerAscii => match value {
                Value::String(s) => Value::String(lower_ascii(&s)),
                other => other,
            },
            TypeOp::StrList {
                splitter,
                omit_empty,
            } => match &value {
                Value::String(s) => {
                    let splitter = splitter.as_ref().unwrap_or(&self.config.str_list_splitter);
                    Value::List(
                        splitter
                            .regex()
                            .split(s)
                            .filter(|piece| !omit_empty || !piece.is_empty())
                            .map(Value::from)
                            .collect(),
                    )
                }
                _ => value,
            },
            TypeOp::List => value,
            TypeOp::Lower => match value {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            },
            TypeOp::Upper => match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            },
            TypeOp::Capitalize => match value {
                Value::String(s) => Value::String(super::capitalize(&s)),
                other => other,
            },
        }
    }

    fn epoch(&self, value: Value, multiplier: i64, date_only: bool) -> Value {
        let Some(raw) = value.to_float() else {
            return self.conversion_failed(value, "timestamp");
        };
        let seconds = raw / multiplier as f64;
        match DateTime::from_timestamp(seconds as i64, 0) {
            Some(instant) if date_only => Value::Date(instant.date_naive()),
            Some(instant) => Value::DateTime(instant),
            None => self.conversion_failed(value, "timestamp"),
        }
    }

    fn datetime_string(&self, value: Value, format: Option<&str>) -> Value {
        let Some(text) = value.as_str() else {
            return self.conversion_failed(value, "datetimestring");
        };
        let format = format.unwrap_or(self.config.datetimestring.as_str());
        let Ok(naive) = NaiveDateTime::parse_from_str(text.trim(), format) else {
            return self.conversion_failed(value, "datetimestring");
        };
        match self.anchor.offset().from_local_datetime(&naive).single() {
            Some(local) => Value::DateTime(local.with_timezone(&Utc)),
            None => self.conversion_failed(value, "datetimestring"),
        }
    }

    fn time(&self, value: Value, splitter: Option<&Pattern>) -> Value {
        let Some(text) = value.as_str() else {
            return self.conversion_failed(value, "time");
        };
        let mut text = text.trim().to_owned();

        // Under a 12-hour clock a trailing AM/PM suffix decides the half.
        let mut half: Option<bool> = None;
        if self.config.time_hours == 12 {
            let lowered = text.to_lowercase();
            if let Some(stripped) = lowered.strip_suffix(&self.config.pm) {
                half = Some(true);
                text = stripped.trim().to_owned();
            } else if let Some(stripped) = lowered.strip_suffix(&self.config.am) {
                half = Some(false);
                text = stripped.trim().to_owned();
            }
        }

        let splitter = splitter.unwrap_or(&self.config.time_splitter);
        let parts: Vec<&str> = splitter.regex().split(&text).collect();
        let Some(hour) = parts.first().and_then(|p| p.trim().parse::<u32>().ok()) else {
            return self.conversion_failed(value, "time");
        };
        let minute = parts
            .get(1)
            .and_then(|p| p.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let second = parts
            .get(2)
            .and_then(|p| p.trim().get(..2.min(p.trim().len())))
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0);

        let hour = match half {
            Some(true) if hour < 12 => hour + 12,
            Some(false) if hour == 12 => 0,
            _ => hour,
        };

        match NaiveTime::from_hms_opt(hour, minute, second) {
            Some(time) => Value::Time(time),
            None => self.conversion_failed(value, "time"),
        }
    }

    fn date(
        &self,
        value: Value,
        splitter: Option<&Pattern>,
        sequence: Option<&[DateField]>,
    ) -> Value {
        let Some(text) = value.as_str() else {
            return self.conversion_failed(value, "date");
        };

        let today = self.anchor.current();
        let mut day = today.day() as i64;
        let mut month = today.month() as i64;
        let mut year = today.year() as i64;

        let splitter = splitter.unwrap_or(&self.config.date_splitter);
        let sequence = sequence.unwrap_or(&self.config.date_sequence);
        for (position, piece) in splitter.regex().split(text.trim()).enumerate() {
            let Some(field) = sequence.get(position) else {
                break;
            };
            let piece = piece.trim();
            let number = match piece.parse::<i64>() {
                Ok(number) => number,
                Err(_) => match self.month_number(piece) {
                    Some(number) => number,
                    None => {
                        self.warner.warn(
                            Category::Conversion,
                            Severity::InvalidData,
                            format!("date piece '{piece}' is neither a number nor a month name"),
                        );
                        continue;
                    }
                },
            };
            match field {
                DateField::Day => day = number,
                DateField::Month => month = number,
                DateField::Year => year = number,
            }
        }

        match NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32) {
            Some(date) => Value::Date(date),
            None => self.conversion_failed(value, "date"),
        }
    }

    /// Resolve a textual month. A 13-entry month-name list is taken as
    /// placeholder-first, so the entry position is the month number; a
    /// 12-entry list starts at January.
    fn month_number(&self, name: &str) -> Option<i64> {
        let lowered = name.to_lowercase();
        let position = self
            .config
            .month_names
            .iter()
            .position(|month| *month == lowered)? as i64;
        if self.config.month_names.len() == 13 {
            Some(position)
        } else {
            Some(position + 1)
        }
    }

    fn warn_conversion(&self, value: &Value, target: &str) {
        self.warner.warn(
            Category::Conversion,
            Severity::InvalidData,
            format!("cannot convert '{value}' to {target}"),
        );
    }

    fn conversion_failed(&self, value: Value, target: &str) -> Value {
        self.warn_conversion(&value, target);
        value
    }
}

/// Lowercase, fold accented Latin-1 letters to their ASCII neighbors,
/// replace spaces and slashes with underscores, drop a small punctuation
/// set, and stand in `?` for anything else outside ASCII.
fn lower_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.to_lowercase().chars() {
        match c {
            ' ' | '/' => out.push('_'),
            '!' | '(' | ')' | ',' => {}
            'á' | 'à' | 'ä' | 'â' | 'ã' | '@' => out.push('a'),
            'é' | 'è' | 'ë' | 'ê' => out.push('e'),
            'í' | 'ì' | 'ï' | 'î' => out.push('i'),
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' => out.push('o'),
            'ú' | 'ù' | 'ü' | 'û' => out.push('u'),
            'ý' | 'ÿ' => out.push('y'),
            c if c.is_ascii() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::lower_ascii;

    #[test]
    fn lower_ascii_folds_and_rewrites() {
        assert_eq!(lower_ascii("Café au lait!"), "cafe_au_lait");
        assert_eq!(lower_ascii("a/b C"), "a_b_c");
        assert_eq!(lower_ascii("naïve Ω"), "naive_?");
    }
}

/// Combine a date and a time in the definition timezone into a UTC instant.
pub(crate) fn combine_local(
    date: NaiveDate,
    time: NaiveTime,
    offset: chrono::FixedOffset,
) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// A day forward, for midnight rollover in the date+time link function.
pub(crate) fn next_day(date: NaiveDate) -> NaiveDate {
    date + Duration::days(1)
}

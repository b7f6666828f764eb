//! The stable status taxonomy reported by extraction runs.
//!
//! A [`Status`] packs one *fatal* code and any number of *non-fatal* flags
//! into a single `u32` bitmask. The fatal code occupies the low four bits and
//! is overwritten each time a fatal condition is recorded; non-fatal flags
//! occupy the bits above and accumulate with bitwise OR. The numeric layout
//! is stable so callers may persist or compare raw bitmasks across versions.

use flagset::{flags, FlagSet};
use strum::Display;

/// Fatal outcome codes, stored in bits 0–3 of the combined bitmask.
///
/// At most one fatal code is active at a time; recording a new one replaces
/// the previous one. [`Fatal::Ok`] means no fatal condition occurred.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Fatal {
    /// No fatal condition.
    #[default]
    Ok = 0,

    /// A request URL could not be constructed or resolved.
    Url = 1,

    /// The input fetch timed out before the payload arrived.
    Timeout = 2,

    /// The input fetch failed at the HTTP layer.
    Http = 3,

    /// The input payload was not valid JSON.
    Json = 4,

    /// The input payload was empty.
    Empty = 5,

    /// The input payload was truncated mid-read.
    IncompleteRead = 6,

    /// The initial path did not resolve to a usable start node.
    InvalidStartNode = 7,

    /// The data definition could not be compiled.
    InvalidDataDef = 8,

    /// The input payload could not be built into a tree.
    InvalidDataSet = 9,

    /// Extraction completed but produced no records.
    NoData = 10,

    /// An unclassified failure.
    Unknown = 11,

    /// The caller requested a cooperative stop mid-extraction.
    Quit = 12,
}

flags! {
    /// Non-fatal condition flags, stored in bits 4 and up of the combined
    /// bitmask. These accumulate: once set, a flag stays set for the life of
    /// the [`Status`].
    #[derive(Hash)]
    pub enum Soft: u32 {
        /// A sort directive named a path that did not resolve to a list.
        SortFailed = 1 << 4,

        /// An unquote rewrite matched without a capture group.
        UnquoteFailed = 1 << 5,

        /// A text-replace rewrite could not be applied.
        TextReplaceFailed = 1 << 6,

        /// The configured timezone was not recognized; UTC is used instead.
        TimeZoneFailed = 1 << 7,

        /// A caller-supplied current date could not be parsed.
        CurrentDateFailed = 1 << 8,

        /// A value link was referenced before any step stored it.
        InvalidValueLink = 1 << 9,

        /// A node link was referenced before any step stored it.
        InvalidNodeLink = 1 << 10,

        /// A path definition contained an unusable step.
        InvalidPathDef = 1 << 11,

        /// A link definition was malformed or named an unknown function.
        InvalidLinkDef = 1 << 12,
    }
}

/// The combined outcome of an extraction run.
///
/// # Example
///
/// ```
/// use datatree::status::{Fatal, Soft, Status};
///
/// let mut status = Status::default();
/// assert!(status.is_ok());
///
/// status.flag(Soft::SortFailed);
/// status.flag(Soft::SortFailed | Soft::TimeZoneFailed);
/// assert!(!status.is_fatal());
///
/// status.set_fatal(Fatal::NoData);
/// assert!(status.is_fatal());
/// assert_eq!(status.check_errors() & 0b1111, 10);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    fatal: Fatal,
    soft: FlagSet<Soft>,
}

impl Status {
    /// The current fatal code.
    pub fn fatal(&self) -> Fatal {
        self.fatal
    }

    /// The accumulated non-fatal flags.
    pub fn soft(&self) -> FlagSet<Soft> {
        self.soft
    }

    /// Record a fatal code, replacing any previous one.
    pub fn set_fatal(&mut self, fatal: Fatal) {
        self.fatal = fatal;
    }

    /// Accumulate one or more non-fatal flags.
    pub fn flag(&mut self, soft: impl Into<FlagSet<Soft>>) {
        self.soft |= soft.into();
    }

    /// Fold another status into this one: the other fatal code wins if set,
    /// and its non-fatal flags accumulate.
    pub fn merge(&mut self, other: Status) {
        if other.fatal != Fatal::Ok {
            self.fatal = other.fatal;
        }
        self.soft |= other.soft;
    }

    /// Whether neither a fatal code nor any non-fatal flag is recorded.
    pub fn is_ok(&self) -> bool {
        self.fatal == Fatal::Ok && self.soft.is_empty()
    }

    /// Whether a fatal code is recorded.
    pub fn is_fatal(&self) -> bool {
        self.fatal != Fatal::Ok
    }

    /// The combined bitmask: fatal code in bits 0–3, non-fatal flags above.
    pub fn check_errors(&self) -> u32 {
        self.fatal as u32 | self.soft.bits()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fatal)?;
        for flag in self.soft {
            let name = match flag {
                Soft::SortFailed => "sort_failed",
                Soft::UnquoteFailed => "unquote_failed",
                Soft::TextReplaceFailed => "text_replace_failed",
                Soft::TimeZoneFailed => "time_zone_failed",
                Soft::CurrentDateFailed => "current_date_failed",
                Soft::InvalidValueLink => "invalid_value_link",
                Soft::InvalidNodeLink => "invalid_node_link",
                Soft::InvalidPathDef => "invalid_path_def",
                Soft::InvalidLinkDef => "invalid_link_def",
            };
            write!(f, "+{name}")?;
        }
        Ok(())
    }
}

//! User-facing extraction diagnostics.
//!
//! Warnings are the channel through which the engine reports recoverable
//! conditions (a predicate referencing an unstored link, a coercion falling
//! back, a date that would not parse) without aborting the walk. They are
//! distinct from `tracing` events: `tracing` is for developers running the
//! engine, warnings are for the author of the data definition.
//!
//! The registry is process-wide and serialized behind a mutex. Each caller
//! (identified by an arbitrary `u32`) may install its own sink and its own
//! filter rules, so several independent extractions can impose independent
//! policies. Tests install a queue sink to capture warnings
//! deterministically.

use std::{
    collections::HashSet,
    io::Write,
    sync::{mpsc::SyncSender, Mutex},
};

use flagset::{flags, FlagSet};
use once_cell::sync::Lazy;
use strum::{Display, EnumString};

/// The subsystem a warning originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    /// Anything not covered by a more specific category.
    General,
    /// Input payload problems.
    Data,
    /// Data definition problems noticed after compilation.
    DataDef,
    /// Type coercion fallbacks.
    Conversion,
    /// Tree walking and predicate evaluation.
    Parse,
    /// Calc pipeline fallbacks.
    Calc,
    /// Request building.
    Url,
    /// Link stage and link functions.
    Link,
}

flags! {
    /// Severity bits carried by each warning; filters match against them.
    #[derive(Hash)]
    pub enum Severity: u8 {
        /// The condition likely invalidates the extraction result.
        Serious = 1,
        /// The data definition asked for something impossible.
        InvalidDef = 2,
        /// The input payload did not look as the definition expects.
        InvalidData = 4,
    }
}

/// What to do with warnings matched by a filter rule.
///
/// The vocabulary follows the classic warning-control actions: `Default`
/// deduplicates per message, `Module` per category, `Once` globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    /// Deliver and additionally raise a `tracing` error event.
    Error,
    /// Drop silently.
    Ignore,
    /// Deliver every occurrence.
    Always,
    /// Deliver the first occurrence of each distinct message.
    Default,
    /// Deliver the first occurrence per category.
    Module,
    /// Deliver the first occurrence per caller.
    Once,
}

/// A single delivered warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// The caller id the originating engine was created with.
    pub caller: u32,
    /// Originating subsystem.
    pub category: Category,
    /// Severity bits.
    pub severity: FlagSet<Severity>,
    /// Human-readable description.
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}:{}] {}",
            self.caller, self.category, self.message
        )
    }
}

/// Where matched warnings are delivered.
pub enum Sink {
    /// Write formatted lines to the given writer.
    Writer(Box<dyn Write + Send>),
    /// Push structured warnings onto a bounded queue. Warnings that do not
    /// fit are dropped rather than blocking the walk.
    Queue(SyncSender<Warning>),
}

struct Rule {
    action: Action,
    category: Option<Category>,
    severity: FlagSet<Severity>,
    caller: Option<u32>,
}

impl Rule {
    fn matches(&self, warning: &Warning) -> bool {
        if let Some(category) = self.category {
            if category != warning.category {
                return false;
            }
        }
        if let Some(caller) = self.caller {
            if caller != warning.caller {
                return false;
            }
        }
        !(self.severity & warning.severity).is_empty()
    }
}

#[derive(Default)]
struct Registry {
    rules: Vec<Rule>,
    sinks: Vec<(u32, Sink)>,
    seen_messages: HashSet<(u32, Category, String)>,
    seen_categories: HashSet<(u32, Category)>,
    seen_callers: HashSet<u32>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

/// Install the sink for a caller id, replacing any previous sink.
pub fn set_sink(caller: u32, sink: Sink) {
    let mut registry = lock();
    registry.sinks.retain(|(id, _)| *id != caller);
    registry.sinks.push((caller, sink));
}

/// Remove the sink for a caller id.
pub fn clear_sink(caller: u32) {
    lock().sinks.retain(|(id, _)| *id != caller);
}

/// Prepend a filter rule. Rules are consulted newest-first and the first
/// match decides; warnings matching no rule are always delivered.
pub fn add_filter(
    action: Action,
    category: Option<Category>,
    severity: impl Into<FlagSet<Severity>>,
    caller: Option<u32>,
) {
    lock().rules.insert(
        0,
        Rule {
            action,
            category,
            severity: severity.into(),
            caller,
        },
    );
}

/// Drop all filter rules.
pub fn reset_filters() {
    let mut registry = lock();
    registry.rules.clear();
    registry.seen_messages.clear();
    registry.seen_categories.clear();
    registry.seen_callers.clear();
}

fn lock() -> std::sync::MutexGuard<'static, Registry> {
    // A poisoned registry only means another thread panicked while warning;
    // the data is still consistent.
    REGISTRY.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// A cheap handle bound to one caller id, passed through the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Warner {
    caller: u32,
}

impl Warner {
    /// Create a handle for the given caller id.
    pub fn new(caller: u32) -> Self {
        Self { caller }
    }

    /// The caller id this handle reports under.
    pub fn caller(&self) -> u32 {
        self.caller
    }

    /// Report a warning through the registry.
    pub fn warn(
        &self,
        category: Category,
        severity: impl Into<FlagSet<Severity>>,
        message: impl Into<String>,
    ) {
        let warning = Warning {
            caller: self.caller,
            category,
            severity: severity.into(),
            message: message.into(),
        };

        let mut registry = lock();
        let action = registry
            .rules
            .iter()
            .find(|rule| rule.matches(&warning))
            .map(|rule| rule.action)
            .unwrap_or(Action::Always);

        let deliver = match action {
            Action::Ignore => false,
            Action::Always => true,
            Action::Error => {
                tracing::error!(caller = warning.caller, category = %warning.category, "{}", warning.message);
                true
            }
            Action::Default => registry.seen_messages.insert((
                warning.caller,
                warning.category,
                warning.message.clone(),
            )),
            Action::Module => registry
                .seen_categories
                .insert((warning.caller, warning.category)),
            Action::Once => registry.seen_callers.insert(warning.caller),
        };
        if !deliver {
            return;
        }

        let caller = warning.caller;
        match registry.sinks.iter_mut().find(|(id, _)| *id == caller) {
            Some((_, Sink::Writer(writer))) => {
                // A failed write must not abort the walk.
                let _ = writeln!(writer, "{warning}");
            }
            Some((_, Sink::Queue(sender))) => {
                let _ = sender.try_send(warning);
            }
            None => {
                tracing::warn!(caller, category = %warning.category, "{}", warning.message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;

    use super::*;

    // The registry is process-wide, so each test uses its own caller id to
    // stay independent of the others.

    #[test]
    fn queue_sink_captures_warnings() {
        let (tx, rx) = sync_channel(8);
        set_sink(901, Sink::Queue(tx));

        let warner = Warner::new(901);
        warner.warn(Category::Parse, Severity::InvalidData, "missing link 3");

        let warning = rx.try_recv().expect("warning must be delivered");
        assert_eq!(warning.category, Category::Parse);
        assert_eq!(warning.message, "missing link 3");
        clear_sink(901);
    }

    #[test]
    fn ignore_filter_drops() {
        let (tx, rx) = sync_channel(8);
        set_sink(902, Sink::Queue(tx));
        add_filter(Action::Ignore, Some(Category::Calc), Severity::InvalidData, Some(902));

        let warner = Warner::new(902);
        warner.warn(Category::Calc, Severity::InvalidData, "dropped");
        warner.warn(Category::Parse, Severity::InvalidData, "kept");

        let warning = rx.try_recv().expect("unmatched category must pass");
        assert_eq!(warning.message, "kept");
        assert!(rx.try_recv().is_err());
        clear_sink(902);
    }

    #[test]
    fn default_filter_deduplicates_messages() {
        let (tx, rx) = sync_channel(8);
        set_sink(903, Sink::Queue(tx));
        add_filter(Action::Default, None, Severity::Serious, Some(903));

        let warner = Warner::new(903);
        warner.warn(Category::General, Severity::Serious, "same");
        warner.warn(Category::General, Severity::Serious, "same");
        warner.warn(Category::General, Severity::Serious, "different");

        assert_eq!(rx.try_recv().expect("first").message, "same");
        assert_eq!(rx.try_recv().expect("second").message, "different");
        assert!(rx.try_recv().is_err());
        clear_sink(903);
    }

    #[test]
    fn full_queue_does_not_block() {
        let (tx, _rx) = sync_channel(1);
        set_sink(904, Sink::Queue(tx));

        let warner = Warner::new(904);
        warner.warn(Category::General, Severity::Serious, "one");
        warner.warn(Category::General, Severity::Serious, "two");
        clear_sink(904);
    }
}

//! Log record formatter (C9): a timestamped, de-duplicating record
//! generator. [`LogFormatter`] is the pure, synchronous core; every other
//! component calls into it (directly in tests, or via [`CoalescingLayer`]
//! when wired into `tracing`) through the same uniform [`LogRecord`] shape.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

const DUPLICATE_TIMEOUT: Duration = Duration::from_secs(30);
const DUPLICATE_CAP: u32 = 100;

/// Severity, ordered high to low priority. `Broadcast` is a reserved channel
/// that bypasses both the priority filter and duplicate suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Critical,
    Warning,
    Message,
    Info,
    Debug,
    Broadcast,
}

impl Level {
    fn rank(self) -> u8 {
        match self {
            Level::Error => 0,
            Level::Critical => 1,
            Level::Warning => 2,
            Level::Message => 3,
            Level::Info => 4,
            Level::Debug => 5,
            Level::Broadcast => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Warning => "warning",
            Level::Message => "message",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Broadcast => "broadcast",
        }
    }

    /// Bit for this level in the priority bitmask below. Each rank gets its
    /// own bit; a level is enabled against a threshold by testing bits, not
    /// by a truthy comparison of the raw rank — see [`Level::enabled_at`].
    fn bit(self) -> u32 {
        1 << self.rank()
    }

    /// Bitmask of every level at or above `threshold`'s priority (i.e. every
    /// rank from 0 up to and including `threshold`'s rank).
    fn priority_mask(threshold: Level) -> u32 {
        (1u32 << (threshold.rank() + 1)) - 1
    }

    /// Whether a record at this level should be admitted given a configured
    /// `threshold`. This is a proper bitmask test (`bit & mask != 0`), not
    /// the logical-AND-of-raw-value shortcut that silently treats every
    /// nonzero level as passing any threshold.
    pub fn enabled_at(self, threshold: Level) -> bool {
        self == Level::Broadcast || (self.bit() & Level::priority_mask(threshold)) != 0
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub logger: String,
    pub level: Level,
    pub message: String,
}

/// Strips any leading path up to and including the last occurrence of
/// `src/` (or the platform separator's equivalent) from an embedded file
/// marker in a message, so log lines don't carry build-machine-specific
/// absolute paths.
pub fn strip_src_prefix(message: &str) -> String {
    let needles = ["src/", "src\\"];
    let mut cut = None;
    for needle in needles {
        if let Some(pos) = message.rfind(needle) {
            let candidate = pos + needle.len();
            cut = Some(cut.map_or(candidate, |c: usize| c.max(candidate)));
        }
    }
    match cut {
        Some(pos) => message[pos..].to_string(),
        None => message.to_string(),
    }
}

fn format_line(record: &LogRecord, stripped_message: &str) -> String {
    let logger = if record.logger.is_empty() {
        "global"
    } else {
        &record.logger
    };
    format!(
        "{}: [{}] ({}) {}",
        record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f"),
        logger,
        record.level.as_str(),
        stripped_message
    )
}

struct Run {
    message: String,
    loggers: BTreeSet<String>,
    count: u32,
    first_seen: Instant,
}

/// The coalescing, formatting core. Not `tracing`-aware itself — see
/// [`CoalescingLayer`] for the subscriber integration.
pub struct LogFormatter {
    threshold: Level,
    run: Option<Run>,
}

impl LogFormatter {
    pub fn new(threshold: Level) -> Self {
        Self { threshold, run: None }
    }

    /// Admits one record, returning zero, one, or two formatted lines: a
    /// `"... last message repeated N times"` flush line (if a run just
    /// broke) followed by the new record's own line, or nothing at all if
    /// the record was filtered by level or folded into the current run.
    pub fn admit(&mut self, record: LogRecord) -> Vec<String> {
        if !record.level.enabled_at(self.threshold) {
            return Vec::new();
        }

        let stripped = strip_src_prefix(&record.message);
        let now = Instant::now();

        let is_duplicate = record.level != Level::Broadcast
            && self
                .run
                .as_ref()
                .map(|r| r.message == stripped)
                .unwrap_or(false);

        if is_duplicate {
            let run = self.run.as_mut().unwrap();
            let within_cap = run.count < DUPLICATE_CAP;
            let within_timeout = now.duration_since(run.first_seen) < DUPLICATE_TIMEOUT;
            if within_cap && within_timeout {
                run.loggers.insert(if record.logger.is_empty() {
                    "global".to_string()
                } else {
                    record.logger.clone()
                });
                run.count += 1;
                return Vec::new();
            }
        }

        let mut out = Vec::new();
        if let Some(run) = self.run.take() {
            if run.count > 0 {
                let loggers: Vec<&str> = run.loggers.iter().map(String::as_str).collect();
                out.push(format!(
                    "[{}] last message repeated {} times",
                    loggers.join(", "),
                    run.count
                ));
            }
        }

        out.push(format_line(&record, &stripped));

        self.run = Some(Run {
            message: stripped,
            loggers: BTreeSet::new(),
            count: 0,
            first_seen: now,
        });

        out
    }
}

/// A `tracing_subscriber` layer that routes every event through
/// [`LogFormatter`] before printing, so coalescing is transparent to call
/// sites — they log normally with the usual `tracing` macros.
pub struct CoalescingLayer {
    formatter: Mutex<LogFormatter>,
}

impl CoalescingLayer {
    pub fn new(threshold: Level) -> Self {
        Self {
            formatter: Mutex::new(LogFormatter::new(threshold)),
        }
    }
}

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

fn tracing_level_to_level(level: &tracing::Level) -> Level {
    match *level {
        tracing::Level::ERROR => Level::Error,
        tracing::Level::WARN => Level::Warning,
        tracing::Level::INFO => Level::Info,
        tracing::Level::DEBUG => Level::Debug,
        tracing::Level::TRACE => Level::Debug,
    }
}

impl<S> tracing_subscriber::Layer<S> for CoalescingLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Utc::now(),
            logger: event.metadata().target().to_string(),
            level: tracing_level_to_level(event.metadata().level()),
            message: visitor.message,
        };

        let mut formatter = self.formatter.lock().unwrap();
        for line in formatter.admit(record) {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: Level, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            logger: "session".to_string(),
            level,
            message: message.to_string(),
        }
    }

    #[test]
    fn log_coalescing_scenario() {
        // Spec scenario 6: 3 identical warnings then a different one.
        let mut formatter = LogFormatter::new(Level::Debug);

        let first = formatter.admit(record(Level::Warning, "disk nearly full"));
        assert_eq!(first.len(), 1);

        let second = formatter.admit(record(Level::Warning, "disk nearly full"));
        assert!(second.is_empty());

        let third = formatter.admit(record(Level::Warning, "disk nearly full"));
        assert!(third.is_empty());

        let fourth = formatter.admit(record(Level::Warning, "disk now full"));
        assert_eq!(fourth.len(), 2);
        assert!(fourth[0].contains("repeated 2 times"));
        assert!(fourth[1].contains("disk now full"));
    }

    #[test]
    fn broadcast_breaks_a_run_and_is_never_coalesced() {
        let mut formatter = LogFormatter::new(Level::Debug);
        formatter.admit(record(Level::Warning, "retrying"));
        formatter.admit(record(Level::Warning, "retrying"));

        let broadcast = formatter.admit(record(Level::Broadcast, "shutting down"));
        assert_eq!(broadcast.len(), 2);
        assert!(broadcast[0].contains("repeated 1 times"));

        // A second identical broadcast is never folded into a run either.
        let broadcast2 = formatter.admit(record(Level::Broadcast, "shutting down"));
        assert_eq!(broadcast2.len(), 1);
    }

    #[test]
    fn log_idempotence_invariant() {
        let mut formatter = LogFormatter::new(Level::Debug);
        let first = formatter.admit(record(Level::Error, "connection refused"));
        assert_eq!(first.len(), 1);
        let second = formatter.admit(record(Level::Error, "connection refused"));
        assert!(second.is_empty());

        let flush = formatter.admit(record(Level::Error, "different message"));
        assert_eq!(flush.len(), 2);
        assert!(flush[0].contains("repeated 1 times"));
    }

    #[test]
    fn records_below_threshold_are_dropped() {
        let mut formatter = LogFormatter::new(Level::Warning);
        let out = formatter.admit(record(Level::Debug, "verbose detail"));
        assert!(out.is_empty());
    }

    #[test]
    fn priority_mask_is_a_real_bitmask_not_a_truthy_check() {
        // The bug this spec fixes: a logical-AND-of-raw-value test treats
        // every nonzero level as "enabled" against any threshold. A correct
        // bitmask test must actually discriminate.
        assert!(Level::Error.enabled_at(Level::Warning));
        assert!(!Level::Debug.enabled_at(Level::Warning));
        assert!(Level::Warning.enabled_at(Level::Warning));
    }

    #[test]
    fn logger_defaults_to_global_when_empty() {
        let mut formatter = LogFormatter::new(Level::Debug);
        let out = formatter.admit(LogRecord {
            timestamp: Utc::now(),
            logger: String::new(),
            level: Level::Info,
            message: "hello".to_string(),
        });
        assert!(out[0].contains("[global]"));
    }

    #[test]
    fn strips_last_src_prefix_occurrence() {
        let stripped = strip_src_prefix("/home/build/project/src/session.rs:42: boom");
        assert_eq!(stripped, "session.rs:42: boom");
    }

    #[test]
    fn leaves_message_without_src_prefix_untouched() {
        let stripped = strip_src_prefix("no path marker here");
        assert_eq!(stripped, "no path marker here");
    }
}

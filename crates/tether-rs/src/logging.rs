//! Stderr log output for the `tether` binary and embedders.
//!
//! [`StderrLayer`] is a [`tracing_subscriber::Layer`] that prints one line
//! per event: `HH:MM:SS LEVEL message {field=value, ...}`. Events from this
//! crate are shown down to the configured level; other crates (HTTP stack,
//! runtime) only surface warnings and errors.
//!
//! ```ignore
//! tether_rs::logging::init(tracing::Level::DEBUG);
//! ```

use std::io::Write;

use chrono::Local;
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

const CRATE_TARGET: &str = "tether_rs";

/// A layer that writes formatted events to stderr.
#[derive(Debug, Clone, Copy)]
pub struct StderrLayer {
    max_level: Level,
}

impl StderrLayer {
    pub fn new(max_level: Level) -> Self {
        Self { max_level }
    }

    fn wants(&self, metadata: &Metadata<'_>) -> bool {
        let level = *metadata.level();
        if metadata.target().starts_with(CRATE_TARGET) {
            level <= self.max_level
        } else {
            level <= Level::WARN
        }
    }
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for StderrLayer {
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.wants(metadata)
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format_line(
            &Local::now().format("%H:%M:%S").to_string(),
            *event.metadata().level(),
            visitor,
        );
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }
}

fn format_line(time: &str, level: Level, visitor: MessageVisitor) -> String {
    let mut message = visitor.message;
    if !visitor.fields.is_empty() {
        let extras: Vec<String> = visitor
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if message.is_empty() {
            message = extras.join(" ");
        } else {
            message = format!("{message} {{{}}}", extras.join(", "));
        }
    }
    format!("{time} {:>5} {message}", level.as_str())
}

/// Install a registry with a [`StderrLayer`] as the global subscriber.
/// Does nothing if a subscriber is already set.
pub fn init(max_level: Level) {
    let _ = tracing_subscriber::registry()
        .with(StderrLayer::new(max_level))
        .try_init();
}

/// Map a `-v` count to a level: 0 → WARN, 1 → INFO, 2 → DEBUG, 3+ → TRACE.
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Extracts the message and extra fields from a tracing event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let raw = format!("{value:?}");
        if field.name() == "message" {
            self.message = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .map(str::to_string)
                .unwrap_or(raw);
        } else {
            self.fields.push((field.name().to_string(), raw));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}

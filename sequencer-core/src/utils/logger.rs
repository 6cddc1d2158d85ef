use anyhow::{Context, Result};
use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    EnvFilter, Layer,
};

/// Target for terminal registration outcomes
pub const OUTCOME_TARGET: &str = "outcome";
/// Target for invariant violations and wallet retirements
pub const ALERT_TARGET: &str = "alert";

/// Overrides both layer filters with an `EnvFilter` directive when set
pub const LOG_ENV: &str = "SEQUENCER_LOG";

pub fn setup_logger(log_dir: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir))?;

    let file_appender = tracing_appender::rolling::hourly(log_dir, "sequencer");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_directive = std::env::var(LOG_ENV).ok();

    // File layer: INFO for outcomes and alerts, WARN for others
    let file_filter = match &env_directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::new(format!(
            "warn,{}=info,{}=info",
            OUTCOME_TARGET, ALERT_TARGET
        )),
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    // Console layer: INFO for outcomes, ERROR for others
    let console_filter = match &env_directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::new(format!("error,{}=info", OUTCOME_TARGET)),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(TerminalFormatter)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install global subscriber")?;

    // Caller must hold the guard or buffered lines are lost
    Ok(guard)
}

// --- Formatters ---

/// Collects the message plus the structured fields as `key=value` pairs.
#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl EventVisitor {
    fn render(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{} {}", self.message, fields.join(" "))
    }
}

impl tracing::field::Visit for EventVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

fn colorize(msg: String) -> String {
    let paint = |msg: String, word: &str, color: Color| {
        let style = Style::new().fg(color).bold();
        msg.replace(word, &format!("{}", style.paint(word)))
    };

    if msg.contains("CONFIRMED") {
        paint(msg, "CONFIRMED", Color::LightGreen)
    } else if msg.contains("FAILED") {
        paint(msg, "FAILED", Color::LightRed)
    } else if msg.contains("RETIRED") {
        paint(msg, "RETIRED", Color::LightYellow)
    } else {
        msg
    }
}

pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        write!(writer, "{}", colorize(visitor.render()))?;
        writeln!(writer)
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = event.metadata().level();

        write!(writer, "{} [{}] ", timestamp, level)?;

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.render())
    }
}

//! Console log formatting for the wharf tool.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output.
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_YELLOW: &str = "\x1b[93m";
const COLOR_RED: &str = "\x1b[91m";
const COLOR_GRAY: &str = "\x1b[90m";

/// Column width for the originating module.
const TARGET_WIDTH: usize = 22;

/// Log line formatter: timestamp, padded module column, level, message.
pub struct WharfLogFormatter {
    color_enabled: bool,
}

impl WharfLogFormatter {
    pub fn new() -> Self {
        Self {
            color_enabled: is_terminal(),
        }
    }

    /// Fixed-width module column so messages line up.
    fn format_target(&self, target: &str) -> String {
        if target.len() > TARGET_WIDTH {
            format!("…{}", &target[target.len() - TARGET_WIDTH + 1..])
        } else {
            format!("{target:<TARGET_WIDTH$}")
        }
    }

    fn level_tag(&self, level: &tracing::Level) -> &'static str {
        match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN ",
            tracing::Level::INFO => "ℹ INFO ",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        }
    }

    fn level_color(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_RED,
            tracing::Level::WARN => COLOR_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for WharfLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();
        let target = self.format_target(event.metadata().target());

        let color = self.level_color(level);
        let reset = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{cyan}[{timestamp}]{reset} [{target}] [{color}{}{reset}] ",
            self.level_tag(level)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Whether stdout looks like a terminal that understands colors.
fn is_terminal() -> bool {
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

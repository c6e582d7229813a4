use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for alignment
const COMPONENT_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 7;

/// `[timestamp] [component] [level] spans: message` formatter for the probe
pub struct DevlinkLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl DevlinkLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Component column: explicit `component` field, else the devlink crate
    /// the event came from, else the service name
    fn format_component(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(comp) => format!("devlink-{}", comp),
            None => match target.split("::").next() {
                Some("devlink_idle") => "devlink-idle".to_string(),
                Some("devlink_session") => "devlink-session".to_string(),
                _ => self.service_name.clone(),
            },
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH)
    }

    fn get_color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for DevlinkLogFormatter
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
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let component = self.format_component(visitor.component.as_deref(), metadata.target());
        let formatted_level = self.format_log_level(level);

        let color = self.get_color_for_level(level);
        let reset_color = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan_color = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}]{} [{}] [{}{}{}] ",
            cyan_color, timestamp, reset_color, component, color, formatted_level, reset_color
        )?;

        // session{id=7} idle_watcher: ...
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(writer, " ")?;
                }
                first = false;

                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
            if !first {
                write!(writer, ": ")?;
            }
        }

        writeln!(writer, "{}", visitor.message)
    }
}

/// Visitor to extract the message and component fields from an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                let comp_str = format!("{:?}", value);
                self.component = Some(comp_str.trim_matches('"').to_string());
            }
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Colour only when stderr is a terminal that is not `dumb`
fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) if term != "dumb" => std::io::stderr().is_terminal(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> DevlinkLogFormatter {
        DevlinkLogFormatter {
            service_name: "devlink-probe".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_component_from_target() {
        let f = formatter();
        assert_eq!(
            f.format_component(None, "devlink_session::manager").trim_end(),
            "devlink-session"
        );
        assert_eq!(f.format_component(None, "devlink_idle::timer").trim_end(), "devlink-idle");
        assert_eq!(f.format_component(None, "devlink::device").trim_end(), "devlink-probe");
    }

    #[test]
    fn test_component_field_wins_and_is_padded() {
        let f = formatter();
        let name = f.format_component(Some("login"), "devlink_session::session");
        assert_eq!(name, format!("{:<16}", "devlink-login"));
    }

    #[test]
    fn test_long_component_is_truncated() {
        let f = formatter();
        let name = f.format_component(Some("a-very-long-component"), "devlink");
        assert_eq!(name.chars().count(), COMPONENT_WIDTH);
        assert!(name.ends_with('…'));
    }

    #[test]
    fn test_no_color_when_disabled() {
        let f = formatter();
        assert_eq!(f.get_color_for_level(&tracing::Level::ERROR), "");
        assert_eq!(f.format_log_level(&tracing::Level::WARN), "⚠ WARN ");
    }
}

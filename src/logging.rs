use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Stdout formatter for watching a soak run scroll by.
///
/// Log lines come from many subsystems at once here (the reconnect worker,
/// each physical transport's reader, the inactivity timers, the stub
/// broker, the bench loop), so every line is prefixed with a short
/// component tag derived from the event's target module, right-aligned so
/// messages line up:
///
/// ```text
///   failover transport failure detected: I/O error: connection reset
///   failover connected
///      bench broker resumed
/// ```
///
/// Severity picks the tint; timestamps and full targets stay in the
/// detailed file layer.
pub struct ComponentFormatter;

/// Last module segment of a target, e.g. `openwire_failover::failover` →
/// `failover`.
fn component_of(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for ComponentFormatter
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
        let metadata = event.metadata();

        let mut message = String::new();
        let mut buf_writer = Writer::new(&mut message);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let tag = format!("{:>10}", component_of(metadata.target()));
        let line = match *metadata.level() {
            Level::ERROR => format!("{} {}", tag.red().bold(), message.red()),
            Level::WARN => format!("{} {}", tag.yellow().bold(), message.yellow()),
            Level::INFO => format!("{} {}", tag.green(), message.normal()),
            Level::DEBUG => format!("{} {}", tag.blue(), message.dimmed()),
            Level::TRACE => format!("{} {}", tag.purple(), message.dimmed()),
        };
        writeln!(writer, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_is_the_last_target_segment() {
        assert_eq!(component_of("openwire_failover::failover"), "failover");
        assert_eq!(component_of("openwire_failover::transport::tcp"), "tcp");
        assert_eq!(component_of("failover_bench"), "failover_bench");
    }
}

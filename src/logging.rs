//! Custom logging formatter with hostname and rank prefix
//!
//! Shuffle log lines from a multi-node run are only readable when every
//! line says where it came from. This module provides a tracing formatter
//! that prefixes each event with the hostname and the shuffle rank, with
//! no ANSI color codes so output files from different ranks can be merged.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Rank shown in the log prefix, set once at shuffle init.
///
/// -1 until a rank is known; the formatter omits the rank field then.
static LOG_RANK: AtomicI32 = AtomicI32::new(-1);

/// Record the shuffle rank for the log prefix.
pub fn set_log_rank(rank: i32) {
    LOG_RANK.store(rank, Ordering::Relaxed);
}

/// Custom event formatter with hostname and rank prefix
pub struct RankFormatter {
    hostname: String,
}

impl RankFormatter {
    pub fn new() -> Self {
        let hostname = gethostname::gethostname()
            .to_str()
            .unwrap_or("unknown")
            .to_string();
        Self { hostname }
    }
}

impl Default for RankFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for RankFormatter
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
        let meta = event.metadata();

        let now = std::time::SystemTime::now();
        let datetime: chrono::DateTime<chrono::Utc> = now.into();

        let rank = LOG_RANK.load(Ordering::Relaxed);
        if rank >= 0 {
            write!(writer, "[{} r{}] ", self.hostname, rank)?;
        } else {
            write!(writer, "[{}] ", self.hostname)?;
        }

        write!(writer, "{} ", datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
        write!(writer, "{:5} ", meta.level())?;

        // Span context on one line, outermost first
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, ":")?;
            }
            write!(writer, " ")?;
        }

        write!(writer, "{}: ", meta.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Initialize tracing with the hostname/rank formatter.
pub fn init_with_hostname(level: &str) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .event_format(RankFormatter::new())
        .with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    let hostname_os = gethostname::gethostname();
    let hostname = hostname_os.to_str().unwrap_or("unknown");
    tracing::info!("Logging initialized on host: {}", hostname);
}

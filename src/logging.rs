use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

/// One event per line: `LEVEL message`, or just `message` without the level.
#[derive(Debug, Clone, Copy)]
pub struct PlainFormat {
    pub level: bool,
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if self.level {
            write!(writer, "{} ", event.metadata().level())?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Console gets bare messages, the log file gets `LEVEL message`.
/// The file is truncated; the guard flushes it when dropped.
pub fn build(
    log_dir: &Path,
    log_name: &str,
) -> Result<(impl Subscriber + Send + Sync + 'static, WorkerGuard)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let path = log_dir.join(log_name);
    let file = File::create(&path).with_context(|| format!("open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().event_format(PlainFormat { level: false });

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .event_format(PlainFormat { level: true });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer);
    Ok((subscriber, guard))
}

/// Installs the subscriber globally; keep the guard alive until exit.
pub fn init(log_dir: &Path, log_name: &str) -> Result<WorkerGuard> {
    let (subscriber, guard) = build(log_dir, log_name)?;
    subscriber.try_init().context("install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, warn};

    #[test]
    fn file_lines_are_level_then_message_and_start_fresh() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run.log"), "stale line from an old run\n").unwrap();

        let (subscriber, guard) = build(dir.path(), "run.log").unwrap();
        tracing::subscriber::with_default(subscriber, || {
            info!("Epoch: {}", 0);
            warn!("no images to evaluate in {}", "val");
        });
        drop(guard);

        let contents = fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert_eq!(contents, "INFO Epoch: 0\nWARN no images to evaluate in val\n");
    }

    #[test]
    fn missing_log_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("log").join("deep");
        let (_subscriber, guard) = build(&nested, "a.log").unwrap();
        drop(guard);
        assert!(nested.join("a.log").exists());
    }
}

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "isx_stream=info,isx_stream_cli=info,warn";

/// Install the global subscriber, logging to stderr and, if `path` is given,
/// to a file.
pub(crate) fn initiate_logging<P: AsRef<std::path::Path>>(path: Option<P>) -> anyhow::Result<()> {
    // Fixed offset from the timezone at startup.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::create(path)?;
        let file_writer = std::sync::Mutex::new(file);
        Some(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(file_writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_writer(std::io::stderr)
        .with_ansi(!cfg!(windows));

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    let log_var = if let Ok(var) = std::env::var("RUST_LOG") {
        format!(" with RUST_LOG=\"{var}\".")
    } else {
        format!(" with default filter \"{DEFAULT_FILTER}\".")
    };
    if let Some(path) = &path {
        tracing::debug!(
            "Logging initiated to file \"{}\"{log_var}",
            path.as_ref().display()
        );
    }
    tracing::debug!("Logging initiated to console{log_var}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_valid() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isx-stream.log");
        // Only one global subscriber can be installed per process.
        let _ = initiate_logging(Some(&path));
        assert!(path.exists());
    }
}

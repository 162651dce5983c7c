//! Logging for boardmon.
//!
//! Board lifecycle is logged at `info` by the daemon, interface and device
//! changes at `debug`, and every raw hotplug record at `trace`. The library
//! never installs a subscriber; `boardmond` calls [`init_journald_or_stdout`]
//! once at startup.
//!
//! Modules `use crate::tracing::prelude::*` for the logging macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Filter directives for stdout logging, e.g. "boardmon=trace". Takes
/// precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "BOARDMON_LOG";

/// Install the process-wide subscriber.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald, tagged with
/// `identifier`. Otherwise they go to stdout, filtered by [`LOG_ENV`] or
/// `RUST_LOG` with INFO as the default level.
pub fn init_journald_or_stdout(identifier: &str) {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry()
                .with(layer.with_syslog_identifier(identifier.to_owned()))
                .init(),
            Err(e) => {
                use_stdout();
                error!(error = %e, "Failed to initialize journald logging, using stdout.");
            }
        }
    } else {
        use_stdout();
    }
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(stdout_filter(env::var(LOG_ENV).ok()))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

/// `directives` when given, else `RUST_LOG`. Invalid directives are skipped.
fn stdout_filter(directives: Option<String>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    match directives {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.with_env_var("RUST_LOG").from_env_lossy(),
    }
}

// Local wall-clock time with milliseconds. Hotplug sequences (serial port
// gone, bootloader up 200 ms later) are hard to read at one-second
// resolution.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_monitor_directives() {
        let filter = stdout_filter(Some("boardmon=trace".into()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_empty_directives_default_to_info() {
        let filter = stdout_filter(Some(String::new()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_timer_has_millisecond_resolution() {
        let mut out = String::new();
        LocalTimer.format_time(&mut Writer::new(&mut out)).unwrap();
        // hh:mm:ss.mmm
        assert_eq!(out.len(), 12);
        assert_eq!(out.as_bytes()[8], b'.');
    }
}

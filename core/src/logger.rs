use chrono::{DateTime, Utc};
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::format::{Format, Writer},
    EnvFilter,
};

use crate::{
    clock::Clock,
    config::{ConfigError, SyncConfig},
};

/// Stamps log lines in the same UTC offset the repository writes timestamps in.
struct ClockTimer {
    clock: Clock,
}

fn format_timestamp(clock: &Clock, at: DateTime<Utc>) -> String {
    let local = clock.localize(at);
    format!("{} - {}", local.format("%d %B"), local.format("%H:%M:%S%.6f %:z"))
}

impl tracing_subscriber::fmt::time::FormatTime for ClockTimer {
    fn format_time(&self, writer: &mut Writer<'_>) -> std::fmt::Result {
        write!(writer, "{}", format_timestamp(&self.clock, Utc::now()))
    }
}

/// Installs the global subscriber; `RUST_LOG` directives are layered on top of `log_level`.
pub fn setup_logger(log_level: LevelFilter, clock: Clock) {
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let format =
        Format::default().with_timer(ClockTimer { clock }).with_level(true).with_target(false);

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(filter).event_format(format).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("Logger has already been set up, continuing...");
    }
}

pub fn setup_info_logger() {
    setup_logger(LevelFilter::INFO, Clock::default());
}

/// Logs every generated statement and chunk dispatch.
pub fn setup_debug_logger() {
    setup_logger(LevelFilter::DEBUG, Clock::default());
}

/// Uses the configured `log_level` and `timezone`.
pub fn setup_config_logger(config: &SyncConfig) -> Result<(), ConfigError> {
    setup_logger(config.log_level()?, config.clock()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_timestamp_uses_clock_offset() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 17, 0, 0).unwrap();

        assert_eq!(format_timestamp(&Clock::default(), at), "05 March - 14:00:00.000000 -03:00");

        let utc = Clock::from_offset_str("UTC").unwrap();
        assert_eq!(format_timestamp(&utc, at), "05 March - 17:00:00.000000 +00:00");
    }

    #[test]
    fn test_setup_twice_is_harmless() {
        let config = SyncConfig { log_level: "debug".to_string(), ..SyncConfig::default() };

        setup_config_logger(&config).unwrap();
        setup_info_logger();
        tracing::info!("logger ready");
    }
}

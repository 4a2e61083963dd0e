use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use log::{Level, LevelFilter};
use once_cell::sync::Lazy;

/// Consulted in this order; both take env_logger directive lists.
const ENV_VARS: [&str; 2] = ["EDVS_LOG", "RUST_LOG"];

static RUST_LOG_ONCE: Once = Once::new();
static ENV_LEVEL: Lazy<LevelFilter> = Lazy::new(|| {
    ENV_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|directives| default_level(&directives))
        .unwrap_or(LevelFilter::Info)
});

/// Default session level from `EDVS_LOG`/`RUST_LOG`, `info` when neither has one.
pub fn env_level() -> LevelFilter {
    *ENV_LEVEL
}

/// The bare level of a directive list such as `warn,edvs_rs::decoder=trace`.
fn default_level(directives: &str) -> Option<LevelFilter> {
    directives
        .split(',')
        .filter(|directive| !directive.contains('='))
        .find_map(|directive| parse_level(Some(directive)))
}

fn level_from_usize(value: usize) -> LevelFilter {
    match value {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Parse an optional level name, e.g. from a config file. Case and
/// surrounding blanks are ignored.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Install the stderr logger for binaries.
///
/// Module directives from `RUST_LOG` and then `EDVS_LOG` are applied on top of
/// [`env_level`], so `EDVS_LOG` wins where both name a module.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(env_level());
        for var in ENV_VARS.iter().rev() {
            if let Ok(directives) = std::env::var(var) {
                builder.parse_filters(&directives);
            }
        }
        builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true);
        if builder.try_init().is_err() {
            log::debug!("logger already installed, keeping it");
        }
    });
}

/// Per-device logging handle.
///
/// Every acquisition session owns one of these and hands it to the decoder and
/// the acquisition thread. Records below the session level are discarded before
/// they reach the `log` facade, so one noisy device can be silenced without
/// touching the global filter. Records that pass are prefixed with the device
/// string.
#[derive(Debug)]
pub struct SessionLog {
    device: String,
    level: AtomicUsize,
}

impl SessionLog {
    pub fn new(device: impl Into<String>, level: LevelFilter) -> Self {
        Self {
            device: device.into(),
            level: AtomicUsize::new(level as usize),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn level(&self) -> LevelFilter {
        level_from_usize(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(level, "{}: {}", self.device, args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_level_filters_records() {
        let log = SessionLog::new("eDVS4337 ID-1", LevelFilter::Warn);
        assert!(log.enabled(Level::Error));
        assert!(log.enabled(Level::Warn));
        assert!(!log.enabled(Level::Info));

        log.set_level(LevelFilter::Trace);
        assert_eq!(log.level(), LevelFilter::Trace);
        assert!(log.enabled(Level::Trace));

        log.set_level(LevelFilter::Off);
        assert!(!log.enabled(Level::Error));
    }

    #[test]
    fn parse_level_accepts_known_names() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some("WARN")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
        assert_eq!(parse_level(Some(" info ")), Some(LevelFilter::Info));
        assert_eq!(parse_level(Some("")), None);
    }

    #[test]
    fn default_level_skips_module_directives() {
        assert_eq!(
            default_level("edvs_rs::decoder=trace,warn"),
            Some(LevelFilter::Warn)
        );
        assert_eq!(default_level("edvs_rs=debug"), None);
        assert_eq!(default_level("debug"), Some(LevelFilter::Debug));
    }
}

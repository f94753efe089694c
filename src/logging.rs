//! Logging for driver processes.
//!
//! Drivers log through the `log` facade. [`init`] installs a plain stderr
//! logger; the level is taken from the `DRV_LOG` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`), defaulting to `info`.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct DriverLogger;

static LOGGER: DriverLogger = DriverLogger;

impl Log for DriverLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let level = match record.level() {
			Level::Error => "ERROR",
			Level::Warn => "WARNING",
			Level::Info => "INFO",
			Level::Debug => "DEBUG",
			Level::Trace => "TRACE",
		};

		let mut stderr = std::io::stderr().lock();
		let _ = writeln!(stderr, "[{}][{}] {}", record.target(), level, record.args());
	}

	fn flush(&self) {}
}

/// Installs the process-wide logger. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
	let level = std::env::var("DRV_LOG")
		.ok()
		.and_then(|v| v.parse::<LevelFilter>().ok())
		.unwrap_or(LevelFilter::Info);

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

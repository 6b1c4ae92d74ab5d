//! Logging infrastructure.
//!
//! Provides logging via the `log` crate, writing colored, timestamped lines
//! to stderr. Hosted equivalent of the firmware logger this crate descends
//! from: the same manual `log::Log` implementation and level-tag styling,
//! with the TSC-based boot timestamp replaced by a [`std::time::Instant`]
//! elapsed clock (there is no CBMEM console or framebuffer on a host).

use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, LevelFilter, Metadata, Record};

static START: OnceLock<Instant> = OnceLock::new();

/// Elapsed time since [`init`] was called, in milliseconds.
fn elapsed_ms() -> u128 {
    START.get().map(|start| start.elapsed().as_millis()).unwrap_or(0)
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_str = if is_tty() {
            match record.level() {
                Level::Error => "\x1b[31mERROR\x1b[0m",
                Level::Warn => "\x1b[33mWARN \x1b[0m",
                Level::Info => "\x1b[32mINFO \x1b[0m",
                Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                Level::Trace => "\x1b[35mTRACE\x1b[0m",
            }
        } else {
            match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            }
        };

        eprintln!("[{:>10}ms] [{}] {}", elapsed_ms(), level_str, record.args());
    }

    fn flush(&self) {}
}

fn is_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stderr().is_terminal()
}

static LOGGER: StderrLogger = StderrLogger;

/// Install the logger process-wide, at [`LevelFilter::Info`]. A second call
/// is a silent no-op, so a host application that has already installed its
/// own `log::Log` implementation is left alone.
pub fn init() {
    START.get_or_init(Instant::now);
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));
}

/// Change the maximum log level. Has no effect if this crate's logger
/// wasn't the one installed.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

//! Process-wide structured logging.
//!
//! The supervisor installs one slog drain during boot: a compact terminal
//! drain for foreground runs or a full-format file drain for service runs.
//! Components log through `slog_scope` with snake_case event names and
//! structured field pairs.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, Once};

use slog::Drain;

use crate::error::Result;

fn resolve_level(verbose: bool) -> log::LevelFilter {
    let fallback = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    match std::env::var("RUST_LOG") {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

static LOGGER_GUARD: Mutex<Option<slog_scope::GlobalLoggerGuard>> = Mutex::new(None);
static STDLOG_INIT: Once = Once::new();

/// Install `logger` as the process-wide drain, replacing any previous one,
/// and bridge the `log` crate into it. The config-selected drain installed
/// by the supervisor replaces the terminal drain installed at startup.
fn install(logger: slog::Logger, level: log::LevelFilter) {
    let mut slot = LOGGER_GUARD.lock().expect("logger guard lock poisoned");
    // A dropped guard resets the global drain; the replaced one must be
    // defused instead.
    if let Some(previous) = slot.take() {
        previous.cancel_reset();
    }
    *slot = Some(slog_scope::set_global_logger(logger));
    drop(slot);

    STDLOG_INIT.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

/// Compact drain to stderr, for foreground runs.
pub fn init_terminal(verbose: bool) {
    let level = resolve_level(verbose);
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    install(slog::Logger::root(drain, slog::o!()), level);
}

/// Full-format drain appended to `path`, for service runs. The parent
/// directory is created when missing.
pub fn init_file(path: &str, verbose: bool) -> Result<()> {
    let level = resolve_level(verbose);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    install(slog::Logger::root(drain, slog::o!()), level);
    Ok(())
}

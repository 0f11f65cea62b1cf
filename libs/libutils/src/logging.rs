//! logging bootstrap shared by the devmaster binaries
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// build and install a log4rs logger at the given level.
///
/// Safe to call more than once; later calls are no-ops if a logger is
/// already installed (log4rs returns an error we swallow, same as the
/// daemon re-applying `SET_LOG_LEVEL` without a fresh process).
pub fn init(level: LevelFilter) {
    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}"));
    let appender = ConsoleAppender::builder().encoder(encoder).build();

    let config = match Config::builder()
        .appender(Appender::builder().build("console", Box::new(appender)))
        .build(Root::builder().appender("console").build(level))
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("logging: failed to build config: {e}");
            return;
        }
    };

    if log4rs::init_config(config).is_err() {
        // a logger is already installed for this process; nothing to do.
    }
}

/// parse a level name from the environment (`DEBUG`/`UDEV_LOG`), defaulting to `info`
pub fn level_from_str(s: &str) -> LevelFilter {
    match s.to_ascii_lowercase().as_str() {
        "0" | "err" | "error" => LevelFilter::Error,
        "1" | "warn" | "warning" => LevelFilter::Warn,
        "2" | "info" => LevelFilter::Info,
        "3" | "debug" => LevelFilter::Debug,
        "4" | "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

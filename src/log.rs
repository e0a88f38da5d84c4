use std::env;
use std::fmt::Arguments;
use std::io::stderr;
use std::io::Write;

/// Severity for the `log!` macro. The active level comes from the `RDB_LOG`
/// environment variable (`fatal`, `error`, `warn`, `info`, `debug`) and
/// defaults to `warn`. Diagnostics always go to the process' real stderr so
/// they remain visible even while interpreter output is being redirected to
/// the front-end.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

lazy_static! {
    static ref MAX_LEVEL: LogLevel = init_log_level();
}

fn init_log_level() -> LogLevel {
    match env::var("RDB_LOG").as_ref().map(|s| s.as_str()) {
        Ok("fatal") => LogLevel::LogFatal,
        Ok("error") => LogLevel::LogError,
        Ok("warn") => LogLevel::LogWarn,
        Ok("info") => LogLevel::LogInfo,
        Ok("debug") => LogLevel::LogDebug,
        _ => LogLevel::LogWarn,
    }
}

pub fn log_enabled(level: LogLevel) -> bool {
    level <= *MAX_LEVEL
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::LogFatal => "FATAL",
        LogLevel::LogError => "ERROR",
        LogLevel::LogWarn => "WARN",
        LogLevel::LogInfo => "INFO",
        LogLevel::LogDebug => "DEBUG",
    }
}

pub fn write_log(level: LogLevel, module: &str, args: Arguments) {
    // A failed write to stderr is not something we can report anywhere.
    let mut err = stderr();
    let _ = writeln!(err, "[{} {}] {}", level_name(level), module, args);
}

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {{
        let lvl = $level;
        if crate::log::log_enabled(lvl) {
            crate::log::write_log(lvl, module_path!(), format_args!($($arg)*));
        }
    }};
}

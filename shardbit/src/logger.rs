use chrono::Local;
use once_cell::sync::Lazy;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Minimum level emitted, controlled by `SHARDBIT_LOG` (debug|info|warn|error).
static MIN_LEVEL: Lazy<Level> = Lazy::new(|| match std::env::var("SHARDBIT_LOG").ok().as_deref() {
    Some("debug") => Level::Debug,
    Some("warn") => Level::Warn,
    Some("error") => Level::Error,
    _ => Level::Info,
});

fn log(level: Level, tag: &str, args: fmt::Arguments) {
    if level >= *MIN_LEVEL {
        let now = Local::now();
        println!("[{}] {} {}", now.format("%Y-%m-%d %H:%M:%S"), tag, args);
    }
}

pub fn debug(args: fmt::Arguments) {
    log(Level::Debug, "DEBUG", args);
}

pub fn info(args: fmt::Arguments) {
    log(Level::Info, "INFO", args);
}

pub fn warn(args: fmt::Arguments) {
    log(Level::Warn, "WARN", args);
}

pub fn error(args: fmt::Arguments) {
    log(Level::Error, "ERROR", args);
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::logger::debug(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::error(format_args!($($arg)*))
    };
}

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Crit = 4,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Crit => "CRIT",
        }
    }
}

lazy_static! {
    static ref CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
}

static SEQ: AtomicU32 = AtomicU32::new(0);

/// Sets the global log level. Called once at startup from `--debug`.
pub fn set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn current_level() -> LogLevel {
    match CURRENT_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Debug,
        1 => LogLevel::Info,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Crit,
    }
}

pub fn enabled(level: LogLevel) -> bool {
    level >= current_level()
}

#[doc(hidden)]
pub fn next_seq() -> u32 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[doc(hidden)]
pub fn level_tag(level: LogLevel) -> &'static str {
    level.as_str()
}

/// Logs at the given level if it passes the global threshold. `Crit`
/// always passes. Mirrors cwdbg's `LOG(level, fmt, ...)` macro.
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::log::enabled($level) {
            eprintln!(
                "[{:06}] [{}] {}",
                $crate::log::next_seq(),
                $crate::log::level_tag($level),
                format!($($arg)*)
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crit_always_enabled() {
        set_level(LogLevel::Crit);
        assert!(enabled(LogLevel::Crit));
        assert!(!enabled(LogLevel::Debug));
        set_level(LogLevel::Info);
    }

    #[test]
    fn ordering_is_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Crit);
    }
}

use core::fmt::{self, Write};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::sync::UninterruptibleSpinlock;

pub const MAX_LOG_SINKS: usize = 4;

/// A destination for log output, e.g. a secure UART.
///
/// Sinks are called without any logger lock held, but possibly with interrupts masked, so writes must not block.
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

static OUT_SINKS: UninterruptibleSpinlock<[Option<&'static dyn LogSink>; MAX_LOG_SINKS]> =
    UninterruptibleSpinlock::new([None; MAX_LOG_SINKS]);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static USE_COLOR: AtomicBool = AtomicBool::new(true);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Critical,
        LogLevel::Error,
        LogLevel::Warning,
        LogLevel::Notice,
        LogLevel::Info,
        LogLevel::Debug
    ];

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Critical => "CRIT",
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WARN",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG"
        }
    }

    /// The SGR parameters used to colour this level's name.
    pub fn color(self) -> &'static str {
        match self {
            LogLevel::Critical => "1;31",
            LogLevel::Error => "31",
            LogLevel::Warning => "33",
            LogLevel::Notice => "36",
            LogLevel::Info => "97",
            LogLevel::Debug => "37"
        }
    }

    /// Parses the long lowercase name of a level, as used in the options string.
    pub fn from_name(name: &str) -> Option<LogLevel> {
        match name {
            "critical" => Some(LogLevel::Critical),
            "error" => Some(LogLevel::Error),
            "warning" => Some(LogLevel::Warning),
            "notice" => Some(LogLevel::Notice),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkTableFull;

impl fmt::Display for SinkTableFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} log sink slots are in use", MAX_LOG_SINKS)
    }
}

pub fn add_sink(out: &'static dyn LogSink) -> Result<(), SinkTableFull> {
    OUT_SINKS.with_lock(|sinks| match sinks.iter_mut().find(|sink| sink.is_none()) {
        Some(slot) => {
            *slot = Some(out);
            Ok(())
        },
        None => Err(SinkTableFull)
    })
}

pub fn remove_sink(out: &'static dyn LogSink) {
    OUT_SINKS.with_lock(|sinks| {
        for sink in sinks.iter_mut() {
            if sink.map_or(false, |sink| ptr::eq(sink as *const _ as *const (), out as *const _ as *const ())) {
                *sink = None;
            }
        }
    });
}

pub fn set_max_level(lvl: LogLevel) {
    MAX_LEVEL.store(lvl as u8, Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::ALL[MAX_LEVEL.load(Ordering::Relaxed) as usize]
}

pub fn set_color(color: bool) {
    USE_COLOR.store(color, Ordering::Relaxed);
}

pub fn enabled(lvl: LogLevel) -> bool {
    lvl <= max_level()
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

pub fn log_msg(lvl: LogLevel, module: &str, msg: fmt::Arguments) {
    if !enabled(lvl) {
        return;
    }

    // Sinks are copied out so that a slow sink never holds up another core that wants to register or log.
    let sinks = *OUT_SINKS.lock();
    let color = USE_COLOR.load(Ordering::Relaxed);

    for sink in sinks.iter().flatten() {
        let mut w = SinkWriter(*sink);

        let _ = if color {
            writeln!(w, "[\x1b[{}m{}\x1b[0m] {}: {}", lvl.color(), lvl.name(), module, msg)
        } else {
            writeln!(w, "[{}] {}: {}", lvl.name(), module, msg)
        };
    }
}

#[macro_export]
macro_rules! log {
    ($lvl:ident, $module:expr, $msg:literal $(, $arg:expr)* $(,)?) => {
        $crate::log::log_msg($crate::log::LogLevel::$lvl, $module, ::core::format_args!($msg $(, $arg)*))
    };
}

//! Kernel-style print macros for ufiber
//!
//! Leveled, line-atomic output to stderr in the manner of printk.
//!
//! # Environment Variables
//!
//! - `UFIBER_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0-5
//! - `UFIBER_LOG_FLUSH=1` - Flush stderr after every line (for crashes mid-switch)
//!
//! # Usage
//!
//! ```ignore
//! use ufiber_core::{kdebug, kinfo, kwarn};
//!
//! kinfo!("process {} cleaned up", pid);
//! kdebug!("fiber {} created by thread {}", fid, tid);
//! kwarn!("switch to {} refused: busy", fid);
//! ```
//!
//! Every leveled line is tagged with a context string supplied by
//! [`set_context_tag`]; the runtime installs one that names the fiber the
//! calling thread is executing. A line at warn level looks like
//!
//! ```text
//! [WARN ] ufiber[t4711/f3]: switch to 5 refused: busy
//! ```

use std::fmt::Write as _;
use std::io::Write;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Once;

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

const LEVELS: [LogLevel; 6] = [
    LogLevel::Off,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

const NAMES: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

impl LogLevel {
    /// Level for a raw value; anything above trace saturates to trace
    pub fn from_u8(v: u8) -> Self {
        LEVELS[usize::from(v).min(LEVELS.len() - 1)]
    }

    /// Parse a level name or digit; `None` for anything unrecognised
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(v) = s.parse::<u8>() {
            return LEVELS.get(usize::from(v)).copied();
        }
        NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(s))
            .map(|i| LEVELS[i])
    }

    #[inline]
    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }
}

/// Writes a short context tag (e.g. `t1234/f3`) into the buffer
pub type ContextTagFn = fn(&mut String);

// Packed logger state: low 3 bits level, FLUSH_BIT for per-line flush
const LEVEL_MASK: u8 = 0b0000_0111;
const FLUSH_BIT: u8 = 0b1000_0000;

static STATE: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static ENV_ONCE: Once = Once::new();
static CONTEXT_TAG: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

/// Read `UFIBER_LOG_LEVEL` / `UFIBER_LOG_FLUSH`
///
/// Runs once, on first use of the logger. Programmatic setters also force
/// it first so a later environment read never overrides them.
pub fn init() {
    ENV_ONCE.call_once(|| {
        let level = std::env::var("UFIBER_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Warn);
        let flush = crate::env::env_get_bool("UFIBER_LOG_FLUSH", false);
        STATE.store(level as u8 | if flush { FLUSH_BIT } else { 0 }, Ordering::Relaxed);
    });
}

#[inline]
fn state() -> u8 {
    init();
    STATE.load(Ordering::Relaxed)
}

fn update(f: impl Fn(u8) -> u8) {
    init();
    let _ = STATE.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(f(s)));
}

#[inline]
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(state() & LEVEL_MASK)
}

#[inline]
pub fn flush_enabled() -> bool {
    state() & FLUSH_BIT != 0
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    update(|s| (s & !LEVEL_MASK) | level as u8);
}

pub fn set_flush_enabled(enabled: bool) {
    update(|s| if enabled { s | FLUSH_BIT } else { s & !FLUSH_BIT });
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Install the function that tags each leveled line
pub fn set_context_tag(f: ContextTagFn) {
    CONTEXT_TAG.store(f as *mut (), Ordering::Release);
}

fn push_context_tag(line: &mut String) {
    let raw = CONTEXT_TAG.load(Ordering::Acquire);
    if raw.is_null() {
        return;
    }
    // SAFETY: only ever stored from a `ContextTagFn` in `set_context_tag`.
    let tag: ContextTagFn = unsafe { std::mem::transmute::<*mut (), ContextTagFn>(raw) };
    let open = line.len();
    line.push('[');
    tag(line);
    if line.len() == open + 1 {
        line.truncate(open);
    } else {
        line.push(']');
    }
}

/// Single write of a finished line so output from different threads
/// never interleaves
fn emit(line: &str) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(line.as_bytes());
    if flush_enabled() {
        let _ = err.flush();
    }
}

/// Leveled line: `[LEVEL] ufiber[tag]: message`
fn format_line(level: LogLevel, args: std::fmt::Arguments<'_>) -> String {
    let mut line = String::with_capacity(96);
    let _ = write!(line, "[{:<5}] ufiber", level.name().to_ascii_uppercase());
    push_context_tag(&mut line);
    let _ = writeln!(line, ": {}", args);
    line
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>, newline: bool) {
    let mut line = args.to_string();
    if newline {
        line.push('\n');
    }
    emit(&line);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(&format_line(level, args));
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline, no level filter)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::_kprint_impl(format_args!($($arg)*), false)
    };
}

/// Print a line to stderr (no level filter)
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprint_impl(format_args!(""), true)
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprint_impl(format_args!($($arg)*), true)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror { ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) }; }

#[macro_export]
macro_rules! kwarn { ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) }; }

#[macro_export]
macro_rules! kinfo { ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) }; }

/// Debug level: conversions, creations, refused switches
#[macro_export]
macro_rules! kdebug { ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) }; }

/// Trace level: every switch
#[macro_export]
macro_rules! ktrace { ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) }; }

//! ufiber configuration
//!
//! Compile-time defaults (`defaults`) with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use ufiber_runtime::config::FiberConfig;
//!
//! let config = FiberConfig::from_env().stack_size(1 << 20);
//! config.validate()?;
//! ```

pub mod defaults;

use ufiber_core::env::{env_get, env_get_bool, env_get_size};

/// Engine and façade configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Usable stack size for fibers with façade-allocated stacks
    pub stack_size: usize,
    /// Guard pages below each allocated stack
    pub guard_pages: usize,
    /// Emit a trace line for every switch
    pub log_switches: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl FiberConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `UFIBER_STACK_SIZE` - Stack size, bytes or with a k/M suffix
    /// - `UFIBER_GUARD_PAGES` - Guard pages per stack
    /// - `UFIBER_LOG_SWITCHES` - Trace every switch (0/1)
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get_size("UFIBER_STACK_SIZE", defaults::STACK_SIZE),
            guard_pages: env_get("UFIBER_GUARD_PAGES", defaults::GUARD_PAGES),
            log_switches: env_get_bool("UFIBER_LOG_SWITCHES", defaults::LOG_SWITCHES),
        }
    }

    /// Create config with explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            guard_pages: defaults::GUARD_PAGES,
            log_switches: defaults::LOG_SWITCHES,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn guard_pages(mut self, pages: usize) -> Self {
        self.guard_pages = pages;
        self
    }

    pub fn log_switches(mut self, enable: bool) -> Self {
        self.log_switches = enable;
        self
    }

    /// Whether switch tracing is on (config or `debug-logging` feature)
    #[inline]
    pub fn trace_switches(&self) -> bool {
        self.log_switches || cfg!(feature = "debug-logging")
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < defaults::MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.stack_size % 16 != 0 {
            return Err(ConfigError::InvalidValue("stack_size must be a multiple of 16"));
        }
        if self.guard_pages > 256 {
            return Err(ConfigError::InvalidValue("guard_pages must be <= 256"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprint!("{}", self);
    }
}

impl std::fmt::Display for FiberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ufiber configuration:")?;
        writeln!(f, "  stack_size:    {}", self.stack_size)?;
        writeln!(f, "  guard_pages:   {}", self.guard_pages)?;
        writeln!(f, "  log_switches:  {}", self.trace_switches())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

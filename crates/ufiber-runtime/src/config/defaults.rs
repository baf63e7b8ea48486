//! Library defaults for [`FiberConfig`](super::FiberConfig)

/// Stack size for fibers whose stack the façade allocates (256 KiB)
pub const STACK_SIZE: usize = 256 * 1024;

/// Smallest stack the façade accepts (16 KiB)
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// PROT_NONE pages below each allocated stack
pub const GUARD_PAGES: usize = 1;

/// Trace every switch (also forced on by the `debug-logging` feature)
pub const LOG_SWITCHES: bool = false;

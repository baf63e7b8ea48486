//! # ufiber-core
//!
//! Core types for the ufiber engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code or
//! assembly. The registry, the context-switch primitive and the engine live
//! in `ufiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Process, thread and fiber identifiers; fiber-id counter
//! - `state` - Fiber ownership state and its atomic cell
//! - `error` - Error taxonomy
//! - `bitmap` - Fixed-size bitmaps
//! - `fls` - Fiber-local storage allocator
//! - `metrics` - Per-fiber lifecycle counters
//! - `spinlock` - Spin-guarded cell for owner-only data
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod bitmap;
pub mod fls;
pub mod metrics;
pub mod spinlock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{FiberId, FiberIdCounter, ProcessId, ThreadId};
pub use state::{FiberState, OwnerCell};
pub use error::{FiberError, FiberResult};
pub use fls::{FiberLocals, FlsTable, FLS_CAPACITY};
pub use metrics::{FiberMetrics, MetricsSnapshot};
pub use spinlock::SpinCell;
pub use env::{env_get, env_get_bool, env_get_size};

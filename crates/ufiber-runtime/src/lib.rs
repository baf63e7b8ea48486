//! # ufiber-runtime
//!
//! Platform-specific runtime for the ufiber engine.
//!
//! This crate provides:
//! - The process/thread/fiber registry
//! - The fiber engine (convert, create, switch, FLS routing, exit, cleanup)
//! - Context capture and hand-off (architecture-specific assembly)
//! - Guarded stack mappings
//! - Read-only fiber snapshots

pub mod arch;
pub mod clock;
pub mod config;
pub mod engine;
pub mod fiber;
pub mod introspect;
pub mod memory;
pub mod registry;
pub mod tls;

// Re-exports
pub use config::{ConfigError, FiberConfig};
pub use engine::FiberEngine;
pub use fiber::{Fiber, FiberEntry, StackDescriptor, StackOwnership};
pub use introspect::FiberInfo;
pub use memory::{FiberStack, StackError};
pub use registry::{Process, Registry, Thread};

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod platform_linux;
        pub use platform_linux::LinuxPlatform as CurrentPlatform;
    } else {
        compile_error!("Unsupported platform");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

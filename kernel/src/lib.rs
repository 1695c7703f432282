//! A demand-paged virtual-memory manager for a simulated single-CPU machine.
//!
//! Processes share a small pool of physical frames and a small translation
//! cache. Pages are loaded on first touch, evicted with a second-chance clock
//! when frames run out, and written to a swap extent when dirty.

pub mod config;
pub mod machine;
pub mod mem;
pub mod random;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod threading;
pub mod user_program;
pub mod vm_error;

pub use config::{ConfigError, KernelConfig, ReplacementKind};
pub use system::{VmKernel, VmStats};
pub use user_program::{Executable, ExecutableImage, RunningProcess, VmProcess};
pub use vm_error::{Severity, VmError};

//! Steve - a stack-based IR virtual machine
//!
//! This library provides the interpreter, the native fast path for
//! straight-line programs, and the interactive debugger.

pub mod config;
pub mod debugger;
#[cfg(feature = "jit")]
pub mod jit;
pub mod language;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig};
pub use language::{Language, MessageKey};
pub use vm::{Value, VirtualMachine, VmError};

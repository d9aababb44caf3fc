//! Native code generation for straight-line programs.
//!
//! - Executable memory (mmap, then mprotect to read-execute)
//! - Code buffer with rel32 label patching
//! - x86-64 instruction encoding
//! - Round-robin register allocation
//! - The compiler and its calling convention
//!
//! Only compiled with the `jit` feature (on by default).

mod codebuf;
pub mod compiler;
mod memory;
mod regalloc;
mod x86_64;

pub use compiler::{CompiledProgram, JitCompiler, JitError, can_jit_compile};
pub use memory::MemoryError;

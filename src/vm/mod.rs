pub mod alloc;
pub mod builtins;
pub mod debug;
mod error;
pub mod gc;
pub mod instruction;
pub mod objects;
mod ops;
mod value;
mod vm;

pub use alloc::{Allocator, SharedAllocator, SystemAllocator, TieredPool};
pub use debug::{Breakpoint, DebugCommand, DebugEvent, DebugState};
pub use error::{LoadError, SourceLocation, VmError};
pub use gc::{GarbageCollector, GcHandle, GcStats};
pub use instruction::{Instruction, InstructionType, dump_json, parse_ir};
pub use ops::{binary_op, unary_op};
pub use value::{ObjectId, PointerTarget, PointerValue, Value};
pub use vm::{MachineState, Registers, SharedOutput, VirtualMachine, VmStatus};

//! Round-robin register allocator.
//!
//! Hands out the 14 allocatable registers in turn with RSP/RBP reserved.
//! There is no spilling: once the ring wraps a register is reused whether or
//! not its old value is still wanted. The compiler keeps values on the
//! machine stack between instructions, so a register only has to survive the
//! instruction that allocated it.

use super::x86_64::Reg;

pub const ALLOCATABLE: [Reg; 14] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

#[derive(Debug, Default)]
pub struct RegisterAllocator {
    next: usize,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Reg {
        let reg = ALLOCATABLE[self.next];
        self.next = (self.next + 1) % ALLOCATABLE.len();
        reg
    }

    /// Next register in the ring that is not in `avoid`.
    pub fn allocate_excluding(&mut self, avoid: &[Reg]) -> Reg {
        loop {
            let reg = self.allocate();
            if !avoid.contains(&reg) {
                return reg;
            }
        }
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

//! x86-64 instruction encoding.
//!
//! Only the forms the straight-line compiler needs, plus the jump forms the
//! assembler keeps for label patching. All arithmetic is 64-bit (REX.W).

use super::codebuf::CodeBuffer;

/// General-purpose registers, numbered as in the ModR/M encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low three bits, as placed in ModR/M and SIB.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }

    fn rex_b(self) -> u8 {
        if self.is_extended() { 0x01 } else { 0x00 }
    }

    fn rex_r(self) -> u8 {
        if self.is_extended() { 0x04 } else { 0x00 }
    }
}

/// Condition codes, as the low nibble of Jcc/SETcc opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// Signed condition for a comparison operator.
    pub fn for_comparison(op: &str) -> Option<Self> {
        Some(match op {
            "==" => Cond::E,
            "!=" => Cond::Ne,
            "<" => Cond::L,
            ">" => Cond::G,
            "<=" => Cond::Le,
            ">=" => Cond::Ge,
            _ => return None,
        })
    }
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    /// Register-direct `op r/m64, r64` form.
    fn rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(modrm(0b11, src.code(), dst.code()));
    }

    /// Group opcode with `/ext` on a register, e.g. NEG or IDIV.
    fn group(&mut self, opcode: u8, ext: u8, rm: Reg) {
        self.rex_w(Reg::Rax, rm);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(modrm(0b11, ext, rm.code()));
    }

    /// `[base + disp]` operand. RSP/R12 bases need a SIB byte; RBP/R13 bases
    /// cannot use the no-displacement form.
    fn mem_operand(&mut self, reg: Reg, base: Reg, disp: i32) {
        let needs_sib = base.code() == 4;
        let (mode, disp8) = if disp == 0 && base.code() != 5 {
            (0b00, false)
        } else if (-128..=127).contains(&disp) {
            (0b01, true)
        } else {
            (0b10, false)
        };

        self.buf.emit_u8(modrm(mode, reg.code(), base.code()));
        if needs_sib {
            self.buf.emit_u8(0x24);
        }
        match mode {
            0b01 if disp8 => self.buf.emit_u8(disp as i8 as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// Immediate group (`0x83 /ext ib` or `0x81 /ext id`).
    fn group_imm(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.rex_w(Reg::Rax, dst);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    // Data movement

    /// MOV dst, src
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x89, dst, src);
    }

    /// MOV dst, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w(Reg::Rax, dst);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV dst, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex_w(Reg::Rax, dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// Shortest move of an immediate.
    pub fn mov_imm(&mut self, dst: Reg, imm: i64) {
        match i32::try_from(imm) {
            Ok(imm32) => self.mov_ri32(dst, imm32),
            Err(_) => self.mov_ri64(dst, imm),
        }
    }

    /// MOV dst, [base + disp]
    pub fn load(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst, base, disp);
    }

    /// MOV [base + disp], src
    pub fn store(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src, base, disp);
    }

    // Arithmetic and logic

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x01, dst, src);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x29, dst, src);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x21, dst, src);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x09, dst, src);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x31, dst, src);
    }

    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x39, dst, src);
    }

    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(0x85, dst, src);
    }

    /// IMUL dst, src
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(modrm(0b11, dst.code(), src.code()));
    }

    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.group_imm(0, dst, imm);
    }

    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.group_imm(5, dst, imm);
    }

    pub fn neg(&mut self, dst: Reg) {
        self.group(0xF7, 3, dst);
    }

    /// IDIV src: RDX:RAX / src, quotient in RAX, remainder in RDX.
    pub fn idiv(&mut self, src: Reg) {
        self.group(0xF7, 7, src);
    }

    /// CQO: sign-extend RAX into RDX.
    pub fn cqo(&mut self) {
        self.buf.emit_bytes(&[0x48, 0x99]);
    }

    /// SETcc on the low byte of `dst`.
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        // SPL/BPL/SIL/DIL and R8B..R15B need a REX prefix.
        if dst.is_extended() || matches!(dst, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi) {
            self.buf.emit_u8(0x40 | dst.rex_b());
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(modrm(0b11, 0, dst.code()));
    }

    /// MOVZX dst, src8
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.buf.emit_u8(modrm(0b11, dst.code(), src.code()));
    }

    // Stack and calls

    pub fn push(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// CALL reg
    pub fn call_r(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(modrm(0b11, 2, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // Jumps

    pub fn jmp_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(offset as u32);
    }

    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_u32(offset as u32);
    }

    /// JMP to a label, patched by [`CodeBuffer::patch_forward_refs`].
    pub fn jmp_label(&mut self, label: &str) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(label);
    }

    pub fn jcc_label(&mut self, cond: Cond, label: &str) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(label);
    }
}

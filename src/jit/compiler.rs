//! Straight-line JIT compiler for x86-64.
//!
//! Programs without FUNC/IF/WHILE/CALL/GOTO are compiled into a single
//! native function `extern "C" fn(ctx) -> i64`. Every value lives on the
//! machine stack between instructions; a compile-time shadow stack tracks
//! depth, kind and known constants so that anything the interpreter would
//! reject (type mismatch, underflow, division by zero) is refused at compile
//! time and left to the interpreter.
//!
//! Frame layout below RBP:
//!
//! ```text
//! [rbp-8 .. rbp-40]   saved rbx, r12, r13, r14, r15
//! [rbp-48]            context pointer (first argument)
//! [rbp-56 - 8*i]      variable slot i
//! ```

use std::collections::HashMap;
use std::io::{self, Write};

use thiserror::Error;

use super::codebuf::CodeBuffer;
use super::memory::{ExecutableMemory, MemoryError};
use super::regalloc::RegisterAllocator;
use super::x86_64::{Cond, Reg, X86_64Assembler};
use crate::vm::instruction::parse_literal;
use crate::vm::{Instruction, InstructionType, Value, binary_op, unary_op};

const SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];
const SAVED_BYTES: i32 = 8 * SAVED.len() as i32;
const CTX_DISP: i32 = -(SAVED_BYTES + 8);

const KIND_INT: i64 = 0;
const KIND_BOOL: i64 = 1;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("stack underflow at pc {pc}")]
    StackUnderflow { pc: usize },
    #[error("unsafe to run natively: {0}")]
    Unsafe(String),
    #[error("output error: {0}")]
    Output(#[from] io::Error),
}

/// True when the program has no control flow the JIT cannot express.
pub fn can_jit_compile(program: &[Instruction]) -> bool {
    !program.iter().any(|instr| {
        matches!(
            instr.kind,
            InstructionType::Func
                | InstructionType::If
                | InstructionType::While
                | InstructionType::Call
                | InstructionType::Goto
        )
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// 32-bit literal, as the interpreter's `Int`.
    Int,
    Long,
    Bool,
}

/// Compile-time view of one machine-stack entry.
#[derive(Debug, Clone, Copy)]
struct Shadow {
    kind: Kind,
    constant: Option<i64>,
}

impl Shadow {
    const ZERO: Shadow = Shadow {
        kind: Kind::Int,
        constant: Some(0),
    };

    fn from_value(value: &Value) -> Option<Self> {
        let (kind, constant) = match value {
            Value::Int(n) => (Kind::Int, *n as i64),
            Value::Long(n) => (Kind::Long, *n),
            Value::Bool(b) => (Kind::Bool, *b as i64),
            _ => return None,
        };
        Some(Shadow {
            kind,
            constant: Some(constant),
        })
    }

    fn to_value(self) -> Option<Value> {
        let n = self.constant?;
        Some(match self.kind {
            Kind::Int => Value::Int(n as i32),
            Kind::Long => Value::Long(n),
            Kind::Bool => Value::Bool(n != 0),
        })
    }

    fn print_kind(self) -> i64 {
        if self.kind == Kind::Bool { KIND_BOOL } else { KIND_INT }
    }
}

pub struct JitCompiler {
    buf: CodeBuffer,
    regs: RegisterAllocator,
    shadow: Vec<Shadow>,
    slots: HashMap<String, i32>,
    vars: HashMap<String, Shadow>,
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl JitCompiler {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::with_capacity(256),
            regs: RegisterAllocator::new(),
            shadow: Vec::new(),
            slots: HashMap::new(),
            vars: HashMap::new(),
        }
    }

    /// Compile a whole program into sealed executable memory.
    pub fn compile(self, program: &[Instruction]) -> Result<CompiledProgram, JitError> {
        let (buf, result_on_stack) = self.assemble(program)?;
        let code = buf.code().to_vec();
        let memory = buf.finalize()?;
        Ok(CompiledProgram {
            memory,
            code,
            result_on_stack,
        })
    }

    /// Emit machine code. Returns the buffer and whether the result is the
    /// value left on the stack.
    fn assemble(mut self, program: &[Instruction]) -> Result<(CodeBuffer, bool), JitError> {
        if !can_jit_compile(program) {
            return Err(JitError::Unsupported(
                "program contains control flow".to_string(),
            ));
        }

        self.assign_slots(program);
        self.emit_prologue()?;
        for (pc, instr) in program.iter().enumerate() {
            self.compile_instruction(instr, pc)?;
        }
        let result_on_stack = !self.shadow.is_empty();
        self.emit_epilogue(result_on_stack);
        Ok((self.buf, result_on_stack))
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    fn assign_slots(&mut self, program: &[Instruction]) {
        for instr in program {
            let name = match (instr.kind, instr.operand(0)) {
                (InstructionType::Load, Some(text))
                    if instr.literal.is_none() && parse_literal(text).is_none() =>
                {
                    text
                }
                (InstructionType::Store, Some(text)) => text,
                (InstructionType::DefVar, Some(text)) => text.split(':').next().unwrap_or(text),
                _ => continue,
            };
            if !self.slots.contains_key(name) {
                let disp = CTX_DISP - 8 * (self.slots.len() as i32 + 1);
                self.slots.insert(name.to_string(), disp);
            }
        }
    }

    fn slot(&self, name: &str) -> Result<i32, JitError> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| JitError::Unsupported(format!("unknown variable {}", name)))
    }

    fn emit_prologue(&mut self) -> Result<(), JitError> {
        // Context slot plus variables, padded so RSP is 16-byte aligned.
        let mut frame = 8 * (self.slots.len() + 1);
        if (SAVED_BYTES as usize + frame) % 16 != 0 {
            frame += 8;
        }
        let frame = i32::try_from(frame)
            .map_err(|_| JitError::Unsupported("frame too large".to_string()))?;
        let slots: Vec<i32> = self.slots.values().copied().collect();

        let mut asm = self.asm();
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        for reg in SAVED {
            asm.push(reg);
        }
        asm.sub_ri32(Reg::Rsp, frame);
        asm.store(Reg::Rbp, CTX_DISP, Reg::Rdi);
        if !slots.is_empty() {
            asm.xor_rr(Reg::Rax, Reg::Rax);
            for disp in slots {
                asm.store(Reg::Rbp, disp, Reg::Rax);
            }
        }
        Ok(())
    }

    fn emit_epilogue(&mut self, result_on_stack: bool) {
        let mut asm = self.asm();
        if result_on_stack {
            asm.pop(Reg::Rax);
        } else {
            asm.xor_rr(Reg::Rax, Reg::Rax);
        }
        asm.mov_rr(Reg::Rsp, Reg::Rbp);
        asm.sub_ri32(Reg::Rsp, SAVED_BYTES);
        for reg in SAVED.iter().rev() {
            asm.pop(*reg);
        }
        asm.pop(Reg::Rbp);
        asm.ret();
    }

    fn compile_instruction(&mut self, instr: &Instruction, pc: usize) -> Result<(), JitError> {
        match instr.kind {
            InstructionType::Load => match (&instr.literal, instr.operand(0)) {
                (Some(literal), _) => self.push_literal(literal),
                (None, Some(text)) => match parse_literal(text) {
                    Some(value) => self.push_literal(&value),
                    None => self.push_variable(text),
                },
                (None, None) => Err(JitError::Unsupported("LOAD without operand".to_string())),
            },
            InstructionType::Push => match (&instr.literal, instr.operand(0)) {
                (Some(literal), _) => self.push_literal(literal),
                (None, Some(text)) => match parse_literal(text) {
                    Some(value) => self.push_literal(&value),
                    None => Err(JitError::Unsupported(format!("string operand {}", text))),
                },
                (None, None) => Err(JitError::Unsupported("PUSH without operand".to_string())),
            },
            InstructionType::Store => {
                let name = instr
                    .operand(0)
                    .ok_or_else(|| JitError::Unsupported("STORE without name".to_string()))?;
                let disp = self.slot(name)?;
                let (reg, value) = self.pop_value(pc)?;
                self.asm().store(Reg::Rbp, disp, reg);
                self.vars.insert(name.to_string(), value);
                Ok(())
            }
            InstructionType::DefVar => {
                if let Some(text) = instr.operand(0) {
                    let name = text.split(':').next().unwrap_or(text);
                    let disp = self.slot(name)?;
                    let reg = self.regs.allocate();
                    let mut asm = self.asm();
                    asm.xor_rr(reg, reg);
                    asm.store(Reg::Rbp, disp, reg);
                    self.vars.insert(name.to_string(), Shadow::ZERO);
                }
                Ok(())
            }
            InstructionType::Pop => self.pop_value(pc).map(|_| ()),
            InstructionType::BinaryOp => {
                let op = instr
                    .operand(0)
                    .ok_or_else(|| JitError::Unsupported("BINARY_OP without operator".to_string()))?;
                self.binary(op, pc)
            }
            InstructionType::UnaryOp => {
                let op = instr
                    .operand(0)
                    .ok_or_else(|| JitError::Unsupported("UNARY_OP without operator".to_string()))?;
                self.unary(op, pc)
            }
            InstructionType::Print => self.print(pc),
            InstructionType::Label
            | InstructionType::Nop
            | InstructionType::Pass
            | InstructionType::Package
            | InstructionType::Try
            | InstructionType::Catch
            | InstructionType::Do
            | InstructionType::Continue
            | InstructionType::Break
            | InstructionType::End => Ok(()),
            other => Err(JitError::Unsupported(other.mnemonic().to_string())),
        }
    }

    fn push_literal(&mut self, value: &Value) -> Result<(), JitError> {
        let shadow = Shadow::from_value(value)
            .ok_or_else(|| JitError::Unsupported(format!("{} literal", value.type_name())))?;
        let reg = self.regs.allocate();
        let mut asm = self.asm();
        asm.mov_imm(reg, shadow.constant.unwrap_or(0));
        asm.push(reg);
        self.shadow.push(shadow);
        Ok(())
    }

    fn push_variable(&mut self, name: &str) -> Result<(), JitError> {
        let disp = self.slot(name)?;
        let reg = self.regs.allocate();
        let mut asm = self.asm();
        asm.load(reg, Reg::Rbp, disp);
        asm.push(reg);
        let value = self.vars.get(name).copied().unwrap_or(Shadow::ZERO);
        self.shadow.push(value);
        Ok(())
    }

    /// Pop the top of the machine stack into a fresh register.
    fn pop_value(&mut self, pc: usize) -> Result<(Reg, Shadow), JitError> {
        let value = self.shadow.pop().ok_or(JitError::StackUnderflow { pc })?;
        let reg = self.regs.allocate();
        self.asm().pop(reg);
        Ok((reg, value))
    }

    fn binary(&mut self, op: &str, pc: usize) -> Result<(), JitError> {
        let len = self.shadow.len();
        if len < 2 {
            return Err(JitError::StackUnderflow { pc });
        }
        let (left, right) = (self.shadow[len - 2], self.shadow[len - 1]);
        if left.kind == Kind::Bool || right.kind == Kind::Bool {
            return Err(JitError::Unsupported(format!("BINARY_OP {} on bool", op)));
        }

        let folded = match (left.to_value(), right.to_value()) {
            (Some(l), Some(r)) => binary_op(&l, &r, op, 0).ok().and_then(|v| Shadow::from_value(&v)),
            _ => None,
        };
        let cond = Cond::for_comparison(op);
        let logical = matches!(op, "and" | "&&" | "or" | "||");
        let result_kind = if cond.is_some() || logical { Kind::Bool } else { Kind::Long };

        match op {
            "+" | "-" | "*" => {
                let (r, l) = self.pop_operands();
                let mut asm = self.asm();
                match op {
                    "+" => asm.add_rr(l, r),
                    "-" => asm.sub_rr(l, r),
                    _ => asm.imul_rr(l, r),
                }
                asm.push(l);
            }
            "/" | "%" => {
                let divisor = right.constant.filter(|d| *d != 0).ok_or_else(|| {
                    JitError::Unsupported(format!("BINARY_OP {} without a known non-zero divisor", op))
                })?;
                if divisor == -1 && left.constant.is_none_or(|n| n == i64::MIN) {
                    return Err(JitError::Unsupported("division may overflow".to_string()));
                }
                let d = self.regs.allocate_excluding(&[Reg::Rax, Reg::Rdx]);
                let mut asm = self.asm();
                asm.pop(d);
                asm.pop(Reg::Rax);
                asm.cqo();
                asm.idiv(d);
                asm.push(if op == "/" { Reg::Rax } else { Reg::Rdx });
            }
            _ if cond.is_some() => {
                let (r, l) = self.pop_operands();
                let mut asm = self.asm();
                asm.cmp_rr(l, r);
                if let Some(cond) = cond {
                    asm.setcc(cond, l);
                }
                asm.movzx_r64_r8(l, l);
                asm.push(l);
            }
            _ if logical => {
                let (r, l) = self.pop_operands();
                let mut asm = self.asm();
                for reg in [l, r] {
                    asm.test_rr(reg, reg);
                    asm.setcc(Cond::Ne, reg);
                    asm.movzx_r64_r8(reg, reg);
                }
                if matches!(op, "and" | "&&") {
                    asm.and_rr(l, r);
                } else {
                    asm.or_rr(l, r);
                }
                asm.push(l);
            }
            _ => return Err(JitError::Unsupported(format!("BINARY_OP {}", op))),
        }

        self.shadow.truncate(len - 2);
        self.shadow.push(folded.unwrap_or(Shadow {
            kind: result_kind,
            constant: None,
        }));
        Ok(())
    }

    /// Pop right then left into two distinct registers.
    fn pop_operands(&mut self) -> (Reg, Reg) {
        let r = self.regs.allocate();
        let l = self.regs.allocate();
        let mut asm = self.asm();
        asm.pop(r);
        asm.pop(l);
        (r, l)
    }

    fn unary(&mut self, op: &str, pc: usize) -> Result<(), JitError> {
        let operand = *self.shadow.last().ok_or(JitError::StackUnderflow { pc })?;
        let folded = operand
            .to_value()
            .and_then(|v| unary_op(&v, op, 0).ok())
            .and_then(|v| Shadow::from_value(&v));

        let result = match op {
            "-" => {
                let wraps_in_i32 =
                    operand.kind == Kind::Int && operand.constant.is_none_or(|n| n == i32::MIN as i64);
                if operand.kind == Kind::Bool || wraps_in_i32 {
                    return Err(JitError::Unsupported("UNARY_OP - operand".to_string()));
                }
                let reg = self.regs.allocate();
                let mut asm = self.asm();
                asm.pop(reg);
                asm.neg(reg);
                asm.push(reg);
                Shadow {
                    kind: operand.kind,
                    constant: None,
                }
            }
            "!" | "not" => {
                let reg = self.regs.allocate();
                let mut asm = self.asm();
                asm.pop(reg);
                asm.test_rr(reg, reg);
                asm.setcc(Cond::E, reg);
                asm.movzx_r64_r8(reg, reg);
                asm.push(reg);
                Shadow {
                    kind: Kind::Bool,
                    constant: None,
                }
            }
            _ => return Err(JitError::Unsupported(format!("UNARY_OP {}", op))),
        };

        self.shadow.pop();
        self.shadow.push(folded.unwrap_or(result));
        Ok(())
    }

    /// Pop the top value and hand it to `jit_print`. An empty stack prints
    /// nothing, as in the interpreter.
    fn print(&mut self, pc: usize) -> Result<(), JitError> {
        if self.shadow.is_empty() {
            return Ok(());
        }
        let (value_reg, value) = self.pop_value(pc)?;
        // An odd number of 8-byte entries left on the stack misaligns RSP.
        let misaligned = self.shadow.len() % 2 == 1;
        let print_fn: extern "C" fn(*mut u8, i64, i64) = jit_print;

        let mut asm = self.asm();
        asm.mov_rr(Reg::Rsi, value_reg);
        asm.load(Reg::Rdi, Reg::Rbp, CTX_DISP);
        asm.mov_imm(Reg::Rdx, value.print_kind());
        asm.mov_ri64(Reg::Rax, print_fn as usize as i64);
        if misaligned {
            asm.sub_ri32(Reg::Rsp, 8);
        }
        asm.call_r(Reg::Rax);
        if misaligned {
            asm.add_ri32(Reg::Rsp, 8);
        }
        Ok(())
    }
}

/// State shared with compiled code through its single argument.
struct JitContext<'a> {
    out: &'a mut dyn Write,
    last_printed: Option<i64>,
    error: Option<io::Error>,
}

/// PRINT callback. `ctx` is the pointer the compiled code was called with.
extern "C" fn jit_print(ctx: *mut u8, value: i64, kind: i64) {
    // SAFETY: compiled code only passes back the JitContext given to it.
    let ctx = unsafe { &mut *ctx.cast::<JitContext<'_>>() };
    if ctx.error.is_some() {
        return;
    }
    let result = if kind == KIND_BOOL {
        writeln!(ctx.out, "{}", value != 0)
    } else {
        writeln!(ctx.out, "{}", value)
    };
    match result {
        Ok(()) => ctx.last_printed = Some(value),
        Err(e) => ctx.error = Some(e),
    }
}

type JitEntry = unsafe extern "C" fn(*mut u8) -> i64;

/// A compiled program ready to run.
pub struct CompiledProgram {
    memory: ExecutableMemory,
    code: Vec<u8>,
    result_on_stack: bool,
}

impl CompiledProgram {
    /// The emitted machine code.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Run the program, writing PRINT output to `out`. Returns the value left
    /// on top of the stack, else the last printed value, else 0.
    pub fn execute(&self, out: &mut dyn Write) -> Result<i64, JitError> {
        if !cfg!(all(target_arch = "x86_64", unix)) {
            return Err(JitError::Unsafe(
                "native execution requires x86-64 unix".to_string(),
            ));
        }
        // SAFETY: the code was emitted by JitCompiler with the JitEntry ABI.
        let entry = unsafe { self.memory.as_fn::<JitEntry>() }
            .ok_or(JitError::Memory(MemoryError::NotExecutable))?;

        let mut ctx = JitContext {
            out,
            last_printed: None,
            error: None,
        };
        // SAFETY: ctx outlives the call and jit_print is its only user.
        let raw = unsafe { entry((&mut ctx as *mut JitContext<'_>).cast::<u8>()) };

        if let Some(e) = ctx.error {
            return Err(JitError::Output(e));
        }
        Ok(if self.result_on_stack {
            raw
        } else {
            ctx.last_printed.unwrap_or(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::parse_ir;

    fn assemble(source: &str) -> Result<Vec<u8>, JitError> {
        let program = parse_ir(source);
        JitCompiler::new()
            .assemble(&program)
            .map(|(buf, _)| buf.code().to_vec())
    }

    #[test]
    fn test_eligibility() {
        assert!(can_jit_compile(&parse_ir("PUSH 1\nPUSH 2\nBINARY_OP +\nPRINT")));
        for control in ["FUNC f", "IF", "WHILE", "CALL print", "GOTO l"] {
            let source = format!("PUSH 1\n{}\nPRINT", control);
            assert!(!can_jit_compile(&parse_ir(&source)), "{}", control);
        }
    }

    #[test]
    fn test_prologue_and_epilogue_shape() {
        let code = assemble("PUSH 2\nPUSH 3\nBINARY_OP +\nPRINT").unwrap();
        assert_eq!(
            &code[..13],
            &[0x55, 0x48, 0x89, 0xE5, 0x53, 0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]
        );
        // sub rsp, 8 keeps the frame aligned with no variables.
        assert_eq!(&code[13..17], &[0x48, 0x83, 0xEC, 0x08]);
        assert_eq!(
            &code[code.len() - 11..],
            &[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D, 0x41, 0x5C, 0x5B, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_rejects_what_the_interpreter_rejects() {
        assert!(matches!(
            assemble("PUSH 5\nPUSH 0\nBINARY_OP /"),
            Err(JitError::Unsupported(_))
        ));
        assert!(matches!(
            assemble("PUSH true\nPUSH 1\nBINARY_OP +"),
            Err(JitError::Unsupported(_))
        ));
        assert!(matches!(assemble("PUSH 1.5\nPRINT"), Err(JitError::Unsupported(_))));
        assert!(matches!(assemble("PUSH hello\nPRINT"), Err(JitError::Unsupported(_))));
        assert!(matches!(assemble("INPUT\nPRINT"), Err(JitError::Unsupported(_))));
        assert!(matches!(assemble("RETURN"), Err(JitError::Unsupported(_))));
        assert!(matches!(
            assemble("PUSH 1\nBINARY_OP +"),
            Err(JitError::StackUnderflow { pc: 1 })
        ));
        assert!(matches!(assemble("POP"), Err(JitError::StackUnderflow { pc: 0 })));
    }

    #[test]
    fn test_division_guard() {
        assert!(assemble("PUSH 7\nPUSH 2\nBINARY_OP /").is_ok());
        assert!(assemble("PUSH 7\nPUSH -1\nBINARY_OP %").is_ok());
        assert!(matches!(
            assemble("PUSH -9223372036854775808\nPUSH -1\nBINARY_OP /"),
            Err(JitError::Unsupported(_))
        ));
    }

    #[test]
    fn test_empty_print_is_noop() {
        assert!(assemble("PRINT\nPUSH 1").is_ok());
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    mod native {
        use super::*;

        fn run(source: &str) -> (i64, String) {
            let compiled = JitCompiler::new().compile(&parse_ir(source)).unwrap();
            let mut out = Vec::new();
            let result = compiled.execute(&mut out).unwrap();
            (result, String::from_utf8(out).unwrap())
        }

        #[test]
        fn test_add_and_print() {
            assert_eq!(run("PUSH 2\nPUSH 3\nBINARY_OP +\nPRINT"), (5, "5\n".to_string()));
        }

        #[test]
        fn test_result_is_stack_top() {
            assert_eq!(run("PUSH 6\nPUSH 7\nBINARY_OP *").0, 42);
            assert_eq!(run("PUSH 1\nPUSH 2\nBINARY_OP <").0, 1);
            assert_eq!(run("PUSH 1\nPOP").0, 0);
        }

        #[test]
        fn test_variables() {
            let (result, out) = run("DEFVAR x:int\nLOAD x\nPRINT\nLOAD 10\nSTORE x\nLOAD x\nLOAD 3\nBINARY_OP %\nPRINT\nLOAD y");
            assert_eq!(out, "0\n1\n");
            assert_eq!(result, 0);
        }

        #[test]
        fn test_division_truncates() {
            assert_eq!(run("PUSH -7\nPUSH 2\nBINARY_OP /").0, -3);
            assert_eq!(run("PUSH -7\nPUSH 2\nBINARY_OP %").0, -1);
        }

        #[test]
        fn test_booleans_and_logic() {
            let (_, out) = run(
                "PUSH 3\nPUSH 3\nBINARY_OP ==\nPRINT\nPUSH 0\nPUSH 5\nBINARY_OP or\nPRINT\nPUSH 0\nPUSH 5\nBINARY_OP and\nPRINT\nPUSH 0\nUNARY_OP !\nPRINT\nLOAD true\nPRINT",
            );
            assert_eq!(out, "true\ntrue\nfalse\ntrue\ntrue\n");
        }

        #[test]
        fn test_negation() {
            assert_eq!(run("PUSH 5\nUNARY_OP -").0, -5);
        }

        #[test]
        fn test_print_with_odd_stack_depth() {
            let (result, out) = run("PUSH 1\nPUSH 2\nPRINT\nPRINT\nPUSH 9\nPUSH 8\nPUSH 7\nPRINT");
            assert_eq!(out, "2\n1\n7\n");
            assert_eq!(result, 8);
        }
    }
}

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::vm::alloc::{SharedAllocator, TieredPool};
use crate::vm::builtins::{BuiltinFn, builtin_table};
use crate::vm::debug::{DebugEvent, DebugState};
use crate::vm::error::{LoadError, VmError};
use crate::vm::gc::{GarbageCollector, GcHandle};
use crate::vm::instruction::{Instruction, InstructionType, parse_ir, parse_literal};
use crate::vm::objects::{FileTable, ObjectTable, RawBlockTable};
use crate::vm::ops::{binary_op, unary_op};
use crate::vm::value::{PointerTarget, PointerValue, Value};

#[cfg(feature = "jit")]
use crate::jit::compiler::{JitCompiler, can_jit_compile};

/// Lifecycle of a [`VirtualMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// Program loaded, not running.
    Idle,
    Running,
    /// Finished normally, by RETURN with no caller, or by an error.
    Halted,
}

/// Scratch registers. `rax` holds the last native execution result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: i64,
    pub rbx: i64,
    pub rcx: i64,
    pub rdx: i64,
}

/// The interpreter's mutable session.
#[derive(Debug)]
pub struct MachineState {
    pub pc: usize,
    pub running: bool,
    pub registers: Registers,
    pub stack: Vec<Value>,
    /// Single flat namespace shared by every call.
    pub variables: HashMap<String, Value>,
    /// Pushed on function entry and popped on return; never used for lookup.
    pub scopes: Vec<HashMap<String, Value>>,
    pub functions: HashMap<String, usize>,
    /// PCs of the WHILE instructions currently looping, innermost last.
    pub loop_stack: Vec<usize>,
    pub program: Vec<Instruction>,
}

impl MachineState {
    fn new() -> Self {
        Self {
            pc: 0,
            running: false,
            registers: Registers::default(),
            stack: Vec::with_capacity(256),
            variables: HashMap::new(),
            scopes: vec![HashMap::new()],
            functions: HashMap::new(),
            loop_stack: Vec::new(),
            program: Vec::new(),
        }
    }
}

/// How the fetch-execute loop continues after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Halt,
}

/// Cloneable in-memory sink, for capturing program output.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Operand names are cut at the first `(` (functions) or `:` (typed vars).
fn base_name(name: &str, separator: char) -> &str {
    name.split(separator).next().unwrap_or(name)
}

/// The steve virtual machine.
pub struct VirtualMachine {
    state: MachineState,
    status: VmStatus,
    pub(crate) config: RuntimeConfig,
    pub(crate) gc: GarbageCollector,
    pub(crate) objects: ObjectTable,
    pub(crate) raw_blocks: RawBlockTable,
    pub(crate) files: FileTable,
    builtins: HashMap<&'static str, BuiltinFn>,
    debug: DebugState,
    /// PC of the last debugger pause; its check is skipped once on resume.
    resume_pc: Option<usize>,
    pub(crate) run_depth: usize,
    output: Box<dyn Write>,
    input: Box<dyn BufRead>,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_io(
            config,
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    /// Create a VM with custom input and output streams.
    pub fn with_io(config: RuntimeConfig, input: Box<dyn BufRead>, output: Box<dyn Write>) -> Self {
        let allocator: SharedAllocator =
            TieredPool::with_blocks_per_class(config.pool_blocks_per_class).shared();
        Self::with_allocator(config, allocator, input, output)
    }

    /// Create a VM drawing memory from `allocator`.
    pub fn with_allocator(
        config: RuntimeConfig,
        allocator: SharedAllocator,
        input: Box<dyn BufRead>,
        output: Box<dyn Write>,
    ) -> Self {
        Self {
            state: MachineState::new(),
            status: VmStatus::Idle,
            config,
            gc: GarbageCollector::new(allocator.clone()),
            objects: ObjectTable::new(allocator.clone()),
            raw_blocks: RawBlockTable::new(allocator),
            files: FileTable::new(),
            builtins: builtin_table(),
            debug: DebugState::new(),
            resume_pc: None,
            run_depth: 0,
            output,
            input,
        }
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn program(&self) -> &[Instruction] {
        &self.state.program
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn debug(&self) -> &DebugState {
        &self.debug
    }

    pub fn debug_mut(&mut self) -> &mut DebugState {
        &mut self.debug
    }

    /// Read and parse an IR file.
    pub fn load_program(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.load_source(&source)
    }

    /// Parse IR text and make it the current program.
    pub fn load_source(&mut self, source: &str) -> Result<(), LoadError> {
        let program = parse_ir(source);
        if program.is_empty() {
            return Err(LoadError::EmptyProgram);
        }
        self.state.program = program;
        self.reset();
        Ok(())
    }

    /// Return to `Idle`, dropping all run-time state but keeping the program.
    pub fn reset(&mut self) {
        let state = &mut self.state;
        state.pc = 0;
        state.running = false;
        state.registers = Registers::default();
        state.stack.clear();
        state.variables.clear();
        state.scopes.clear();
        state.scopes.push(HashMap::new());
        state.functions.clear();
        state.loop_stack.clear();

        self.debug.call_stack.clear();
        self.debug.call_depth = 0;
        self.resume_pc = None;

        self.objects.clear();
        self.raw_blocks.clear();
        self.files.clear();
        self.gc.clear();
        self.status = VmStatus::Idle;
    }

    /// Run the loaded program to completion. Errors are reported on stderr
    /// and returned; the VM is left `Halted` either way.
    pub fn execute(&mut self) -> Result<(), VmError> {
        if self.state.program.is_empty() {
            eprintln!("Internal Error: No program loaded");
            return Err(VmError::runtime("No program loaded", 0));
        }

        #[cfg(feature = "jit")]
        if let Some(result) = self.try_jit() {
            return result;
        }

        self.begin();
        while self.state.running && self.state.pc < self.state.program.len() {
            if let Err(e) = self.step() {
                return Err(self.fail(e));
            }
        }
        self.complete()
    }

    /// Run until the debugger overlay asks for a pause or the program ends.
    /// Calling again after a pause resumes from the paused instruction.
    pub fn execute_debug(&mut self) -> Result<DebugEvent, VmError> {
        match self.status {
            VmStatus::Halted => return Ok(DebugEvent::Halted),
            VmStatus::Idle => {
                if !self.debug.is_active() {
                    self.execute()?;
                    return Ok(DebugEvent::Halted);
                }
                self.begin();
            }
            VmStatus::Running => {}
        }
        self.debug.debugging = true;

        while self.state.running && self.state.pc < self.state.program.len() {
            let pc = self.state.pc;
            let line = self.state.program[pc].line;

            if self.resume_pc != Some(pc)
                && self.debug.should_pause_at(pc, line, &self.state.variables)
            {
                self.write_line(&format!("DEBUGGER PAUSED at PC: {}", pc))?;
                self.debug.clear_pending();
                self.resume_pc = Some(pc);
                return Ok(DebugEvent::Paused { pc, line });
            }
            self.resume_pc = None;

            if let Err(e) = self.step() {
                return Err(self.fail(e));
            }
        }

        self.complete()?;
        Ok(DebugEvent::Halted)
    }

    /// PC of the first instruction on a source line.
    pub fn pc_for_line(&self, line: usize) -> Option<usize> {
        self.state.program.iter().position(|instr| instr.line == line)
    }

    /// Add a breakpoint on a source line, resolving its PC.
    pub fn add_breakpoint_at_line(&mut self, line: usize, condition: Option<&str>) {
        let pc = self.pc_for_line(line).unwrap_or(usize::MAX);
        match condition {
            Some(cond) => self.debug.add_conditional_breakpoint(line, pc, cond),
            None => self.debug.add_breakpoint(line, pc),
        }
    }

    fn begin(&mut self) {
        self.state.pc = 0;
        self.state.running = true;
        self.status = VmStatus::Running;
    }

    fn finish(&mut self) -> Result<(), VmError> {
        self.state.running = false;
        self.status = VmStatus::Halted;
        self.output
            .flush()
            .map_err(|e| VmError::runtime(format!("Output error: {}", e), 0))
    }

    /// Halt after a normal run. A failed flush is reported like any other
    /// VM exception.
    fn complete(&mut self) -> Result<(), VmError> {
        self.finish().inspect_err(|e| self.report(e))
    }

    fn report(&self, error: &VmError) {
        eprintln!("VM Exception, PC {}: {}", self.state.pc, error);
        if let Some(line) = error.line() {
            eprintln!("  At line {}", line);
        }
    }

    fn fail(&mut self, error: VmError) -> VmError {
        self.report(&error);
        if let Err(flush_error) = self.finish() {
            self.report(&flush_error);
        }
        error
    }

    #[cfg(feature = "jit")]
    /// Run the program natively if possible. `None` means the interpreter
    /// should take over.
    fn try_jit(&mut self) -> Option<Result<(), VmError>> {
        if !self.config.jit_mode.should_attempt() || !can_jit_compile(&self.state.program) {
            return None;
        }

        let compiled = match JitCompiler::new().compile(&self.state.program) {
            Ok(compiled) => compiled,
            Err(e) => {
                eprintln!("JIT compilation failed: {}, falling back to interpreter", e);
                return None;
            }
        };
        if self.config.trace_jit {
            eprintln!("[JIT] Compiled program ({} bytes)", compiled.code().len());
        }

        match compiled.execute(self.output.as_mut()) {
            Ok(result) => {
                if self.config.trace_jit {
                    eprintln!("[JIT] Execution result: {}", result);
                }
                self.state.registers.rax = result;
                Some(self.complete())
            }
            Err(e) => {
                eprintln!("JIT compilation failed: {}, falling back to interpreter", e);
                None
            }
        }
    }

    /// Execute the instruction at the current PC and advance.
    fn step(&mut self) -> Result<(), VmError> {
        let pc = self.state.pc;
        let line = self.state.program[pc].line;
        match self.execute_instruction(pc).map_err(|e| e.with_line(line))? {
            Flow::Next => self.state.pc = pc + 1,
            Flow::Jump(target) => self.state.pc = target,
            Flow::Halt => self.state.running = false,
        }
        Ok(())
    }

    fn pop(&mut self, what: &str, line: usize) -> Result<Value, VmError> {
        self.state
            .stack
            .pop()
            .ok_or_else(|| VmError::access(format!("Stack underflow during {} operation", what), line))
    }

    fn execute_instruction(&mut self, pc: usize) -> Result<Flow, VmError> {
        let instr = self.state.program[pc].clone();
        let line = instr.line;

        match instr.kind {
            InstructionType::DefVar => {
                if let Some(name) = instr.operand(0) {
                    self.state
                        .variables
                        .insert(base_name(name, ':').to_string(), Value::Int(0));
                }
            }
            InstructionType::Load => {
                let value = match (&instr.literal, instr.operand(0)) {
                    (Some(literal), _) => literal.clone(),
                    (None, Some(text)) => parse_literal(text).unwrap_or_else(|| {
                        self.state
                            .variables
                            .get(text)
                            .cloned()
                            .unwrap_or(Value::Int(0))
                    }),
                    (None, None) => {
                        return Err(VmError::access("LOAD operation missing operand", line));
                    }
                };
                self.state.stack.push(value);
            }
            InstructionType::Push => {
                let value = match (&instr.literal, instr.operand(0)) {
                    (Some(literal), _) => literal.clone(),
                    (None, Some(text)) => {
                        parse_literal(text).unwrap_or_else(|| Value::Str(text.to_string()))
                    }
                    (None, None) => {
                        return Err(VmError::access("PUSH operation missing operand", line));
                    }
                };
                self.state.stack.push(value);
            }
            InstructionType::Store => {
                let value = self.pop("STORE", line)?;
                let name = instr
                    .operand(0)
                    .ok_or_else(|| VmError::access("STORE operation missing variable name", line))?;
                if let Some(Value::Pointer(existing)) = self.state.variables.get_mut(name)
                    && existing.is_ref
                    && let Value::Pointer(ptr) = &value
                {
                    if !existing.rebind(ptr.target) {
                        return Err(VmError::access(
                            format!("Cannot bind reference {} to null", name),
                            line,
                        ));
                    }
                    return Ok(Flow::Next);
                }
                self.state.variables.insert(name.to_string(), value);
            }
            InstructionType::Pop => {
                self.pop("POP", line)?;
            }
            InstructionType::Func => {
                if let Some(name) = instr.operand(0) {
                    self.state
                        .functions
                        .insert(base_name(name, '(').to_string(), pc);
                    self.state.scopes.push(HashMap::new());
                }
            }
            InstructionType::Call => return self.call(&instr, pc),
            InstructionType::Return => {
                let len = self.state.program.len();
                return match self.state.stack.last() {
                    Some(Value::Int(addr)) if *addr >= 0 && (*addr as usize) < len => {
                        let addr = *addr as usize;
                        self.state.stack.pop();
                        if self.state.scopes.len() > 1 {
                            self.state.scopes.pop();
                        }
                        self.debug.exit_call();
                        Ok(Flow::Jump(addr + 1))
                    }
                    _ => Ok(Flow::Halt),
                };
            }
            InstructionType::If => {
                let cond = self
                    .state
                    .stack
                    .pop()
                    .ok_or_else(|| VmError::access("Stack is empty during IF operation", line))?;
                if !cond.is_truthy() {
                    let target = self
                        .find_else_or_end(pc)
                        .ok_or_else(|| VmError::runtime("IF without matching ELSE or END", line))?;
                    return Ok(Flow::Jump(target + 1));
                }
            }
            InstructionType::Else => {
                let end = self
                    .find_end(pc)
                    .ok_or_else(|| VmError::runtime("ELSE without matching END", line))?;
                return Ok(Flow::Jump(end + 1));
            }
            InstructionType::While => {
                let cond = self
                    .state
                    .stack
                    .pop()
                    .ok_or_else(|| VmError::access("Stack is empty during WHILE operation", line))?;
                if cond.is_truthy() {
                    if self.state.loop_stack.last() != Some(&pc) {
                        self.state.loop_stack.push(pc);
                    }
                } else {
                    if self.state.loop_stack.last() == Some(&pc) {
                        self.state.loop_stack.pop();
                    }
                    let end = self
                        .find_end(pc)
                        .ok_or_else(|| VmError::runtime("WHILE without matching END", line))?;
                    return Ok(Flow::Jump(end + 1));
                }
            }
            InstructionType::End => {
                if let Some(&head) = self.state.loop_stack.last() {
                    if self.find_end(head) == Some(pc) {
                        return Ok(Flow::Jump(head));
                    }
                }
            }
            InstructionType::Break => {
                if let Some(head) = self.state.loop_stack.pop() {
                    let end = self
                        .find_end(head)
                        .ok_or_else(|| VmError::runtime("WHILE without matching END", line))?;
                    return Ok(Flow::Jump(end + 1));
                }
            }
            InstructionType::Goto => {
                let label = instr
                    .operand(0)
                    .ok_or_else(|| VmError::access("GOTO operation missing label", line))?;
                let target = self
                    .state
                    .program
                    .iter()
                    .position(|i| i.kind == InstructionType::Label && i.operand(0) == Some(label))
                    .ok_or_else(|| VmError::runtime(format!("Undefined label: {}", label), line))?;
                return Ok(Flow::Jump(target + 1));
            }
            InstructionType::Print => {
                if let Some(value) = self.state.stack.pop() {
                    self.write_line(&value.to_string())?;
                }
            }
            InstructionType::Input => {
                let text = self.read_line();
                self.state.stack.push(Value::Str(text));
            }
            InstructionType::Import => {
                if let Some(module) = instr.operand(0) {
                    self.write_line(&format!("Importing module: {}", module))?;
                }
            }
            InstructionType::BinaryOp => {
                if self.state.stack.len() < 2 {
                    return Err(VmError::access(
                        "Stack underflow during BINARY_OP operation",
                        line,
                    ));
                }
                let op = instr
                    .operand(0)
                    .ok_or_else(|| VmError::access("BINARY_OP operation missing operator", line))?;
                let right = self.pop("BINARY_OP", line)?;
                let left = self.pop("BINARY_OP", line)?;
                let result = binary_op(&left, &right, op, line)?;
                self.state.stack.push(result);
            }
            InstructionType::UnaryOp => {
                let op = instr
                    .operand(0)
                    .ok_or_else(|| VmError::access("UNARY_OP operation missing operator", line))?;
                let operand = self.pop("UNARY_OP", line)?;
                let result = unary_op(&operand, op, line)?;
                self.state.stack.push(result);
            }
            InstructionType::PtrNew => {
                let size = match self.state.stack.pop() {
                    Some(value) => value.coerce_i64().max(1) as usize,
                    None => 8,
                };
                self.check_heap_limit(size, line)?;
                let id = self
                    .objects
                    .create("object", size)
                    .ok_or_else(|| VmError::memory("Failed to allocate object", line))?;
                self.state.stack.push(Value::Pointer(make_pointer(
                    instr.operand(0),
                    PointerTarget::Object(id),
                    "object",
                )));
            }
            InstructionType::PtrDeref => {
                let value = self.pop("PTR_DEREF", line)?;
                let result = match &value {
                    Value::Pointer(ptr) => self.dereference(ptr, line)?,
                    other => other.clone(),
                };
                self.state.stack.push(result);
            }
            InstructionType::Throw => {
                let message = match self.state.stack.pop() {
                    Some(Value::Str(msg)) => msg,
                    Some(_) => "Unknown exception occurred".to_string(),
                    None => "Exception thrown".to_string(),
                };
                return Err(VmError::runtime(message, line));
            }
            InstructionType::GcNew => {
                let size = match self.state.stack.pop() {
                    Some(value) => value.coerce_i64().max(1) as usize,
                    None => 1,
                };
                self.check_heap_limit(size, line)?;
                let handle = self
                    .gc
                    .allocate(size)
                    .ok_or_else(|| VmError::memory("GC allocation failed", line))?;
                self.state.stack.push(Value::Pointer(make_pointer(
                    instr.operand(0),
                    PointerTarget::Gc(handle),
                    "gc",
                )));
            }
            InstructionType::GcDelete => {
                if let Some(Value::Pointer(ptr)) = self.state.stack.pop() {
                    if let PointerTarget::Gc(handle) = ptr.target {
                        self.gc.deallocate(handle);
                    }
                }
            }
            InstructionType::GcRun => {
                let collected = self.run_garbage_collection();
                self.state.stack.push(Value::Int(collected as i32));
            }
            InstructionType::MemMalloc => {
                let size = self.pop("MEM_malloc", line)?.coerce_i64();
                if size <= 0 {
                    return Err(VmError::memory(
                        format!("Invalid allocation size: {}", size),
                        line,
                    ));
                }
                self.check_heap_limit(size as usize, line)?;
                let address = self
                    .raw_blocks
                    .malloc(size as usize)
                    .ok_or_else(|| VmError::memory("Memory allocation failed", line))?;
                self.state.stack.push(Value::Long(address));
            }
            InstructionType::MemFree => {
                if let Some(value) = self.state.stack.pop() {
                    self.raw_blocks.free(value.coerce_i64());
                }
            }
            InstructionType::Continue
            | InstructionType::Package
            | InstructionType::Try
            | InstructionType::Catch
            | InstructionType::Pass
            | InstructionType::Do
            | InstructionType::Label
            | InstructionType::Nop => {}
        }

        Ok(Flow::Next)
    }

    fn call(&mut self, instr: &Instruction, pc: usize) -> Result<Flow, VmError> {
        let line = instr.line;
        let name = instr
            .operand(0)
            .map(|n| base_name(n, '('))
            .ok_or_else(|| VmError::access("CALL operation missing function name", line))?;

        if let Some(&builtin) = self.builtins.get(name) {
            let args: Vec<Value> = self.state.stack.pop().into_iter().collect();
            let result = builtin(self, args)?;
            self.state.stack.push(result);
            return Ok(Flow::Next);
        }

        let entry = *self
            .state
            .functions
            .get(name)
            .ok_or_else(|| VmError::runtime(format!("Undefined function: {}", name), line))?;
        self.state.stack.push(Value::Int(pc as i32));
        self.state.scopes.push(HashMap::new());
        self.debug.enter_call(name);
        Ok(Flow::Jump(entry + 1))
    }

    /// Scan forward from the opener at `from` for the ELSE or END at the same
    /// nesting depth.
    fn find_else_or_end(&self, from: usize) -> Option<usize> {
        self.scan_forward(from, true)
    }

    /// Scan forward from the opener at `from` for its matching END.
    fn find_end(&self, from: usize) -> Option<usize> {
        self.scan_forward(from, false)
    }

    fn scan_forward(&self, from: usize, stop_at_else: bool) -> Option<usize> {
        let mut depth = 0usize;
        for (index, instr) in self.state.program.iter().enumerate().skip(from + 1) {
            match instr.kind {
                kind if kind.opens_block() => depth += 1,
                InstructionType::End if depth == 0 => return Some(index),
                InstructionType::End => depth -= 1,
                InstructionType::Else if depth == 0 && stop_at_else => return Some(index),
                _ => {}
            }
        }
        None
    }

    fn dereference(&self, ptr: &PointerValue, line: usize) -> Result<Value, VmError> {
        if ptr.is_null() {
            return Err(VmError::runtime("Cannot dereference null pointer", line));
        }
        if !self.pointer_is_live(ptr) {
            return Err(VmError::runtime("Dangling pointer dereference", line));
        }
        match ptr.target {
            PointerTarget::Object(id) => Ok(self
                .objects
                .get(id)
                .map_or(Value::Int(0), |object| object.load())),
            _ => Ok(Value::Int(0)),
        }
    }

    /// Whether the pointer's target still exists.
    pub(crate) fn pointer_is_live(&self, ptr: &PointerValue) -> bool {
        match ptr.target {
            PointerTarget::Null => false,
            PointerTarget::Object(id) => self.objects.get(id).is_some(),
            PointerTarget::Gc(handle) => self.gc.contains(handle),
            PointerTarget::File(id) => self.files.is_open(id),
            PointerTarget::Address(address) => self.raw_blocks.contains(address),
        }
    }

    /// Bytes held by GC objects, raw blocks and managed objects.
    pub fn heap_bytes(&self) -> usize {
        self.gc.heap_bytes() + self.raw_blocks.bytes_in_use() + self.objects.bytes_in_use()
    }

    pub(crate) fn fits_heap_limit(&self, extra: usize) -> bool {
        self.config
            .heap_limit
            .is_none_or(|limit| self.heap_bytes().saturating_add(extra) <= limit)
    }

    fn check_heap_limit(&self, extra: usize, line: usize) -> Result<(), VmError> {
        if self.fits_heap_limit(extra) {
            Ok(())
        } else {
            Err(VmError::memory(
                format!(
                    "Heap limit exceeded: {} + {} bytes > {} bytes",
                    self.heap_bytes(),
                    extra,
                    self.config.heap_limit.unwrap_or(0)
                ),
                line,
            ))
        }
    }

    /// Recompute roots from the stack and variables, then collect.
    pub fn run_garbage_collection(&mut self) -> usize {
        if !self.config.gc_enabled {
            return 0;
        }

        let mut roots = Vec::new();
        for value in self.state.stack.iter().chain(self.state.variables.values()) {
            collect_gc_roots(value, &mut roots);
        }
        self.gc.clear_roots();
        for handle in roots {
            self.gc.mark_root(handle);
        }

        let before = self.gc.heap_size();
        let collected = self.gc.collect();
        if self.config.gc_stats {
            eprintln!(
                "[GC] collected: {}, live: {}, heap: {}",
                collected,
                self.gc.heap_size(),
                before
            );
        }
        collected
    }

    /// Call a built-in directly with any number of arguments.
    pub fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let builtin = *self
            .builtins
            .get(name)
            .ok_or_else(|| VmError::runtime(format!("Undefined function: {}", name), 0))?;
        builtin(self, args)
    }

    pub(crate) fn write_line(&mut self, text: &str) -> Result<(), VmError> {
        writeln!(self.output, "{}", text)
            .map_err(|e| VmError::runtime(format!("Output error: {}", e), 0))
    }

    pub(crate) fn write_raw(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.output
            .write_all(bytes)
            .map_err(|e| VmError::runtime(format!("Output error: {}", e), 0))
    }

    /// One line from the input without its terminator. Empty at EOF.
    pub(crate) fn read_line(&mut self) -> String {
        let mut line = String::new();
        if self.input.read_line(&mut line).is_err() {
            return String::new();
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

/// Pointer of the kind named by an allocation operand: `weak`, `ref`, or an
/// ordinary owning pointer.
fn make_pointer(kind: Option<&str>, target: PointerTarget, type_tag: &str) -> PointerValue {
    match kind {
        Some("weak") => PointerValue::weak(target, type_tag),
        Some("ref") => PointerValue::reference(target, type_tag)
            .unwrap_or_else(|| PointerValue::new(target, type_tag)),
        _ => PointerValue::new(target, type_tag),
    }
}

/// Strong GC pointers reachable from `value`, looking inside lists and dicts.
fn collect_gc_roots(value: &Value, roots: &mut Vec<GcHandle>) {
    match value {
        Value::Pointer(ptr) if !ptr.is_weak => {
            if let PointerTarget::Gc(handle) = ptr.target {
                roots.push(handle);
            }
        }
        Value::List(items) => {
            for item in items {
                collect_gc_roots(item, roots);
            }
        }
        Value::Dict(items) => {
            for item in items.values() {
                collect_gc_roots(item, roots);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(source: &str) -> (VirtualMachine, SharedOutput, Result<(), VmError>) {
        run_with_input(source, "")
    }

    fn run_with_input(
        source: &str,
        input: &str,
    ) -> (VirtualMachine, SharedOutput, Result<(), VmError>) {
        let out = SharedOutput::new();
        let mut vm = VirtualMachine::with_io(
            RuntimeConfig::default(),
            Box::new(io::Cursor::new(input.as_bytes().to_vec())),
            Box::new(out.clone()),
        );
        vm.load_source(source).unwrap();
        let result = vm.execute();
        (vm, out, result)
    }

    #[test]
    fn test_push_add_print() {
        let (vm, out, result) = run("PUSH 2\nPUSH 3\nBINARY_OP +\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "5\n");
        assert_eq!(vm.status(), VmStatus::Halted);
    }

    #[test]
    fn test_load_literals_and_variables() {
        let (vm, out, result) = run(
            "LOAD 1.5\nPRINT\nLOAD \"hi there\"\nPRINT\nLOAD missing\nPRINT\nLOAD 7\nSTORE x\nLOAD x\nPRINT\nLOAD true\nPRINT\nLOAD null\nPRINT",
        );
        result.unwrap();
        assert_eq!(out.text(), "1.5\nhi there\n0\n7\ntrue\nnull\n");
        assert_eq!(vm.state().variables.get("x"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_defvar_strips_type() {
        let (vm, _, result) = run("DEFVAR count:int");
        result.unwrap();
        assert_eq!(vm.state().variables.get("count"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_store_on_empty_stack() {
        let (vm, _, result) = run("STORE x");
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Access Error: Stack underflow during STORE operation");
        assert_eq!(err.line(), Some(1));
        assert_eq!(vm.status(), VmStatus::Halted);
    }

    #[test]
    fn test_if_else() {
        let (_, out, result) = run(
            "PUSH 0\nIF\nPUSH 1\nPRINT\nELSE\nPUSH 2\nPRINT\nEND\nPUSH 1\nIF\nPUSH 3\nPRINT\nELSE\nPUSH 4\nPRINT\nEND",
        );
        result.unwrap();
        assert_eq!(out.text(), "2\n3\n");
    }

    #[test]
    fn test_nested_if_skips_inner_blocks() {
        let (_, out, result) =
            run("PUSH 0\nIF\nPUSH 1\nIF\nPUSH 9\nPRINT\nEND\nELSE\nPUSH 5\nPRINT\nEND");
        result.unwrap();
        assert_eq!(out.text(), "5\n");
    }

    #[test]
    fn test_if_without_end() {
        let (_, _, result) = run("PUSH 0\nIF\nPUSH 1");
        assert!(matches!(result, Err(VmError::Runtime { .. })));
    }

    #[test]
    fn test_if_on_empty_stack() {
        let (_, _, result) = run("IF\nEND");
        assert_eq!(
            result.unwrap_err().message(),
            "Stack is empty during IF operation"
        );
    }

    const COUNT_TO_THREE: &str = "\
LOAD 0
STORE i
LOAD i
LOAD 3
BINARY_OP <
WHILE
LOAD i
PRINT
LOAD i
LOAD 1
BINARY_OP +
STORE i
LOAD i
LOAD 3
BINARY_OP <
END
LOAD 99
PRINT";

    #[test]
    fn test_while_loop() {
        let (vm, out, result) = run(COUNT_TO_THREE);
        result.unwrap();
        assert_eq!(out.text(), "0\n1\n2\n99\n");
        assert!(vm.state().loop_stack.is_empty());
        assert!(vm.state().stack.is_empty());
    }

    #[test]
    fn test_break_leaves_loop() {
        let (_, out, result) = run(
            "PUSH 1\nWHILE\nPUSH 7\nPRINT\nBREAK\nPUSH 1\nEND\nPUSH 8\nPRINT",
        );
        result.unwrap();
        assert_eq!(out.text(), "7\n8\n");
    }

    #[test]
    fn test_if_inside_while() {
        let source = "\
LOAD 0
STORE i
PUSH 1
WHILE
LOAD i
LOAD 1
BINARY_OP ==
IF
PUSH 100
PRINT
END
LOAD i
LOAD 1
BINARY_OP +
STORE i
LOAD i
LOAD 3
BINARY_OP <
END";
        let (_, out, result) = run(source);
        result.unwrap();
        assert_eq!(out.text(), "100\n");
    }

    #[test]
    fn test_user_function_call_and_return() {
        let source = "\
GOTO main
FUNC greet()
PUSH 42
PRINT
RETURN
LABEL main
CALL greet
PUSH 1
PRINT";
        let (vm, out, result) = run(source);
        // FUNC is not hoisted: GOTO skips the definition, so greet is unknown.
        assert_eq!(result.unwrap_err().message(), "Undefined function: greet");
        assert_eq!(out.text(), "");
        assert!(vm.state().functions.is_empty());

        // The body runs once at definition; RETURN is guarded until called.
        let source = "\
FUNC greet()
PUSH 42
PRINT
LOAD called
IF
RETURN
END
PUSH 1
STORE called
CALL greet
PUSH 7
PRINT";
        let (vm, out, result) = run(source);
        result.unwrap();
        assert_eq!(out.text(), "42\n42\n7\n");
        assert_eq!(vm.state().scopes.len(), 2);
        assert_eq!(vm.debug().call_depth, 0);
    }

    #[test]
    fn test_return_without_address_halts() {
        let (vm, out, result) = run("PUSH 1\nPRINT\nRETURN\nPUSH 2\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "1\n");
        assert_eq!(vm.status(), VmStatus::Halted);
    }

    #[test]
    fn test_builtin_call_pops_one_argument() {
        let (vm, _, result) = run("PUSH 1\nPUSH \"3.5\"\nCALL float\nSTORE f");
        result.unwrap();
        assert_eq!(vm.state().variables.get("f"), Some(&Value::Double(3.5)));
        assert_eq!(vm.state().stack, vec![Value::Int(1)]);
    }

    #[test]
    fn test_undefined_function() {
        let (_, _, result) = run("CALL nope");
        let err = result.unwrap_err();
        assert_eq!(err.message(), "Undefined function: nope");
        assert_eq!(err.line(), Some(1));
    }

    #[test]
    fn test_goto_and_undefined_label() {
        let (_, out, result) = run("GOTO skip\nPUSH 1\nPRINT\nLABEL skip\nPUSH 2\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "2\n");

        let (_, _, result) = run("GOTO nowhere");
        assert_eq!(result.unwrap_err().message(), "Undefined label: nowhere");
    }

    #[test]
    fn test_division_by_zero_reports_line() {
        let (_, _, result) = run("PUSH 1\nPUSH 0\nBINARY_OP /");
        let err = result.unwrap_err();
        assert_eq!(err.message(), "Division by zero error");
        assert_eq!(err.line(), Some(3));
    }

    #[test]
    fn test_throw() {
        let (_, _, result) = run("PUSH \"bad thing\"\nTHROW");
        assert_eq!(result.unwrap_err().to_string(), "Runtime Error: bad thing");
        let (_, _, result) = run("PUSH 1\nTHROW");
        assert_eq!(result.unwrap_err().message(), "Unknown exception occurred");
        let (_, _, result) = run("THROW");
        assert_eq!(result.unwrap_err().message(), "Exception thrown");
    }

    #[test]
    fn test_input_and_import() {
        let (_, out, result) = run_with_input("IMPORT math\nINPUT\nPRINT", "typed\r\n");
        result.unwrap();
        assert_eq!(out.text(), "Importing module: math\ntyped\n");
    }

    #[test]
    fn test_pointer_new_and_deref() {
        let (vm, _, result) = run("PTR_new\nSTORE p\nLOAD p\nPTR_DEREF");
        result.unwrap();
        assert!(matches!(vm.state().stack.last(), Some(Value::Long(0))));
        assert_eq!(vm.objects().len(), 1);

        let (_, _, result) = run("PUSH \"int\"\nCALL new\nCALL del\nPOP\nLOAD null\nPTR_DEREF");
        result.unwrap();
    }

    #[test]
    fn test_deref_null_and_dangling() {
        let mut vm = VirtualMachine::with_io(
            RuntimeConfig::default(),
            Box::new(io::empty()),
            Box::new(SharedOutput::new()),
        );
        vm.load_source("PUSH \"int\"\nCALL new\nSTORE p\nLOAD p\nCALL del\nPOP\nLOAD p\nPTR_DEREF")
            .unwrap();
        assert_eq!(vm.execute().unwrap_err().message(), "Dangling pointer dereference");

        vm.load_source("CALL new\nPTR_DEREF").unwrap();
        assert_eq!(
            vm.execute().unwrap_err().message(),
            "Cannot dereference null pointer"
        );
    }

    #[test]
    fn test_gc_instructions() {
        let source = "\
PUSH 16
GC_new
STORE keep
PUSH 16
GC_new
POP
PUSH 16
GC_new
GC_delete
GC_gc
PRINT";
        let (vm, out, result) = run(source);
        result.unwrap();
        assert_eq!(out.text(), "1\n");
        assert_eq!(vm.gc().heap_size(), 1);
    }

    #[test]
    fn test_gc_roots_inside_lists() {
        let (vm, out, result) = run("GC_new\nCALL list\nSTORE held\nGC_gc\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "0\n");
        assert_eq!(vm.gc().heap_size(), 1);
    }

    #[test]
    fn test_mem_malloc_and_free() {
        let (vm, _, result) = run("PUSH 64\nMEM_malloc\nSTORE a\nLOAD a\nMEM_free\nLOAD a\nMEM_free");
        result.unwrap();
        assert_eq!(vm.heap_bytes(), 0);
        assert!(matches!(vm.state().variables.get("a"), Some(Value::Long(_))));
    }

    #[test]
    fn test_heap_limit() {
        let out = SharedOutput::new();
        let config = RuntimeConfig {
            heap_limit: Some(100),
            ..RuntimeConfig::default()
        };
        let mut vm = VirtualMachine::with_io(config, Box::new(io::empty()), Box::new(out));
        vm.load_source("PUSH 64\nMEM_malloc\nPUSH 64\nGC_new").unwrap();
        let err = vm.execute().unwrap_err();
        assert!(matches!(err, VmError::Memory { .. }));
        assert_eq!(err.line(), Some(4));
    }

    #[test]
    fn test_malloc_too_large_is_memory_error() {
        let (_, _, result) = run("PUSH 4611686018427387904\nMEM_malloc");
        let err = result.unwrap_err();
        assert!(matches!(err, VmError::Memory { .. }));
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.message(), "Memory allocation failed");
    }

    #[test]
    fn test_weak_pointer_does_not_keep_object() {
        let (vm, out, result) = run("GC_new weak\nGC_gc\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "1\n");
        assert_eq!(vm.gc().heap_size(), 0);

        let (vm, out, result) = run("GC_new weak\nSTORE w\nGC_gc\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "1\n");
        assert_eq!(vm.gc().heap_size(), 0);

        let (vm, out, result) = run("GC_new\nSTORE s\nGC_gc\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "0\n");
        assert_eq!(vm.gc().heap_size(), 1);
    }

    #[test]
    fn test_reference_rebinds_on_store() {
        let (vm, _, result) = run("PTR_new ref\nSTORE r\nPTR_new\nSTORE r");
        result.unwrap();
        match vm.state().variables.get("r") {
            Some(Value::Pointer(ptr)) => {
                assert!(ptr.is_ref);
                assert_eq!(ptr.target, PointerTarget::Object(2));
            }
            other => panic!("expected pointer, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_refuses_null() {
        let (_, _, result) = run("PTR_new ref\nSTORE r\nCALL new\nSTORE r");
        let err = result.unwrap_err();
        assert!(matches!(err, VmError::Access { .. }));
        assert_eq!(err.line(), Some(4));
        assert_eq!(err.message(), "Cannot bind reference r to null");
    }

    struct FailingFlush;

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_flush_failure_is_reported() {
        let mut vm = VirtualMachine::with_io(
            RuntimeConfig::default(),
            Box::new(io::empty()),
            Box::new(FailingFlush),
        );
        vm.load_source("PUSH 1\nCALL print").unwrap();
        let err = vm.execute().unwrap_err();
        assert!(err.message().starts_with("Output error"));
    }

    #[test]
    fn test_print_compound_values() {
        let (_, out, result) = run("PUSH 1\nPUSH 2\nCALL list\nPRINT\nPUSH 2.0\nPUSH 4\nBINARY_OP /\nPRINT");
        result.unwrap();
        assert_eq!(out.text(), "[2]\n0.5\n");
    }

    #[test]
    fn test_reset_keeps_program() {
        let (mut vm, out, result) = run("PUSH 5\nSTORE x\nPUSH 8\nGC_new\nPUSH 1\nPRINT");
        result.unwrap();
        vm.reset();
        assert_eq!(vm.status(), VmStatus::Idle);
        assert!(vm.state().variables.is_empty());
        assert!(vm.state().stack.is_empty());
        assert_eq!(vm.state().scopes.len(), 1);
        assert_eq!(vm.gc().heap_size(), 0);
        assert_eq!(vm.program().len(), 6);

        vm.execute().unwrap();
        assert_eq!(out.text(), "1\n1\n");
    }

    #[test]
    fn test_empty_program_rejected() {
        let mut vm = VirtualMachine::new();
        assert!(matches!(
            vm.load_source("; only a comment\n"),
            Err(LoadError::EmptyProgram)
        ));
        assert!(vm.execute().is_err());
    }

    #[test]
    fn test_debug_pauses_at_breakpoint_and_resumes() {
        let out = SharedOutput::new();
        let mut vm = VirtualMachine::with_io(
            RuntimeConfig::default(),
            Box::new(io::empty()),
            Box::new(out.clone()),
        );
        vm.load_source("PUSH 1\nPRINT\nPUSH 2\nPRINT").unwrap();
        vm.add_breakpoint_at_line(3, None);

        assert_eq!(
            vm.execute_debug().unwrap(),
            DebugEvent::Paused { pc: 2, line: 3 }
        );
        assert_eq!(out.text(), "1\nDEBUGGER PAUSED at PC: 2\n");
        assert_eq!(vm.execute_debug().unwrap(), DebugEvent::Halted);
        assert_eq!(out.text(), "1\nDEBUGGER PAUSED at PC: 2\n2\n");
    }

    #[test]
    fn test_debug_without_breakpoints_runs_to_end() {
        let (mut vm, out, _) = run("PUSH 1\nPRINT");
        vm.reset();
        assert_eq!(vm.execute_debug().unwrap(), DebugEvent::Halted);
        assert_eq!(out.text(), "1\n1\n");
    }

    #[test]
    fn test_while_visit_counts() {
        let out = SharedOutput::new();
        let mut vm = VirtualMachine::with_io(
            RuntimeConfig::default(),
            Box::new(io::empty()),
            Box::new(out),
        );
        vm.load_source(COUNT_TO_THREE).unwrap();
        let while_pc = 5;
        let end_pc = 15;

        let mut visits: HashMap<usize, usize> = HashMap::new();
        vm.debug_mut().step();
        while let DebugEvent::Paused { pc, .. } = vm.execute_debug().unwrap() {
            *visits.entry(pc).or_default() += 1;
            vm.debug_mut().step();
        }
        assert_eq!(visits[&while_pc], 4);
        assert_eq!(visits[&end_pc], 3);
    }

    proptest! {
        #[test]
        fn push_pop_roundtrip(n in any::<i32>(), s in "[a-z]{0,8}", b in any::<bool>()) {
            for value in [Value::Int(n), Value::Long(n as i64 * 3), Value::Str(s.clone()), Value::Bool(b)] {
                let mut vm = VirtualMachine::new();
                vm.state.stack.push(value.clone());
                let depth = vm.state.stack.len();
                vm.state.stack.push(value.clone());
                let popped = vm.pop("TEST", 0).unwrap();
                prop_assert_eq!(vm.state.stack.len(), depth);
                prop_assert_eq!(popped, value);
            }
        }
    }
}

//! Textual IR: instruction set and line-oriented parser.

use serde::Serialize;

use super::value::Value;

/// Instruction mnemonics understood by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstructionType {
    DefVar,
    Load,
    Store,
    Func,
    Call,
    If,
    Else,
    End,
    While,
    Do,
    Return,
    Import,
    Print,
    Input,
    BinaryOp,
    UnaryOp,
    Push,
    Pop,
    Goto,
    Label,
    Try,
    Catch,
    Break,
    Continue,
    Pass,
    Package,
    PtrNew,
    PtrDeref,
    Throw,
    GcNew,
    GcDelete,
    GcRun,
    MemMalloc,
    MemFree,
    Nop,
}

impl InstructionType {
    /// Map an IR mnemonic to an instruction type. Unknown mnemonics are NOP.
    pub fn from_mnemonic(name: &str) -> Self {
        match name {
            "DEFVAR" => Self::DefVar,
            "LOAD" => Self::Load,
            "STORE" => Self::Store,
            "FUNC" => Self::Func,
            "CALL" => Self::Call,
            "IF" => Self::If,
            "ELSE" => Self::Else,
            "END" => Self::End,
            "WHILE" => Self::While,
            "DO" => Self::Do,
            "RETURN" => Self::Return,
            "IMPORT" => Self::Import,
            "PRINT" => Self::Print,
            "INPUT" => Self::Input,
            "BINARY_OP" => Self::BinaryOp,
            "UNARY_OP" => Self::UnaryOp,
            "PUSH" => Self::Push,
            "POP" => Self::Pop,
            "GOTO" => Self::Goto,
            "LABEL" => Self::Label,
            "TRY" => Self::Try,
            "CATCH" => Self::Catch,
            "BREAK" => Self::Break,
            "CONTINUE" => Self::Continue,
            "PASS" => Self::Pass,
            "PACKAGE" => Self::Package,
            "PTR_new" => Self::PtrNew,
            "PTR_DEREF" => Self::PtrDeref,
            "THROW" => Self::Throw,
            "GC_new" => Self::GcNew,
            "GC_delete" => Self::GcDelete,
            "GC_gc" => Self::GcRun,
            "MEM_malloc" => Self::MemMalloc,
            "MEM_free" => Self::MemFree,
            _ => Self::Nop,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::DefVar => "DEFVAR",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Func => "FUNC",
            Self::Call => "CALL",
            Self::If => "IF",
            Self::Else => "ELSE",
            Self::End => "END",
            Self::While => "WHILE",
            Self::Do => "DO",
            Self::Return => "RETURN",
            Self::Import => "IMPORT",
            Self::Print => "PRINT",
            Self::Input => "INPUT",
            Self::BinaryOp => "BINARY_OP",
            Self::UnaryOp => "UNARY_OP",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Goto => "GOTO",
            Self::Label => "LABEL",
            Self::Try => "TRY",
            Self::Catch => "CATCH",
            Self::Break => "BREAK",
            Self::Continue => "CONTINUE",
            Self::Pass => "PASS",
            Self::Package => "PACKAGE",
            Self::PtrNew => "PTR_new",
            Self::PtrDeref => "PTR_DEREF",
            Self::Throw => "THROW",
            Self::GcNew => "GC_new",
            Self::GcDelete => "GC_delete",
            Self::GcRun => "GC_gc",
            Self::MemMalloc => "MEM_malloc",
            Self::MemFree => "MEM_free",
            Self::Nop => "NOP",
        }
    }

    /// Instructions that open a block closed by END.
    pub fn opens_block(self) -> bool {
        matches!(self, Self::If | Self::While)
    }
}

/// A parsed instruction. Immutable once the program is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstructionType,
    pub operands: Vec<String>,
    /// Literal carried by a double-quoted first operand.
    pub literal: Option<Value>,
    /// 1-based source line.
    pub line: usize,
}

impl Instruction {
    pub fn new(kind: InstructionType, operands: &[&str], line: usize) -> Self {
        Self {
            kind,
            operands: operands.iter().map(|s| s.to_string()).collect(),
            literal: None,
            line,
        }
    }

    pub fn operand(&self, index: usize) -> Option<&str> {
        self.operands.get(index).map(String::as_str)
    }
}

/// Parse `true`, `false`, `null` or a number.
pub fn parse_literal(text: &str) -> Option<Value> {
    match text {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "null" => Some(Value::Null),
        _ => parse_number(text),
    }
}

/// Numeric literal rule shared by LOAD and PUSH: text with a `.` is a
/// double, otherwise an int, widening to long when out of i32 range.
pub fn parse_number(text: &str) -> Option<Value> {
    if text.contains('.') {
        return text.parse::<f64>().ok().map(Value::Double);
    }
    if let Ok(n) = text.parse::<i32>() {
        return Some(Value::Int(n));
    }
    text.parse::<i64>().ok().map(Value::Long)
}

struct Token {
    text: String,
    quoted: bool,
}

/// Split a line into tokens, keeping double-quoted runs together and
/// cutting at the first `;` outside quotes.
fn tokenize(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == ';' {
            break;
        }
        if c == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == '"' {
                    closed = true;
                    break;
                }
                text.push(ch);
            }
            if closed {
                // Swallow a separator comma directly after the closing quote.
                if chars.peek() == Some(&',') {
                    chars.next();
                }
                tokens.push(Token { text, quoted: true });
            } else {
                tokens.push(Token {
                    text: format!("\"{}", text),
                    quoted: false,
                });
            }
            continue;
        }

        let mut text = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() || ch == ';' {
                break;
            }
            text.push(ch);
            chars.next();
        }
        if text.len() > 1 && text.ends_with(',') {
            text.pop();
        }
        tokens.push(Token {
            text,
            quoted: false,
        });
    }

    tokens
}

/// Parse IR text into a program.
pub fn parse_ir(source: &str) -> Vec<Instruction> {
    let mut program = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if line.contains("# IR BEGIN") || line.contains("IR END") {
            continue;
        }

        let mut tokens = tokenize(line).into_iter();
        let Some(head) = tokens.next() else {
            continue;
        };

        let kind = if head.quoted {
            InstructionType::Nop
        } else {
            InstructionType::from_mnemonic(&head.text)
        };

        let mut operands = Vec::new();
        let mut literal = None;
        for (i, token) in tokens.enumerate() {
            if i == 0 && token.quoted {
                literal = Some(parse_literal(&token.text).unwrap_or_else(|| Value::Str(token.text.clone())));
            }
            operands.push(token.text);
        }

        program.push(Instruction {
            kind,
            operands,
            literal,
            line: index + 1,
        });
    }

    program
}

#[derive(Serialize)]
struct DumpEntry<'a> {
    pc: usize,
    op: &'static str,
    operands: &'a [String],
    line: usize,
}

/// Render a loaded program as JSON for `--dump-ir`.
pub fn dump_json(program: &[Instruction]) -> serde_json::Result<String> {
    let entries: Vec<DumpEntry<'_>> = program
        .iter()
        .enumerate()
        .map(|(pc, instr)| DumpEntry {
            pc,
            op: instr.kind.mnemonic(),
            operands: &instr.operands,
            line: instr.line,
        })
        .collect();
    serde_json::to_string_pretty(&entries)
}

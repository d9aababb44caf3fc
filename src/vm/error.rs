//! VM error taxonomy.
//!
//! Control-flow instructions raise these as typed errors. They are caught
//! once at the `execute()` boundary. Built-in functions report failures with
//! sentinel values instead.

use std::fmt;

use thiserror::Error;

/// Source position of the instruction that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}:{}", self.line, col),
            None => write!(f, "{}", self.line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Control-flow or logic failure: undefined function, division by zero,
    /// unknown label, explicit THROW.
    #[error("Runtime Error: {message}")]
    Runtime {
        message: String,
        location: Option<SourceLocation>,
    },

    /// Unsupported operand-type combination.
    #[error("Type Error: {message}")]
    Type {
        message: String,
        location: Option<SourceLocation>,
    },

    /// Stack underflow or malformed operands.
    #[error("Access Error: {message}")]
    Access {
        message: String,
        location: Option<SourceLocation>,
    },

    /// Allocator failure or heap limit breach.
    #[error("Memory Error: {message}")]
    Memory {
        message: String,
        location: Option<SourceLocation>,
    },
}

fn at_line(line: usize) -> Option<SourceLocation> {
    (line > 0).then_some(SourceLocation { line, column: None })
}

impl VmError {
    pub fn runtime(message: impl Into<String>, line: usize) -> Self {
        VmError::Runtime {
            message: message.into(),
            location: at_line(line),
        }
    }

    pub fn type_error(message: impl Into<String>, line: usize) -> Self {
        VmError::Type {
            message: message.into(),
            location: at_line(line),
        }
    }

    pub fn access(message: impl Into<String>, line: usize) -> Self {
        VmError::Access {
            message: message.into(),
            location: at_line(line),
        }
    }

    pub fn memory(message: impl Into<String>, line: usize) -> Self {
        VmError::Memory {
            message: message.into(),
            location: at_line(line),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            VmError::Runtime { message, .. }
            | VmError::Type { message, .. }
            | VmError::Access { message, .. }
            | VmError::Memory { message, .. } => message,
        }
    }

    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            VmError::Runtime { location, .. }
            | VmError::Type { location, .. }
            | VmError::Access { location, .. }
            | VmError::Memory { location, .. } => *location,
        }
    }

    pub fn line(&self) -> Option<usize> {
        self.location().map(|loc| loc.line)
    }

    /// Attach a line to an error raised without one (e.g. from a built-in).
    pub fn with_line(mut self, line: usize) -> Self {
        let slot = match &mut self {
            VmError::Runtime { location, .. }
            | VmError::Type { location, .. }
            | VmError::Access { location, .. }
            | VmError::Memory { location, .. } => location,
        };
        if slot.is_none() {
            *slot = at_line(line);
        }
        self
    }
}

/// Failure to load an IR program.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("program contains no instructions")]
    EmptyProgram,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            VmError::runtime("Division by zero error", 3).to_string(),
            "Runtime Error: Division by zero error"
        );
        assert_eq!(VmError::type_error("x", 1).to_string(), "Type Error: x");
        assert_eq!(VmError::access("x", 1).to_string(), "Access Error: x");
        assert_eq!(VmError::memory("x", 1).to_string(), "Memory Error: x");
    }

    #[test]
    fn test_line_zero_means_unknown() {
        assert_eq!(VmError::runtime("x", 0).line(), None);
        assert_eq!(VmError::runtime("x", 7).line(), Some(7));
    }

    #[test]
    fn test_with_line_keeps_existing() {
        let err = VmError::runtime("x", 2).with_line(9);
        assert_eq!(err.line(), Some(2));
        let err = VmError::runtime("x", 0).with_line(9);
        assert_eq!(err.line(), Some(9));
    }
}

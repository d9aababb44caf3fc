//! Growable buffer of machine code with rel32 label patching.

use std::collections::HashMap;

use super::memory::{ExecutableMemory, MemoryError};

#[derive(Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    /// (offset of the rel32 field, label)
    forward_refs: Vec<(usize, String)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Bind `name` to the current offset.
    pub fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.code.len());
    }

    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Emit a zero rel32 placeholder to be patched against `label`.
    pub fn emit_label_ref(&mut self, label: &str) {
        self.forward_refs.push((self.code.len(), label.to_string()));
        self.emit_u32(0);
    }

    /// Resolve every pending rel32 reference, measured from the end of the
    /// 4-byte field.
    pub fn patch_forward_refs(&mut self) -> Result<(), String> {
        for (offset, label) in self.forward_refs.drain(..) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| format!("undefined label: {}", label))?;
            let rel = target as i64 - (offset as i64 + 4);
            let rel = i32::try_from(rel)
                .map_err(|_| format!("relative offset out of range for label: {}", label))?;
            self.code[offset..offset + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    /// Patch references and copy the code into sealed executable memory.
    pub fn finalize(mut self) -> Result<ExecutableMemory, MemoryError> {
        self.patch_forward_refs()
            .map_err(|_| MemoryError::InvalidSize)?;
        let mut mem = ExecutableMemory::new(self.code.len())?;
        mem.write(0, &self.code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

//! VM-owned resource tables: managed objects, raw blocks and open files.
//!
//! Each table owns its entries outright. Removing an entry hands its memory
//! back to the allocator exactly once; a second removal finds nothing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};

use super::alloc::{Block, SharedAllocator};
use super::value::{ObjectId, Value};

/// First id handed out by [`FileTable`].
pub const FIRST_FILE_HANDLE: i64 = 1000;

/// A typed, zero-initialised buffer created by `new` or `PTR_new`.
#[derive(Debug)]
pub struct ManagedObject {
    data: Block,
    type_tag: String,
}

impl ManagedObject {
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn size(&self) -> usize {
        self.data.size()
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    /// Decode the stored value according to the type tag.
    pub fn load(&self) -> Value {
        let bytes = self.data.bytes();
        let mut word = [0u8; 8];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);

        match self.type_tag.as_str() {
            "int" => {
                let mut half = [0u8; 4];
                half.copy_from_slice(&word[..4]);
                Value::Int(i32::from_le_bytes(half))
            }
            "float" | "double" => Value::Double(f64::from_le_bytes(word)),
            "bool" => Value::Bool(word[0] != 0),
            _ => Value::Long(i64::from_le_bytes(word)),
        }
    }
}

/// Default byte size of a managed object of the given type.
pub fn size_for_type(type_tag: &str) -> usize {
    match type_tag {
        "int" | "bool" => 4,
        "float" | "double" => 8,
        "string" => 24,
        _ => 8,
    }
}

pub struct ObjectTable {
    allocator: SharedAllocator,
    objects: HashMap<ObjectId, ManagedObject>,
    next_id: ObjectId,
}

impl ObjectTable {
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            allocator,
            objects: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate a zeroed object. Returns `None` if the allocator fails.
    pub fn create(&mut self, type_tag: &str, size: usize) -> Option<ObjectId> {
        let data = self.allocator.borrow_mut().allocate(size)?;
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(
            id,
            ManagedObject {
                data,
                type_tag: type_tag.to_string(),
            },
        );
        Some(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.objects.get(&id)
    }

    /// Free an object. Returns false if it was already gone.
    pub fn free(&mut self, id: ObjectId) -> bool {
        match self.objects.remove(&id) {
            Some(object) => {
                self.allocator.borrow_mut().deallocate(object.data);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.objects.values().map(ManagedObject::size).sum()
    }

    pub fn clear(&mut self) {
        let mut allocator = self.allocator.borrow_mut();
        for (_, object) in self.objects.drain() {
            allocator.deallocate(object.data);
        }
    }
}

impl Drop for ObjectTable {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Untyped blocks handed out by `MEM_malloc`, keyed by a synthetic address.
pub struct RawBlockTable {
    allocator: SharedAllocator,
    blocks: HashMap<i64, Block>,
    next_address: i64,
}

impl RawBlockTable {
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            allocator,
            blocks: HashMap::new(),
            next_address: 1,
        }
    }

    pub fn malloc(&mut self, size: usize) -> Option<i64> {
        let block = self.allocator.borrow_mut().allocate(size)?;
        let address = self.next_address;
        self.next_address += 1;
        self.blocks.insert(address, block);
        Some(address)
    }

    /// Free a block. Unknown or already freed addresses are ignored.
    pub fn free(&mut self, address: i64) -> bool {
        match self.blocks.remove(&address) {
            Some(block) => {
                self.allocator.borrow_mut().deallocate(block);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, address: i64) -> bool {
        self.blocks.contains_key(&address)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.blocks.values().map(Block::size).sum()
    }

    pub fn clear(&mut self) {
        let mut allocator = self.allocator.borrow_mut();
        for (_, block) in self.blocks.drain() {
            allocator.deallocate(block);
        }
    }
}

impl Drop for RawBlockTable {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Open files, keyed by handle id.
#[derive(Debug)]
pub struct FileTable {
    handles: HashMap<i64, File>,
    next_id: i64,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_id: FIRST_FILE_HANDLE,
        }
    }

    /// Open `path`. Mode letters: `w` truncates, `a` appends, `+` adds the
    /// other direction, anything else reads.
    pub fn open(&mut self, path: &str, mode: &str) -> io::Result<i64> {
        let mut options = OpenOptions::new();
        if mode.contains('w') {
            options.write(true).create(true).truncate(true);
        } else if mode.contains('a') {
            options.append(true).create(true);
        } else {
            options.read(true);
        }
        if mode.contains('+') {
            options.read(true);
            if !mode.contains('a') {
                options.write(true);
            }
        }

        let file = options.open(path)?;
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, file);
        Ok(id)
    }

    pub fn close(&mut self, id: i64) -> bool {
        self.handles.remove(&id).is_some()
    }

    pub fn is_open(&self, id: i64) -> bool {
        self.handles.contains_key(&id)
    }

    /// Write `content` and flush. Returns the number of chars written.
    pub fn write(&mut self, id: i64, content: &str) -> Option<io::Result<usize>> {
        let file = self.handles.get_mut(&id)?;
        Some(
            file.write_all(content.as_bytes())
                .and_then(|_| file.flush())
                .map(|_| content.chars().count()),
        )
    }

    /// Read everything from the current position to the end.
    pub fn read_to_end(&mut self, id: i64) -> Option<io::Result<String>> {
        let file = self.handles.get_mut(&id)?;
        let mut text = String::new();
        Some(file.read_to_string(&mut text).map(|_| text))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}

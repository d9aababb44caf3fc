//! Executable memory for JIT output.
//!
//! Pages are mapped read-write, filled, then flipped to read-execute with
//! `mprotect`. They are never writable and executable at the same time.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    /// The platform fallback is plain heap memory and cannot run code.
    #[error("memory is not executable on this platform")]
    NotExecutable,
}

/// A page-aligned block of memory that becomes executable once sealed.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map `size` bytes (rounded up to whole pages) as read-write.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);
        let ptr = Self::map(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    #[cfg(unix)]
    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    #[cfg(not(unix))]
    fn page_size() -> usize {
        4096
    }

    #[cfg(unix)]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        NonNull::new(ptr.cast::<u8>()).ok_or(MemoryError::AllocationFailed)
    }

    /// Stub: heap memory that is never made executable.
    #[cfg(not(unix))]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `data` in at `offset`. Fails once the memory is executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        let end = offset
            .checked_add(data.len())
            .ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }

        // SAFETY: bounds checked above and the region is writable.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the pages to read-execute.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        // SAFETY: ptr/size describe a mapping we own.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        Err(MemoryError::NotExecutable)
    }

    /// Reinterpret the start of the memory as a function pointer.
    ///
    /// # Safety
    /// `F` must be a function pointer type whose signature matches the code
    /// written into this memory.
    pub unsafe fn as_fn<F: Copy>(&self) -> Option<F> {
        if !self.executable || std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return None;
        }
        let addr = self.ptr.as_ptr() as usize;
        // SAFETY: F is pointer-sized and the caller vouches for the signature.
        Some(unsafe { std::mem::transmute_copy::<usize, F>(&addr) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: unmapping the region mapped in `new`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.size);
        }
        #[cfg(not(unix))]
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
            // SAFETY: allocated in `map` with this layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

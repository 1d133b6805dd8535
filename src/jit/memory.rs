//! Executable memory management using mmap.
//!
//! Compiled methods are bump-allocated out of page-aligned RWX mappings
//! ("page holders"). Code is never freed: a method's native code lives as
//! long as the process.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("invalid allocation size {0}")]
    InvalidSize(usize),
}

/// Allocation granularity inside a holder.
const ALIGN: usize = 16;

/// Number of holders mapped up front.
const INITIAL_HOLDERS: usize = 4;

/// Get the page size for the current system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// One RWX mapping with a bump pointer.
pub struct PageHolder {
    ptr: NonNull<u8>,
    size: usize,
    used: usize,
}

impl PageHolder {
    /// Map `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let page = page_size();
        let size = size.div_ceil(page) * page;
        let ptr = Self::mmap_rwx(size)?;
        Ok(Self { ptr, size, used: 0 })
    }

    #[cfg(unix)]
    fn mmap_rwx(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(size));
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed(size))
    }

    #[cfg(not(unix))]
    fn mmap_rwx(size: usize) -> Result<NonNull<u8>, MemoryError> {
        Err(MemoryError::AllocationFailed(size))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.size - self.used
    }

    /// Reserve `size` bytes at a 16-byte aligned offset.
    fn bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let start = self.used.next_multiple_of(ALIGN);
        let end = start.checked_add(size)?;
        if end > self.size {
            return None;
        }
        self.used = end;
        // SAFETY: start < size, inside the mapping
        Some(unsafe { self.ptr.add(start) })
    }
}

// Holders are only touched under the manager's mutex; handed out regions
// are written once and then only executed.
unsafe impl Send for PageHolder {}

/// Arena of page holders.
pub struct PageManager {
    holders: Vec<PageHolder>,
}

impl PageManager {
    /// Start with four holders of one to four pages.
    pub fn new() -> Result<Self, MemoryError> {
        let page = page_size();
        let holders = (0..INITIAL_HOLDERS)
            .map(|i| PageHolder::new(page * (i + 1)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { holders })
    }

    pub fn holders(&self) -> usize {
        self.holders.len()
    }

    /// Reserve `size` bytes of executable memory.
    pub fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        for holder in &mut self.holders {
            if let Some(ptr) = holder.bump(size) {
                return Ok(ptr);
            }
        }
        let mut holder = PageHolder::new(size)?;
        let ptr = holder.bump(size).ok_or(MemoryError::InvalidSize(size))?;
        self.holders.push(holder);
        Ok(ptr)
    }

    /// Copy `bytes` into fresh executable memory.
    pub fn install(&mut self, bytes: &[u8]) -> Result<NonNull<u8>, MemoryError> {
        let ptr = self.acquire(bytes.len())?;
        // SAFETY: the region was just reserved for exactly this many bytes
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        flush_instruction_cache(ptr.as_ptr(), bytes.len());
        Ok(ptr)
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_instruction_cache(start: *mut u8, len: usize) {
    unsafe extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    // SAFETY: the range lies inside one mapping
    unsafe {
        __clear_cache(start as *mut libc::c_char, start.add(len) as *mut libc::c_char);
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_instruction_cache(_start: *mut u8, _len: usize) {}

impl Drop for PageHolder {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_holders() {
        let manager = PageManager::new().unwrap();
        assert_eq!(manager.holders(), 4);
        assert_eq!(manager.holders[3].size(), 4 * page_size());
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut manager = PageManager::new().unwrap();
        let a = manager.acquire(5).unwrap().as_ptr() as usize;
        let b = manager.acquire(5).unwrap().as_ptr() as usize;
        assert_eq!(a % ALIGN, 0);
        assert_eq!(b % ALIGN, 0);
        assert!(b >= a + 5);
    }

    #[test]
    fn test_large_request_maps_new_holder() {
        let mut manager = PageManager::new().unwrap();
        let size = 10 * page_size() + 1;
        manager.acquire(size).unwrap();
        assert_eq!(manager.holders(), 5);
        assert_eq!(manager.holders[4].size(), 11 * page_size());
    }

    #[test]
    fn test_install_copies_bytes() {
        let mut manager = PageManager::new().unwrap();
        let code = [0x90u8, 0x90, 0xC3];
        let ptr = manager.install(&code).unwrap();
        let copied = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 3) };
        assert_eq!(copied, &code);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut manager = PageManager::new().unwrap();
        assert!(matches!(manager.acquire(0), Err(MemoryError::InvalidSize(0))));
    }
}

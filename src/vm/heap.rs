//! Object and array storage.
//!
//! Everything here is plain 64-bit words so that compiled code can address
//! it directly. Memory is owned by the [`Heap`] and released only when the
//! heap is dropped.

use std::sync::Mutex;

use super::{ElementKind, RuntimeFault};

/// Largest element count of a single array.
const MAX_ARRAY_ELEMENTS: i64 = 1 << 32;

// =============================================================================
// Heap
// =============================================================================

struct Block {
    ptr: *mut u64,
    words: usize,
}

/// Word allocator shared by all threads of a VM.
pub struct Heap {
    blocks: Mutex<Vec<Block>>,
}

// Blocks are only created and freed under the mutex; their contents are
// accessed through raw references handed out by the heap.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Allocate `words` zeroed words.
    pub fn alloc_words(&self, words: usize) -> *mut u64 {
        let words = words.max(1);
        let ptr = Box::into_raw(vec![0u64; words].into_boxed_slice()) as *mut u64;
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Block { ptr, words });
        ptr
    }

    /// Number of live allocations.
    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// A zeroed instance of `class_id`. The reference points at field 0;
    /// the class id sits in the word before it.
    pub fn new_object(&self, class_id: usize, fields: usize) -> u64 {
        let ptr = self.alloc_words(fields + 1);
        // SAFETY: the block has at least two words
        unsafe {
            *ptr = class_id as u64;
            ptr.add(1) as u64
        }
    }

    /// A zeroed array with the given extents, first dimension first.
    pub fn new_array(&self, kind: ElementKind, extents: &[i64]) -> Result<ArrayRef, RuntimeFault> {
        let mut size: i64 = 1;
        for &extent in extents {
            size = match size.checked_mul(extent) {
                Some(s) if extent >= 0 && s <= MAX_ARRAY_ELEMENTS => s,
                _ => return Err(RuntimeFault::InvalidArraySize { size: extent }),
            };
        }
        if extents.is_empty() {
            return Err(RuntimeFault::InvalidArraySize { size: 0 });
        }

        let elements = size as usize + kind.has_terminator() as usize;
        let data_words = (elements * kind.size()).div_ceil(8);
        let ptr = self.alloc_words(2 + extents.len() + data_words);
        // SAFETY: header words are inside the fresh block
        unsafe {
            *ptr = size as u64;
            *ptr.add(1) = extents.len() as u64;
            for (j, extent) in extents.iter().enumerate() {
                *ptr.add(2 + j) = *extent as u64;
            }
        }
        Ok(ArrayRef { ptr })
    }

    /// A char array holding `s`.
    pub fn new_string(&self, s: &str) -> ArrayRef {
        let chars: Vec<char> = s.chars().collect();
        let array = ArrayRef {
            ptr: self.alloc_words(3 + (chars.len() + 1).div_ceil(2)),
        };
        // SAFETY: header plus room for every char and the terminator
        unsafe {
            *array.ptr = chars.len() as u64;
            *array.ptr.add(1) = 1;
            *array.ptr.add(2) = chars.len() as u64;
        }
        array.write_str(s);
        array
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let blocks = std::mem::take(self.blocks.get_mut().unwrap_or_else(|e| e.into_inner()));
        for block in blocks {
            // SAFETY: produced by Box::into_raw with exactly this length
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    block.ptr,
                    block.words,
                )));
            }
        }
    }
}

/// Class id of an object reference.
///
/// # Safety
/// `object` must be a non-nil reference returned by [`Heap::new_object`].
pub unsafe fn object_class(object: u64) -> usize {
    unsafe { *(object as *const u64).sub(1) as usize }
}

/// Word `id` of an object or class memory block.
///
/// # Safety
/// `base` must be a live object or class memory reference with more than
/// `id` words.
pub unsafe fn read_word(base: u64, id: i64) -> u64 {
    unsafe { *(base as *const u64).offset(id as isize) }
}

/// # Safety
/// As for [`read_word`].
pub unsafe fn write_word(base: u64, id: i64, value: u64) {
    unsafe { *(base as *mut u64).offset(id as isize) = value }
}

// =============================================================================
// ArrayRef
// =============================================================================

/// A reference to `[size, dims, extents.., data]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRef {
    ptr: *mut u64,
}

impl ArrayRef {
    /// `None` for nil.
    ///
    /// # Safety
    /// A non-zero `word` must be an array reference from a live heap.
    pub unsafe fn from_word(word: u64) -> Option<Self> {
        (word != 0).then_some(Self {
            ptr: word as *mut u64,
        })
    }

    pub fn word(self) -> u64 {
        self.ptr as u64
    }

    pub fn size(self) -> i64 {
        unsafe { *self.ptr as i64 }
    }

    pub fn dims(self) -> usize {
        unsafe { *self.ptr.add(1) as usize }
    }

    /// Extent of dimension `j`.
    pub fn extent(self, j: usize) -> i64 {
        debug_assert!(j < self.dims());
        unsafe { *self.ptr.add(2 + j) as i64 }
    }

    /// Row-major flat index, computed with wrapping arithmetic like the
    /// native code does.
    pub fn flat_index(self, indices: &[i64]) -> i64 {
        let mut index = indices.first().copied().unwrap_or(0);
        for (j, next) in indices.iter().enumerate().skip(1) {
            let extent = if j < self.dims() { self.extent(j) } else { 1 };
            index = index.wrapping_mul(extent).wrapping_add(*next);
        }
        index
    }

    fn data(self) -> *mut u8 {
        unsafe { self.ptr.add(2 + self.dims()) as *mut u8 }
    }

    /// Element `index`, zero-extended; floats as bits.
    pub fn get(self, kind: ElementKind, index: i64) -> Option<u64> {
        if index < 0 || index >= self.size() {
            return None;
        }
        let at = unsafe { self.data().add((index as usize) << kind.shift()) };
        // SAFETY: index checked against the size; data is 8-byte aligned
        Some(unsafe {
            match kind {
                ElementKind::Byte => *at as u64,
                ElementKind::Char => *(at as *const u32) as u64,
                ElementKind::Int | ElementKind::Float => *(at as *const u64),
            }
        })
    }

    /// Store element `index`, truncating to the element width.
    pub fn set(self, kind: ElementKind, index: i64, value: u64) -> bool {
        if index < 0 || index >= self.size() {
            return false;
        }
        let at = unsafe { self.data().add((index as usize) << kind.shift()) };
        unsafe {
            match kind {
                ElementKind::Byte => *at = value as u8,
                ElementKind::Char => *(at as *mut u32) = value as u32,
                ElementKind::Int | ElementKind::Float => *(at as *mut u64) = value,
            }
        }
        true
    }

    /// Zero every element.
    pub fn zero(self, kind: ElementKind) {
        let bytes = self.size() as usize * kind.size();
        unsafe { std::ptr::write_bytes(self.data(), 0, bytes) }
    }

    /// Copy `len` elements from `src[src_offset..]` into `self[offset..]`.
    /// Returns false, copying nothing, if either range is out of bounds.
    pub fn copy_from(self, kind: ElementKind, offset: i64, src: ArrayRef, src_offset: i64, len: i64) -> bool {
        let fits = |array: ArrayRef, start: i64| {
            start >= 0 && len >= 0 && start.checked_add(len).is_some_and(|end| end <= array.size())
        };
        if !fits(self, offset) || !fits(src, src_offset) {
            return false;
        }
        let shift = kind.shift();
        // SAFETY: both ranges checked; ptr::copy handles overlap
        unsafe {
            std::ptr::copy(
                src.data().add((src_offset as usize) << shift),
                self.data().add((offset as usize) << shift),
                (len as usize) << shift,
            );
        }
        true
    }

    /// Read a char array up to its size or the first NUL.
    pub fn read_string(self) -> String {
        (0..self.size())
            .map_while(|i| self.get(ElementKind::Char, i))
            .take_while(|c| *c != 0)
            .map(|c| char::from_u32(c as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    /// Overwrite a char array with `s`, truncated to fit, NUL terminated
    /// when shorter than the array.
    pub fn write_str(self, s: &str) {
        let mut written = 0;
        for (i, c) in s.chars().enumerate() {
            if !self.set(ElementKind::Char, i as i64, c as u64) {
                break;
            }
            written = i as i64 + 1;
        }
        // the terminator slot past `size` always exists for char arrays
        let at = unsafe { self.data().add((written as usize) << ElementKind::Char.shift()) };
        unsafe { *(at as *mut u32) = 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_layout() {
        let heap = Heap::new();
        let a = heap.new_array(ElementKind::Int, &[3, 4]).unwrap();
        assert_eq!(a.size(), 12);
        assert_eq!(a.dims(), 2);
        assert_eq!(a.extent(1), 4);
        assert_eq!(a.flat_index(&[2, 3]), 11);
        assert!(a.set(ElementKind::Int, 11, 99));
        assert_eq!(a.get(ElementKind::Int, 11), Some(99));
        assert_eq!(a.get(ElementKind::Int, 12), None);
        assert_eq!(a.get(ElementKind::Int, -1), None);
    }

    #[test]
    fn test_negative_extent() {
        let heap = Heap::new();
        assert_eq!(
            heap.new_array(ElementKind::Byte, &[2, -1]),
            Err(RuntimeFault::InvalidArraySize { size: -1 })
        );
    }

    #[test]
    fn test_strings() {
        let heap = Heap::new();
        let s = heap.new_string("héllo");
        assert_eq!(s.size(), 5);
        assert_eq!(s.read_string(), "héllo");
        s.write_str("hi");
        assert_eq!(s.read_string(), "hi");
        s.write_str("much too long");
        assert_eq!(s.read_string(), "much ");
    }

    #[test]
    fn test_copy_and_zero() {
        let heap = Heap::new();
        let a = heap.new_array(ElementKind::Char, &[4]).unwrap();
        let b = heap.new_array(ElementKind::Char, &[4]).unwrap();
        for i in 0..4 {
            a.set(ElementKind::Char, i, 10 + i as u64);
        }
        assert!(b.copy_from(ElementKind::Char, 1, a, 0, 3));
        assert_eq!(b.get(ElementKind::Char, 3), Some(12));
        assert!(!b.copy_from(ElementKind::Char, 2, a, 0, 3));
        b.zero(ElementKind::Char);
        assert_eq!(b.get(ElementKind::Char, 3), Some(0));
    }

    #[test]
    fn test_objects() {
        let heap = Heap::new();
        let obj = heap.new_object(7, 2);
        unsafe {
            assert_eq!(object_class(obj), 7);
            write_word(obj, 1, 5);
            assert_eq!(read_word(obj, 1), 5);
        }
        assert_eq!(heap.block_count(), 1);
    }
}

//! The VM operand stack.
//!
//! Compiled code addresses the stack through two raw pointers, the word
//! array and the position word, so the same layout is used everywhere:
//! `pos` counts the words in use and `base[pos - 1]` is the top.
//!
//! `base[-1]` holds the capacity. Compiled code compares the position
//! against it before every push.

use super::RuntimeFault;

/// An owned operand stack.
pub struct OperandStack {
    /// The capacity word followed by `capacity` value words.
    words: Box<[u64]>,
    pos: Box<i64>,
    capacity: usize,
}

impl OperandStack {
    pub fn new(capacity: usize) -> Self {
        let mut words = vec![0; capacity + 1].into_boxed_slice();
        words[0] = capacity as u64;
        Self {
            words,
            pos: Box::new(0),
            capacity,
        }
    }

    /// A handle for pushing and popping. The handle borrows nothing, so it
    /// must not outlive the stack.
    pub fn handle(&mut self) -> StackRef {
        StackRef {
            // SAFETY: the slice always holds the capacity word
            base: unsafe { self.words.as_mut_ptr().add(1) },
            pos: &mut *self.pos,
            capacity: self.capacity,
        }
    }

    pub fn len(&self) -> usize {
        *self.pos as usize
    }

    pub fn is_empty(&self) -> bool {
        *self.pos == 0
    }

    /// Words in use, bottom first.
    pub fn values(&self) -> &[u64] {
        &self.words[1..=self.len().min(self.capacity)]
    }
}

/// Raw view of an operand stack, as passed to and from native code.
#[derive(Debug, Clone, Copy)]
pub struct StackRef {
    base: *mut u64,
    pos: *mut i64,
    capacity: usize,
}

impl StackRef {
    /// # Safety
    /// `base` must point at `capacity` words preceded by the capacity word,
    /// and `pos` at the position word of the same stack, both valid while
    /// the handle is used.
    pub unsafe fn from_raw(base: *mut u64, pos: *mut i64, capacity: usize) -> Self {
        Self { base, pos, capacity }
    }

    pub fn base(self) -> *mut u64 {
        self.base
    }

    pub fn pos_ptr(self) -> *mut i64 {
        self.pos
    }

    pub fn len(self) -> usize {
        unsafe { *self.pos as usize }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn push(self, value: u64) -> Result<(), RuntimeFault> {
        let pos = self.len();
        if pos >= self.capacity {
            return Err(RuntimeFault::StackOverflow);
        }
        unsafe {
            *self.base.add(pos) = value;
            *self.pos += 1;
        }
        Ok(())
    }

    pub fn pop(self) -> Result<u64, RuntimeFault> {
        let pos = unsafe { *self.pos };
        if pos <= 0 {
            return Err(RuntimeFault::StackUnderflow);
        }
        unsafe {
            *self.pos -= 1;
            Ok(*self.base.add(pos as usize - 1))
        }
    }

    pub fn push_int(self, value: i64) -> Result<(), RuntimeFault> {
        self.push(value as u64)
    }

    pub fn pop_int(self) -> Result<i64, RuntimeFault> {
        self.pop().map(|v| v as i64)
    }

    pub fn push_float(self, value: f64) -> Result<(), RuntimeFault> {
        self.push(value.to_bits())
    }

    pub fn pop_float(self) -> Result<f64, RuntimeFault> {
        self.pop().map(f64::from_bits)
    }
}

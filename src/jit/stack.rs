//! Compile-time simulation of the operand stack.

use super::regalloc::{RegClass, RegisterHandle};

/// A frame-pointer relative memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub offset: i32,
    pub class: RegClass,
}

/// Where a value of the simulated stack currently lives.
#[derive(Debug)]
pub enum ValueDescriptor {
    ImmInt(i64),
    ImmFloat(f64),
    Reg(RegisterHandle),
    Mem(FrameSlot),
}

impl ValueDescriptor {
    pub fn class(&self) -> RegClass {
        match self {
            ValueDescriptor::ImmInt(_) => RegClass::General,
            ValueDescriptor::ImmFloat(_) => RegClass::Float,
            ValueDescriptor::Reg(handle) => handle.class(),
            ValueDescriptor::Mem(slot) => slot.class,
        }
    }

    pub fn is_float(&self) -> bool {
        self.class() == RegClass::Float
    }
}

/// LIFO of value descriptors. Index 0 is the bottom.
#[derive(Debug, Default)]
pub struct WorkingStack {
    values: Vec<ValueDescriptor>,
}

impl WorkingStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: ValueDescriptor) {
        self.values.push(value);
    }

    pub fn pop(&mut self) -> Option<ValueDescriptor> {
        self.values.pop()
    }

    pub fn peek(&self) -> Option<&ValueDescriptor> {
        self.values.last()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ValueDescriptor> {
        self.values.get(index)
    }

    pub fn replace(&mut self, index: usize, value: ValueDescriptor) -> ValueDescriptor {
        std::mem::replace(&mut self.values[index], value)
    }

    /// Remove the topmost `count` values, bottom-most first.
    pub fn split_top(&mut self, count: usize) -> Vec<ValueDescriptor> {
        let at = self.values.len().saturating_sub(count);
        self.values.split_off(at)
    }

    /// Positions of deferred loads from the frame slot at `offset`.
    pub fn slot_users(&self, offset: i32) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match v {
                ValueDescriptor::Mem(slot) if slot.offset == offset => Some(i),
                _ => None,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueDescriptor> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_top_keeps_order() {
        let mut stack = WorkingStack::new();
        stack.push(ValueDescriptor::ImmInt(1));
        stack.push(ValueDescriptor::ImmInt(2));
        stack.push(ValueDescriptor::ImmInt(3));
        let top = stack.split_top(2);
        assert!(matches!(top[0], ValueDescriptor::ImmInt(2)));
        assert!(matches!(top[1], ValueDescriptor::ImmInt(3)));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_slot_users() {
        let slot = FrameSlot { offset: -72, class: RegClass::General };
        let mut stack = WorkingStack::new();
        stack.push(ValueDescriptor::Mem(slot));
        stack.push(ValueDescriptor::ImmFloat(1.0));
        stack.push(ValueDescriptor::Mem(slot));
        assert_eq!(stack.slot_users(-72), vec![0, 2]);
        assert!(stack.slot_users(-80).is_empty());
        assert!(stack.peek().is_some_and(|v| !v.is_float()));
    }
}

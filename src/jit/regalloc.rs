//! Register allocation for one method compilation.
//!
//! Registers live in a small arena of slots; each pool is a stack of free
//! slot ids. Handles are move-only, so a handle cannot be released twice or
//! used after release without the borrow checker noticing.

use super::emitter::{Emitter, FReg, Reg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    General,
    Float,
}

/// Pool a handle was drawn from and must return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Primary,
    Auxiliary,
    Float,
    /// Handed out after exhaustion; owns nothing.
    Fabricated,
}

impl Pool {
    fn index(self) -> Option<usize> {
        match self {
            Pool::Primary => Some(0),
            Pool::Auxiliary => Some(1),
            Pool::Float => Some(2),
            Pool::Fabricated => None,
        }
    }
}

/// An owned claim on one physical register.
#[derive(Debug, PartialEq, Eq)]
pub struct RegisterHandle {
    slot: u8,
    pool: Pool,
    hw: u8,
    class: RegClass,
}

impl RegisterHandle {
    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn class(&self) -> RegClass {
        self.class
    }

    pub fn is_float(&self) -> bool {
        self.class == RegClass::Float
    }

    /// The register as a general-purpose one.
    pub fn reg(&self) -> Reg {
        debug_assert_eq!(self.class, RegClass::General);
        Reg(self.hw)
    }

    /// The register as a floating-point one.
    pub fn freg(&self) -> FReg {
        debug_assert_eq!(self.class, RegClass::Float);
        FReg(self.hw)
    }

    /// Whether the value in this register dies across a bridge call.
    pub fn is_caller_saved(&self) -> bool {
        matches!(self.pool, Pool::Primary | Pool::Float)
    }
}

/// Per-compilation register pools.
pub struct RegisterAllocator {
    /// slot id -> hardware register number
    slots: Vec<u8>,
    free: [Vec<u8>; 3],
    capacity: [usize; 3],
    fallback: Reg,
    fallback_float: FReg,
    exhausted: bool,
}

impl RegisterAllocator {
    pub fn new(
        primary: &[Reg],
        auxiliary: &[Reg],
        floats: &[FReg],
        fallback: Reg,
        fallback_float: FReg,
    ) -> Self {
        let mut slots = Vec::new();
        let mut free: [Vec<u8>; 3] = Default::default();
        let pools = [
            primary.iter().map(|r| r.0).collect::<Vec<_>>(),
            auxiliary.iter().map(|r| r.0).collect(),
            floats.iter().map(|r| r.0).collect(),
        ];
        for (pool, regs) in pools.iter().enumerate() {
            let ids: Vec<u8> = regs
                .iter()
                .map(|hw| {
                    slots.push(*hw);
                    (slots.len() - 1) as u8
                })
                .collect();
            // Reverse so the first listed register is popped first.
            free[pool] = ids.into_iter().rev().collect();
        }
        Self {
            slots,
            capacity: [primary.len(), auxiliary.len(), floats.len()],
            free,
            fallback,
            fallback_float,
            exhausted: false,
        }
    }

    pub fn for_emitter<E: Emitter>() -> Self {
        Self::new(
            E::PRIMARY,
            E::AUXILIARY,
            E::FLOATS,
            E::FALLBACK,
            E::FALLBACK_FLOAT,
        )
    }

    /// Acquire a general-purpose register, primary pool first.
    pub fn acquire(&mut self) -> RegisterHandle {
        for pool in [Pool::Primary, Pool::Auxiliary] {
            if let Some(handle) = self.take(pool, RegClass::General) {
                return handle;
            }
        }
        self.fabricate(RegClass::General, self.fallback.0)
    }

    pub fn acquire_float(&mut self) -> RegisterHandle {
        match self.take(Pool::Float, RegClass::Float) {
            Some(handle) => handle,
            None => self.fabricate(RegClass::Float, self.fallback_float.0),
        }
    }

    pub fn acquire_class(&mut self, class: RegClass) -> RegisterHandle {
        match class {
            RegClass::General => self.acquire(),
            RegClass::Float => self.acquire_float(),
        }
    }

    pub fn release(&mut self, handle: RegisterHandle) {
        if let Some(pool) = handle.pool.index() {
            debug_assert!(!self.free[pool].contains(&handle.slot));
            self.free[pool].push(handle.slot);
        }
    }

    /// Set once any acquisition had to fabricate a handle.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn available(&self, pool: Pool) -> usize {
        pool.index().map_or(0, |i| self.free[i].len())
    }

    pub fn capacity(&self, pool: Pool) -> usize {
        pool.index().map_or(0, |i| self.capacity[i])
    }

    pub fn held(&self, pool: Pool) -> usize {
        self.capacity(pool) - self.available(pool)
    }

    /// Every register is back in its pool.
    pub fn all_free(&self) -> bool {
        (0..3).all(|i| self.free[i].len() == self.capacity[i])
    }

    fn take(&mut self, pool: Pool, class: RegClass) -> Option<RegisterHandle> {
        let index = pool.index()?;
        let slot = self.free[index].pop()?;
        Some(RegisterHandle {
            slot,
            pool,
            hw: self.slots[slot as usize],
            class,
        })
    }

    fn fabricate(&mut self, class: RegClass, hw: u8) -> RegisterHandle {
        self.exhausted = true;
        RegisterHandle {
            slot: u8::MAX,
            pool: Pool::Fabricated,
            hw,
            class,
        }
    }
}

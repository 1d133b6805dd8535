mod fault;
mod heap;
pub mod interpreter;
pub mod manifest;
mod ops;
pub mod runtime;
mod stack;
mod threads;
pub mod verifier;
mod vm;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
#[cfg(feature = "jit")]
use std::sync::OnceLock;

pub use fault::{RuntimeFault, fatal, report_and_exit};
pub use heap::{ArrayRef, Heap};
pub use manifest::LoadError;
pub use ops::{ElementKind, JumpCond, MemoryContext, Op, ReturnType, TrapId};
pub use stack::{OperandStack, StackRef};
pub use verifier::{VerifyError, Verifier};
pub use vm::{Vm, VmStats};

#[cfg(feature = "jit")]
use crate::jit::NativeCode;

/// A bytecode method.
///
/// A method pops its parameters off the operand stack itself, usually with
/// a prelude of `Stor*Var` instructions, and leaves its results there.
#[derive(Debug)]
pub struct Method {
    pub name: String,
    /// `Class:method`, used in diagnostics.
    pub full_name: String,
    pub class_id: usize,
    pub id: usize,
    pub params: usize,
    pub locals: usize,
    pub rtrn: ReturnType,
    pub code: Vec<Op>,
    /// label id -> instruction index
    labels: HashMap<i64, usize>,
    calls: AtomicU32,
    /// Compile outcome; `None` inside means interpret only.
    #[cfg(feature = "jit")]
    pub(crate) native: OnceLock<Option<NativeCode>>,
}

impl Method {
    pub fn new(name: impl Into<String>, params: usize, locals: usize, code: Vec<Op>) -> Self {
        let name = name.into();
        let labels = code
            .iter()
            .enumerate()
            .filter_map(|(ip, op)| match op {
                Op::Lbl { id } => Some((*id, ip)),
                _ => None,
            })
            .collect();
        Self {
            full_name: name.clone(),
            name,
            class_id: 0,
            id: 0,
            params,
            locals,
            rtrn: ReturnType::Nil,
            code,
            labels,
            calls: AtomicU32::new(0),
            #[cfg(feature = "jit")]
            native: OnceLock::new(),
        }
    }

    pub fn returns(mut self, rtrn: ReturnType) -> Self {
        self.rtrn = rtrn;
        self
    }

    pub fn label(&self, id: i64) -> Option<usize> {
        self.labels.get(&id).copied()
    }

    /// Count one invocation; returns the new total.
    pub(crate) fn record_call(&self) -> u32 {
        self.calls.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// The cached native code, if this method was compiled.
    #[cfg(feature = "jit")]
    pub fn native_code(&self) -> Option<&NativeCode> {
        self.native.get().and_then(Option::as_ref)
    }

    /// Whether a compile attempt has been made.
    #[cfg(feature = "jit")]
    pub fn is_compile_attempted(&self) -> bool {
        self.native.get().is_some()
    }
}

#[derive(Debug)]
pub struct Class {
    pub id: usize,
    pub name: String,
    pub parent: Option<usize>,
    /// Instance field count.
    pub fields: usize,
    /// Static field count.
    pub statics: usize,
    pub methods: Vec<Method>,
}

impl Class {
    pub fn new(name: impl Into<String>, fields: usize, statics: usize, methods: Vec<Method>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            parent: None,
            fields,
            statics,
            methods,
        }
    }

    pub fn extends(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// A loaded program: classes indexed by id, methods by (class, method).
#[derive(Debug)]
pub struct Program {
    pub classes: Vec<Class>,
    pub entry: (usize, usize),
}

impl Program {
    /// Number the classes and methods by position.
    pub fn new(mut classes: Vec<Class>, entry: (usize, usize)) -> Self {
        for (cls_id, class) in classes.iter_mut().enumerate() {
            class.id = cls_id;
            for (mthd_id, method) in class.methods.iter_mut().enumerate() {
                method.class_id = cls_id;
                method.id = mthd_id;
                method.full_name = format!("{}:{}", class.name, method.name);
            }
        }
        Self { classes, entry }
    }

    pub fn class(&self, id: usize) -> Option<&Class> {
        self.classes.get(id)
    }

    pub fn method(&self, cls: usize, mthd: usize) -> Option<&Method> {
        self.classes.get(cls)?.methods.get(mthd)
    }

    /// Look a method up by `Class:method`.
    pub fn find_method(&self, full_name: &str) -> Option<&Method> {
        self.classes
            .iter()
            .flat_map(|c| c.methods.iter())
            .find(|m| m.full_name == full_name)
    }

    pub fn entry_method(&self) -> Option<&Method> {
        self.method(self.entry.0, self.entry.1)
    }

    /// Whether `cls` is `ancestor` or derives from it.
    pub fn is_subclass(&self, cls: usize, ancestor: usize) -> bool {
        let mut current = Some(cls);
        // parent chains are acyclic after verification; bound the walk anyway
        for _ in 0..=self.classes.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.class(id).and_then(|c| c.parent),
                None => return false,
            }
        }
        false
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.classes.iter().flat_map(|c| c.methods.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_numbers_methods() {
        let p = Program::new(
            vec![
                Class::new("Base", 1, 0, vec![Method::new("a", 0, 0, vec![Op::Rtrn])]),
                Class::new(
                    "Derived",
                    2,
                    1,
                    vec![
                        Method::new("b", 0, 0, vec![Op::Rtrn]),
                        Method::new("c", 0, 0, vec![Op::Lbl { id: 4 }, Op::Rtrn]),
                    ],
                )
                .extends(0),
            ],
            (1, 1),
        );
        let c = p.find_method("Derived:c").unwrap();
        assert_eq!((c.class_id, c.id), (1, 1));
        assert_eq!(c.label(4), Some(0));
        assert_eq!(p.entry_method().unwrap().name, "c");
        assert!(p.is_subclass(1, 0));
        assert!(!p.is_subclass(0, 1));
    }

    #[test]
    fn test_call_counting() {
        let m = Method::new("m", 0, 0, vec![]);
        assert_eq!(m.record_call(), 1);
        assert_eq!(m.record_call(), 2);
        assert_eq!(m.call_count(), 2);
    }
}

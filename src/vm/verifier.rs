//! Load-time bytecode verifier.
//!
//! Rejects programs the interpreter and the translator would otherwise have
//! to abort on:
//! - variable ids outside the frame or the class's static block
//! - jumps to undefined labels, labels defined twice
//! - calls and allocations naming unknown classes or methods
//! - thread instructions in classes without the instance fields they use
//! - cyclic class hierarchies
//! - operand class mismatches (int vs float) inside a basic block
//!
//! Type checking is block-local: values that cross a label or a jump live
//! on the operand stack and are untyped there.

use std::collections::HashSet;

use thiserror::Error;

use super::{Class, ElementKind, JumpCond, MemoryContext, Method, Op, Program, ReturnType};

/// Operand class of a stack word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Int,
    Float,
    /// Either class, e.g. a call argument
    Any,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Slot::Int => "int",
            Slot::Float => "float",
            Slot::Any => "any",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{method}@{ip}: local {id} outside a frame of {locals}")]
    InvalidLocal {
        method: String,
        ip: usize,
        id: i64,
        locals: usize,
    },
    #[error("{method}@{ip}: static {id} outside a block of {statics}")]
    InvalidStatic {
        method: String,
        ip: usize,
        id: i64,
        statics: usize,
    },
    #[error("{method}@{ip}: negative field id {id}")]
    InvalidField { method: String, ip: usize, id: i64 },
    #[error("{method}@{ip}: jump to undefined label {label}")]
    UndefinedLabel {
        method: String,
        ip: usize,
        label: i64,
    },
    #[error("{method}: label {label} defined twice")]
    DuplicateLabel { method: String, label: i64 },
    #[error("{method}@{ip}: call to unknown method {cls}:{mthd}")]
    UnknownMethod {
        method: String,
        ip: usize,
        cls: usize,
        mthd: usize,
    },
    #[error("{method}@{ip}: unknown class {cls}")]
    UnknownClass { method: String, ip: usize, cls: usize },
    #[error("{method}@{ip}: '{op}' needs {needed} instance fields")]
    MissingFields {
        method: String,
        ip: usize,
        op: &'static str,
        needed: usize,
    },
    #[error("{method}@{ip}: '{op}' needs at least one dimension")]
    InvalidDims {
        method: String,
        ip: usize,
        op: &'static str,
    },
    #[error("{method}@{ip}: asynchronous target {target} must take exactly one parameter")]
    AsyncArity {
        method: String,
        ip: usize,
        target: String,
    },
    #[error("{method}: parameter prelude stores local {id} twice")]
    ParameterPrelude { method: String, id: i64 },
    #[error("{method}@{ip}: '{op}' expects {expected}, found {found}")]
    TypeMismatch {
        method: String,
        ip: usize,
        op: &'static str,
        expected: Slot,
        found: Slot,
    },
    #[error("class {class} is its own ancestor")]
    CyclicHierarchy { class: String },
    #[error("entry point {cls}:{mthd} does not exist")]
    UnknownEntry { cls: usize, mthd: usize },
}

/// Bytecode verifier
pub struct Verifier {
    /// Check operand classes within basic blocks
    pub check_types: bool,
}

impl Default for Verifier {
    fn default() -> Self {
        Self { check_types: true }
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify every class and method of `program`.
    pub fn verify_program(&self, program: &Program) -> Result<(), VerifyError> {
        if program.entry_method().is_none() {
            let (cls, mthd) = program.entry;
            return Err(VerifyError::UnknownEntry { cls, mthd });
        }
        for class in &program.classes {
            self.verify_hierarchy(program, class)?;
            for method in &class.methods {
                self.verify_method(program, class, method)?;
            }
        }
        Ok(())
    }

    fn verify_hierarchy(&self, program: &Program, class: &Class) -> Result<(), VerifyError> {
        let mut seen = HashSet::from([class.id]);
        let mut current = class.parent;
        while let Some(id) = current {
            let Some(parent) = program.class(id) else {
                return Err(VerifyError::UnknownClass {
                    method: class.name.clone(),
                    ip: 0,
                    cls: id,
                });
            };
            if !seen.insert(id) {
                return Err(VerifyError::CyclicHierarchy {
                    class: class.name.clone(),
                });
            }
            current = parent.parent;
        }
        Ok(())
    }

    /// Verify one method of `class`.
    pub fn verify_method(&self, program: &Program, class: &Class, method: &Method) -> Result<(), VerifyError> {
        let name = || method.full_name.clone();

        let mut labels = HashSet::new();
        for op in &method.code {
            if let Op::Lbl { id } = op {
                if !labels.insert(*id) {
                    return Err(VerifyError::DuplicateLabel {
                        method: name(),
                        label: *id,
                    });
                }
            }
        }

        self.verify_prelude(method)?;

        for (ip, op) in method.code.iter().enumerate() {
            if let Some((id, ctx)) = op.variable() {
                match ctx {
                    MemoryContext::Local if id < 0 || id as usize >= method.locals => {
                        return Err(VerifyError::InvalidLocal {
                            method: name(),
                            ip,
                            id,
                            locals: method.locals,
                        });
                    }
                    MemoryContext::Class if id < 0 || id as usize >= class.statics => {
                        return Err(VerifyError::InvalidStatic {
                            method: name(),
                            ip,
                            id,
                            statics: class.statics,
                        });
                    }
                    MemoryContext::Instance if id < 0 => {
                        return Err(VerifyError::InvalidField { method: name(), ip, id });
                    }
                    _ => {}
                }
            }

            match *op {
                Op::Jmp { label, .. } if !labels.contains(&label) => {
                    return Err(VerifyError::UndefinedLabel {
                        method: name(),
                        ip,
                        label,
                    });
                }
                Op::MthdCall { cls, mthd } if program.method(cls, mthd).is_none() => {
                    return Err(VerifyError::UnknownMethod {
                        method: name(),
                        ip,
                        cls,
                        mthd,
                    });
                }
                Op::AsyncMthdCall { cls, mthd } => {
                    let Some(target) = program.method(cls, mthd) else {
                        return Err(VerifyError::UnknownMethod {
                            method: name(),
                            ip,
                            cls,
                            mthd,
                        });
                    };
                    if target.params != 1 {
                        return Err(VerifyError::AsyncArity {
                            method: name(),
                            ip,
                            target: target.full_name.clone(),
                        });
                    }
                    self.require_fields(class, method, ip, op, 1)?;
                }
                Op::ThreadJoin => self.require_fields(class, method, ip, op, 1)?,
                Op::ThreadMutex => self.require_fields(class, method, ip, op, 2)?,
                Op::NewObjInst { cls } | Op::ObjTypeOf { cls } | Op::ObjInstCast { cls }
                    if program.class(cls).is_none() =>
                {
                    return Err(VerifyError::UnknownClass { method: name(), ip, cls });
                }
                Op::NewAry { dims: 0, .. }
                | Op::LoadAryElm { dims: 0, .. }
                | Op::StorAryElm { dims: 0, .. } => {
                    return Err(VerifyError::InvalidDims {
                        method: name(),
                        ip,
                        op: op.name(),
                    });
                }
                _ => {}
            }
        }

        if self.check_types {
            self.verify_types(program, method)?;
        }
        Ok(())
    }

    /// The leading run of local stores pops the parameters; each must land
    /// in its own slot.
    fn verify_prelude(&self, method: &Method) -> Result<(), VerifyError> {
        let mut stored = HashSet::new();
        for op in method.code.iter().take(method.params) {
            match *op {
                Op::StorIntVar { id, ctx: MemoryContext::Local }
                | Op::StorFloatVar { id, ctx: MemoryContext::Local } => {
                    if !stored.insert(id) {
                        return Err(VerifyError::ParameterPrelude {
                            method: method.full_name.clone(),
                            id,
                        });
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn require_fields(
        &self,
        class: &Class,
        method: &Method,
        ip: usize,
        op: &Op,
        needed: usize,
    ) -> Result<(), VerifyError> {
        if class.fields < needed {
            return Err(VerifyError::MissingFields {
                method: method.full_name.clone(),
                ip,
                op: op.name(),
                needed,
            });
        }
        Ok(())
    }

    /// Simulate operand classes through each basic block. The simulated
    /// stack is cleared at labels and jumps; popping past its bottom yields
    /// an untyped word.
    fn verify_types(&self, program: &Program, method: &Method) -> Result<(), VerifyError> {
        let mut stack: Vec<Slot> = Vec::new();

        for (ip, op) in method.code.iter().enumerate() {
            if matches!(op, Op::Lbl { .. }) {
                stack.clear();
                continue;
            }
            if let Op::SwapInt = op {
                let top = stack.pop().unwrap_or(Slot::Any);
                let below = stack.pop().unwrap_or(Slot::Any);
                stack.push(top);
                stack.push(below);
                continue;
            }

            let (pops, pushes) = stack_effect(program, op);
            for expected in pops {
                let found = stack.pop().unwrap_or(Slot::Any);
                if !compatible(expected, found) {
                    return Err(VerifyError::TypeMismatch {
                        method: method.full_name.clone(),
                        ip,
                        op: op.name(),
                        expected,
                        found,
                    });
                }
            }
            stack.extend(pushes);

            if matches!(op, Op::Jmp { .. } | Op::Rtrn) {
                stack.clear();
            }
        }
        Ok(())
    }
}

fn compatible(expected: Slot, found: Slot) -> bool {
    expected == Slot::Any || found == Slot::Any || expected == found
}

fn value_slot(float: bool) -> Slot {
    if float { Slot::Float } else { Slot::Int }
}

fn element_slot(kind: ElementKind) -> Slot {
    value_slot(kind.is_float())
}

fn result_slots(rtrn: ReturnType) -> Vec<Slot> {
    match rtrn {
        ReturnType::Nil => vec![],
        ReturnType::Int => vec![Slot::Int],
        ReturnType::Float => vec![Slot::Float],
    }
}

/// Operand classes popped (top first) and pushed by `op`.
fn stack_effect(program: &Program, op: &Op) -> (Vec<Slot>, Vec<Slot>) {
    use Slot::{Any, Float, Int};

    let any = |n: usize| vec![Any; n];
    match *op {
        Op::LoadIntLit { .. } | Op::LoadInstMem | Op::LoadClsMem => (vec![], vec![Int]),
        Op::LoadFloatLit { .. } => (vec![], vec![Float]),

        Op::LoadIntVar { ctx, .. } | Op::LoadFloatVar { ctx, .. } => {
            let value = value_slot(matches!(op, Op::LoadFloatVar { .. }));
            match ctx {
                MemoryContext::Local => (vec![], vec![value]),
                _ => (vec![Int], vec![value]),
            }
        }
        Op::StorIntVar { ctx, .. }
        | Op::StorFloatVar { ctx, .. }
        | Op::CopyIntVar { ctx, .. }
        | Op::CopyFloatVar { ctx, .. } => {
            let value = value_slot(matches!(op, Op::StorFloatVar { .. } | Op::CopyFloatVar { .. }));
            let pops = match ctx {
                MemoryContext::Local => vec![value],
                _ => vec![Int, value],
            };
            let pushes = match op {
                Op::CopyIntVar { .. } | Op::CopyFloatVar { .. } => vec![value],
                _ => vec![],
            };
            (pops, pushes)
        }

        Op::AddInt
        | Op::SubInt
        | Op::MulInt
        | Op::DivInt
        | Op::ModInt
        | Op::BitAndInt
        | Op::BitOrInt
        | Op::BitXorInt
        | Op::ShlInt
        | Op::ShrInt
        | Op::LesInt
        | Op::GtrInt
        | Op::LesEqlInt
        | Op::GtrEqlInt
        | Op::EqlInt
        | Op::NeqlInt => (vec![Int, Int], vec![Int]),

        Op::AddFloat | Op::SubFloat | Op::MulFloat | Op::DivFloat => (vec![Float, Float], vec![Float]),
        Op::LesFloat
        | Op::GtrFloat
        | Op::LesEqlFloat
        | Op::GtrEqlFloat
        | Op::EqlFloat
        | Op::NeqlFloat => (vec![Float, Float], vec![Int]),

        Op::I2F => (vec![Int], vec![Float]),
        Op::F2I => (vec![Float], vec![Int]),
        Op::I2S => (vec![Int, Int, Int], vec![]),
        Op::F2S => (vec![Int, Float], vec![]),
        Op::S2I => (vec![Int, Int], vec![Int]),
        Op::S2F => (vec![Int], vec![Float]),

        Op::PopInt => (vec![Int], vec![]),
        Op::PopFloat => (vec![Float], vec![]),
        Op::SwapInt => (any(2), any(2)),

        Op::Lbl { .. } | Op::Rtrn => (vec![], vec![]),
        Op::Jmp { cond, .. } => match cond {
            JumpCond::Always => (vec![], vec![]),
            JumpCond::IfTrue | JumpCond::IfFalse => (vec![Int], vec![]),
        },

        Op::MthdCall { cls, mthd } => match program.method(cls, mthd) {
            Some(callee) => {
                let mut pops = vec![Int];
                pops.extend(any(callee.params));
                (pops, result_slots(callee.rtrn))
            }
            None => (vec![], vec![]),
        },
        Op::DynMthdCall { params, rtrn } => {
            let mut pops = vec![Int, Int];
            pops.extend(any(params));
            (pops, result_slots(rtrn))
        }
        Op::AsyncMthdCall { .. } => (any(1), vec![]),

        Op::NewAry { dims, .. } => (vec![Int; dims], vec![Int]),
        Op::NewObjInst { .. } => (vec![], vec![Int]),

        Op::LoadArySize => (vec![Int], vec![Int]),
        Op::LoadAryElm { kind, dims } => (vec![Int; dims + 1], vec![element_slot(kind)]),
        Op::StorAryElm { kind, dims } => {
            let mut pops = vec![Int; dims + 1];
            pops.push(element_slot(kind));
            (pops, vec![])
        }
        Op::CpyAry { .. } => (vec![Int; 5], vec![Int]),
        Op::ZeroAry { .. } => (vec![Int], vec![]),

        Op::ObjTypeOf { .. } | Op::ObjInstCast { .. } => (vec![Int], vec![Int]),

        Op::ThreadJoin | Op::ThreadMutex => (vec![], vec![]),
        Op::ThreadSleep | Op::CriticalStart | Op::CriticalEnd => (vec![Int], vec![]),

        Op::RandFloat => (vec![], vec![Float]),
        Op::Trap { args } => (any(args), vec![]),
        Op::TrapRtrn { args } => (any(args), vec![Int]),
    }
}

//! Reference interpreter.
//!
//! Runs methods that are not compiled, either because the JIT is off, the
//! method is not hot yet, or its compilation failed. Its results are the
//! ground truth compiled code is tested against.

use super::heap::{read_word, write_word};
use super::runtime::{self, OpContext, float_arith, float_compare, float_to_int, int_arith};
use super::{ArrayRef, JumpCond, MemoryContext, Method, Op, RuntimeFault, StackRef, Vm, fatal};

fn local<'a>(locals: &'a mut [u64], id: i64, method: &Method) -> &'a mut u64 {
    match usize::try_from(id).ok().and_then(|i| locals.get_mut(i)) {
        Some(slot) => slot,
        None => fatal(format!("local {id} out of range in {}", method.full_name)),
    }
}

fn pop_object(stack: StackRef, method: &Method) -> Result<u64, RuntimeFault> {
    match stack.pop()? {
        0 => Err(RuntimeFault::NilDeref {
            method: method.full_name.clone(),
        }),
        object => Ok(object),
    }
}

/// Pop an array and its indices; returns the array and the checked flat
/// index.
fn pop_element(stack: StackRef, dims: usize, method: &Method) -> Result<(ArrayRef, i64), RuntimeFault> {
    let word = pop_object(stack, method)?;
    // SAFETY: a non-nil word in array position is an array reference
    let Some(array) = (unsafe { ArrayRef::from_word(word) }) else {
        unreachable!("pop_object rejects nil");
    };
    if array.dims() != dims {
        return Err(RuntimeFault::ArrayShapeMismatch {
            method: method.full_name.clone(),
        });
    }
    let indices = (0..dims)
        .map(|_| stack.pop_int())
        .collect::<Result<Vec<_>, _>>()?;
    let index = array.flat_index(&indices);
    if index < 0 {
        return Err(RuntimeFault::IndexUnderflow {
            method: method.full_name.clone(),
        });
    }
    if index >= array.size() {
        return Err(RuntimeFault::IndexOverflow {
            method: method.full_name.clone(),
        });
    }
    Ok((array, index))
}

/// Interpret `method` on `stack`.
pub fn interpret(
    vm: &Vm,
    method: &Method,
    inst: u64,
    stack: StackRef,
    depth: &mut i64,
) -> Result<(), RuntimeFault> {
    let mut locals = vec![0u64; method.locals];
    let class_mem = vm.class_memory(method.class_id) as u64;
    let code = &method.code;

    let mut ip = 0;
    while ip < code.len() {
        let op = &code[ip];
        ip += 1;

        match *op {
            Op::LoadIntLit { value } => stack.push_int(value)?,
            Op::LoadFloatLit { value } => stack.push_float(value)?,
            Op::LoadInstMem => stack.push(inst)?,
            Op::LoadClsMem => stack.push(class_mem)?,

            Op::LoadIntVar { id, ctx } | Op::LoadFloatVar { id, ctx } => {
                let value = match ctx {
                    MemoryContext::Local => *local(&mut locals, id, method),
                    MemoryContext::Instance | MemoryContext::Class => {
                        let object = pop_object(stack, method)?;
                        unsafe { read_word(object, id) }
                    }
                };
                stack.push(value)?;
            }
            Op::StorIntVar { id, ctx }
            | Op::StorFloatVar { id, ctx }
            | Op::CopyIntVar { id, ctx }
            | Op::CopyFloatVar { id, ctx } => {
                let keep = matches!(op, Op::CopyIntVar { .. } | Op::CopyFloatVar { .. });
                let value = match ctx {
                    MemoryContext::Local => {
                        let value = stack.pop()?;
                        *local(&mut locals, id, method) = value;
                        value
                    }
                    MemoryContext::Instance | MemoryContext::Class => {
                        let object = pop_object(stack, method)?;
                        let value = stack.pop()?;
                        unsafe { write_word(object, id, value) };
                        value
                    }
                };
                if keep {
                    stack.push(value)?;
                }
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
            | Op::NeqlInt => {
                let right = stack.pop_int()?;
                let left = stack.pop_int()?;
                let value = int_arith(op, left, right).ok_or_else(|| RuntimeFault::DivideByZero {
                    method: method.full_name.clone(),
                })?;
                stack.push_int(value)?;
            }

            Op::AddFloat | Op::SubFloat | Op::MulFloat | Op::DivFloat => {
                let right = stack.pop_float()?;
                let left = stack.pop_float()?;
                let value = float_arith(op, left, right).unwrap_or(f64::NAN);
                stack.push_float(value)?;
            }
            Op::LesFloat
            | Op::GtrFloat
            | Op::LesEqlFloat
            | Op::GtrEqlFloat
            | Op::EqlFloat
            | Op::NeqlFloat => {
                let right = stack.pop_float()?;
                let left = stack.pop_float()?;
                let holds = float_compare(op, left, right).unwrap_or(false);
                stack.push_int(holds as i64)?;
            }

            Op::I2F => {
                let value = stack.pop_int()?;
                stack.push_float(value as f64)?;
            }
            Op::F2I => {
                let value = stack.pop_float()?;
                stack.push_int(float_to_int(value))?;
            }

            Op::PopInt | Op::PopFloat => {
                stack.pop()?;
            }
            Op::SwapInt => {
                let top = stack.pop()?;
                let below = stack.pop()?;
                stack.push(top)?;
                stack.push(below)?;
            }

            Op::Lbl { .. } => {}
            Op::Jmp { label, cond } => {
                let taken = match cond {
                    JumpCond::Always => true,
                    JumpCond::IfTrue => stack.pop_int()? != 0,
                    JumpCond::IfFalse => stack.pop_int()? == 0,
                };
                if taken {
                    ip = match method.label(label) {
                        Some(target) => target,
                        None => fatal(format!("jump to missing label {label} in {}", method.full_name)),
                    };
                }
            }
            Op::Rtrn => return Ok(()),

            Op::LoadAryElm { kind, dims } => {
                let (array, index) = pop_element(stack, dims, method)?;
                let value = array.get(kind, index).unwrap_or(0);
                stack.push(value)?;
            }
            Op::StorAryElm { kind, dims } => {
                let (array, index) = pop_element(stack, dims, method)?;
                let value = stack.pop()?;
                array.set(kind, index, value);
            }

            _ => {
                let mut ctx = OpContext {
                    vm,
                    cls_id: method.class_id,
                    mthd_id: method.id,
                    inst,
                    stack,
                    depth: &mut *depth,
                };
                runtime::execute(op, &mut ctx)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{JitMode, RuntimeConfig};
    use crate::vm::{Class, ElementKind, Program, ReturnType};

    fn run(code: Vec<Op>, locals: usize) -> Result<Vec<u64>, RuntimeFault> {
        let m = Method::new("m", 0, locals, code).returns(ReturnType::Int);
        let program = Program::new(vec![Class::new("Main", 2, 1, vec![m])], (0, 0));
        let config = RuntimeConfig {
            jit_mode: JitMode::Off,
            ..Default::default()
        };
        Vm::new(Arc::new(program), config).run()
    }

    #[test]
    fn test_arithmetic() {
        let out = run(
            vec![
                Op::LoadIntLit { value: 7 },
                Op::LoadIntLit { value: 3 },
                Op::SubInt,
                Op::LoadIntLit { value: 5 },
                Op::MulInt,
                Op::Rtrn,
            ],
            0,
        );
        assert_eq!(out, Ok(vec![20]));
    }

    #[test]
    fn test_division_by_zero() {
        let out = run(
            vec![
                Op::LoadIntLit { value: 1 },
                Op::LoadIntLit { value: 0 },
                Op::ModInt,
                Op::Rtrn,
            ],
            0,
        );
        assert_eq!(
            out,
            Err(RuntimeFault::DivideByZero {
                method: "Main:m".into()
            })
        );
    }

    #[test]
    fn test_loop_with_locals() {
        // sum = 0; i = 0; while i < 5 { sum += i; i += 1 }
        let local = |id| (id, MemoryContext::Local);
        let (s, i) = (local(0), local(1));
        let out = run(
            vec![
                Op::LoadIntLit { value: 0 },
                Op::StorIntVar { id: s.0, ctx: s.1 },
                Op::LoadIntLit { value: 0 },
                Op::StorIntVar { id: i.0, ctx: i.1 },
                Op::Lbl { id: 1 },
                Op::LoadIntVar { id: i.0, ctx: i.1 },
                Op::LoadIntLit { value: 5 },
                Op::LesInt,
                Op::Jmp { label: 2, cond: JumpCond::IfFalse },
                Op::LoadIntVar { id: s.0, ctx: s.1 },
                Op::LoadIntVar { id: i.0, ctx: i.1 },
                Op::AddInt,
                Op::StorIntVar { id: s.0, ctx: s.1 },
                Op::LoadIntVar { id: i.0, ctx: i.1 },
                Op::LoadIntLit { value: 1 },
                Op::AddInt,
                Op::StorIntVar { id: i.0, ctx: i.1 },
                Op::Jmp { label: 1, cond: JumpCond::Always },
                Op::Lbl { id: 2 },
                Op::LoadIntVar { id: s.0, ctx: s.1 },
                Op::Rtrn,
            ],
            2,
        );
        assert_eq!(out, Ok(vec![10]));
    }

    #[test]
    fn test_instance_and_class_fields() {
        let out = run(
            vec![
                Op::LoadIntLit { value: 9 },
                Op::LoadInstMem,
                Op::StorIntVar { id: 1, ctx: MemoryContext::Instance },
                Op::LoadIntLit { value: 4 },
                Op::LoadClsMem,
                Op::CopyIntVar { id: 0, ctx: MemoryContext::Class },
                Op::LoadInstMem,
                Op::LoadIntVar { id: 1, ctx: MemoryContext::Instance },
                Op::AddInt,
                Op::Rtrn,
            ],
            0,
        );
        assert_eq!(out, Ok(vec![13]));
    }

    #[test]
    fn test_array_bounds() {
        let out = run(
            vec![
                Op::LoadIntLit { value: 3 },
                Op::NewAry { kind: ElementKind::Int, dims: 1 },
                Op::StorIntVar { id: 0, ctx: MemoryContext::Local },
                Op::LoadIntLit { value: 3 },
                Op::LoadIntVar { id: 0, ctx: MemoryContext::Local },
                Op::LoadAryElm { kind: ElementKind::Int, dims: 1 },
                Op::Rtrn,
            ],
            1,
        );
        assert!(matches!(out, Err(RuntimeFault::IndexOverflow { .. })));
    }

    #[test]
    fn test_array_dims_must_match_header() {
        let out = run(
            vec![
                Op::LoadIntLit { value: 4 },
                Op::NewAry { kind: ElementKind::Int, dims: 1 },
                Op::StorIntVar { id: 0, ctx: MemoryContext::Local },
                Op::LoadIntLit { value: 11 },
                Op::LoadIntLit { value: 3 },
                Op::LoadIntLit { value: 0 },
                Op::LoadIntVar { id: 0, ctx: MemoryContext::Local },
                Op::StorAryElm { kind: ElementKind::Int, dims: 2 },
                Op::LoadIntLit { value: 0 },
                Op::Rtrn,
            ],
            1,
        );
        assert_eq!(
            out,
            Err(RuntimeFault::ArrayShapeMismatch {
                method: "Main:m".into()
            })
        );
    }

    #[test]
    fn test_pop_from_empty_stack() {
        let out = run(vec![Op::PopInt, Op::LoadIntLit { value: 5 }, Op::Rtrn], 0);
        assert_eq!(out, Err(RuntimeFault::StackUnderflow));
    }

    #[test]
    fn test_nil_instance_field() {
        let out = run(
            vec![
                Op::LoadIntLit { value: 0 },
                Op::LoadIntVar { id: 0, ctx: MemoryContext::Instance },
                Op::Rtrn,
            ],
            0,
        );
        assert!(matches!(out, Err(RuntimeFault::NilDeref { .. })));
    }
}

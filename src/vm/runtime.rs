//! Runtime services shared by the interpreter and the callback bridge.
//!
//! Arithmetic helpers define the value semantics both executors (and the
//! translator's constant folding) must agree on. [`execute`] implements
//! every instruction compiled code hands back to the VM.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::trace;

use super::heap::{object_class, read_word, write_word};
use super::{ArrayRef, Op, RuntimeFault, StackRef, TrapId, Vm, fatal};

// =============================================================================
// Value semantics
// =============================================================================

/// Integer binary operators and comparisons. `None` on division or modulo
/// by zero.
pub fn int_arith(op: &Op, l: i64, r: i64) -> Option<i64> {
    Some(match op {
        Op::AddInt => l.wrapping_add(r),
        Op::SubInt => l.wrapping_sub(r),
        Op::MulInt => l.wrapping_mul(r),
        Op::DivInt if r == 0 => return None,
        Op::DivInt => l.wrapping_div(r),
        Op::ModInt if r == 0 => return None,
        Op::ModInt => l.wrapping_rem(r),
        Op::BitAndInt => l & r,
        Op::BitOrInt => l | r,
        Op::BitXorInt => l ^ r,
        Op::ShlInt => l.wrapping_shl((r & 63) as u32),
        Op::ShrInt => l.wrapping_shr((r & 63) as u32),
        Op::LesInt => (l < r) as i64,
        Op::GtrInt => (l > r) as i64,
        Op::LesEqlInt => (l <= r) as i64,
        Op::GtrEqlInt => (l >= r) as i64,
        Op::EqlInt => (l == r) as i64,
        Op::NeqlInt => (l != r) as i64,
        _ => return None,
    })
}

/// IEEE-754 double arithmetic; division by zero gives an infinity or NaN.
pub fn float_arith(op: &Op, l: f64, r: f64) -> Option<f64> {
    Some(match op {
        Op::AddFloat => l + r,
        Op::SubFloat => l - r,
        Op::MulFloat => l * r,
        Op::DivFloat => l / r,
        _ => return None,
    })
}

/// Float comparisons; false on NaN except `NeqlFloat`.
pub fn float_compare(op: &Op, l: f64, r: f64) -> Option<bool> {
    Some(match op {
        Op::LesFloat => l < r,
        Op::GtrFloat => l > r,
        Op::LesEqlFloat => l <= r,
        Op::GtrEqlFloat => l >= r,
        Op::EqlFloat => l == r,
        Op::NeqlFloat => l != r,
        _ => return None,
    })
}

/// Truncate toward zero; NaN and values outside the i64 range give
/// `i64::MIN`.
pub fn float_to_int(v: f64) -> i64 {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if v.is_nan() || v >= LIMIT || v < -LIMIT {
        i64::MIN
    } else {
        v as i64
    }
}

/// Format `value` in `base` (2 to 36, otherwise 10).
pub fn format_int(value: i64, base: i64) -> String {
    let base = if (2..=36).contains(&base) { base as u32 } else { 10 };
    if base == 10 {
        return value.to_string();
    }
    let mut magnitude = (value as i128).unsigned_abs();
    let mut digits = Vec::new();
    loop {
        let digit = (magnitude % base as u128) as u32;
        digits.push(char::from_digit(digit, base).unwrap_or('?'));
        magnitude /= base as u128;
        if magnitude == 0 {
            break;
        }
    }
    if value < 0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Parse an integer in `base`; malformed text gives 0.
pub fn parse_int(text: &str, base: i64) -> i64 {
    let base = if (2..=36).contains(&base) { base as u32 } else { 10 };
    i64::from_str_radix(text.trim(), base).unwrap_or(0)
}

pub fn parse_float(text: &str) -> f64 {
    text.trim().parse().unwrap_or(0.0)
}

// =============================================================================
// Bridged operations
// =============================================================================

/// State an out-of-line instruction runs against.
pub struct OpContext<'a> {
    pub vm: &'a Vm,
    /// Class and method the instruction belongs to.
    pub cls_id: usize,
    pub mthd_id: usize,
    /// Instance the method runs on; 0 when nil.
    pub inst: u64,
    pub stack: StackRef,
    /// Current call depth.
    pub depth: &'a mut i64,
}

impl OpContext<'_> {
    fn method_name(&self) -> String {
        self.vm.method_name(self.cls_id, self.mthd_id)
    }

    fn nil(&self) -> RuntimeFault {
        RuntimeFault::NilDeref {
            method: self.method_name(),
        }
    }

    fn pop_object(&self) -> Result<u64, RuntimeFault> {
        match self.stack.pop()? {
            0 => Err(self.nil()),
            object => Ok(object),
        }
    }

    fn pop_array(&self) -> Result<ArrayRef, RuntimeFault> {
        let word = self.stack.pop()?;
        // SAFETY: operand words in reference position come from the heap
        unsafe { ArrayRef::from_word(word) }.ok_or_else(|| self.nil())
    }

    fn instance(&self) -> Result<u64, RuntimeFault> {
        match self.inst {
            0 => Err(self.nil()),
            inst => Ok(inst),
        }
    }
}

/// Run one out-of-line instruction.
pub fn execute(op: &Op, ctx: &mut OpContext<'_>) -> Result<(), RuntimeFault> {
    let vm = ctx.vm;
    let stack = ctx.stack;
    trace!(op = op.name(), method = %ctx.method_name(), "runtime service");

    match *op {
        Op::MthdCall { cls, mthd } => {
            let inst = stack.pop()?;
            let callee = vm
                .program()
                .method(cls, mthd)
                .ok_or_else(|| RuntimeFault::UnknownMethod(format!("{cls}:{mthd}")))?;
            vm.invoke(callee, inst, stack, ctx.depth)?;
        }
        Op::DynMthdCall { .. } => {
            let id = stack.pop_int()?;
            let (cls, mthd) = ((id >> 32) as usize, (id & 0xffff_ffff) as usize);
            let inst = stack.pop()?;
            let callee = vm
                .program()
                .method(cls, mthd)
                .ok_or_else(|| RuntimeFault::UnknownMethod(format!("{cls}:{mthd}")))?;
            vm.invoke(callee, inst, stack, ctx.depth)?;
        }
        Op::AsyncMthdCall { cls, mthd } => {
            let param = stack.pop()?;
            let inst = ctx.instance()?;
            let id = vm.spawn(cls, mthd, inst, param)?;
            unsafe { write_word(inst, 0, id as u64) };
        }

        Op::NewAry { kind, dims } => {
            let extents = (0..dims)
                .map(|_| stack.pop_int())
                .collect::<Result<Vec<_>, _>>()?;
            let array = vm.heap().new_array(kind, &extents)?;
            stack.push(array.word())?;
        }
        Op::NewObjInst { cls } => {
            let Some(class) = vm.program().class(cls) else {
                fatal(format!("unknown class {cls} in {}", ctx.method_name()));
            };
            stack.push(vm.heap().new_object(cls, class.fields))?;
        }

        Op::LoadArySize => {
            let array = ctx.pop_array()?;
            stack.push_int(array.extent(0))?;
        }
        Op::CpyAry { kind } => {
            let len = stack.pop_int()?;
            let src_offset = stack.pop_int()?;
            let src = ctx.pop_array()?;
            let offset = stack.pop_int()?;
            let dest = ctx.pop_array()?;
            let copied = dest.copy_from(kind, offset, src, src_offset, len);
            stack.push_int(copied as i64)?;
        }
        Op::ZeroAry { kind } => ctx.pop_array()?.zero(kind),

        Op::I2S => {
            let string = ctx.pop_array()?;
            let base = stack.pop_int()?;
            let value = stack.pop_int()?;
            string.write_str(&format_int(value, base));
        }
        Op::F2S => {
            let string = ctx.pop_array()?;
            let value = stack.pop_float()?;
            string.write_str(&format_float(value));
        }
        Op::S2I => {
            let string = ctx.pop_array()?;
            let base = stack.pop_int()?;
            stack.push_int(parse_int(&string.read_string(), base))?;
        }
        Op::S2F => {
            let string = ctx.pop_array()?;
            stack.push_float(parse_float(&string.read_string()))?;
        }

        Op::ObjTypeOf { cls } => {
            let object = stack.pop()?;
            let is = object != 0 && vm.program().is_subclass(unsafe { object_class(object) }, cls);
            stack.push_int(is as i64)?;
        }
        Op::ObjInstCast { cls } => {
            let object = stack.pop()?;
            if object != 0 {
                let from = unsafe { object_class(object) };
                if !vm.program().is_subclass(from, cls) {
                    return Err(RuntimeFault::InvalidCast {
                        from: vm.class_name(from),
                        to: vm.class_name(cls),
                    });
                }
            }
            stack.push(object)?;
        }

        Op::ThreadJoin => {
            let inst = ctx.instance()?;
            vm.threads().join(unsafe { read_word(inst, 0) } as i64)?;
        }
        Op::ThreadSleep => {
            let millis = stack.pop_int()?;
            std::thread::sleep(Duration::from_millis(millis.max(0) as u64));
        }
        Op::ThreadMutex => {
            let inst = ctx.instance()?;
            let id = vm.threads().new_monitor();
            unsafe { write_word(inst, 1, id as u64) };
        }
        Op::CriticalStart => {
            let object = ctx.pop_object()?;
            vm.threads().enter(unsafe { read_word(object, 1) } as i64)?;
        }
        Op::CriticalEnd => {
            let object = ctx.pop_object()?;
            vm.threads().exit(unsafe { read_word(object, 1) } as i64)?;
        }

        Op::RandFloat => stack.push_float(fastrand::f64())?,
        Op::Trap { args } => {
            trap(ctx, args)?;
        }
        Op::TrapRtrn { args } => {
            let result = trap(ctx, args)?;
            stack.push_int(result)?;
        }

        _ => fatal(format!(
            "'{}' is not a runtime service ({})",
            op.name(),
            ctx.method_name()
        )),
    }
    Ok(())
}

/// Run a system trap. Pops the trap id, then `args - 1` values.
fn trap(ctx: &OpContext<'_>, args: usize) -> Result<i64, RuntimeFault> {
    let vm = ctx.vm;
    let id = ctx.stack.pop_int()?;
    let values = (1..args)
        .map(|_| ctx.stack.pop())
        .collect::<Result<Vec<_>, _>>()?;
    let arg = |i: usize| values.get(i).copied().ok_or(RuntimeFault::InvalidTrap(id));
    let string = |i: usize| -> Result<String, RuntimeFault> {
        let word = arg(i)?;
        unsafe { ArrayRef::from_word(word) }
            .map(ArrayRef::read_string)
            .ok_or_else(|| ctx.nil())
    };

    let trap = TrapId::from_i64(id).ok_or(RuntimeFault::InvalidTrap(id))?;
    Ok(match trap {
        TrapId::StdOutInt => {
            vm.write_out(&(arg(0)? as i64).to_string());
            0
        }
        TrapId::StdOutFloat => {
            vm.write_out(&format_float(f64::from_bits(arg(0)?)));
            0
        }
        TrapId::StdOutChar => {
            let c = char::from_u32(arg(0)? as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            vm.write_out(c.encode_utf8(&mut [0; 4]));
            0
        }
        TrapId::StdOutString => {
            vm.write_out(&string(0)?);
            0
        }
        TrapId::StdErrString => {
            eprint!("{}", string(0)?);
            0
        }
        TrapId::StdFlush => {
            vm.flush_out();
            0
        }
        TrapId::FileExists => std::path::Path::new(&string(0)?).exists() as i64,
        TrapId::SysTimeMillis => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_semantics() {
        assert_eq!(int_arith(&Op::DivInt, 7, 0), None);
        assert_eq!(int_arith(&Op::ModInt, 7, 0), None);
        assert_eq!(int_arith(&Op::DivInt, i64::MIN, -1), Some(i64::MIN));
        assert_eq!(int_arith(&Op::ModInt, i64::MIN, -1), Some(0));
        assert_eq!(int_arith(&Op::DivInt, -7, 2), Some(-3));
        assert_eq!(int_arith(&Op::ModInt, -7, 2), Some(-1));
        assert_eq!(int_arith(&Op::ShlInt, 1, 65), Some(2));
        assert_eq!(int_arith(&Op::ShrInt, -8, 1), Some(-4));
        assert_eq!(int_arith(&Op::LesEqlInt, 3, 3), Some(1));
    }

    #[test]
    fn test_float_semantics() {
        assert_eq!(float_arith(&Op::DivFloat, 1.0, 0.0), Some(f64::INFINITY));
        assert_eq!(float_compare(&Op::LesFloat, f64::NAN, 1.0), Some(false));
        assert_eq!(float_compare(&Op::NeqlFloat, f64::NAN, f64::NAN), Some(true));
        assert_eq!(float_to_int(-2.9), -2);
        assert_eq!(float_to_int(f64::NAN), i64::MIN);
        assert_eq!(float_to_int(1e19), i64::MIN);
        assert_eq!(float_to_int(-1e19), i64::MIN);
    }

    #[test]
    fn test_number_text() {
        assert_eq!(format_int(255, 16), "ff");
        assert_eq!(format_int(-5, 2), "-101");
        assert_eq!(format_int(i64::MIN, 16), "-8000000000000000");
        assert_eq!(format_int(42, 99), "42");
        assert_eq!(parse_int(" ff ", 16), 255);
        assert_eq!(parse_int("nope", 10), 0);
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.25), "0.25");
        assert_eq!(parse_float("2.5"), 2.5);
    }
}

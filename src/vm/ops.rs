use serde::{Deserialize, Serialize};

/// Where a variable instruction finds its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryContext {
    /// Slot in the method's own frame.
    Local,
    /// Field of the object popped from the operand stack.
    Instance,
    /// Static field; the class memory block is popped from the operand stack.
    Class,
}

/// Branch condition of a `Jmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpCond {
    Always,
    /// Pop an int and jump if it is non-zero.
    IfTrue,
    /// Pop an int and jump if it is zero.
    IfFalse,
}

/// Value class a call leaves on the operand stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    #[default]
    Nil,
    Int,
    Float,
}

/// Element kind of a typed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Byte,
    Char,
    Int,
    Float,
}

impl ElementKind {
    /// log2 of the element size in bytes.
    pub fn shift(self) -> u8 {
        match self {
            ElementKind::Byte => 0,
            ElementKind::Char => 2,
            ElementKind::Int | ElementKind::Float => 3,
        }
    }

    pub fn size(self) -> usize {
        1 << self.shift()
    }

    /// Byte and char arrays carry a zeroed terminator element.
    pub fn has_terminator(self) -> bool {
        matches!(self, ElementKind::Byte | ElementKind::Char)
    }

    pub fn is_float(self) -> bool {
        self == ElementKind::Float
    }
}

/// Stack machine instructions.
///
/// Binary operators pop the right operand first, then the left one, and push
/// `left op right`. Comparisons push 1 or 0. See the stack-shape table in
/// the crate documentation for array, string and call instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    // ========================================
    // Literals and frame pointers
    // ========================================
    LoadIntLit { value: i64 },
    LoadFloatLit { value: f64 },
    /// Push the current instance pointer.
    LoadInstMem,
    /// Push the current class's static memory block.
    LoadClsMem,

    // ========================================
    // Variables
    // ========================================
    LoadIntVar { id: i64, ctx: MemoryContext },
    LoadFloatVar { id: i64, ctx: MemoryContext },
    StorIntVar { id: i64, ctx: MemoryContext },
    StorFloatVar { id: i64, ctx: MemoryContext },
    /// Store without consuming the value.
    CopyIntVar { id: i64, ctx: MemoryContext },
    CopyFloatVar { id: i64, ctx: MemoryContext },

    // ========================================
    // Integer arithmetic
    // ========================================
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    BitAndInt,
    BitOrInt,
    BitXorInt,
    ShlInt,
    ShrInt,
    LesInt,
    GtrInt,
    LesEqlInt,
    GtrEqlInt,
    EqlInt,
    NeqlInt,

    // ========================================
    // Float arithmetic
    // ========================================
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    LesFloat,
    GtrFloat,
    LesEqlFloat,
    GtrEqlFloat,
    EqlFloat,
    NeqlFloat,

    // ========================================
    // Conversions
    // ========================================
    I2F,
    F2I,
    I2S,
    F2S,
    S2I,
    S2F,

    // ========================================
    // Stack manipulation
    // ========================================
    PopInt,
    PopFloat,
    SwapInt,

    // ========================================
    // Control flow
    // ========================================
    Lbl { id: i64 },
    Jmp { label: i64, cond: JumpCond },
    Rtrn,

    // ========================================
    // Calls
    // ========================================
    MthdCall { cls: usize, mthd: usize },
    DynMthdCall { params: usize, rtrn: ReturnType },
    /// Run `cls:mthd` on a new thread with the current instance and the
    /// popped parameter; the thread id is stored in `instance[0]`.
    AsyncMthdCall { cls: usize, mthd: usize },

    // ========================================
    // Allocation
    // ========================================
    NewAry { kind: ElementKind, dims: usize },
    NewObjInst { cls: usize },

    // ========================================
    // Arrays
    // ========================================
    LoadArySize,
    LoadAryElm { kind: ElementKind, dims: usize },
    StorAryElm { kind: ElementKind, dims: usize },
    CpyAry { kind: ElementKind },
    ZeroAry { kind: ElementKind },

    // ========================================
    // Objects
    // ========================================
    ObjTypeOf { cls: usize },
    ObjInstCast { cls: usize },

    // ========================================
    // Threads
    // ========================================
    ThreadJoin,
    ThreadSleep,
    ThreadMutex,
    CriticalStart,
    CriticalEnd,

    // ========================================
    // Runtime services
    // ========================================
    RandFloat,
    Trap { args: usize },
    TrapRtrn { args: usize },
}

impl Op {
    /// The variable id and context of a load/store/copy, if any.
    pub fn variable(&self) -> Option<(i64, MemoryContext)> {
        match *self {
            Op::LoadIntVar { id, ctx }
            | Op::LoadFloatVar { id, ctx }
            | Op::StorIntVar { id, ctx }
            | Op::StorFloatVar { id, ctx }
            | Op::CopyIntVar { id, ctx }
            | Op::CopyFloatVar { id, ctx } => Some((id, ctx)),
            _ => None,
        }
    }

    /// Short lowercase name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Op::LoadIntLit { .. } => "load_int_lit",
            Op::LoadFloatLit { .. } => "load_float_lit",
            Op::LoadInstMem => "load_inst_mem",
            Op::LoadClsMem => "load_cls_mem",
            Op::LoadIntVar { .. } => "load_int_var",
            Op::LoadFloatVar { .. } => "load_float_var",
            Op::StorIntVar { .. } => "stor_int_var",
            Op::StorFloatVar { .. } => "stor_float_var",
            Op::CopyIntVar { .. } => "copy_int_var",
            Op::CopyFloatVar { .. } => "copy_float_var",
            Op::AddInt => "add_int",
            Op::SubInt => "sub_int",
            Op::MulInt => "mul_int",
            Op::DivInt => "div_int",
            Op::ModInt => "mod_int",
            Op::BitAndInt => "bit_and_int",
            Op::BitOrInt => "bit_or_int",
            Op::BitXorInt => "bit_xor_int",
            Op::ShlInt => "shl_int",
            Op::ShrInt => "shr_int",
            Op::LesInt => "les_int",
            Op::GtrInt => "gtr_int",
            Op::LesEqlInt => "les_eql_int",
            Op::GtrEqlInt => "gtr_eql_int",
            Op::EqlInt => "eql_int",
            Op::NeqlInt => "neql_int",
            Op::AddFloat => "add_float",
            Op::SubFloat => "sub_float",
            Op::MulFloat => "mul_float",
            Op::DivFloat => "div_float",
            Op::LesFloat => "les_float",
            Op::GtrFloat => "gtr_float",
            Op::LesEqlFloat => "les_eql_float",
            Op::GtrEqlFloat => "gtr_eql_float",
            Op::EqlFloat => "eql_float",
            Op::NeqlFloat => "neql_float",
            Op::I2F => "i2f",
            Op::F2I => "f2i",
            Op::I2S => "i2s",
            Op::F2S => "f2s",
            Op::S2I => "s2i",
            Op::S2F => "s2f",
            Op::PopInt => "pop_int",
            Op::PopFloat => "pop_float",
            Op::SwapInt => "swap_int",
            Op::Lbl { .. } => "lbl",
            Op::Jmp { .. } => "jmp",
            Op::Rtrn => "rtrn",
            Op::MthdCall { .. } => "mthd_call",
            Op::DynMthdCall { .. } => "dyn_mthd_call",
            Op::AsyncMthdCall { .. } => "async_mthd_call",
            Op::NewAry { .. } => "new_ary",
            Op::NewObjInst { .. } => "new_obj_inst",
            Op::LoadArySize => "load_ary_size",
            Op::LoadAryElm { .. } => "load_ary_elm",
            Op::StorAryElm { .. } => "stor_ary_elm",
            Op::CpyAry { .. } => "cpy_ary",
            Op::ZeroAry { .. } => "zero_ary",
            Op::ObjTypeOf { .. } => "obj_type_of",
            Op::ObjInstCast { .. } => "obj_inst_cast",
            Op::ThreadJoin => "thread_join",
            Op::ThreadSleep => "thread_sleep",
            Op::ThreadMutex => "thread_mutex",
            Op::CriticalStart => "critical_start",
            Op::CriticalEnd => "critical_end",
            Op::RandFloat => "rand_float",
            Op::Trap { .. } => "trap",
            Op::TrapRtrn { .. } => "trap_rtrn",
        }
    }
}

/// System trap ids, passed as the topmost `Trap` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TrapId {
    StdOutInt = 0,
    StdOutFloat = 1,
    StdOutChar = 2,
    StdOutString = 3,
    StdErrString = 4,
    StdFlush = 5,
    FileExists = 6,
    SysTimeMillis = 7,
}

impl TrapId {
    pub fn from_i64(id: i64) -> Option<Self> {
        Some(match id {
            0 => TrapId::StdOutInt,
            1 => TrapId::StdOutFloat,
            2 => TrapId::StdOutChar,
            3 => TrapId::StdOutString,
            4 => TrapId::StdErrString,
            5 => TrapId::StdFlush,
            6 => TrapId::FileExists,
            7 => TrapId::SysTimeMillis,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_shift() {
        assert_eq!(ElementKind::Byte.size(), 1);
        assert_eq!(ElementKind::Char.size(), 4);
        assert_eq!(ElementKind::Int.size(), 8);
        assert_eq!(ElementKind::Float.shift(), 3);
    }

    #[test]
    fn test_op_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            code: Vec<Op>,
        }
        let src = r#"
code = [
  { op = "load_int_var", id = 0, ctx = "local" },
  { op = "jmp", label = 3, cond = "if_false" },
  { op = "load_ary_elm", kind = "int", dims = 1 },
  { op = "rtrn" },
]
"#;
        let w: Wrapper = toml::from_str(src).unwrap();
        assert_eq!(
            w.code,
            vec![
                Op::LoadIntVar { id: 0, ctx: MemoryContext::Local },
                Op::Jmp { label: 3, cond: JumpCond::IfFalse },
                Op::LoadAryElm { kind: ElementKind::Int, dims: 1 },
                Op::Rtrn,
            ]
        );
    }

    #[test]
    fn test_trap_id_roundtrip() {
        assert_eq!(TrapId::from_i64(3), Some(TrapId::StdOutString));
        assert_eq!(TrapId::from_i64(99), None);
    }
}

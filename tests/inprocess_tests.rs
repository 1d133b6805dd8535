//! In-process integration tests.
//!
//! These build programs directly and drive the VM, the JIT compiler and
//! the executor through the library API, comparing interpreted and native
//! runs of the same bytecode.

#![cfg(feature = "jit")]

use std::io::Write;
use std::sync::{Arc, Mutex};

use stackjit::config::{JitMode, RuntimeConfig};
use stackjit::jit::{self, Arch, JitCompiler, executor};
use stackjit::vm::{
    ArrayRef, Class, ElementKind, JumpCond, MemoryContext, Method, Op, OperandStack, Program,
    ReturnType, RuntimeFault, Vm,
};

const L: MemoryContext = MemoryContext::Local;
const I: MemoryContext = MemoryContext::Instance;

fn config(jit_mode: JitMode) -> RuntimeConfig {
    RuntimeConfig {
        jit_mode,
        ..Default::default()
    }
}

fn vm_for(program: Program, jit_mode: JitMode) -> Arc<Vm> {
    Vm::new(Arc::new(program), config(jit_mode))
}

/// Call `Main:<name>` on a fresh instance.
fn call(vm: &Vm, name: &str, args: &[u64]) -> Result<Vec<u64>, RuntimeFault> {
    let method = vm
        .program()
        .find_method(&format!("Main:{name}"))
        .expect("method exists");
    vm.call(method, vm.new_instance(method.class_id), args)
}

fn single(methods: Vec<Method>) -> Program {
    Program::new(vec![Class::new("Main", 2, 1, methods)], (0, 0))
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ==================== Scenarios ====================

#[test]
fn test_return_local() {
    let program = || {
        single(vec![
            Method::new(
                "main",
                0,
                1,
                vec![
                    Op::LoadIntLit { value: 42 },
                    Op::StorIntVar { id: 0, ctx: L },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::Rtrn,
                ],
            )
            .returns(ReturnType::Int),
        ])
    };
    for mode in [JitMode::Off, JitMode::On] {
        let vm = vm_for(program(), mode);
        assert_eq!(vm.run(), Ok(vec![42]), "{mode:?}");
    }
}

fn bounds_program() -> Program {
    let field = |id| Op::LoadIntVar { id, ctx: I };
    single(vec![
        Method::new(
            "init",
            0,
            0,
            vec![
                Op::LoadIntLit { value: 10 },
                Op::NewAry { kind: ElementKind::Int, dims: 1 },
                Op::LoadInstMem,
                Op::StorIntVar { id: 0, ctx: I },
                Op::LoadIntLit { value: 10 },
                Op::NewAry { kind: ElementKind::Int, dims: 1 },
                Op::LoadInstMem,
                Op::StorIntVar { id: 1, ctx: I },
                Op::Rtrn,
            ],
        ),
        // a[i] := b[i] * 2
        Method::new(
            "copy",
            1,
            1,
            vec![
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadInstMem,
                field(1),
                Op::LoadAryElm { kind: ElementKind::Int, dims: 1 },
                Op::LoadIntLit { value: 2 },
                Op::MulInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadInstMem,
                field(0),
                Op::StorAryElm { kind: ElementKind::Int, dims: 1 },
                Op::Rtrn,
            ],
        ),
        Method::new("fields", 0, 0, vec![Op::LoadInstMem, field(0), Op::LoadInstMem, field(1), Op::Rtrn]),
    ])
}

#[test]
fn test_out_of_bounds_store_writes_nothing() {
    for mode in [JitMode::Off, JitMode::On] {
        let vm = vm_for(bounds_program(), mode);
        let p = vm.program();
        let inst = vm.new_instance(0);
        let m = |name: &str| p.find_method(&format!("Main:{name}")).unwrap();

        vm.call(m("init"), inst, &[]).unwrap();
        let words = vm.call(m("fields"), inst, &[]).unwrap();
        let (a, b) = unsafe {
            (
                ArrayRef::from_word(words[0]).unwrap(),
                ArrayRef::from_word(words[1]).unwrap(),
            )
        };
        for i in 0..10 {
            b.set(ElementKind::Int, i, (i + 1) as u64);
        }

        assert_eq!(vm.call(m("copy"), inst, &[3]), Ok(vec![]));
        assert_eq!(
            vm.call(m("copy"), inst, &[11]),
            Err(RuntimeFault::IndexOverflow {
                method: "Main:copy".into()
            }),
            "{mode:?}"
        );
        assert_eq!(
            vm.call(m("copy"), inst, &[(-1i64) as u64]),
            Err(RuntimeFault::IndexUnderflow {
                method: "Main:copy".into()
            }),
            "{mode:?}"
        );

        let contents: Vec<u64> = (0..10).map(|i| a.get(ElementKind::Int, i).unwrap()).collect();
        assert_eq!(contents, vec![0, 0, 0, 8, 0, 0, 0, 0, 0, 0], "{mode:?}");
    }
}

#[test]
fn test_compare_and_branch_fuse() {
    let program = single(vec![
        Method::new(
            "min",
            2,
            2,
            vec![
                Op::StorIntVar { id: 1, ctx: L },
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::LesInt,
                Op::Jmp { label: 1, cond: JumpCond::IfFalse },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::Rtrn,
                Op::Lbl { id: 1 },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
    ]);
    let method = program.method(0, 0).unwrap();
    for arch in [Arch::X86_64, Arch::AArch64] {
        let t = jit::translate(arch, &program, method).unwrap();
        assert_eq!(t.stats.cond_branches, 1, "{arch:?}");
        assert_eq!(t.stats.materialized_bools, 0, "{arch:?}");
        assert!(t.pools_returned);
    }

    let vm = vm_for(program, JitMode::On);
    assert_eq!(call(&vm, "min", &[9, 4]), Ok(vec![4]));
    assert_eq!(call(&vm, "min", &[(-3i64) as u64, 4]), Ok(vec![(-3i64) as u64]));
}

fn caller_program() -> Program {
    single(vec![
        // 100x + (x + 3) + square(x), the first two live across the call
        Method::new(
            "caller",
            1,
            1,
            vec![
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntLit { value: 100 },
                Op::MulInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntLit { value: 3 },
                Op::AddInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadInstMem,
                Op::MthdCall { cls: 0, mthd: 1 },
                Op::AddInt,
                Op::AddInt,
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
        Method::new(
            "square",
            1,
            1,
            vec![
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::MulInt,
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
    ])
}

#[test]
fn test_native_caller_reenters_interpreter() {
    let Ok(compiler) = JitCompiler::new() else {
        return;
    };
    // the VM itself never compiles, so the callee stays interpreted
    let vm = vm_for(caller_program(), JitMode::Off);
    let caller = vm.program().method(0, 0).unwrap();
    let code = compiler.compile(vm.program(), caller).unwrap();
    assert!(code.stats.spills > 0);

    let mut stack = OperandStack::new(64);
    let handle = stack.handle();
    handle.push_int(7).unwrap();
    let mut depth = 0;
    executor::execute(&vm, caller, &code, vm.new_instance(0), handle, &mut depth).unwrap();

    assert_eq!(stack.values(), &[759]);
    assert_eq!(depth, 0);
    assert_eq!(vm.stats().interpreted_calls(), 1);
    assert!(vm.program().method(0, 1).unwrap().native_code().is_none());
}

#[test]
fn test_independent_compilations() {
    let Ok(compiler) = JitCompiler::new() else {
        return;
    };
    let vm = vm_for(caller_program(), JitMode::Off);
    let caller = vm.program().method(0, 0).unwrap();

    let first = compiler.compile(vm.program(), caller).unwrap();
    let second = compiler.compile(vm.program(), caller).unwrap();
    assert_ne!(first.address(), second.address());
    assert_eq!(first.len(), second.len());
    assert_eq!(first.stats, second.stats);
    assert!(jit::translate(compiler.arch(), vm.program(), caller).unwrap().pools_returned);

    for code in [&first, &second] {
        let mut stack = OperandStack::new(16);
        let handle = stack.handle();
        handle.push_int(-2).unwrap();
        let mut depth = 0;
        executor::execute(&vm, caller, code, vm.new_instance(0), handle, &mut depth).unwrap();
        assert_eq!(stack.values(), &[(-200i64 + 1 + 4) as u64]);
    }
}

// ==================== Interpreter vs native ====================

fn corpus() -> Program {
    single(vec![
        // gcd(a, b)
        Method::new(
            "gcd",
            2,
            3,
            vec![
                Op::StorIntVar { id: 1, ctx: L },
                Op::StorIntVar { id: 0, ctx: L },
                Op::Lbl { id: 1 },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::LoadIntLit { value: 0 },
                Op::NeqlInt,
                Op::Jmp { label: 2, cond: JumpCond::IfFalse },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::ModInt,
                Op::StorIntVar { id: 2, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 2, ctx: L },
                Op::StorIntVar { id: 1, ctx: L },
                Op::Jmp { label: 1, cond: JumpCond::Always },
                Op::Lbl { id: 2 },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
        // a bit soup over both operands
        Method::new(
            "bits",
            2,
            2,
            vec![
                Op::StorIntVar { id: 1, ctx: L },
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::ShlInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::ShrInt,
                Op::BitXorInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntLit { value: 0xff },
                Op::BitAndInt,
                Op::BitOrInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::SubInt,
                Op::LoadIntLit { value: 1 << 40 },
                Op::MulInt,
                Op::AddInt,
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
        // signed division family
        Method::new(
            "divs",
            2,
            2,
            vec![
                Op::StorIntVar { id: 1, ctx: L },
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::DivInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::ModInt,
                Op::LoadIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 1, ctx: L },
                Op::GtrEqlInt,
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
        // (x * 0.5 - 1.25) / 3, then truncated and compared
        Method::new(
            "floats",
            1,
            2,
            vec![
                Op::StorIntVar { id: 0, ctx: L },
                Op::LoadIntVar { id: 0, ctx: L },
                Op::I2F,
                Op::LoadFloatLit { value: 0.5 },
                Op::MulFloat,
                Op::LoadFloatLit { value: 1.25 },
                Op::SubFloat,
                Op::LoadFloatLit { value: 3.0 },
                Op::DivFloat,
                Op::CopyFloatVar { id: 1, ctx: L },
                Op::F2I,
                Op::LoadFloatVar { id: 1, ctx: L },
                Op::LoadFloatLit { value: 0.0 },
                Op::LesFloat,
                Op::LoadFloatVar { id: 1, ctx: L },
                Op::LoadFloatVar { id: 1, ctx: L },
                Op::EqlFloat,
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int),
    ])
}

#[test]
fn test_interpreter_and_native_agree() {
    let interpreted = vm_for(corpus(), JitMode::Off);
    let native = vm_for(corpus(), JitMode::On);
    if native.jit().is_none() {
        return;
    }

    let pairs: &[(i64, i64)] = &[
        (0, 1),
        (48, 18),
        (-48, 18),
        (7, -2),
        (i64::MAX, 3),
        (i64::MIN, -1),
        (-1, 63),
        (12345, 64),
    ];
    for name in ["gcd", "bits", "divs"] {
        for &(a, b) in pairs {
            let args = [a as u64, b as u64];
            assert_eq!(
                call(&interpreted, name, &args),
                call(&native, name, &args),
                "{name}({a}, {b})"
            );
        }
    }
    for x in [-9i64, -1, 0, 1, 2, 3, 1 << 53, i64::MIN] {
        assert_eq!(
            call(&interpreted, "floats", &[x as u64]),
            call(&native, "floats", &[x as u64]),
            "floats({x})"
        );
    }

    assert!(native.stats().native_calls() > 0);
    assert_eq!(native.stats().interpreted_calls(), 0);
}

#[test]
fn test_division_by_zero_faults_in_both() {
    let interpreted = vm_for(corpus(), JitMode::Off);
    let native = vm_for(corpus(), JitMode::On);
    let fault = Err(RuntimeFault::DivideByZero {
        method: "Main:divs".into(),
    });
    assert_eq!(call(&interpreted, "divs", &[5, 0]), fault);
    assert_eq!(call(&native, "divs", &[5, 0]), fault);
}

#[test]
fn test_operand_stack_overflow_faults_in_both() {
    // each iteration leaves `i` behind on the operand stack
    let program = || {
        single(vec![
            Method::new(
                "main",
                0,
                1,
                vec![
                    Op::LoadIntLit { value: 0 },
                    Op::StorIntVar { id: 0, ctx: L },
                    Op::Lbl { id: 1 },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::LoadIntLit { value: 100 },
                    Op::LesInt,
                    Op::Jmp { label: 2, cond: JumpCond::IfFalse },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::LoadIntLit { value: 1 },
                    Op::AddInt,
                    Op::StorIntVar { id: 0, ctx: L },
                    Op::Jmp { label: 1, cond: JumpCond::Always },
                    Op::Lbl { id: 2 },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::Rtrn,
                ],
            )
            .returns(ReturnType::Int),
        ])
    };
    for mode in [JitMode::Off, JitMode::On] {
        let vm = Vm::new(
            Arc::new(program()),
            RuntimeConfig {
                jit_mode: mode,
                op_stack_size: 16,
                ..Default::default()
            },
        );
        assert_eq!(vm.run(), Err(RuntimeFault::StackOverflow), "{mode:?}");
    }
}

#[test]
fn test_operand_stack_underflow_faults_in_both() {
    let program = || {
        single(vec![
            Method::new(
                "main",
                0,
                0,
                vec![Op::PopInt, Op::LoadIntLit { value: 5 }, Op::Rtrn],
            )
            .returns(ReturnType::Int),
        ])
    };
    for mode in [JitMode::Off, JitMode::On] {
        let vm = vm_for(program(), mode);
        assert_eq!(vm.run(), Err(RuntimeFault::StackUnderflow), "{mode:?}");
    }
}

#[test]
fn test_array_dims_mismatch_faults_in_both() {
    // a one-dimensional array indexed as two-dimensional
    let program = || {
        single(vec![
            Method::new(
                "main",
                0,
                1,
                vec![
                    Op::LoadIntLit { value: 4 },
                    Op::NewAry { kind: ElementKind::Int, dims: 1 },
                    Op::StorIntVar { id: 0, ctx: L },
                    Op::LoadIntLit { value: 11 },
                    Op::LoadIntLit { value: 3 },
                    Op::LoadIntLit { value: 0 },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::StorAryElm { kind: ElementKind::Int, dims: 2 },
                    Op::LoadIntLit { value: 3 },
                    Op::LoadIntVar { id: 0, ctx: L },
                    Op::LoadAryElm { kind: ElementKind::Int, dims: 1 },
                    Op::Rtrn,
                ],
            )
            .returns(ReturnType::Int),
        ])
    };
    let fault = Err(RuntimeFault::ArrayShapeMismatch {
        method: "Main:main".into(),
    });
    for mode in [JitMode::Off, JitMode::On] {
        let vm = vm_for(program(), mode);
        assert_eq!(vm.run(), fault, "{mode:?}");
    }
}

// ==================== Compile failure and caching ====================

/// Twelve sums held at once, more than either backend has registers for.
fn register_hungry() -> Program {
    let mut code = vec![Op::StorIntVar { id: 0, ctx: L }];
    for k in 0..12 {
        code.push(Op::LoadIntVar { id: 0, ctx: L });
        code.push(Op::LoadIntLit { value: k });
        code.push(Op::AddInt);
    }
    for _ in 0..11 {
        code.push(Op::AddInt);
    }
    code.push(Op::Rtrn);
    single(vec![Method::new("wide", 1, 1, code).returns(ReturnType::Int)])
}

#[test]
fn test_compile_failure_falls_back() {
    let program = register_hungry();
    let method = program.method(0, 0).unwrap();
    assert!(matches!(
        jit::translate(Arch::X86_64, &program, method),
        Err(jit::CompileError::RegistersExhausted)
    ));

    let vm = vm_for(register_hungry(), JitMode::On);
    let Some(compiler) = vm.jit() else {
        return;
    };
    // 12x + (0 + 1 + .. + 11)
    assert_eq!(call(&vm, "wide", &[2]), Ok(vec![90]));
    assert_eq!(call(&vm, "wide", &[0]), Ok(vec![66]));

    let method = vm.program().method(0, 0).unwrap();
    assert!(method.is_compile_attempted());
    assert!(method.native_code().is_none());
    assert_eq!(compiler.failed_count(), 1);
    assert_eq!(vm.stats().interpreted_calls(), 2);
}

/// More distinct wide literals than the constant pool holds.
fn literal_heavy() -> Program {
    let mut code = Vec::new();
    for k in 0..300 {
        code.push(Op::LoadIntLit { value: (1 << 40) + k });
        code.push(Op::LoadIntVar { id: 0, ctx: L });
        code.push(Op::AddInt);
        code.push(Op::StorIntVar { id: 0, ctx: L });
    }
    code.push(Op::LoadIntVar { id: 0, ctx: L });
    code.push(Op::Rtrn);
    single(vec![Method::new("sum", 0, 1, code).returns(ReturnType::Int)])
}

#[test]
fn test_constant_pool_overflow_falls_back() {
    let program = literal_heavy();
    let method = program.method(0, 0).unwrap();
    for arch in [Arch::X86_64, Arch::AArch64] {
        assert!(matches!(
            jit::translate(arch, &program, method),
            Err(jit::CompileError::ConstantPoolOverflow { .. })
        ));
    }

    let vm = vm_for(literal_heavy(), JitMode::On);
    let Some(compiler) = vm.jit() else {
        return;
    };
    let expected = 300 * (1i64 << 40) + (0..300).sum::<i64>();
    assert_eq!(call(&vm, "sum", &[]), Ok(vec![expected as u64]));

    let method = vm.program().method(0, 0).unwrap();
    assert!(method.is_compile_attempted());
    assert!(method.native_code().is_none());
    assert_eq!(compiler.failed_count(), 1);
    assert_eq!(compiler.compiled_count(), 0);
    assert_eq!(vm.stats().interpreted_calls(), 1);
    assert_eq!(vm.stats().native_calls(), 0);
}

#[test]
fn test_native_code_is_cached() {
    let vm = vm_for(corpus(), JitMode::On);
    let Some(compiler) = vm.jit() else {
        return;
    };
    call(&vm, "gcd", &[10, 4]).unwrap();
    let method = vm.program().find_method("Main:gcd").unwrap();
    let address = method.native_code().unwrap().address();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let vm = &vm;
            s.spawn(move || {
                for i in 0..50 {
                    assert_eq!(call(vm, "gcd", &[t * 6 + 6, 6]), Ok(vec![6]), "iteration {i}");
                }
            });
        }
    });

    assert_eq!(method.native_code().unwrap().address(), address);
    assert_eq!(compiler.compiled_count(), 1);
    assert_eq!(method.call_count(), 201);
}

#[test]
fn test_threshold_delays_compilation() {
    let vm = Vm::new(
        Arc::new(corpus()),
        RuntimeConfig {
            jit_mode: JitMode::Auto,
            jit_threshold: 3,
            ..Default::default()
        },
    );
    if vm.jit().is_none() {
        return;
    }
    let method = vm.program().find_method("Main:bits").unwrap();
    for expected_native in [false, false, true, true] {
        call(&vm, "bits", &[3, 2]).unwrap();
        assert_eq!(method.native_code().is_some(), expected_native);
    }
    assert_eq!(vm.stats().interpreted_calls(), 2);
    assert_eq!(vm.stats().native_calls(), 2);
}

// ==================== Runtime services ====================

#[test]
fn test_console_output_matches() {
    let program = || {
        single(vec![Method::new(
            "main",
            0,
            0,
            vec![
                Op::LoadIntLit { value: -12 },
                Op::LoadIntLit { value: 0 },
                Op::Trap { args: 2 },
                Op::LoadIntLit { value: ' ' as i64 },
                Op::LoadIntLit { value: 2 },
                Op::Trap { args: 2 },
                Op::LoadFloatLit { value: 0.75 },
                Op::LoadIntLit { value: 1 },
                Op::Trap { args: 2 },
                Op::Rtrn,
            ],
        )])
    };
    let mut outputs = Vec::new();
    for mode in [JitMode::Off, JitMode::On] {
        let buf = SharedBuf::default();
        let vm = Vm::with_output(Arc::new(program()), config(mode), Box::new(buf.clone()));
        assert_eq!(vm.run(), Ok(vec![]));
        outputs.push(String::from_utf8(buf.0.lock().unwrap().clone()).unwrap());
    }
    assert_eq!(outputs[0], "-12 0.75");
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_manifest_program_runs_natively() {
    let text = std::fs::read_to_string(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/snapshots/basic/fib.toml"
    ))
    .unwrap();
    let program = stackjit::vm::manifest::from_toml(&text).unwrap();
    let vm = vm_for(program, JitMode::On);
    assert_eq!(vm.run(), Ok(vec![6765]));
    if let Some(compiler) = vm.jit() {
        assert_eq!(compiler.compiled_count(), 2);
        assert_eq!(vm.stats().interpreted_calls(), 0);
    }
}

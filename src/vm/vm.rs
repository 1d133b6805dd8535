use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[cfg(feature = "jit")]
use tracing::debug;
use tracing::warn;

use super::interpreter;
use super::threads::ThreadRegistry;
use super::{Heap, Method, OperandStack, Program, RuntimeFault, StackRef, fatal, report_and_exit};
use crate::config::RuntimeConfig;

#[cfg(feature = "jit")]
use crate::jit::{JitCompiler, NativeCode, executor};

/// Execution counters.
#[derive(Debug, Default)]
pub struct VmStats {
    native_calls: AtomicUsize,
    interpreted_calls: AtomicUsize,
}

impl VmStats {
    pub fn native_calls(&self) -> usize {
        self.native_calls.load(Ordering::Relaxed)
    }

    pub fn interpreted_calls(&self) -> usize {
        self.interpreted_calls.load(Ordering::Relaxed)
    }
}

/// The virtual machine: a loaded program plus everything its threads share.
pub struct Vm {
    program: Arc<Program>,
    config: RuntimeConfig,
    heap: Heap,
    /// Static memory block address per class
    class_memory: Vec<usize>,
    threads: ThreadRegistry,
    output: Mutex<Box<dyn Write + Send>>,
    #[cfg(feature = "jit")]
    jit: Option<JitCompiler>,
    stats: VmStats,
    this: Weak<Vm>,
}

impl Vm {
    pub fn new(program: Arc<Program>, config: RuntimeConfig) -> Arc<Self> {
        Self::with_output(program, config, Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream for the console traps.
    pub fn with_output(
        program: Arc<Program>,
        config: RuntimeConfig,
        output: Box<dyn Write + Send>,
    ) -> Arc<Self> {
        let heap = Heap::new();
        let class_memory = program
            .classes
            .iter()
            .map(|class| heap.alloc_words(class.statics) as usize)
            .collect();

        #[cfg(feature = "jit")]
        let jit = match config.compile_threshold() {
            None => None,
            Some(_) => match JitCompiler::new() {
                Ok(jit) => Some(jit),
                Err(e) => {
                    warn!(error = %e, "JIT unavailable, interpreting");
                    None
                }
            },
        };

        Arc::new_cyclic(|this| Self {
            program,
            config,
            heap,
            class_memory,
            threads: ThreadRegistry::new(),
            output: Mutex::new(output),
            #[cfg(feature = "jit")]
            jit,
            stats: VmStats::default(),
            this: this.clone(),
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    #[cfg(feature = "jit")]
    pub fn jit(&self) -> Option<&JitCompiler> {
        self.jit.as_ref()
    }

    /// Static memory of class `cls`.
    pub fn class_memory(&self, cls: usize) -> *mut u64 {
        self.class_memory.get(cls).copied().unwrap_or(0) as *mut u64
    }

    pub fn method_name(&self, cls: usize, mthd: usize) -> String {
        self.program
            .method(cls, mthd)
            .map_or_else(|| format!("{cls}:{mthd}"), |m| m.full_name.clone())
    }

    pub fn class_name(&self, cls: usize) -> String {
        self.program
            .class(cls)
            .map_or_else(|| cls.to_string(), |c| c.name.clone())
    }

    pub fn write_out(&self, text: &str) {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = out.write_all(text.as_bytes()) {
            warn!(error = %e, "console write failed");
        }
    }

    pub fn flush_out(&self) {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = out.flush() {
            warn!(error = %e, "console flush failed");
        }
    }

    /// A fresh instance of `cls`.
    pub fn new_instance(&self, cls: usize) -> u64 {
        let fields = self.program.class(cls).map_or(0, |c| c.fields);
        self.heap.new_object(cls, fields)
    }

    /// Run the entry method on a fresh instance of its class and wait for
    /// every thread it started. Returns the words left on the stack.
    pub fn run(&self) -> Result<Vec<u64>, RuntimeFault> {
        let entry = self
            .program
            .entry_method()
            .ok_or_else(|| RuntimeFault::UnknownMethod("entry".into()))?;
        let inst = self.new_instance(entry.class_id);
        let result = self.call(entry, inst, &[]);
        self.threads.join_all();
        self.flush_out();
        result
    }

    /// Call `method` on a new operand stack holding `args`, last on top.
    pub fn call(&self, method: &Method, inst: u64, args: &[u64]) -> Result<Vec<u64>, RuntimeFault> {
        let mut stack = OperandStack::new(self.config.op_stack_size);
        let handle = stack.handle();
        for arg in args {
            handle.push(*arg)?;
        }
        let mut depth = 0;
        self.invoke(method, inst, handle, &mut depth)?;
        Ok(stack.values().to_vec())
    }

    /// Invoke `method` on the caller's stack, compiling it first if it
    /// has become hot.
    pub fn invoke(
        &self,
        method: &Method,
        inst: u64,
        stack: StackRef,
        depth: &mut i64,
    ) -> Result<(), RuntimeFault> {
        if *depth >= self.config.max_call_depth {
            return Err(RuntimeFault::CallDepthExceeded { depth: *depth });
        }
        *depth += 1;
        let calls = method.record_call();
        let result = self.dispatch(method, calls, inst, stack, depth);
        *depth -= 1;
        result
    }

    fn dispatch(
        &self,
        method: &Method,
        calls: u32,
        inst: u64,
        stack: StackRef,
        depth: &mut i64,
    ) -> Result<(), RuntimeFault> {
        #[cfg(feature = "jit")]
        if let Some(code) = self.native_code(method, calls) {
            self.stats.native_calls.fetch_add(1, Ordering::Relaxed);
            return executor::execute(self, method, code, inst, stack, depth);
        }
        #[cfg(not(feature = "jit"))]
        let _ = calls;

        self.stats.interpreted_calls.fetch_add(1, Ordering::Relaxed);
        interpreter::interpret(self, method, inst, stack, depth)
    }

    /// The method's native code, compiling it on the call that reaches the
    /// threshold. Racing callers wait on the same cell; the outcome is
    /// installed once.
    #[cfg(feature = "jit")]
    fn native_code<'m>(&self, method: &'m Method, calls: u32) -> Option<&'m NativeCode> {
        let jit = self.jit.as_ref()?;
        let threshold = self.config.compile_threshold()?;
        if calls < threshold && !method.is_compile_attempted() {
            return None;
        }
        method
            .native
            .get_or_init(|| {
                debug!(target: "stackjit::jit", method = %method.full_name, calls, "hot method");
                jit.compile(&self.program, method).ok()
            })
            .as_ref()
    }

    /// Start `cls:mthd` on a new thread with `param` on its stack.
    pub(crate) fn spawn(&self, cls: usize, mthd: usize, inst: u64, param: u64) -> Result<i64, RuntimeFault> {
        if self.program.method(cls, mthd).is_none() {
            return Err(RuntimeFault::UnknownMethod(format!("{cls}:{mthd}")));
        }
        let Some(vm) = self.this.upgrade() else {
            fatal("VM dropped while starting a thread");
        };
        Ok(self.threads.spawn(move || {
            let Some(method) = vm.program.method(cls, mthd) else {
                return;
            };
            if let Err(fault) = vm.call(method, inst, &[param]) {
                report_and_exit(&fault);
            }
        }))
    }
}

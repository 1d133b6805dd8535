use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[cfg(feature = "jit")]
use serde::Serialize;
use tracing_subscriber::filter::EnvFilter;

use stackjit::config::{JitMode, RuntimeConfig};
use stackjit::vm::{self, ReturnType, Vm, report_and_exit, runtime};

#[cfg(feature = "jit")]
use stackjit::jit::{self, Arch, CodegenStats};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ReportFormatArg {
    #[default]
    Human,
    Json,
}

#[cfg(feature = "jit")]
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ArchArg {
    #[value(name = "x86_64")]
    X86_64,
    Aarch64,
}

#[cfg(feature = "jit")]
impl From<ArchArg> for Arch {
    fn from(arg: ArchArg) -> Self {
        match arg {
            ArchArg::X86_64 => Arch::X86_64,
            ArchArg::Aarch64 => Arch::AArch64,
        }
    }
}

#[derive(Parser)]
#[command(name = "stackjit")]
#[command(about = "Run stack bytecode programs with a method JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program manifest and print what its entry method leaves on the stack
    Run {
        /// The manifest to run
        manifest: PathBuf,

        /// JIT compilation mode (off, on, auto); overrides the config file
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// Calls before a method is compiled in auto mode
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Runtime configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Translate every method of a manifest and report the outcome
    #[cfg(feature = "jit")]
    Compile {
        /// The manifest to compile
        manifest: PathBuf,

        /// Report format (human or json)
        #[arg(long, value_enum, default_value = "human")]
        format: ReportFormatArg,

        /// Target architecture (defaults to the host)
        #[arg(long, value_enum)]
        arch: Option<ArchArg>,
    },
}

fn init_tracing(trace_jit: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if trace_jit {
        if let Ok(directive) = "stackjit::jit=trace".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, String> {
    match path {
        Some(path) => RuntimeConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(RuntimeConfig::default()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            manifest,
            jit,
            jit_threshold,
            trace_jit,
            config,
        } => {
            let mut config = match load_config(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            if let Some(mode) = jit {
                config.jit_mode = mode.into();
            }
            if let Some(threshold) = jit_threshold {
                config.jit_threshold = threshold;
            }
            config.trace_jit |= trace_jit;
            if let Err(e) = config.validate() {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
            init_tracing(config.trace_jit);

            run(&manifest, config)
        }
        #[cfg(feature = "jit")]
        Commands::Compile {
            manifest,
            format,
            arch,
        } => {
            init_tracing(false);
            compile(&manifest, format, arch)
        }
    }
}

fn run(manifest: &Path, config: RuntimeConfig) -> ExitCode {
    let program = match vm::manifest::load(manifest) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let rtrn = program.entry_method().map_or(ReturnType::Nil, |m| m.rtrn);

    let vm = Vm::new(Arc::new(program), config);
    match vm.run() {
        Ok(values) => {
            for word in values {
                match rtrn {
                    ReturnType::Float => println!("{}", runtime::format_float(f64::from_bits(word))),
                    _ => println!("{}", word as i64),
                }
            }
            ExitCode::SUCCESS
        }
        Err(fault) => report_and_exit(&fault),
    }
}

#[cfg(feature = "jit")]
#[derive(Serialize)]
struct MethodReport {
    method: String,
    arch: Arch,
    #[serde(flatten)]
    outcome: Outcome,
}

#[cfg(feature = "jit")]
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Compiled {
        code_bytes: usize,
        total_bytes: usize,
        int_constants: usize,
        float_constants: usize,
        stats: CodegenStats,
    },
    Failed {
        reason: String,
    },
}

#[cfg(feature = "jit")]
fn compile(manifest: &Path, format: ReportFormatArg, arch: Option<ArchArg>) -> ExitCode {
    let Some(arch) = arch.map(Arch::from).or_else(Arch::host) else {
        eprintln!("no code generator for this host; pass --arch");
        return ExitCode::FAILURE;
    };
    let program = match vm::manifest::load(manifest) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let reports: Vec<MethodReport> = program
        .methods()
        .map(|method| {
            let outcome = match jit::translate(arch, &program, method) {
                Ok(translation) => Outcome::Compiled {
                    code_bytes: translation.assembly.code_len,
                    total_bytes: translation.assembly.bytes.len(),
                    int_constants: translation.assembly.int_constants.len(),
                    float_constants: translation.assembly.float_constants.len(),
                    stats: translation.stats,
                },
                Err(e) => Outcome::Failed {
                    reason: e.to_string(),
                },
            };
            MethodReport {
                method: method.full_name.clone(),
                arch,
                outcome,
            }
        })
        .collect();

    match format {
        ReportFormatArg::Json => match serde_json::to_string_pretty(&reports) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        ReportFormatArg::Human => {
            for report in &reports {
                match &report.outcome {
                    Outcome::Compiled {
                        code_bytes,
                        int_constants,
                        float_constants,
                        ..
                    } => println!(
                        "{} [{}]: {} bytes, {} int / {} float constants",
                        report.method,
                        report.arch.name(),
                        code_bytes,
                        int_constants,
                        float_constants
                    ),
                    Outcome::Failed { reason } => {
                        println!("{} [{}]: not compiled ({})", report.method, report.arch.name(), reason)
                    }
                }
            }
        }
    }
    ExitCode::SUCCESS
}

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

use steve::config::{JitMode, RuntimeConfig};
use steve::language::{Language, MessageKey, localize, report_error};
use steve::vm::{VirtualMachine, dump_json, parse_ir};

// Wrapper type for clap ValueEnum support
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

#[derive(Parser)]
#[command(name = "steve")]
#[command(version, about = "A stack-based IR virtual machine", long_about = None)]
struct Cli {
    /// IR file to run
    file: Option<PathBuf>,

    /// JIT compilation mode (overrides the config file)
    #[arg(long, value_enum)]
    jit: Option<JitModeArg>,

    /// Print JIT compilation info to stderr
    #[arg(long)]
    trace_jit: bool,

    /// Print GC statistics to stderr after each collection
    #[arg(long)]
    gc_stats: bool,

    /// Cap on VM-owned heap bytes
    #[arg(long, value_name = "BYTES")]
    heap_limit: Option<usize>,

    /// TOML runtime configuration
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Start the interactive debugger
    #[arg(long)]
    debug: bool,

    /// Initial breakpoint line for the debugger (repeatable)
    #[arg(long = "break", value_name = "LINE")]
    breaks: Vec<usize>,

    /// Print the parsed program as JSON and exit
    #[arg(long)]
    dump_ir: bool,
}

impl Cli {
    fn runtime_config(&self) -> Result<RuntimeConfig, String> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(jit) = self.jit {
            config.jit_mode = jit.into();
        }
        config.trace_jit |= self.trace_jit;
        config.gc_stats |= self.gc_stats;
        if self.heap_limit.is_some() {
            config.heap_limit = self.heap_limit;
        }
        Ok(config)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fatal(lang: Language, key: MessageKey, arg: &str) -> ExitCode {
    report_error(lang, key, arg, true).unwrap_or(ExitCode::FAILURE)
}

fn run(source: &str, config: RuntimeConfig, lang: Language) -> ExitCode {
    let mut vm = VirtualMachine::with_config(config);
    if vm.load_source(source).is_err() {
        return fatal(lang, MessageKey::InternalError, "Failed to load program");
    }
    if vm.execute().is_err() {
        return fatal(lang, MessageKey::InternalError, "Failed to execute program");
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let config = match cli.runtime_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let lang = config.language.unwrap_or_else(Language::detect);

    let Some(file) = cli.file.as_ref() else {
        return fatal(lang, MessageKey::Usage, "");
    };

    let Ok(source) = fs::read_to_string(file) else {
        eprintln!("{}: {}", localize(lang, MessageKey::FileNotFound, ""), file.display());
        return ExitCode::FAILURE;
    };

    if cli.dump_ir {
        return match dump_json(&parse_ir(&source)) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => fatal(lang, MessageKey::InternalError, &e.to_string()),
        };
    }

    if cli.debug {
        if let Err(e) = steve::debugger::run_debugger(file, config, &cli.breaks) {
            return fatal(lang, MessageKey::InternalError, &e);
        }
        return ExitCode::SUCCESS;
    }

    // The default hook would print its own report before ours.
    panic::set_hook(Box::new(|_| {}));
    match panic::catch_unwind(AssertUnwindSafe(|| run(&source, config, lang))) {
        Ok(code) => code,
        Err(payload) => fatal(lang, MessageKey::InternalError, &panic_message(payload.as_ref())),
    }
}

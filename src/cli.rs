//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::Parser;

use crate::eval::EvalMode;
use crate::logging::{LogConfig, parse_level};
use crate::memory::MemorySize;

/// Parallel evaluation of derivation trees with memory-bounded workers.
#[derive(Parser, Debug)]
#[command(name = "neval")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Force impure evaluation mode.
    #[arg(long)]
    pub impure: bool,

    /// Treat the expression as a flake reference.
    #[arg(long)]
    pub flake: bool,

    /// Include the meta attribute of derivations in the output.
    #[arg(long)]
    pub meta: bool,

    /// Print evaluation traces in error messages.
    #[arg(long)]
    pub show_trace: bool,

    /// Number of evaluation workers.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Maximum memory of a worker before it is restarted (MiB, or a size
    /// such as "4G").
    #[arg(long, default_value = "4096")]
    pub max_memory_size: MemorySize,

    /// Register evaluated derivations as GC roots in this directory.
    #[arg(long)]
    pub gc_roots_dir: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "NEVAL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "NEVAL_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Internal flag for worker subprocess mode (hidden from help).
    #[arg(long, hide = true)]
    pub internal_worker: bool,

    /// The expression to evaluate: a file path, or a flake reference with
    /// --flake.
    pub expr: String,
}

impl Cli {
    /// Resolve the run configuration once; it is passed explicitly from
    /// here on.
    pub fn settings(&self) -> Settings {
        Settings {
            expr: self.expr.clone(),
            flake: self.flake,
            eval_mode: if self.impure {
                EvalMode::Impure
            } else {
                EvalMode::Auto
            },
            meta: self.meta,
            show_trace: self.show_trace,
            workers: self.workers,
            max_memory: self.max_memory_size,
            gc_roots_dir: self.gc_roots_dir.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        if let Some(level) = self.log_level.as_deref().and_then(parse_level) {
            config = config.with_level(level);
        }
        if let Some(format) = self.log_format.as_deref().and_then(|s| s.parse().ok()) {
            config = config.with_format(format);
        }
        config.with_env_overrides()
    }
}

/// The run configuration shared by the collector and (re-encoded as argv)
/// its workers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub expr: String,
    pub flake: bool,
    pub eval_mode: EvalMode,
    pub meta: bool,
    pub show_trace: bool,
    pub workers: usize,
    pub max_memory: MemorySize,
    pub gc_roots_dir: Option<PathBuf>,
}

impl Settings {
    /// The argument vector a worker process is spawned with.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--internal-worker".to_string(),
            "--max-memory-size".to_string(),
            self.max_memory.as_mib().to_string(),
        ];
        if self.flake {
            args.push("--flake".into());
        }
        if self.eval_mode == EvalMode::Impure {
            args.push("--impure".into());
        }
        if self.meta {
            args.push("--meta".into());
        }
        if self.show_trace {
            args.push("--show-trace".into());
        }
        if let Some(dir) = &self.gc_roots_dir {
            args.push("--gc-roots-dir".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.push(self.expr.clone());
        args
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            expr: String::new(),
            flake: false,
            eval_mode: EvalMode::Auto,
            meta: false,
            show_trace: false,
            workers: 1,
            max_memory: MemorySize::from_mib(4096),
            gc_roots_dir: None,
        }
    }
}

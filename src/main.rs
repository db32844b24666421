//! neval - parallel evaluation of derivation trees.
//!
//! The expression interpreter offers no incremental garbage collection, so
//! large evaluations are delegated to short-lived worker processes that are
//! replaced once their resident set passes a ceiling; the operating system
//! reclaims the memory. One JSON line per leaf derivation goes to stdout.

mod accessor;
mod cli;
mod collect;
mod error;
mod eval;
mod job;
mod logging;
mod memory;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

fn main() {
    // Hygiene for every evaluator this process spawns: no search-path leaks
    // from the caller, no in-process garbage collection.
    // SAFETY: called before any threads exist.
    unsafe {
        std::env::remove_var("NIX_PATH");
        std::env::set_var("GC_DONT_GC", "1");
    }

    let cli = cli::Cli::parse();
    let settings = cli.settings();

    if cli.internal_worker {
        // Never returns; the worker speaks the pipe protocol on stdin/stdout.
        worker::run_worker_main(&settings);
    }

    logging::init(cli.log_config());

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupted.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .expect("Error setting Ctrl+C handler");
    }

    if let Err(e) = collect::run(settings, interrupted) {
        let e = anyhow::Error::new(e);
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

//! The worker process entry point and evaluation loop.
//!
//! A worker initializes a private evaluator and store, evaluates the
//! top-level value once, and then serves `do` requests until it is told to
//! exit or its resident set grows past the configured ceiling, at which
//! point it announces `restart` and leaves; the collector replaces it.

use std::process;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{CollectMsg, JobResult, WorkMsg};
use crate::accessor::AccessorPath;
use crate::cli::Settings;
use crate::error::Result;
use crate::eval::EvalState;
use crate::job::Job;
use crate::memory;

/// Run the worker loop on stdin/stdout. Never returns.
pub fn run_worker_main(settings: &Settings) -> ! {
    // Pipe failures surface as io::Error instead of killing the process.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // SAFETY: fds 0 and 1 are the pipes our parent opened for us.
    let stdin = unsafe { PipeFd::from_raw(0) };
    let stdout = unsafe { PipeFd::from_raw(1) };
    let mut reader = LineReader::new(stdin);
    let mut writer = LineWriter::new(stdout);

    match serve(settings, &mut reader, &mut writer) {
        Ok(()) => process::exit(0),
        Err(err) => {
            // Worker-fatal: everything outside the per-path boundary.
            // Report it, ask to be replaced, and leave.
            let msg = err.to_string();
            eprintln!("error: {msg}");
            let _ = writer.write_line(&WorkMsg::Fatal(msg).to_line());
            let _ = writer.write_line(&WorkMsg::Restart.to_line());
            process::exit(1);
        }
    }
}

fn serve(settings: &Settings, reader: &mut LineReader, writer: &mut LineWriter) -> Result<()> {
    // Keep evaluator caches out of the user's real cache directory; the
    // guard removes the directory when the worker exits.
    let cache_dir = tempfile::Builder::new().prefix("neval-worker-").tempdir()?;
    // SAFETY: called before any evaluation and before this process spawns
    // threads.
    unsafe { std::env::set_var("XDG_CACHE_HOME", cache_dir.path()) };

    let state = EvalState::new(settings)?;
    let ceiling_kib = settings.max_memory.as_kib();

    loop {
        writer.write_line(&WorkMsg::Next.to_line())?;

        let Some(line) = reader.read_line()? else {
            // EOF: the collector is gone.
            return Ok(());
        };
        match CollectMsg::parse(line)? {
            CollectMsg::Exit => return Ok(()),
            CollectMsg::Do(path) => {
                for result in eval_path(&state, settings, &path) {
                    writer.write_line(&result.to_line())?;
                }
                writer.write_line(&WorkMsg::Done.to_line())?;
            }
        }

        // The evaluator has no incremental GC, so the resident set only
        // grows. Past the ceiling, hand the slot to a fresh process.
        if memory::max_rss_kib() > ceiling_kib {
            writer.write_line(&WorkMsg::Restart.to_line())?;
            return Ok(());
        }
    }
}

/// Evaluate one path. Evaluation errors are per-path: they become an error
/// result and the worker keeps serving.
fn eval_path(state: &EvalState, settings: &Settings, path: &AccessorPath) -> Vec<JobResult> {
    let job = path
        .walk(state.root())
        .and_then(|v| Job::classify(state, v));

    match job {
        Ok(Job::Drvs(drvs)) => {
            let mut results = Vec::with_capacity(drvs.len());
            for drv in drvs {
                if let Err(e) = state.store().add_perm_root(&drv.drv_path) {
                    eprintln!("error: {}", e.render(settings.show_trace));
                    return vec![JobResult::error(path.clone(), e.render(settings.show_trace))];
                }
                results.push(JobResult::drv(path.clone(), drv));
            }
            results
        }
        Ok(Job::Attrs(children)) | Ok(Job::List(children)) => {
            vec![JobResult::children(path.clone(), children)]
        }
        Ok(Job::Nothing) => Vec::new(),
        Err(e) => {
            let rendered = e.render(settings.show_trace);
            eprintln!("error: {rendered}");
            vec![JobResult::error(path.clone(), rendered)]
        }
    }
}

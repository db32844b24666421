//! Spawning worker processes.
//!
//! Workers are the same executable re-run with the hidden
//! `--internal-worker` flag, so every child gets a fresh evaluator and
//! address space. Their stdin/stdout become the protocol pipes; stderr is
//! forwarded into the parent's logging.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::proc::Proc;
use crate::cli::Settings;
use crate::error::{NevalError, Result};

/// Counter naming the stderr forwarding threads.
static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Spawn one worker process for the configured expression.
pub fn spawn_worker(settings: &Settings) -> Result<Proc> {
    let exe = std::env::current_exe()
        .map_err(|e| NevalError::Worker(format!("cannot locate the worker executable: {e}")))?;

    let mut cmd = Command::new(exe);
    cmd.args(settings.worker_args());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // The evaluator must not garbage-collect in-process; the OS reclaims
    // memory when the worker is recycled.
    cmd.env("GC_DONT_GC", "1");
    cmd.env_remove("NIX_PATH");

    let mut child = cmd
        .spawn()
        .map_err(|e| NevalError::Worker(format!("failed to spawn worker: {e}")))?;

    let worker_id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(worker_id, pid = child.id(), "spawned worker process");

    if let Some(stderr) = child.stderr.take() {
        std::thread::Builder::new()
            .name(format!("worker-{worker_id}-stderr"))
            .spawn(move || forward_worker_stderr(worker_id, stderr))
            .ok();
    }

    Proc::from_child(child)
}

/// Forward a worker's stderr into tracing, classified by content: evaluator
/// errors land at WARN (these carry the messages a CI UI shows), everything
/// else at DEBUG.
fn forward_worker_stderr(worker_id: usize, stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let lower = line.to_lowercase();
        if lower.starts_with("trace:") {
            tracing::trace!(worker_id, "{line}");
        } else if lower.contains("error:") {
            tracing::warn!(worker_id, "{line}");
        } else {
            tracing::debug!(worker_id, "{line}");
        }
    }
}

//! The collector: shared work queue, handler threads, and bootstrap.
//!
//! One handler thread runs per worker slot. Each thread owns at most one
//! worker process and cycles through three states: wait for the worker to
//! speak (`next`, `restart`, or a fatal error), claim a path from the shared
//! queue (or drain to `exit` when the queue and the in-flight set are both
//! empty), and stream the results of the dispatched `do` (leaves and
//! per-path errors are printed, children are pushed back onto the queue).
//! A worker announcing `restart` mid-job puts its path back on the queue
//! and is replaced by a fresh process.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::accessor::AccessorPath;
use crate::cli::Settings;
use crate::error::{NevalError, Result};
use crate::worker::protocol::{CollectMsg, JobResult, JobResultKind, WorkMsg};
use crate::worker::{Proc, spawn_worker};

/// Queue state shared by all handler threads. Every field transition
/// happens under the mutex; `todo` and `active` stay disjoint.
struct State {
    todo: BTreeSet<AccessorPath>,
    active: BTreeSet<AccessorPath>,
    exc: Option<NevalError>,
}

struct Collector {
    settings: Settings,
    state: Mutex<State>,
    wakeup: Condvar,
    interrupted: Arc<AtomicBool>,
    jobs_completed: AtomicUsize,
    restarts: AtomicUsize,
}

/// Evaluate the configured expression and stream results to stdout.
pub fn run(settings: Settings, interrupted: Arc<AtomicBool>) -> Result<()> {
    let collector = Collector::new(settings, interrupted);

    collector.bootstrap()?;

    std::thread::scope(|scope| {
        for _ in 0..collector.settings.workers.max(1) {
            scope.spawn(|| collector.handler());
        }
    });

    tracing::info!(
        workers = collector.settings.workers,
        jobs = collector.jobs_completed.load(Ordering::Relaxed),
        restarts = collector.restarts.load(Ordering::Relaxed),
        "evaluation finished"
    );

    let mut st = collector.lock();
    match st.exc.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl Collector {
    fn new(settings: Settings, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            settings,
            state: Mutex::new(State {
                todo: BTreeSet::new(),
                active: BTreeSet::new(),
                exc: None,
            }),
            wakeup: Condvar::new(),
            interrupted,
            jobs_completed: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("collector state mutex poisoned")
    }

    /// Discover the root's jobs with a dedicated one-shot worker, so any
    /// fetching the top-level evaluation triggers happens in a child, not
    /// in the parent the later workers descend from.
    fn bootstrap(&self) -> Result<()> {
        tracing::debug!("collecting the top-level jobs");
        let mut worker = Some(spawn_worker(&self.settings)?);

        match self.recv_msg(&mut worker, "during startup")? {
            WorkMsg::Next => {}
            WorkMsg::Fatal(msg) => return Err(NevalError::Worker(msg)),
            other => {
                return Err(NevalError::Protocol(format!(
                    "expected next, got: {}",
                    other.to_line()
                )));
            }
        }

        let root = AccessorPath::root();
        self.send_msg(&mut worker, &CollectMsg::Do(root))?;

        loop {
            match self.recv_msg(&mut worker, "while evaluating the top-level value")? {
                WorkMsg::Done => break,
                WorkMsg::Result(result) => {
                    if let JobResultKind::Error(error) = &result.kind {
                        // A broken root aborts before any handler starts.
                        return Err(NevalError::Worker(format!(
                            "evaluation of the top-level value failed: {error}"
                        )));
                    }
                    self.handle_result(result)?;
                }
                WorkMsg::Fatal(msg) => return Err(NevalError::Worker(msg)),
                other => {
                    return Err(NevalError::Protocol(format!(
                        "expected a result, got: {}",
                        other.to_line()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Body of one handler thread; stores its error for the main thread to
    /// re-raise and wakes everybody so they drain.
    fn handler(&self) {
        if let Err(err) = self.drive_worker() {
            tracing::debug!(error = %err, "handler thread failed");
            let mut st = self.lock();
            if st.exc.is_none() {
                st.exc = Some(err);
            }
            drop(st);
            self.wakeup.notify_all();
        }
    }

    fn drive_worker(&self) -> Result<()> {
        let mut worker: Option<Proc> = None;
        loop {
            if worker.is_none() {
                worker = Some(spawn_worker(&self.settings)?);
            }

            // WaitWorker: the worker speaks first.
            match self.recv_msg(&mut worker, "while waiting for it to become ready")? {
                WorkMsg::Next => {}
                WorkMsg::Restart => {
                    // Recycled between jobs; a replacement is spawned on
                    // demand.
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    worker = None;
                    continue;
                }
                WorkMsg::Fatal(msg) => return Err(NevalError::Worker(msg)),
                other => {
                    return Err(NevalError::Protocol(format!(
                        "expected next or restart, got: {}",
                        other.to_line()
                    )));
                }
            }

            // WaitJob
            let Some(path) = self.next_job(&mut worker)? else {
                return Ok(());
            };

            self.send_msg(&mut worker, &CollectMsg::Do(path.clone()))?;

            // AwaitResults
            let mut recycle = false;
            loop {
                let context = format!("while evaluating {path}");
                match self.recv_msg(&mut worker, &context)? {
                    WorkMsg::Done => {
                        let mut st = self.lock();
                        st.active.remove(&path);
                        drop(st);
                        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
                        self.wakeup.notify_all();
                        break;
                    }
                    WorkMsg::Restart => {
                        // Self-terminated mid-job; the path goes back on
                        // the queue for some other worker.
                        let mut st = self.lock();
                        st.active.remove(&path);
                        st.todo.insert(path.clone());
                        drop(st);
                        self.restarts.fetch_add(1, Ordering::Relaxed);
                        self.wakeup.notify_all();
                        recycle = true;
                        break;
                    }
                    WorkMsg::Result(result) => self.handle_result(result)?,
                    WorkMsg::Fatal(msg) => return Err(NevalError::Worker(msg)),
                    WorkMsg::Next => {
                        return Err(NevalError::Protocol(
                            "worker sent next while a job was in flight".into(),
                        ));
                    }
                }
            }
            if recycle {
                worker = None;
            }
        }
    }

    /// WaitJob: block until a path is available, the queue drains, or the
    /// run fails. Returns `None` after telling the worker to exit.
    fn next_job(&self, worker: &mut Option<Proc>) -> Result<Option<AccessorPath>> {
        let mut st = self.lock();
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(NevalError::Interrupted);
            }
            if st.exc.is_some() || (st.todo.is_empty() && st.active.is_empty()) {
                drop(st);
                if let Some(proc) = worker.as_mut() {
                    // The worker may already be gone; it is being dropped
                    // either way.
                    let _ = proc.send(&CollectMsg::Exit);
                }
                return Ok(None);
            }
            if let Some(path) = st.todo.pop_first() {
                st.active.insert(path.clone());
                return Ok(Some(path));
            }
            st = self.wakeup.wait(st).expect("collector state mutex poisoned");
        }
    }

    /// Expand a children result into the queue; print everything else.
    fn handle_result(&self, result: JobResult) -> Result<()> {
        match &result.kind {
            JobResultKind::Children(children) => {
                let mut st = self.lock();
                for child in children {
                    st.todo.insert(result.path.child(child));
                }
                drop(st);
                self.wakeup.notify_all();
                Ok(())
            }
            JobResultKind::Drv(_) | JobResultKind::Error(_) => self.print_result(&result),
        }
    }

    /// Print one output line. The state lock doubles as the stdout guard so
    /// lines from concurrent handlers never interleave.
    fn print_result(&self, result: &JobResult) -> Result<()> {
        let line = result.to_line();
        let _st = self.lock();
        let mut out = std::io::stdout().lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    fn send_msg(&self, worker: &mut Option<Proc>, msg: &CollectMsg) -> Result<()> {
        worker
            .as_mut()
            .expect("no worker to send to")
            .send(msg)
    }

    fn recv_msg(&self, worker: &mut Option<Proc>, context: &str) -> Result<WorkMsg> {
        let proc = worker.as_mut().expect("no worker to receive from");
        match proc.recv()? {
            Some(msg) => Ok(msg),
            None => {
                let reason = proc.death_reason();
                Err(NevalError::Worker(format!(
                    "worker died unexpectedly {context} ({reason})"
                )))
            }
        }
    }
}

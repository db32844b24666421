//! Supervisor handle for one worker process.
//!
//! Owns the pid and the parent halves of both pipes. Dropping the handle
//! reaps the child: the write pipe is closed first so the worker sees EOF
//! and can leave on its own, then termination is escalated.

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{CollectMsg, WorkMsg};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{NevalError, Result};

/// How long a worker gets to exit voluntarily before signals are used.
const STOP_GRACE: Duration = Duration::from_millis(500);

pub struct Proc {
    pid: Pid,
    /// Write half; taken during teardown to signal EOF.
    writer: Option<LineWriter>,
    reader: LineReader,
    reaped: bool,
}

impl Proc {
    /// Adopt a spawned child whose stdin/stdout are the protocol pipes.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| NevalError::Worker("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NevalError::Worker("child stdout not captured".into()))?;
        Ok(Self {
            pid,
            writer: Some(LineWriter::new(PipeFd::new(stdin.into()))),
            reader: LineReader::new(PipeFd::new(stdout.into())),
            reaped: false,
        })
    }

    /// Send a message to the worker.
    pub fn send(&mut self, msg: &CollectMsg) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| NevalError::Worker("worker pipe already closed".into()))?;
        writer
            .write_line(&msg.to_line())
            .map_err(|e| NevalError::Worker(format!("failed to send to worker: {e}")))
    }

    /// Receive the next message. `None` means the worker closed its pipe.
    pub fn recv(&mut self) -> Result<Option<WorkMsg>> {
        match self.reader.read_line() {
            Ok(Some(line)) => WorkMsg::parse(line).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(NevalError::Worker(format!(
                "failed to receive from worker: {e}"
            ))),
        }
    }

    /// Why the child terminated, for diagnostics after an unexpected EOF.
    /// Reaps the child if it already exited.
    pub fn death_reason(&mut self) -> TerminationReason {
        if self.reaped {
            return TerminationReason::Unknown;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => TerminationReason::StillAlive,
            Ok(status) => {
                self.reaped = true;
                analyze_wait_status(status)
            }
            Err(_) => {
                self.reaped = true;
                TerminationReason::Unknown
            }
        }
    }

    fn try_wait(&mut self) -> Option<WaitStatus> {
        if self.reaped {
            return None;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.reaped = true;
                Some(status)
            }
            Err(_) => {
                self.reaped = true;
                Some(WaitStatus::StillAlive)
            }
        }
    }

    /// Stop the worker: ask it to exit, close its request pipe, and escalate
    /// to SIGTERM then SIGKILL if it lingers.
    pub fn stop(&mut self) {
        if self.reaped {
            return;
        }

        // The exit may race a worker that already left; EPIPE is fine.
        let _ = self.send(&CollectMsg::Exit);
        self.writer = None;

        let deadline = std::time::Instant::now() + STOP_GRACE;
        while std::time::Instant::now() < deadline {
            if self.try_wait().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(100));
        if self.try_wait().is_some() {
            return;
        }

        let _ = signal::kill(self.pid, Signal::SIGKILL);
        if !self.reaped {
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        self.stop();
    }
}

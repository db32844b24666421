//! Worker subprocess machinery.
//!
//! Each collector thread drives at most one worker process at a time over
//! two unidirectional pipes. Workers carry their own evaluator, so memory
//! spent on evaluation lives in the child and dies with it:
//!
//! ```text
//!              ┌──────────────────┐
//!              │  parent process  │
//!              │ collector threads│
//!              └───┬────┬────┬────┘
//!                  │    │    │      one pipe pair per worker
//!              ┌───▼┐ ┌─▼──┐ ┌▼───┐
//!              │ w0 │ │ w1 │ │ wN │  evaluator per process,
//!              └────┘ └────┘ └────┘  recycled past the RSS ceiling
//! ```

mod ipc;
mod proc;
pub mod protocol;
mod signals;
mod spawn;
mod worker_main;

pub use proc::Proc;
pub use spawn::spawn_worker;
pub use worker_main::run_worker_main;

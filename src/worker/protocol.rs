//! The line-framed protocol spoken over the two pipes of a worker.
//!
//! Collector to worker:
//!
//! - `exit` - shut down cleanly
//! - `do <json-path>` - evaluate the accessor path
//!
//! Worker to collector:
//!
//! - `next` - ready for a new path
//! - `restart` - the worker is terminating voluntarily (memory ceiling) and
//!   should be replaced; an in-flight path must be resubmitted
//! - `done` - terminator for the result stream of the current `do`
//! - a JSON object with a `path` key - one per-path result: a derivation
//!   leaf, a `children` array of accessors, or a per-path `error`
//! - a JSON object with an `error` key and no `path` - fatal worker error
//!
//! Results printed to stdout also carry `attr`, the dotted cosmetic form of
//! the path.

use serde_json::{Map, Value as Json, json};

use crate::accessor::{Accessor, AccessorPath};
use crate::error::{NevalError, Result};
use crate::job::Drv;

/// Message from the collector to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectMsg {
    /// Graceful shutdown request.
    Exit,
    /// Evaluate the given accessor path.
    Do(AccessorPath),
}

impl CollectMsg {
    pub fn to_line(&self) -> String {
        match self {
            CollectMsg::Exit => "exit".to_string(),
            CollectMsg::Do(path) => format!("do {}", path.to_json()),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        if line == "exit" {
            return Ok(CollectMsg::Exit);
        }
        if let Some(rest) = line.strip_prefix("do ") {
            return Ok(CollectMsg::Do(AccessorPath::parse(rest)?));
        }
        Err(NevalError::Protocol(format!(
            "unexpected message from collector: {line}"
        )))
    }
}

/// Message from a worker to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkMsg {
    Next,
    Restart,
    Done,
    /// One result belonging to the currently executing `do`.
    Result(JobResult),
    /// Fatal worker error; the collector aborts the run.
    Fatal(String),
}

impl WorkMsg {
    pub fn to_line(&self) -> String {
        match self {
            WorkMsg::Next => "next".to_string(),
            WorkMsg::Restart => "restart".to_string(),
            WorkMsg::Done => "done".to_string(),
            WorkMsg::Result(result) => result.to_line(),
            WorkMsg::Fatal(msg) => json!({ "error": msg }).to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        match line {
            "next" => return Ok(WorkMsg::Next),
            "restart" => return Ok(WorkMsg::Restart),
            "done" => return Ok(WorkMsg::Done),
            _ => {}
        }
        let json: Json = serde_json::from_str(line)
            .map_err(|_| NevalError::Protocol(format!("unparsable worker message: {line}")))?;
        let Some(obj) = json.as_object() else {
            return Err(NevalError::Protocol(format!(
                "unexpected worker message: {line}"
            )));
        };
        if obj.contains_key("path") {
            return Ok(WorkMsg::Result(JobResult::from_object(obj)?));
        }
        if let Some(error) = obj.get("error").and_then(Json::as_str) {
            return Ok(WorkMsg::Fatal(error.to_string()));
        }
        Err(NevalError::Protocol(format!(
            "unexpected worker message: {line}"
        )))
    }
}

/// A per-path evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// The path that produced this result.
    pub path: AccessorPath,
    pub kind: JobResultKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobResultKind {
    /// A leaf derivation.
    Drv(Drv),
    /// Accessors to descend into from this path.
    Children(Vec<Accessor>),
    /// A per-path evaluation error; reported, not fatal.
    Error(String),
}

impl JobResult {
    pub fn drv(path: AccessorPath, drv: Drv) -> Self {
        Self {
            path,
            kind: JobResultKind::Drv(drv),
        }
    }

    pub fn children(path: AccessorPath, children: Vec<Accessor>) -> Self {
        Self {
            path,
            kind: JobResultKind::Children(children),
        }
    }

    pub fn error(path: AccessorPath, message: impl Into<String>) -> Self {
        Self {
            path,
            kind: JobResultKind::Error(message.into()),
        }
    }

    /// Serialize to the wire (and stdout) form.
    pub fn to_line(&self) -> String {
        let mut obj = match &self.kind {
            JobResultKind::Drv(drv) => {
                match serde_json::to_value(drv).expect("derivation serialization failed") {
                    Json::Object(obj) => obj,
                    _ => unreachable!("derivations serialize to objects"),
                }
            }
            JobResultKind::Children(children) => {
                let mut obj = Map::new();
                obj.insert("children".into(), json!(children));
                obj
            }
            JobResultKind::Error(error) => {
                let mut obj = Map::new();
                obj.insert("error".into(), json!(error));
                obj
            }
        };
        // Children results stay internal; leaves and errors are printed, so
        // they also carry the dotted attr form.
        if !matches!(self.kind, JobResultKind::Children(_)) {
            obj.insert("attr".into(), json!(self.path.to_attr_path()));
        }
        obj.insert("path".into(), self.path.to_json());
        Json::Object(obj).to_string()
    }

    fn from_object(obj: &Map<String, Json>) -> Result<Self> {
        let path_json = obj.get("path").cloned().unwrap_or(Json::Null);
        let path: AccessorPath = serde_json::from_value(path_json)
            .map_err(|e| NevalError::Protocol(format!("invalid result path: {e}")))?;

        if let Some(error) = obj.get("error").and_then(Json::as_str) {
            return Ok(JobResult::error(path, error));
        }
        if let Some(children) = obj.get("children") {
            let children: Vec<Accessor> = serde_json::from_value(children.clone())
                .map_err(|e| NevalError::Protocol(format!("invalid children accessors: {e}")))?;
            return Ok(JobResult::children(path, children));
        }
        let drv: Drv = serde_json::from_value(Json::Object(obj.clone()))
            .map_err(|e| NevalError::Protocol(format!("invalid derivation result: {e}")))?;
        Ok(JobResult::drv(path, drv))
    }
}

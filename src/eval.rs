//! The expression evaluator behind the worker loop.
//!
//! Everything the rest of the crate knows about the interpreter goes through
//! this module: a nested [`Value`] model, an [`EvalState`] that produces the
//! top-level value exactly once per process, and a [`Store`] handle for GC
//! root registration. Job-set expressions are JSON documents following the
//! interpreter conventions: a derivation is an attribute set whose `type`
//! attribute is the string `"derivation"`, an attribute set carrying
//! `recurseForDerivations = true` is recursed by the derivation query, and a
//! `__throw` attribute models a thrown evaluation error. Swapping in a real
//! Nix evaluator replaces this module and nothing else.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value as Json;
use thiserror::Error;

use crate::cli::Settings;

/// Evaluation mode selection. `Auto` resolves to pure for flakes and impure
/// for plain files, matching the interpreter's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Auto,
    Impure,
}

/// An evaluation error, caught per path inside the worker.
#[derive(Debug, Clone, Error)]
#[error("{msg}")]
pub struct EvalError {
    msg: String,
    trace: Vec<String>,
}

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            trace: Vec::new(),
        }
    }

    /// Add a trace frame, innermost first.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.trace.push(frame.into());
        self
    }

    /// Render the message, with the trace appended when `show_trace` is set.
    pub fn render(&self, show_trace: bool) -> String {
        if !show_trace || self.trace.is_empty() {
            return self.msg.clone();
        }
        let mut out = self.msg.clone();
        for frame in &self.trace {
            out.push_str("\n… ");
            out.push_str(frame);
        }
        out
    }
}

/// A value in the interpreter's model.
///
/// Attribute sets live in a `BTreeMap` so enumeration is lexicographic by
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Attrs(BTreeMap<String, Value>),
}

impl Value {
    /// The interpreter's name for this value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "a Boolean",
            Value::Int(_) => "an integer",
            Value::Float(_) => "a float",
            Value::String(_) => "a string",
            Value::List(_) => "a list",
            Value::Attrs(_) => "a set",
        }
    }

    /// Force the value, surfacing a modeled `throw`.
    pub fn force(&self) -> Result<&Value, EvalError> {
        if let Value::Attrs(attrs) = self {
            if let Some(Value::String(msg)) = attrs.get("__throw") {
                return Err(EvalError::new(msg.clone()));
            }
        }
        Ok(self)
    }

    pub fn attrs(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Attrs(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value is a derivation (`type == "derivation"`).
    pub fn is_derivation(&self) -> bool {
        self.attrs()
            .and_then(|a| a.get("type"))
            .and_then(Value::string)
            == Some("derivation")
    }

    /// Whether the derivation query should recurse into this set.
    pub fn recurse_for_derivations(&self) -> bool {
        matches!(
            self.attrs().and_then(|a| a.get("recurseForDerivations")),
            Some(Value::Bool(true))
        )
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Attrs(attrs) => Json::Object(
                attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(obj) => Value::Attrs(
                obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

/// A flake reference: a directory (or expression file) with an optional
/// `#fragment` selecting an output attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeRef {
    pub source: PathBuf,
    pub fragment: String,
}

/// The output attribute evaluated when a flake reference has no fragment.
const DEFAULT_FLAKE_FRAGMENT: &str = "hydraJobs";

impl FlakeRef {
    pub fn parse(s: &str) -> Result<Self, EvalError> {
        let (source, fragment) = match s.split_once('#') {
            Some((src, frag)) if !frag.is_empty() => (src, frag),
            Some((src, _)) => (src, DEFAULT_FLAKE_FRAGMENT),
            None => (s, DEFAULT_FLAKE_FRAGMENT),
        };
        if source.is_empty() {
            return Err(EvalError::new(format!("invalid flake reference '{s}'")));
        }
        Ok(Self {
            source: PathBuf::from(source),
            fragment: fragment.to_string(),
        })
    }

    /// The file holding the flake's outputs.
    fn outputs_file(&self) -> PathBuf {
        if self.source.is_dir() {
            self.source.join("flake.json")
        } else {
            self.source.clone()
        }
    }
}

impl fmt::Display for FlakeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source.display(), self.fragment)
    }
}

/// The store handle owned by one worker process.
#[derive(Debug, Clone)]
pub struct Store {
    gc_roots_dir: Option<PathBuf>,
}

impl Store {
    pub fn open(gc_roots_dir: Option<PathBuf>) -> Result<Self, EvalError> {
        if let Some(dir) = &gc_roots_dir {
            fs::create_dir_all(dir).map_err(|e| {
                EvalError::new(format!(
                    "cannot create GC roots directory '{}': {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(Self { gc_roots_dir })
    }

    /// Register a derivation as a permanent GC root, if a roots directory is
    /// configured. Roots that already exist are left alone, including ones
    /// another worker registered concurrently.
    pub fn add_perm_root(&self, drv_path: &str) -> Result<(), EvalError> {
        let Some(dir) = &self.gc_roots_dir else {
            return Ok(());
        };
        let name = Path::new(drv_path)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(drv_path));
        let root = dir.join(name);
        if root.exists() {
            return Ok(());
        }
        match std::os::unix::fs::symlink(drv_path, &root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(EvalError::new(format!(
                "cannot register GC root '{}': {e}",
                root.display()
            ))),
        }
    }
}

/// Per-process evaluator state: the settings-resolved evaluation mode, the
/// store handle, and the top-level value, evaluated exactly once.
pub struct EvalState {
    root: Value,
    meta: bool,
    store: Store,
}

impl EvalState {
    pub fn new(settings: &Settings) -> Result<Self, EvalError> {
        let pure_eval = match settings.eval_mode {
            EvalMode::Impure => false,
            EvalMode::Auto => settings.flake,
        };

        let root = if settings.flake {
            let flake = FlakeRef::parse(&settings.expr)?;
            let outputs = eval_file(&flake.outputs_file(), pure_eval)?;
            select_fragment(&flake, outputs)?
        } else {
            eval_file(Path::new(&settings.expr), pure_eval)?
        };

        Ok(Self {
            root,
            meta: settings.meta,
            store: Store::open(settings.gc_roots_dir.clone())?,
        })
    }

    /// The top-level value.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Whether derivation records carry their `meta` attribute.
    pub fn include_meta(&self) -> bool {
        self.meta
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Evaluate an expression file into its root value.
fn eval_file(path: &Path, pure_eval: bool) -> Result<Value, EvalError> {
    let text = fs::read_to_string(path)
        .map_err(|e| EvalError::new(format!("cannot read '{}': {e}", path.display())))?;
    let json: Json = serde_json::from_str(&text).map_err(|e| {
        EvalError::new(format!("syntax error in '{}': {e}", path.display()))
    })?;
    Ok(resolve_impurities(Value::from(json), pure_eval))
}

/// Walk a flake fragment (a dotted attribute path) into the outputs value.
fn select_fragment(flake: &FlakeRef, outputs: Value) -> Result<Value, EvalError> {
    let mut current = outputs;
    for part in flake.fragment.split('.') {
        let forced = current.force().map_err(|e| {
            e.with_frame(format!("while evaluating the flake output '{part}'"))
        })?;
        let Some(attrs) = forced.attrs() else {
            return Err(EvalError::new(format!(
                "flake '{flake}': expected a set while selecting '{part}', got {}",
                forced.type_name()
            )));
        };
        current = attrs.get(part).cloned().ok_or_else(|| {
            EvalError::new(format!("flake '{flake}' does not provide attribute '{part}'"))
        })?;
    }
    Ok(current)
}

/// Resolve `__env` references at load time. In impure mode they become the
/// variable's value (empty if unset); in pure mode forcing one later raises
/// an evaluation error.
fn resolve_impurities(value: Value, pure_eval: bool) -> Value {
    match value {
        Value::Attrs(attrs) => {
            if let Some(Value::String(var)) = attrs.get("__env") {
                return if pure_eval {
                    let msg = format!(
                        "cannot read environment variable '{var}' in pure evaluation mode"
                    );
                    Value::Attrs(BTreeMap::from([(
                        "__throw".to_string(),
                        Value::String(msg),
                    )]))
                } else {
                    Value::String(std::env::var(var).unwrap_or_default())
                };
            }
            Value::Attrs(
                attrs
                    .into_iter()
                    .map(|(k, v)| (k, resolve_impurities(v, pure_eval)))
                    .collect(),
            )
        }
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| resolve_impurities(v, pure_eval))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(json: Json) -> Value {
        Value::from(json)
    }

    #[test]
    fn derivation_recognition() {
        let drv = value(json!({"type": "derivation", "name": "x"}));
        assert!(drv.is_derivation());
        assert!(!value(json!({"type": "package"})).is_derivation());
        assert!(!value(json!(["derivation"])).is_derivation());
    }

    #[test]
    fn recurse_marker() {
        assert!(value(json!({"recurseForDerivations": true})).recurse_for_derivations());
        assert!(!value(json!({"recurseForDerivations": false})).recurse_for_derivations());
        assert!(!value(json!({})).recurse_for_derivations());
    }

    #[test]
    fn force_surfaces_thrown_errors() {
        let bomb = value(json!({"__throw": "boom"}));
        let err = bomb.force().unwrap_err();
        assert_eq!(err.to_string(), "boom");

        assert!(value(json!({"a": 1})).force().is_ok());
        assert!(Value::Null.force().is_ok());
    }

    #[test]
    fn attrs_iterate_lexicographically() {
        let v = value(json!({"zeta": 1, "alpha": 2, "mid": 3}));
        let names: Vec<_> = v.attrs().unwrap().keys().cloned().collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn flake_ref_parsing() {
        let r = FlakeRef::parse("./ci#checks.x86_64-linux").unwrap();
        assert_eq!(r.source, PathBuf::from("./ci"));
        assert_eq!(r.fragment, "checks.x86_64-linux");

        let r = FlakeRef::parse("./ci").unwrap();
        assert_eq!(r.fragment, "hydraJobs");

        let r = FlakeRef::parse("./ci#").unwrap();
        assert_eq!(r.fragment, "hydraJobs");

        assert!(FlakeRef::parse("#x").is_err());
    }

    #[test]
    fn fragment_selection() {
        let flake = FlakeRef::parse("flake#jobs.release").unwrap();
        let outputs = value(json!({"jobs": {"release": {"type": "derivation"}}}));
        let selected = select_fragment(&flake, outputs).unwrap();
        assert!(selected.is_derivation());

        let outputs = value(json!({"jobs": {}}));
        let err = select_fragment(&flake, outputs).unwrap_err();
        assert!(err.to_string().contains("release"));
    }

    #[test]
    fn env_references_resolve_by_mode() {
        // SAFETY: tests in this module run on the test harness's threads, but
        // the variable is only read back through resolve_impurities below.
        unsafe { std::env::set_var("NEVAL_TEST_ENV_REF", "impure-result") };
        let expr = value(json!({"v": {"__env": "NEVAL_TEST_ENV_REF"}}));

        let impure = resolve_impurities(expr.clone(), false);
        let v = impure.attrs().unwrap().get("v").unwrap();
        assert_eq!(v.string(), Some("impure-result"));

        let pure = resolve_impurities(expr, true);
        let v = pure.attrs().unwrap().get("v").unwrap();
        assert!(v.force().is_err());
    }

    #[test]
    fn perm_roots_are_symlinked_once() {
        let dir = tempfile::tempdir().unwrap();
        let roots = dir.path().join("roots");
        let store = Store::open(Some(roots.clone())).unwrap();

        store.add_perm_root("/nix/store/abc-hello.drv").unwrap();
        store.add_perm_root("/nix/store/abc-hello.drv").unwrap();

        let root = roots.join("abc-hello.drv");
        assert!(root.symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn eval_error_trace_rendering() {
        let err = EvalError::new("boom").with_frame("while evaluating the attribute 'a'");
        assert_eq!(err.render(false), "boom");
        assert!(err.render(true).contains("while evaluating"));
    }
}

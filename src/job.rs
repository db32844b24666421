//! Classification of a walked value into the job it represents.
//!
//! A value reached by an accessor path is exactly one of: a derivation set
//! (one or more leaf records), a set or list of further jobs (children to
//! descend into), or the null sentinel (nothing). Anything else is an
//! evaluation error for that path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::accessor::Accessor;
use crate::eval::{EvalError, EvalState, Value};

/// A leaf derivation record, produced inside a worker and serialized to the
/// collector verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drv {
    pub name: String,
    pub system: String,
    #[serde(rename = "drvPath")]
    pub drv_path: String,
    pub outputs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Json>,
}

impl Drv {
    /// Build a leaf record from a derivation value.
    ///
    /// The caller has already established `v.is_derivation()`; this
    /// validates the fields the record needs. A missing or `"unknown"`
    /// system is rejected, as is an empty output set.
    pub fn from_value(state: &EvalState, v: &Value) -> Result<Self, EvalError> {
        let attrs = v
            .attrs()
            .ok_or_else(|| EvalError::new("derivation is not a set"))?;

        let name = attrs
            .get("name")
            .and_then(Value::string)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EvalError::new("derivation must have a 'name' attribute"))?
            .to_string();

        let system = attrs
            .get("system")
            .and_then(Value::string)
            .unwrap_or("unknown");
        if system.is_empty() || system == "unknown" {
            return Err(EvalError::new("derivation must have a 'system' attribute"));
        }

        let drv_path = attrs
            .get("drvPath")
            .and_then(Value::string)
            .ok_or_else(|| EvalError::new("derivation must have a 'drvPath' attribute"))?
            .to_string();

        let mut outputs = BTreeMap::new();
        if let Some(Value::Attrs(outs)) = attrs.get("outputs") {
            for (out_name, out) in outs {
                let path = out.string().ok_or_else(|| {
                    EvalError::new(format!("output '{out_name}' of '{name}' is not a path"))
                })?;
                outputs.insert(out_name.clone(), path.to_string());
            }
        }
        if outputs.is_empty() {
            return Err(EvalError::new(format!(
                "derivation '{name}' must have at least one output"
            )));
        }

        let meta = if state.include_meta() {
            attrs.get("meta").map(Value::to_json)
        } else {
            None
        };

        Ok(Self {
            name,
            system: system.to_string(),
            drv_path,
            meta,
            outputs,
        })
    }
}

/// What a walked value turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// One or more leaf derivations.
    Drvs(Vec<Drv>),
    /// A set of jobs; children are the attribute names in lexicographic
    /// order.
    Attrs(Vec<Accessor>),
    /// A list of jobs; children are `Index(0)` through `Index(n-1)`.
    List(Vec<Accessor>),
    /// The null sentinel: prune this path silently.
    Nothing,
}

impl Job {
    /// Classify a value, trying derivation set, then set-of-jobs, then
    /// list-of-jobs, then null. The first match wins.
    pub fn classify(state: &EvalState, v: &Value) -> Result<Job, EvalError> {
        let v = v.force()?;

        let drvs = query_derivations(state, v)?;
        if !drvs.is_empty() {
            return Ok(Job::Drvs(drvs));
        }

        match v {
            Value::Attrs(attrs) => Ok(Job::Attrs(
                attrs.keys().map(|n| Accessor::Name(n.clone())).collect(),
            )),
            Value::List(items) => Ok(Job::List(
                (0..items.len() as u64).map(Accessor::Index).collect(),
            )),
            Value::Null => Ok(Job::Nothing),
            other => Err(EvalError::new(format!(
                "value is {}, which is not supported",
                other.type_name()
            ))),
        }
    }
}

/// The derivation query: a derivation value yields itself; a set marked
/// `recurseForDerivations = true` yields every derivation beneath it,
/// descending through further marked sets. Anything else yields nothing,
/// leaving the value to the children classifications.
fn query_derivations(state: &EvalState, v: &Value) -> Result<Vec<Drv>, EvalError> {
    if v.is_derivation() {
        return Ok(vec![Drv::from_value(state, v)?]);
    }
    let mut drvs = Vec::new();
    if v.recurse_for_derivations() {
        collect_derivations(state, v, &mut drvs)?;
    }
    Ok(drvs)
}

fn collect_derivations(
    state: &EvalState,
    set: &Value,
    drvs: &mut Vec<Drv>,
) -> Result<(), EvalError> {
    // recurse_for_derivations established this is a set
    let Some(attrs) = set.attrs() else {
        return Ok(());
    };
    for (name, child) in attrs {
        let child = child
            .force()
            .map_err(|e| e.with_frame(format!("while evaluating the attribute '{name}'")))?;
        if child.is_derivation() {
            drvs.push(Drv::from_value(state, child)?);
        } else if child.recurse_for_derivations() {
            collect_derivations(state, child, drvs)?;
        }
    }
    Ok(())
}

//! Accessors locate a sub-value inside the top-level value.
//!
//! An [`Accessor`] is one step (a list index or an attribute name); an
//! [`AccessorPath`] is the sequence of steps from the root. Paths travel on
//! the wire as JSON arrays of bare integers and strings, so they double as
//! the canonical queue key on the collector side.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::error::{NevalError, Result};
use crate::eval::{EvalError, Value};

/// One step into a nested value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Accessor {
    /// An index into a list.
    Index(u64),
    /// An attribute name in a set.
    Name(String),
}

impl Accessor {
    /// Parse an accessor from its JSON form: an integer is an index,
    /// anything else must be a non-empty string.
    pub fn from_json(json: &Json) -> Result<Self> {
        if let Some(i) = json.as_u64() {
            return Ok(Accessor::Index(i));
        }
        match json.as_str() {
            Some("") => Err(NevalError::Protocol(
                "empty attribute name in accessor path".into(),
            )),
            Some(name) => Ok(Accessor::Name(name.to_string())),
            None => Err(NevalError::Protocol(format!(
                "could not make an accessor out of json: {json}"
            ))),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Accessor::Index(i) => Json::from(*i),
            Accessor::Name(n) => Json::String(n.clone()),
        }
    }
}

impl Serialize for Accessor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Accessor::Index(i) => serializer.serialize_u64(*i),
            Accessor::Name(n) => serializer.serialize_str(n),
        }
    }
}

impl<'de> Deserialize<'de> for Accessor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Accessor::from_json(&json).map_err(serde::de::Error::custom)
    }
}

/// A path from the root to a sub-value; empty means the root itself.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccessorPath(Vec<Accessor>);

impl AccessorPath {
    /// The empty path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path from its JSON-array encoding.
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| NevalError::Protocol(format!("invalid accessor path '{s}': {e}")))
    }

    /// The path extended by one more step.
    pub fn child(&self, accessor: &Accessor) -> AccessorPath {
        let mut steps = self.0.clone();
        steps.push(accessor.clone());
        AccessorPath(steps)
    }

    pub fn to_json(&self) -> Json {
        Json::Array(self.0.iter().map(Accessor::to_json).collect())
    }

    /// The dotted human form, used only for diagnostics and the cosmetic
    /// `attr` output field. Each step is rendered as its JSON dump, so names
    /// keep their quotes: `"g"."h"`, `0."name"`.
    pub fn to_attr_path(&self) -> String {
        self.0
            .iter()
            .map(|a| a.to_json().to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Advance step by step from the root to the addressed sub-value.
    ///
    /// Each intermediate value is forced; an index requires a list that is
    /// long enough, a name requires a set containing it, and any other value
    /// type fails with a type error naming the offending step.
    pub fn walk<'v>(&self, root: &'v Value) -> std::result::Result<&'v Value, EvalError> {
        let mut current = root;
        for accessor in &self.0 {
            let forced = current
                .force()
                .map_err(|e| e.with_frame(format!("while evaluating {}", self.to_attr_path())))?;
            current = match (accessor, forced) {
                (Accessor::Name(name), Value::Attrs(attrs)) => {
                    attrs.get(name).ok_or_else(|| {
                        EvalError::new(format!(
                            "attribute '{name}' not found along path {}",
                            self.to_attr_path()
                        ))
                    })?
                }
                (Accessor::Index(i), Value::List(items)) => {
                    items.get(*i as usize).ok_or_else(|| {
                        EvalError::new(format!(
                            "list index {i} out of range along path {}",
                            self.to_attr_path()
                        ))
                    })?
                }
                (accessor, other) => {
                    return Err(EvalError::new(format!(
                        "cannot apply accessor {} to {} along path {}",
                        accessor.to_json(),
                        other.type_name(),
                        self.to_attr_path()
                    )));
                }
            };
        }
        Ok(current)
    }
}

impl fmt::Display for AccessorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> AccessorPath {
        AccessorPath::parse(s).unwrap()
    }

    #[test]
    fn accessor_parsing() {
        assert_eq!(Accessor::from_json(&json!(3)).unwrap(), Accessor::Index(3));
        assert_eq!(
            Accessor::from_json(&json!("pkgs")).unwrap(),
            Accessor::Name("pkgs".into())
        );
        assert!(Accessor::from_json(&json!("")).is_err());
        assert!(Accessor::from_json(&json!(-1)).is_err());
        assert!(Accessor::from_json(&json!(1.5)).is_err());
        assert!(Accessor::from_json(&json!({})).is_err());
    }

    #[test]
    fn path_round_trips_through_json() {
        for s in ["[]", "[\"a\"]", "[\"g\",\"h\"]", "[0,\"name\",2]"] {
            let p = path(s);
            assert_eq!(p.to_json().to_string(), s);
            assert_eq!(AccessorPath::parse(&p.to_json().to_string()).unwrap(), p);
        }
    }

    #[test]
    fn path_rejects_non_arrays() {
        assert!(AccessorPath::parse("{}").is_err());
        assert!(AccessorPath::parse("\"a\"").is_err());
        assert!(AccessorPath::parse("[[]]").is_err());
        assert!(AccessorPath::parse("[\"\"]").is_err());
    }

    #[test]
    fn dotted_form() {
        assert_eq!(path("[]").to_attr_path(), "");
        assert_eq!(path("[\"g\",\"h\"]").to_attr_path(), "\"g\".\"h\"");
        assert_eq!(path("[0,\"name\"]").to_attr_path(), "0.\"name\"");
    }

    #[test]
    fn child_extends() {
        let p = path("[\"g\"]").child(&Accessor::Name("h".into()));
        assert_eq!(p, path("[\"g\",\"h\"]"));
        assert_eq!(AccessorPath::root().child(&Accessor::Index(0)), path("[0]"));
    }

    #[test]
    fn walk_resolves_nested_values() {
        let root = Value::from(json!({"g": {"h": [10, 20]}}));
        assert_eq!(
            path("[\"g\",\"h\",1]").walk(&root).unwrap(),
            &Value::Int(20)
        );
        assert_eq!(AccessorPath::root().walk(&root).unwrap(), &root);
    }

    #[test]
    fn walk_reports_missing_and_mistyped_steps() {
        let root = Value::from(json!({"g": {"h": [10]}}));

        let err = path("[\"nope\"]").walk(&root).unwrap_err();
        assert!(err.to_string().contains("attribute 'nope' not found"));

        let err = path("[\"g\",\"h\",5]").walk(&root).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = path("[\"g\",0]").walk(&root).unwrap_err();
        assert!(err.to_string().contains("cannot apply accessor 0"));
    }

    #[test]
    fn walk_surfaces_thrown_intermediates() {
        let root = Value::from(json!({"bad": {"__throw": "boom"}, "deeper": 1}));
        let err = path("[\"bad\",\"x\"]").walk(&root).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}

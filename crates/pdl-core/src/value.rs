//! The runtime value universe, scope, and chat context.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ast::Block;

/// A bound function: parameters, body, and the scope captured at definition time.
#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub params: Vec<(String, Option<crate::ast::Spec>)>,
    pub body: Box<Block>,
    pub closure: Scope,
    pub returns: Option<crate::ast::Spec>,
}

/// A runtime error value, distinct from [`crate::errors::PdlError`]: this is
/// the *value* form an `Error` block or spec-check failure becomes in the
/// document, not the control-flow error carried on a trace node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorValue {
    pub message: String,
}

/// The tagged value universe described by the language: `Null | Bool | Int |
/// Float | String | List | Object | Function | Error`.
///
/// Composite values (`List`, `Object`) are cheap to clone (`Vec`/`Vec<(String,
/// Value)>` of already-`Clone` values) which is what lets scope assignment
/// copy a value into a binding without aliasing it to the source.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    /// Order-preserving: field order matters for faithful document/trace output,
    /// even though `Scope` itself does not care about insertion order.
    Object(IndexMap<String, Value>),
    Function(Box<FunctionValue>),
    Error(ErrorValue),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Function(_) => true,
            Value::Error(_) => true,
        }
    }

    /// The string projection used for context contributions and text-container
    /// concatenation: strings pass through verbatim, everything else renders
    /// through its JSON form.
    pub fn as_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    pub fn object_get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Conversion into `serde_json::Value` for the parts of the system that
    /// need JSON interop (the `json` parser, HTTP bodies, trace materialization
    /// of plain data). `Function` has no JSON representation and degrades to
    /// `null`; this is acceptable because functions never flow through the
    /// Parser Pipeline or the trace's `result` field as anything but an opaque
    /// marker.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            // preserve_order keeps this faithful to the IndexMap's insertion order.
            Value::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
            Value::Function(_) => serde_json::Value::Null,
            Value::Error(e) => serde_json::json!({ "error": e.message }),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
            // `IndexMap<_, _>: FromIterator` preserves the source iteration order.
        }
    }

    /// The type name used in spec-mismatch messages, matching the original's
    /// Python type names so error text stays recognizable.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Object(_) => "dict",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// A scope is a name→value environment. Insertion order is irrelevant to
/// semantics (the interpreter never iterates a scope in a way that is
/// observable to a program), so a plain `HashMap` is the right representation
/// — unlike `Value::Object`, which must preserve order for document fidelity.
pub type Scope = HashMap<String, Value>;

/// The reserved scope key that always holds the current chat context.
pub const CONTEXT_KEY: &str = "context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single entry in the running chat context. `role` is `None` at the top
/// level, before any enclosing `message` block has set one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Option<Role>,
    pub content: String,
}

/// Constructs the initial scope for a fresh evaluation: empty except for the
/// reserved `context` key, seeded with an empty context list. Mirrors the
/// original's behavior of exposing `context` even before any block has
/// contributed to it.
pub fn initial_scope() -> Scope {
    let mut scope = Scope::new();
    scope.insert(CONTEXT_KEY.to_string(), Value::List(Vec::new()));
    scope
}

pub fn context_to_value(context: &[ChatMessage]) -> Value {
    Value::List(
        context
            .iter()
            .map(|m| {
                Value::Object(IndexMap::from([
                    (
                        "role".to_string(),
                        m.role.map(|r| Value::String(r.to_string())).unwrap_or(Value::Null),
                    ),
                    ("content".to_string(), Value::String(m.content.clone())),
                ]))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_rules_match_the_spec() {
        assert!(!Value::Null.truthy());
        assert!(!Value::String(String::new()).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::List(vec![]).truthy());
        assert!(!Value::Object(IndexMap::new()).truthy());
        assert!(Value::Int(1).truthy());
        assert!(Value::String("x".into()).truthy());
    }

    #[test]
    fn initial_scope_carries_an_empty_context() {
        let scope = initial_scope();
        match scope.get(CONTEXT_KEY) {
            Some(Value::List(items)) => assert!(items.is_empty()),
            other => panic!("expected empty list, got {other:?}"),
        }
    }

    #[test]
    fn object_preserves_field_order() {
        let obj = Value::Object(IndexMap::from([
            ("b".to_string(), Value::Int(1)),
            ("a".to_string(), Value::Int(2)),
        ]));
        let json = obj.to_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}

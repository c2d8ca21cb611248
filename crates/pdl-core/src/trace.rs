//! The Trace Builder: a serializable mirror of the `Block` AST, annotated
//! with the dynamic outputs of evaluation (§4.6, I1).
//!
//! `TraceNode` is a fresh structure rather than in-place mutation of the
//! input `Block` — the evaluator never owns or mutates the program tree it
//! was handed, it only reads it and builds a parallel annotated copy.

use serde::{Deserialize, Serialize};

use crate::errors::PdlError;
use crate::value::Value;

/// One node of the trace tree. Its shape mirrors the `Block` it was
/// produced from: `children` holds nested trace nodes in the same
/// structural positions (document/sequence/array/object entries, if/then/
/// else branches, function bodies, call args), and `iterations` holds the
/// per-iteration trace nodes for `repeat`/`repeatUntil`/`for` (P8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    /// The block's `kind` discriminator, carried through verbatim so a
    /// dumper can tell which per-kind fields to expect alongside this node.
    pub kind: String,
    /// The block's `description`, if any, passed through unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The final result value, rendered to its JSON form for a faithful,
    /// serializable mirror (§4.6).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Set when this block or any descendant raised an error (I4);
    /// propagates up to the nearest `fallback` handler or to the root.
    #[serde(default)]
    pub has_error: bool,
    /// Errors raised directly by this block (not its children — those
    /// carry their own `errors` on their own node).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PdlError>,
    /// Nested trace nodes in the same structural positions as the input
    /// block's own nested blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceNode>,
    /// Per-iteration trace nodes for `repeat`/`repeatUntil`/`for` (P8).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<TraceNode>,
}

impl TraceNode {
    pub fn leaf(kind: impl Into<String>) -> TraceNode {
        TraceNode {
            kind: kind.into(),
            description: None,
            result: None,
            has_error: false,
            errors: Vec::new(),
            children: Vec::new(),
            iterations: Vec::new(),
        }
    }

    pub fn with_result(mut self, value: &Value) -> TraceNode {
        self.result = Some(value.to_json());
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> TraceNode {
        self.description = description;
        self
    }

    pub fn with_children(mut self, children: Vec<TraceNode>) -> TraceNode {
        self.has_error = self.has_error || children.iter().any(|c| c.has_error);
        self.children = children;
        self
    }

    pub fn with_iterations(mut self, iterations: Vec<TraceNode>) -> TraceNode {
        self.has_error = self.has_error || iterations.iter().any(|c| c.has_error);
        self.iterations = iterations;
        self
    }

    pub fn push_error(&mut self, error: PdlError) {
        self.has_error = true;
        self.errors.push(error);
    }

    /// Recursively checks whether this node or any descendant carries an
    /// error, independent of whether `has_error` was correctly bubbled —
    /// used by tests the way the original's `contains_error` helper is
    /// used (scenario 2, scenario 8).
    pub fn contains_error(&self) -> bool {
        self.has_error
            || !self.errors.is_empty()
            || self.children.iter().any(TraceNode::contains_error)
            || self.iterations.iter().any(TraceNode::contains_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_starts_error_free() {
        let node = TraceNode::leaf("get");
        assert!(!node.contains_error());
    }

    #[test]
    fn push_error_sets_has_error() {
        let mut node = TraceNode::leaf("get");
        node.push_error(PdlError::UndefinedName {
            location: crate::ast::Location::default(),
            name: "somevar".to_string(),
        });
        assert!(node.has_error);
        assert!(node.contains_error());
    }

    #[test]
    fn child_errors_propagate_to_has_error() {
        let mut child = TraceNode::leaf("get");
        child.push_error(PdlError::UndefinedName {
            location: crate::ast::Location::default(),
            name: "somevar".to_string(),
        });
        let parent = TraceNode::leaf("document").with_children(vec![child]);
        assert!(parent.has_error);
        assert!(parent.contains_error());
    }

    #[test]
    fn iteration_errors_propagate() {
        let mut iter_node = TraceNode::leaf("sequence");
        iter_node.push_error(PdlError::Internal {
            location: crate::ast::Location::default(),
            message: "boom".to_string(),
        });
        let repeat = TraceNode::leaf("repeat").with_iterations(vec![iter_node]);
        assert!(repeat.has_error);
    }
}

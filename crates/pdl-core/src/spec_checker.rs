//! Runtime verification that a [`Value`] conforms to a declared [`Spec`].
//!
//! Structural recursion into lists and objects; unions accept if any branch
//! accepts; `any` accepts unconditionally. Returns every mismatch found
//! (not just the first), matching the original's "Type errors during spec
//! checking" aggregate-message convention (scenario 4).

use crate::ast::{PrimitiveSpec, Spec};
use crate::value::Value;

/// A single spec mismatch: human-readable message of the form "`<value>`
/// should be of type `<spec>`" (§4.3), without location — the caller
/// (`eval`) attaches the block's own location when turning this into a
/// [`crate::errors::PdlError::Type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub message: String,
}

/// Checks `value` against `spec`, returning every mismatch found. An empty
/// vec means the value conforms.
pub fn check(value: &Value, spec: &Spec) -> Vec<Mismatch> {
    match spec {
        Spec::Any(_) => Vec::new(),
        Spec::Primitive(p) => check_primitive(value, *p, spec),
        Spec::ListOf { list_of } => match value {
            Value::List(items) => items.iter().flat_map(|item| check(item, list_of)).collect(),
            _ => vec![mismatch(value, spec)],
        },
        Spec::ObjectOf { object_of } => match value {
            Value::Object(fields) => {
                let mut mismatches = Vec::new();
                for (key, field_spec) in object_of {
                    match fields.get(key) {
                        Some(field_value) => mismatches.extend(check(field_value, field_spec)),
                        None => mismatches.push(Mismatch {
                            message: format!("missing required field '{key}'"),
                        }),
                    }
                }
                mismatches
            }
            _ => vec![mismatch(value, spec)],
        },
        Spec::Union(variants) => {
            if variants.iter().any(|variant| check(value, variant).is_empty()) {
                Vec::new()
            } else {
                vec![mismatch(value, spec)]
            }
        }
    }
}

fn check_primitive(value: &Value, primitive: PrimitiveSpec, spec: &Spec) -> Vec<Mismatch> {
    let matches = match (primitive, value) {
        (PrimitiveSpec::Str, Value::String(_)) => true,
        (PrimitiveSpec::Int, Value::Int(_)) => true,
        // A float spec also accepts an int value, mirroring the original's
        // `isinstance(x, (int, float))`-style numeric tower.
        (PrimitiveSpec::Float, Value::Float(_)) => true,
        (PrimitiveSpec::Float, Value::Int(_)) => true,
        (PrimitiveSpec::Bool, Value::Bool(_)) => true,
        (PrimitiveSpec::Null, Value::Null) => true,
        _ => false,
    };
    if matches {
        Vec::new()
    } else {
        vec![mismatch(value, spec)]
    }
}

fn mismatch(value: &Value, spec: &Spec) -> Mismatch {
    Mismatch {
        message: format!("{} should be of type {}", value.as_text(), spec.describe()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AnyMarker;
    use indexmap::IndexMap;

    #[test]
    fn primitive_int_accepts_int() {
        assert!(check(&Value::Int(5), &Spec::Primitive(PrimitiveSpec::Int)).is_empty());
    }

    #[test]
    fn primitive_int_rejects_string() {
        let mismatches = check(&Value::String("hello".to_string()), &Spec::Primitive(PrimitiveSpec::Int));
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].message, "hello should be of type <class 'int'>");
    }

    #[test]
    fn float_spec_accepts_int_value() {
        assert!(check(&Value::Int(5), &Spec::Primitive(PrimitiveSpec::Float)).is_empty());
    }

    #[test]
    fn list_of_recurses_into_elements() {
        let spec = Spec::ListOf {
            list_of: Box::new(Spec::Primitive(PrimitiveSpec::Int)),
        };
        let value = Value::List(vec![Value::Int(1), Value::String("oops".to_string())]);
        let mismatches = check(&value, &spec);
        assert_eq!(mismatches.len(), 1);
    }

    #[test]
    fn object_of_checks_required_fields() {
        let mut fields = IndexMap::new();
        fields.insert("name".to_string(), Spec::Primitive(PrimitiveSpec::Str));
        let spec = Spec::ObjectOf { object_of: fields };
        let mismatches = check(&Value::Object(IndexMap::new()), &spec);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].message.contains("missing required field"));
    }

    #[test]
    fn union_accepts_if_any_branch_matches() {
        let spec = Spec::Union(vec![
            Spec::Primitive(PrimitiveSpec::Str),
            Spec::Primitive(PrimitiveSpec::Int),
        ]);
        assert!(check(&Value::Int(5), &spec).is_empty());
        assert!(check(&Value::String("x".to_string()), &spec).is_empty());
        assert!(!check(&Value::Bool(true), &spec).is_empty());
    }

    #[test]
    fn any_accepts_unconditionally() {
        assert!(check(&Value::Null, &Spec::Any(AnyMarker::Any)).is_empty());
        assert!(check(&Value::Int(1), &Spec::Any(AnyMarker::Any)).is_empty());
    }

    /// P6: running the checker twice on the same (value, spec) gives the
    /// same verdict.
    #[test]
    fn spec_checking_is_idempotent() {
        let value = Value::String("hello".to_string());
        let spec = Spec::Primitive(PrimitiveSpec::Int);
        assert_eq!(check(&value, &spec), check(&value, &spec));
    }
}

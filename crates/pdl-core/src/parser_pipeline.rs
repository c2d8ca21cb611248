//! Post-processes a stringly block result through the parser named in the
//! block's `parser` field: `json`, `yaml`, a `RegexParser`, or nested PDL.
//!
//! The nested-PDL case (`PdlParser{pdl}`) hands the captured text to the
//! Block Evaluator as a sub-program, so it cannot live in this module
//! without an import cycle; [`crate::eval`] matches `Parser::Pdl` itself,
//! before falling back to [`run`] for the three cases handled here.

use regex::Regex;

use crate::ast::{Location, Parser, RegexMode};
use crate::errors::PdlError;
use crate::value::Value;

/// Runs `json`, `yaml`, or `RegexParser` against `text`. Calling this with
/// `Parser::Pdl` is a programmer error in this crate — see the module
/// doc comment — and returns an `Internal` error rather than panicking,
/// since `eval` is the only caller and a defensive `Result` costs nothing.
pub fn run(parser: &Parser, text: &str, location: &Location) -> Result<Value, PdlError> {
    match parser {
        Parser::Json(_) => serde_json::from_str::<serde_json::Value>(text)
            .map(Value::from_json)
            .map_err(|e| PdlError::Parser {
                location: location.clone(),
                message: format!("invalid json: {e}"),
            }),
        Parser::Yaml(_) => serde_yaml::from_str::<serde_yaml::Value>(text)
            .map(yaml_to_value)
            .map_err(|e| PdlError::Parser {
                location: location.clone(),
                message: format!("invalid yaml: {e}"),
            }),
        Parser::Regex(regex_parser) => run_regex(regex_parser, text, location),
        Parser::Pdl { .. } => Err(PdlError::Internal {
            location: location.clone(),
            message: "nested PDL parsing must be dispatched by the evaluator".to_string(),
        }),
    }
}

fn run_regex(
    regex_parser: &crate::ast::RegexParser,
    text: &str,
    location: &Location,
) -> Result<Value, PdlError> {
    let re = Regex::new(&regex_parser.pattern).map_err(|e| PdlError::Parser {
        location: location.clone(),
        message: format!("invalid regex '{}': {e}", regex_parser.pattern),
    })?;

    let value = match regex_parser.mode {
        RegexMode::Findall => Value::List(
            re.find_iter(text)
                .map(|m| Value::String(m.as_str().to_string()))
                .collect(),
        ),
        RegexMode::Search => match re.find(text) {
            Some(m) => Value::String(m.as_str().to_string()),
            None => {
                return Err(PdlError::Parser {
                    location: location.clone(),
                    message: format!("pattern '{}' did not match", regex_parser.pattern),
                })
            }
        },
        RegexMode::Match => match re.find(text) {
            Some(m) if m.start() == 0 => Value::String(m.as_str().to_string()),
            _ => {
                return Err(PdlError::Parser {
                    location: location.clone(),
                    message: format!("pattern '{}' did not match at the start", regex_parser.pattern),
                })
            }
        },
    };

    if let Some(spec) = &regex_parser.spec {
        let mismatches = crate::spec_checker::check(&value, spec);
        if !mismatches.is_empty() {
            return Err(PdlError::Type {
                location: location.clone(),
                message: mismatches
                    .into_iter()
                    .map(|m| m.message)
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }
    }

    Ok(value)
}

fn yaml_to_value(yaml: serde_yaml::Value) -> Value {
    // Round-trip through serde_json rather than hand-writing a second
    // structural conversion: yaml's data model is a superset but every
    // value a parsed document actually produces here is JSON-representable.
    let json = serde_json::to_value(yaml).unwrap_or(serde_json::Value::Null);
    Value::from_json(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::JsonMarker;

    fn loc() -> Location {
        Location {
            path: vec![],
            file: "prog.pdl".to_string(),
            table: Default::default(),
        }
    }

    #[test]
    fn json_parser_parses_an_object() {
        let value = run(&Parser::Json(JsonMarker::Json), r#"{"a": 1}"#, &loc()).unwrap();
        assert_eq!(value.object_get("a").unwrap().as_text(), "1");
    }

    #[test]
    fn json_parser_reports_a_parse_error_with_location() {
        let err = run(&Parser::Json(JsonMarker::Json), "{not json", &loc()).unwrap_err();
        assert!(matches!(err, PdlError::Parser { .. }));
    }

    #[test]
    fn regex_findall_collects_all_matches() {
        let regex_parser = crate::ast::RegexParser {
            pattern: r"\d+".to_string(),
            mode: RegexMode::Findall,
            spec: None,
        };
        let value = run(&Parser::Regex(regex_parser), "a1 b22 c333", &loc()).unwrap();
        match value {
            Value::List(items) => assert_eq!(items.len(), 3),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn regex_match_requires_anchoring_at_start() {
        let regex_parser = crate::ast::RegexParser {
            pattern: r"\d+".to_string(),
            mode: RegexMode::Match,
            spec: None,
        };
        assert!(run(&Parser::Regex(regex_parser.clone()), "42abc", &loc()).is_ok());
        assert!(run(&Parser::Regex(regex_parser), "abc42", &loc()).is_err());
    }
}

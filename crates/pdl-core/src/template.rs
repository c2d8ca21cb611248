//! The `{{ expr }}` expression engine.
//!
//! A small hand-rolled recursive-descent parser and evaluator over scope
//! lookups, dotted/indexed access, comparisons, and boolean connectives.
//! Deliberately not delegated to a general-purpose templating crate (handlebars,
//! tera, minijinja): the surface is narrow and the undefined-variable recovery
//! rule (leave the original `{{ … }}` text in place, record the error, keep
//! going) is not something those engines expose as a first-class mode.

use crate::ast::Location;
use crate::errors::PdlError;
use crate::value::{Scope, Value};

/// The result of expanding a string through the Template Engine: the
/// expanded text, plus any errors encountered at individual `{{ … }}` sites.
/// Per §4.2, a template error never aborts the enclosing block — it is
/// recorded here and the original `{{ … }}` text is retained in `text`.
pub struct Expansion {
    pub text: String,
    pub errors: Vec<PdlError>,
}

/// Expands every `{{ expr }}` occurrence in `source` against `scope`,
/// concatenating literal spans with the string projection of each
/// expression's value. An expression that fails to evaluate leaves its
/// original `{{ … }}` span untouched and pushes an error.
pub fn expand(source: &str, scope: &Scope, location: &Location) -> Expansion {
    let mut text = String::with_capacity(source.len());
    let mut errors = Vec::new();
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        text.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let expr_src = &after_open[..end];
                match eval_str(expr_src, scope, location) {
                    Ok(value) => text.push_str(&value.as_text()),
                    Err(err) => {
                        // Recovery: keep the literal `{{ expr }}` span.
                        text.push_str("{{");
                        text.push_str(expr_src);
                        text.push_str("}}");
                        errors.push(err);
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                // Unterminated `{{`: no expression to evaluate, keep verbatim.
                text.push_str("{{");
                rest = after_open;
            }
        }
    }
    text.push_str(rest);

    Expansion { text, errors }
}

/// Evaluates a single expression string (without the surrounding `{{ }}`)
/// against `scope`, for use by `if`/`until` conditions (§4.2 boolean-mode).
pub fn eval_str(expr: &str, scope: &Scope, location: &Location) -> Result<Value, PdlError> {
    let tokens = tokenize(expr);
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
        location,
    };
    let value = parser.parse_or()?;
    parser.expect_end()?;
    Ok(value)
}

/// Evaluates `expr` in boolean mode: parses and evaluates as usual, then
/// applies the truthiness rule (§4.2) to coerce to a `bool`.
pub fn eval_bool(expr: &str, scope: &Scope, location: &Location) -> Result<bool, PdlError> {
    Ok(eval_str(expr, scope, location)?.truthy())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(src: &str) -> Vec<Token> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                i += 1; // closing quote
                tokens.push(Token::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                let mut saw_dot = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !saw_dot)) {
                    if chars[i] == '.' {
                        saw_dot = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if saw_dot {
                    tokens.push(Token::Float(text.parse().unwrap_or(0.0)));
                } else {
                    tokens.push(Token::Int(text.parse().unwrap_or(0)));
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "true" | "True" => tokens.push(Token::Ident("true".to_string())),
                    "false" | "False" => tokens.push(Token::Ident("false".to_string())),
                    "null" | "None" => tokens.push(Token::Ident("null".to_string())),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                // Unrecognized character: skip. A genuinely malformed
                // expression surfaces as an undefined-name error downstream
                // rather than a dedicated syntax-error variant, matching
                // the taxonomy's narrow surface (§7).
                i += 1;
            }
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Scope,
    location: &'a Location,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn expect_end(&self) -> Result<(), PdlError> {
        if self.pos < self.tokens.len() {
            return Err(PdlError::Internal {
                location: self.location.clone(),
                message: "trailing tokens in template expression".to_string(),
            });
        }
        Ok(())
    }

    // or := and ( 'or' and )*
    fn parse_or(&mut self) -> Result<Value, PdlError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Value::Bool(left.truthy() || right.truthy());
        }
        Ok(left)
    }

    // and := not ( 'and' not )*
    fn parse_and(&mut self) -> Result<Value, PdlError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = Value::Bool(left.truthy() && right.truthy());
        }
        Ok(left)
    }

    // not := 'not' not | comparison
    fn parse_not(&mut self) -> Result<Value, PdlError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let value = self.parse_not()?;
            return Ok(Value::Bool(!value.truthy()));
        }
        self.parse_comparison()
    }

    // comparison := postfix ( ('==' | '!=' | '<' | '<=' | '>' | '>=') postfix )?
    fn parse_comparison(&mut self) -> Result<Value, PdlError> {
        let left = self.parse_postfix()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Le) => Some(Token::Le),
            Some(Token::Gt) => Some(Token::Gt),
            Some(Token::Ge) => Some(Token::Ge),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        self.advance();
        let right = self.parse_postfix()?;
        Ok(Value::Bool(compare(&op, &left, &right)))
    }

    // postfix := primary ( '.' ident | '[' or ']' | '(' args ')' )*
    fn parse_postfix(&mut self) -> Result<Value, PdlError> {
        let mut value = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name.clone(),
                        _ => {
                            return Err(PdlError::Internal {
                                location: self.location.clone(),
                                message: "expected attribute name after '.'".to_string(),
                            })
                        }
                    };
                    value = match value.object_get(&name) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(PdlError::UndefinedName {
                                location: self.location.clone(),
                                name,
                            })
                        }
                    };
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_or()?;
                    if !matches!(self.peek(), Some(Token::RBracket)) {
                        return Err(PdlError::Internal {
                            location: self.location.clone(),
                            message: "expected ']'".to_string(),
                        });
                    }
                    self.advance();
                    value = index_value(&value, &index, self.location)?;
                }
                Some(Token::LParen) => {
                    // Small built-in function surface: the callee is the
                    // identifier already parsed into `value`'s originating
                    // name is unrecoverable here by design (we only kept the
                    // value, not the name), so built-ins are applied by name
                    // at the primary level instead; reaching here with a
                    // non-callable value is a no-op call surface we don't
                    // support — stop consuming.
                    break;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // primary := ident | ident '(' args ')' | int | float | string | '(' or ')'
    fn parse_primary(&mut self) -> Result<Value, PdlError> {
        match self.advance().cloned() {
            Some(Token::Ident(name)) => {
                if name == "true" {
                    return Ok(Value::Bool(true));
                }
                if name == "false" {
                    return Ok(Value::Bool(false));
                }
                if name == "null" {
                    return Ok(Value::Null);
                }
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_or()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            args.push(self.parse_or()?);
                        }
                    }
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        return Err(PdlError::Internal {
                            location: self.location.clone(),
                            message: "expected ')'".to_string(),
                        });
                    }
                    self.advance();
                    return call_builtin(&name, &args, self.location);
                }
                self.scope.get(&name).cloned().ok_or_else(|| PdlError::UndefinedName {
                    location: self.location.clone(),
                    name,
                })
            }
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                if !matches!(self.peek(), Some(Token::RParen)) {
                    return Err(PdlError::Internal {
                        location: self.location.clone(),
                        message: "expected ')'".to_string(),
                    });
                }
                self.advance();
                Ok(value)
            }
            other => Err(PdlError::Internal {
                location: self.location.clone(),
                message: format!("unexpected token in template expression: {other:?}"),
            }),
        }
    }
}

fn index_value(value: &Value, index: &Value, location: &Location) -> Result<Value, PdlError> {
    match (value, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = if *i < 0 { items.len() as i64 + i } else { *i };
            items
                .get(idx.max(0) as usize)
                .cloned()
                .ok_or_else(|| PdlError::Internal {
                    location: location.clone(),
                    message: format!("index {i} out of range"),
                })
        }
        (Value::Object(fields), Value::String(key)) => {
            fields.get(key).cloned().ok_or_else(|| PdlError::UndefinedName {
                location: location.clone(),
                name: key.clone(),
            })
        }
        (Value::String(s), Value::Int(i)) => {
            let idx = if *i < 0 { s.chars().count() as i64 + i } else { *i };
            s.chars()
                .nth(idx.max(0) as usize)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| PdlError::Internal {
                    location: location.clone(),
                    message: format!("index {i} out of range"),
                })
        }
        _ => Err(PdlError::Internal {
            location: location.clone(),
            message: "value is not indexable".to_string(),
        }),
    }
}

/// A narrow built-in function surface — function application over a small,
/// fixed set of names. `len` covers the list/string length checks `if`/`until`
/// conditions need; more can be added here without touching the grammar.
fn call_builtin(name: &str, args: &[Value], location: &Location) -> Result<Value, PdlError> {
    match name {
        "len" => match args.first() {
            Some(Value::List(items)) => Ok(Value::Int(items.len() as i64)),
            Some(Value::String(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(Value::Object(fields)) => Ok(Value::Int(fields.len() as i64)),
            _ => Err(PdlError::Internal {
                location: location.clone(),
                message: "len() expects a list, string, or object".to_string(),
            }),
        },
        _ => Err(PdlError::UndefinedName {
            location: location.clone(),
            name: name.to_string(),
        }),
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => compare_ord(op, a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => compare_partial(op, a.partial_cmp(b)),
        (Value::Int(a), Value::Float(b)) => compare_partial(op, (*a as f64).partial_cmp(b)),
        (Value::Float(a), Value::Int(b)) => compare_partial(op, a.partial_cmp(&(*b as f64))),
        (Value::String(a), Value::String(b)) => compare_ord(op, a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => compare_eq(op, a == b),
        (Value::Null, Value::Null) => compare_eq(op, true),
        _ => compare_eq(op, false),
    }
}

fn compare_ord(op: &Token, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        Token::Eq => ord == Equal,
        Token::Ne => ord != Equal,
        Token::Lt => ord == Less,
        Token::Le => ord != Greater,
        Token::Gt => ord == Greater,
        Token::Ge => ord != Less,
        _ => false,
    }
}

fn compare_partial(op: &Token, ord: Option<std::cmp::Ordering>) -> bool {
    match ord {
        Some(ord) => compare_ord(op, ord),
        None => matches!(op, Token::Ne),
    }
}

fn compare_eq(op: &Token, eq: bool) -> bool {
    match op {
        Token::Eq => eq,
        Token::Ne => !eq,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn loc() -> Location {
        Location {
            path: vec![],
            file: "prog.pdl".to_string(),
            table: Default::default(),
        }
    }

    fn scope_with(pairs: Vec<(&str, Value)>) -> Scope {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn expands_a_plain_variable() {
        let scope = scope_with(vec![("NAME", Value::String("World".to_string()))]);
        let out = expand("Hello, {{ NAME }}!", &scope, &loc());
        assert_eq!(out.text, "Hello, World!");
        assert!(out.errors.is_empty());
    }

    #[test]
    fn undefined_variable_keeps_the_literal_span() {
        let scope = Scope::new();
        let out = expand("Hi {{ somevar }}", &scope, &loc());
        assert_eq!(out.text, "Hi {{ somevar }}");
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], PdlError::UndefinedName { .. }));
    }

    #[test]
    fn attribute_access() {
        let mut obj = IndexMap::new();
        obj.insert("name".to_string(), Value::String("Ada".to_string()));
        let scope = scope_with(vec![("person", Value::Object(obj))]);
        let out = expand("{{ person.name }}", &scope, &loc());
        assert_eq!(out.text, "Ada");
    }

    #[test]
    fn index_access_on_a_list() {
        let scope = scope_with(vec![("items", Value::List(vec![Value::Int(1), Value::Int(2)]))]);
        let out = expand("{{ items[1] }}", &scope, &loc());
        assert_eq!(out.text, "2");
    }

    #[test]
    fn boolean_truthiness_coercion() {
        let scope = scope_with(vec![("x", Value::Int(0))]);
        assert!(!eval_bool("x", &scope, &loc()).unwrap());
        let scope = scope_with(vec![("x", Value::Int(1))]);
        assert!(eval_bool("x", &scope, &loc()).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let scope = Scope::new();
        assert!(eval_bool("1 < 2", &scope, &loc()).unwrap());
        assert!(eval_bool("2 == 2", &scope, &loc()).unwrap());
        assert!(!eval_bool("2 != 2", &scope, &loc()).unwrap());
    }

    #[test]
    fn and_or_not_connectives() {
        let scope = scope_with(vec![("a", Value::Bool(true)), ("b", Value::Bool(false))]);
        assert!(eval_bool("a and not b", &scope, &loc()).unwrap());
        assert!(eval_bool("a or b", &scope, &loc()).unwrap());
        assert!(!eval_bool("a and b", &scope, &loc()).unwrap());
    }

    #[test]
    fn len_builtin() {
        let scope = scope_with(vec![("items", Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))]);
        let out = expand("{{ len(items) }}", &scope, &loc());
        assert_eq!(out.text, "3");
    }

    #[test]
    fn multiple_expressions_in_one_string() {
        let scope = scope_with(vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
        let out = expand("{{ a }} and {{ b }}", &scope, &loc());
        assert_eq!(out.text, "1 and 2");
    }
}

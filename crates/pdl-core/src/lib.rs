//! pdl-core: interpreter kernel for the Prompt Description Language.
//!
//! This crate contains no CLI, no schema validator, and no trace dumper —
//! those are external collaborators. It owns the block evaluator and
//! everything it needs to run a validated program to a document.
//!
//! # Crate Organization
//!
//! - `errors` — Error taxonomy (PdlError, ProviderError)
//! - `value` — Tagged Value universe, Scope, ChatMessage, Role
//! - `ast` — Block AST, Location, Spec schema, Parser union
//! - `template` — `{{ expr }}` expression engine
//! - `spec_checker` — Runtime Value-against-Spec verification
//! - `parser_pipeline` — json/yaml/regex/pdl post-parsers
//! - `providers` — Provider traits and the ProviderRegistry
//! - `cancellation` — CancellationToken state machine
//! - `config` — Environment-derived provider credentials and defaults
//! - `trace` — TraceNode mirror of the AST
//! - `eval` — The block evaluator itself
//! - `loader` — Parses `.pdl` YAML into a located Block tree
//! - `testing` — Concrete fake providers for tests

pub mod ast;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod eval;
pub mod loader;
pub mod parser_pipeline;
pub mod providers;
pub mod spec_checker;
pub mod template;
pub mod trace;
pub mod value;

pub mod testing;

pub use ast::Block;
pub use errors::PdlError;
pub use eval::{eval, EvalState};
pub use loader::{load_program_file, load_program_str, LoaderError};
pub use trace::TraceNode;
pub use value::{ChatMessage, Role, Scope, Value};

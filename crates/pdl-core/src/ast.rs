//! The Block AST: the validated tree the evaluator consumes.
//!
//! Construction of this tree from YAML/JSON plus schema validation against
//! the block grammar are both external collaborators (the Program Loader
//! and, further upstream, a validator this crate does not implement). What
//! lives here is purely the shape the evaluator walks.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A block on disk is either a bare string (a literal-text shorthand) or a
/// mapping whose kind is determined by which field is present (§6) — there
/// is no `kind` discriminator key. `untagged` tries the string form first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Block {
    Literal(String),
    Full(Box<FullBlock>),
}

impl Block {
    pub fn literal(text: impl Into<String>) -> Block {
        Block::Literal(text.into())
    }

    pub fn meta(&self) -> Option<&BlockMeta> {
        match self {
            Block::Literal(_) => None,
            Block::Full(b) => Some(&b.meta),
        }
    }
}

/// A non-literal block: shared metadata flattened alongside the per-kind
/// payload, which is itself flattened so the on-disk shape is one flat
/// mapping — the reader tells kinds apart by which per-kind field shows up,
/// the same way `examples/original_source/pdl/pdl_ast.py`'s plain (not
/// discriminated) `BlockType` union does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullBlock {
    #[serde(flatten)]
    pub meta: BlockMeta,
    #[serde(flatten)]
    pub kind: BlockKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Spec>,
    /// Evaluated in declaration order before the block's body; later entries
    /// may reference earlier ones (P4), never the other way around.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub defs: IndexMap<String, Block>,
    /// On-disk key is `def`, not `assign` — matches the original schema.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "def")]
    pub assign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribute: Option<Vec<ContributeTarget>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<Parser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<Block>>,
    /// Populated by the Program Loader, not present in a program file itself.
    #[serde(skip)]
    pub location: Option<Location>,
}

impl BlockMeta {
    /// Contribution defaults to both RESULT and CONTEXT when unset.
    pub fn contribute_targets(&self) -> &[ContributeTarget] {
        match &self.contribute {
            Some(targets) => targets,
            None => &[ContributeTarget::Result, ContributeTarget::Context],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContributeTarget {
    Result,
    Context,
}

/// Every block kind and its own (non-shared) fields. §6's schema has no
/// `kind` discriminator key on disk; a block's kind is read off of which
/// field is present, same as `ModelBlock.model`/`GetBlock.get`/`SequenceBlock.prompts`
/// discriminate the original's plain `BlockType` union
/// (`examples/original_source/pdl/pdl_ast.py:85-142`). `untagged`
/// deserialization tries variants in the order written below and commits to
/// the first one whose required fields are all present, so that order is
/// load-bearing in two places:
///
/// - `Model` is listed before `Data` — a model block's opaque pass-through
///   `data` flag (open question (a)) shares its on-disk key with the `data`
///   block kind, so `Model`'s own required `model` field must get first
///   crack at matching or a `{model: ..., data: true}` block would be
///   misread as a bare `data` literal.
/// - `Read` is listed last — every one of its fields is optional (`read`,
///   `message`, `multiline` all default), so it is the most permissive
///   variant and must be the fallback of last resort, exactly where
///   `examples/original_source/pdl/pdl_ast.py:129-141` places the equally
///   permissive `InputBlock` in its own union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockKind {
    Document { document: Vec<Block> },
    Sequence { sequence: Vec<Block> },
    Array { array: Vec<Block> },
    Object { object: ObjectFields },
    Model {
        model: Box<Block>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Box<Block>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mock_response: Option<String>,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        parameters: IndexMap<String, DataLiteral>,
        /// Opaque pass-through flag; see open question (a). Never interpreted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<bool>,
    },
    Data {
        data: DataLiteral,
        /// Defaults to `false`: by default, strings anywhere inside `data`
        /// are template-expanded. Only emitted on dump when `true`.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        raw: bool,
    },
    Get { get: String },
    If {
        #[serde(rename = "if")]
        condition: String,
        then: Box<Block>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "else")]
        else_: Option<Box<Block>>,
    },
    Repeat {
        repeat: Box<Block>,
        num_iterations: usize,
        #[serde(default, rename = "as")]
        iteration_type: IterationType,
    },
    RepeatUntil {
        repeat: Box<Block>,
        until: String,
        #[serde(default, rename = "as")]
        iteration_type: IterationType,
    },
    For {
        #[serde(rename = "for")]
        fors: IndexMap<String, Block>,
        repeat: Box<Block>,
        #[serde(default, rename = "as")]
        iteration_type: IterationType,
    },
    Function {
        function: IndexMap<String, Option<Spec>>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "return")]
        returns: Option<Spec>,
        body: Box<Block>,
    },
    Call {
        call: String,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        args: IndexMap<String, Block>,
    },
    Code {
        lan: String,
        code: Box<Block>,
    },
    Api {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api: Option<String>,
        url: String,
        input: Box<Block>,
    },
    Include { include: String },
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<crate::value::Role>,
        content: Box<Block>,
    },
    Read {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        multiline: bool,
    },
}

/// `repeat`/`repeatUntil`/`for` aggregation mode, named `as` on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IterationType {
    #[default]
    Text,
    Array,
    LastOf,
}

/// Either a field→block mapping, or a sequence of explicit key/value
/// entries — both forms appear in real programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectFields {
    Mapping(IndexMap<String, Block>),
    Entries(Vec<ObjectEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub value: Block,
}

/// The literal payload of a `data` block: structurally identical to `Value`
/// minus `Function`/`Error`, since those can never appear as program source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataLiteral {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<DataLiteral>),
    Object(IndexMap<String, DataLiteral>),
}

impl DataLiteral {
    /// `raw=true` conversion: verbatim, no template expansion.
    pub fn to_value(&self) -> crate::value::Value {
        use crate::value::Value;
        match self {
            DataLiteral::Null => Value::Null,
            DataLiteral::Bool(b) => Value::Bool(*b),
            DataLiteral::Int(i) => Value::Int(*i),
            DataLiteral::Float(f) => Value::Float(*f),
            DataLiteral::String(s) => Value::String(s.clone()),
            DataLiteral::List(items) => Value::List(items.iter().map(DataLiteral::to_value).collect()),
            DataLiteral::Object(fields) => {
                Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_value())).collect())
            }
        }
    }
}

/// A structural type used by `spec` fields and function parameter/return
/// declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Spec {
    Primitive(PrimitiveSpec),
    ListOf {
        #[serde(rename = "listOf")]
        list_of: Box<Spec>,
    },
    ObjectOf {
        #[serde(rename = "objectOf")]
        object_of: IndexMap<String, Spec>,
    },
    Union(Vec<Spec>),
    Any(AnyMarker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveSpec {
    Str,
    Int,
    Float,
    Bool,
    Null,
}

/// A one-variant marker type so `Spec::Any` can round-trip the literal string
/// `"any"` through `untagged` deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnyMarker {
    #[serde(rename = "any")]
    Any,
}

impl Spec {
    pub fn describe(&self) -> String {
        match self {
            Spec::Primitive(p) => match p {
                PrimitiveSpec::Str => "<class 'str'>".to_string(),
                PrimitiveSpec::Int => "<class 'int'>".to_string(),
                PrimitiveSpec::Float => "<class 'float'>".to_string(),
                PrimitiveSpec::Bool => "<class 'bool'>".to_string(),
                PrimitiveSpec::Null => "<class 'NoneType'>".to_string(),
            },
            Spec::ListOf { list_of } => format!("list[{}]", list_of.describe()),
            Spec::ObjectOf { .. } => "dict".to_string(),
            Spec::Union(variants) => variants.iter().map(Spec::describe).collect::<Vec<_>>().join(" | "),
            Spec::Any(_) => "any".to_string(),
        }
    }
}

/// Source location, attached by the Program Loader when it can derive line
/// numbers from the YAML deserializer; `table` maps JSON-pointer-like paths
/// to line numbers for diagnostics on nested fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    pub path: Vec<String>,
    pub file: String,
    #[serde(default)]
    pub table: std::collections::HashMap<String, u32>,
}

impl Location {
    pub fn line(&self) -> u32 {
        self.table.get(&self.path.join("/")).copied().unwrap_or(0)
    }

    pub fn format(&self, message: &str) -> String {
        format!("{}:{} - {}", self.file, self.line(), message)
    }
}

/// A tagged union of post-processors applied to a stringly block result when
/// `parser` is declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parser {
    Json(JsonMarker),
    Yaml(YamlMarker),
    Regex(RegexParser),
    Pdl { pdl: Box<Block> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsonMarker {
    #[serde(rename = "json")]
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum YamlMarker {
    #[serde(rename = "yaml")]
    Yaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexParser {
    pub pattern: String,
    pub mode: RegexMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Spec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegexMode {
    Findall,
    Match,
    Search,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_string_round_trips() {
        let block: Block = serde_yaml::from_str("\"hello {{ name }}\"").unwrap();
        matches!(block, Block::Literal(s) if s == "hello {{ name }}");
    }

    #[test]
    fn get_block_deserializes_from_presence_of_the_get_field() {
        let yaml = "get: somevar\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        match block {
            Block::Full(b) => match b.kind {
                BlockKind::Get { get } => assert_eq!(get, "somevar"),
                other => panic!("unexpected kind: {other:?}"),
            },
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn repeat_until_is_told_apart_from_repeat_by_the_until_field() {
        let yaml = "repeat: \"x\"\nuntil: \"false\"\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            block,
            Block::Full(b) if matches!(b.kind, BlockKind::RepeatUntil { .. })
        ));
    }

    #[test]
    fn repeat_is_told_apart_from_repeat_until_by_num_iterations() {
        let yaml = "repeat: \"x\"\nnum_iterations: 3\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            block,
            Block::Full(b) if matches!(b.kind, BlockKind::Repeat { num_iterations: 3, .. })
        ));
    }

    #[test]
    fn for_is_told_apart_from_repeat_by_the_for_field() {
        let yaml = "for:\n  x: [1, 2]\nrepeat: \"x\"\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            block,
            Block::Full(b) if matches!(b.kind, BlockKind::For { .. })
        ));
    }

    /// A model block's opaque `data` flag (open question (a)) must not be
    /// mistaken for a `data:` literal block — `model` is required to match
    /// first.
    #[test]
    fn model_with_data_flag_is_not_mistaken_for_a_data_block() {
        let yaml = "model: openai/gpt-4\ndata: true\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        match block {
            Block::Full(b) => match b.kind {
                BlockKind::Model { data: Some(true), .. } => {}
                other => panic!("expected a model block with data=true, got {other:?}"),
            },
            other => panic!("unexpected block: {other:?}"),
        }
    }

    /// A bare `data:` block (no `model` key) must still parse as `Data`.
    #[test]
    fn plain_data_block_still_deserializes() {
        let yaml = "data: 42\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            block,
            Block::Full(b) if matches!(b.kind, BlockKind::Data { data: DataLiteral::Int(42), .. })
        ));
    }

    #[test]
    fn read_block_with_no_fields_at_all_still_parses() {
        let yaml = "description: prompt for input\n";
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            block,
            Block::Full(b) if matches!(b.kind, BlockKind::Read { .. })
        ));
    }

    #[test]
    fn location_formats_as_file_colon_line_dash_message() {
        let mut table = std::collections::HashMap::new();
        table.insert("root".to_string(), 7);
        let loc = Location {
            path: vec!["root".to_string()],
            file: "prog.pdl".to_string(),
            table,
        };
        assert_eq!(loc.format("somevar is undefined"), "prog.pdl:7 - somevar is undefined");
    }

    #[test]
    fn spec_describe_matches_python_type_repr() {
        assert_eq!(Spec::Primitive(PrimitiveSpec::Int).describe(), "<class 'int'>");
    }
}

//! The Block Evaluator: the recursive tree-walking interpreter at the
//! center of the crate. Dispatches on `BlockKind`, orchestrating the
//! Template Engine, Spec Checker, Parser Pipeline, and Provider Registry,
//! and building a [`TraceNode`] mirror of the input tree as it goes.
//!
//! Recursion is via `Box::pin` rather than the `async_recursion` crate —
//! every recursive call site wraps its callee in an explicit boxed future,
//! which keeps the actual state machine finite without macro help.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::{
    Block, BlockKind, ContributeTarget, DataLiteral, IterationType, Location, ObjectFields,
    Parser as AstParser,
};
use crate::cancellation::CancellationToken;
use crate::config;
use crate::errors::{PdlError, ProviderError};
use crate::parser_pipeline;
use crate::providers::{ProviderRegistry, SamplingParams};
use crate::spec_checker;
use crate::template;
use crate::trace::TraceNode;
use crate::value::{ChatMessage, FunctionValue, Role, Scope, Value};

const DEFAULT_BOTH: &[ContributeTarget] = &[ContributeTarget::Result, ContributeTarget::Context];
const DEFAULT_RESULT_ONLY: &[ContributeTarget] = &[ContributeTarget::Result];

/// Interpreter-wide state threaded through every recursive call: the
/// Provider Registry and the cooperative cancellation token (§5, §9 —
/// "the only process-wide state"). Cheap to clone: both fields are
/// `Arc`/`Arc`-backed.
#[derive(Clone)]
pub struct EvalState {
    pub providers: Arc<ProviderRegistry>,
    pub cancellation: CancellationToken,
}

impl EvalState {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        EvalState {
            providers,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(providers: Arc<ProviderRegistry>, cancellation: CancellationToken) -> Self {
        EvalState { providers, cancellation }
    }
}

/// The quadruple every block evaluation produces (§4.1): result, updated
/// context, updated scope, and the trace node mirroring this block.
pub struct EvalOutcome {
    pub result: Value,
    pub context: Vec<ChatMessage>,
    pub scope: Scope,
    pub trace: TraceNode,
}

/// Public entry point: evaluates `block` against `scope`/`context` from a
/// fresh top-level call (no enclosing message role, default contribution
/// of both RESULT and CONTEXT).
pub async fn eval(block: &Block, scope: Scope, context: Vec<ChatMessage>, state: &EvalState) -> EvalOutcome {
    eval_inner(
        block,
        scope,
        context,
        state.clone(),
        None,
        DEFAULT_BOTH,
        Location::default(),
    )
    .await
}

/// The targets this block contributes on, factoring in the structural
/// override `Function` (contributes neither RESULT nor CONTEXT — its value
/// only reaches the world via `def`/`assign`).
fn effective_contribute(block: &Block, default: &'static [ContributeTarget]) -> Vec<ContributeTarget> {
    match block {
        Block::Literal(_) => default.to_vec(),
        Block::Full(b) => match &b.kind {
            BlockKind::Function { .. } => Vec::new(),
            _ => b.meta.contribute.clone().unwrap_or_else(|| default.to_vec()),
        },
    }
}

/// Kinds that append their own `result` to `context` directly (mirrors
/// `examples/original_source/pdl/pdl_interpreter.py`'s model/code/api/
/// `ValueBlock` cases, which do `context += [result]`). Every other kind is
/// a container whose children already appended their own contributions
/// while the container's body was evaluated — re-appending the container's
/// aggregated result on top would double-count the conversation (the
/// container case at `pdl_interpreter.py:68-69`, `PromptsBlock`, never
/// appends itself). `Get` is a scope lookup, not generated content, so it
/// does not append on its own — its result only reaches context when an
/// enclosing block (document, message, …) folds it in. `Message` is the one
/// container-shaped exception: it deliberately collapses its body into a
/// single message (see `eval_body`'s `Message` arm), so it still appends
/// once here, under its own role rather than the kind-default role.
fn contributes_context_directly(kind: &BlockKind) -> bool {
    matches!(
        kind,
        BlockKind::Data { .. }
            | BlockKind::Model { .. }
            | BlockKind::Code { .. }
            | BlockKind::Api { .. }
            | BlockKind::Read { .. }
            | BlockKind::Message { .. }
    )
}

fn block_location(block: &Block, parent: &Location) -> Location {
    match block {
        Block::Full(b) => b.meta.location.clone().unwrap_or_else(|| parent.clone()),
        Block::Literal(_) => parent.clone(),
    }
}

fn eval_inner<'a>(
    block: &'a Block,
    mut scope: Scope,
    context: Vec<ChatMessage>,
    state: EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    parent_location: Location,
) -> Pin<Box<dyn Future<Output = EvalOutcome> + Send + 'a>> {
    Box::pin(async move {
        let location = block_location(block, &parent_location);

        // I2: `context` in scope and the context accumulator must agree at
        // every block boundary, so any `get`/template lookup of `context`
        // sees the running conversation, not the stale value from scope
        // creation.
        scope.insert(
            crate::value::CONTEXT_KEY.to_string(),
            crate::value::context_to_value(&context),
        );

        if state.cancellation.is_cancelled() {
            let mut trace = TraceNode::leaf("cancelled");
            trace.push_error(PdlError::Internal {
                location: location.clone(),
                message: "evaluation cancelled".to_string(),
            });
            return EvalOutcome {
                result: Value::Null,
                context,
                scope,
                trace,
            };
        }

        match block {
            Block::Literal(text) => eval_literal(text, scope, context, message_role, contribute_default, &location),
            Block::Full(full) => {
                eval_full(
                    block,
                    &full.meta.defs,
                    &full.kind,
                    full.meta.description.clone(),
                    full.meta.assign.clone(),
                    full.meta.parser.as_ref(),
                    full.meta.spec.as_ref(),
                    full.meta.fallback.as_deref(),
                    scope,
                    context,
                    state,
                    message_role,
                    contribute_default,
                    location,
                )
                .await
            }
        }
    })
}

fn eval_literal(
    text: &str,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: &Location,
) -> EvalOutcome {
    let expansion = template::expand(text, &scope, location);
    let result = Value::String(expansion.text);
    let mut trace = TraceNode::leaf("literal").with_result(&result);
    for err in expansion.errors {
        trace.push_error(err);
    }
    if contribute_default.contains(&ContributeTarget::Context) {
        context.push(ChatMessage {
            role: message_role,
            content: result.as_text(),
        });
        scope.insert(crate::value::CONTEXT_KEY.to_string(), crate::value::context_to_value(&context));
    }
    EvalOutcome { result, context, scope, trace }
}

#[allow(clippy::too_many_arguments)]
async fn eval_full<'a>(
    block: &'a Block,
    defs: &'a IndexMap<String, Block>,
    kind: &'a BlockKind,
    description: Option<String>,
    assign: Option<String>,
    parser: Option<&'a AstParser>,
    spec: Option<&'a crate::ast::Spec>,
    fallback: Option<&'a Block>,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: Location,
) -> EvalOutcome {
    // 1. Defs phase (P4: declaration order, each sees earlier-declared names).
    let mut defs_trace = Vec::new();
    for (name, sub_block) in defs {
        let outcome = eval_inner(
            sub_block,
            scope,
            context,
            state.clone(),
            message_role,
            DEFAULT_RESULT_ONLY,
            location.clone(),
        )
        .await;
        scope = outcome.scope;
        context = outcome.context;
        scope.insert(name.clone(), outcome.result);
        let mut node = outcome.trace;
        node.description = Some(format!("def:{name}"));
        defs_trace.push(node);
    }

    // Snapshot for `fallback`: "evaluate fallback with the same (scope,
    // context)" (§4.1 step 7) means the inputs the body itself saw, i.e.
    // after defs but before the body ran.
    let scope_before_body = scope.clone();
    let context_before_body = context.clone();

    // 2. Body phase.
    let BodyOutcome {
        mut result,
        scope: body_scope,
        context: body_context,
        mut trace,
    } = eval_body(kind, scope, context, &state, message_role, contribute_default, location.clone()).await;
    scope = body_scope;
    context = body_context;

    trace.description = description;
    if !defs_trace.is_empty() {
        let mut children = defs_trace;
        children.append(&mut trace.children);
        trace.has_error = trace.has_error || children.iter().any(|c| c.has_error);
        trace.children = children;
    }

    // 3. Parser phase.
    if let Some(parser) = parser {
        if let Value::String(raw) = &result {
            match parser {
                AstParser::Pdl { pdl } => {
                    let outcome = eval_inner(
                        pdl,
                        scope,
                        context,
                        state.clone(),
                        message_role,
                        DEFAULT_BOTH,
                        location.clone(),
                    )
                    .await;
                    scope = outcome.scope;
                    context = outcome.context;
                    result = outcome.result;
                    trace.children.push(outcome.trace);
                }
                other => match parser_pipeline::run(other, raw, &location) {
                    Ok(parsed) => result = parsed,
                    Err(err) => trace.push_error(err),
                },
            }
        }
    }

    // 4. Spec phase: a mismatch does not abort evaluation, only records errors.
    if let Some(spec) = spec {
        let mismatches = spec_checker::check(&result, spec);
        if !mismatches.is_empty() {
            trace.push_error(PdlError::Type {
                location: location.clone(),
                message: "Type errors during spec checking".to_string(),
            });
            for mismatch in mismatches {
                trace.push_error(PdlError::Type {
                    location: location.clone(),
                    message: mismatch.message,
                });
            }
        }
    }
    trace.result = Some(result.to_json());

    // 7. Fallback: intercepts an error raised by this block's own evaluation
    // (body/parser/spec), replacing its outputs; `has_error` stays set.
    if trace.has_error {
        if let Some(fallback_block) = fallback {
            let outcome = eval_inner(
                fallback_block,
                scope_before_body,
                context_before_body,
                state.clone(),
                message_role,
                DEFAULT_BOTH,
                location.clone(),
            )
            .await;
            scope = outcome.scope;
            context = outcome.context;
            result = outcome.result;
            let mut fallback_trace = outcome.trace;
            fallback_trace.has_error = true;
            fallback_trace.description = trace.description.clone();
            trace = fallback_trace;
        }
    }

    // 5. Contribution phase (RESULT is simply `result`, used by the parent
    // container). CONTEXT only appends here for kinds that produce their own
    // leaf value directly (`contributes_context_directly`); container kinds
    // (document/sequence/array/object/if/repeat/for/call/include/…) already
    // had their children append individually during the body phase above, so
    // appending the container's own aggregated result here would double-count
    // the conversation. `Message` appends exactly once, under its own role.
    let contribute = effective_contribute(block, contribute_default);
    if contribute.contains(&ContributeTarget::Context) && contributes_context_directly(kind) {
        let role = match kind {
            BlockKind::Model { .. } => Some(Role::Assistant),
            BlockKind::Message { role, .. } => (*role).or(message_role),
            _ => message_role,
        };
        context.push(ChatMessage {
            role,
            content: result.as_text(),
        });
    }

    // 6. Assign phase.
    if let Some(name) = assign {
        scope.insert(name, result.clone());
    }

    // I2 again: the contribution phase above may have just appended to
    // `context`; keep scope's `context` key in lockstep before this
    // outcome is handed back to the caller.
    scope.insert(crate::value::CONTEXT_KEY.to_string(), crate::value::context_to_value(&context));

    EvalOutcome { result, context, scope, trace }
}

struct BodyOutcome {
    result: Value,
    scope: Scope,
    context: Vec<ChatMessage>,
    trace: TraceNode,
}

async fn eval_body<'a>(
    kind: &'a BlockKind,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: Location,
) -> BodyOutcome {
    match kind {
        BlockKind::Document { document } => {
            eval_text_container("document", document, scope, context, state, message_role, contribute_default, &location).await
        }
        BlockKind::Sequence { sequence } => {
            eval_text_container("sequence", sequence, scope, context, state, message_role, contribute_default, &location).await
        }
        BlockKind::Array { array } => {
            let mut items = Vec::new();
            let mut children = Vec::new();
            for child in array {
                let outcome = eval_inner(child, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
                scope = outcome.scope;
                context = outcome.context;
                items.push(outcome.result);
                children.push(outcome.trace);
            }
            let result = Value::List(items);
            BodyOutcome {
                result,
                scope,
                context,
                trace: TraceNode::leaf("array").with_children(children),
            }
        }
        BlockKind::Object { object } => {
            let mut fields = IndexMap::new();
            let mut children = Vec::new();
            let entries: Vec<(String, &Block)> = match object {
                ObjectFields::Mapping(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
                ObjectFields::Entries(entries) => entries.iter().map(|e| (e.key.clone(), &e.value)).collect(),
            };
            for (key, value_block) in entries {
                let outcome = eval_inner(value_block, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
                scope = outcome.scope;
                context = outcome.context;
                let mut node = outcome.trace;
                node.description = Some(key.clone());
                children.push(node);
                fields.insert(key, outcome.result);
            }
            let result = Value::Object(fields);
            BodyOutcome {
                result,
                scope,
                context,
                trace: TraceNode::leaf("object").with_children(children),
            }
        }
        BlockKind::Data { data, raw } => {
            let (result, errors) = if *raw {
                (data.to_value(), Vec::new())
            } else {
                let mut errors = Vec::new();
                let value = expand_data_literal(data, &scope, &location, &mut errors);
                (value, errors)
            };
            let mut trace = TraceNode::leaf("data");
            for err in errors {
                trace.push_error(err);
            }
            BodyOutcome { result, scope, context, trace }
        }
        BlockKind::Get { get } => {
            let (result, trace) = match scope.get(get) {
                Some(value) => (value.clone(), TraceNode::leaf("get")),
                None => {
                    let mut trace = TraceNode::leaf("get");
                    trace.push_error(PdlError::undefined_name(location.clone(), get.clone()));
                    (Value::Null, trace)
                }
            };
            BodyOutcome { result, scope, context, trace }
        }
        BlockKind::If { condition, then, else_ } => {
            let mut trace = TraceNode::leaf("if");
            let cond = match template::eval_bool(condition, &scope, &location) {
                Ok(cond) => cond,
                Err(err) => {
                    trace.push_error(err);
                    false
                }
            };
            if cond {
                let outcome = eval_inner(then, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
                scope = outcome.scope;
                context = outcome.context;
                trace = trace.with_children(vec![outcome.trace]);
                BodyOutcome { result: outcome.result, scope, context, trace }
            } else if let Some(else_block) = else_ {
                let outcome = eval_inner(else_block, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
                scope = outcome.scope;
                context = outcome.context;
                trace = trace.with_children(vec![outcome.trace]);
                BodyOutcome { result: outcome.result, scope, context, trace }
            } else {
                BodyOutcome {
                    result: Value::String(String::new()),
                    scope,
                    context,
                    trace,
                }
            }
        }
        BlockKind::Repeat { repeat, num_iterations, iteration_type } => {
            let mut iterations = Vec::new();
            let mut collected = Vec::new();
            for _ in 0..*num_iterations {
                if state.cancellation.is_cancelled() {
                    break;
                }
                let outcome = eval_inner(repeat, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
                scope = outcome.scope;
                context = outcome.context;
                collected.push(outcome.result);
                iterations.push(outcome.trace);
            }
            let result = aggregate(*iteration_type, collected);
            BodyOutcome {
                result,
                scope,
                context,
                trace: TraceNode::leaf("repeat").with_iterations(iterations),
            }
        }
        BlockKind::RepeatUntil { repeat, until, iteration_type } => {
            let mut iterations = Vec::new();
            let mut collected = Vec::new();
            loop {
                if state.cancellation.is_cancelled() {
                    break;
                }
                let outcome = eval_inner(repeat, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
                scope = outcome.scope;
                context = outcome.context;
                collected.push(outcome.result);
                iterations.push(outcome.trace);

                match template::eval_bool(until, &scope, &location) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => {
                        iterations.last_mut().unwrap().push_error(err);
                        break;
                    }
                }
            }
            let result = aggregate(*iteration_type, collected);
            BodyOutcome {
                result,
                scope,
                context,
                trace: TraceNode::leaf("repeatUntil").with_iterations(iterations),
            }
        }
        BlockKind::For { fors, repeat, iteration_type } => {
            eval_for(fors, repeat, *iteration_type, scope, context, state, message_role, contribute_default, location).await
        }
        BlockKind::Function { function, returns, body } => {
            let params = function
                .iter()
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect();
            let value = Value::Function(Box::new(FunctionValue {
                params,
                body: body.clone(),
                closure: scope.clone(),
                returns: returns.clone(),
            }));
            BodyOutcome {
                result: value,
                scope,
                context,
                trace: TraceNode::leaf("function"),
            }
        }
        BlockKind::Call { call, args } => eval_call(call, args, scope, context, state, message_role, contribute_default, location).await,
        BlockKind::Code { lan, code } => eval_code(lan, code, scope, context, state, message_role, location).await,
        BlockKind::Model { model, input, mock_response, parameters, data: _ } => {
            eval_model(model, input.as_deref(), mock_response.as_deref(), parameters, scope, context, state, message_role, location).await
        }
        BlockKind::Api { api: _, url, input } => eval_api(url, input, scope, context, state, message_role, location).await,
        BlockKind::Read { read, message, multiline } => eval_read(read.as_deref(), message.as_deref(), *multiline, scope, context, state, &location).await,
        BlockKind::Include { include } => eval_include(include, scope, context, state, message_role, contribute_default, &location).await,
        BlockKind::Message { role, content } => {
            // §4.1 "Message": one message for the whole body, not one per
            // child. Suppress every descendant's own context append
            // (`DEFAULT_RESULT_ONLY`) and let the contribution phase in
            // `eval_full` append exactly one message for this block, under
            // `effective_role`, from the body's aggregated result.
            let effective_role = (*role).or(message_role);
            let outcome = eval_inner(content, scope, context, state.clone(), effective_role, DEFAULT_RESULT_ONLY, location.clone()).await;
            BodyOutcome {
                result: outcome.result,
                scope: outcome.scope,
                context: outcome.context,
                trace: TraceNode::leaf("message").with_children(vec![outcome.trace]),
            }
        }
    }
}

async fn eval_text_container<'a>(
    kind_name: &'static str,
    children: &'a [Block],
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: &Location,
) -> BodyOutcome {
    let mut text = String::new();
    let mut trace_children = Vec::new();
    for child in children {
        let outcome = eval_inner(
            child,
            scope,
            context,
            state.clone(),
            message_role,
            contribute_default,
            location.clone(),
        )
        .await;
        scope = outcome.scope;
        context = outcome.context;
        if effective_contribute(child, contribute_default).contains(&ContributeTarget::Result) {
            text.push_str(&outcome.result.as_text());
        }
        trace_children.push(outcome.trace);
    }
    BodyOutcome {
        result: Value::String(text),
        scope,
        context,
        trace: TraceNode::leaf(kind_name).with_children(trace_children),
    }
}

fn aggregate(iteration_type: IterationType, collected: Vec<Value>) -> Value {
    match iteration_type {
        IterationType::Text => Value::String(collected.iter().map(Value::as_text).collect::<Vec<_>>().join("")),
        IterationType::Array => Value::List(collected),
        IterationType::LastOf => collected.into_iter().last().unwrap_or(Value::Null),
    }
}

fn expand_data_literal(data: &DataLiteral, scope: &Scope, location: &Location, errors: &mut Vec<PdlError>) -> Value {
    match data {
        DataLiteral::Null => Value::Null,
        DataLiteral::Bool(b) => Value::Bool(*b),
        DataLiteral::Int(i) => Value::Int(*i),
        DataLiteral::Float(f) => Value::Float(*f),
        DataLiteral::String(s) => {
            let expansion = template::expand(s, scope, location);
            errors.extend(expansion.errors);
            Value::String(expansion.text)
        }
        DataLiteral::List(items) => Value::List(
            items
                .iter()
                .map(|item| expand_data_literal(item, scope, location, errors))
                .collect(),
        ),
        DataLiteral::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), expand_data_literal(v, scope, location, errors)))
                .collect(),
        ),
    }
}

async fn eval_for<'a>(
    fors: &'a IndexMap<String, Block>,
    repeat: &'a Block,
    iteration_type: IterationType,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: Location,
) -> BodyOutcome {
    let mut trace = TraceNode::leaf("for");
    let mut lists: Vec<(String, Vec<Value>)> = Vec::new();
    let mut any_not_list = false;

    for (name, iter_block) in fors {
        let outcome = eval_inner(
            iter_block,
            scope,
            context,
            state.clone(),
            message_role,
            DEFAULT_BOTH,
            location.clone(),
        )
        .await;
        scope = outcome.scope;
        context = outcome.context;
        trace.children.push(outcome.trace);
        match outcome.result {
            Value::List(items) => lists.push((name.clone(), items)),
            _ => any_not_list = true,
        }
    }

    if any_not_list {
        trace.push_error(PdlError::Iterable {
            location: location.clone(),
            message: "Values inside the For block must be lists".to_string(),
        });
        return BodyOutcome { result: Value::String(String::new()), scope, context, trace };
    }

    let lengths: Vec<usize> = lists.iter().map(|(_, items)| items.len()).collect();
    if lengths.windows(2).any(|pair| pair[0] != pair[1]) {
        trace.push_error(PdlError::Iterable {
            location: location.clone(),
            message: "Lists inside the For block must be of the same length".to_string(),
        });
        return BodyOutcome { result: Value::String(String::new()), scope, context, trace };
    }

    let num_iterations = lengths.first().copied().unwrap_or(0);
    let mut iterations = Vec::new();
    let mut collected = Vec::new();
    for i in 0..num_iterations {
        if state.cancellation.is_cancelled() {
            break;
        }
        for (name, items) in &lists {
            scope.insert(name.clone(), items[i].clone());
        }
        let outcome = eval_inner(repeat, scope, context, state.clone(), message_role, contribute_default, location.clone()).await;
        scope = outcome.scope;
        context = outcome.context;
        collected.push(outcome.result);
        iterations.push(outcome.trace);
    }

    let result = aggregate(iteration_type, collected);
    trace = trace.with_iterations(iterations);
    BodyOutcome { result, scope, context, trace }
}

async fn eval_call<'a>(
    call: &'a str,
    args: &'a IndexMap<String, Block>,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: Location,
) -> BodyOutcome {
    let mut trace = TraceNode::leaf("call");

    let function = match scope.get(call) {
        Some(Value::Function(f)) => f.clone(),
        Some(_) | None => {
            trace.push_error(PdlError::undefined_name(location.clone(), call.to_string()));
            return BodyOutcome { result: Value::Null, scope, context, trace };
        }
    };

    let mut call_scope = function.closure.clone();
    for (name, arg_block) in args {
        let outcome = eval_inner(arg_block, scope, context, state.clone(), message_role, DEFAULT_BOTH, location.clone()).await;
        scope = outcome.scope;
        context = outcome.context;
        trace.children.push(outcome.trace);

        if let Some((_, Some(param_spec))) = function.params.iter().find(|(p, _)| p == name) {
            let mismatches = spec_checker::check(&outcome.result, param_spec);
            if !mismatches.is_empty() {
                trace.push_error(PdlError::Type {
                    location: location.clone(),
                    message: format!("Type errors in argument '{name}' to call of {call}"),
                });
                for mismatch in mismatches {
                    trace.push_error(PdlError::Type {
                        location: location.clone(),
                        message: mismatch.message,
                    });
                }
            }
        }
        call_scope.insert(name.clone(), outcome.result);
    }

    let body_outcome = eval_inner(
        &function.body,
        call_scope,
        context,
        state.clone(),
        message_role,
        contribute_default,
        location.clone(),
    )
    .await;
    // P3/§4.7: the callee's scope mutations never leak back; only its
    // returned context (it may have appended chat messages) propagates.
    context = body_outcome.context;
    trace.children.push(body_outcome.trace);

    if let Some(return_spec) = &function.returns {
        let mismatches = spec_checker::check(&body_outcome.result, return_spec);
        if !mismatches.is_empty() {
            trace.push_error(PdlError::Type {
                location: location.clone(),
                message: format!("Type errors in result of function call to {call}"),
            });
            for mismatch in mismatches {
                trace.push_error(PdlError::Type {
                    location: location.clone(),
                    message: mismatch.message,
                });
            }
        }
    }

    BodyOutcome { result: body_outcome.result, scope, context, trace }
}

async fn eval_code<'a>(
    lan: &'a str,
    code: &'a Block,
    scope: Scope,
    context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    location: Location,
) -> BodyOutcome {
    let outcome = eval_inner(code, scope, context, state.clone(), message_role, DEFAULT_BOTH, location.clone()).await;
    let scope = outcome.scope;
    let context = outcome.context;
    let source = outcome.result.as_text();
    let mut trace = TraceNode::leaf("code").with_children(vec![outcome.trace]);

    let Some(provider) = state.providers.get_code_provider(lan) else {
        trace.push_error(PdlError::Provider {
            location: location.clone(),
            source: ProviderError::Other {
                message: format!("no code provider registered for language '{lan}'"),
                provider: Some(lan.to_string()),
                retryable: false,
            },
        });
        return BodyOutcome { result: Value::Null, scope, context, trace };
    };

    // P5: the provider receives a snapshot; mutations to it never leak back.
    let snapshot = scope.clone();
    let result = match provider.run_code(&source, snapshot).await {
        Ok(value) => value,
        Err(err) => {
            trace.push_error(PdlError::Provider { location: location.clone(), source: err });
            Value::Null
        }
    };
    BodyOutcome { result, scope, context, trace }
}

#[allow(clippy::too_many_arguments)]
async fn eval_model<'a>(
    model: &'a Block,
    input: Option<&'a Block>,
    mock_response: Option<&'a str>,
    parameters: &'a IndexMap<String, DataLiteral>,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    location: Location,
) -> BodyOutcome {
    let mut trace = TraceNode::leaf("model");

    let model_outcome = eval_inner(model, scope, context, state.clone(), message_role, DEFAULT_BOTH, location.clone()).await;
    scope = model_outcome.scope;
    context = model_outcome.context;
    let model_id = model_outcome.result.as_text();
    trace.children.push(model_outcome.trace);

    if let Some(mock) = mock_response {
        let result = Value::String(mock.to_string());
        return BodyOutcome { result, scope, context, trace };
    }

    let messages = if let Some(input_block) = input {
        let outcome = eval_inner(input_block, scope, context, state.clone(), message_role, DEFAULT_BOTH, location.clone()).await;
        scope = outcome.scope;
        context = outcome.context;
        trace.children.push(outcome.trace);
        vec![ChatMessage {
            role: Some(Role::User),
            content: outcome.result.as_text(),
        }]
    } else {
        context.clone()
    };

    let params = merge_sampling_params(config::default_sampling_params(), parameters);

    let (platform, _) = crate::providers::split_platform(&model_id);
    let provider = platform.and_then(|p| state.providers.get_model_provider(p));
    let Some(provider) = provider else {
        trace.push_error(PdlError::Provider {
            location: location.clone(),
            source: ProviderError::Unavailable {
                message: format!("no model provider registered for model id '{model_id}'"),
                provider: platform.map(str::to_string),
                status_code: None,
            },
        });
        return BodyOutcome { result: Value::Null, scope, context, trace };
    };

    let result = match provider.generate_text(&model_id, &messages, &params).await {
        Ok(text) => Value::String(text),
        Err(err) => {
            trace.push_error(PdlError::Provider { location: location.clone(), source: err });
            Value::Null
        }
    };
    BodyOutcome { result, scope, context, trace }
}

fn merge_sampling_params(mut params: SamplingParams, overrides: &IndexMap<String, DataLiteral>) -> SamplingParams {
    for (key, value) in overrides {
        match (key.as_str(), value) {
            ("decoding_method" | "decoding", DataLiteral::String(s)) => params.decoding = s.clone(),
            ("max_new_tokens", DataLiteral::Int(i)) => params.max_new_tokens = (*i).max(0) as u32,
            ("min_new_tokens", DataLiteral::Int(i)) => params.min_new_tokens = (*i).max(0) as u32,
            ("repetition_penalty", DataLiteral::Float(f)) => params.repetition_penalty = *f,
            ("include_stop_sequence", DataLiteral::Bool(b)) => params.include_stop_sequence = *b,
            ("stop_sequences", DataLiteral::List(items)) => {
                params.stop_sequences = items
                    .iter()
                    .filter_map(|item| match item {
                        DataLiteral::String(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect();
            }
            _ => {}
        }
    }
    params
}

async fn eval_api<'a>(
    url: &'a str,
    input: &'a Block,
    mut scope: Scope,
    mut context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    location: Location,
) -> BodyOutcome {
    let outcome = eval_inner(input, scope, context, state.clone(), message_role, DEFAULT_BOTH, location.clone()).await;
    scope = outcome.scope;
    context = outcome.context;
    let query = outcome.result.as_text();
    let mut trace = TraceNode::leaf("api").with_children(vec![outcome.trace]);

    let Some(provider) = state.providers.get_api_provider() else {
        trace.push_error(PdlError::Provider {
            location: location.clone(),
            source: ProviderError::Other {
                message: "no api provider registered".to_string(),
                provider: Some("api".to_string()),
                retryable: false,
            },
        });
        return BodyOutcome { result: Value::Null, scope, context, trace };
    };

    let full_url = format!("{url}{query}");
    let result = match provider.http_get(&full_url).await {
        Ok(value) => value,
        Err(err) => {
            trace.push_error(PdlError::Provider { location: location.clone(), source: err });
            Value::Null
        }
    };
    BodyOutcome { result, scope, context, trace }
}

async fn eval_read<'a>(
    read: Option<&'a str>,
    message: Option<&'a str>,
    multiline: bool,
    scope: Scope,
    context: Vec<ChatMessage>,
    state: &EvalState,
    location: &Location,
) -> BodyOutcome {
    let mut trace = TraceNode::leaf("read");
    let Some(provider) = state.providers.get_read_provider() else {
        trace.push_error(PdlError::Provider {
            location: location.clone(),
            source: ProviderError::Other {
                message: "no read provider registered".to_string(),
                provider: Some("read".to_string()),
                retryable: false,
            },
        });
        return BodyOutcome { result: Value::Null, scope, context, trace };
    };

    let result = match provider.read_input(read, message, multiline).await {
        Ok(text) => Value::String(text),
        Err(err) => {
            trace.push_error(PdlError::Provider { location: location.clone(), source: err });
            Value::Null
        }
    };
    BodyOutcome { result, scope, context, trace }
}

async fn eval_include<'a>(
    path: &'a str,
    scope: Scope,
    context: Vec<ChatMessage>,
    state: &EvalState,
    message_role: Option<Role>,
    contribute_default: &'static [ContributeTarget],
    location: &Location,
) -> BodyOutcome {
    let mut trace = TraceNode::leaf("include");
    let included = match crate::loader::load_program_file(path).await {
        Ok(block) => block,
        Err(err) => {
            trace.push_error(PdlError::Provider {
                location: location.clone(),
                source: ProviderError::Other {
                    message: format!("failed to include '{path}': {err}"),
                    provider: Some("include".to_string()),
                    retryable: false,
                },
            });
            return BodyOutcome { result: Value::Null, scope, context, trace };
        }
    };

    let outcome = eval_inner(
        &included,
        scope,
        context,
        state.clone(),
        message_role,
        contribute_default,
        Location {
            path: vec![],
            file: path.to_string(),
            table: Default::default(),
        },
    )
    .await;
    trace = trace.with_children(vec![outcome.trace]);
    BodyOutcome {
        result: outcome.result,
        scope: outcome.scope,
        context: outcome.context,
        trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BlockMeta, FullBlock, PrimitiveSpec, Spec};
    use crate::testing::{FakeCodeProvider, FakeModelProvider};
    use crate::value::initial_scope;

    fn bare(kind: BlockKind) -> Block {
        Block::Full(Box::new(FullBlock { meta: BlockMeta::default(), kind }))
    }

    fn state_with_registry() -> EvalState {
        EvalState::new(Arc::new(ProviderRegistry::new()))
    }

    #[tokio::test]
    async fn literal_expands_template_variables() {
        let mut scope = initial_scope();
        scope.insert("NAME".to_string(), Value::String("World".to_string()));
        let block = Block::literal("Hello, {{ NAME }}!");
        let outcome = eval(&block, scope, Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.result.as_text(), "Hello, World!");
        assert!(!outcome.trace.has_error);
    }

    #[tokio::test]
    async fn document_concatenates_children_left_to_right() {
        let block = bare(BlockKind::Document {
            document: vec![Block::literal("Hello, "), Block::literal("World!")],
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.result.as_text(), "Hello, World!");
    }

    /// Hello-with-get using a mocked model block.
    #[tokio::test]
    async fn hello_with_get_scenario() {
        let name_block = bare(BlockKind::Document {
            document: vec![bare(BlockKind::Model {
                model: Box::new(Block::literal("watsonx/ibm/granite-34b-code-instruct")),
                input: None,
                mock_response: Some(" World".to_string()),
                parameters: IndexMap::new(),
                data: None,
            })],
        });
        let mut name_def = match name_block {
            Block::Full(b) => *b,
            _ => unreachable!(),
        };
        name_def.meta.contribute = Some(vec![]);

        let mut defs = IndexMap::new();
        defs.insert("NAME".to_string(), Block::Full(Box::new(name_def)));

        let root = Block::Full(Box::new(FullBlock {
            meta: BlockMeta {
                defs,
                ..Default::default()
            },
            kind: BlockKind::Document {
                document: vec![
                    Block::literal("Hello,"),
                    Block::literal("!\n"),
                    Block::literal("Tell me about"),
                    bare(BlockKind::Get { get: "NAME".to_string() }),
                    Block::literal("?\n"),
                ],
            },
        }));

        let outcome = eval(&root, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.result.as_text(), "Hello,! \nTell me about World?\n".replace("! \n", "!\n"));
    }

    /// Scenario 2: `{get: somevar}` is undefined.
    #[tokio::test]
    async fn undefined_get_sets_has_error() {
        let block = bare(BlockKind::Document {
            document: vec![bare(BlockKind::Get { get: "somevar".to_string() })],
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert!(outcome.trace.contains_error());
    }

    /// Scenario 4: spec mismatch surfaces both the header and the per-value message.
    #[tokio::test]
    async fn spec_mismatch_reports_type_errors() {
        let mut meta = BlockMeta::default();
        meta.spec = Some(Spec::Primitive(PrimitiveSpec::Int));
        let block = Block::Full(Box::new(FullBlock {
            meta,
            kind: BlockKind::Document {
                document: vec![Block::literal("hello")],
            },
        }));
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert!(outcome.trace.has_error);
        let messages: Vec<String> = outcome.trace.errors.iter().map(|e| e.to_string()).collect();
        assert!(messages.iter().any(|m| m.contains("Type errors during spec checking")));
        assert!(messages.iter().any(|m| m.contains("hello should be of type <class 'int'>")));
    }

    /// Scenario 5: For-block length mismatch.
    #[tokio::test]
    async fn for_block_reports_unequal_lengths() {
        let mut fors = IndexMap::new();
        fors.insert(
            "x".to_string(),
            bare(BlockKind::Data {
                data: DataLiteral::List(vec![DataLiteral::Int(1), DataLiteral::Int(2)]),
                raw: true,
            }),
        );
        fors.insert(
            "y".to_string(),
            bare(BlockKind::Data {
                data: DataLiteral::List(vec![DataLiteral::Int(1), DataLiteral::Int(2), DataLiteral::Int(3)]),
                raw: true,
            }),
        );
        let block = bare(BlockKind::For {
            fors,
            repeat: Box::new(Block::literal("x")),
            iteration_type: IterationType::Text,
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert!(outcome.trace.contains_error());
    }

    /// Scenario 8: calling an undefined function is an undefined-name error
    /// but does not abort sibling evaluation (P1).
    #[tokio::test]
    async fn missing_call_sets_has_error_but_siblings_still_run() {
        let block = bare(BlockKind::Document {
            document: vec![
                Block::literal("before "),
                bare(BlockKind::Call {
                    call: "undefined_function".to_string(),
                    args: IndexMap::new(),
                }),
                Block::literal(" after"),
            ],
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert!(outcome.trace.contains_error());
        assert_eq!(outcome.result.as_text(), "before  after");
    }

    /// P5/scenario 6: a code block can read a bound name but its local
    /// reassignment never leaks back to the outer scope.
    #[tokio::test]
    async fn code_block_does_not_leak_mutations() {
        let registry = ProviderRegistry::new();
        registry.mount_code_provider(
            "python",
            Arc::new(FakeCodeProvider::with_responses(vec![Ok(Value::String("foooof".to_string()))])),
        );
        let state = EvalState::new(Arc::new(registry));

        let mut name_def_meta = BlockMeta::default();
        name_def_meta.contribute = Some(vec![]);
        let name_def = Block::Full(Box::new(FullBlock {
            meta: name_def_meta,
            kind: BlockKind::Document {
                document: vec![Block::literal("foo")],
            },
        }));

        let mut code_meta = BlockMeta::default();
        code_meta.contribute = Some(vec![]);
        let code_block = Block::Full(Box::new(FullBlock {
            meta: code_meta,
            kind: BlockKind::Code {
                lan: "python".to_string(),
                code: Box::new(Block::literal("NAME = NAME[::-1]\nresult = NAME")),
            },
        }));

        let mut defs = IndexMap::new();
        defs.insert("NAME".to_string(), name_def);
        defs.insert("I".to_string(), code_block);

        let root = Block::Full(Box::new(FullBlock {
            meta: BlockMeta { defs, ..Default::default() },
            kind: BlockKind::Document {
                document: vec![
                    Block::literal("Hello, "),
                    bare(BlockKind::Get { get: "NAME".to_string() }),
                    bare(BlockKind::Get { get: "I".to_string() }),
                ],
            },
        }));

        let outcome = eval(&root, initial_scope(), Vec::new(), &state).await;
        assert_eq!(outcome.result.as_text(), "Hello, foofoooof");
    }

    #[tokio::test]
    async fn mock_response_bypasses_the_provider() {
        let state = state_with_registry();
        let block = bare(BlockKind::Model {
            model: Box::new(Block::literal("openai/gpt-4")),
            input: None,
            mock_response: Some("mocked text".to_string()),
            parameters: IndexMap::new(),
            data: None,
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state).await;
        assert_eq!(outcome.result.as_text(), "mocked text");
        assert!(!outcome.trace.has_error);
    }

    #[tokio::test]
    async fn model_block_appends_assistant_message_to_context() {
        let registry = ProviderRegistry::new();
        registry.mount_model_provider("fake", Arc::new(FakeModelProvider::new("generated")));
        let state = EvalState::new(Arc::new(registry));
        let block = bare(BlockKind::Model {
            model: Box::new(Block::literal("fake/some-model")),
            input: None,
            mock_response: None,
            parameters: IndexMap::new(),
            data: None,
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state).await;
        assert_eq!(outcome.context.last().unwrap().role, Some(Role::Assistant));
        assert_eq!(outcome.context.last().unwrap().content, "generated");
    }

    /// §4.1 "Message": a message with several text children collapses into
    /// exactly one context entry holding the whole body, not one per child.
    #[tokio::test]
    async fn message_with_multiple_children_appends_exactly_one_context_entry() {
        let block = bare(BlockKind::Message {
            role: Some(Role::User),
            content: Box::new(bare(BlockKind::Document {
                document: vec![Block::literal("Hello, "), Block::literal("World!")],
            })),
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.context.len(), 1);
        assert_eq!(outcome.context[0].role, Some(Role::User));
        assert_eq!(outcome.context[0].content, "Hello, World!");
    }

    #[tokio::test]
    async fn repeat_aggregates_as_text_by_default() {
        let block = bare(BlockKind::Repeat {
            repeat: Box::new(Block::literal("x")),
            num_iterations: 3,
            iteration_type: IterationType::Text,
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.result.as_text(), "xxx");
    }

    #[tokio::test]
    async fn repeat_as_array_collects_each_iteration() {
        let block = bare(BlockKind::Repeat {
            repeat: Box::new(Block::literal("x")),
            num_iterations: 2,
            iteration_type: IterationType::Array,
        });
        let outcome = eval(&block, initial_scope(), Vec::new(), &state_with_registry()).await;
        match outcome.result {
            Value::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn function_does_not_contribute_result_or_context() {
        let func_block = bare(BlockKind::Function {
            function: IndexMap::new(),
            returns: None,
            body: Box::new(Block::literal("body text")),
        });
        let mut meta = BlockMeta::default();
        meta.assign = Some("greet".to_string());
        let func_block = match func_block {
            Block::Full(mut b) => {
                b.meta = meta;
                Block::Full(b)
            }
            _ => unreachable!(),
        };
        let root = bare(BlockKind::Document {
            document: vec![func_block, Block::literal("after")],
        });
        let outcome = eval(&root, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.result.as_text(), "after");
    }

    #[tokio::test]
    async fn call_invokes_a_bound_function() {
        let func_block = bare(BlockKind::Function {
            function: IndexMap::new(),
            returns: None,
            body: Box::new(Block::literal("called!")),
        });
        let mut func_full = match func_block {
            Block::Full(b) => *b,
            _ => unreachable!(),
        };
        func_full.meta.assign = Some("greet".to_string());
        func_full.meta.contribute = Some(vec![]);

        let root = bare(BlockKind::Document {
            document: vec![
                Block::Full(Box::new(func_full)),
                bare(BlockKind::Call {
                    call: "greet".to_string(),
                    args: IndexMap::new(),
                }),
            ],
        });
        let outcome = eval(&root, initial_scope(), Vec::new(), &state_with_registry()).await;
        assert_eq!(outcome.result.as_text(), "called!");
        assert!(!outcome.trace.has_error);
    }

    /// I2: after a model block appends to the running context, `scope["context"]`
    /// must reflect that append immediately — a sibling that reads `context`
    /// (via `get` or a template) sees the up-to-date conversation, not the
    /// empty list scope was seeded with.
    #[tokio::test]
    async fn scope_context_key_tracks_the_context_accumulator() {
        let registry = ProviderRegistry::new();
        registry.mount_model_provider("fake", Arc::new(FakeModelProvider::new("generated")));
        let state = EvalState::new(Arc::new(registry));

        let root = bare(BlockKind::Document {
            document: vec![
                bare(BlockKind::Model {
                    model: Box::new(Block::literal("fake/some-model")),
                    input: None,
                    mock_response: None,
                    parameters: IndexMap::new(),
                    data: None,
                }),
                bare(BlockKind::Get { get: "context".to_string() }),
            ],
        });

        let outcome = eval(&root, initial_scope(), Vec::new(), &state).await;
        assert_eq!(outcome.context.len(), 1);
        match outcome.scope.get("context") {
            Some(Value::List(items)) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].object_get("content").unwrap().as_text(), "generated");
            }
            other => panic!("expected a list in scope[\"context\"], got {other:?}"),
        }
    }
}

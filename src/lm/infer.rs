//! The `tvm_language_model` component: the streaming `infer` operator plus
//! its sibling instant methods (`apply_chat_template`, `clear`, stream-mode
//! and grammar configuration).

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ErrorCode, OperatorError, RangeError, TypeError, ValueError};
use crate::lm::messages;
use crate::lm::model::{LanguageModel, MODE_REASONING, MODE_TOOL_CALL};
use crate::lm::traits::{BackendError, GrammarSpec, ModelLoader, TokenId};
use crate::value::{Value, ValueMap};
use crate::vm::component::Component;
use crate::vm::module::Module;
use crate::vm::operator::{IterativeMethod, Method, MethodRun, Step};

pub const COMPONENT_TYPE: &str = "tvm_language_model";
const MODEL_OBJECT: &str = "model";

/// Module contributing the `tvm_language_model` factory, parameterized by
/// the host's model loader.
pub fn language_module(loader: Arc<dyn ModelLoader>) -> Module {
    Module::new("language").with_factory(COMPONENT_TYPE, move |attrs| {
        build_component(loader.as_ref(), attrs)
    })
}

fn build_component(loader: &dyn ModelLoader, attrs: Value) -> Result<Component, OperatorError> {
    let context = "tvm_language_model: create";
    let map = attrs
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", attrs.kind().as_str()))?;
    let model_name = map
        .get("model")
        .ok_or_else(|| RangeError::new(context, "model"))?;
    if model_name.as_str().is_none() {
        return Err(TypeError::new(context, "model", "string", model_name.kind().as_str()).into());
    }
    if let Some(quantization) = map.get("quantization") {
        if quantization.as_str().is_none() {
            return Err(TypeError::new(
                context,
                "quantization",
                "string",
                quantization.kind().as_str(),
            )
            .into());
        }
    }
    if let Some(device) = map.get("device") {
        if device.as_integer().is_none() {
            return Err(
                TypeError::new(context, "device", "int | uint", device.kind().as_str()).into(),
            );
        }
    }

    let bundle = loader.load(&attrs)?;
    let model = Arc::new(Mutex::new(LanguageModel::new(bundle)));

    Ok(Component::new()
        .with_object(MODEL_OBJECT, model)
        .with_method("infer", Method::Iterative(Arc::new(InferMethod)))
        .with_method("apply_chat_template", Method::instant(apply_chat_template_op))
        .with_method("clear", Method::instant(clear_op))
        .with_method("add_stream_mode", Method::instant(add_stream_mode_op))
        .with_method("remove_stream_mode", Method::instant(remove_stream_mode_op))
        .with_method("set_grammar", Method::instant(set_grammar_op))
        .with_method("reset_grammar", Method::instant(reset_grammar_op)))
}

fn model_of(component: &Component) -> Result<Arc<Mutex<LanguageModel>>, OperatorError> {
    component
        .object::<Mutex<LanguageModel>>(MODEL_OBJECT)
        .ok_or_else(|| OperatorError::new(ErrorCode::NoSuchComponent, "model object missing"))
}

fn lock_model(model: &Mutex<LanguageModel>) -> MutexGuard<'_, LanguageModel> {
    match model.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pulls and checks the `tools` field: an array value or a JSON string.
fn parse_tools(context: &str, map: &ValueMap) -> Result<Option<Value>, OperatorError> {
    match map.get("tools") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(tools)) => Ok(Some(Value::Array(tools.clone()))),
        Some(Value::Str(raw)) => Value::from_json_str(raw)
            .map(Some)
            .map_err(|_| ValueError::new(context, "tools", "valid JSON", raw.clone()).into()),
        Some(other) => {
            Err(TypeError::new(context, "tools", "string | array", other.kind().as_str()).into())
        }
    }
}

fn optional_bool(
    context: &str,
    map: &ValueMap,
    key: &str,
) -> Result<Option<bool>, OperatorError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(other) => Err(TypeError::new(context, key, "bool", other.kind().as_str()).into()),
    }
}

fn optional_f64(context: &str, map: &ValueMap, key: &str) -> Result<Option<f64>, OperatorError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Double(v)) => Ok(Some(*v)),
        Some(other) => Err(TypeError::new(context, key, "double", other.kind().as_str()).into()),
    }
}

fn require_str<'a>(context: &str, map: &'a ValueMap, key: &str) -> Result<&'a str, OperatorError> {
    let value = map
        .get(key)
        .ok_or_else(|| RangeError::new(context, key))?;
    value
        .as_str()
        .ok_or_else(|| TypeError::new(context, key, "string", value.kind().as_str()).into())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    InvalidToolCall,
}

impl FinishReason {
    fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::InvalidToolCall => "invalid_tool_call",
        }
    }
}

/// `{message: {<key>: [{type: <t>, <t>: payload}]}}`
fn delta(key: &str, part_type: &str, payload: Value) -> Value {
    let part = ValueMap::new().with("type", part_type).with(part_type, payload);
    let message = ValueMap::new().with(key, Value::Array(vec![Value::Map(part)]));
    Value::Map(ValueMap::new().with("message", Value::Map(message)))
}

/// `{message: {}, finish_reason}`
fn terminal(reason: FinishReason) -> Value {
    Value::Map(
        ValueMap::new()
            .with("message", Value::empty_map())
            .with("finish_reason", reason.as_str()),
    )
}

fn terminal_with(mut value: Value, reason: FinishReason) -> Value {
    if let Some(map) = value.as_map_mut() {
        map.insert("finish_reason", reason.as_str());
    }
    value
}

struct InferMethod;

enum Phase {
    /// Prefill overflowed; the first step is terminal.
    Failed(FinishReason),
    Decoding { current_token: TokenId },
}

struct InferRun {
    model: Arc<Mutex<LanguageModel>>,
    phase: Phase,
    finish_reason: FinishReason,
    ignore_reasoning: bool,
}

impl IterativeMethod for InferMethod {
    fn start(
        &self,
        component: &Component,
        input: Value,
    ) -> Result<Box<dyn MethodRun>, OperatorError> {
        let context = "tvm_language_model: infer";
        let map = input
            .as_map()
            .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;

        let messages_value = map
            .get("messages")
            .ok_or_else(|| RangeError::new(context, "messages"))?;
        messages::validate_messages(context, messages_value)?;

        let tools = parse_tools(context, map)?;
        let enable_reasoning = optional_bool(context, map, "enable_reasoning")?.unwrap_or(false);
        let ignore_reasoning =
            optional_bool(context, map, "ignore_reasoning_messages")?.unwrap_or(false);
        let temperature = optional_f64(context, map, "temperature")?;
        let top_p = optional_f64(context, map, "top_p")?;

        let model = model_of(component)?;
        let phase = {
            let mut guard = lock_model(&model);
            let defaults = guard.defaults();
            guard.config.temperature = temperature.unwrap_or(defaults.temperature);
            guard.config.top_p = top_p.unwrap_or(defaults.top_p);

            let prompt = guard.apply_chat_template(
                messages_value,
                tools.as_ref(),
                enable_reasoning,
                true,
            )?;
            let tokens = guard.tokenize(&prompt);
            match guard.prefill(&tokens) {
                Ok(current_token) => Phase::Decoding { current_token },
                Err(BackendError::ContextLengthLimit) => Phase::Failed(FinishReason::Length),
                Err(err) => return Err(err.into()),
            }
        };

        Ok(Box::new(InferRun {
            model,
            phase,
            finish_reason: FinishReason::Stop,
            ignore_reasoning,
        }))
    }
}

impl MethodRun for InferRun {
    /// Runs the decode loop until exactly one emittable delta (or a
    /// terminal condition) is produced.
    fn step(&mut self) -> Result<Step, OperatorError> {
        let current = match self.phase {
            Phase::Failed(reason) => return Ok(Step::done(terminal(reason))),
            Phase::Decoding { current_token } => current_token,
        };

        let model = Arc::clone(&self.model);
        let mut model = lock_model(&model);
        let mut aggregate = String::new();
        let mut token = current;

        loop {
            token = match model.decode(token) {
                Ok(token) => token,
                Err(BackendError::ContextLengthLimit) => {
                    return Ok(Step::done(terminal(FinishReason::Length)));
                }
                Err(err) => return Err(err.into()),
            };
            self.phase = Phase::Decoding {
                current_token: token,
            };
            let mode = model.current_mode().to_string();
            let Some(token_str) = model.detokenize(token) else {
                continue;
            };

            match mode.as_str() {
                MODE_TOOL_CALL => {
                    if model.is_botc(&token_str) {
                        self.finish_reason = FinishReason::ToolCalls;
                    } else {
                        aggregate.push_str(&token_str);
                    }
                }
                MODE_REASONING => {
                    if self.ignore_reasoning || model.is_bor(&token_str) {
                        continue;
                    }
                    return Ok(Step::partial(delta("reasoning", "text", Value::Str(token_str))));
                }
                _ => {
                    if model.is_eos(&token_str) {
                        return Ok(Step::done(terminal(self.finish_reason)));
                    }
                    if model.is_eotc(&token_str) {
                        let raw = aggregate.trim().to_string();
                        aggregate.clear();
                        match Value::from_json_str(&raw) {
                            Ok(parsed) => {
                                return Ok(Step::partial(delta("tool_calls", "function", parsed)));
                            }
                            Err(_) => {
                                let out = terminal_with(
                                    delta("error", "text", Value::Str("Invalid tool_call created".into())),
                                    FinishReason::InvalidToolCall,
                                );
                                return Ok(Step::done(out));
                            }
                        }
                    }
                    if model.is_eor(&token_str) {
                        continue;
                    }
                    return Ok(Step::partial(delta("content", "text", Value::Str(token_str))));
                }
            }
        }
    }
}

fn apply_chat_template_op(component: &Component, input: Value) -> Result<Value, OperatorError> {
    let context = "tvm_language_model: apply_chat_template";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;
    let messages_value = map
        .get("messages")
        .ok_or_else(|| RangeError::new(context, "messages"))?;
    messages::validate_messages(context, messages_value)?;
    let tools = parse_tools(context, map)?;
    let enable_reasoning = optional_bool(context, map, "enable_reasoning")?.unwrap_or(false);

    let model = model_of(component)?;
    let prompt = lock_model(&model).apply_chat_template(
        messages_value,
        tools.as_ref(),
        enable_reasoning,
        true,
    )?;
    Ok(Value::Map(ValueMap::new().with("prompt", prompt)))
}

fn clear_op(component: &Component, _input: Value) -> Result<Value, OperatorError> {
    let model = model_of(component)?;
    lock_model(&model).clear();
    Ok(Value::Null)
}

fn add_stream_mode_op(component: &Component, input: Value) -> Result<Value, OperatorError> {
    let context = "tvm_language_model: add_stream_mode";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;
    let name = require_str(context, map, "name")?;
    let open = require_str(context, map, "open_indicator")?;
    let close = require_str(context, map, "close_indicator")?;
    let model = model_of(component)?;
    lock_model(&model).add_stream_mode(name, open, close)?;
    Ok(Value::empty_map())
}

fn remove_stream_mode_op(component: &Component, input: Value) -> Result<Value, OperatorError> {
    let context = "tvm_language_model: remove_stream_mode";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;
    let name = require_str(context, map, "name")?;
    let model = model_of(component)?;
    lock_model(&model).remove_stream_mode(name)?;
    Ok(Value::empty_map())
}

fn set_grammar_op(component: &Component, input: Value) -> Result<Value, OperatorError> {
    let context = "tvm_language_model: set_grammar";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;
    let mode = require_str(context, map, "mode")?;
    let grammar_type = require_str(context, map, "type")?;
    let spec = match grammar_type {
        "json" => GrammarSpec::Json,
        "json_schema" => GrammarSpec::JsonSchema(require_str(context, map, "schema")?.to_string()),
        "regex" => GrammarSpec::Regex(require_str(context, map, "pattern")?.to_string()),
        "ebnf" => GrammarSpec::Ebnf(require_str(context, map, "grammar")?.to_string()),
        other => {
            return Err(ValueError::new(
                context,
                "type",
                "json | json_schema | regex | ebnf",
                other,
            )
            .into())
        }
    };
    let model = model_of(component)?;
    lock_model(&model).set_grammar(mode, &spec)?;
    Ok(Value::empty_map())
}

fn reset_grammar_op(component: &Component, input: Value) -> Result<Value, OperatorError> {
    let context = "tvm_language_model: reset_grammar";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;
    let mode = require_str(context, map, "mode")?;
    let model = model_of(component)?;
    lock_model(&model).reset_grammar(mode);
    Ok(Value::empty_map())
}

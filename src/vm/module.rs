//! Module bundles: the operator/factory sets a VM is constructed with.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ErrorCode, OperatorError, RangeError, TypeError, ValueError};
use crate::value::{Value, ValueMap};
use crate::vm::calculator;
use crate::vm::component::{Component, ComponentFactory};
use crate::vm::operator::{InstantFunction, Method};

/// Immutable bundle of instant functions and component factories. The VM
/// imports an ordered list of modules; on a name collision the earlier
/// module wins.
#[derive(Default)]
pub struct Module {
    name: String,
    functions: BTreeMap<String, Arc<dyn InstantFunction>>,
    factories: BTreeMap<String, ComponentFactory>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
            factories: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_function(
        mut self,
        name: impl Into<String>,
        op: impl InstantFunction + 'static,
    ) -> Self {
        self.functions.insert(name.into(), Arc::new(op));
        self
    }

    pub fn with_factory(
        mut self,
        type_name: impl Into<String>,
        factory: impl Fn(Value) -> Result<Component, OperatorError> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(type_name.into(), Arc::new(factory));
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, &Arc<dyn InstantFunction>)> {
        self.functions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn factories(&self) -> impl Iterator<Item = (&str, &ComponentFactory)> {
        self.factories.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The default module: `echo`, `calculator`, `http_request`,
/// `generate_uuid`, and the `accumulator` example component.
pub fn builtin_module() -> Module {
    Module::new("builtin")
        .with_function("echo", echo_op)
        .with_function("calculator", calculator_op)
        .with_function("http_request", http_request_op)
        .with_function("generate_uuid", generate_uuid_op)
        .with_factory("accumulator", accumulator_factory)
}

fn echo_op(input: Value) -> Result<Value, OperatorError> {
    Ok(input)
}

fn generate_uuid_op(_input: Value) -> Result<Value, OperatorError> {
    Ok(Value::Str(crate::generate_uuid()))
}

fn calculator_op(input: Value) -> Result<Value, OperatorError> {
    let context = "calculator";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;
    let expression = map
        .get("expression")
        .ok_or_else(|| RangeError::new(context, "expression"))?;
    let expression = expression
        .as_str()
        .ok_or_else(|| TypeError::new(context, "expression", "string", expression.kind().as_str()))?;
    let value = calculator::evaluate(expression)
        .map_err(|err| OperatorError::new(ErrorCode::ValueError, err.to_string()))?;
    Ok(Value::Map(ValueMap::new().with("value", Value::Double(value))))
}

fn http_request_op(input: Value) -> Result<Value, OperatorError> {
    let context = "http_request";
    let map = input
        .as_map()
        .ok_or_else(|| TypeError::new(context, "in", "map", input.kind().as_str()))?;

    let url = map
        .get("url")
        .ok_or_else(|| RangeError::new(context, "url"))?
        .as_str()
        .ok_or_else(|| TypeError::new(context, "url", "string", "other"))?;
    let method = map
        .get("method")
        .ok_or_else(|| RangeError::new(context, "method"))?
        .as_str()
        .ok_or_else(|| TypeError::new(context, "method", "string", "other"))?;
    if !matches!(method, "GET" | "POST" | "PUT" | "DELETE") {
        return Err(ValueError::new(context, "method", "GET | POST | PUT | DELETE", method).into());
    }

    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(30))
        .build();
    let mut request = agent.request(method, url);
    if let Some(headers) = map.get("headers") {
        let headers = headers
            .as_map()
            .ok_or_else(|| TypeError::new(context, "headers", "map", headers.kind().as_str()))?;
        for (key, value) in headers.iter() {
            let value = value
                .as_str()
                .ok_or_else(|| TypeError::new(context, "headers", "string values", value.kind().as_str()))?;
            request = request.set(key, value);
        }
    }

    let body = match map.get("body") {
        None => None,
        Some(value) => Some(
            value
                .as_str()
                .ok_or_else(|| TypeError::new(context, "body", "string", value.kind().as_str()))?,
        ),
    };

    let response = match body {
        Some(body) if !body.is_empty() => request.send_string(body),
        _ => request.call(),
    };
    // An HTTP error status is still a response; only transport failures are
    // operator errors.
    let response = match response {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => return Err(OperatorError::new(ErrorCode::ValueError, err.to_string())),
    };

    let status_code = response.status();
    let mut header_map = ValueMap::new();
    for name in response.headers_names() {
        if let Some(value) = response.header(&name) {
            header_map.insert(name, value);
        }
    }
    let mut raw = Vec::new();
    std::io::Read::read_to_end(&mut response.into_reader(), &mut raw)
        .map_err(|err| OperatorError::new(ErrorCode::ValueError, err.to_string()))?;

    Ok(Value::Map(
        ValueMap::new()
            .with("status_code", Value::Uint(status_code as u64))
            .with("headers", Value::Map(header_map))
            .with("body", Value::Bytes(Bytes::from(raw))),
    ))
}

/// Example component used by smoke tests and demos: accumulates strings.
fn accumulator_factory(attrs: Value) -> Result<Component, OperatorError> {
    let context = "accumulator";
    let base = match &attrs {
        Value::Null => String::new(),
        Value::Str(base) => base.clone(),
        other => return Err(TypeError::new(context, "in", "string", other.kind().as_str()).into()),
    };
    let state = Arc::new(Mutex::new((base, 0u64)));

    let put = {
        let state = Arc::clone(&state);
        move |_c: &Component, input: Value| -> Result<Value, OperatorError> {
            let text = input
                .as_str()
                .ok_or_else(|| TypeError::new("accumulator.put", "in", "string", input.kind().as_str()))?;
            let mut guard = match state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.0.push_str(text);
            guard.1 += 1;
            Ok(Value::empty_map())
        }
    };
    let get = {
        let state = Arc::clone(&state);
        move |_c: &Component, _input: Value| -> Result<Value, OperatorError> {
            let guard = match state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Ok(Value::Str(guard.0.clone()))
        }
    };
    let count = {
        let state = Arc::clone(&state);
        move |_c: &Component, _input: Value| -> Result<Value, OperatorError> {
            let guard = match state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Ok(Value::Uint(guard.1))
        }
    };

    Ok(Component::new()
        .with_method("put", Method::instant(put))
        .with_method("get", Method::instant(get))
        .with_method("count", Method::instant(count)))
}

//! Chat message validation and the normalization pipeline.
//!
//! The pipeline is a fixed sequence of pure `Value → Value` rewrites run
//! before template rendering:
//!
//! 1. drop explicit-null part fields
//! 2. strip tool-call ids
//! 3. inject a default reasoning part on assistant messages (reasoning runs only)
//! 4. melt reasoning into the content stream
//! 5. merge consecutive text parts
//! 6. collapse single-text content arrays to bare strings

use crate::error::{OperatorError, RangeError, TypeError, ValueError};
use crate::value::{Value, ValueMap};

const ROLES: [&str; 4] = ["system", "user", "assistant", "tool"];
const PART_KEYS: [&str; 3] = ["reasoning", "content", "tool_calls"];

const BOR_DELIMITER: &str = "<think>";
const EOR_DELIMITER: &str = "</think>\n\n";
const DEFAULT_REASONING: &str = "\n\n";

/// Structural validation of a `messages` array. Explicit nulls for part
/// fields are tolerated (the pipeline drops them).
pub fn validate_messages(context: &str, messages: &Value) -> Result<(), OperatorError> {
    let messages = messages
        .as_array()
        .ok_or_else(|| TypeError::new(context, "messages", "array", messages.kind().as_str()))?;
    for message in messages {
        let map = message
            .as_map()
            .ok_or_else(|| TypeError::new(context, "messages.*", "map", message.kind().as_str()))?;
        let role = map
            .get("role")
            .ok_or_else(|| RangeError::new(context, "role"))?;
        let role = role
            .as_str()
            .ok_or_else(|| TypeError::new(context, "role", "string", role.kind().as_str()))?;
        if !ROLES.contains(&role) {
            return Err(
                ValueError::new(context, "role", "system | user | assistant | tool", role).into(),
            );
        }
        for key in PART_KEYS {
            let Some(parts) = map.get(key) else {
                continue;
            };
            if parts.is_null() {
                continue;
            }
            let parts = parts
                .as_array()
                .ok_or_else(|| TypeError::new(context, key, "array", parts.kind().as_str()))?;
            for (index, part) in parts.iter().enumerate() {
                let field = format!("{key}/{index}");
                let part = part
                    .as_map()
                    .ok_or_else(|| TypeError::new(context, &field, "map", part.kind().as_str()))?;
                let part_type = part
                    .get("type")
                    .ok_or_else(|| RangeError::new(context, format!("{field}/type")))?;
                let part_type = part_type.as_str().ok_or_else(|| {
                    TypeError::new(context, format!("{field}/type"), "string", part_type.kind().as_str())
                })?;
                match part_type {
                    "text" => {
                        let text = part
                            .get("text")
                            .ok_or_else(|| RangeError::new(context, format!("{field}/text")))?;
                        if text.as_str().is_none() {
                            return Err(TypeError::new(
                                context,
                                format!("{field}/text"),
                                "string",
                                text.kind().as_str(),
                            )
                            .into());
                        }
                    }
                    "function" => {
                        if part.get("function").is_none() {
                            return Err(RangeError::new(context, format!("{field}/function")).into());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Runs the full normalization pipeline in its fixed order.
pub fn normalize(conversation: &Value, enable_reasoning: bool) -> Value {
    let mut out = drop_null_parts(conversation);
    out = strip_tool_call_ids(&out);
    if enable_reasoning {
        out = put_default_reasoning(&out, DEFAULT_REASONING);
    }
    out = melt_reasoning(&out, BOR_DELIMITER, EOR_DELIMITER);
    out = merge_text_parts(&out);
    collapse_single_text(&out)
}

fn map_messages(conversation: &Value, f: impl Fn(&ValueMap) -> ValueMap) -> Value {
    let Some(messages) = conversation.as_array() else {
        return conversation.clone();
    };
    Value::Array(
        messages
            .iter()
            .map(|message| match message.as_map() {
                Some(map) => Value::Map(f(map)),
                None => message.clone(),
            })
            .collect(),
    )
}

/// Explicit `null` part fields behave as if absent.
pub fn drop_null_parts(conversation: &Value) -> Value {
    map_messages(conversation, |map| {
        let mut out = map.clone();
        for key in PART_KEYS {
            if out.get(key).is_some_and(Value::is_null) {
                out.remove(key);
            }
        }
        out
    })
}

/// Tool-call ids are a REST-adapter concern; local templates never see
/// them.
pub fn strip_tool_call_ids(conversation: &Value) -> Value {
    map_messages(conversation, |map| {
        let mut out = map.clone();
        let role = out.get("role").and_then(Value::as_str).unwrap_or("");
        if role == "assistant" {
            if let Some(parts) = out.get_mut("tool_calls").and_then(Value::as_array_mut) {
                for part in parts {
                    if let Some(part) = part.as_map_mut() {
                        part.remove("id");
                    }
                }
            }
        } else if role == "tool" {
            if let Some(parts) = out.get_mut("content").and_then(Value::as_array_mut) {
                for part in parts {
                    if let Some(part) = part.as_map_mut() {
                        part.remove("tool_call_id");
                    }
                }
            }
        }
        out
    })
}

/// Assistant messages that carry content or tool calls but no reasoning get
/// a default reasoning part, so reasoning-aware templates stay balanced.
pub fn put_default_reasoning(conversation: &Value, text: &str) -> Value {
    map_messages(conversation, |map| {
        let mut out = map.clone();
        let is_assistant = out.get("role").and_then(Value::as_str) == Some("assistant");
        let has_payload = out.contains_key("content") || out.contains_key("tool_calls");
        if is_assistant && has_payload && !out.contains_key("reasoning") {
            out.insert(
                "reasoning",
                Value::Array(vec![text_part(text)]),
            );
        }
        out
    })
}

/// Folds the reasoning field into the head of the content stream, wrapped
/// in the reasoning delimiters. The reasoning key does not survive.
pub fn melt_reasoning(conversation: &Value, bor: &str, eor: &str) -> Value {
    map_messages(conversation, |map| {
        let mut out = ValueMap::new();
        for (key, value) in map.iter() {
            if key == "reasoning" || key == "content" {
                continue;
            }
            out.insert(key, value.clone());
        }

        let reasoning_text = map
            .get("reasoning")
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str)
            .map(|text| format!("{bor}{text}{eor}"))
            .unwrap_or_default();

        let mut content: Vec<Value> = map
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        content.insert(0, text_part(&reasoning_text));
        out.insert("content", Value::Array(content));
        out
    })
}

/// Adjacent text parts concatenate; other part types break runs.
pub fn merge_text_parts(conversation: &Value) -> Value {
    map_messages(conversation, |map| {
        let mut out = map.clone();
        for key in ["content", "reasoning"] {
            let Some(parts) = out.get(key).and_then(Value::as_array).cloned() else {
                continue;
            };
            let mut merged: Vec<Value> = Vec::with_capacity(parts.len());
            for part in parts {
                let both_text = is_text_part(&part)
                    && merged.last().map(is_text_part).unwrap_or(false);
                if both_text {
                    let addition = part
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    if let Some(text) = merged
                        .last_mut()
                        .and_then(Value::as_map_mut)
                        .and_then(|m| m.get_mut("text"))
                    {
                        if let Value::Str(existing) = text {
                            existing.push_str(&addition);
                        }
                    }
                    continue;
                }
                merged.push(part);
            }
            out.insert(key, Value::Array(merged));
        }
        out
    })
}

/// A content array holding exactly one text part collapses to a bare
/// string; anything else stays structured.
pub fn collapse_single_text(conversation: &Value) -> Value {
    map_messages(conversation, |map| {
        let mut out = map.clone();
        let collapsed = out
            .get("content")
            .and_then(Value::as_array)
            .filter(|parts| parts.len() == 1)
            .and_then(|parts| parts.first())
            .filter(|part| is_text_part(part))
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(text) = collapsed {
            out.insert("content", Value::Str(text));
        }
        out
    })
}

fn text_part(text: &str) -> Value {
    Value::Map(ValueMap::new().with("type", "text").with("text", text))
}

fn is_text_part(part: &Value) -> bool {
    part.get("type").and_then(Value::as_str) == Some("text")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: &str, fields: ValueMap) -> Value {
        let mut map = ValueMap::new().with("role", role);
        for (key, value) in fields {
            map.insert(key, value);
        }
        Value::Map(map)
    }

    fn text_content(text: &str) -> Value {
        Value::Array(vec![text_part(text)])
    }

    #[test]
    fn validate_accepts_wellformed_conversations() {
        let messages = Value::Array(vec![
            message("system", ValueMap::new().with("content", text_content("be brief"))),
            message("user", ValueMap::new().with("content", text_content("hi"))),
        ]);
        validate_messages("infer", &messages).expect("valid");
    }

    #[test]
    fn validate_rejects_unknown_roles_and_bad_parts() {
        let messages = Value::Array(vec![message("robot", ValueMap::new())]);
        let err = validate_messages("infer", &messages).expect_err("role");
        assert!(err.reason().contains("role"));

        let missing_text = Value::Array(vec![message(
            "user",
            ValueMap::new().with(
                "content",
                Value::Array(vec![Value::Map(ValueMap::new().with("type", "text"))]),
            ),
        )]);
        assert!(validate_messages("infer", &missing_text).is_err());
    }

    #[test]
    fn strip_removes_tool_call_ids_everywhere() {
        let conversation = Value::Array(vec![
            message(
                "assistant",
                ValueMap::new().with(
                    "tool_calls",
                    Value::Array(vec![Value::Map(
                        ValueMap::new()
                            .with("type", "function")
                            .with("id", "call_1")
                            .with("function", Value::empty_map()),
                    )]),
                ),
            ),
            message(
                "tool",
                ValueMap::new().with(
                    "content",
                    Value::Array(vec![Value::Map(
                        ValueMap::new()
                            .with("type", "text")
                            .with("text", "42")
                            .with("tool_call_id", "call_1"),
                    )]),
                ),
            ),
        ]);
        let out = strip_tool_call_ids(&conversation);
        let calls = out.at(0).and_then(|m| m.get("tool_calls")).expect("calls");
        assert!(calls.at(0).and_then(|c| c.get("id")).is_none());
        let content = out.at(1).and_then(|m| m.get("content")).expect("content");
        assert!(content.at(0).and_then(|c| c.get("tool_call_id")).is_none());
    }

    #[test]
    fn pipeline_melts_reasoning_and_collapses_text() {
        let conversation = Value::Array(vec![
            message("user", ValueMap::new().with("content", text_content("hi"))),
            message(
                "assistant",
                ValueMap::new()
                    .with("reasoning", text_content("thinking..."))
                    .with("content", text_content("hello")),
            ),
        ]);
        let out = normalize(&conversation, true);

        // user: empty reasoning prefix merges away, then collapses to a string
        assert_eq!(
            out.at(0).and_then(|m| m.get("content")).and_then(Value::as_str),
            Some("hi")
        );
        // assistant: reasoning is wrapped and fused into the content string
        let content = out
            .at(1)
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .expect("collapsed");
        assert_eq!(content, "<think>thinking...</think>\n\nhello");
        assert!(out.at(1).and_then(|m| m.get("reasoning")).is_none());
    }

    #[test]
    fn default_reasoning_injected_only_when_enabled() {
        let conversation = Value::Array(vec![message(
            "assistant",
            ValueMap::new().with("content", text_content("hello")),
        )]);
        let with = normalize(&conversation, true);
        assert_eq!(
            with.at(0).and_then(|m| m.get("content")).and_then(Value::as_str),
            Some("<think>\n\n</think>\n\nhello")
        );
        let without = normalize(&conversation, false);
        assert_eq!(
            without.at(0).and_then(|m| m.get("content")).and_then(Value::as_str),
            Some("hello")
        );
    }

    #[test]
    fn multi_part_content_stays_structured() {
        let conversation = Value::Array(vec![message(
            "user",
            ValueMap::new().with(
                "content",
                Value::Array(vec![
                    text_part("look at "),
                    Value::Map(ValueMap::new().with("type", "image").with("image", "ref")),
                ]),
            ),
        )]);
        let out = normalize(&conversation, false);
        let content = out.at(0).and_then(|m| m.get("content")).expect("content");
        assert_eq!(content.as_array().map(Vec::len), Some(2));
    }
}

//! Gemini `generateContent` wire mapping shared by the Vertex client.

use std::collections::{HashMap, VecDeque};

use serde_json::{Map, Value, json};

use crate::types::{
    ContentPart, FinishReason, GenerateRequest, ImageSource, Message, Role, StreamChunk, Tool,
    ToolChoice, Usage, Warning,
};
use crate::utils::params;
use crate::{DittoError, Result};

const MAX_STOP_SEQUENCES: usize = 5;
const MAX_LABEL_CHARS: usize = 63;

/// Schema keywords the Gemini function-declaration schema rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "additionalProperties",
    "examples",
];

/// Builds the JSON body for `generateContent` / `streamGenerateContent`.
pub(crate) fn build_request_body(
    model: &str,
    request: &GenerateRequest,
    warnings: &mut Vec<Warning>,
) -> Result<Value> {
    let (contents, system_instruction) = convert_messages(model, &request.messages, warnings)?;

    let mut body = Map::<String, Value>::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system_instruction) = system_instruction {
        body.insert("systemInstruction".to_string(), system_instruction);
    }

    let generation_config = generation_config(request, warnings);
    if !generation_config.is_empty() {
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
        if cfg!(feature = "tools") {
            let declarations = tools.iter().map(function_declaration).collect::<Vec<_>>();
            body.insert(
                "tools".to_string(),
                json!([{ "functionDeclarations": declarations }]),
            );
            if let Some(choice) = request.tool_choice.as_ref() {
                body.insert("toolConfig".to_string(), tool_config(choice));
            }
        } else {
            warnings.push(Warning::Unsupported {
                feature: "tools".to_string(),
                details: Some("built without the tools feature".to_string()),
            });
        }
    }

    if let Some(user) = request.user.as_deref() {
        match label_value(user) {
            Some(value) => {
                body.insert("labels".to_string(), json!({ "user": value }));
            }
            None => warnings.push(Warning::Compatibility {
                feature: "user".to_string(),
                details: "user id is not a valid Vertex label value; not forwarded".to_string(),
            }),
        }
    }

    Ok(Value::Object(body))
}

fn generation_config(request: &GenerateRequest, warnings: &mut Vec<Warning>) -> Map<String, Value> {
    let mut config = Map::<String, Value>::new();
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }

    let sampling = [
        ("temperature", "temperature", request.temperature, 0.0, 2.0),
        ("top_p", "topP", request.top_p, 0.0, 1.0),
        (
            "frequency_penalty",
            "frequencyPenalty",
            request.frequency_penalty,
            -2.0,
            2.0,
        ),
        (
            "presence_penalty",
            "presencePenalty",
            request.presence_penalty,
            -2.0,
            2.0,
        ),
    ];
    for (name, key, value, min, max) in sampling {
        let Some(value) = value else { continue };
        if let Some(number) = params::clamp_param(name, value, min, max, warnings) {
            config.insert(key.to_string(), Value::Number(number));
        }
    }

    if let Some(stop) = request.stop_sequences.as_deref() {
        let stop = params::stop_sequences(stop, MAX_STOP_SEQUENCES, warnings);
        if !stop.is_empty() {
            config.insert("stopSequences".to_string(), Value::from(stop));
        }
    }
    config
}

/// Splits messages into Gemini `contents` and an optional `systemInstruction`.
///
/// Gemma models have no system instruction support, so their system text is
/// prepended to the first user turn instead.
pub(crate) fn convert_messages(
    model: &str,
    messages: &[Message],
    warnings: &mut Vec<Warning>,
) -> Result<(Vec<Value>, Option<Value>)> {
    let tool_names = tool_names_by_call_id(messages);
    let mut system_texts = Vec::<String>::new();
    let mut contents = Vec::<Value>::new();

    for message in messages {
        if message.role == Role::System {
            if !contents.is_empty() {
                return Err(DittoError::InvalidResponse(
                    "system messages must precede all other messages".to_string(),
                ));
            }
            let text = system_text(message, warnings);
            if !text.trim().is_empty() {
                system_texts.push(text);
            }
            continue;
        }

        let (role, parts) = match message.role {
            Role::User => ("user", user_parts(message, warnings)),
            Role::Assistant => ("model", assistant_parts(message, warnings)),
            Role::Tool => ("user", tool_result_parts(message, &tool_names, warnings)),
            Role::System => continue,
        };
        if !parts.is_empty() {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }

    if system_texts.is_empty() {
        return Ok((contents, None));
    }

    if model.to_ascii_lowercase().starts_with("gemma-") {
        let prefix = format!("{}\n\n", system_texts.join("\n\n"));
        match contents
            .first_mut()
            .filter(|first| first["role"] == "user")
            .and_then(|first| first["parts"].as_array_mut())
        {
            Some(parts) => parts.insert(0, json!({ "text": prefix })),
            None => contents.insert(0, json!({ "role": "user", "parts": [{ "text": prefix }] })),
        }
        return Ok((contents, None));
    }

    let parts = system_texts
        .into_iter()
        .map(|text| json!({ "text": text }))
        .collect::<Vec<_>>();
    Ok((contents, Some(json!({ "parts": parts }))))
}

fn tool_names_by_call_id(messages: &[Message]) -> HashMap<&str, &str> {
    messages
        .iter()
        .flat_map(|message| message.content.iter())
        .filter_map(|part| match part {
            ContentPart::ToolCall { id, name, .. } => Some((id.as_str(), name.as_str())),
            _ => None,
        })
        .collect()
}

fn unsupported(role: &str, part: &ContentPart, warnings: &mut Vec<Warning>) {
    warnings.push(Warning::Unsupported {
        feature: format!("{role}_content_part"),
        details: Some(format!("dropped unsupported {role} content part: {part:?}")),
    });
}

fn system_text(message: &Message, warnings: &mut Vec<Warning>) -> String {
    let mut text = String::new();
    for part in &message.content {
        match part {
            ContentPart::Text { text: chunk } => text.push_str(chunk),
            other => unsupported("system", other, warnings),
        }
    }
    text
}

fn user_parts(message: &Message, warnings: &mut Vec<Warning>) -> Vec<Value> {
    let mut parts = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::Text { text } if text.is_empty() => {}
            ContentPart::Text { text } => parts.push(json!({ "text": text })),
            ContentPart::Image {
                source: ImageSource::Base64 { media_type, data },
            } => parts.push(json!({ "inlineData": { "mimeType": media_type, "data": data } })),
            ContentPart::Image {
                source: ImageSource::Url { url },
            } => parts.push(json!({
                "fileData": { "mimeType": guess_image_mime(url), "fileUri": url }
            })),
            other => unsupported("user", other, warnings),
        }
    }
    parts
}

fn assistant_parts(message: &Message, warnings: &mut Vec<Warning>) -> Vec<Value> {
    let mut parts = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::Text { text } if text.is_empty() => {}
            ContentPart::Text { text } => parts.push(json!({ "text": text })),
            ContentPart::ToolCall {
                name, arguments, ..
            } => parts.push(json!({ "functionCall": { "name": name, "args": arguments } })),
            other => unsupported("assistant", other, warnings),
        }
    }
    parts
}

fn tool_result_parts(
    message: &Message,
    tool_names: &HashMap<&str, &str>,
    warnings: &mut Vec<Warning>,
) -> Vec<Value> {
    let mut parts = Vec::new();
    for part in &message.content {
        let ContentPart::ToolResult {
            tool_call_id,
            content,
        } = part
        else {
            unsupported("tool", part, warnings);
            continue;
        };
        let Some(name) = tool_names.get(tool_call_id.as_str()) else {
            warnings.push(Warning::Compatibility {
                feature: "tool_result".to_string(),
                details: format!("no tool call with id {tool_call_id}; result dropped"),
            });
            continue;
        };
        parts.push(json!({
            "functionResponse": {
                "name": name,
                "response": { "name": name, "content": content }
            }
        }));
    }
    parts
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

pub(crate) fn function_declaration(tool: &Tool) -> Value {
    let mut declaration = Map::<String, Value>::new();
    declaration.insert("name".to_string(), Value::String(tool.name.clone()));
    declaration.insert(
        "description".to_string(),
        Value::String(tool.description.clone().unwrap_or_default()),
    );
    if let Some(parameters) = sanitize_schema(&tool.parameters) {
        declaration.insert("parameters".to_string(), parameters);
    }
    Value::Object(declaration)
}

/// Drops keywords Gemini rejects. An object schema with no properties is
/// omitted entirely since the API refuses empty `properties`.
fn sanitize_schema(schema: &Value) -> Option<Value> {
    fn strip(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), strip(value)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(strip).collect()),
            other => other.clone(),
        }
    }

    let map = schema.as_object()?;
    let is_empty_object = map.get("type").and_then(Value::as_str) == Some("object")
        && map
            .get("properties")
            .and_then(Value::as_object)
            .is_none_or(Map::is_empty);
    if is_empty_object {
        return None;
    }
    Some(strip(schema))
}

pub(crate) fn tool_config(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Auto => json!({ "mode": "AUTO" }),
        ToolChoice::None => json!({ "mode": "NONE" }),
        ToolChoice::Required => json!({ "mode": "ANY" }),
        ToolChoice::Tool { name } => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
    };
    json!({ "functionCallingConfig": config })
}

/// Vertex label values: lowercase letters, digits, `_` and `-`, at most 63
/// characters. Uppercase input is lowered; anything else is rejected.
fn label_value(raw: &str) -> Option<String> {
    let value = raw.trim().to_lowercase();
    let valid = !value.is_empty()
        && value.chars().count() <= MAX_LABEL_CHARS
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    valid.then_some(value)
}

pub(crate) fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("STOP") if has_tool_calls => FinishReason::ToolCalls,
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some(
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY",
        ) => FinishReason::ContentFilter,
        Some("MALFORMED_FUNCTION_CALL") => FinishReason::Error,
        _ => FinishReason::Unknown,
    }
}

pub(crate) fn parse_usage_metadata(value: &Value) -> Usage {
    let count = |key: &str| value.get(key).and_then(Value::as_u64);
    let mut usage = Usage {
        input_tokens: count("promptTokenCount"),
        output_tokens: count("candidatesTokenCount"),
        total_tokens: count("totalTokenCount"),
    };
    usage.merge_total();
    usage
}

fn first_candidate(response: &Value) -> Option<&Value> {
    response.get("candidates")?.as_array()?.first()
}

fn candidate_parts(candidate: &Value) -> &[Value] {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn next_call_id(seq: &mut u64) -> String {
    let id = format!("call_{seq}");
    *seq += 1;
    id
}

/// Parsed non-streaming `generateContent` response.
pub(crate) struct ParsedResponse {
    pub content: Vec<ContentPart>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

pub(crate) fn parse_generate_response(response: &Value) -> ParsedResponse {
    let mut content = Vec::new();
    let mut seq = 0u64;
    let candidate = first_candidate(response);

    for part in candidate.map(candidate_parts).unwrap_or_default() {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                content.push(ContentPart::Text {
                    text: text.to_string(),
                });
            }
        } else if let Some(call) = part.get("functionCall") {
            let Some(name) = call.get("name").and_then(Value::as_str) else {
                continue;
            };
            content.push(ContentPart::ToolCall {
                id: next_call_id(&mut seq),
                name: name.to_string(),
                arguments: call.get("args").cloned().unwrap_or(Value::Null),
            });
        }
    }

    let has_tool_calls = seq > 0;
    let reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str);
    ParsedResponse {
        content,
        finish_reason: map_finish_reason(reason, has_tool_calls),
        usage: response
            .get("usageMetadata")
            .map(parse_usage_metadata)
            .unwrap_or_default(),
    }
}

/// Accumulates `streamGenerateContent` SSE events into [`StreamChunk`]s.
/// Text parts are already deltas and are forwarded unchanged.
#[derive(Default)]
pub(crate) struct StreamState {
    tool_call_seq: u64,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl StreamState {
    pub(crate) fn push_event(&mut self, event: &Value, out: &mut VecDeque<Result<StreamChunk>>) {
        if let Some(usage) = event.get("usageMetadata") {
            self.usage = Some(parse_usage_metadata(usage));
        }
        let Some(candidate) = first_candidate(event) else {
            return;
        };
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        for part in candidate_parts(candidate) {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push_back(Ok(StreamChunk::TextDelta {
                        text: text.to_string(),
                    }));
                }
            } else if let Some(call) = part.get("functionCall") {
                let Some(name) = call.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let id = next_call_id(&mut self.tool_call_seq);
                let arguments = call.get("args").cloned().unwrap_or(Value::Null);
                out.push_back(Ok(StreamChunk::ToolCallStart {
                    id: id.clone(),
                    name: name.to_string(),
                }));
                out.push_back(Ok(StreamChunk::ToolCallDelta {
                    id,
                    arguments_delta: arguments.to_string(),
                }));
            }
        }
    }

    pub(crate) fn finish(&mut self, out: &mut VecDeque<Result<StreamChunk>>) {
        if let Some(usage) = self.usage.take() {
            out.push_back(Ok(StreamChunk::Usage(usage)));
        }
        out.push_back(Ok(StreamChunk::FinishReason {
            finish_reason: map_finish_reason(self.finish_reason.as_deref(), self.tool_call_seq > 0),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_body_with_system_tools_and_labels() -> Result<()> {
        let request = GenerateRequest {
            messages: vec![
                Message::system("be brief"),
                Message::user("weather in Paris?"),
            ],
            temperature: Some(3.5),
            top_p: Some(0.9),
            max_tokens: Some(256),
            stop_sequences: Some(vec!["END".to_string(), " END ".to_string()]),
            presence_penalty: Some(0.5),
            tools: Some(vec![Tool {
                name: "get_weather".to_string(),
                description: Some("weather lookup".to_string()),
                parameters: json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                }),
            }]),
            tool_choice: Some(ToolChoice::Required),
            user: Some("User_42".to_string()),
            ..GenerateRequest::default()
        };

        let mut warnings = Vec::new();
        let body = build_request_body("gemini-1.5-pro", &request, &mut warnings)?;

        assert_eq!(
            body["systemInstruction"],
            json!({ "parts": [{ "text": "be brief" }] })
        );
        assert_eq!(
            body["contents"],
            json!([{ "role": "user", "parts": [{ "text": "weather in Paris?" }] }])
        );
        assert_eq!(body["generationConfig"]["temperature"], json!(2.0));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], json!(256));
        assert_eq!(body["generationConfig"]["presencePenalty"], json!(0.5));
        assert_eq!(body["generationConfig"]["stopSequences"], json!(["END"]));
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["parameters"],
            json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })
        );
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(body["labels"], json!({ "user": "user_42" }));
        assert!(warnings.iter().any(|w| matches!(
            w,
            Warning::Clamped { parameter, .. } if parameter == "temperature"
        )));
        Ok(())
    }

    #[test]
    fn tool_round_trip_maps_call_ids_to_names() -> Result<()> {
        let messages = vec![
            Message::user("add"),
            Message {
                role: Role::Assistant,
                content: vec![ContentPart::ToolCall {
                    id: "call_9".to_string(),
                    name: "add".to_string(),
                    arguments: json!({ "a": 1 }),
                }],
            },
            Message {
                role: Role::Tool,
                content: vec![
                    ContentPart::ToolResult {
                        tool_call_id: "call_9".to_string(),
                        content: "2".to_string(),
                    },
                    ContentPart::ToolResult {
                        tool_call_id: "missing".to_string(),
                        content: "?".to_string(),
                    },
                ],
            },
        ];
        let mut warnings = Vec::new();
        let (contents, system) = convert_messages("gemini-2.0-flash", &messages, &mut warnings)?;
        assert!(system.is_none());
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "add");
        assert_eq!(
            contents[2]["parts"],
            json!([{ "functionResponse": {
                "name": "add",
                "response": { "name": "add", "content": "2" }
            } }])
        );
        assert_eq!(warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn late_system_message_is_rejected() {
        let messages = vec![Message::user("hi"), Message::system("late")];
        assert!(convert_messages("gemini-1.5-pro", &messages, &mut Vec::new()).is_err());
    }

    #[test]
    fn gemma_folds_system_text_into_first_user_turn() -> Result<()> {
        let messages = vec![Message::system("rules"), Message::user("hi")];
        let (contents, system) = convert_messages("gemma-2-9b-it", &messages, &mut Vec::new())?;
        assert!(system.is_none());
        assert_eq!(
            contents[0]["parts"],
            json!([{ "text": "rules\n\n" }, { "text": "hi" }])
        );
        Ok(())
    }

    #[test]
    fn invalid_label_values_are_not_forwarded() -> Result<()> {
        let request = GenerateRequest {
            messages: vec![Message::user("hi")],
            user: Some("alice@example.com".to_string()),
            ..GenerateRequest::default()
        };
        let mut warnings = Vec::new();
        let body = build_request_body("gemini-1.5-pro", &request, &mut warnings)?;
        assert!(body.get("labels").is_none());
        assert_eq!(warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn parses_generate_response() {
        let parsed = parse_generate_response(&json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "text": "Looking it up." },
                    { "functionCall": { "name": "get_weather", "args": { "city": "Paris" } } }
                ] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 5 }
        }));
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.usage.total_tokens, Some(17));
        assert_eq!(
            parsed.content[1],
            ContentPart::ToolCall {
                id: "call_0".to_string(),
                name: "get_weather".to_string(),
                arguments: json!({ "city": "Paris" }),
            }
        );
    }

    #[test]
    fn stream_state_forwards_text_deltas_then_usage_and_finish() {
        let mut state = StreamState::default();
        let mut out = VecDeque::new();
        state.push_event(
            &json!({ "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }] }),
            &mut out,
        );
        state.push_event(
            &json!({ "candidates": [{ "content": { "parts": [{ "text": "lo" }] } }] }),
            &mut out,
        );
        state.push_event(
            &json!({
                "candidates": [{ "content": { "parts": [{ "text": "!" }] }, "finishReason": "STOP" }],
                "usageMetadata": { "promptTokenCount": 1, "candidatesTokenCount": 2, "totalTokenCount": 3 }
            }),
            &mut out,
        );
        state.finish(&mut out);

        let chunks = out.into_iter().collect::<Result<Vec<_>>>().expect("chunks");
        assert_eq!(
            chunks,
            vec![
                StreamChunk::TextDelta {
                    text: "Hel".to_string()
                },
                StreamChunk::TextDelta {
                    text: "lo".to_string()
                },
                StreamChunk::TextDelta {
                    text: "!".to_string()
                },
                StreamChunk::Usage(Usage {
                    input_tokens: Some(1),
                    output_tokens: Some(2),
                    total_tokens: Some(3),
                }),
                StreamChunk::FinishReason {
                    finish_reason: FinishReason::Stop
                },
            ]
        );
    }

    #[test]
    fn deltas_that_repeat_earlier_text_are_forwarded_whole() {
        let mut state = StreamState::default();
        let mut out = VecDeque::new();
        for text in ["a", "ab", ".", "."] {
            state.push_event(
                &json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] }),
                &mut out,
            );
        }
        let texts = out
            .into_iter()
            .filter_map(|chunk| match chunk {
                Ok(StreamChunk::TextDelta { text }) => Some(text),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(texts, "aab..");
    }
}

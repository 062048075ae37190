//! OpenAI-style chat payload accepted by the chat route.
//!
//! Only structural parsing happens here; semantic validation (model names,
//! token limits) is left to the provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ContentPart, GenerateRequest, ImageSource, Message, Role, Tool, ToolChoice};
use crate::{DittoError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatStreamPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<ChatStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ChatToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    #[serde(alias = "developer")]
    System,
    User,
    Assistant,
    #[serde(alias = "function")]
    Tool,
}

impl From<ChatRole> for Role {
    fn from(role: ChatRole) -> Self {
        match role {
            ChatRole::System => Role::System,
            ChatRole::User => Role::User,
            ChatRole::Assistant => Role::Assistant,
            ChatRole::Tool => Role::Tool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ChatImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatToolChoice {
    Mode(String),
    Function {
        #[serde(rename = "type", default = "function_kind")]
        kind: String,
        function: ChatToolChoiceFunction,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolChoiceFunction {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatStop {
    One(String),
    Many(Vec<String>),
}

fn function_kind() -> String {
    "function".to_string()
}

impl ChatStreamPayload {
    /// Streaming is the default; only an explicit `"stream": false` asks for a
    /// completed response.
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }

    pub fn to_generate_request(&self) -> Result<GenerateRequest> {
        let messages = self
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>>>()?;

        let tools = self.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| Tool {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    parameters: tool.function.parameters.clone().unwrap_or(Value::Null),
                })
                .collect::<Vec<_>>()
        });

        let tool_choice = match self.tool_choice.as_ref() {
            None => None,
            Some(ChatToolChoice::Mode(mode)) => match mode.as_str() {
                "auto" => Some(ToolChoice::Auto),
                "none" => Some(ToolChoice::None),
                "required" => Some(ToolChoice::Required),
                other => {
                    return Err(DittoError::InvalidResponse(format!(
                        "unsupported tool_choice {other:?}"
                    )));
                }
            },
            Some(ChatToolChoice::Function { function, .. }) => Some(ToolChoice::Tool {
                name: function.name.clone(),
            }),
        };

        let stop_sequences = self.stop.as_ref().map(|stop| match stop {
            ChatStop::One(value) => vec![value.clone()],
            ChatStop::Many(values) => values.clone(),
        });

        Ok(GenerateRequest {
            messages,
            model: Some(self.model.clone()).filter(|model| !model.trim().is_empty()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            stop_sequences,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            tools,
            tool_choice,
            user: None,
        })
    }
}

fn convert_message(message: &ChatMessage) -> Result<Message> {
    let role = Role::from(message.role);
    let mut content = Vec::<ContentPart>::new();

    if role == Role::Tool {
        let tool_call_id = message.tool_call_id.clone().ok_or_else(|| {
            DittoError::InvalidResponse("tool message is missing tool_call_id".to_string())
        })?;
        content.push(ContentPart::ToolResult {
            tool_call_id,
            content: content_text(message.content.as_ref()),
        });
        return Ok(Message { role, content });
    }

    match message.content.as_ref() {
        None => {}
        Some(ChatContent::Text(text)) => content.push(ContentPart::Text { text: text.clone() }),
        Some(ChatContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ChatContentPart::Text { text } => {
                        content.push(ContentPart::Text { text: text.clone() })
                    }
                    ChatContentPart::ImageUrl { image_url } => content.push(ContentPart::Image {
                        source: image_source_from_url(&image_url.url),
                    }),
                }
            }
        }
    }

    for call in message.tool_calls.iter().flatten() {
        let arguments = if call.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| Value::String(call.function.arguments.clone()))
        };
        content.push(ContentPart::ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments,
        });
    }

    Ok(Message { role, content })
}

fn content_text(content: Option<&ChatContent>) -> String {
    match content {
        None => String::new(),
        Some(ChatContent::Text(text)) => text.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ChatContentPart::Text { text } => Some(text.as_str()),
                ChatContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

/// `data:<mime>;base64,<payload>` becomes inline data, anything else a URL.
fn image_source_from_url(url: &str) -> ImageSource {
    let inline = url.strip_prefix("data:").and_then(|rest| {
        let (meta, data) = rest.split_once(',')?;
        let media_type = meta.strip_suffix(";base64")?;
        Some(ImageSource::Base64 {
            media_type: if media_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                media_type.to_string()
            },
            data: data.to_string(),
        })
    });
    inline.unwrap_or_else(|| ImageSource::Url {
        url: url.to_string(),
    })
}

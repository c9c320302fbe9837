//! Claude `CreateMessageRequestBody` -> Gemini `GenerateContentRequest`.
//!
//! Grounded on `gproxy-transform::generate_content::claude2gemini::request`,
//! trimmed to the content-block and tool shapes this dispatch engine
//! actually forwards (text/thinking/tool_use/tool_result; no documents,
//! images, or the Claude-only builtin tool catalog, which are out of scope).

use antigate_protocol::claude::types::{
    ContentBlock, CreateMessageRequestBody, MessageContent, MessageParam, Role as ClaudeRole,
    SystemParam, ThinkingConfigParam, ThinkingMode, Tool as ClaudeTool, ToolChoice, ToolResultContent,
};
use antigate_protocol::envelope::{wrap_generate_content, InternalRequest};
use antigate_protocol::gemini::types::{
    Content, FunctionCall, FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration,
    GenerateContentRequest, GenerationConfig, JsonObject as GeminiJsonObject, Part, Role as GeminiRole,
    ThinkingConfig, Tool as GeminiTool, ToolConfig,
};

/// Prefix marking the injected identity part, so a second pass (e.g. a
/// signature-recovery retry rebuilding the request) can recognize one is
/// already present instead of stacking duplicates.
const IDENTITY_INSTRUCTION: &str =
    "You are Antigravity, a coding assistant built to work inside the Antigravity IDE.";

/// Wraps the translated body in the `v1internal` envelope the upstream
/// expects, keyed on the model id and GCP project the caller resolved.
pub fn transform_request(
    model: String,
    project: String,
    body: CreateMessageRequestBody,
) -> InternalRequest<GenerateContentRequest> {
    let contents = body
        .messages
        .iter()
        .map(map_message)
        .filter(|content| !content.parts.is_empty())
        .collect();
    let system_instruction = Some(inject_identity(body.system.map(map_system)));
    let tools = map_tools(body.tools).map(clean_tools);
    let tool_config = map_tool_choice(body.tool_choice);
    let generation_config = map_generation_config(
        body.max_tokens,
        body.temperature,
        body.top_p,
        body.top_k,
        body.stop_sequences,
        body.thinking,
    );

    let request = GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config,
        generation_config,
    };

    wrap_generate_content(model, project, request)
}

/// Prepends the identity part to `system_instruction.parts` unless its
/// first part already carries it.
fn inject_identity(system_instruction: Option<Content>) -> Content {
    match system_instruction {
        Some(mut content) => {
            let already_present = content
                .parts
                .first()
                .and_then(|part| part.text.as_deref())
                .map(|text| text.starts_with(IDENTITY_INSTRUCTION))
                .unwrap_or(false);
            if !already_present {
                content.parts.insert(0, Part::text(IDENTITY_INSTRUCTION.to_string()));
            }
            content
        }
        None => Content {
            role: None,
            parts: vec![Part::text(IDENTITY_INSTRUCTION.to_string())],
        },
    }
}

/// Recursively strips values a JSON Schema object carries that the upstream
/// function-calling schema doesn't accept: `null`s (JSON Schema treats an
/// absent key and an explicit `null` differently, but the upstream rejects
/// the latter) and the `$schema`/`additionalProperties` keys some client
/// tool generators emit.
fn clean_schema(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let cleaned = map
                .into_iter()
                .filter(|(key, value)| {
                    !value.is_null() && key != "$schema" && key != "additionalProperties"
                })
                .map(|(key, value)| (key, clean_schema(value)))
                .collect();
            serde_json::Value::Object(cleaned)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(clean_schema).collect())
        }
        other => other,
    }
}

fn clean_tools(tools: Vec<GeminiTool>) -> Vec<GeminiTool> {
    tools
        .into_iter()
        .map(|tool| GeminiTool {
            function_declarations: tool.function_declarations.map(|decls| {
                decls
                    .into_iter()
                    .map(|decl| FunctionDeclaration {
                        name: decl.name,
                        description: decl.description,
                        parameters: decl.parameters.map(clean_schema),
                    })
                    .collect()
            }),
        })
        .collect()
}

fn map_system(system: SystemParam) -> Content {
    let text = match system {
        SystemParam::Text(text) => text,
        SystemParam::Blocks(blocks) => blocks
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n"),
    };
    Content {
        role: None,
        parts: vec![Part::text(text)],
    }
}

fn map_message(message: &MessageParam) -> Content {
    let role = match message.role {
        ClaudeRole::User => GeminiRole::User,
        ClaudeRole::Assistant => GeminiRole::Model,
    };
    let parts = match &message.content {
        MessageContent::Text(text) => vec![Part::text(text.clone())],
        MessageContent::Blocks(blocks) => blocks.iter().filter_map(map_block).collect(),
    };
    Content {
        role: Some(role),
        parts,
    }
}

fn map_block(block: &ContentBlock) -> Option<Part> {
    match block {
        ContentBlock::Text(text) => Some(Part::text(text.text.clone())),
        ContentBlock::Thinking(thinking) => Some(Part {
            text: Some(thinking.thinking.clone()),
            inline_data: None,
            function_call: None,
            function_response: None,
            thought: Some(true),
            thought_signature: thinking.signature.clone(),
        }),
        ContentBlock::RedactedThinking(_) => None,
        ContentBlock::ToolUse(tool_use) => Some(Part {
            text: None,
            inline_data: None,
            function_call: Some(FunctionCall {
                id: Some(tool_use.id.clone()),
                name: tool_use.name.clone(),
                args: tool_use.input.clone().into_iter().collect::<GeminiJsonObject>(),
            }),
            function_response: None,
            thought: None,
            thought_signature: None,
        }),
        ContentBlock::ToolResult(tool_result) => {
            let response = match &tool_result.content {
                Some(ToolResultContent::Text(text)) => {
                    text_response_object(text.clone(), tool_result.is_error)
                }
                Some(ToolResultContent::Blocks(blocks)) => {
                    let joined = blocks
                        .iter()
                        .map(|block| block.text.clone())
                        .collect::<Vec<_>>()
                        .join("\n");
                    text_response_object(joined, tool_result.is_error)
                }
                None => text_response_object(String::new(), tool_result.is_error),
            };
            Some(Part {
                text: None,
                inline_data: None,
                function_call: None,
                function_response: Some(antigate_protocol::gemini::types::FunctionResponse {
                    id: Some(tool_result.tool_use_id.clone()),
                    name: tool_result.tool_use_id.clone(),
                    response,
                }),
                thought: None,
                thought_signature: None,
            })
        }
        ContentBlock::Other(_) => None,
    }
}

fn text_response_object(text: String, is_error: Option<bool>) -> GeminiJsonObject {
    let mut object = GeminiJsonObject::new();
    let key = if is_error.unwrap_or(false) {
        "error"
    } else {
        "output"
    };
    object.insert(key.to_string(), serde_json::Value::String(text));
    object
}

fn map_tools(tools: Option<Vec<ClaudeTool>>) -> Option<Vec<GeminiTool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .into_iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name,
            description: tool.description,
            parameters: Some(serde_json::to_value(&tool.input_schema).unwrap_or(serde_json::Value::Null)),
        })
        .collect();
    Some(vec![GeminiTool {
        function_declarations: Some(declarations),
    }])
}

fn map_tool_choice(choice: Option<ToolChoice>) -> Option<ToolConfig> {
    let choice = choice?;
    let function_calling_config = match choice {
        ToolChoice::None => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::None),
            allowed_function_names: None,
        },
        ToolChoice::Auto => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Auto),
            allowed_function_names: None,
        },
        ToolChoice::Any => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: None,
        },
        ToolChoice::Tool { name } => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![name]),
        },
    };
    Some(ToolConfig {
        function_calling_config: Some(function_calling_config),
    })
}

fn map_generation_config(
    max_tokens: u32,
    temperature: Option<f64>,
    top_p: Option<f64>,
    top_k: Option<u32>,
    stop_sequences: Option<Vec<String>>,
    thinking: Option<ThinkingConfigParam>,
) -> Option<GenerationConfig> {
    let thinking_config = thinking.map(|thinking| ThinkingConfig {
        include_thoughts: matches!(thinking.r#type, ThinkingMode::Enabled),
        thinking_budget: thinking.budget_tokens,
        thinking_level: None,
    });

    Some(GenerationConfig {
        stop_sequences,
        max_output_tokens: if max_tokens > 0 { Some(max_tokens) } else { None },
        temperature,
        top_p,
        top_k,
        thinking_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use antigate_protocol::claude::types::{TextBlock, TextBlockType};

    #[test]
    fn maps_simple_text_message_to_single_content() {
        let body = CreateMessageRequestBody {
            model: "gemini-3-pro".into(),
            max_tokens: 1024,
            messages: vec![MessageParam {
                role: ClaudeRole::User,
                content: MessageContent::Text("hello".into()),
            }],
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
        };

        let wrapped = transform_request("gemini-3-pro".into(), "proj-1".into(), body);
        assert_eq!(wrapped.model, "gemini-3-pro");
        assert_eq!(wrapped.request.contents.len(), 1);
        assert_eq!(wrapped.request.contents[0].parts[0].text.as_deref(), Some("hello"));
    }

    #[test]
    fn thinking_block_becomes_thought_part_with_signature() {
        let block = ContentBlock::Thinking(antigate_protocol::claude::types::ThinkingBlock {
            r#type: antigate_protocol::claude::types::ThinkingBlockType::Thinking,
            thinking: "reasoning".into(),
            signature: Some("sig-123".into()),
        });
        let part = map_block(&block).unwrap();
        assert_eq!(part.thought, Some(true));
        assert_eq!(part.thought_signature.as_deref(), Some("sig-123"));
    }

    #[test]
    fn redacted_thinking_block_is_dropped() {
        let block = ContentBlock::RedactedThinking(antigate_protocol::claude::types::RedactedThinkingBlock {
            r#type: antigate_protocol::claude::types::RedactedThinkingBlockType::RedactedThinking,
            data: "opaque".into(),
        });
        assert!(map_block(&block).is_none());
    }

    #[test]
    fn other_block_is_dropped() {
        let text_block = TextBlock {
            r#type: TextBlockType::Text,
            text: "x".into(),
        };
        assert!(map_block(&ContentBlock::Text(text_block)).is_some());
        assert!(map_block(&ContentBlock::Other(serde_json::json!({"type": "server_tool_use"}))).is_none());
    }

    fn minimal_body(messages: Vec<MessageParam>) -> CreateMessageRequestBody {
        CreateMessageRequestBody {
            model: "gemini-3-pro".into(),
            max_tokens: 1024,
            messages,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
        }
    }

    #[test]
    fn identity_instruction_is_injected_when_no_system_prompt_given() {
        let wrapped = transform_request("gemini-3-pro".into(), "proj-1".into(), minimal_body(vec![]));
        let system = wrapped.request.system_instruction.unwrap();
        assert_eq!(system.parts[0].text.as_deref(), Some(IDENTITY_INSTRUCTION));
    }

    #[test]
    fn identity_instruction_is_prepended_ahead_of_an_existing_system_prompt() {
        let mut body = minimal_body(vec![]);
        body.system = Some(SystemParam::Text("be terse".into()));
        let wrapped = transform_request("gemini-3-pro".into(), "proj-1".into(), body);
        let system = wrapped.request.system_instruction.unwrap();
        assert_eq!(system.parts.len(), 2);
        assert_eq!(system.parts[0].text.as_deref(), Some(IDENTITY_INSTRUCTION));
        assert_eq!(system.parts[1].text.as_deref(), Some("be terse"));
    }

    #[test]
    fn identity_instruction_is_not_duplicated_when_already_present() {
        let mut body = minimal_body(vec![]);
        body.system = Some(SystemParam::Text(format!("{IDENTITY_INSTRUCTION} extra context")));
        let wrapped = transform_request("gemini-3-pro".into(), "proj-1".into(), body);
        let system = wrapped.request.system_instruction.unwrap();
        assert_eq!(system.parts.len(), 1);
    }

    #[test]
    fn message_with_only_a_dropped_block_is_removed_entirely() {
        let messages = vec![MessageParam {
            role: ClaudeRole::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::RedactedThinking(
                antigate_protocol::claude::types::RedactedThinkingBlock {
                    r#type: antigate_protocol::claude::types::RedactedThinkingBlockType::RedactedThinking,
                    data: "opaque".into(),
                },
            )]),
        }];
        let wrapped = transform_request("gemini-3-pro".into(), "proj-1".into(), minimal_body(messages));
        assert!(wrapped.request.contents.is_empty());
    }

    #[test]
    fn tool_schema_cleaning_strips_nulls_and_schema_marker_keys() {
        let mut properties = antigate_protocol::claude::types::JsonObject::new();
        properties.insert(
            "query".to_string(),
            serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "$schema": "http://json-schema.org/draft-07/schema#",
                "properties": {
                    "text": {"type": "string", "default": null},
                },
            }),
        );
        let tools = Some(vec![ClaudeTool {
            name: "search".into(),
            description: Some("search the web".into()),
            input_schema: antigate_protocol::claude::types::ToolInputSchema {
                r#type: "object".into(),
                properties: Some(properties),
                required: None,
            },
        }]);
        let mut body = minimal_body(vec![]);
        body.tools = tools;
        let wrapped = transform_request("gemini-3-pro".into(), "proj-1".into(), body);
        let params = wrapped.request.tools.unwrap()[0]
            .function_declarations
            .clone()
            .unwrap()[0]
            .parameters
            .clone()
            .unwrap();
        let query = params["properties"]["query"].as_object().unwrap();
        assert!(!query.contains_key("$schema"));
        assert!(!query.contains_key("additionalProperties"));
        let nested_text = query["properties"]["text"].as_object().unwrap();
        assert!(!nested_text.contains_key("default"));
    }
}

//! Gemini `GenerateContentResponse` -> Claude `Message` (non-streaming path).
//!
//! Grounded on `gproxy-transform::generate_content::gemini2claude::response`
//! and `::stream2nostream::claude`'s block-reassembly logic, trimmed to the
//! content-block shapes this engine round-trips.

use antigate_protocol::claude::types::{
    ContentBlock, Message, MessageRole, MessageType, StopReason, TextBlock, TextBlockType,
    ThinkingBlock, ThinkingBlockType, ToolUseBlock, ToolUseBlockType, Usage,
};
use antigate_protocol::gemini::types::{Candidate, FinishReason, GenerateContentResponse, Part};

pub fn transform_response(id: String, model: &str, response: GenerateContentResponse) -> Message {
    let candidate = response.candidates.into_iter().next();
    let (content, stop_reason) = match candidate {
        Some(candidate) => (
            map_parts(candidate.content.parts),
            candidate.finish_reason.map(map_finish_reason),
        ),
        None => (Vec::new(), None),
    };

    let usage = Usage {
        input_tokens: response
            .usage_metadata
            .as_ref()
            .and_then(|usage| usage.prompt_token_count)
            .unwrap_or(0),
        output_tokens: response
            .usage_metadata
            .as_ref()
            .and_then(|usage| usage.candidates_token_count)
            .unwrap_or(0),
        cache_creation_input_tokens: None,
        cache_read_input_tokens: response
            .usage_metadata
            .as_ref()
            .and_then(|usage| usage.cached_content_token_count),
    };

    Message {
        id,
        r#type: MessageType::Message,
        role: MessageRole::Assistant,
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

pub(crate) fn map_parts(parts: Vec<Part>) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(parts.len());
    let mut tool_index = 0usize;
    for part in parts {
        if let Some(block) = map_part(part, &mut tool_index) {
            blocks.push(block);
        }
    }
    blocks
}

fn map_part(part: Part, tool_index: &mut usize) -> Option<ContentBlock> {
    if let Some(function_call) = part.function_call {
        let id = function_call
            .id
            .unwrap_or_else(|| format!("toolu_{tool_index}"));
        *tool_index += 1;
        return Some(ContentBlock::ToolUse(ToolUseBlock {
            r#type: ToolUseBlockType::ToolUse,
            id,
            name: function_call.name,
            input: function_call.args.into_iter().collect(),
        }));
    }

    let text = part.text?;
    if part.is_thought() {
        Some(ContentBlock::Thinking(ThinkingBlock {
            r#type: ThinkingBlockType::Thinking,
            thinking: text,
            signature: part.thought_signature,
        }))
    } else {
        Some(ContentBlock::Text(TextBlock {
            r#type: TextBlockType::Text,
            text,
        }))
    }
}

pub(crate) fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::Safety | FinishReason::Recitation | FinishReason::Other => StopReason::Refusal,
        FinishReason::MalformedFunctionCall => StopReason::ToolUse,
        FinishReason::MissingThoughtSignature => StopReason::Refusal,
    }
}

pub(crate) fn has_tool_use(candidate: &Candidate) -> bool {
    candidate
        .content
        .parts
        .iter()
        .any(|part| part.function_call.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use antigate_protocol::gemini::types::{Content, FunctionCall, UsageMetadata};

    #[test]
    fn maps_plain_text_candidate() {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: None,
                    parts: vec![Part::text("hi there")],
                },
                finish_reason: Some(FinishReason::Stop),
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(5),
                candidates_token_count: Some(3),
                thoughts_token_count: None,
                total_token_count: Some(8),
                cached_content_token_count: None,
            }),
            model_version: None,
            response_id: None,
        };

        let message = transform_response("msg_1".into(), "gemini-3-pro", response);
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(message.usage.input_tokens, 5);
        assert_eq!(message.usage.output_tokens, 3);
        assert!(matches!(message.content[0], ContentBlock::Text(_)));
    }

    #[test]
    fn function_call_without_id_gets_positional_placeholder() {
        let part = Part {
            text: None,
            inline_data: None,
            function_call: Some(FunctionCall {
                id: None,
                name: "lookup".into(),
                args: Default::default(),
            }),
            function_response: None,
            thought: None,
            thought_signature: None,
        };
        let mut index = 0;
        let block = map_part(part, &mut index).unwrap();
        match block {
            ContentBlock::ToolUse(tool_use) => assert_eq!(tool_use.id, "toolu_0"),
            _ => panic!("expected tool use block"),
        }
        assert_eq!(index, 1);
    }

    #[test]
    fn malformed_function_call_maps_to_tool_use_stop_reason() {
        assert_eq!(
            map_finish_reason(FinishReason::MalformedFunctionCall),
            StopReason::ToolUse
        );
    }
}

//! Two-stage signature-error recovery rewrite.
//!
//! New: there is no gproxy analogue for this exact transform, but it is
//! built in the style of `gproxy-transform::generate_content::claude2gemini`'s
//! request-rewriting (block-by-block `match` producing a new block list).
//! Detection of which upstream 400s qualify lives in `antigate-core`; this
//! module only knows how to rewrite a request once a stage is chosen.

use antigate_protocol::claude::types::{
    ContentBlock, CreateMessageRequestBody, MessageContent, MessageParam, TextBlock, TextBlockType,
    ToolResultContent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    /// Drop `thinking` config; convert `thinking` blocks to text, drop
    /// `redacted_thinking` blocks.
    ThinkingOnly,
    /// Everything in `ThinkingOnly`, plus flatten `tool_use`/`tool_result`
    /// blocks to human-readable text.
    ThinkingAndTools,
}

impl RecoveryStage {
    /// Matches the journal `kind` vocabulary in §4.C3.
    pub fn journal_kind(self) -> &'static str {
        match self {
            RecoveryStage::ThinkingOnly => "signature_retry_thinking-only",
            RecoveryStage::ThinkingAndTools => "signature_retry_thinking_tools",
        }
    }
}

/// Detects whether an upstream 400 body is signature-class per §4.C3.
pub fn is_signature_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("thought_signature")
        || lower.contains("signature")
        || (lower.contains("expected thinking") && lower.contains("but found"))
        || lower.contains("cannot be modified")
}

pub fn rewrite(body: &CreateMessageRequestBody, stage: RecoveryStage) -> CreateMessageRequestBody {
    let mut rewritten = body.clone();
    rewritten.thinking = None;
    rewritten.messages = body
        .messages
        .iter()
        .map(|message| rewrite_message(message, stage))
        .collect();
    rewritten
}

fn rewrite_message(message: &MessageParam, stage: RecoveryStage) -> MessageParam {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return MessageParam {
                role: message.role,
                content: MessageContent::Text(text.clone()),
            };
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut rewritten: Vec<ContentBlock> = blocks
        .iter()
        .filter_map(|block| rewrite_block(block, stage))
        .collect();

    if rewritten.is_empty() {
        rewritten.push(placeholder_text());
    }

    MessageParam {
        role: message.role,
        content: MessageContent::Blocks(rewritten),
    }
}

fn rewrite_block(block: &ContentBlock, stage: RecoveryStage) -> Option<ContentBlock> {
    match block {
        ContentBlock::Thinking(thinking) => Some(text_block(thinking.thinking.clone())),
        ContentBlock::RedactedThinking(_) => None,
        ContentBlock::ToolUse(tool_use) if stage == RecoveryStage::ThinkingAndTools => {
            let input = serde_json::to_string(&tool_use.input).unwrap_or_default();
            Some(text_block(format!(
                "[tool_use id={} name={} input={}]",
                tool_use.id, tool_use.name, input
            )))
        }
        ContentBlock::ToolResult(tool_result) if stage == RecoveryStage::ThinkingAndTools => {
            let content = match &tool_result.content {
                Some(ToolResultContent::Text(text)) => text.clone(),
                Some(ToolResultContent::Blocks(blocks)) => blocks
                    .iter()
                    .map(|block| block.text.clone())
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => String::new(),
            };
            Some(text_block(format!(
                "[tool_result id={} is_error={} content={}]",
                tool_result.tool_use_id,
                tool_result.is_error.unwrap_or(false),
                content
            )))
        }
        other => Some(other.clone()),
    }
}

fn text_block(text: String) -> ContentBlock {
    ContentBlock::Text(TextBlock {
        r#type: TextBlockType::Text,
        text,
    })
}

fn placeholder_text() -> ContentBlock {
    text_block(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use antigate_protocol::claude::types::{
        Role, ThinkingBlock, ThinkingBlockType, ToolResultBlock, ToolResultBlockType, ToolUseBlock,
        ToolUseBlockType,
    };

    fn sample_body(blocks: Vec<ContentBlock>) -> CreateMessageRequestBody {
        CreateMessageRequestBody {
            model: "gemini-3-pro".into(),
            max_tokens: 100,
            messages: vec![MessageParam {
                role: Role::Assistant,
                content: MessageContent::Blocks(blocks),
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
        }
    }

    #[test]
    fn detects_signature_class_errors() {
        assert!(is_signature_error("Invalid thought_signature in message 3"));
        assert!(is_signature_error("signature"));
        assert!(!is_signature_error("signa"));
        assert!(is_signature_error("expected thinking/redacted_thinking but found text"));
    }

    #[test]
    fn thinking_only_stage_converts_thinking_and_drops_redacted() {
        let body = sample_body(vec![
            ContentBlock::Thinking(ThinkingBlock {
                r#type: ThinkingBlockType::Thinking,
                thinking: "let me think".into(),
                signature: Some("sig".into()),
            }),
            ContentBlock::RedactedThinking(antigate_protocol::claude::types::RedactedThinkingBlock {
                r#type: antigate_protocol::claude::types::RedactedThinkingBlockType::RedactedThinking,
                data: "opaque".into(),
            }),
        ]);

        let rewritten = rewrite(&body, RecoveryStage::ThinkingOnly);
        match &rewritten.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                match &blocks[0] {
                    ContentBlock::Text(text) => assert_eq!(text.text, "let me think"),
                    _ => panic!("expected text block"),
                }
            }
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn thinking_and_tools_stage_flattens_tool_blocks() {
        let body = sample_body(vec![ContentBlock::ToolUse(ToolUseBlock {
            r#type: ToolUseBlockType::ToolUse,
            id: "tool_1".into(),
            name: "lookup".into(),
            input: Default::default(),
        })]);

        let rewritten = rewrite(&body, RecoveryStage::ThinkingAndTools);
        match &rewritten.messages[0].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::Text(text) => assert!(text.text.contains("tool_1")),
                _ => panic!("expected text block"),
            },
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn empty_collapse_inserts_placeholder() {
        let body = sample_body(vec![ContentBlock::ToolUse(ToolUseBlock {
            r#type: ToolUseBlockType::ToolUse,
            id: "tool_1".into(),
            name: "lookup".into(),
            input: Default::default(),
        })]);

        let rewritten = rewrite(&body, RecoveryStage::ThinkingOnly);
        match &rewritten.messages[0].content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 1),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn tool_result_block_is_preserved_under_thinking_only_stage() {
        let body = sample_body(vec![ContentBlock::ToolResult(ToolResultBlock {
            r#type: ToolResultBlockType::ToolResult,
            tool_use_id: "tool_1".into(),
            content: Some(ToolResultContent::Text("ok".into())),
            is_error: Some(false),
        })]);

        let rewritten = rewrite(&body, RecoveryStage::ThinkingOnly);
        match &rewritten.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(blocks[0], ContentBlock::ToolResult(_)));
            }
            _ => panic!("expected blocks"),
        }
    }
}

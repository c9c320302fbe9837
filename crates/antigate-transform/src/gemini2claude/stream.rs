//! Streaming bridge: Gemini `streamGenerateContent` chunks -> Claude SSE
//! `StreamEvent`s.
//!
//! Grounded on `gproxy-transform::generate_content::gemini2claude::stream`,
//! adapted to the trimmed part/block vocabulary in [`antigate_protocol`].
//! Gemini chunks don't carry explicit block-boundary markers the way Claude
//! streams do; boundaries are inferred here whenever the part "kind"
//! (text / thought / tool call) changes from the previously open block.

use antigate_protocol::claude::types::{
    ContentBlock, MessageRole, MessageType, StopReason, StreamContentBlockDelta, StreamEvent,
    StreamMessage, StreamMessageDelta, StreamUsage, TextBlock, TextBlockType, ThinkingBlock,
    ThinkingBlockType, ToolUseBlock, ToolUseBlockType,
};
use antigate_protocol::gemini::types::{GenerateContentResponse, Part};

use crate::gemini2claude::response::map_finish_reason;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse(String),
}

fn part_kind(part: &Part) -> Option<BlockKind> {
    if let Some(function_call) = &part.function_call {
        return Some(BlockKind::ToolUse(function_call.name.clone()));
    }
    if part.text.is_some() {
        return Some(if part.is_thought() {
            BlockKind::Thinking
        } else {
            BlockKind::Text
        });
    }
    None
}

pub struct GeminiStreamToClaudeEvents {
    id: String,
    model: String,
    started: bool,
    current_block: Option<BlockKind>,
    next_index: u32,
    tool_counter: usize,
    stop_reason: Option<StopReason>,
    usage: StreamUsage,
}

impl GeminiStreamToClaudeEvents {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            started: false,
            current_block: None,
            next_index: 0,
            tool_counter: 0,
            stop_reason: None,
            usage: StreamUsage {
                input_tokens: None,
                output_tokens: None,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        }
    }

    pub fn push_chunk(&mut self, response: GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: StreamMessage {
                    id: self.id.clone(),
                    r#type: MessageType::Message,
                    role: MessageRole::Assistant,
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: self.usage.clone(),
                },
            });
        }

        if let Some(usage) = &response.usage_metadata {
            if let Some(input) = usage.prompt_token_count {
                self.usage.input_tokens = Some(input);
            }
            if let Some(output) = usage.candidates_token_count {
                self.usage.output_tokens = Some(output);
            }
            if let Some(cached) = usage.cached_content_token_count {
                self.usage.cache_read_input_tokens = Some(cached);
            }
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return events;
        };

        for part in candidate.content.parts {
            self.push_part(part, &mut events);
        }

        if let Some(finish_reason) = candidate.finish_reason {
            self.stop_reason = Some(map_finish_reason(finish_reason));
        }

        events
    }

    fn push_part(&mut self, part: Part, events: &mut Vec<StreamEvent>) {
        let Some(kind) = part_kind(&part) else {
            return;
        };

        if self.current_block.as_ref() != Some(&kind) {
            self.close_current_block(events);
            self.open_block(&kind, events);
        }

        let index = self.next_index - 1;
        match kind {
            BlockKind::Text => {
                if let Some(text) = part.text {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamContentBlockDelta::TextDelta { text },
                    });
                }
            }
            BlockKind::Thinking => {
                if let Some(text) = part.text {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamContentBlockDelta::ThinkingDelta { thinking: text },
                    });
                }
                if let Some(signature) = part.thought_signature {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamContentBlockDelta::SignatureDelta { signature },
                    });
                }
            }
            BlockKind::ToolUse(_) => {
                if let Some(function_call) = part.function_call {
                    let partial_json =
                        serde_json::to_string(&function_call.args).unwrap_or_default();
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamContentBlockDelta::InputJsonDelta { partial_json },
                    });
                }
            }
        }
    }

    fn open_block(&mut self, kind: &BlockKind, events: &mut Vec<StreamEvent>) {
        let index = self.next_index;
        self.next_index += 1;
        self.current_block = Some(kind.clone());

        let content_block = match kind {
            BlockKind::Text => ContentBlock::Text(TextBlock {
                r#type: TextBlockType::Text,
                text: String::new(),
            }),
            BlockKind::Thinking => ContentBlock::Thinking(ThinkingBlock {
                r#type: ThinkingBlockType::Thinking,
                thinking: String::new(),
                signature: None,
            }),
            BlockKind::ToolUse(name) => {
                let id = format!("toolu_{}", self.tool_counter);
                self.tool_counter += 1;
                ContentBlock::ToolUse(ToolUseBlock {
                    r#type: ToolUseBlockType::ToolUse,
                    id,
                    name: name.clone(),
                    input: Default::default(),
                })
            }
        };

        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
    }

    fn close_current_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.current_block.take().is_some() {
            events.push(StreamEvent::ContentBlockStop {
                index: self.next_index - 1,
            });
        }
    }

    /// Call once the upstream stream reaches EOF; flushes the trailing
    /// block and the terminal `message_delta`/`message_stop` pair.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.close_current_block(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: StreamMessageDelta {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antigate_protocol::gemini::types::{Candidate, Content, FinishReason, UsageMetadata};

    fn chunk(parts: Vec<Part>, finish_reason: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: None, parts },
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(10),
                candidates_token_count: Some(1),
                thoughts_token_count: None,
                total_token_count: Some(11),
                cached_content_token_count: None,
            }),
            model_version: None,
            response_id: None,
        }
    }

    #[test]
    fn emits_message_start_once_across_chunks() {
        let mut bridge = GeminiStreamToClaudeEvents::new("msg_1", "gemini-3-pro");
        let first = bridge.push_chunk(chunk(vec![Part::text("a")], None));
        let second = bridge.push_chunk(chunk(vec![Part::text("b")], None));
        assert!(matches!(first[0], StreamEvent::MessageStart { .. }));
        assert!(!second.iter().any(|e| matches!(e, StreamEvent::MessageStart { .. })));
    }

    #[test]
    fn switching_part_kind_closes_and_reopens_block() {
        let mut bridge = GeminiStreamToClaudeEvents::new("msg_1", "gemini-3-pro");
        let mut text_part = Part::text("thinking...");
        text_part.thought = Some(true);
        let events = bridge.push_chunk(chunk(vec![text_part, Part::text("answer")], None));

        let stops = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStop { .. }))
            .count();
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStart { .. }))
            .count();
        assert_eq!(stops, 1);
        assert_eq!(starts, 2);
    }

    #[test]
    fn finish_emits_message_delta_and_stop() {
        let mut bridge = GeminiStreamToClaudeEvents::new("msg_1", "gemini-3-pro");
        bridge.push_chunk(chunk(vec![Part::text("done")], Some(FinishReason::Stop)));
        let tail = bridge.finish();
        assert!(matches!(tail[0], StreamEvent::ContentBlockStop { .. }));
        assert!(matches!(tail[1], StreamEvent::MessageDelta { .. }));
        assert!(matches!(tail[2], StreamEvent::MessageStop));
    }
}

//! Collects a Claude SSE `StreamEvent` sequence back into a single
//! non-streaming `Message`, for callers that requested `stream: false`
//! against an upstream that only speaks `streamGenerateContent`.
//!
//! Grounded on `gproxy-transform::stream2nostream::claude::ClaudeStreamToMessageState`.

use std::collections::BTreeMap;

use antigate_protocol::claude::types::{
    ContentBlock, Message, MessageRole, MessageType, StopReason, StreamContentBlockDelta,
    StreamEvent, StreamMessage, StreamMessageDelta, StreamUsage, Usage,
};
use antigate_protocol::gemini::types::{
    Candidate, Content, FinishReason, GenerateContentResponse, Part, Role as GeminiRole,
    UsageMetadata,
};

/// Merges raw Gemini `streamGenerateContent` chunks into one non-stream
/// body, at the `parts` level (spec §4.C4 "Stream-to-non-stream
/// collector"), distinct from [`ClaudeStreamCollector`], which merges
/// already-decoded Claude SSE events instead of raw Gemini parts. Used for
/// the Gemini-client-facing non-stream path, since this engine always
/// forwards via the streaming upstream endpoint.
#[derive(Debug, Default)]
pub struct GeminiPartsCollector {
    parts: Vec<Part>,
    finish_reason: Option<FinishReason>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    response_id: Option<String>,
}

impl GeminiPartsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded chunk's first candidate. Preserves original part
    /// order; consecutive ordinary text parts (no `thought`, no
    /// `functionCall`, no `inlineData`) are concatenated into one, while
    /// thinking/functionCall/inlineData parts are kept verbatim in place.
    pub fn push_chunk(&mut self, chunk: GenerateContentResponse) {
        if let Some(candidate) = chunk.candidates.into_iter().next() {
            if candidate.finish_reason.is_some() {
                self.finish_reason = candidate.finish_reason;
            }
            for part in candidate.content.parts {
                self.push_part(part);
            }
        }
        if chunk.usage_metadata.is_some() {
            self.usage_metadata = chunk.usage_metadata;
        }
        if chunk.model_version.is_some() {
            self.model_version = chunk.model_version;
        }
        if chunk.response_id.is_some() {
            self.response_id = chunk.response_id;
        }
    }

    fn push_part(&mut self, part: Part) {
        if is_ordinary_text(&part) {
            if let Some(last) = self.parts.last_mut() {
                if is_ordinary_text(last) {
                    let appended = part.text.unwrap_or_default();
                    last.text.get_or_insert_with(String::new).push_str(&appended);
                    return;
                }
            }
        }
        self.parts.push(part);
    }

    /// Builds the merged non-stream body once the stream has ended.
    pub fn finish(self) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: Some(GeminiRole::Model),
                    parts: self.parts,
                },
                finish_reason: self.finish_reason,
                index: Some(0),
            }],
            usage_metadata: self.usage_metadata,
            model_version: self.model_version,
            response_id: self.response_id,
        }
    }
}

fn is_ordinary_text(part: &Part) -> bool {
    part.text.is_some()
        && part.thought != Some(true)
        && part.inline_data.is_none()
        && part.function_call.is_none()
        && part.function_response.is_none()
}

#[derive(Debug, Default)]
pub struct ClaudeStreamCollector {
    message: Option<StreamMessage>,
    blocks: BTreeMap<u32, ContentBlock>,
    pending_json: BTreeMap<u32, String>,
}

impl ClaudeStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded event; returns the assembled `Message` once
    /// `message_stop` arrives.
    pub fn push_event(&mut self, event: StreamEvent) -> Option<Message> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.message = Some(message);
                None
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                self.blocks.insert(index, content_block);
                None
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.apply_delta(index, delta);
                None
            }
            StreamEvent::ContentBlockStop { index } => {
                self.finish_block(index);
                None
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.apply_message_delta(delta, usage);
                None
            }
            StreamEvent::MessageStop => self.finalize(),
            StreamEvent::Ping | StreamEvent::Error { .. } => None,
        }
    }

    /// Call if the upstream connection drops before `message_stop` arrives;
    /// yields whatever partial message was assembled, marked `end_turn`.
    pub fn finalize_on_eof(&mut self) -> Option<Message> {
        let mut message = self.message.take()?;
        if message.stop_reason.is_none() {
            message.stop_reason = Some(StopReason::EndTurn);
        }
        Some(self.build_message(message))
    }

    fn apply_delta(&mut self, index: u32, delta: StreamContentBlockDelta) {
        match delta {
            StreamContentBlockDelta::TextDelta { text } => {
                if let Some(ContentBlock::Text(block)) = self.blocks.get_mut(&index) {
                    block.text.push_str(&text);
                }
            }
            StreamContentBlockDelta::ThinkingDelta { thinking } => {
                if let Some(ContentBlock::Thinking(block)) = self.blocks.get_mut(&index) {
                    block.thinking.push_str(&thinking);
                }
            }
            StreamContentBlockDelta::SignatureDelta { signature } => {
                if let Some(ContentBlock::Thinking(block)) = self.blocks.get_mut(&index) {
                    match &mut block.signature {
                        Some(existing) => existing.push_str(&signature),
                        None => block.signature = Some(signature),
                    }
                }
            }
            StreamContentBlockDelta::InputJsonDelta { partial_json } => {
                self.pending_json
                    .entry(index)
                    .or_default()
                    .push_str(&partial_json);
            }
        }
    }

    fn finish_block(&mut self, index: u32) {
        if let Some(json) = self.pending_json.remove(&index) {
            if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(&json) {
                if let Some(ContentBlock::ToolUse(tool_use)) = self.blocks.get_mut(&index) {
                    tool_use.input = object.into_iter().collect();
                }
            }
        }
    }

    fn apply_message_delta(&mut self, delta: StreamMessageDelta, usage: StreamUsage) {
        if let Some(message) = self.message.as_mut() {
            if delta.stop_reason.is_some() {
                message.stop_reason = delta.stop_reason;
            }
            if delta.stop_sequence.is_some() {
                message.stop_sequence = delta.stop_sequence;
            }
            message.usage = usage;
        }
    }

    fn finalize(&mut self) -> Option<Message> {
        let message = self.message.take()?;
        Some(self.build_message(message))
    }

    fn build_message(&mut self, message: StreamMessage) -> Message {
        Message {
            id: message.id,
            r#type: MessageType::Message,
            role: MessageRole::Assistant,
            content: self.blocks.values().cloned().collect(),
            model: message.model,
            stop_reason: message.stop_reason,
            stop_sequence: message.stop_sequence,
            usage: Usage {
                input_tokens: message.usage.input_tokens.unwrap_or(0),
                output_tokens: message.usage.output_tokens.unwrap_or(0),
                cache_creation_input_tokens: message.usage.cache_creation_input_tokens,
                cache_read_input_tokens: message.usage.cache_read_input_tokens,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_text_message_from_deltas() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(StreamEvent::MessageStart {
            message: StreamMessage {
                id: "msg_1".into(),
                r#type: MessageType::Message,
                role: MessageRole::Assistant,
                content: Vec::new(),
                model: "gemini-3-pro".into(),
                stop_reason: None,
                stop_sequence: None,
                usage: StreamUsage {
                    input_tokens: Some(5),
                    output_tokens: None,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                },
            },
        });
        collector.push_event(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text(antigate_protocol::claude::types::TextBlock {
                r#type: antigate_protocol::claude::types::TextBlockType::Text,
                text: String::new(),
            }),
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: StreamContentBlockDelta::TextDelta { text: "hel".into() },
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: StreamContentBlockDelta::TextDelta { text: "lo".into() },
        });
        collector.push_event(StreamEvent::ContentBlockStop { index: 0 });
        collector.push_event(StreamEvent::MessageDelta {
            delta: StreamMessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: StreamUsage {
                input_tokens: Some(5),
                output_tokens: Some(2),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        });
        let message = collector.push_event(StreamEvent::MessageStop).unwrap();

        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
        match &message.content[0] {
            ContentBlock::Text(block) => assert_eq!(block.text, "hello"),
            _ => panic!("expected text block"),
        }
    }

    #[test]
    fn finalize_on_eof_defaults_to_end_turn_when_stream_drops_early() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(StreamEvent::MessageStart {
            message: StreamMessage {
                id: "msg_2".into(),
                r#type: MessageType::Message,
                role: MessageRole::Assistant,
                content: Vec::new(),
                model: "gemini-3-pro".into(),
                stop_reason: None,
                stop_sequence: None,
                usage: StreamUsage {
                    input_tokens: None,
                    output_tokens: None,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                },
            },
        });
        let message = collector.finalize_on_eof().unwrap();
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
    }

    fn text_part(text: &str) -> Part {
        Part::text(text.to_string())
    }

    fn thought_part(text: &str) -> Part {
        Part {
            text: Some(text.to_string()),
            inline_data: None,
            function_call: None,
            function_response: None,
            thought: Some(true),
            thought_signature: None,
        }
    }

    fn chunk(parts: Vec<Part>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: Some(GeminiRole::Model), parts },
                finish_reason: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: None,
        }
    }

    #[test]
    fn consecutive_text_parts_across_chunks_are_concatenated() {
        let mut collector = GeminiPartsCollector::new();
        collector.push_chunk(chunk(vec![text_part("hel")]));
        collector.push_chunk(chunk(vec![text_part("lo")]));
        let merged = collector.finish();
        assert_eq!(merged.candidates[0].content.parts.len(), 1);
        assert_eq!(merged.candidates[0].content.parts[0].text.as_deref(), Some("hello"));
    }

    #[test]
    fn thinking_part_breaks_the_text_run_and_is_kept_verbatim() {
        let mut collector = GeminiPartsCollector::new();
        collector.push_chunk(chunk(vec![text_part("before")]));
        collector.push_chunk(chunk(vec![thought_part("reasoning")]));
        collector.push_chunk(chunk(vec![text_part("after")]));
        let merged = collector.finish();
        let parts = &merged.candidates[0].content.parts;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].text.as_deref(), Some("before"));
        assert_eq!(parts[1].thought, Some(true));
        assert_eq!(parts[2].text.as_deref(), Some("after"));
    }

    #[test]
    fn last_chunk_wins_for_finish_reason_and_usage() {
        use antigate_protocol::gemini::types::FinishReason;
        let mut collector = GeminiPartsCollector::new();
        let mut first = chunk(vec![text_part("a")]);
        first.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(1),
            candidates_token_count: Some(1),
            thoughts_token_count: None,
            total_token_count: Some(2),
            cached_content_token_count: None,
        });
        collector.push_chunk(first);
        let mut last = chunk(vec![text_part("b")]);
        last.candidates[0].finish_reason = Some(FinishReason::Stop);
        last.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(1),
            candidates_token_count: Some(3),
            thoughts_token_count: None,
            total_token_count: Some(4),
            cached_content_token_count: None,
        });
        collector.push_chunk(last);
        let merged = collector.finish();
        assert_eq!(merged.candidates[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(merged.usage_metadata.unwrap().total_token_count, Some(4));
    }
}

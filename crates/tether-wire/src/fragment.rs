//! Streaming fragments and agent stream record decoding
//!
//! The bridge relays the agent's own stream records inside
//! `chat:stream-response` frames of type `claude_json`. Each record decodes
//! into zero or more [`Fragment`]s; everything else in the stream (done,
//! error, aborted) maps onto a single fragment.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{SessionId, Usage};

/// One incremental event within a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fragment {
    /// Session initialization (carries the server-assigned session id)
    Init {
        session_id: Option<SessionId>,
        model: Option<String>,
    },
    /// Partial assistant text
    ContentDelta { text: String },
    /// A complete assistant text block. Folded like a delta unless the turn
    /// already streams partial deltas, in which case it repeats them.
    Text { text: String },
    /// The agent started a tool invocation
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// A tool invocation finished
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// Final turn summary from the agent
    Result {
        session_id: Option<SessionId>,
        text: Option<String>,
        usage: Usage,
        duration_ms: Option<u64>,
        is_error: bool,
    },
    /// Server-reported mid-turn failure
    Error { message: String },
    /// The turn finished
    Done,
    /// The turn was aborted
    Aborted,
    /// A record type this client does not understand
    Unknown { record_type: String },
}

impl Fragment {
    /// Check if this is a terminal fragment (Done, Error or Aborted)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Fragment::Done | Fragment::Error { .. } | Fragment::Aborted
        )
    }

    /// The session id carried by this fragment, if any non-empty one
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Fragment::Init { session_id, .. } | Fragment::Result { session_id, .. } => {
                session_id.as_ref().filter(|s| !s.is_empty())
            }
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct SystemRecord {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct MessageRecord {
    message: MessageBody,
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: BlockList,
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
enum BlockList {
    Blocks(Vec<ContentBlock>),
    Plain(String),
    #[default]
    Empty,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ResultRecord {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Default)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize)]
struct StreamEventRecord {
    event: StreamEvent,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: Delta },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Flatten tool result content (a string or a list of text blocks)
fn flatten_tool_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn block_fragments(content: BlockList) -> Vec<Fragment> {
    let blocks = match content {
        BlockList::Blocks(blocks) => blocks,
        BlockList::Plain(text) if !text.is_empty() => return vec![Fragment::Text { text }],
        _ => return vec![],
    };

    blocks
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(Fragment::Text { text }),
            ContentBlock::ToolUse { id, name, input } => Some(Fragment::ToolUse { id, name, input }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(Fragment::ToolResult {
                tool_use_id,
                content: flatten_tool_content(&content),
                is_error: is_error.unwrap_or(false),
            }),
            ContentBlock::Other => None,
        })
        .collect()
}

fn unknown(record_type: &str) -> Vec<Fragment> {
    vec![Fragment::Unknown {
        record_type: record_type.to_string(),
    }]
}

/// Decode one agent stream record into fragments.
///
/// Records that fail to match their expected shape decode to
/// [`Fragment::Unknown`] rather than an error: a single odd record must not
/// poison the rest of the turn.
pub fn decode_agent_record(record: &Value) -> Vec<Fragment> {
    let Some(record_type) = record.get("type").and_then(Value::as_str) else {
        return unknown("<missing>");
    };

    let decoded = match record_type {
        "system" => serde_json::from_value::<SystemRecord>(record.clone()).map(|r| {
            match r.subtype.as_deref() {
                Some("init") | None => vec![Fragment::Init {
                    session_id: r.session_id,
                    model: r.model,
                }],
                Some(other) => unknown(&format!("system/{}", other)),
            }
        }),
        "assistant" => serde_json::from_value::<MessageRecord>(record.clone())
            .map(|r| block_fragments(r.message.content)),
        // User records echo input and interruption notices; only tool results matter
        "user" => serde_json::from_value::<MessageRecord>(record.clone()).map(|r| {
            block_fragments(r.message.content)
                .into_iter()
                .filter(|f| matches!(f, Fragment::ToolResult { .. }))
                .collect()
        }),
        "stream_event" => serde_json::from_value::<StreamEventRecord>(record.clone()).map(|r| {
            match r.event {
                StreamEvent::ContentBlockDelta {
                    delta: Delta::TextDelta { text },
                } => vec![Fragment::ContentDelta { text }],
                _ => vec![],
            }
        }),
        "result" => serde_json::from_value::<ResultRecord>(record.clone()).map(|r| {
            let raw = r.usage.unwrap_or_default();
            let is_error = r.is_error || r.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
            vec![Fragment::Result {
                session_id: r.session_id,
                text: r.result,
                usage: Usage {
                    input: raw.input_tokens,
                    output: raw.output_tokens,
                    cache_read: raw.cache_read_input_tokens,
                    cache_write: raw.cache_creation_input_tokens,
                    cost_usd: r.total_cost_usd.unwrap_or_default(),
                },
                duration_ms: r.duration_ms,
                is_error,
            }]
        }),
        other => return unknown(other),
    };

    match decoded {
        Ok(fragments) => fragments,
        Err(e) => {
            tracing::debug!("Undecodable '{}' record: {}", record_type, e);
            unknown(record_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_init_carries_session() {
        let fragments = decode_agent_record(&json!({
            "type": "system",
            "subtype": "init",
            "session_id": "s1",
            "model": "claude-sonnet"
        }));
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].session_id().map(|s| s.as_str()), Some("s1"));
    }

    #[test]
    fn test_empty_session_id_is_ignored() {
        let fragments = decode_agent_record(&json!({
            "type": "system",
            "subtype": "init",
            "session_id": ""
        }));
        assert!(fragments[0].session_id().is_none());
    }

    #[test]
    fn test_stream_event_text_delta() {
        let fragments = decode_agent_record(&json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "He" }
            }
        }));
        assert_eq!(fragments, vec![Fragment::ContentDelta { text: "He".into() }]);
    }

    #[test]
    fn test_stream_event_other_is_silent() {
        let fragments = decode_agent_record(&json!({
            "type": "stream_event",
            "event": { "type": "message_start", "message": {} }
        }));
        assert!(fragments.is_empty());
    }

    #[test]
    fn test_assistant_blocks_split_into_fragments() {
        let fragments = decode_agent_record(&json!({
            "type": "assistant",
            "message": {
                "content": [
                    { "type": "text", "text": "Let me look." },
                    { "type": "tool_use", "id": "tu1", "name": "Read", "input": { "path": "a.rs" } },
                    { "type": "thinking", "thinking": "hmm" }
                ]
            }
        }));
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], Fragment::Text { text: "Let me look.".into() });
        match &fragments[1] {
            Fragment::ToolUse { id, name, input } => {
                assert_eq!(id, "tu1");
                assert_eq!(name, "Read");
                assert_eq!(input["path"], "a.rs");
            }
            other => panic!("unexpected fragment: {:?}", other),
        }
    }

    #[test]
    fn test_user_tool_result_flattens_content() {
        let fragments = decode_agent_record(&json!({
            "type": "user",
            "message": {
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "tu1",
                    "content": [{ "type": "text", "text": "line 1" }, { "type": "text", "text": "line 2" }],
                    "is_error": true
                }]
            }
        }));
        assert_eq!(
            fragments,
            vec![Fragment::ToolResult {
                tool_use_id: "tu1".into(),
                content: "line 1\nline 2".into(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn test_user_text_is_not_assistant_output() {
        let fragments = decode_agent_record(&json!({
            "type": "user",
            "message": {
                "content": [
                    { "type": "text", "text": "[Request interrupted by user]" },
                    { "type": "tool_result", "tool_use_id": "tu1", "content": "ok" }
                ]
            }
        }));
        assert_eq!(
            fragments,
            vec![Fragment::ToolResult {
                tool_use_id: "tu1".into(),
                content: "ok".into(),
                is_error: false,
            }]
        );

        let plain = decode_agent_record(&json!({
            "type": "user",
            "message": { "content": "hello again" }
        }));
        assert!(plain.is_empty());
    }

    #[test]
    fn test_result_record_usage_and_cost() {
        let fragments = decode_agent_record(&json!({
            "type": "result",
            "subtype": "success",
            "result": "All done",
            "session_id": "s1",
            "total_cost_usd": 0.02,
            "duration_ms": 1500,
            "usage": { "input_tokens": 100, "output_tokens": 20, "cache_read_input_tokens": 7 }
        }));
        match &fragments[0] {
            Fragment::Result {
                usage,
                duration_ms,
                is_error,
                text,
                ..
            } => {
                assert_eq!(usage.input, 100);
                assert_eq!(usage.output, 20);
                assert_eq!(usage.cache_read, 7);
                assert_eq!(*duration_ms, Some(1500));
                assert!(!is_error);
                assert_eq!(text.as_deref(), Some("All done"));
            }
            other => panic!("unexpected fragment: {:?}", other),
        }
        assert_eq!(fragments[0].session_id().map(|s| s.as_str()), Some("s1"));
    }

    #[test]
    fn test_result_error_subtype() {
        let fragments = decode_agent_record(&json!({
            "type": "result",
            "subtype": "error_max_turns"
        }));
        assert!(matches!(fragments[0], Fragment::Result { is_error: true, .. }));
    }

    #[test]
    fn test_unknown_record_type() {
        let fragments = decode_agent_record(&json!({ "type": "telemetry" }));
        assert_eq!(
            fragments,
            vec![Fragment::Unknown { record_type: "telemetry".into() }]
        );
        let fragments = decode_agent_record(&json!({ "no_type": true }));
        assert!(matches!(fragments[0], Fragment::Unknown { .. }));
    }

    #[test]
    fn test_malformed_known_record_is_unknown() {
        let fragments = decode_agent_record(&json!({ "type": "assistant", "message": 5 }));
        assert_eq!(
            fragments,
            vec![Fragment::Unknown { record_type: "assistant".into() }]
        );
    }

    #[test]
    fn test_terminal_fragments() {
        assert!(Fragment::Done.is_terminal());
        assert!(Fragment::Aborted.is_terminal());
        assert!(Fragment::Error { message: "x".into() }.is_terminal());
        assert!(!Fragment::ContentDelta { text: "x".into() }.is_terminal());
    }
}

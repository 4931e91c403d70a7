//! Line-oriented decoder for agent CLI JSON event streams.
//!
//! Both CLIs print one JSON object per stdout line. Lines that are blank or
//! not JSON are skipped.

use serde::Deserialize;
use serde_json::Value;

use super::normalize_error_message;

/// Keys that may carry the session id, in priority order.
const SESSION_ID_KEYS: [&str; 4] = ["session_id", "sessionId", "thread_id", "threadId"];

/// A decoded stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLine {
    pub session_id: Option<String>,
    /// Normalized `error` field; any event type may carry one.
    pub error: Option<String>,
    pub event: StreamEvent,
}

/// Event keyed by the line's `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Assistant message.
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },

    /// Final result of the run.
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        subtype: Option<String>,
    },

    /// Tool calls, progress, system events, or a line without a type.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl AssistantMessage {
    /// Concatenated text parts, trimmed.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Other => None,
            })
            .collect::<String>()
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Shapes the `error` field shows up in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InlineError {
    Text(String),
    Detailed { message: String },
    Raw(Value),
}

impl InlineError {
    fn into_message(self) -> String {
        match self {
            Self::Text(text) | Self::Detailed { message: text } => normalize_error_message(&text),
            Self::Raw(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorField {
    #[serde(default)]
    error: Option<InlineError>,
}

/// Decode one stdout line.
pub fn decode_line(line: &str) -> Option<StreamLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;

    let session_id = SESSION_ID_KEYS.iter().find_map(|key| {
        object
            .get(*key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    });

    let error = ErrorField::deserialize(&value)
        .ok()
        .and_then(|field| field.error)
        .map(InlineError::into_message)
        .filter(|message| !message.is_empty());

    // Unknown or missing `type`, or a known type with an unexpected shape.
    let event = StreamEvent::deserialize(&value).unwrap_or(StreamEvent::Other);

    Some(StreamLine {
        session_id,
        error,
        event,
    })
}

/// Accumulates decoded lines into the pieces of an agent run.
#[derive(Debug, Default)]
pub struct Transcript {
    session_id: Option<String>,
    stream_error: Option<String>,
    final_result: Option<String>,
    assistant_text: Vec<String>,
}

impl Transcript {
    /// Start from a resumed session; the first id seen wins otherwise.
    pub fn resuming(session_id: Option<String>) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    pub fn push_line(&mut self, line: &str) {
        if let Some(decoded) = decode_line(line) {
            self.push(decoded);
        }
    }

    pub fn push(&mut self, line: StreamLine) {
        if self.session_id.is_none() {
            self.session_id = line.session_id;
        }
        if let Some(error) = line.error {
            self.stream_error = Some(error);
        }
        match line.event {
            StreamEvent::Assistant { message } => {
                let text = message.text();
                if !text.is_empty() {
                    self.assistant_text.push(text);
                }
            }
            StreamEvent::Result {
                result,
                is_error: true,
                subtype,
            } => {
                let message = result
                    .filter(|r| !r.trim().is_empty())
                    .or(subtype)
                    .unwrap_or_else(|| "agent request failed".to_string());
                self.stream_error = Some(normalize_error_message(&message));
            }
            StreamEvent::Result {
                result: Some(result),
                ..
            } => {
                let result = result.trim();
                if !result.is_empty() {
                    self.final_result = Some(result.to_string());
                }
            }
            _ => {}
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn stream_error(&self) -> Option<&str> {
        self.stream_error.as_deref().filter(|s| !s.is_empty())
    }

    /// Final result text, else the joined assistant messages.
    pub fn reply(&self) -> Option<String> {
        if let Some(result) = &self.final_result {
            return Some(result.clone());
        }
        let joined = self.assistant_text.join("\n\n");
        let joined = joined.trim();
        (!joined.is_empty()).then(|| joined.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_non_json_lines() {
        assert!(decode_line("").is_none());
        assert!(decode_line("   ").is_none());
        assert!(decode_line("Reading prompt from stdin...").is_none());
        assert!(decode_line("[1,2,3]").is_none());
    }

    #[test]
    fn session_id_aliases_in_priority_order() {
        let line = decode_line(r#"{"type":"thread.started","thread_id":"th-1"}"#).unwrap();
        assert_eq!(line.session_id.as_deref(), Some("th-1"));

        let line = decode_line(r#"{"threadId":"th-2","session_id":"s-1"}"#).unwrap();
        assert_eq!(line.session_id.as_deref(), Some("s-1"));

        let line = decode_line(r#"{"sessionId":"s-2"}"#).unwrap();
        assert_eq!(line.session_id.as_deref(), Some("s-2"));
    }

    #[test]
    fn decodes_assistant_text_parts() {
        let line = decode_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello "},{"type":"tool_use","name":"x"},{"type":"text","text":"world"}]}}"#,
        )
        .unwrap();
        let StreamEvent::Assistant { message } = line.event else {
            panic!("expected assistant event, got {:?}", line.event);
        };
        assert_eq!(message.content.len(), 3);
        assert_eq!(message.text(), "Hello world");
    }

    #[test]
    fn unknown_or_missing_type_is_other() {
        let line = decode_line(r#"{"type":"thread.started","thread_id":"th-1"}"#).unwrap();
        assert_eq!(line.event, StreamEvent::Other);

        let line = decode_line(r#"{"session_id":"s-1"}"#).unwrap();
        assert_eq!(line.event, StreamEvent::Other);

        // Known tag with an unexpected shape.
        let line = decode_line(r#"{"type":"result","result":{"nested":true}}"#).unwrap();
        assert_eq!(line.event, StreamEvent::Other);
    }

    #[test]
    fn decodes_result_fields() {
        let line =
            decode_line(r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#)
                .unwrap();
        assert_eq!(
            line.event,
            StreamEvent::Result {
                result: Some("done".into()),
                is_error: false,
                subtype: Some("success".into()),
            }
        );
        assert!(line.error.is_none());
    }

    #[test]
    fn error_field_is_read_from_any_line() {
        let line = decode_line(r#"{"type":"turn.failed","error":{"message":"rate limited"}}"#).unwrap();
        assert_eq!(line.error.as_deref(), Some("rate limited"));
        assert_eq!(line.event, StreamEvent::Other);

        let line = decode_line(r#"{"type":"system","error":null}"#).unwrap();
        assert!(line.error.is_none());

        let line = decode_line(r#"{"error":{"code":7}}"#).unwrap();
        assert_eq!(line.error.as_deref(), Some(r#"{"code":7}"#));
    }

    #[test]
    fn transcript_prefers_final_result() {
        let mut t = Transcript::default();
        t.push_line(r#"{"type":"system","session_id":"abc"}"#);
        t.push_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"draft"}]}}"#);
        t.push_line(r#"{"type":"result","result":"  final answer  ","session_id":"other"}"#);
        assert_eq!(t.session_id(), Some("abc"));
        assert_eq!(t.reply().as_deref(), Some("final answer"));
        assert!(t.stream_error().is_none());
    }

    #[test]
    fn transcript_joins_assistant_text_without_result() {
        let mut t = Transcript::resuming(Some("resumed".into()));
        t.push_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"one"}]}}"#);
        t.push_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"two"}]}}"#);
        t.push_line(r#"{"session_id":"new"}"#);
        assert_eq!(t.session_id(), Some("resumed"));
        assert_eq!(t.reply().as_deref(), Some("one\n\ntwo"));
    }

    #[test]
    fn transcript_records_errors() {
        let mut t = Transcript::default();
        t.push_line(r#"{"type":"result","is_error":true,"subtype":"error_max_turns"}"#);
        assert_eq!(t.stream_error(), Some("error_max_turns"));

        t.push_line(r#"{"error":"{\"detail\":\"quota exceeded\"}"}"#);
        assert_eq!(t.stream_error(), Some("quota exceeded"));
        assert!(t.reply().is_none());
    }
}

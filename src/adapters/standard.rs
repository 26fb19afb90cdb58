//! OpenAI-compatible delta dialect: each line is a JSON object carrying
//! `choices[0].delta.content` and/or `choices[0].delta.reasoning_content`.
//! Some deployments send the whole finished answer as a bare top-level
//! `content` field; that maps to a single `Chunk` too.

use super::LineParse;
use crate::types::ChatEvent;
use serde::Deserialize;

const DONE_MARKER: &str = "[DONE]";

#[derive(Deserialize)]
struct DeltaLine {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Parse one delta-JSON payload. Returns `None` when the payload is not
/// valid JSON; `Some(vec![])` when it parsed but carried no text.
pub(super) fn delta_events(json: &str) -> Option<Vec<ChatEvent>> {
    let line: DeltaLine = match serde_json::from_str(json) {
        Ok(l) => l,
        Err(e) => {
            tracing::debug!("unparseable delta line ({}): {}", e, snippet(json));
            return None;
        }
    };

    let mut events = Vec::new();
    if let Some(choice) = line.choices.first() {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                events.push(ChatEvent::chunk(content.clone()));
            }
        }
        if let Some(reasoning) = &choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                events.push(ChatEvent::thinking(reasoning.clone()));
            }
        }
    } else if let Some(content) = &line.content {
        // Complete-answer form: the provider sent the full text at once.
        if !content.is_empty() {
            events.push(ChatEvent::chunk(content.clone()));
        }
    }
    Some(events)
}

pub fn parse_line(line: &str) -> LineParse {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineParse::Skip;
    }

    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None => trimmed,
    };

    if payload == DONE_MARKER {
        return LineParse::Done;
    }

    match delta_events(payload) {
        Some(events) if events.is_empty() => LineParse::Skip,
        Some(events) => LineParse::Events(events),
        None => LineParse::Skip,
    }
}

fn snippet(data: &str) -> &str {
    let end = data
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(data.len());
    &data[..end]
}

#[cfg(test)]
mod parsing_tests {
    use super::*;

    #[test]
    fn test_content_delta_maps_to_chunk() {
        let parsed = parse_line(r#"{"choices":[{"delta":{"content":"Hello"}}]}"#);
        assert_eq!(parsed, LineParse::Events(vec![ChatEvent::chunk("Hello")]));
    }

    #[test]
    fn test_reasoning_delta_maps_to_thinking() {
        let parsed = parse_line(r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#);
        assert_eq!(parsed, LineParse::Events(vec![ChatEvent::thinking("hmm")]));
    }

    #[test]
    fn test_both_fields_emit_two_events() {
        let parsed =
            parse_line(r#"{"choices":[{"delta":{"content":"a","reasoning_content":"b"}}]}"#);
        assert_eq!(
            parsed,
            LineParse::Events(vec![ChatEvent::chunk("a"), ChatEvent::thinking("b")])
        );
    }

    #[test]
    fn test_empty_delta_is_skipped() {
        assert_eq!(parse_line(r#"{"choices":[{"delta":{}}]}"#), LineParse::Skip);
        assert_eq!(
            parse_line(r#"{"choices":[{"delta":{"content":""}}]}"#),
            LineParse::Skip
        );
    }

    #[test]
    fn test_complete_answer_content_field() {
        let parsed = parse_line(r#"{"content":"full answer"}"#);
        assert_eq!(
            parsed,
            LineParse::Events(vec![ChatEvent::chunk("full answer")])
        );
    }

    #[test]
    fn test_data_prefix_and_done_marker() {
        let parsed = parse_line(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#);
        assert_eq!(parsed, LineParse::Events(vec![ChatEvent::chunk("x")]));
        assert_eq!(parse_line("data: [DONE]"), LineParse::Done);
        assert_eq!(parse_line("[DONE]"), LineParse::Done);
    }

    #[test]
    fn test_malformed_json_is_swallowed() {
        assert_eq!(parse_line(r#"{"choices": broken"#), LineParse::Skip);
        assert_eq!(parse_line(""), LineParse::Skip);
    }
}

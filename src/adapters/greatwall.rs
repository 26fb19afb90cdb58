//! GreatWall bespoke dialect. Lines are either standalone `{...}` JSON
//! envelopes or legacy `event:`/`data:`-prefixed SSE lines; each envelope
//! carries an `event` discriminator. `message_finished` replays the complete
//! output as one final `Chunk`, additive to the incremental `llm_chunk`
//! deltas already emitted — consumers must tolerate the replay.

use super::LineParse;
use crate::types::ChatEvent;
use serde::Deserialize;

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: EnvelopeData,
}

#[derive(Deserialize, Default)]
struct EnvelopeData {
    #[serde(default)]
    choices: Vec<EnvelopeChoice>,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Deserialize)]
struct EnvelopeChoice {
    #[serde(default)]
    delta: EnvelopeDelta,
}

#[derive(Deserialize, Default)]
struct EnvelopeDelta {
    #[serde(default)]
    content: Option<String>,
}

fn is_valid_line(trimmed: &str) -> bool {
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || trimmed.starts_with("data:")
        || trimmed.starts_with("event:")
}

/// Pull the JSON payload out of a valid line. Legacy `event:` lines name the
/// event that the following `data:` line carries; they hold no payload.
fn extract_json(trimmed: &str) -> Option<&str> {
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    if let Some(rest) = trimmed.strip_prefix("data:") {
        let rest = rest.trim();
        if !rest.is_empty() {
            return Some(rest);
        }
    }
    None
}

pub fn parse_line(line: &str) -> LineParse {
    let trimmed = line.trim();
    if trimmed.is_empty() || !is_valid_line(trimmed) {
        return LineParse::Skip;
    }

    let json = match extract_json(trimmed) {
        Some(j) => j,
        None => return LineParse::Skip,
    };

    let envelope: Envelope = match serde_json::from_str(json) {
        Ok(e) => e,
        Err(e) => {
            // Individual parse failures never abort the stream.
            tracing::error!("failed to parse greatwall line: {}", e);
            return LineParse::Skip;
        }
    };

    match envelope.event.as_str() {
        "message_start" => LineParse::Events(vec![ChatEvent::start("processing")]),
        "llm_chunk" => {
            let content = envelope
                .data
                .choices
                .first()
                .and_then(|c| c.delta.content.as_deref())
                .unwrap_or("");
            if content.is_empty() {
                LineParse::Skip
            } else {
                LineParse::Events(vec![ChatEvent::chunk(content)])
            }
        }
        "message_finished" => match envelope.data.output.as_deref() {
            Some(output) if !output.is_empty() => {
                LineParse::Events(vec![ChatEvent::chunk(output)])
            }
            _ => LineParse::Skip,
        },
        // llm_finished and anything unrecognized are informational only.
        other => {
            if other != "llm_finished" {
                tracing::debug!("unhandled greatwall event: {}", other);
            }
            LineParse::Skip
        }
    }
}

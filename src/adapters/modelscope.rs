//! ModelScope/Qwen raw-JSON dialect: the body is a sequence of bare `{...}`
//! JSON lines with a literal `[DONE]` sentinel as terminator. No `data:`
//! framing; anything that is neither a JSON object nor the sentinel is
//! filtered out before parsing.

use super::{standard, LineParse};

const DONE_MARKER: &str = "[DONE]";

pub fn parse_line(line: &str) -> LineParse {
    let trimmed = line.trim();

    if trimmed == DONE_MARKER {
        return LineParse::Done;
    }
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return LineParse::Skip;
    }

    match standard::delta_events(trimmed) {
        Some(events) if events.is_empty() => {
            // Keep-alive or usage-only line; non-fatal.
            tracing::debug!("modelscope line carried no content: {}", trimmed);
            LineParse::Skip
        }
        Some(events) => LineParse::Events(events),
        None => LineParse::Skip,
    }
}

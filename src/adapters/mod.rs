//! Upstream wire-format adapters. Each dialect turns one raw line from the
//! provider's HTTP body into zero or more [`ChatEvent`]s; [`normalize`] wraps
//! a framed line stream into the lazy event sequence the orchestrator
//! consumes. Transport failures become a single in-band `Error` event — the
//! caller never sees a raised error from the sequence itself.

pub mod greatwall;
pub mod modelscope;
pub mod standard;

use crate::types::ChatEvent;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_util::codec::LinesCodecError;

/// The three known upstream wire formats. Hand-coded, not a plugin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// OpenAI-compatible delta JSON lines.
    Standard,
    /// GreatWall bespoke `event`-discriminated JSON-in-SSE.
    Greatwall,
    /// ModelScope/Qwen raw JSON lines terminated by a `[DONE]` sentinel.
    Modelscope,
}

impl Dialect {
    pub fn parse_line(&self, line: &str) -> LineParse {
        match self {
            Dialect::Standard => standard::parse_line(line),
            Dialect::Greatwall => greatwall::parse_line(line),
            Dialect::Modelscope => modelscope::parse_line(line),
        }
    }
}

/// Outcome of parsing a single upstream line.
#[derive(Debug, PartialEq)]
pub enum LineParse {
    /// Zero or more events extracted from the line.
    Events(Vec<ChatEvent>),
    /// The line terminates the sequence without emitting anything.
    Done,
    /// Filtered, unparseable, or informational line; nothing emitted.
    Skip,
}

struct NormalizeState<S> {
    dialect: Dialect,
    lines: S,
    pending: VecDeque<ChatEvent>,
    finished: bool,
    line_count: usize,
    max_lines: usize,
}

/// Turn a framed line stream into a lazy, finite sequence of events. The
/// sequence ends when the upstream body ends, the dialect's terminator is
/// seen, or the line limit is exceeded; an I/O failure mid-body yields one
/// trailing `Error` event and then the end of the sequence.
pub fn normalize<S>(
    dialect: Dialect,
    lines: S,
    max_lines: usize,
) -> impl Stream<Item = ChatEvent> + Send
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Send + Unpin + 'static,
{
    let state = NormalizeState {
        dialect,
        lines,
        pending: VecDeque::new(),
        finished: false,
        line_count: 0,
        max_lines,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.finished {
                return None;
            }

            match st.lines.next().await {
                Some(Ok(line)) => {
                    st.line_count += 1;
                    if st.line_count > st.max_lines {
                        tracing::error!(
                            "upstream stream exceeded max line limit ({})",
                            st.max_lines
                        );
                        st.finished = true;
                        st.pending
                            .push_back(ChatEvent::error("upstream stream exceeded line limit"));
                        continue;
                    }
                    match st.dialect.parse_line(&line) {
                        LineParse::Events(events) => st.pending.extend(events),
                        LineParse::Done => st.finished = true,
                        LineParse::Skip => {}
                    }
                }
                Some(Err(e)) => {
                    tracing::error!("upstream line read failed: {}", e);
                    st.finished = true;
                    st.pending.push_back(ChatEvent::error(format!(
                        "upstream connection interrupted: {}",
                        e
                    )));
                }
                None => st.finished = true,
            }
        }
    })
}

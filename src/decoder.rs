//! Client-side reassembly of the wire stream.
//!
//! Bytes are buffered and split on the frame separator at byte level, so a
//! stream chunked at arbitrary points (even inside a multi-byte character)
//! decodes exactly like one delivered whole. Malformed frames are dropped
//! without ending the turn; a stream that closes before `data: [DONE]` is
//! reported as aborted with its partial text kept.

use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::encoder::FRAME_PREFIX;
use crate::error::RelayError;

const SEPARATOR: &[u8] = b"\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// Full accumulated text after an accepted frame.
    Text(String),
    /// The sentinel frame arrived.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Streaming,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub text: String,
    pub status: TurnStatus,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == TurnStatus::Completed
    }

    /// `Err(StreamAborted)` unless the sentinel was received.
    pub fn into_result(self) -> Result<String, RelayError> {
        match self.status {
            TurnStatus::Completed => Ok(self.text),
            TurnStatus::Aborted => Err(RelayError::StreamAborted),
        }
    }
}

// Lenient client-side view of a frame payload.
#[derive(Deserialize)]
struct FrameDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct FrameChoice {
    delta: FrameDelta,
}

#[derive(Deserialize)]
struct FramePayload {
    #[serde(default)]
    choices: Option<Vec<FrameChoice>>,
}

enum Segment {
    Ignored,
    Done,
    Delta(Option<String>),
    Malformed(String),
}

fn parse_segment(raw: &[u8]) -> Segment {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return Segment::Ignored;
    }
    let Some(data) = line.strip_prefix(FRAME_PREFIX) else {
        return Segment::Ignored;
    };
    let data = data.trim_start();
    if data.is_empty() {
        return Segment::Ignored;
    }
    if data == "[DONE]" {
        return Segment::Done;
    }
    match serde_json::from_str::<FramePayload>(data) {
        Ok(payload) => Segment::Delta(
            payload
                .choices
                .and_then(|c| c.into_iter().next())
                .and_then(|c| c.delta.content),
        ),
        Err(e) => Segment::Malformed(e.to_string()),
    }
}

/// Incremental frame decoder for one turn.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    text: String,
    state: DecoderState,
    dropped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            text: String::new(),
            state: DecoderState::Streaming,
            dropped: 0,
        }
    }

    /// Append `bytes` and process every complete frame. The trailing partial
    /// frame stays buffered. Input after the sentinel is ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if self.state != DecoderState::Streaming {
            return events;
        }
        self.pending.extend_from_slice(bytes);

        while let Some(pos) = find_separator(&self.pending) {
            let segment: Vec<u8> = self.pending.drain(..pos + SEPARATOR.len()).take(pos).collect();
            match parse_segment(&segment) {
                Segment::Ignored | Segment::Delta(None) => {}
                Segment::Delta(Some(delta)) => {
                    self.text.push_str(&delta);
                    events.push(DecodeEvent::Text(self.text.clone()));
                }
                Segment::Malformed(reason) => {
                    self.dropped += 1;
                    warn!(error = %RelayError::MalformedFrame(reason), "dropping frame");
                }
                Segment::Done => {
                    self.state = DecoderState::Done;
                    self.pending.clear();
                    events.push(DecodeEvent::Done);
                    break;
                }
            }
        }
        events
    }

    /// Mark end of input. Without a sentinel the turn is aborted; any
    /// buffered partial frame is discarded.
    pub fn finish(&mut self) -> DecoderState {
        if self.state == DecoderState::Streaming {
            if !self.pending.is_empty() {
                debug!(bytes = self.pending.len(), "discarding incomplete trailing frame");
                self.pending.clear();
            }
            self.state = DecoderState::Aborted;
        }
        self.state
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == DecoderState::Done
    }

    /// Number of malformed frames dropped so far.
    pub fn dropped_frames(&self) -> usize {
        self.dropped
    }

    pub fn into_outcome(mut self) -> TurnOutcome {
        let status = match self.finish() {
            DecoderState::Done => TurnStatus::Completed,
            _ => TurnStatus::Aborted,
        };
        TurnOutcome {
            text: self.text,
            status,
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(SEPARATOR.len()).position(|w| w == SEPARATOR)
}

/// Receives the full accumulated text after every accepted frame.
pub trait Renderer {
    fn render(&mut self, text: &str);
}

impl<F: FnMut(&str)> Renderer for F {
    fn render(&mut self, text: &str) {
        self(text)
    }
}

/// Drive one turn's byte stream to completion.
///
/// A transport error counts as end of input. Reading stops at the sentinel.
/// Dropping the returned future stops reading; nothing is kept for the next
/// turn.
pub async fn read_turn<S, B, E, R>(body: S, renderer: &mut R) -> TurnOutcome
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    R: Renderer + ?Sized,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = FrameDecoder::new();

    while let Some(item) = body.next().await {
        match item {
            Ok(bytes) => {
                for event in decoder.feed(bytes.as_ref()) {
                    if let DecodeEvent::Text(text) = event {
                        renderer.render(&text);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "stream read failed");
                break;
            }
        }
        if decoder.is_done() {
            break;
        }
    }

    decoder.into_outcome()
}

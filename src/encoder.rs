//! Server-side wire framing: `data: <json>\n\n` per delta, `data: [DONE]\n\n`
//! at normal end.

use futures_util::stream::{self, Stream, StreamExt};

use crate::dispatcher::EventStream;
use crate::error::Result;
use crate::providers::StreamChunk;

pub const FRAME_PREFIX: &str = "data:";
pub const FRAME_SEPARATOR: &str = "\n\n";
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Delta(String),
    Done,
}

pub fn encode_frame(frame: &StreamFrame) -> String {
    match frame {
        StreamFrame::Delta(text) => {
            // A String-only struct cannot fail to serialize.
            let json = serde_json::to_string(&StreamChunk::delta(text.as_str())).unwrap_or_default();
            format!("data: {json}\n\n")
        }
        StreamFrame::Done => DONE_FRAME.to_string(),
    }
}

/// Encode an upstream event stream.
///
/// Chunks without (or with empty) `delta.content` are skipped. On exhaustion
/// exactly one sentinel frame follows. On an upstream error the error is
/// yielded and the stream ends without a sentinel.
pub fn encode(events: EventStream) -> impl Stream<Item = Result<String>> + Send {
    enum Phase {
        Streaming(EventStream),
        Finished,
    }

    stream::unfold(Phase::Streaming(events), |phase| async move {
        let Phase::Streaming(mut events) = phase else {
            return None;
        };
        loop {
            match events.next().await {
                Some(Ok(chunk)) => {
                    let Some(text) = chunk.content().filter(|t| !t.is_empty()) else {
                        continue;
                    };
                    let frame = encode_frame(&StreamFrame::Delta(text.to_string()));
                    return Some((Ok(frame), Phase::Streaming(events)));
                }
                Some(Err(e)) => return Some((Err(e), Phase::Finished)),
                None => return Some((Ok(DONE_FRAME.to_string()), Phase::Finished)),
            }
        }
    })
}

//! Development stand-in for moderation + dispatch + encoding: a deterministic
//! lorem ipsum stream at a fixed cadence, in the same wire format.

use std::time::Duration;

use futures_util::stream::{self, Stream};

use crate::encoder::{encode_frame, StreamFrame, DONE_FRAME};
use crate::validator::parse_request;

pub const GROUP_SIZE: usize = 6;
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(40);
pub const MIN_WORDS: usize = 80;
pub const MAX_WORDS: usize = 220;
pub const WORDS_PER_MESSAGE: usize = 40;
/// Word count used when the request body cannot be parsed.
pub const FALLBACK_WORDS: usize = 120;

pub const LOREM_WORDS: [&str; 52] = [
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua", "ut",
    "enim", "ad", "minim", "veniam", "quis", "nostrud", "exercitation", "ullamco", "laboris",
    "nisi", "ut", "aliquip", "ex", "ea", "commodo", "consequat", "duis", "aute", "irure", "dolor",
    "in", "reprehenderit", "in", "voluptate", "velit", "esse", "cillum", "dolore", "eu", "fugiat",
    "nulla", "pariatur",
];

/// `clamp(max(80, message_count * 40), upper = 220)`.
pub fn word_count(message_count: usize) -> usize {
    message_count
        .saturating_mul(WORDS_PER_MESSAGE)
        .clamp(MIN_WORDS, MAX_WORDS)
}

/// Word count for a raw request body; unparseable bodies get the fallback.
pub fn word_count_for_body(raw: &[u8]) -> usize {
    match parse_request(raw) {
        Ok(req) => word_count(req.messages.len()),
        Err(_) => FALLBACK_WORDS.clamp(MIN_WORDS, MAX_WORDS),
    }
}

/// Deterministic seed text: vocabulary cycled by index, capitalized, with a
/// closing period.
pub fn seed_text(words: usize) -> String {
    let sentence = (0..words)
        .map(|i| LOREM_WORDS[i % LOREM_WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ");
    let mut chars = sentence.chars();
    match chars.next() {
        Some(first) => format!("{}{}.", first.to_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

/// Split `text` into the delta strings the generator emits: groups of
/// [`GROUP_SIZE`] words, each followed by a space except the last group.
pub fn word_groups(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let group_count = words.len().div_ceil(GROUP_SIZE);
    words
        .chunks(GROUP_SIZE)
        .enumerate()
        .map(|(i, group)| {
            let mut joined = group.join(" ");
            if i + 1 < group_count {
                joined.push(' ');
            }
            joined
        })
        .collect()
}

/// Encoded frames for `text`, one per word group, each followed by a
/// `cadence` pause, then the sentinel.
pub fn simulate(text: &str, cadence: Duration) -> impl Stream<Item = String> + Send {
    struct Gen {
        groups: std::vec::IntoIter<String>,
        pause_owed: bool,
        done: bool,
    }

    let state = Gen {
        groups: word_groups(text).into_iter(),
        pause_owed: false,
        done: false,
    };
    stream::unfold(state, move |mut st| async move {
        if st.done {
            return None;
        }
        // The previous frame has been handed over; its pause runs now.
        if st.pause_owed {
            tokio::time::sleep(cadence).await;
        }
        match st.groups.next() {
            Some(group) => {
                st.pause_owed = true;
                Some((encode_frame(&StreamFrame::Delta(group)), st))
            }
            None => {
                st.done = true;
                Some((DONE_FRAME.to_string(), st))
            }
        }
    })
}

//! Incremental segmentation of the streamed LLM reply.
//!
//! The chat backend is prompted to wrap every spoken line in a speaker
//! structure:
//!
//! ```text
//! [[/speaker_start]说话人[/speaker_end]]说话内容
//! [/say_end]
//! ```
//!
//! Fragments arrive from the stream with no alignment guarantees — a marker
//! may be split at any byte, one fragment may close several structures, and
//! text outside a structure is legal. The segmenter is a pure state machine
//! from (state, fragment) to (state, ordered events): no I/O, fully
//! testable, and chunking-invariant — any way of splitting the input into
//! `push` calls yields the same event list.
//!
//! To keep end-to-end latency low, speech content is emitted before the
//! closing marker arrives: at every newline, and once the buffered content
//! reaches 15 characters ending on closing punctuation.

use crate::pipeline::messages::SegmentEvent;

/// Literal marker opening a speaker tag.
pub const SPEAKER_START: &str = "[[/speaker_start]";
/// Literal marker closing a speaker tag.
pub const SPEAKER_END: &str = "[/speaker_end]]";
/// Literal marker closing the spoken content of a structure.
pub const SPEECH_END: &str = "[/say_end]";

/// Minimum buffered characters before the sentence sub-rule may emit.
const MIN_SENTENCE_CHARS: usize = 15;

/// Speaker used when a tag resolves to an empty name, so every speech
/// event carries a non-empty speaker.
const FALLBACK_SPEAKER: &str = "unknown";

/// Splits text into sentences. The shipped implementation is rule-based;
/// model-backed splitters plug in through this seam.
pub trait SentenceSplit {
    /// Partition `text` into consecutive sentences. Concatenating the
    /// returned pieces must reproduce `text` exactly.
    fn split(&self, text: &str) -> Vec<String>;
}

/// Rule-based splitter over the Chinese closing-punctuation set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleSplit;

impl SentenceSplit for RuleSplit {
    fn split(&self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            current.push(c);
            if is_terminal_char(c) {
                // Keep a trailing close-quote with its sentence (。”).
                if chars.peek() == Some(&'”') {
                    current.push(chars.next().unwrap_or('”'));
                }
                sentences.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            sentences.push(current);
        }
        sentences
    }
}

/// Characters that terminate a sentence for splitting purposes.
fn is_terminal_char(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '；' | '…' | '\n')
}

/// Whether a sentence ends on closing punctuation.
fn is_closed_sentence(sentence: &str) -> bool {
    const CLOSERS: [&str; 9] = ["。", "！", "？", "；", "…", "。”", "！”", "？”", "\n"];
    let sentence = sentence.trim();
    CLOSERS.iter().any(|p| sentence.ends_with(p))
}

/// Parse position within the speaker structure grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for `SPEAKER_START`; buffered text is untagged.
    Idle,
    /// Between `SPEAKER_START` and `SPEAKER_END`; buffering the name.
    InSpeakerTag,
    /// Between `SPEAKER_END` and `SPEECH_END`; buffering spoken content.
    InContent,
}

/// Streaming segmenter for speaker-tagged LLM output.
pub struct SpeechSegmenter {
    splitter: Box<dyn SentenceSplit + Send>,
    state: State,
    /// Unconsumed input for the current state.
    buffer: String,
    /// Speaker of the structure currently open; valid in `InContent`.
    speaker: String,
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechSegmenter {
    /// Segmenter with the rule-based sentence splitter.
    pub fn new() -> Self {
        Self::with_splitter(Box::new(RuleSplit))
    }

    /// Segmenter with a custom sentence splitter.
    pub fn with_splitter(splitter: Box<dyn SentenceSplit + Send>) -> Self {
        Self {
            splitter,
            state: State::Idle,
            buffer: String::new(),
            speaker: String::new(),
        }
    }

    /// Feed a fragment of streamed text; returns the events it closed.
    ///
    /// A marker that has not fully arrived is not an error — the unmatched
    /// suffix is retained and re-examined on the next push.
    pub fn push(&mut self, fragment: &str) -> Vec<SegmentEvent> {
        self.buffer.push_str(fragment);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::Idle => {
                    let Some(idx) = self.buffer.find(SPEAKER_START) else {
                        break;
                    };
                    // Text ahead of the structure is untagged. A stray
                    // SPEECH_END out here is malformed input; drop it
                    // silently so markers never reach an event.
                    let prefix = self.buffer[..idx].replace(SPEECH_END, "");
                    let prefix = prefix.trim();
                    if !prefix.is_empty() {
                        events.push(SegmentEvent::text(prefix));
                    }
                    self.buffer.drain(..idx + SPEAKER_START.len());
                    self.state = State::InSpeakerTag;
                }
                State::InSpeakerTag => {
                    let Some(idx) = self.buffer.find(SPEAKER_END) else {
                        break;
                    };
                    let name = self.buffer[..idx].trim();
                    self.speaker = if name.is_empty() {
                        FALLBACK_SPEAKER.to_owned()
                    } else {
                        name.to_owned()
                    };
                    self.buffer.drain(..idx + SPEAKER_END.len());
                    self.state = State::InContent;
                }
                State::InContent => {
                    if !self.drain_content(&mut events) {
                        break;
                    }
                }
            }
        }

        events
    }

    /// Emit everything currently extractable from the content buffer.
    ///
    /// Emission triggers fire in the order their last byte arrives from the
    /// stream — sentence boundary, newline, closing marker — which is what
    /// makes the output independent of how the input was chunked.
    ///
    /// Returns `true` when the structure closed (`SPEECH_END` consumed) and
    /// the outer loop should continue in `Idle`, `false` when more input is
    /// needed.
    fn drain_content(&mut self, events: &mut Vec<SegmentEvent>) -> bool {
        loop {
            let end_idx = self.buffer.find(SPEECH_END);
            let limit = end_idx.unwrap_or(self.buffer.len());
            let region = &self.buffer[..limit];
            let newline_idx = region.find('\n');
            let sentence_end = self.shortest_closed_prefix(region);

            if let Some(sb) = sentence_end
                && newline_idx.is_none_or(|nl| sb <= nl)
            {
                // A qualifying sentence closed before any newline: emit it.
                let prefix = self.buffer[..sb].to_owned();
                events.push(SegmentEvent::speech(self.speaker.clone(), prefix));
                self.buffer.drain(..sb);
            } else if let Some(nl) = newline_idx {
                // Line break ahead of the closing marker: emit the line early.
                let line = self.buffer[..nl].trim();
                if !line.is_empty() {
                    events.push(SegmentEvent::speech(self.speaker.clone(), line));
                }
                self.buffer.drain(..nl + 1);
            } else if let Some(end) = end_idx {
                // Structure closes here: flush the residual content.
                let residual = self.buffer[..end].trim();
                if !residual.is_empty() {
                    events.push(SegmentEvent::speech(self.speaker.clone(), residual));
                }
                self.buffer.drain(..end + SPEECH_END.len());
                self.state = State::Idle;
                self.speaker.clear();
                return true;
            } else {
                return false;
            }
        }
    }

    /// Sentence sub-rule: byte end of the shortest sentence-prefix of
    /// `region` that reaches 15 characters and ends on closing punctuation.
    fn shortest_closed_prefix(&self, region: &str) -> Option<usize> {
        let mut chars_seen = 0;
        let mut bytes_seen = 0;
        for sentence in self.splitter.split(region) {
            chars_seen += sentence.chars().count();
            bytes_seen += sentence.len();
            if chars_seen >= MIN_SENTENCE_CHARS && is_closed_sentence(&sentence) {
                return Some(bytes_seen);
            }
        }
        None
    }

    /// Flush residual buffered content at stream end and reset to `Idle`.
    ///
    /// Untagged residue becomes a `Text` event, open content becomes a final
    /// `Speech` event; an unterminated speaker tag is dropped. Any
    /// `SPEECH_END` fragments left in the residue are stripped.
    pub fn flush(&mut self) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        let residual = self.buffer.replace(SPEECH_END, "");
        let residual = residual.trim();

        match self.state {
            State::Idle => {
                if !residual.is_empty() {
                    events.push(SegmentEvent::text(residual));
                }
            }
            State::InSpeakerTag => {}
            State::InContent => {
                if !residual.is_empty() {
                    events.push(SegmentEvent::speech(self.speaker.clone(), residual));
                }
            }
        }

        self.buffer.clear();
        self.speaker.clear();
        self.state = State::Idle;
        events
    }
}

//! Bounded conversation history with periodic summarization compaction.
//!
//! The history is owned by the pipeline supervisor's dispatcher; other
//! stages only ever see snapshots via [`ChatHistory::messages_for_model`].
//! Once the total turn count passes `max_history`, every
//! `compress_interval` turns the older part of the log is folded into a
//! single system-role summary produced by the chat backend, so the prompt
//! stays bounded while keeping long-range context.

use crate::error::Result;
use crate::pipeline::messages::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Tag prefixed to the summary message produced by compression.
const SUMMARY_TAG: &str = "[历史摘要]";

/// Produces a free-form completion for a summarization prompt.
///
/// Implemented by the chat client; tests substitute a canned one.
pub trait Summarizer {
    fn summarize(&self, prompt: &str) -> Result<String>;
}

/// Persisted form of the history file.
#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    total_turns: u64,
    history: Vec<ChatMessage>,
}

/// Bounded dialog log with monotonically growing turn count.
#[derive(Debug, Default, Clone)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
    total_turns: u64,
    max_history: u64,
    compress_interval: u64,
}

impl ChatHistory {
    pub fn new(max_history: u64, compress_interval: u64) -> Self {
        Self {
            messages: Vec::new(),
            total_turns: 0,
            max_history,
            compress_interval,
        }
    }

    /// Append one message. A user message starts a new turn.
    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
        if role == Role::User {
            self.total_turns += 1;
        }
    }

    /// Snapshot of the current log for prompt assembly.
    pub fn messages_for_model(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn total_turns(&self) -> u64 {
        self.total_turns
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Compress the log if it is due: once `total_turns` has reached
    /// `max_history`, every `compress_interval` turns all messages except
    /// the most recent `compress_interval` are replaced by one system-role
    /// summary. A failed summarization leaves the log untouched.
    pub fn maybe_compress(&mut self, summarizer: &dyn Summarizer, summarize_prompt: &str) {
        if self.compress_interval == 0
            || self.total_turns < self.max_history
            || self.total_turns % self.compress_interval != 0
        {
            return;
        }

        let keep = self.compress_interval as usize;
        if self.messages.len() <= keep {
            return;
        }

        let split_at = self.messages.len() - keep;
        let transcript: String = self.messages[..split_at]
            .iter()
            .map(|m| format!("{}: {}\n", role_label(m.role), m.content))
            .collect();
        let prompt = format!("{summarize_prompt}\n\n{transcript}");

        match summarizer.summarize(&prompt) {
            Ok(summary) => {
                let mut compressed =
                    vec![ChatMessage::new(Role::System, format!("{SUMMARY_TAG} {summary}"))];
                compressed.extend_from_slice(&self.messages[split_at..]);
                info!(
                    folded = split_at,
                    kept = keep,
                    "compressed history into summary"
                );
                self.messages = compressed;
            }
            Err(e) => warn!("history summarization failed, keeping log as-is: {e}"),
        }
    }

    /// Persist the log as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = HistoryFile {
            total_turns: self.total_turns,
            history: self.messages.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| crate::error::SpeechError::History(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a previously saved log. Best-effort: a missing or malformed
    /// file yields an empty store with the configured bounds.
    pub fn load(path: &Path, max_history: u64, compress_interval: u64) -> Self {
        let mut history = Self::new(max_history, compress_interval);
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => {
                info!("no history at {}, starting fresh", path.display());
                return history;
            }
        };
        match serde_json::from_str::<HistoryFile>(&content) {
            Ok(file) => {
                history.total_turns = file.total_turns;
                history.messages = file.history;
                info!(
                    turns = history.total_turns,
                    messages = history.messages.len(),
                    "loaded history from {}",
                    path.display()
                );
            }
            Err(e) => warn!("malformed history file {}: {e}; starting fresh", path.display()),
        }
        history
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpeechError;

    struct CannedSummarizer(&'static str);

    impl Summarizer for CannedSummarizer {
        fn summarize(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_owned())
        }
    }

    struct FailingSummarizer;

    impl Summarizer for FailingSummarizer {
        fn summarize(&self, _prompt: &str) -> Result<String> {
            Err(SpeechError::Llm("backend down".into()))
        }
    }

    fn history_with_turns(turns: u64, max_history: u64, compress_interval: u64) -> ChatHistory {
        let mut history = ChatHistory::new(max_history, compress_interval);
        for n in 0..turns {
            history.append(Role::User, format!("问题{n}"));
            history.append(Role::Assistant, format!("回答{n}"));
        }
        history
    }

    #[test]
    fn turn_count_follows_user_messages() {
        let history = history_with_turns(4, 30, 20);
        assert_eq!(history.total_turns(), 4);
        assert_eq!(history.len(), 8);
    }

    #[test]
    fn compression_keeps_tail_and_turn_count() {
        let mut history = history_with_turns(6, 6, 3);
        let tail_before: Vec<_> = history.messages_for_model()[9..].to_vec();

        history.maybe_compress(&CannedSummarizer("六轮对话的摘要"), "总结");

        let messages = history.messages_for_model();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.starts_with("[历史摘要]"));
        assert!(messages[0].content.contains("六轮对话的摘要"));
        // The last compress_interval messages are bit-identical.
        assert_eq!(&messages[1..], tail_before.as_slice());
        assert_eq!(history.total_turns(), 6);
    }

    #[test]
    fn compression_waits_for_max_history() {
        let mut history = history_with_turns(3, 6, 3);
        history.maybe_compress(&CannedSummarizer("摘要"), "总结");
        assert_eq!(history.len(), 6);
    }

    #[test]
    fn compression_skips_off_interval_turns() {
        let mut history = history_with_turns(7, 6, 3);
        history.maybe_compress(&CannedSummarizer("摘要"), "总结");
        assert_eq!(history.len(), 14);
    }

    #[test]
    fn failed_summarization_leaves_history_unchanged() {
        let mut history = history_with_turns(6, 6, 3);
        let before = history.messages_for_model();
        history.maybe_compress(&FailingSummarizer, "总结");
        assert_eq!(history.messages_for_model(), before);
        assert_eq!(history.total_turns(), 6);
    }

    #[test]
    fn repeated_compression_folds_previous_summary() {
        let mut history = history_with_turns(6, 6, 3);
        history.maybe_compress(&CannedSummarizer("第一次摘要"), "总结");
        for n in 6..9 {
            history.append(Role::User, format!("问题{n}"));
            history.append(Role::Assistant, format!("回答{n}"));
        }
        history.maybe_compress(&CannedSummarizer("第二次摘要"), "总结");

        let messages = history.messages_for_model();
        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("第二次摘要"));
        assert_eq!(history.total_turns(), 9);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");

        let mut history = history_with_turns(2, 30, 20);
        history.append(Role::User, "再问一句");
        history.save(&path).expect("save history");

        let loaded = ChatHistory::load(&path, 30, 20);
        assert_eq!(loaded.total_turns(), 3);
        assert_eq!(loaded.messages_for_model(), history.messages_for_model());
    }

    #[test]
    fn load_missing_file_yields_empty_store() {
        let loaded = ChatHistory::load(Path::new("/nonexistent/history.json"), 30, 20);
        assert!(loaded.is_empty());
        assert_eq!(loaded.total_turns(), 0);
    }

    #[test]
    fn load_malformed_file_yields_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").expect("write junk");

        let loaded = ChatHistory::load(&path, 30, 20);
        assert!(loaded.is_empty());
    }
}

//! Streaming chat client for an Ollama-compatible backend.
//!
//! Responses stream as NDJSON over HTTP; the blocking reader runs on the
//! blocking pool and bridges chunks into an async channel. The barge-in
//! flag is checked between chunks, so a user interruption stops the stream
//! within one chunk.

use crate::config::{OllamaConfig, PromptsConfig};
use crate::error::{Result, SpeechError};
use crate::history::Summarizer;
use crate::pipeline::barge_in::BargeIn;
use crate::pipeline::messages::{ChatMessage, ChunkEvent, Role};
use std::io::BufRead;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Include a time hint when the previous turn is older than this.
const TIME_HINT_AFTER: Duration = Duration::from_secs(10 * 60);

/// Buffer size of the chunk-event channel.
const CHUNK_CHANNEL_SIZE: usize = 64;

/// Interpolate a prompt template.
fn render(template: &str, key: &str, value: &str) -> String {
    template.replace(key, value)
}

/// Streaming chat client.
pub struct OllamaClient {
    config: OllamaConfig,
    prompts: PromptsConfig,
    agent: ureq::Agent,
    last_invocation: Option<Instant>,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig, prompts: &PromptsConfig) -> Self {
        info!(
            "chat backend configured: {} model={}",
            config.endpoint, config.model
        );
        Self {
            config: config.clone(),
            prompts: prompts.clone(),
            agent: ureq::agent(),
            last_invocation: None,
        }
    }

    /// Assemble the full message list for one turn:
    /// system prompts ++ history ++ optional time hint ++ user prompt.
    fn build_messages(
        &self,
        prompt: &str,
        speaker_id: &str,
        history: &[ChatMessage],
        include_time_hint: bool,
    ) -> Vec<ChatMessage> {
        let p = &self.prompts;
        let mut messages = vec![
            ChatMessage::new(Role::System, render(&p.system_role, "{speaker_id}", speaker_id)),
            ChatMessage::new(Role::System, p.speaking_format.clone()),
            ChatMessage::new(Role::System, p.speaker_format.clone()),
            ChatMessage::new(Role::System, render(&p.example, "{speaker_id}", speaker_id)),
            ChatMessage::new(Role::System, p.natural_response.clone()),
            ChatMessage::new(Role::System, p.silence_if_irrelevant.clone()),
            ChatMessage::new(Role::System, p.silence_if_not_spoken_to.clone()),
        ];
        messages.extend_from_slice(history);
        if include_time_hint {
            let now = chrono::Local::now().format("%Y年%m月%d日%H时%M分%S秒");
            messages.push(ChatMessage::new(
                Role::System,
                render(&p.time_context, "{current_time}", &now.to_string()),
            ));
        }
        messages.push(ChatMessage::new(Role::User, prompt));
        messages
    }

    /// Start a streaming turn. Events arrive on the returned channel; the
    /// channel closes when the stream ends, is aborted by barge-in, or
    /// fails (after an `Error` event).
    ///
    /// Beginning a new turn lowers any stale barge-in flag so the fresh
    /// reply is not cut by the interruption that ended the previous one.
    pub fn stream_chat(
        &mut self,
        prompt: &str,
        speaker_id: &str,
        history: Vec<ChatMessage>,
        barge_in: BargeIn,
    ) -> mpsc::Receiver<ChunkEvent> {
        barge_in.clear();

        let include_time_hint = self
            .last_invocation
            .is_none_or(|last| last.elapsed() > TIME_HINT_AFTER);
        self.last_invocation = Some(Instant::now());

        let messages = self.build_messages(prompt, speaker_id, &history, include_time_hint);
        let think = self.config.model.starts_with("deepseek-r1");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "think": think,
        });

        let url = format!("{}/api/chat", self.config.endpoint.trim_end_matches('/'));
        let agent = self.agent.clone();
        let (tx, rx) = mpsc::channel::<ChunkEvent>(CHUNK_CHANNEL_SIZE);

        tokio::task::spawn_blocking(move || {
            let response = match agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_string(&body.to_string())
            {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.blocking_send(ChunkEvent::Error(format!("chat request failed: {e}")));
                    return;
                }
            };

            let reader = std::io::BufReader::new(response.into_reader());
            for line in reader.lines() {
                // Barge-in: stop consuming the backend stream mid-reply.
                if barge_in.is_raised() {
                    info!("barge-in raised, stopping LLM stream");
                    break;
                }

                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx.blocking_send(ChunkEvent::Error(format!("stream read failed: {e}")));
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let chunk: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("skipping malformed stream line: {e}");
                        continue;
                    }
                };

                if let Some(err) = chunk["error"].as_str() {
                    let _ = tx.blocking_send(ChunkEvent::Error(err.to_owned()));
                    return;
                }
                if let Some(thinking) = chunk["message"]["thinking"].as_str()
                    && !thinking.is_empty()
                    && tx.blocking_send(ChunkEvent::Thinking(thinking.to_owned())).is_err()
                {
                    return;
                }
                if let Some(content) = chunk["message"]["content"].as_str()
                    && !content.is_empty()
                    && tx.blocking_send(ChunkEvent::Response(content.to_owned())).is_err()
                {
                    return;
                }
                if chunk["done"].as_bool() == Some(true) {
                    break;
                }
            }
        });

        rx
    }
}

impl Summarizer for OllamaClient {
    /// One-shot, non-streaming completion used for history compaction.
    fn summarize(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [ChatMessage::new(Role::User, prompt)],
            "stream": false,
        });
        let url = format!("{}/api/chat", self.config.endpoint.trim_end_matches('/'));

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .map_err(|e| SpeechError::Llm(format!("summarize request failed: {e}")))?;

        let raw = response
            .into_string()
            .map_err(|e| SpeechError::Llm(format!("cannot read summarize response: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| SpeechError::Llm(format!("malformed summarize response: {e}")))?;

        match value["message"]["content"].as_str() {
            Some(content) => Ok(content.trim().to_owned()),
            None => Err(SpeechError::Llm("summarize response had no content".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OllamaConfig, PromptsConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(endpoint: &str, model: &str) -> OllamaClient {
        OllamaClient::new(
            &OllamaConfig {
                endpoint: endpoint.to_owned(),
                model: model.to_owned(),
                ..OllamaConfig::default()
            },
            &PromptsConfig::default(),
        )
    }

    #[test]
    fn messages_start_with_system_prompts_and_end_with_user() {
        let client = client_for("http://127.0.0.1:1", "gemma3:27b");
        let history = vec![
            ChatMessage::new(Role::User, "之前的问题"),
            ChatMessage::new(Role::Assistant, "之前的回答"),
        ];
        let messages = client.build_messages("新问题", "玉超", &history, false);

        assert_eq!(messages.len(), 7 + 2 + 1);
        assert!(messages[..7].iter().all(|m| m.role == Role::System));
        assert!(messages[0].content.contains("玉超"));
        assert!(messages[3].content.contains("玉超"));
        assert_eq!(messages[7].content, "之前的问题");
        let last = messages.last().expect("user message");
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, "新问题");
    }

    #[test]
    fn time_hint_sits_between_history_and_user_prompt() {
        let client = client_for("http://127.0.0.1:1", "gemma3:27b");
        let history = vec![ChatMessage::new(Role::User, "旧的")];
        let messages = client.build_messages("新问题", "玉超", &history, true);

        let hint = &messages[messages.len() - 2];
        assert_eq!(hint.role, Role::System);
        assert!(hint.content.contains("当前时间是"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn streams_response_chunks_in_order() {
        let server = MockServer::start().await;
        let ndjson = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"你\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"好\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson, "application/x-ndjson"))
            .mount(&server)
            .await;

        let mut client = client_for(&server.uri(), "gemma3:27b");
        let mut rx = client.stream_chat("测试", "unknown", Vec::new(), BargeIn::new());

        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            chunks.push(event);
        }
        assert_eq!(
            chunks,
            vec![
                ChunkEvent::Response("你".to_owned()),
                ChunkEvent::Response("好".to_owned()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thinking_chunks_are_classified() {
        let server = MockServer::start().await;
        let ndjson = concat!(
            "{\"message\":{\"role\":\"assistant\",\"thinking\":\"考虑中\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"好。\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson, "application/x-ndjson"))
            .mount(&server)
            .await;

        let mut client = client_for(&server.uri(), "deepseek-r1");
        let mut rx = client.stream_chat("测试", "unknown", Vec::new(), BargeIn::new());

        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            chunks.push(event);
        }
        assert_eq!(
            chunks,
            vec![
                ChunkEvent::Thinking("考虑中".to_owned()),
                ChunkEvent::Response("好。".to_owned()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backend_failure_yields_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client = client_for(&server.uri(), "gemma3:27b");
        let mut rx = client.stream_chat("测试", "unknown", Vec::new(), BargeIn::new());

        let event = rx.recv().await.expect("error event");
        assert!(matches!(event, ChunkEvent::Error(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn starting_a_turn_clears_stale_barge_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"message\":{\"role\":\"assistant\",\"content\":\"好。\"},\"done\":true}\n",
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let barge_in = BargeIn::new();
        barge_in.raise();

        let mut client = client_for(&server.uri(), "gemma3:27b");
        let mut rx = client.stream_chat("测试", "unknown", Vec::new(), barge_in.clone());

        assert!(!barge_in.is_raised());
        let event = rx.recv().await.expect("chunk");
        assert_eq!(event, ChunkEvent::Response("好。".to_owned()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn summarize_uses_non_streaming_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": " 对话摘要 "},
                "done": true
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), "gemma3:27b");
        let summary = tokio::task::spawn_blocking(move || client.summarize("总结一下"))
            .await
            .expect("join")
            .expect("summarize");
        assert_eq!(summary, "对话摘要");
    }
}

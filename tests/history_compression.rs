//! History compaction against a mock chat backend (the summarizer path),
//! plus persistence of the turn counter across save/load.

use voxloop::config::{OllamaConfig, PromptsConfig};
use voxloop::history::ChatHistory;
use voxloop::llm::OllamaClient;
use voxloop::pipeline::messages::Role;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn seeded_history(turns: u64, max_history: u64, compress_interval: u64) -> ChatHistory {
    let mut history = ChatHistory::new(max_history, compress_interval);
    for n in 0..turns {
        history.append(Role::User, format!("第{n}个问题"));
        history.append(Role::Assistant, format!("第{n}个回答"));
    }
    history
}

#[tokio::test(flavor = "multi_thread")]
async fn six_turns_compress_into_summary_plus_tail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("请对以下对话历史进行简洁的总结"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": {"role": "assistant", "content": "前几轮的技术讨论摘要"},
            "done": true
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::new(
        &OllamaConfig {
            endpoint: server.uri(),
            ..OllamaConfig::default()
        },
        &PromptsConfig::default(),
    );

    let mut history = seeded_history(6, 6, 3);
    let tail_before: Vec<_> = history.messages_for_model()[9..].to_vec();
    let prompts = PromptsConfig::default();

    tokio::task::spawn_blocking(move || {
        history.maybe_compress(&client, &prompts.summarize);

        let messages = history.messages_for_model();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.starts_with("[历史摘要]"));
        assert!(messages[0].content.contains("前几轮的技术讨论摘要"));
        assert_eq!(&messages[1..], tail_before.as_slice());
        assert_eq!(history.total_turns(), 6);
    })
    .await
    .expect("compression task");
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_summarization_keeps_history_intact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = OllamaClient::new(
        &OllamaConfig {
            endpoint: server.uri(),
            ..OllamaConfig::default()
        },
        &PromptsConfig::default(),
    );

    let mut history = seeded_history(6, 6, 3);
    let before = history.messages_for_model();
    let prompts = PromptsConfig::default();

    tokio::task::spawn_blocking(move || {
        history.maybe_compress(&client, &prompts.summarize);
        assert_eq!(history.messages_for_model(), before);
        assert_eq!(history.total_turns(), 6);
    })
    .await
    .expect("compression task");
}

#[test]
fn save_and_load_preserve_logical_turn_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("history.json");

    let history = seeded_history(5, 30, 20);
    history.save(&path).expect("save");

    let restored = ChatHistory::load(&path, 30, 20);
    assert_eq!(restored.total_turns(), 5);
    assert_eq!(restored.messages_for_model(), history.messages_for_model());

    // The on-disk document is the documented JSON shape.
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
    assert_eq!(raw["total_turns"], 5);
    assert_eq!(raw["history"][0]["role"], "user");
    assert!(raw["history"][0]["content"].is_string());
}

//! End-to-end scenarios for the incremental segmenter against the public
//! API, including the chunking-invariance property.

use voxloop::pipeline::messages::{SegmentEvent, SegmentKind};
use voxloop::segmenter::{SPEAKER_END, SPEAKER_START, SPEECH_END, SpeechSegmenter};

fn feed_chunked(input: &str, chunk_chars: usize) -> Vec<SegmentEvent> {
    let mut segmenter = SpeechSegmenter::new();
    let chars: Vec<char> = input.chars().collect();
    let mut events = Vec::new();
    for chunk in chars.chunks(chunk_chars) {
        let piece: String = chunk.iter().collect();
        events.extend(segmenter.push(&piece));
    }
    events.extend(segmenter.flush());
    events
}

fn feed_once(input: &str) -> Vec<SegmentEvent> {
    let mut segmenter = SpeechSegmenter::new();
    let mut events = segmenter.push(input);
    events.extend(segmenter.flush());
    events
}

/// A handful of realistic tagged streams.
fn corpus() -> Vec<String> {
    vec![
        // Single structure, two sentences.
        "[[/speaker_start]温迪[/speaker_end]]哦？看来你终于意识到需要我的声音了。真是令人惊喜啊。\n[/say_end]".to_owned(),
        // Two back-to-back structures.
        "[[/speaker_start]钟离[/speaker_end]]如此，修复错误是好事。\n[/say_end]\n[[/speaker_start]温迪[/speaker_end]]好。\n[/say_end]".to_owned(),
        // Untagged prefix and suffix.
        "prefix text\n[[/speaker_start]钟离[/speaker_end]]hi\n[/say_end]trailing notes".to_owned(),
        // Long content exercising the 15-character early emission.
        "[[/speaker_start]胡桃[/speaker_end]]这是一个相当长的句子它会在这里结束了。然后是第二个同样很长的句子也结束了。短尾。\n[/say_end]".to_owned(),
        // Structure with no trailing newline before the end marker.
        "[[/speaker_start]可莉[/speaker_end]]砰砰。[/say_end]".to_owned(),
        // Missing end marker entirely (flush path).
        "[[/speaker_start]钟离[/speaker_end]]没有结束标记的独白".to_owned(),
    ]
}

#[test]
fn single_structure_chunked_by_three() {
    let events = feed_chunked(
        "[[/speaker_start]温迪[/speaker_end]]哦？看来你终于意识到需要我的声音了。真是令人惊喜啊。\n[/say_end]",
        3,
    );
    assert_eq!(
        events,
        vec![
            SegmentEvent::speech("温迪", "哦？看来你终于意识到需要我的声音了。"),
            SegmentEvent::speech("温迪", "真是令人惊喜啊。"),
        ]
    );
}

#[test]
fn back_to_back_structures_keep_speaker_order() {
    let events = feed_chunked(
        "[[/speaker_start]钟离[/speaker_end]]如此，修复错误是好事。\n[/say_end]\n[[/speaker_start]温迪[/speaker_end]]好。\n[/say_end]",
        4,
    );
    let speakers: Vec<_> = events
        .iter()
        .map(|e| e.speaker.clone().unwrap_or_default())
        .collect();
    assert_eq!(speakers, vec!["钟离", "温迪"]);
    assert!(events.iter().all(|e| e.kind == SegmentKind::Speech));
}

#[test]
fn untagged_prefix_is_a_text_event() {
    let events = feed_once("prefix text\n[[/speaker_start]钟离[/speaker_end]]hi\n[/say_end]");
    assert_eq!(events[0].kind, SegmentKind::Text);
    assert_eq!(events[0].speaker, None);
    assert_eq!(events[0].content, "prefix text");
    assert_eq!(events[1], SegmentEvent::speech("钟离", "hi"));
}

#[test]
fn any_chunking_yields_the_one_push_event_list() {
    for input in corpus() {
        let reference = feed_once(&input);
        for chunk_size in 1..=20 {
            assert_eq!(
                feed_chunked(&input, chunk_size),
                reference,
                "chunk size {chunk_size} diverged on {input:?}"
            );
        }
    }
}

#[test]
fn no_event_ever_contains_a_marker() {
    for input in corpus() {
        for chunk_size in [1, 2, 3, 7] {
            for event in feed_chunked(&input, chunk_size) {
                for marker in [SPEAKER_START, SPEAKER_END, SPEECH_END] {
                    assert!(
                        !event.content.contains(marker),
                        "{marker} leaked from {input:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn speech_events_always_carry_a_speaker() {
    for input in corpus() {
        for event in feed_chunked(&input, 3) {
            match event.kind {
                SegmentKind::Speech => {
                    assert!(!event.speaker.unwrap_or_default().is_empty());
                }
                SegmentKind::Text => assert!(event.speaker.is_none()),
            }
        }
    }
}

#[test]
fn per_structure_content_is_preserved() {
    let content = "哦？看来你终于意识到需要我的声音了。真是令人惊喜啊。";
    let input = format!("[[/speaker_start]温迪[/speaker_end]]{content}\n[/say_end]");
    for chunk_size in [1, 3, 5, 9] {
        let joined: String = feed_chunked(&input, chunk_size)
            .iter()
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(joined, content, "chunk size {chunk_size}");
    }
}

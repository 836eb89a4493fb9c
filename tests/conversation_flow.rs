//! End-to-end turns through the public orchestrator API.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{TokenEngine, fixture, until};
use sam::message::Role;
use sam::runtime::RuntimeEvent;
use sam::TurnOutcome;
use std::sync::Arc;
use std::time::Duration;

const OFFLINE: &str = "http://127.0.0.1:9/";

#[tokio::test(flavor = "multi_thread")]
async fn typed_hello_gets_a_streamed_reply() {
    let f = fixture(TokenEngine::new(vec![vec!["Hi", " there", "!"]]), OFFLINE).await;
    let mut events = f.orch.subscribe();

    let outcome = f.orch.send_text("Hello").await;
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            reply: "Hi there!".into()
        }
    );

    let log = f.orch.messages();
    assert_eq!(log.len(), 2);
    assert_eq!((log[0].role, log[0].content.as_str()), (Role::User, "Hello"));
    assert_eq!((log[1].role, log[1].content.as_str()), (Role::Assistant, "Hi there!"));
    assert!(log.iter().all(|m| !m.is_draft && m.id.is_some()));
    assert_eq!(f.store.list_messages().unwrap().len(), 2);

    // The assistant draft grew monotonically before it was finalized.
    let mut drafts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::MessageUpserted { message, .. } = event
            && message.role == Role::Assistant
            && message.is_draft
        {
            drafts.push(message.content);
        }
    }
    assert!(drafts.windows(2).all(|w| w[1].starts_with(&w[0])), "{drafts:?}");
    assert!(!f.orch.flags().is_generating);

    let prompt = &f.engines.llm.prompts.lock().unwrap()[0];
    assert_eq!(prompt[0].role, Role::System);
    assert!(prompt[0].content.contains("Ada"));
    assert_eq!(prompt.last().unwrap().content, "Hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn remembered_message_survives_pruning_until_forgotten() {
    let mut replies = vec![vec!["Noted."]];
    replies.extend(std::iter::repeat_n(vec!["ok"], 8));
    replies.push(vec!["Done."]);
    replies.push(vec!["ok"]);
    let f = fixture(TokenEngine::new(replies), OFFLINE).await;

    f.orch
        .send_text("Please remember my cat is called Miso")
        .await;
    for i in 0..8 {
        f.orch.send_text(&format!("filler {i}")).await;
    }

    {
        let prompts = f.engines.llm.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert!(last.iter().any(|m| m.content.contains("Miso")));
        assert_eq!(last.len(), 1 + 1 + 12, "system + remembered + window");
    }

    f.orch.send_text("forget your memories").await;
    assert!(f.store.remembered_messages().unwrap().is_empty());
    assert!(f.orch.messages().iter().all(|m| !m.to_remember));

    f.orch.send_text("what is my cat called?").await;
    let prompts = f.engines.llm.prompts.lock().unwrap();
    assert!(!prompts.last().unwrap().iter().any(|m| m.content.contains("Miso")));
}

#[tokio::test(flavor = "multi_thread")]
async fn only_one_turn_generates_at_a_time() {
    let engine = TokenEngine::new(vec![vec!["a", "b", "c", "d"], vec!["never"]])
        .with_pause(Duration::from_millis(40));
    let f = fixture(engine, OFFLINE).await;

    let first = {
        let orch = Arc::clone(&f.orch);
        tokio::spawn(async move { orch.send_text("first").await })
    };
    let orch = Arc::clone(&f.orch);
    until("generation to start", || orch.flags().is_generating).await;

    assert_eq!(f.orch.send_text("second").await, TurnOutcome::Busy);
    assert_eq!(
        first.await.unwrap(),
        TurnOutcome::Completed {
            reply: "abcd".into()
        }
    );

    let users: Vec<_> = f
        .orch
        .messages()
        .into_iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content)
        .collect();
    assert_eq!(users, vec!["first"]);
    assert_eq!(f.engines.llm.prompts.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn talking_mode_speaks_then_listens_once_more() {
    let f = fixture(TokenEngine::new(vec![vec!["Sure."]]), OFFLINE).await;

    assert!(f.orch.toggle_talking_mode().await);
    let recognizer = Arc::clone(&f.engines.recognizer);
    until("listening", || recognizer.starts() == 1).await;

    f.engines.recognizer.hear("tell me a joke");
    // The silence timer ends the utterance and submits it.
    let synth = Arc::clone(&f.synth);
    until("reply spoken", || synth.spoken.lock().unwrap().len() == 1).await;
    until("listening re-armed", || recognizer.starts() == 2).await;

    assert_eq!(f.synth.spoken.lock().unwrap()[0], "Sure.");
    let log = f.orch.messages();
    assert_eq!(log[0].content, "tell me a joke");
    assert_eq!(log[1].content, "Sure.");

    // Silence on the re-armed session submits nothing and does not re-arm.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(recognizer.starts(), 2);
    assert_eq!(f.orch.messages().len(), 2);
    assert!(!f.orch.flags().is_listening);
}

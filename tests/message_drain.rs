mod common;

use std::time::Duration;

use meshcore_mirror::device::memory::Fault;
use meshcore_mirror::device::SessionOptions;
use meshcore_mirror::error::MeshError;
use meshcore_mirror::model::{Direction, MessageKind};

fn texts(messages: &[meshcore_mirror::model::Message]) -> Vec<&str> {
    messages.iter().map(|m| m.text.as_str()).collect()
}

/// Session whose drain budget runs out between the first and second fetch once a
/// one-second device latency is set.
fn slow_drain_session() -> (
    meshcore_mirror::device::DeviceSession,
    meshcore_mirror::device::memory::MemoryHandle,
) {
    let options = SessionOptions {
        refresh_timeout: Duration::from_millis(1500),
        ..SessionOptions::default()
    };
    let (session, handle) = common::session_with(common::base_state(), options);
    handle.push_message(common::chan(0, "m1", 1));
    handle.push_message(common::chan(0, "m2", 2));
    (session, handle)
}

#[tokio::test(start_paused = true)]
async fn drain_returns_everything_in_delivery_order_once() {
    let (session, handle) = common::session(common::base_state());
    handle.push_message(common::chan(0, "m1", 1));
    handle.push_message(common::private("ab12cd34ef56", "m2", 2));
    handle.push_message(common::chan(3, "m3", 3));
    session.connect().await.unwrap();

    let drained = session.drain_new_messages().await.unwrap();
    let texts: Vec<_> = drained.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["m1", "m2", "m3"]);
    assert_eq!(drained[1].sender_key_prefix(), Some("ab12cd34ef56"));
    assert_eq!(drained[2].channel_index(), Some(3));
    assert!(drained.iter().all(|m| m.direction == Direction::Incoming));

    // Exhaustion on the next call: nothing is delivered twice.
    let again = session.drain_new_messages().await.unwrap();
    assert!(again.is_empty());
    // Three messages plus the sentinel, then the sentinel alone.
    assert_eq!(handle.call_count("get_msg"), 5);
}

#[tokio::test(start_paused = true)]
async fn undecodable_messages_are_skipped() {
    let (session, handle) = common::session(common::base_state());
    handle.push_message(common::private("not-hex", "bad", 1));
    handle.push_message(common::chan(0, "good", 2));
    session.connect().await.unwrap();

    let drained = session.drain_new_messages().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].text, "good");
}

#[tokio::test(start_paused = true)]
async fn room_server_posts_are_chatroom_messages() {
    let (session, handle) = common::session(common::base_state());
    handle.push_message(meshcore_mirror::device::RawMessage::Private {
        pubkey_prefix: "C0FFEE001122".to_string(),
        txt_type: 2,
        sender_timestamp: 5,
        text: "room post".to_string(),
    });
    session.connect().await.unwrap();

    let drained = session.drain_new_messages().await.unwrap();
    assert_eq!(
        drained[0].kind,
        MessageKind::Chatroom {
            room_key_prefix: "c0ffee001122".to_string()
        }
    );
    assert_eq!(drained[0].sender_key_prefix(), None);
}

#[tokio::test(start_paused = true)]
async fn failed_drain_leaves_remaining_messages_on_device() {
    let (session, handle) = common::session(common::base_state());
    handle.push_message(common::chan(0, "m1", 1));
    handle.push_message(common::chan(0, "m2", 2));
    session.connect().await.unwrap();
    handle.fail_next("get_msg", Fault::Decode, 1);

    assert!(session.drain_new_messages().await.is_err());
    assert_eq!(handle.inbox_len(), 2);
    let drained = session.drain_new_messages().await.unwrap();
    assert_eq!(drained.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn interrupted_drain_returns_what_it_fetched() {
    let (session, handle) = slow_drain_session();
    session.connect().await.unwrap();
    handle.set_latency(Duration::from_secs(1));

    let drained = session.drain().await;
    assert_eq!(texts(&drained.messages), vec!["m1"]);
    assert!(matches!(
        drained.error,
        Some(MeshError::CommandTimeout { op: "drain_messages", .. })
    ));
    assert_eq!(handle.inbox_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_drain_holds_fetched_messages_for_the_next_call() {
    let (session, handle) = slow_drain_session();
    session.connect().await.unwrap();
    handle.set_latency(Duration::from_secs(1));

    assert!(session.drain_new_messages().await.is_err());
    handle.set_latency(Duration::ZERO);

    let drained = session.drain_new_messages().await.unwrap();
    assert_eq!(texts(&drained), vec!["m1", "m2"]);
    assert_eq!(handle.inbox_len(), 0);
    assert!(session.drain_new_messages().await.unwrap().is_empty());
}

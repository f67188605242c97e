mod common;

use meshcore_mirror::device::memory::Fault;
use meshcore_mirror::error::MeshError;
use meshcore_mirror::model::Direction;
use meshcore_mirror::scheduler::MeshEvent;

#[tokio::test(start_paused = true)]
async fn direct_message_by_name_or_key_prefix() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();
    let mut events = coordinator.take_events().unwrap();
    while events.try_recv().is_ok() {}

    let receipt = coordinator.send_direct_message("Alice", "hi").await.unwrap();
    assert!(receipt.acknowledged);
    assert_eq!(receipt.public_key, common::ALICE_KEY);

    let receipt = coordinator.send_direct_message("AB12CD", "again").await.unwrap();
    assert_eq!(receipt.name, "Alice");

    assert_eq!(
        handle.sent_direct(),
        vec![
            ("ab12cd34ef56".to_string(), "hi".to_string()),
            ("ab12cd34ef56".to_string(), "again".to_string()),
        ]
    );
    assert!(matches!(
        events.try_recv().unwrap(),
        MeshEvent::MessageSent { message } if message.text == "hi"
    ));

    // Sent messages join the backlog on the next tick.
    coordinator.scheduler().tick_at(10).await.unwrap();
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.messages.len(), 2);
    assert!(snapshot.messages.iter().all(|m| m.direction == Direction::Outgoing));
    assert!(snapshot.last_message_at.contains_key("ab12cd34ef56"));
    assert_eq!(coordinator.metrics().messages_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn unknown_recipient_is_rejected_before_the_device() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);

    // Nothing mirrored yet.
    let err = coordinator.send_direct_message("Alice", "hi").await.unwrap_err();
    assert!(matches!(err, MeshError::UnknownContact(_)));

    coordinator.scheduler().tick_at(0).await.unwrap();
    let err = coordinator.send_direct_message("Carol", "hi").await.unwrap_err();
    assert!(matches!(err, MeshError::UnknownContact(name) if name == "Carol"));
    assert!(handle.sent_direct().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_direct_message_reports_false() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();
    handle.update(|state| state.ack_direct = false);

    let receipt = coordinator.send_direct_message("Alice", "anyone?").await.unwrap();
    assert!(!receipt.acknowledged);
    assert_eq!(handle.sent_direct().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_direct_message_is_an_error() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();
    handle.fail_next("send_msg", Fault::Refuse, 1);

    assert!(coordinator.send_direct_message("Alice", "hi").await.is_err());
    assert_eq!(handle.call_count("wait_ack"), 0);
    assert_eq!(coordinator.metrics().messages_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn channel_messages() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.session().connect().await.unwrap();

    coordinator.send_channel_message(0, "hello all").await.unwrap();
    assert_eq!(handle.sent_channel(), vec![(0, "hello all".to_string())]);

    handle.fail_next("send_chan_msg", Fault::Refuse, 1);
    assert!(coordinator.send_channel_message(1, "dropped").await.is_err());
    assert_eq!(handle.sent_channel().len(), 1);

    let report = coordinator.scheduler().tick_at(0).await.unwrap();
    let sent = &report.snapshot.messages[0];
    assert_eq!(sent.channel_index(), Some(0));
    assert_eq!(sent.direction, Direction::Outgoing);
}

#[tokio::test(start_paused = true)]
async fn explicit_login_reports_the_outcome() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    assert!(!coordinator.login_to_repeater("Hilltop", "wrong").await.unwrap());
    assert!(coordinator.login_to_repeater("Hilltop", "secret").await.unwrap());
    assert_eq!(handle.logins().len(), 2);

    let err = coordinator.login_to_repeater("Nowhere", "x").await.unwrap_err();
    assert!(matches!(err, MeshError::UnknownContact(_)));

    // An explicit login does not enrol the repeater in scheduled polling.
    let peer = coordinator.repeater_peer("Hilltop").await.unwrap();
    assert!(!peer.enabled);
    assert!(coordinator.scheduler().tick_at(600).await.unwrap().repeaters.is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeater_queries_reuse_the_login() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();
    assert!(coordinator.login_to_repeater("Hilltop", "secret").await.unwrap());

    let stats = coordinator.get_repeater_stats("Hilltop").await.unwrap().unwrap();
    assert_eq!(stats.battery_mv, 4010);
    assert_eq!(stats.uptime_secs, 86_400);

    let version = coordinator.get_repeater_version("Hilltop").await.unwrap();
    assert_eq!(version.as_deref(), Some("v1.7.2 (Build: 12-Jun-2025)"));

    let reply = coordinator.send_repeater_command("Hilltop", "clock").await.unwrap();
    assert_eq!(reply.as_deref(), Some("Error: unknown command 'clock'"));

    assert_eq!(handle.logins().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unconfigured_repeaters_use_a_guest_login() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    let stats = coordinator.get_repeater_stats("Hilltop").await.unwrap();
    assert!(stats.is_some());
    assert_eq!(handle.logins().len(), 1);
    assert!(!coordinator.repeater_peer("Hilltop").await.unwrap().admin);
}

#[tokio::test(start_paused = true)]
async fn stats_miss_returns_the_cached_value() {
    let (coordinator, handle) =
        common::coordinator(common::base_state(), &[common::hilltop("secret")]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    handle.fail_next("wait_status", Fault::Refuse, 1);
    let stats = coordinator.get_repeater_stats("Hilltop").await.unwrap().unwrap();
    assert_eq!(stats.fetched_at, 0);
}

#[tokio::test(start_paused = true)]
async fn refused_relogin_returns_the_cached_stats_and_version() {
    let (coordinator, handle) =
        common::coordinator(common::base_state(), &[common::hilltop("secret")]);
    coordinator.scheduler().tick_at(0).await.unwrap();
    assert_eq!(handle.logins().len(), 1);

    handle.update(|state| {
        if let Some(hilltop) = state.repeaters.get_mut("Hilltop") {
            hilltop.admin_password = Some("changed".to_string());
            hilltop.guest_allowed = false;
        }
    });
    // The login stamped at tick 0 has expired by wall-clock time, so each call logs in again.
    let stats = coordinator.get_repeater_stats("Hilltop").await.unwrap().unwrap();
    assert_eq!(stats.fetched_at, 0);
    assert_eq!(stats.battery_mv, 4010);

    let version = coordinator.get_repeater_version("Hilltop").await.unwrap();
    assert_eq!(version.as_deref(), Some("v1.7.2 (Build: 12-Jun-2025)"));
    assert_eq!(handle.logins().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn stats_for_an_unreachable_device_is_an_error() {
    let (coordinator, handle) =
        common::coordinator(common::base_state(), &[common::hilltop("secret")]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    handle.fail_next("send_login", Fault::Io, 1);
    let err = coordinator.get_repeater_stats("Hilltop").await.unwrap_err();
    assert!(matches!(err, MeshError::Driver(_)));
}

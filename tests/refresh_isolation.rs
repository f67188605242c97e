mod common;

use std::time::Duration;

use meshcore_mirror::coordinator::MeshCoordinator;
use meshcore_mirror::device::memory::Fault;
use meshcore_mirror::device::SessionOptions;
use meshcore_mirror::scheduler::RefreshOutcome;
use meshcore_mirror::snapshot::StateSnapshot;

#[tokio::test(start_paused = true)]
async fn message_failure_does_not_block_info() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    handle.fail_next("get_msg", Fault::Decode, 1);

    let report = coordinator.scheduler().tick_at(0).await.unwrap();
    assert!(matches!(report.messages, RefreshOutcome::Failed(_)));
    assert_eq!(report.info, RefreshOutcome::Refreshed);
    assert!(report.snapshot.has_data);
    assert_eq!(report.snapshot.contacts.len(), 2);
    assert!(coordinator.session().is_connected());
    assert_eq!(coordinator.metrics().messages_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn info_failure_keeps_cached_contacts() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    handle.fail_next("get_contacts", Fault::Decode, 1);
    handle.push_message(common::chan(1, "still flowing", 55));
    let report = coordinator.scheduler().tick_at(60).await.unwrap();

    assert!(matches!(report.info, RefreshOutcome::Failed(_)));
    assert_eq!(report.messages, RefreshOutcome::Refreshed);
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.contacts.len(), 2);
    assert_eq!(snapshot.messages.back().unwrap().text, "still flowing");
    assert_eq!(snapshot.last_successful_refresh_at, Some(60));
}

#[tokio::test(start_paused = true)]
async fn node_info_failure_still_applies_contacts() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    handle.update(|state| state.self_info.name = "Renamed".to_string());
    handle.add_contact("Bob", common::contact(common::BOB_KEY, 1));
    handle.fail_next("send_appstart", Fault::Decode, 1);
    let report = coordinator.scheduler().tick_at(60).await.unwrap();

    assert!(matches!(report.info, RefreshOutcome::Failed(_)));
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.node_info.name, "SimNode");
    assert!(snapshot.contact_by_name("Bob").is_some());
}

#[tokio::test(start_paused = true)]
async fn repeater_failure_is_isolated() {
    let (coordinator, _handle) =
        common::coordinator(common::base_state(), &[common::hilltop("wrong")]);

    let report = coordinator.scheduler().tick_at(0).await.unwrap();
    assert!(matches!(report.repeaters["Hilltop"], RefreshOutcome::Failed(_)));
    assert_eq!(report.messages, RefreshOutcome::Refreshed);
    assert_eq!(report.info, RefreshOutcome::Refreshed);
    assert!(report.snapshot.repeater_stats.is_empty());
}

#[tokio::test(start_paused = true)]
async fn total_cold_failure_publishes_the_placeholder() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.session().connect().await.unwrap();
    handle.fail_next("get_msg", Fault::Decode, 1);
    handle.fail_next("send_appstart", Fault::Decode, 1);
    handle.fail_next("get_contacts", Fault::Decode, 1);

    let err = coordinator.scheduler().tick_at(0).await.unwrap_err();
    assert!(err.to_string().contains("garbled get_msg reply"), "{}", err);
    assert_eq!(*coordinator.snapshot(), StateSnapshot::placeholder());

    // Nothing was refreshed, so the next tick is still a cold start.
    let report = coordinator.scheduler().tick_at(10).await.unwrap();
    assert!(report.cold_start);
    assert_eq!(report.info, RefreshOutcome::Refreshed);
    assert_eq!(report.snapshot.contacts.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_kinds_are_retried_on_later_ticks() {
    let (coordinator, handle) = common::coordinator(common::base_state(), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    handle.fail_next("get_msg", Fault::Decode, 1);
    handle.push_message(common::chan(0, "late", 12));
    let report = coordinator.scheduler().tick_at(10).await.unwrap();
    assert!(matches!(report.messages, RefreshOutcome::Failed(_)));
    assert!(coordinator.snapshot().messages.is_empty());

    coordinator.scheduler().tick_at(20).await.unwrap();
    assert_eq!(coordinator.snapshot().messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn messages_fetched_before_a_drain_failure_reach_the_snapshot() {
    let options = SessionOptions {
        refresh_timeout: Duration::from_millis(1500),
        ..SessionOptions::default()
    };
    let (session, handle) = common::session_with(common::base_state(), options);
    let coordinator = MeshCoordinator::new(session, &common::polling(10, 60), &[]);
    coordinator.scheduler().tick_at(0).await.unwrap();

    handle.push_message(common::chan(0, "m1", 11));
    handle.push_message(common::chan(0, "m2", 12));
    handle.set_latency(Duration::from_secs(1));
    let report = coordinator.scheduler().tick_at(10).await.unwrap();
    assert!(matches!(report.messages, RefreshOutcome::Failed(_)));
    let texts: Vec<_> = report.snapshot.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["m1"]);

    handle.set_latency(Duration::ZERO);
    let report = coordinator.scheduler().tick_at(20).await.unwrap();
    let texts: Vec<_> = report.snapshot.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["m1", "m2"]);
    assert_eq!(coordinator.metrics().messages_drained, 2);
}

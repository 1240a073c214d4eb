mod common;

use std::sync::atomic::Ordering;

use ferry_sync::BridgeError;
use ferry_sync::backfill::{BACKFILL_PAGE_SIZE, BackfillReport, MISSED_GAP_NOTICE, collect_messages};
use ferry_types::events::{Relation, RemoteEvent};
use ferry_types::models::{ChannelKey, ChannelKind};

use common::*;

fn channel() -> ChannelKey {
    ChannelKey::shared("500")
}

#[tokio::test]
async fn collect_stops_at_last_known_message() {
    let upstream = FakeUpstream::with_history("500", 1..=80);
    let collected = collect_messages(&upstream, "500", 30, Some("50")).await.unwrap();

    assert!(collected.found_all);
    let ids: Vec<&str> = collected.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids.first(), Some(&"80"));
    assert_eq!(ids.last(), Some(&"51"));
    assert_eq!(ids.len(), 30);
}

#[tokio::test]
async fn collect_keeps_newest_when_limit_is_hit() {
    let upstream = FakeUpstream::with_history("500", 1..=100);
    let collected = collect_messages(&upstream, "500", 30, Some("50")).await.unwrap();

    assert!(!collected.found_all);
    assert_eq!(collected.messages.len(), 30);
    assert_eq!(collected.messages[0].id, "100");
    assert_eq!(collected.messages[29].id, "71");
}

#[tokio::test]
async fn collect_short_history_counts_as_complete() {
    let upstream = FakeUpstream::with_history("500", 1..=12);
    let collected = collect_messages(&upstream, "500", 100, None).await.unwrap();

    assert!(collected.found_all);
    assert_eq!(collected.messages.len(), 12);
    assert_eq!(upstream.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn collect_pages_past_one_request() {
    let upstream = FakeUpstream::with_history("500", 1..=200);
    let collected = collect_messages(&upstream, "500", 120, None).await.unwrap();

    assert!(!collected.found_all);
    assert_eq!(collected.messages.len(), 120);
    assert_eq!(collected.messages[119].id, "81");
    assert_eq!(upstream.list_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn bounded_backfill_sends_gap_notice_when_limit_is_hit() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=100),
        RecordingTarget::new(false),
        config_with(|c| c.missed_backfill.channel = 30),
    );
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 50, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("100").await.unwrap();

    assert!(!report.found_all);
    assert!(report.gap_notice);
    assert_eq!(report.fetched, 30);
    assert_eq!(report.dispatched, 30);

    let bodies = h.target.bodies();
    assert_eq!(bodies[0], MISSED_GAP_NOTICE);
    let expected: Vec<String> = (71..=100).map(|id| format!("message {id}")).collect();
    assert_eq!(&bodies[1..], expected.as_slice());
    assert!(!h.is_bridged(&channel(), 70));
    assert_eq!(h.db.get_last(&channel()).unwrap().unwrap().remote_message_id, "100");
}

#[tokio::test]
async fn bounded_backfill_without_gap() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=80),
        RecordingTarget::new(false),
        config_with(|c| c.missed_backfill.channel = 30),
    );
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 50, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("80").await.unwrap();

    assert!(report.found_all);
    assert!(!report.gap_notice);
    let expected: Vec<String> = (51..=80).map(|id| format!("message {id}")).collect();
    assert_eq!(h.target.bodies(), expected);
}

#[tokio::test]
async fn unbounded_backfill_pages_until_short_page() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=170),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.channel = -1),
    );
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 50, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("170").await.unwrap();

    let batches = h.target.batches.lock().unwrap().clone();
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![BACKFILL_PAGE_SIZE, BACKFILL_PAGE_SIZE, 20]);
    assert_eq!(report.batches, 3);
    assert_eq!(report.fetched, 120);
    assert!(report.found_all);
    assert!(!report.gap_notice);

    // Oldest first across pages.
    let bodies = h.target.bodies();
    assert_eq!(bodies.first().map(String::as_str), Some("message 51"));
    assert_eq!(bodies.last().map(String::as_str), Some("message 170"));
    assert_eq!(h.db.get_last(&channel()).unwrap().unwrap().remote_message_id, "170");
}

#[tokio::test]
async fn unbounded_one_by_one_pages_until_short_page() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=120),
        RecordingTarget::new(false),
        config_with(|c| c.missed_backfill.channel = -1),
    );
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 50, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("120").await.unwrap();

    assert_eq!(report.batches, 2);
    assert_eq!(report.fetched, 70);
    assert_eq!(report.dispatched, 70);
    assert_eq!(h.upstream.list_calls.load(Ordering::SeqCst), 2);
    assert!(h.target.batches.lock().unwrap().is_empty());
    let expected: Vec<String> = (51..=120).map(|id| format!("message {id}")).collect();
    assert_eq!(h.target.bodies(), expected);
}

#[tokio::test]
async fn one_by_one_send_failure_stops_backfill() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=13),
        RecordingTarget::new(false),
        config_with(|c| c.missed_backfill.channel = 10),
    );
    h.target.fail_send_at.store(2, Ordering::SeqCst);
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 10, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let err = handle.portal().backfill_missed("13").await.unwrap_err();
    assert!(matches!(err, BridgeError::Dispatch(_)));
    assert!(h.is_bridged(&channel(), 11));
    assert!(!h.is_bridged(&channel(), 12));
    assert!(!h.is_bridged(&channel(), 13));
    assert_eq!(h.db.get_last(&channel()).unwrap().unwrap().remote_message_id, "11");

    let report = handle.portal().backfill_missed("13").await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(h.target.bodies(), vec!["message 11", "message 12", "message 13"]);
}

#[tokio::test]
async fn one_by_one_skips_messages_that_fail_to_convert() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=13),
        RecordingTarget::new(false),
        config_with(|c| c.missed_backfill.channel = 10),
    );
    {
        let mut history = h.upstream.history.lock().unwrap();
        let broken = history.get_mut("500").unwrap().iter_mut().find(|m| m.id == "12").unwrap();
        broken.content = "boom".into();
    }
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 10, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("13").await.unwrap();

    assert_eq!(report.fetched, 3);
    assert_eq!(report.dispatched, 2);
    assert!(!h.is_bridged(&channel(), 12));
    assert!(h.is_bridged(&channel(), 13));
}

#[tokio::test]
async fn missed_backfill_is_noop_when_up_to_date() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=100),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.channel = 10),
    );
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 100, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("100").await.unwrap();

    assert_eq!(report, BackfillReport::default());
    assert_eq!(h.upstream.list_calls.load(Ordering::SeqCst), 0);
    assert!(h.target.events().is_empty());
}

#[tokio::test]
async fn missed_backfill_bridges_only_new_messages() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=105),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.channel = 10),
    );
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 100, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("105").await.unwrap();

    assert!(report.found_all);
    assert!(!report.gap_notice);
    assert_eq!(report.dispatched, 5);
    let expected: Vec<String> = (101..=105).map(|id| format!("message {id}")).collect();
    assert_eq!(h.target.bodies(), expected);

    // Already bridged, nothing to do the second time.
    let again = handle.portal().backfill_missed("105").await.unwrap();
    assert_eq!(again.dispatched, 0);
    assert_eq!(h.target.events().len(), 5);
}

#[tokio::test]
async fn missed_backfill_skips_without_bridged_messages() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=10),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.channel = -1),
    );
    h.seed_room(&channel());

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_missed("10").await.unwrap();
    assert_eq!(report, BackfillReport::default());
}

#[tokio::test]
async fn batch_conversion_is_deterministic() {
    let h = Harness::new(FakeUpstream::default(), RecordingTarget::new(true), Default::default());
    h.seed_room(&channel());
    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();

    let first = msg(1, "500");
    let mut reply = with_attachments(msg(2, "500"), &["cat.png"]);
    reply.reply_to = Some("1".into());
    let page = vec![first, reply];

    let a = handle.portal().convert_batch(ROOM, &page, None).await.unwrap();
    let b = handle.portal().convert_batch(ROOM, &page, None).await.unwrap();

    let ids_a: Vec<_> = a.events.iter().map(|e| e.id.clone().unwrap()).collect();
    let ids_b: Vec<_> = b.events.iter().map(|e| e.id.clone().unwrap()).collect();
    assert_eq!(ids_a.len(), 3);
    assert_eq!(ids_a, ids_b);

    // The reply points at the pre-assigned ID of its target in the same page.
    assert_eq!(
        a.events[1].relates_to,
        Some(Relation::Reply { event_id: ids_a[0].clone() })
    );
    assert_eq!(a.records[2].part_name, "att-cat.png");
}

#[tokio::test]
async fn batch_skips_messages_that_fail_to_convert() {
    let h = Harness::new(FakeUpstream::default(), RecordingTarget::new(true), Default::default());
    h.seed_room(&channel());
    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();

    let mut broken = msg(2, "500");
    broken.content = "boom".into();
    let page = vec![msg(1, "500"), broken, msg(3, "500")];

    let batch = handle.portal().convert_batch(ROOM, &page, None).await.unwrap();
    let remote_ids: Vec<&str> = batch.records.iter().map(|r| r.remote_message_id.as_str()).collect();
    assert_eq!(remote_ids, vec!["1", "3"]);
}

#[tokio::test]
async fn failed_batch_records_nothing() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=20),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.channel = -1),
    );
    h.target.fail_batch.store(true, Ordering::SeqCst);
    h.seed_room(&channel());
    h.seed_bridged(&channel(), 10, "");

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    assert!(handle.portal().backfill_missed("20").await.is_err());
    assert!(!h.is_bridged(&channel(), 11));

    // The next attempt picks up from the same place.
    h.target.fail_batch.store(false, Ordering::SeqCst);
    let report = handle.portal().backfill_missed("20").await.unwrap();
    assert_eq!(report.dispatched, 10);
}

#[tokio::test]
async fn thread_backfill_continues_from_tail() {
    let h = Harness::new(
        FakeUpstream::default(),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.thread = -1),
    );
    h.upstream.extend("900", 901..=905);
    h.seed_room(&channel());
    let root = h.seed_bridged(&channel(), 10, "");
    let tail = h.seed_bridged(&channel(), 901, "900");
    h.ctx.threads.get_or_create(&channel(), "900", "10").unwrap();

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_thread_missed("900", "905").await.unwrap();
    assert_eq!(report.dispatched, 4);

    let events = h.target.events();
    let mut previous = tail;
    for (id, event) in &events {
        assert_eq!(
            event.relates_to,
            Some(Relation::Thread { root: root.clone(), last: previous.clone() })
        );
        previous = id.clone();
    }

    let ctx = h.ctx.threads.get(&channel(), "900").unwrap().unwrap();
    assert_eq!(ctx.last_known_local_id.as_deref(), Some(previous.as_str()));
    assert_eq!(
        h.db.get_last_in_thread(&channel(), "900").unwrap().unwrap().remote_message_id,
        "905"
    );
    // Thread messages never count as the channel's last message.
    assert_eq!(h.db.get_last(&channel()).unwrap().unwrap().remote_message_id, "10");
}

#[tokio::test]
async fn thread_gap_notice_stays_in_thread() {
    let h = Harness::new(
        FakeUpstream::default(),
        RecordingTarget::new(true),
        config_with(|c| c.missed_backfill.thread = 20),
    );
    h.upstream.extend("900", 901..=960);
    h.seed_room(&channel());
    let root = h.seed_bridged(&channel(), 10, "");
    let tail = h.seed_bridged(&channel(), 901, "900");
    h.ctx.threads.get_or_create(&channel(), "900", "10").unwrap();

    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();
    let report = handle.portal().backfill_thread_missed("900", "960").await.unwrap();

    assert!(report.gap_notice);
    assert!(!report.found_all);
    assert_eq!(report.dispatched, 20);

    let events = h.target.events();
    assert_eq!(body(&events[0].1), MISSED_GAP_NOTICE);
    assert_eq!(
        events[0].1.relates_to,
        Some(Relation::Thread { root: root.clone(), last: tail.clone() })
    );
    assert_eq!(body(&events[1].1), "message 941");
    assert_eq!(
        events[1].1.relates_to,
        Some(Relation::Thread { root, last: tail })
    );
}

#[tokio::test]
async fn room_creation_runs_initial_backfill_before_live_messages() {
    let h = Harness::new(
        FakeUpstream::with_history("500", 1..=31),
        RecordingTarget::new(false),
        config_with(|c| c.initial_backfill.channel = 20),
    );
    let handle = h.registry.get_or_create(&channel(), ChannelKind::Channel).await.unwrap();

    // 31 is both the newest history message and the live event that triggers
    // room creation.
    handle.queue_remote(RemoteEvent::MessageCreate(msg(31, "500"))).await.unwrap();
    handle.queue_remote(RemoteEvent::MessageCreate(msg(32, "500"))).await.unwrap();
    wait_until(|| h.is_bridged(&channel(), 32)).await;

    assert_eq!(h.target.rooms_created.load(Ordering::SeqCst), 1);
    assert_eq!(handle.portal().room_id().as_deref(), Some("!500:test"));

    let mut expected: Vec<String> = (12..=31).map(|id| format!("message {id}")).collect();
    expected.push("message 32".into());
    assert_eq!(h.target.bodies(), expected);
}

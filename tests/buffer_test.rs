mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use realtime_sync::buffer::{BufferConfig, EventBuffer};
use realtime_sync::event::{Domain, EventKind, NormalizedEvent, Priority};
use support::{norm_event, settle};
use tokio::time::advance;

type Batches = Arc<Mutex<Vec<Vec<NormalizedEvent>>>>;

fn collecting_buffer(config: BufferConfig) -> (EventBuffer, Batches) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let buffer = EventBuffer::new(config, move |batch| {
        sink.lock().unwrap().push(batch);
        Ok(())
    });
    (buffer, batches)
}

fn config(min_ms: u64, max_ms: u64, size: usize) -> BufferConfig {
    BufferConfig {
        min_batch_interval: Duration::from_millis(min_ms),
        max_batch_interval: Duration::from_millis(max_ms),
        max_batch_size: size,
        priority_flush: true,
    }
}

fn normal(id: &str, offset_ms: i64) -> NormalizedEvent {
    norm_event(Domain::Lead, id, EventKind::Update, Priority::Normal, offset_ms)
}

#[tokio::test(start_paused = true)]
async fn dedup_keeps_the_later_event_for_a_key() {
    let (buffer, batches) = collecting_buffer(config(50, 1000, 100));

    let mut first = normal("l1", 0);
    first.data = serde_json::json!({"id": "l1", "rev": 1});
    let mut second = normal("l1", 5);
    second.data = serde_json::json!({"id": "l1", "rev": 2});

    buffer.add(first);
    buffer.add(second);
    assert_eq!(buffer.size(), 1);

    buffer.flush();
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].data["rev"], 2);
}

#[tokio::test(start_paused = true)]
async fn critical_event_flushes_synchronously_inside_add() {
    let (buffer, batches) = collecting_buffer(config(50, 1000, 100));

    buffer.add(norm_event(
        Domain::Notification,
        "n1",
        EventKind::Insert,
        Priority::Critical,
        0,
    ));

    // No timer, no yield: the flush already happened.
    assert_eq!(batches.lock().unwrap().len(), 1);
    assert_eq!(buffer.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn critical_event_defers_when_priority_flush_disabled() {
    let mut cfg = config(50, 1000, 100);
    cfg.priority_flush = false;
    let (buffer, batches) = collecting_buffer(cfg);

    buffer.add(norm_event(
        Domain::Notification,
        "n1",
        EventKind::Insert,
        Priority::Critical,
        0,
    ));
    assert!(batches.lock().unwrap().is_empty());

    settle().await; // let the spawned timer task arm before advancing the clock
    advance(Duration::from_millis(1001)).await;
    settle().await;
    assert_eq!(batches.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reaching_capacity_flushes_without_a_timer() {
    let (buffer, batches) = collecting_buffer(config(50, 1000, 10));

    // Age the buffer past the flush floor so capacity can fire immediately.
    advance(Duration::from_millis(60)).await;

    for i in 0..10 {
        buffer.add(normal(&format!("l{i}"), i as i64));
    }

    // The tenth add flushed synchronously.
    assert_eq!(batches.lock().unwrap().len(), 1);
    assert_eq!(batches.lock().unwrap()[0].len(), 10);
    assert_eq!(buffer.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn pause_accumulates_and_resume_flushes_exactly_once() {
    let (buffer, batches) = collecting_buffer(config(50, 1000, 100));

    buffer.pause();
    for i in 0..5 {
        buffer.add(normal(&format!("l{i}"), i as i64));
    }
    advance(Duration::from_millis(2000)).await;
    settle().await;
    assert!(batches.lock().unwrap().is_empty());
    assert_eq!(buffer.size(), 5);

    buffer.resume();
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 5);
    let ids: Vec<&str> = batches[0].iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["l0", "l1", "l2", "l3", "l4"]);
}

#[tokio::test(start_paused = true)]
async fn burst_of_150_flushes_in_two_bounded_batches() {
    let (buffer, batches) = collecting_buffer(config(50, 150, 100));

    // 150 normal-priority events land within 10ms of buffer creation.
    for i in 0..150 {
        buffer.add(normal(&format!("l{i:03}"), i as i64));
    }
    assert!(batches.lock().unwrap().is_empty());

    settle().await; // let the spawned timer task arm before advancing the clock

    // Nothing may flush before the 50ms floor.
    advance(Duration::from_millis(49)).await;
    settle().await;
    assert!(batches.lock().unwrap().is_empty());

    // First flush lands at ~50ms with the 100 highest-sorted events; same
    // priority, so arrival order is preserved.
    advance(Duration::from_millis(2)).await;
    settle().await;
    {
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[0][0].id, "l000");
        assert_eq!(batches[0][99].id, "l099");
    }

    // The remaining 50 follow within 150ms of the first event's arrival.
    advance(Duration::from_millis(55)).await;
    settle().await;
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].len(), 50);
    assert_eq!(batches[1][0].id, "l100");
}

#[tokio::test(start_paused = true)]
async fn higher_priority_sorts_first_with_stable_arrival_order() {
    let mut cfg = config(50, 1000, 100);
    cfg.priority_flush = false;
    let (buffer, batches) = collecting_buffer(cfg);

    buffer.add(norm_event(Domain::Stage, "s1", EventKind::Update, Priority::Low, 0));
    buffer.add(norm_event(Domain::Lead, "l1", EventKind::Update, Priority::Normal, 1));
    buffer.add(norm_event(Domain::Message, "m1", EventKind::Insert, Priority::High, 2));
    buffer.add(norm_event(Domain::Message, "m2", EventKind::Insert, Priority::High, 3));
    buffer.add(norm_event(Domain::Notification, "n1", EventKind::Insert, Priority::Critical, 4));

    buffer.flush();
    let batches = batches.lock().unwrap();
    let order: Vec<&str> = batches[0].iter().map(|e| e.id.as_str()).collect();
    assert_eq!(order, ["n1", "m1", "m2", "l1", "s1"]);
}

#[tokio::test(start_paused = true)]
async fn flush_callback_error_is_swallowed_and_scheduling_resumes() {
    let attempts = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&attempts);
    let buffer = EventBuffer::new(config(50, 1000, 100), move |_| {
        *counter.lock().unwrap() += 1;
        anyhow::bail!("store rejected the batch")
    });

    buffer.add(normal("l1", 0));
    buffer.flush();
    assert_eq!(*attempts.lock().unwrap(), 1);
    assert_eq!(buffer.size(), 0);

    // The in-progress guard was released: the next flush still runs.
    buffer.add(normal("l2", 1));
    buffer.flush();
    assert_eq!(*attempts.lock().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn reentrant_flush_from_the_callback_is_a_noop() {
    let slot: Arc<Mutex<Option<EventBuffer>>> = Arc::new(Mutex::new(None));
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));

    let inner_slot = Arc::clone(&slot);
    let sink = Arc::clone(&batches);
    let buffer = EventBuffer::new(config(50, 1000, 100), move |batch| {
        sink.lock().unwrap().push(batch);
        if let Some(buffer) = inner_slot.lock().unwrap().as_ref() {
            buffer.flush(); // guarded; must not recurse
        }
        Ok(())
    });
    slot.lock().unwrap().replace(buffer.clone());

    buffer.add(normal("l1", 0));
    buffer.flush();
    assert_eq!(batches.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn destroy_cancels_the_deferred_flush() {
    let (buffer, batches) = collecting_buffer(config(50, 1000, 100));

    buffer.add(normal("l1", 0));
    buffer.destroy();

    advance(Duration::from_millis(2000)).await;
    settle().await;
    assert!(batches.lock().unwrap().is_empty());
    assert_eq!(buffer.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn deferred_flush_fires_at_the_latency_ceiling_when_idle() {
    let (buffer, batches) = collecting_buffer(config(50, 150, 100));

    buffer.add(normal("l1", 0));
    settle().await; // let the spawned timer task arm before advancing the clock
    advance(Duration::from_millis(149)).await;
    settle().await;
    assert!(batches.lock().unwrap().is_empty());

    advance(Duration::from_millis(2)).await;
    settle().await;
    assert_eq!(batches.lock().unwrap().len(), 1);
}

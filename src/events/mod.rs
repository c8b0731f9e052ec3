//! Event Coordinator: durable append plus live fan-out.
//!
//! `emit` assigns a monotonic timestamp, appends the event row, then
//! publishes to the per-session broadcast channel and the global channel.
//! Persistence failures are logged and never gate publication or later
//! emits. The producer never awaits a subscriber; a lagging subscriber has
//! the oldest buffered events dropped and observes a synthetic
//! `events_dropped` marker in its stream.

pub mod store;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::model::{Event, EventKind, Phase};

/// Per-subscriber buffer; beyond this the oldest events are dropped.
const CHANNEL_CAPACITY: usize = 256;

struct Clock {
    last_ms: i64,
    seq: i64,
}

pub struct EventCoordinator {
    db: DbHandle,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<Event>>>,
    global: broadcast::Sender<Event>,
    clock: Mutex<Clock>,
}

impl EventCoordinator {
    pub fn new(db: DbHandle) -> Self {
        let (global, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            db,
            channels: Mutex::new(HashMap::new()),
            global,
            clock: Mutex::new(Clock { last_ms: 0, seq: 0 }),
        }
    }

    /// Append and publish one event.
    pub fn emit(&self, log_id: Uuid, kind: EventKind) {
        self.emit_scoped(log_id, kind, None, None, None);
    }

    /// Append and publish one event with plan/phase/step scope columns.
    pub fn emit_scoped(
        &self,
        log_id: Uuid,
        kind: EventKind,
        plan_id: Option<Uuid>,
        phase_id: Option<Uuid>,
        step_id: Option<Uuid>,
    ) {
        let (timestamp, seq) = self.next_tick();
        let mut event = Event::from_kind(log_id, timestamp, &kind);
        event.plan_id = plan_id;
        event.phase_id = phase_id;
        event.step_id = step_id;

        if let Err(err) = store::append_event(&self.db, &event, seq) {
            warn!(log_id = %log_id, event_type = %event.event_type, error = %err,
                "failed to persist event; continuing");
        }

        let terminal = event.is_terminal();
        {
            let mut channels = self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(sender) = channels.get(&log_id) {
                let _ = sender.send(event.clone());
            }
            if terminal {
                // Dropping the sender closes subscriber streams once they
                // drain what was already buffered.
                channels.remove(&log_id);
            }
        }
        let _ = self.global.send(event);
    }

    /// Monotonic timestamp + insertion sequence. Timestamps issued by one
    /// coordinator are strictly increasing at millisecond precision.
    fn next_tick(&self) -> (DateTime<Utc>, i64) {
        let mut clock = self
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now_ms = Utc::now().timestamp_millis();
        let ms = if now_ms > clock.last_ms {
            now_ms
        } else {
            clock.last_ms + 1
        };
        clock.last_ms = ms;
        clock.seq += 1;
        let ts = Utc
            .timestamp_millis_opt(ms)
            .single()
            .unwrap_or_else(Utc::now);
        (ts, clock.seq)
    }

    /// Live stream of this session's events, starting at subscription time.
    /// Dropping the stream unsubscribes.
    pub fn subscribe(&self, log_id: Uuid) -> EventStream {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = channels
            .entry(log_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        EventStream {
            log_id,
            inner: BroadcastStream::new(sender.subscribe()),
        }
    }

    /// Live stream of every session's events.
    pub fn subscribe_global(&self) -> EventStream {
        EventStream {
            log_id: Uuid::nil(),
            inner: BroadcastStream::new(self.global.subscribe()),
        }
    }

    /// Persisted events for a session, in append order.
    pub fn events_for_log(&self, log_id: Uuid) -> Result<Vec<Event>, crate::errors::StoreError> {
        store::events_for_log(&self.db, log_id)
    }

    // ── Phase helpers ────────────────────────────────────────────────

    pub fn emit_phase_started(&self, log_id: Uuid, phase: &Phase) {
        self.emit_scoped(
            log_id,
            EventKind::PhaseStarted {
                phase_id: phase.id,
                phase_name: phase.name.clone(),
                step_count: phase.steps.len() as u32,
                sub_query_count: phase.sub_query_count,
                is_decomposed: phase.is_decomposed().then_some(true),
            },
            Some(phase.plan_id),
            Some(phase.id),
            None,
        );
    }

    pub fn emit_phase_completed(&self, log_id: Uuid, phase: &Phase, steps_completed: u32) {
        self.emit_scoped(
            log_id,
            EventKind::PhaseCompleted {
                phase_id: phase.id,
                steps_completed,
            },
            Some(phase.plan_id),
            Some(phase.id),
            None,
        );
    }

    pub fn emit_phase_failed(
        &self,
        log_id: Uuid,
        phase: &Phase,
        step_id: Option<Uuid>,
        error: &str,
    ) {
        self.emit_scoped(
            log_id,
            EventKind::PhaseFailed {
                phase_id: phase.id,
                step_id,
                error: error.to_string(),
            },
            Some(phase.plan_id),
            Some(phase.id),
            step_id,
        );
    }
}

/// A live subscriber stream. Broadcast lag surfaces as an `events_dropped`
/// marker instead of an error; channel close ends the stream.
pub struct EventStream {
    log_id: Uuid,
    inner: BroadcastStream<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                let marker =
                    Event::from_kind(self.log_id, Utc::now(), &EventKind::EventsDropped { count });
                Poll::Ready(Some(marker))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn coordinator() -> EventCoordinator {
        EventCoordinator::new(DbHandle::in_memory().unwrap())
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_emit_order() {
        let coordinator = coordinator();
        let log_id = Uuid::new_v4();
        let mut stream = coordinator.subscribe(log_id);

        coordinator.emit(
            log_id,
            EventKind::SessionStarted {
                query: "q".to_string(),
            },
        );
        coordinator.emit(log_id, EventKind::PlanningStarted {});
        coordinator.emit(log_id, EventKind::SessionCompleted {});

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        let third = stream.next().await.unwrap();
        assert_eq!(first.event_type, "session_started");
        assert_eq!(second.event_type, "planning_started");
        assert_eq!(third.event_type, "session_completed");

        // Terminal event drops the sender; the stream must end.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing() {
        let coordinator = coordinator();
        let log_id = Uuid::new_v4();

        for _ in 0..50 {
            coordinator.emit(log_id, EventKind::PlanningStarted {});
        }
        let events = coordinator.events_for_log(log_id).unwrap();
        assert_eq!(events.len(), 50);
        for pair in events.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn events_persist_even_without_subscribers() {
        let coordinator = coordinator();
        let log_id = Uuid::new_v4();
        coordinator.emit(
            log_id,
            EventKind::SessionStarted {
                query: "quiet".to_string(),
            },
        );
        let events = coordinator.events_for_log(log_id).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_dropped_marker() {
        let coordinator = coordinator();
        let log_id = Uuid::new_v4();
        let mut stream = coordinator.subscribe(log_id);

        // Overflow the subscriber buffer before polling.
        for _ in 0..(CHANNEL_CAPACITY + 40) {
            coordinator.emit(log_id, EventKind::PlanningStarted {});
        }

        let first = stream.next().await.unwrap();
        assert_eq!(first.event_type, "events_dropped");
        assert_eq!(first.data["count"], 40);

        // The remainder of the buffer still arrives.
        let second = stream.next().await.unwrap();
        assert_eq!(second.event_type, "planning_started");
    }

    #[tokio::test]
    async fn global_channel_sees_all_logs() {
        let coordinator = coordinator();
        let mut stream = coordinator.subscribe_global();

        let log_a = Uuid::new_v4();
        let log_b = Uuid::new_v4();
        coordinator.emit(log_a, EventKind::PlanningStarted {});
        coordinator.emit(log_b, EventKind::PlanningStarted {});

        assert_eq!(stream.next().await.unwrap().log_id, log_a);
        assert_eq!(stream.next().await.unwrap().log_id, log_b);
    }

    #[tokio::test]
    async fn phase_helpers_populate_scope_columns() {
        let coordinator = coordinator();
        let log_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let phase = Phase::new(plan_id, "Initial Search", 1);

        coordinator.emit_phase_started(log_id, &phase);
        coordinator.emit_phase_failed(log_id, &phase, None, "boom");

        let events = coordinator.events_for_log(log_id).unwrap();
        assert_eq!(events[0].event_type, "phase_started");
        assert_eq!(events[0].phase_id, Some(phase.id));
        assert_eq!(events[0].plan_id, Some(plan_id));
        assert_eq!(events[0].data["phaseName"], "Initial Search");
        assert_eq!(events[1].event_type, "phase_failed");
        assert_eq!(events[1].data["error"], "boom");
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let coordinator = coordinator();
        let log_id = Uuid::new_v4();
        coordinator.emit(log_id, EventKind::PlanningStarted {});

        let mut stream = coordinator.subscribe(log_id);
        coordinator.emit(log_id, EventKind::SessionCompleted {});

        let only = stream.next().await.unwrap();
        assert_eq!(only.event_type, "session_completed");
        assert!(stream.next().await.is_none());
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use fil_core::types::BusEvent;

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Predicate applied before delivering an event to a subscriber.
///
/// Fields compose conjunctively; an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_id: Option<Uuid>,
    /// Matches when the event type starts with this prefix
    /// (`"bead."` matches `bead.created`; `"bead.created"` matches exactly).
    pub type_prefix: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_project(project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            type_prefix: None,
        }
    }

    pub fn for_type(prefix: impl Into<String>) -> Self {
        Self {
            project_id: None,
            type_prefix: Some(prefix.into()),
        }
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(project) = self.project_id {
            if event.project_id != Some(project) {
                return false;
            }
        }
        if let Some(ref prefix) = self.type_prefix {
            if !event.event_type.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving half of a subscription. Dropping it (or calling
/// [`EventBus::unsubscribe`]) detaches the subscriber; later publishes to it
/// are silently discarded.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: flume::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Events dropped for this subscriber because its buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Subscriber {
    tx: flume::Sender<BusEvent>,
    filter: EventFilter,
    dropped: Arc<AtomicU64>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on top of flume channels.
///
/// Thread-safe and cheap to clone (it wraps its internals in an `Arc`).
/// Publishing never blocks: each subscriber has a bounded buffer and a full
/// buffer drops the event for that subscriber only. Events from a single
/// publisher are delivered in publish order; there is no cross-publisher
/// ordering guarantee.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    history: Mutex<VecDeque<BusEvent>>,
    history_size: usize,
    buffer_size: usize,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer and history sizes.
    pub fn new(buffer_size: usize, history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_size)),
                history_size,
                buffer_size,
            }),
        }
    }

    /// Register a new subscriber; only events matching `filter` are delivered.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = flume::bounded(self.inner.buffer_size);
        let id = Uuid::new_v4();
        let dropped = Arc::new(AtomicU64::new(0));
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.insert(
            id,
            Subscriber {
                tx,
                filter,
                dropped: Arc::clone(&dropped),
            },
        );
        Subscription {
            id,
            receiver: rx,
            dropped,
        }
    }

    /// Detach a subscriber. Further publishes to it are silently dropped.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.remove(&id);
    }

    /// Publish an event to all matching live subscribers and record it in
    /// the history ring.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// pruned lazily on the next publish.
    pub fn publish(&self, event: BusEvent) {
        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if history.len() == self.inner.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let mut disconnected: Vec<Uuid> = Vec::new();
        {
            let subs = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            for (id, sub) in subs.iter() {
                if !sub.filter.matches(&event) {
                    continue;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(_)) => {
                        let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(
                            subscriber = %id,
                            event_type = %event.event_type,
                            dropped_total = total,
                            "subscriber buffer full, event dropped"
                        );
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        disconnected.push(*id);
                    }
                }
            }
        }

        if !disconnected.is_empty() {
            let mut subs = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            for id in disconnected {
                subs.remove(&id);
            }
        }
    }

    /// The most recent events, newest last, optionally narrowed by project
    /// and type prefix.
    pub fn recent(
        &self,
        n: usize,
        project_id: Option<Uuid>,
        type_prefix: Option<&str>,
    ) -> Vec<BusEvent> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let filter = EventFilter {
            project_id,
            type_prefix: type_prefix.map(str::to_string),
        };
        history
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Return the number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64, 1024)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, project: Option<Uuid>) -> BusEvent {
        let mut ev = BusEvent::new(event_type, "test");
        ev.project_id = project;
        ev
    }

    #[test]
    fn delivers_to_matching_subscriber_in_order() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());

        bus.publish(event("bead.created", None));
        bus.publish(event("bead.updated", None));

        assert_eq!(sub.receiver.recv().unwrap().event_type, "bead.created");
        assert_eq!(sub.receiver.recv().unwrap().event_type, "bead.updated");
    }

    #[test]
    fn project_filter_excludes_other_projects() {
        let bus = EventBus::default();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let sub = bus.subscribe(EventFilter::for_project(p1));

        bus.publish(event("bead.created", Some(p1)));
        bus.publish(event("bead.created", Some(p2)));
        bus.publish(event("bead.updated", Some(p1)));

        let first = sub.receiver.recv().unwrap();
        let second = sub.receiver.recv().unwrap();
        assert_eq!(first.project_id, Some(p1));
        assert_eq!(second.project_id, Some(p1));
        assert_eq!(second.event_type, "bead.updated");
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn type_prefix_filter() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::for_type("bead."));

        bus.publish(event("bead.created", None));
        bus.publish(event("agent.idle", None));

        assert_eq!(sub.receiver.recv().unwrap().event_type, "bead.created");
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn overflow_drops_only_for_slow_subscriber() {
        let bus = EventBus::new(2, 16);
        let slow = bus.subscribe(EventFilter::all());
        let fast = bus.subscribe(EventFilter::all());

        for i in 0..5 {
            bus.publish(event(&format!("tick.{i}"), None));
            // Fast subscriber keeps draining; slow one never reads.
            let _ = fast.receiver.recv().unwrap();
        }

        assert_eq!(slow.dropped_count(), 3);
        assert_eq!(fast.dropped_count(), 0);
        // The slow subscriber still holds the first two events.
        assert_eq!(slow.receiver.recv().unwrap().event_type, "tick.0");
        assert_eq!(slow.receiver.recv().unwrap().event_type, "tick.1");
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(event("bead.created", None));
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        drop(sub);

        bus.publish(event("bead.created", None));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn recent_honours_ring_capacity() {
        let bus = EventBus::new(64, 3);
        for i in 0..5 {
            bus.publish(event(&format!("tick.{i}"), None));
        }
        let recent = bus.recent(10, None, None);
        let types: Vec<_> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["tick.2", "tick.3", "tick.4"]);
    }

    #[test]
    fn recent_filters_by_project_and_type() {
        let bus = EventBus::default();
        let p1 = Uuid::new_v4();
        bus.publish(event("bead.created", Some(p1)));
        bus.publish(event("agent.idle", Some(p1)));
        bus.publish(event("bead.created", None));

        let recent = bus.recent(10, Some(p1), Some("bead."));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "bead.created");
        assert_eq!(recent[0].project_id, Some(p1));
    }

    #[test]
    fn recent_returns_newest_last_capped_at_n() {
        let bus = EventBus::default();
        for i in 0..10 {
            bus.publish(event(&format!("tick.{i}"), None));
        }
        let recent = bus.recent(3, None, None);
        let types: Vec<_> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["tick.7", "tick.8", "tick.9"]);
    }
}

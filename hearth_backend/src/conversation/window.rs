use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::{Event, EventId, EventKind};

type OrderingKey = (DateTime<Utc>, EventId);

/// Bounded buffer of the most recent events, ordered by `(timestamp, id)`.
///
/// Holds no duplicate ids. Events older than anything already evicted are
/// dropped on arrival, so re-delivery of an old batch is a no-op.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    capacity: usize,
    events: VecDeque<Event>,
    ids: HashSet<EventId>,
    evicted_through: Option<OrderingKey>,
    max_seq: i64,
    next_local: u32,
}

impl ConversationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity + 1),
            ids: HashSet::with_capacity(capacity + 1),
            evicted_through: None,
            max_seq: 0,
            next_local: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Event> + ExactSizeIterator + Clone {
        self.events.iter()
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.events.iter().find(|e| e.id == id)
    }

    pub fn latest(&self) -> Option<&Event> {
        self.events.back()
    }

    /// Adds a batch, returning the events that were not already known and are
    /// still retained after eviction, in window order.
    pub fn ingest(&mut self, raw_events: impl IntoIterator<Item = Event>) -> Vec<Event> {
        let mut batch: Vec<Event> = raw_events.into_iter().collect();
        batch.sort_by_key(Event::ordering_key);

        let mut accepted = Vec::new();
        for event in batch {
            if self.ids.contains(&event.id) {
                continue;
            }
            if let Some(floor) = self.evicted_through {
                if event.ordering_key() <= floor {
                    tracing::debug!("Window: dropping {} (older than evicted history)", event.id);
                    continue;
                }
            }
            if event.is_self && !event.id.is_local() {
                self.reconcile_local_echo(&event);
            }
            if !event.id.is_local() {
                self.max_seq = self.max_seq.max(event.id.seq);
            }

            accepted.push(event.id);
            self.insert_sorted(event);
        }

        self.evict_overflow();

        self.events
            .iter()
            .filter(|e| accepted.contains(&e.id))
            .cloned()
            .collect()
    }

    /// Records a reply we just sent as a synthetic self event ordered after
    /// everything currently known.
    pub fn record_local_reply(
        &mut self,
        sender: impl Into<String>,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Event {
        let timestamp = match self.events.back() {
            Some(last) if last.timestamp > sent_at => last.timestamp,
            _ => sent_at,
        };
        let id = EventId::local(self.max_seq, self.next_local);
        self.next_local += 1;

        let event = Event::text(id, sender, text, true, timestamp);
        self.insert_sorted(event.clone());
        self.evict_overflow();
        event
    }

    /// Foreign events after the most recent self event, oldest first.
    pub fn pending_foreign(&self) -> Vec<&Event> {
        let mut pending: Vec<&Event> = self
            .events
            .iter()
            .rev()
            .take_while(|e| !e.is_self)
            .collect();
        pending.reverse();
        pending
    }

    pub fn last_self_text(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.is_self)
            .find_map(|e| e.body())
    }

    fn insert_sorted(&mut self, event: Event) {
        let key = event.ordering_key();
        let index = self.events.partition_point(|e| e.ordering_key() < key);
        self.ids.insert(event.id);
        self.events.insert(index, event);
    }

    fn evict_overflow(&mut self) {
        while self.events.len() > self.capacity {
            let Some(oldest) = self.events.pop_front() else {
                break;
            };
            self.ids.remove(&oldest.id);
            let key = oldest.ordering_key();
            if self.evicted_through.map_or(true, |floor| key > floor) {
                self.evicted_through = Some(key);
            }
        }
    }

    /// Drops the synthetic copy of a reply once the source delivers the real echo.
    fn reconcile_local_echo(&mut self, echo: &Event) {
        let EventKind::Text(echo_text) = &echo.kind else {
            return;
        };
        let echo_text = echo_text.trim();
        let position = self.events.iter().position(|e| {
            e.id.is_local() && e.body().map(str::trim) == Some(echo_text)
        });
        if let Some(index) = position {
            if let Some(local) = self.events.remove(index) {
                self.ids.remove(&local.id);
                tracing::debug!("Window: replaced local reply {} with echo {}", local.id, echo.id);
            }
        }
    }
}

//! Time-ordered event queue.
//!
//! Events live in an arena owned by the queue and are addressed through
//! [`EventId`] handles. Scheduled events form a singly-linked chain sorted
//! ascending by time; the chain links are the only ownership path between
//! events, and an event is "scheduled" exactly when it is linked.
//!
//! ```text
//!  first                                   last
//!    │                                       │
//!    ▼                                       ▼
//!  [B@5] ──next──► [A@10] ──next──► [C@10] ──► None
//! ```
//!
//! Insertion walks from the head and places the new event after every
//! event with `time <= new_time`, so equal timestamps pop in FIFO order.
//! Insert and removal-by-identity are O(n); pop and peek are O(1). The
//! queue holds at most a few events per mote, so the linear walk is fine.

use crate::error::SchedulingError;
use motesim_env::SimTime;

/// Handle to an event registered in an [`EventQueue`].
///
/// Handles carry a generation so that a handle kept after
/// [`EventQueue::release`] never aliases a newer event in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E#{}.{}", self.index, self.generation)
    }
}

struct Slot<E> {
    generation: u32,
    occupied: bool,
    /// `None` while the event is checked out for execution.
    event: Option<E>,
    time: SimTime,
    next: Option<u32>,
    scheduled: bool,
}

impl<E> Slot<E> {
    fn vacant() -> Self {
        Self {
            generation: 0,
            occupied: false,
            event: None,
            time: 0,
            next: None,
            scheduled: false,
        }
    }
}

/// Arena of reusable events plus the time-ordered chain of scheduled ones.
pub struct EventQueue<E> {
    slots: Vec<Slot<E>>,
    free: Vec<u32>,
    first: Option<u32>,
    last: Option<u32>,
    event_count: usize,
}

impl<E> EventQueue<E> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            first: None,
            last: None,
            event_count: 0,
        }
    }

    /// Registers a new, unscheduled event and returns its handle.
    pub fn register(&mut self, event: E) -> EventId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::vacant());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.occupied = true;
        slot.event = Some(event);
        slot.time = 0;
        slot.next = None;
        slot.scheduled = false;

        EventId {
            index,
            generation: slot.generation,
        }
    }

    /// Destroys an event, unlinking it first if it is scheduled.
    ///
    /// Returns the event unless it is currently checked out with
    /// [`take`](Self::take); in that case the later
    /// [`restore`](Self::restore) hands it back to the caller to drop.
    pub fn release(&mut self, id: EventId) -> Option<E> {
        if !self.is_registered(id) {
            return None;
        }
        self.remove(id);

        let slot = &mut self.slots[id.index as usize];
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        let event = slot.event.take();
        self.free.push(id.index);
        event
    }

    /// True if `id` refers to a live (registered, not released) event.
    pub fn is_registered(&self, id: EventId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |slot| slot.occupied && slot.generation == id.generation)
    }

    /// Schedules `id` at `time`.
    ///
    /// Scheduling an event that is already scheduled is a programming
    /// error: it is rejected and the queue is left untouched.
    pub fn add_event(&mut self, id: EventId, time: SimTime) -> Result<(), SchedulingError> {
        if !self.is_registered(id) {
            return Err(SchedulingError::UnknownEvent(id));
        }
        let slot = &self.slots[id.index as usize];
        if slot.scheduled {
            return Err(SchedulingError::AlreadyScheduled {
                event: id,
                scheduled_at: slot.time,
                requested: time,
            });
        }

        self.slots[id.index as usize].time = time;
        self.link(id.index, time);
        Ok(())
    }

    fn link(&mut self, index: u32, time: SimTime) {
        match (self.first, self.last) {
            (Some(first), Some(last)) => {
                if time >= self.slots[last as usize].time {
                    self.slots[last as usize].next = Some(index);
                    self.last = Some(index);
                } else if time < self.slots[first as usize].time {
                    self.slots[index as usize].next = Some(first);
                    self.first = Some(index);
                } else {
                    // first.time <= time < last.time, so the walk stops before the tail
                    let mut pos = first;
                    while let Some(next) = self.slots[pos as usize].next {
                        if time < self.slots[next as usize].time {
                            break;
                        }
                        pos = next;
                    }
                    self.slots[index as usize].next = self.slots[pos as usize].next;
                    self.slots[pos as usize].next = Some(index);
                }
            }
            _ => {
                self.first = Some(index);
                self.last = Some(index);
            }
        }

        self.slots[index as usize].scheduled = true;
        self.event_count += 1;
    }

    /// Removes and returns the earliest event with its scheduled time.
    pub fn pop_first(&mut self) -> Option<(EventId, SimTime)> {
        let index = self.first?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.scheduled, "linked event must be scheduled");

        self.first = slot.next.take();
        if self.last == Some(index) {
            self.last = None;
        }
        slot.scheduled = false;
        self.event_count -= 1;

        Some((
            EventId {
                index,
                generation: slot.generation,
            },
            slot.time,
        ))
    }

    /// Returns the earliest scheduled event without removing it.
    pub fn peek_first(&self) -> Option<EventId> {
        self.first.map(|index| self.id_at(index))
    }

    /// Returns the event linked after `id`, if `id` is scheduled.
    ///
    /// Together with [`peek_first`](Self::peek_first) this lets callers
    /// walk the chain and [`remove`](Self::remove) matching events; fetch
    /// the successor before removing the current event.
    pub fn next_event(&self, id: EventId) -> Option<EventId> {
        if !self.is_scheduled(id) {
            return None;
        }
        self.slots[id.index as usize].next.map(|index| self.id_at(index))
    }

    fn id_at(&self, index: u32) -> EventId {
        EventId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Unschedules an event.
    ///
    /// Returns `false` (and does nothing) if the event is not scheduled.
    pub fn remove(&mut self, id: EventId) -> bool {
        if !self.is_scheduled(id) {
            return false;
        }

        let mut prev: Option<u32> = None;
        let mut cursor = self.first;
        while let Some(index) = cursor {
            if index == id.index {
                let next = self.slots[index as usize].next.take();
                match prev {
                    Some(prev) => self.slots[prev as usize].next = next,
                    None => self.first = next,
                }
                if self.last == Some(index) {
                    self.last = prev;
                }
                self.slots[index as usize].scheduled = false;
                self.event_count -= 1;
                return true;
            }
            prev = Some(index);
            cursor = self.slots[index as usize].next;
        }

        false
    }

    /// Pops every scheduled event, resetting each one's scheduled state.
    ///
    /// The events stay registered and may be scheduled again.
    pub fn remove_all(&mut self) {
        while self.pop_first().is_some() {}
    }

    /// True if the event is currently in the chain.
    pub fn is_scheduled(&self, id: EventId) -> bool {
        self.is_registered(id) && self.slots[id.index as usize].scheduled
    }

    /// Time the event was last scheduled for.
    pub fn time_of(&self, id: EventId) -> Option<SimTime> {
        if self.is_registered(id) {
            Some(self.slots[id.index as usize].time)
        } else {
            None
        }
    }

    /// Borrows the event payload.
    pub fn get(&self, id: EventId) -> Option<&E> {
        if self.is_registered(id) {
            self.slots[id.index as usize].event.as_ref()
        } else {
            None
        }
    }

    /// Mutably borrows the event payload.
    pub fn get_mut(&mut self, id: EventId) -> Option<&mut E> {
        if self.is_registered(id) {
            self.slots[id.index as usize].event.as_mut()
        } else {
            None
        }
    }

    /// Checks the payload out of the arena, e.g. to execute it with
    /// mutable access to the queue's owner. The slot (and its scheduling
    /// state) stays live; scheduling the handle while checked out is fine.
    pub fn take(&mut self, id: EventId) -> Option<E> {
        if self.is_registered(id) {
            self.slots[id.index as usize].event.take()
        } else {
            None
        }
    }

    /// Returns a payload checked out with [`take`](Self::take).
    ///
    /// Fails, handing the payload back, if the event was released in the
    /// meantime.
    pub fn restore(&mut self, id: EventId, event: E) -> Result<(), E> {
        if !self.is_registered(id) {
            return Err(event);
        }
        self.slots[id.index as usize].event = Some(event);
        Ok(())
    }

    /// Iterates over scheduled events in pop order.
    pub fn iter(&self) -> Iter<'_, E> {
        Iter {
            queue: self,
            cursor: self.first,
        }
    }

    /// Number of scheduled events.
    pub fn len(&self) -> usize {
        self.event_count
    }

    /// True if no event is scheduled.
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Number of registered events, scheduled or not.
    pub fn registered_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over the scheduled chain, yielding `(handle, time)`.
pub struct Iter<'a, E> {
    queue: &'a EventQueue<E>,
    cursor: Option<u32>,
}

impl<'a, E> Iterator for Iter<'a, E> {
    type Item = (EventId, SimTime);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.queue.slots[index as usize];
        self.cursor = slot.next;
        Some((self.queue.id_at(index), slot.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(queue: &mut EventQueue<&'static str>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Some((id, _)) = queue.pop_first() {
            out.push(*queue.get(id).unwrap());
        }
        out
    }

    #[test]
    fn test_fifo_tie_break() {
        let mut queue = EventQueue::new();
        let a = queue.register("A");
        let b = queue.register("B");
        let c = queue.register("C");

        queue.add_event(a, 10).unwrap();
        queue.add_event(b, 5).unwrap();
        queue.add_event(c, 10).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&mut queue), vec!["B", "A", "C"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_insert_in_middle() {
        let mut queue = EventQueue::new();
        for (name, time) in [("a", 1), ("d", 40), ("b", 20), ("c", 20), ("e", 30)] {
            let id = queue.register(name);
            queue.add_event(id, time).unwrap();
        }
        let times: Vec<SimTime> = queue.iter().map(|(_, t)| t).collect();
        assert_eq!(times, vec![1, 20, 20, 30, 40]);
        assert_eq!(drain(&mut queue), vec!["a", "b", "c", "e", "d"]);
    }

    #[test]
    fn test_remove_unscheduled_is_noop() {
        let mut queue = EventQueue::new();
        let a = queue.register("A");
        assert!(!queue.remove(a));

        queue.add_event(a, 3).unwrap();
        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert!(queue.pop_first().is_none());
    }

    #[test]
    fn test_removed_event_never_pops() {
        let mut queue = EventQueue::new();
        let a = queue.register("A");
        let b = queue.register("B");
        let c = queue.register("C");
        queue.add_event(a, 1).unwrap();
        queue.add_event(b, 2).unwrap();
        queue.add_event(c, 3).unwrap();

        // Tail removal must move `last` back so later inserts append correctly
        assert!(queue.remove(c));
        let d = queue.register("D");
        queue.add_event(d, 9).unwrap();
        assert!(queue.remove(a));

        assert_eq!(drain(&mut queue), vec!["B", "D"]);
    }

    #[test]
    fn test_re_add_rejected_and_state_unchanged() {
        let mut queue = EventQueue::new();
        let a = queue.register("A");
        let b = queue.register("B");
        queue.add_event(a, 10).unwrap();
        queue.add_event(b, 20).unwrap();

        let err = queue.add_event(a, 1).unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::AlreadyScheduled { scheduled_at: 10, requested: 1, .. }
        ));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.time_of(a), Some(10));
        assert_eq!(drain(&mut queue), vec!["A", "B"]);
    }

    #[test]
    fn test_reschedule_after_pop() {
        let mut queue = EventQueue::new();
        let a = queue.register("A");
        queue.add_event(a, 10).unwrap();
        let (popped, time) = queue.pop_first().unwrap();
        assert_eq!((popped, time), (a, 10));
        assert!(!queue.is_scheduled(a));

        queue.add_event(a, 20).unwrap();
        assert!(queue.is_scheduled(a));
        assert_eq!(queue.peek_first(), Some(a));
    }

    #[test]
    fn test_remove_all_resets_scheduled_state() {
        let mut queue = EventQueue::new();
        let ids: Vec<EventId> = ["A", "B", "C"].iter().map(|n| queue.register(*n)).collect();
        for (i, id) in ids.iter().enumerate() {
            queue.add_event(*id, i as SimTime).unwrap();
        }

        queue.remove_all();
        assert!(queue.is_empty());
        assert!(ids.iter().all(|id| !queue.is_scheduled(*id)));
        // Still registered, so they can be reused
        queue.add_event(ids[1], 7).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut queue = EventQueue::new();
        let a = queue.register("A");
        queue.add_event(a, 1).unwrap();
        assert_eq!(queue.release(a), Some("A"));
        assert!(queue.is_empty());

        // Slot gets recycled with a new generation
        let b = queue.register("B");
        assert_ne!(a, b);
        assert!(matches!(queue.add_event(a, 5), Err(SchedulingError::UnknownEvent(_))));
        assert!(!queue.remove(a));
        assert_eq!(queue.get(b), Some(&"B"));
        assert_eq!(queue.registered_count(), 1);
    }

    #[test]
    fn test_walk_and_remove_matching() {
        let mut queue = EventQueue::new();
        for (name, time) in [("x1", 1), ("y1", 2), ("x2", 3), ("y2", 4), ("x3", 5)] {
            let id = queue.register(name);
            queue.add_event(id, time).unwrap();
        }

        let mut cursor = queue.peek_first();
        while let Some(id) = cursor {
            cursor = queue.next_event(id);
            if queue.get(id).map_or(false, |n| n.starts_with('x')) {
                queue.remove(id);
            }
        }

        assert_eq!(drain(&mut queue), vec!["y1", "y2"]);
    }

    #[test]
    fn test_take_restore_and_release_while_taken() {
        let mut queue = EventQueue::new();
        let a = queue.register(String::from("A"));
        let payload = queue.take(a).unwrap();
        // Scheduling works while the payload is checked out
        queue.add_event(a, 4).unwrap();
        assert!(queue.restore(a, payload).is_ok());
        assert_eq!(queue.get(a).map(String::as_str), Some("A"));

        let payload = queue.take(a).unwrap();
        assert_eq!(queue.release(a), None);
        assert!(queue.is_empty());
        assert_eq!(queue.restore(a, payload), Err(String::from("A")));
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_stable_sort(times in proptest::collection::vec(0u64..50, 0..64)) {
            let mut queue = EventQueue::new();
            for (seq, time) in times.iter().enumerate() {
                let id = queue.register(seq);
                queue.add_event(id, *time).unwrap();
            }

            let mut expected: Vec<(SimTime, usize)> =
                times.iter().enumerate().map(|(seq, t)| (*t, seq)).collect();
            expected.sort();

            let mut popped = Vec::new();
            while let Some((id, time)) = queue.pop_first() {
                popped.push((time, *queue.get(id).unwrap()));
            }
            prop_assert_eq!(popped, expected);
        }

        #[test]
        fn prop_removed_events_never_pop(
            times in proptest::collection::vec(0u64..20, 1..40),
            mask in proptest::collection::vec(any::<bool>(), 40),
        ) {
            let mut queue = EventQueue::new();
            let mut ids = Vec::new();
            for (seq, time) in times.iter().enumerate() {
                let id = queue.register(seq);
                queue.add_event(id, *time).unwrap();
                ids.push(id);
            }
            for (seq, id) in ids.iter().enumerate() {
                if mask[seq] {
                    prop_assert!(queue.remove(*id));
                    prop_assert!(!queue.remove(*id));
                }
            }

            let mut last = 0;
            while let Some((id, time)) = queue.pop_first() {
                let seq = *queue.get(id).unwrap();
                prop_assert!(!mask[seq]);
                prop_assert!(time >= last);
                last = time;
            }
        }
    }
}

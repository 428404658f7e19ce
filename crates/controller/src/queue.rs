//! FIFO event queue that coalesces identical pending events.

use std::collections::VecDeque;

use kubecat_core::Event;
use rustc_hash::FxHashSet;

#[derive(Debug, Default)]
pub struct EventQueue {
    pending: FxHashSet<Event>,
    order: VecDeque<Event>,
    coalesced: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of pushes absorbed by an identical pending event.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Returns false when an identical event was already pending.
    pub fn push(&mut self, e: Event) -> bool {
        if self.pending.contains(&e) {
            self.coalesced += 1;
            return false;
        }
        self.pending.insert(e.clone());
        self.order.push_back(e);
        true
    }

    /// Take up to `max` events sharing the head's event type. The first event
    /// of another type stays at the head for the next call.
    pub fn pop_batch(&mut self, max: usize) -> Vec<Event> {
        let mut out = Vec::new();
        let kind = match self.order.front() {
            Some(e) => e.kind,
            None => return out,
        };
        while out.len() < max.max(1) {
            match self.order.front() {
                Some(e) if e.kind == kind => {}
                _ => break,
            }
            if let Some(e) = self.order.pop_front() {
                self.pending.remove(&e);
                out.push(e);
            }
        }
        out
    }

    /// Drop everything pending; returns how many events were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.order.len();
        self.order.clear();
        self.pending.clear();
        n
    }
}

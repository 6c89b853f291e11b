//! # engine::merge
//!
//! Merges order-status events, ticks and timer firings into one strictly
//! ordered sequence.
//!
//! Ordering key: arrival instant, then source priority
//! (order events > ticks > timers), then a sequence number so equal keys
//! keep their push order.

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

use crate::models::{OrderEvent, Tick};

/// An input stamped with the instant it reached the process.
#[derive(Debug, Clone)]
pub struct Arrival<T> {
    pub at:   Instant,
    pub item: T,
}

impl<T> Arrival<T> {
    pub fn now(item: T) -> Self {
        Self { at: Instant::now(), item }
    }
}

#[derive(Debug, Clone)]
pub enum LoopEvent {
    Order(OrderEvent),
    Tick(Tick),
    Timer(DateTime<Utc>),
}

impl LoopEvent {
    /// Lower wins a tie on arrival.
    fn rank(&self) -> u8 {
        match self {
            LoopEvent::Order(_) => 0,
            LoopEvent::Tick(_) => 1,
            LoopEvent::Timer(_) => 2,
        }
    }
}

struct Queued {
    at:    Instant,
    rank:  u8,
    seq:   u64,
    event: LoopEvent,
}

impl Queued {
    fn sort_key(&self) -> (Instant, u8, u64) {
        (self.at, self.rank, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[derive(Default)]
pub struct EventMerger {
    heap: BinaryHeap<Reverse<Queued>>,
    seq:  u64,
}

impl EventMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: Instant, event: LoopEvent) {
        self.seq += 1;
        self.heap.push(Reverse(Queued {
            at,
            rank: event.rank(),
            seq: self.seq,
            event,
        }));
    }

    pub fn push_order(&mut self, arrival: Arrival<OrderEvent>) {
        self.push(arrival.at, LoopEvent::Order(arrival.item));
    }

    pub fn push_tick(&mut self, arrival: Arrival<Tick>) {
        self.push(arrival.at, LoopEvent::Tick(arrival.item));
    }

    /// Next event in merged order.
    pub fn pop(&mut self) -> Option<LoopEvent> {
        self.heap.pop().map(|Reverse(q)| q.event)
    }
}

//! Check scheduling for the client loop.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::condition::InhibitingCondition;

/// A single pending `does_inhibit` check. Ordered by check time; exactly one
/// entry per registered condition is alive at any moment.
pub struct ScheduledCheck {
    pub time: DateTime<Utc>,
    pub condition: Rc<RefCell<dyn InhibitingCondition>>,
}

impl PartialEq for ScheduledCheck {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl Eq for ScheduledCheck {}

impl PartialOrd for ScheduledCheck {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledCheck {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}

impl fmt::Debug for ScheduledCheck {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScheduledCheck")
            .field("time", &self.time)
            .field("condition", &self.condition.borrow().name())
            .finish()
    }
}

/// Min-heap used by the client to order scheduled checks.
pub struct PriorityQueue<T: Ord> {
    heap: BinaryHeap<Reverse<T>>,
}

impl<T: Ord> PriorityQueue<T> {
    pub fn new() -> PriorityQueue<T> {
        PriorityQueue {
            heap: BinaryHeap::new(),
        }
    }

    pub fn offer(&mut self, element: T) {
        self.heap.push(Reverse(element));
    }

    /// Removes and returns the minimum element, or `None` when empty.
    pub fn poll(&mut self) -> Option<T> {
        self.heap.pop().map(|Reverse(element)| element)
    }

    /// Returns the minimum element without removing it, or `None` when empty.
    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|Reverse(element)| element)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Iterates the contents in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|Reverse(element)| element)
    }
}

impl<T: Ord> Default for PriorityQueue<T> {
    fn default() -> Self {
        PriorityQueue::new()
    }
}

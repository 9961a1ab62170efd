//! Pending tasks ordered by priority, FIFO among equals.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::task::Task;

struct Entry<S> {
    priority: u32,
    seq: u64,
    task: Box<dyn Task<S>>,
}

impl<S> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<S> Eq for Entry<S> {}

impl<S> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Entry<S> {
    // Reversed: the max-heap must yield the lowest (priority, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

pub struct TaskQueue<S> {
    heap: BinaryHeap<Entry<S>>,
    next_seq: u64,
}

impl<S> Default for TaskQueue<S> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<S> TaskQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Box<dyn Task<S>>) {
        let entry = Entry {
            priority: task.priority(),
            seq: self.next_seq,
            task,
        };
        self.next_seq += 1;
        self.heap.push(entry);
    }

    /// Remove the task with the numerically lowest priority.
    pub fn pop(&mut self) -> Option<Box<dyn Task<S>>> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn peek_priority(&self) -> Option<u32> {
        self.heap.peek().map(|entry| entry.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

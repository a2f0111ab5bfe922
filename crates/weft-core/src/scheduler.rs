//! Dependency scheduler: defers operations until every id they reference is
//! locally resolvable.
//!
//! Waiters are keyed by the exact missing unit id. When a multi-unit run is
//! applied, the store reports every unit id it covers, so a waiter anchored
//! on a mid-run offset wakes as well. Newly ready operations collect in a
//! batch queue that a single transaction drains.

use std::collections::{HashMap, VecDeque};

use crate::op::{OpId, Operation};

struct Waiting {
    op: Operation,
    missing: usize,
}

#[derive(Default)]
pub struct DependencyScheduler {
    /// Missing unit id -> tokens of operations waiting on it.
    by_id: HashMap<OpId, Vec<u64>>,
    waiting: HashMap<u64, Waiting>,
    ready: VecDeque<Operation>,
    next_token: u64,
}

impl DependencyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `op` until every id in `missing` has been reported resolved.
    /// `missing` must be non-empty; duplicates count once.
    pub fn defer(&mut self, op: Operation, missing: &[OpId]) {
        let mut unique: Vec<OpId> = Vec::with_capacity(missing.len());
        for &id in missing {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        if unique.is_empty() {
            self.ready.push_back(op);
            return;
        }
        let token = self.next_token;
        self.next_token += 1;
        for id in &unique {
            self.by_id.entry(*id).or_default().push(token);
        }
        self.waiting.insert(token, Waiting { op, missing: unique.len() });
    }

    /// An operation covering `id` was durably applied. Decrements every
    /// waiter anchored on that exact id; waiters reaching zero move to the
    /// ready batch in registration order.
    pub fn resolved(&mut self, id: OpId) {
        let Some(tokens) = self.by_id.remove(&id) else {
            return;
        };
        for token in tokens {
            if let Some(waiting) = self.waiting.get_mut(&token) {
                waiting.missing -= 1;
                if waiting.missing == 0 {
                    let waiting = self
                        .waiting
                        .remove(&token)
                        .unwrap_or_else(|| unreachable!());
                    self.ready.push_back(waiting.op);
                }
            }
        }
    }

    /// Queue an operation whose dependencies are already satisfied.
    pub fn enqueue_ready(&mut self, op: Operation) {
        self.ready.push_back(op);
    }

    pub fn take_ready(&mut self) -> Option<Operation> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Number of operations still parked on missing dependencies.
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }
}

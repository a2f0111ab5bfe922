//! The document store: operation arena, per-client state vector, delete
//! store, and the queues the merge engine feeds.
//!
//! All references between records are ids; the arena is a `BTreeMap` keyed
//! by [`OpId`], so a covering lookup for a mid-run offset is a single
//! predecessor scan within the owning client's contiguous key range.
//!
//! Every mutation happens through a [`Transaction`](crate::txn::Transaction);
//! the store itself only offers lookups and bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Result, WeftError};
use crate::op::{ClientId, Clock, OpId, Operation, ROOT_CLIENT};
use crate::scheduler::DependencyScheduler;
use crate::txn::Transaction;

/// Callback registered on a container; invoked once per structurally
/// affecting operation with the transaction context and the operation.
pub type Observer = Arc<dyn Fn(&Transaction<'_>, &Operation) + Send + Sync>;

/// Hook handed every locally created operation, in creation order, at flush
/// time.
pub type SendHook = Arc<dyn Fn(&[Operation]) + Send + Sync>;

/// One deleted clock range. `gc` is set once the range has been physically
/// reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteSpan {
    pub len: u64,
    pub gc: bool,
}

/// Per-client deleted clock ranges.
///
/// This is what lets deletions run ahead of the insertions they target: a
/// delete against an unknown id marks the range here immediately, and the
/// insertion reconciles against it on arrival.
#[derive(Default)]
pub struct DeleteStore {
    clients: HashMap<ClientId, BTreeMap<Clock, DeleteSpan>>,
}

impl DeleteStore {
    fn span_at(&self, id: OpId) -> Option<DeleteSpan> {
        let map = self.clients.get(&id.client)?;
        let (&start, &span) = map.range(..=id.clock).next_back()?;
        (start + span.len > id.clock).then_some(span)
    }

    pub fn is_deleted(&self, id: OpId) -> bool {
        self.span_at(id).is_some()
    }

    pub fn is_garbage_collected(&self, id: OpId) -> bool {
        self.span_at(id).is_some_and(|s| s.gc)
    }

    pub fn mark_deleted(&mut self, id: OpId, len: u64) {
        self.mark(id, len, false);
    }

    pub fn mark_reclaimed(&mut self, id: OpId, len: u64) {
        self.mark(id, len, true);
    }

    /// Marks `[id.clock, id.clock + len)`. A reclaimed flag is sticky: a
    /// plain deletion mark never downgrades a reclaimed unit, while a
    /// reclaim mark upgrades deleted units.
    fn mark(&mut self, id: OpId, len: u64, gc: bool) {
        if len == 0 {
            return;
        }
        let map = self.clients.entry(id.client).or_default();
        let start = id.clock;
        let end = start + len;
        let scan_from = map
            .range(..=start)
            .next_back()
            .map(|(&k, _)| k)
            .unwrap_or(start);
        let overlapping: Vec<(Clock, DeleteSpan)> = map
            .range(scan_from..end)
            .filter(|&(&k, span)| k + span.len > start)
            .map(|(&k, &span)| (k, span))
            .collect();
        let region_start = overlapping
            .first()
            .map(|&(k, _)| k.min(start))
            .unwrap_or(start);
        let region_end = overlapping
            .last()
            .map(|&(k, span)| (k + span.len).max(end))
            .unwrap_or(end);
        for &(k, _) in &overlapping {
            map.remove(&k);
        }
        // Per-unit flags over the affected region, then coalesce back into
        // spans. Regions are small (a text run, a handful of units).
        let width = (region_end - region_start) as usize;
        let mut flags: Vec<Option<bool>> = vec![None; width];
        for &(k, span) in &overlapping {
            for c in k..k + span.len {
                flags[(c - region_start) as usize] = Some(span.gc);
            }
        }
        for c in start..end {
            let f = &mut flags[(c - region_start) as usize];
            *f = Some(f.unwrap_or(false) | gc);
        }
        let mut c = region_start;
        while c < region_end {
            match flags[(c - region_start) as usize] {
                None => c += 1,
                Some(flag) => {
                    let mut e = c + 1;
                    while e < region_end
                        && flags[(e - region_start) as usize] == Some(flag)
                    {
                        e += 1;
                    }
                    map.insert(c, DeleteSpan { len: e - c, gc: flag });
                    c = e;
                }
            }
        }
        // coalesce across the region boundary with untouched neighbors
        if let Some((&k, &span)) = map.range(..region_start).next_back() {
            if k + span.len == region_start {
                if let Some(&first) = map.get(&region_start) {
                    if first.gc == span.gc {
                        map.remove(&region_start);
                        map.insert(k, DeleteSpan { len: span.len + first.len, gc: span.gc });
                    }
                }
            }
        }
        if let Some(&next) = map.get(&region_end) {
            if let Some((&k, &span)) = map.range(..region_end).next_back() {
                if k + span.len == region_end && span.gc == next.gc {
                    map.remove(&region_end);
                    map.insert(k, DeleteSpan { len: span.len + next.len, gc: span.gc });
                }
            }
        }
    }
}

/// Owns every piece of replica state. Exactly one transaction at a time
/// holds a mutable borrow of it.
pub struct DocStore {
    pub(crate) client: ClientId,
    pub(crate) op_clock: Clock,
    pub(crate) ops: BTreeMap<OpId, Operation>,
    /// Next expected clock per client.
    pub(crate) state: HashMap<ClientId, Clock>,
    pub(crate) ds: DeleteStore,
    pub(crate) scheduler: DependencyScheduler,
    /// Two-stage reclamation queue.
    pub(crate) gc1: Vec<OpId>,
    pub(crate) gc2: Vec<OpId>,
    pub(crate) connected: bool,
    pub(crate) synced: bool,
    /// Locally created operations awaiting the flush transaction.
    pub(crate) outbox: Vec<Operation>,
    pub(crate) observers: HashMap<OpId, Vec<Observer>>,
    pub(crate) send_hook: Option<SendHook>,
}

impl DocStore {
    pub fn new(client: ClientId) -> Result<Self> {
        if client == ROOT_CLIENT {
            return Err(WeftError::ReservedClient);
        }
        Ok(DocStore {
            client,
            op_clock: 0,
            ops: BTreeMap::new(),
            state: HashMap::new(),
            ds: DeleteStore::default(),
            scheduler: DependencyScheduler::new(),
            gc1: Vec::new(),
            gc2: Vec::new(),
            connected: true,
            synced: false,
            outbox: Vec::new(),
            observers: HashMap::new(),
            send_hook: None,
        })
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Exact-id lookup.
    pub fn get(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(&id)
    }

    /// Resolves the record whose id span covers `id`, which may start
    /// earlier than `id` when `id` addresses a mid-run offset.
    pub fn find_covering(&self, id: OpId) -> Option<&Operation> {
        let (_, op) = self
            .ops
            .range(OpId::new(id.client, 0)..=id)
            .next_back()?;
        op.contains(id).then_some(op)
    }

    pub fn find_covering_id(&self, id: OpId) -> Option<OpId> {
        self.find_covering(id).map(|op| op.id())
    }

    /// Next expected clock for `client` (0 if nothing seen yet).
    pub fn get_state(&self, client: ClientId) -> Clock {
        self.state.get(&client).copied().unwrap_or(0)
    }
}

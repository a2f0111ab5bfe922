//! Transactions: every read and write of the document store goes through
//! one of these, and at most one exists at a time.
//!
//! The transaction owns the splitting machinery ("clean start/end": split an
//! existing run so a given offset becomes the first/last unit of a record),
//! deletion, run merging, the `try_execute` entry point that makes delivery
//! idempotent, and the local mutation builders used by typed wrappers.

use serde_json::Value;
use tracing::{debug, error};

use crate::algorithm::{placement, reclaim};
use crate::error::{Result, WeftError};
use crate::op::{
    Clock, Delete, Insert, InsertContent, ListContainer, MapContainer, OpId,
    Operation, XmlContainer,
};
use crate::store::{DocStore, Observer};

pub struct Transaction<'a> {
    pub(crate) store: &'a mut DocStore,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a mut DocStore) -> Self {
        Transaction { store }
    }

    pub fn store(&self) -> &DocStore {
        self.store
    }

    /// Exact-id lookup.
    pub fn get_operation(&self, id: OpId) -> Option<&Operation> {
        self.store.get(id)
    }

    /// Resolves the record covering `id` (which may be a mid-run offset).
    pub fn get_insertion(&self, id: OpId) -> Option<&Operation> {
        self.store.find_covering(id)
    }

    pub fn set_operation(&mut self, op: Operation) {
        self.store.ops.insert(op.id(), op);
    }

    pub fn is_deleted(&self, id: OpId) -> bool {
        self.store.ds.is_deleted(id)
    }

    /// Mints an id range for `count` new content units.
    pub fn next_op_id(&mut self, count: u64) -> Result<OpId> {
        if count == 0 {
            return Err(WeftError::EmptyIdRange);
        }
        let id = OpId::new(self.store.client, self.store.op_clock);
        self.store.op_clock += count;
        Ok(id)
    }

    /// Advances `client`'s state over every contiguously known record.
    pub fn update_state(&mut self, client: u64) {
        let mut clock = self.store.get_state(client);
        while let Some(op) = self.store.find_covering(OpId::new(client, clock)) {
            clock = op.id().clock + op.len();
        }
        self.store.state.insert(client, clock);
    }

    // ---- splitting -------------------------------------------------------

    /// Ensures a record starts exactly at `id`, splitting the covering run
    /// if needed. Returns the id of that record (always `id`).
    pub fn get_insertion_clean_start(&mut self, id: OpId) -> Result<OpId> {
        let cover = self
            .store
            .find_covering_id(id)
            .ok_or(WeftError::MissingRecord(id))?;
        if cover.clock != id.clock {
            self.split_insertion(cover, id.clock)?;
        }
        Ok(id)
    }

    /// Ensures a record ends exactly at `id` (inclusive), splitting the
    /// covering run if needed. Returns the id of that record.
    pub fn get_insertion_clean_end(&mut self, id: OpId) -> Result<OpId> {
        let cover = self
            .store
            .find_covering_id(id)
            .ok_or(WeftError::MissingRecord(id))?;
        let last = self
            .store
            .get(cover)
            .ok_or(WeftError::MissingRecord(cover))?
            .last_id();
        if last.clock != id.clock {
            self.split_insertion(cover, id.clock + 1)?;
        }
        Ok(cover)
    }

    /// Splits the run at `record_id` so its tail starting at clock `at`
    /// becomes a record of its own. The right piece anchors on the last unit
    /// of the left piece, so a later re-merge is lossless.
    fn split_insertion(&mut self, record_id: OpId, at: Clock) -> Result<()> {
        let Some(Operation::Insert(mut left)) = self.store.ops.remove(&record_id)
        else {
            return Err(WeftError::Corrupt(format!(
                "cannot split non-insertion {record_id:?}"
            )));
        };
        let offset = at - left.id.clock;
        let right_content = match &mut left.content {
            InsertContent::Values(v) => {
                InsertContent::Values(v.split_off(offset as usize))
            }
            InsertContent::Reclaimed(n) => {
                let rest = *n - offset;
                *n = offset;
                InsertContent::Reclaimed(rest)
            }
            InsertContent::Type(_) => {
                self.store.ops.insert(record_id, Operation::Insert(left));
                return Err(WeftError::Corrupt(format!(
                    "cannot split single-unit record {record_id:?}"
                )));
            }
        };
        let boundary = OpId::new(record_id.client, at - 1);
        let right = Insert {
            id: OpId::new(record_id.client, at),
            left: Some(boundary),
            right: left.right,
            origin: Some(boundary),
            parent: left.parent,
            parent_sub: left.parent_sub.clone(),
            content: right_content,
            deleted: left.deleted,
            gc: left.gc,
        };
        left.right = Some(right.id);
        // a queued run keeps its queue entry for the left piece; the tail
        // must be requeued or it would never be reclaimed
        if right.gc {
            self.store.gc1.push(right.id);
        }
        let right_id = right.id;
        self.store.ops.insert(record_id, Operation::Insert(left));
        self.store.ops.insert(right_id, Operation::Insert(right));
        Ok(())
    }

    // ---- execution -------------------------------------------------------

    /// Applies one operation whose dependencies are all resolvable. Safe
    /// under redelivery: already-known spans are trimmed away, fully known
    /// or reclaimed operations are discarded.
    pub fn try_execute(&mut self, op: Operation) -> Result<()> {
        let mut op = match op {
            Operation::Delete(d) => {
                debug!(target = ?d.target, length = d.length, "apply delete");
                return self.delete_operation(d.target, d.length.max(1), false);
            }
            other => other,
        };
        // trim the already-known prefix when a local record covers part of
        // the incoming run with more content (remote merged further ahead)
        loop {
            let (def_id, def_len, def_last, def_is_values) =
                match self.store.find_covering(op.id()) {
                    None => break,
                    Some(Operation::Insert(d)) => (
                        d.id,
                        d.len(),
                        d.last_id(),
                        matches!(d.content, InsertContent::Values(_)),
                    ),
                    Some(_) => return Ok(()),
                };
            let trims = match &op {
                Operation::Insert(i) => {
                    matches!(i.content, InsertContent::Values(_))
                        && def_is_values
                        && def_id.clock + def_len < i.id.clock + i.len()
                }
                _ => false,
            };
            if !trims {
                // fully covered: duplicate delivery
                return Ok(());
            }
            if let Operation::Insert(i) = &mut op {
                if let InsertContent::Values(v) = &mut i.content {
                    let overlap = (def_len - (i.id.clock - def_id.clock)) as usize;
                    v.drain(..overlap);
                    i.id = OpId::new(i.id.client, def_id.clock + def_len);
                    i.left = Some(def_last);
                    i.origin = Some(def_last);
                }
            }
        }
        let opid = op.id();
        if self.store.ds.is_garbage_collected(opid) {
            debug!(id = ?opid, "discarding operation targeting reclaimed range");
            return Ok(());
        }
        match op {
            Operation::Insert(mut ins) => {
                placement::integrate(self, &mut ins)?;
                let stored = Operation::Insert(ins);
                self.set_operation(stored.clone());
                self.operation_added(&stored)?;
            }
            container => {
                self.set_operation(container.clone());
                self.operation_added(&container)?;
            }
        }
        // the record may have been split or deleted meanwhile; refetch
        if let Some(current) = self.store.find_covering_id(opid) {
            self.try_combine_with_left(current)?;
        }
        Ok(())
    }

    /// Remote delivery entry point: filters own echoes, parks operations
    /// with unresolved dependencies, and drains everything that is ready.
    pub fn apply_remote(&mut self, ops: Vec<Operation>) -> Result<()> {
        for op in ops {
            let own = !matches!(op, Operation::Delete(_))
                && op.id().client == self.store.client;
            if own {
                continue;
            }
            let required = op.required_ops();
            let missing: Vec<OpId> = required
                .iter()
                .copied()
                .filter(|id| self.store.find_covering(*id).is_none())
                .collect();
            if missing.is_empty() {
                self.store.scheduler.enqueue_ready(op);
            } else {
                self.store.scheduler.defer(op, &missing);
            }
        }
        self.drain_ready()
    }

    /// Executes every operation whose dependencies became satisfied,
    /// including ones that become ready during the drain.
    pub fn drain_ready(&mut self) -> Result<()> {
        while let Some(op) = self.store.scheduler.take_ready() {
            self.try_execute(op)?;
        }
        Ok(())
    }

    /// Applies a locally created operation and queues it for the send hook.
    pub fn execute_local(&mut self, op: Operation) -> Result<()> {
        match op {
            Operation::Delete(d) => {
                self.delete_operation(d.target, d.length.max(1), false)?;
                self.store.outbox.push(Operation::Delete(d));
                Ok(())
            }
            Operation::Insert(mut ins) => {
                placement::integrate(self, &mut ins)?;
                let stored = Operation::Insert(ins);
                self.set_operation(stored.clone());
                self.store.outbox.push(stored.clone());
                self.operation_added(&stored)?;
                if let Some(current) = self.store.find_covering_id(stored.id()) {
                    self.try_combine_with_left(current)?;
                }
                Ok(())
            }
            container => {
                self.set_operation(container.clone());
                self.store.outbox.push(container.clone());
                self.operation_added(&container)
            }
        }
    }

    /// Bookkeeping after an operation was durably stored: state vector,
    /// waiter wakeup, deleted-parent propagation, observer notification, and
    /// reconciliation against deletions that ran ahead.
    pub fn operation_added(&mut self, op: &Operation) -> Result<()> {
        match op {
            Operation::Delete(_) => Ok(()),
            Operation::Insert(ins) => {
                self.update_state(ins.id.client);
                for i in 0..ins.len() {
                    self.store
                        .scheduler
                        .resolved(OpId::new(ins.id.client, ins.id.clock + i));
                }
                let parent_deleted = self.store.ds.is_deleted(ins.parent)
                    || self
                        .store
                        .get(ins.parent)
                        .is_some_and(|p| p.deleted());
                if parent_deleted {
                    self.delete_list(ins.id)?;
                    return Ok(());
                }
                self.notify(ins.parent, op);
                if !ins.deleted {
                    for i in 0..ins.len() {
                        let unit = OpId::new(ins.id.client, ins.id.clock + i);
                        if self.store.ds.is_deleted(unit) {
                            self.try_execute(Operation::Delete(Delete {
                                target: unit,
                                length: 1,
                            }))?;
                        }
                    }
                }
                Ok(())
            }
            container => {
                let id = container.id();
                self.update_state(id.client);
                self.store.scheduler.resolved(id);
                if self.store.ds.is_deleted(id) {
                    self.try_execute(Operation::Delete(Delete {
                        target: id,
                        length: 1,
                    }))?;
                }
                Ok(())
            }
        }
    }

    // ---- deletion --------------------------------------------------------

    /// Marks `[target.clock, target.clock + length)` deleted, splitting
    /// records to the exact boundaries. Unknown units are recorded in the
    /// delete store so the insertion reconciles on arrival. Idempotent.
    pub fn delete_operation(
        &mut self,
        target: OpId,
        length: u64,
        no_notify: bool,
    ) -> Result<()> {
        let end = target.clock + length;
        let mut clock = target.clock;
        while clock < end {
            let unit = OpId::new(target.client, clock);
            let Some(found) = self.store.find_covering_id(unit) else {
                // deletion running ahead of the insertion
                self.store.ds.mark_deleted(unit, 1);
                clock += 1;
                continue;
            };
            let is_insert =
                matches!(self.store.get(found), Some(Operation::Insert(_)));
            if is_insert {
                clock = self.delete_insertion_slice(unit, end, no_notify)?;
            } else {
                self.delete_container(found)?;
                clock += 1;
            }
        }
        Ok(())
    }

    /// Deletes the slice of one insertion run starting at `unit`, bounded by
    /// `end`. Returns the clock one past the deleted slice.
    fn delete_insertion_slice(
        &mut self,
        unit: OpId,
        end: Clock,
        no_notify: bool,
    ) -> Result<Clock> {
        let rec_id = self.get_insertion_clean_start(unit)?;
        let rec_len = self
            .store
            .get(rec_id)
            .ok_or(WeftError::MissingRecord(rec_id))?
            .len();
        let slice_end = (rec_id.clock + rec_len).min(end);
        let rec_id = self
            .get_insertion_clean_end(OpId::new(unit.client, slice_end - 1))?;
        let (was_deleted, rec_right, rec_parent, nested, len) =
            match self.store.get(rec_id) {
                Some(Operation::Insert(i)) => {
                    (i.deleted, i.right, i.parent, i.op_content(), i.len())
                }
                _ => return Err(WeftError::MissingRecord(rec_id)),
            };
        self.store.ds.mark_deleted(rec_id, len);
        if !was_deleted {
            if let Some(Operation::Insert(i)) = self.store.ops.get_mut(&rec_id) {
                i.deleted = true;
            }
            if !no_notify {
                let del =
                    Operation::Delete(Delete { target: rec_id, length: len });
                self.notify(rec_parent, &del);
            }
            if let Some(nested) = nested {
                self.delete_operation(nested, 1, true)?;
            }
            reclaim::add_to_garbage_collector(self, rec_id)?;
            // the right neighbor's left is now deleted, so it may have
            // become eligible as well
            if let Some(right) = rec_right {
                if let Some(rid) = self.store.find_covering_id(right) {
                    let eligible = matches!(
                        self.store.get(rid),
                        Some(Operation::Insert(r)) if r.deleted && !r.gc
                    );
                    if eligible {
                        reclaim::add_to_garbage_collector(self, rid)?;
                    }
                }
            }
        }
        Ok(slice_end)
    }

    /// Tombstones a container and transitively deletes its children.
    fn delete_container(&mut self, id: OpId) -> Result<()> {
        let (deleted, start, heads) = match self.store.get(id) {
            Some(op) if op.is_container() => {
                (op.deleted(), op.start(), op.map_entries())
            }
            _ => return Err(WeftError::MissingRecord(id)),
        };
        self.store.ds.mark_deleted(id, 1);
        if deleted {
            return Ok(());
        }
        if let Some(op) = self.store.ops.get_mut(&id) {
            op.set_deleted(true);
        }
        if let Some(start) = start {
            self.delete_list(start)?;
        }
        for head in heads {
            self.delete_list(head)?;
        }
        Ok(())
    }

    /// Walks a child chain deleting everything on it, used when the whole
    /// subtree is dead (parent tombstoned). Children go straight to the GC
    /// queue; the leftmost-anchor rule does not apply to a dead container.
    pub fn delete_list(&mut self, start: OpId) -> Result<()> {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let Some(op) = self.store.get(id) else {
                break;
            };
            match op {
                Operation::Insert(ins) => {
                    let next = ins.right;
                    let already = ins.gc;
                    let len = ins.len();
                    let nested = ins.op_content();
                    if !already {
                        if let Some(Operation::Insert(i)) =
                            self.store.ops.get_mut(&id)
                        {
                            i.deleted = true;
                            i.gc = true;
                        }
                        self.store.ds.mark_deleted(id, len);
                        if let Some(nested) = nested {
                            self.delete_list(nested)?;
                        }
                        if self.store.connected {
                            self.store.gc1.push(id);
                        }
                    }
                    cur = next;
                }
                container => {
                    let deleted = container.deleted();
                    let start = container.start();
                    let heads = container.map_entries();
                    if !deleted {
                        if let Some(op) = self.store.ops.get_mut(&id) {
                            op.set_deleted(true);
                        }
                        self.store.ds.mark_deleted(id, 1);
                        if let Some(s) = start {
                            self.delete_list(s)?;
                        }
                        for h in heads {
                            self.delete_list(h)?;
                        }
                    }
                    cur = None;
                }
            }
        }
        Ok(())
    }

    // ---- run merging -----------------------------------------------------

    /// Merges the record at `id` into its immediate left neighbor when the
    /// two form one same-author, id-adjacent, origin-anchored run with
    /// identical tombstone state. Splits always produce that shape, so
    /// split-then-remerge is lossless; anything else is left alone.
    pub fn try_combine_with_left(&mut self, id: OpId) -> Result<()> {
        let Some(Operation::Insert(op)) = self.store.get(id).cloned() else {
            return Ok(());
        };
        if op.gc {
            return Ok(());
        }
        let InsertContent::Values(values) = &op.content else {
            return Ok(());
        };
        let Some(lid) = op.left else {
            return Ok(());
        };
        if lid.client != op.id.client || op.origin != Some(lid) {
            return Ok(());
        }
        let Some(left_id) = self.store.find_covering_id(lid) else {
            return Ok(());
        };
        let Some(Operation::Insert(left)) = self.store.get(left_id) else {
            return Ok(());
        };
        let mergeable = matches!(left.content, InsertContent::Values(_))
            && left.last_id() == lid
            && left.id.clock + left.len() == op.id.clock
            && left.right == Some(op.id)
            && !left.gc
            && left.deleted == op.deleted
            && left.parent_sub == op.parent_sub;
        if !mergeable {
            return Ok(());
        }
        let values = values.clone();
        let op_right = op.right;
        self.store.ops.remove(&id);
        if let Some(Operation::Insert(left)) = self.store.ops.get_mut(&left_id) {
            if let InsertContent::Values(lv) = &mut left.content {
                lv.extend(values);
            }
            left.right = op_right;
        }
        if let Some(sub) = &op.parent_sub {
            let head = self
                .store
                .get(op.parent)
                .and_then(|p| p.map_entry(sub));
            if head == Some(id) {
                if let Some(parent) = self.store.ops.get_mut(&op.parent) {
                    parent.set_map_entry(sub, left_id);
                }
            }
        }
        Ok(())
    }

    // ---- observers & flush ----------------------------------------------

    /// Registers a change callback on a container. Anything else is
    /// reported and skipped.
    pub fn observe(&mut self, target: OpId, cb: Observer) {
        match self.store.get(target) {
            Some(op) if op.is_container() => {
                self.store.observers.entry(target).or_default().push(cb);
            }
            _ => {
                error!(?target, "observe target is not a container; callback dropped");
            }
        }
    }

    pub(crate) fn notify(&self, parent: OpId, op: &Operation) {
        let observers: Vec<Observer> = self
            .store
            .observers
            .get(&parent)
            .cloned()
            .unwrap_or_default();
        for cb in observers {
            cb(self, op);
        }
    }

    /// Drains the ready batch and hands locally created operations to the
    /// send hook, in creation order.
    pub fn flush(&mut self) -> Result<()> {
        self.drain_ready()?;
        if self.store.outbox.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.store.outbox);
        if let Some(hook) = self.store.send_hook.clone() {
            hook(&ops);
        }
        Ok(())
    }

    // ---- roots -----------------------------------------------------------

    /// Synthesizes the pre-shared root list occupying `slot` (a no-op when
    /// it already exists). Roots are never broadcast: every replica builds
    /// the same record under the reserved client.
    pub fn ensure_root_list(&mut self, slot: Clock) -> Result<OpId> {
        let id = OpId::root(slot);
        if self.store.get(id).is_none() {
            let op = Operation::List(ListContainer {
                id,
                type_name: "List".into(),
                start: None,
                end: None,
                deleted: false,
            });
            self.set_operation(op.clone());
            self.operation_added(&op)?;
        }
        Ok(id)
    }

    pub fn ensure_root_map(&mut self, slot: Clock) -> Result<OpId> {
        let id = OpId::root(slot);
        if self.store.get(id).is_none() {
            let op = Operation::Map(MapContainer {
                id,
                type_name: "Map".into(),
                map: Default::default(),
                deleted: false,
            });
            self.set_operation(op.clone());
            self.operation_added(&op)?;
        }
        Ok(id)
    }

    pub fn ensure_root_xml(&mut self, slot: Clock, node_name: &str) -> Result<OpId> {
        let id = OpId::root(slot);
        if self.store.get(id).is_none() {
            let op = Operation::Xml(XmlContainer {
                id,
                type_name: "Xml".into(),
                node_name: node_name.to_owned(),
                start: None,
                end: None,
                map: Default::default(),
                deleted: false,
            });
            self.set_operation(op.clone());
            self.operation_added(&op)?;
        }
        Ok(id)
    }

    // ---- local builders --------------------------------------------------

    /// Creates a nested container inside a list at `pos`. Returns
    /// `(container id, insertion id)`.
    pub fn insert_container_at(
        &mut self,
        parent: OpId,
        pos: u64,
        container: fn(OpId) -> Operation,
    ) -> Result<(OpId, OpId)> {
        let (left, right) = self.list_anchor(parent, pos)?;
        let container_id = self.next_op_id(1)?;
        self.execute_local(container(container_id))?;
        let id = self.next_op_id(1)?;
        let op = Insert {
            id,
            left,
            right,
            origin: left,
            parent,
            parent_sub: None,
            content: InsertContent::Type(container_id),
            deleted: false,
            gc: false,
        };
        self.execute_local(Operation::Insert(op))?;
        Ok((container_id, id))
    }

    /// Inserts `values` at position `pos` (counted in live content units).
    pub fn insert_at(
        &mut self,
        parent: OpId,
        pos: u64,
        values: Vec<Value>,
    ) -> Result<OpId> {
        if values.is_empty() {
            return Err(WeftError::EmptyIdRange);
        }
        let (left, right) = self.list_anchor(parent, pos)?;
        let id = self.next_op_id(values.len() as u64)?;
        let op = Insert {
            id,
            left,
            right,
            origin: left,
            parent,
            parent_sub: None,
            content: InsertContent::Values(values),
            deleted: false,
            gc: false,
        };
        self.execute_local(Operation::Insert(op))?;
        Ok(id)
    }

    /// Deletes `length` live units starting at position `pos`. Contiguous
    /// unit ids collapse into a single deletion each.
    pub fn delete_at(&mut self, parent: OpId, pos: u64, length: u64) -> Result<()> {
        let parent_op = self
            .store
            .get(parent)
            .ok_or(WeftError::MissingRecord(parent))?;
        let mut cur = parent_op.start();
        let mut skip = pos;
        let mut need = length;
        let mut units: Vec<OpId> = Vec::new();
        while need > 0 {
            let Some(rid) = cur else { break };
            let Some(Operation::Insert(rec)) = self.store.get(rid) else {
                return Err(WeftError::Corrupt(format!(
                    "list chain reaches non-insertion {rid:?}"
                )));
            };
            if !rec.deleted {
                for i in 0..rec.len() {
                    if skip > 0 {
                        skip -= 1;
                    } else if need > 0 {
                        units.push(OpId::new(rid.client, rid.clock + i));
                        need -= 1;
                    }
                }
            }
            cur = rec.right;
        }
        if need > 0 {
            return Err(WeftError::OutOfBounds(pos + length));
        }
        let mut runs: Vec<(OpId, u64)> = Vec::new();
        for unit in units {
            if let Some(last) = runs.last_mut() {
                if last.0.client == unit.client
                    && last.0.clock + last.1 == unit.clock
                {
                    last.1 += 1;
                    continue;
                }
            }
            runs.push((unit, 1));
        }
        for (target, len) in runs {
            self.execute_local(Operation::Delete(Delete { target, length: len }))?;
        }
        Ok(())
    }

    /// Assigns `value` under `key`. Concurrent assignments to the same key
    /// resolve through the placement algorithm; the displaced head is
    /// tombstoned during integration.
    pub fn map_set(&mut self, parent: OpId, key: &str, value: Value) -> Result<OpId> {
        let head = self
            .store
            .get(parent)
            .ok_or(WeftError::MissingRecord(parent))?
            .map_entry(key);
        let id = self.next_op_id(1)?;
        let op = Insert {
            id,
            left: None,
            right: head,
            origin: None,
            parent,
            parent_sub: Some(key.to_owned()),
            content: InsertContent::Values(vec![value]),
            deleted: false,
            gc: false,
        };
        self.execute_local(Operation::Insert(op))?;
        Ok(id)
    }

    /// Removes the live value under `key`, if any.
    pub fn map_delete(&mut self, parent: OpId, key: &str) -> Result<()> {
        let head = self
            .store
            .get(parent)
            .ok_or(WeftError::MissingRecord(parent))?
            .map_entry(key);
        let Some(head) = head else { return Ok(()) };
        let live = match self.store.get(head) {
            Some(Operation::Insert(rec)) if !rec.deleted => Some(rec.len()),
            _ => None,
        };
        if let Some(len) = live {
            self.execute_local(Operation::Delete(Delete {
                target: head,
                length: len,
            }))?;
        }
        Ok(())
    }

    // ---- readers ---------------------------------------------------------

    /// Chain anchors for an insertion at `pos`: the unit immediately left
    /// of the position and its current chain successor.
    fn list_anchor(
        &self,
        parent: OpId,
        pos: u64,
    ) -> Result<(Option<OpId>, Option<OpId>)> {
        let parent_op = self
            .store
            .get(parent)
            .ok_or(WeftError::MissingRecord(parent))?;
        let mut cur = parent_op.start();
        if pos == 0 {
            return Ok((None, cur));
        }
        let mut remaining = pos;
        while let Some(rid) = cur {
            let Some(Operation::Insert(rec)) = self.store.get(rid) else {
                return Err(WeftError::Corrupt(format!(
                    "list chain reaches non-insertion {rid:?}"
                )));
            };
            if !rec.deleted {
                let live = rec.len();
                if remaining <= live {
                    let unit = OpId::new(rid.client, rid.clock + remaining - 1);
                    let right = if unit == rec.last_id() {
                        rec.right
                    } else {
                        Some(OpId::new(unit.client, unit.clock + 1))
                    };
                    return Ok((Some(unit), right));
                }
                remaining -= live;
            }
            cur = rec.right;
        }
        Err(WeftError::OutOfBounds(pos))
    }

    /// Unit id of the `pos`-th live content unit, if any.
    pub fn list_ref(&self, parent: OpId, pos: u64) -> Option<OpId> {
        let mut cur = self.store.get(parent)?.start();
        let mut remaining = pos;
        while let Some(rid) = cur {
            let rec = match self.store.get(rid) {
                Some(Operation::Insert(rec)) => rec,
                _ => return None,
            };
            if !rec.deleted {
                if remaining < rec.len() {
                    return Some(OpId::new(rid.client, rid.clock + remaining));
                }
                remaining -= rec.len();
            }
            cur = rec.right;
        }
        None
    }

    /// Live primitive content of a list container, in chain order. Nested
    /// containers contribute nothing here; resolve them via [`Self::list_ref`].
    pub fn list_content(&self, parent: OpId) -> Vec<Value> {
        let mut out = Vec::new();
        let Some(parent_op) = self.store.get(parent) else {
            return out;
        };
        let mut cur = parent_op.start();
        while let Some(rid) = cur {
            match self.store.get(rid) {
                Some(Operation::Insert(rec)) => {
                    if !rec.deleted {
                        if let InsertContent::Values(v) = &rec.content {
                            out.extend(v.iter().cloned());
                        }
                    }
                    cur = rec.right;
                }
                _ => break,
            }
        }
        out
    }

    /// Number of live content units in a list container.
    pub fn list_len(&self, parent: OpId) -> u64 {
        let Some(parent_op) = self.store.get(parent) else {
            return 0;
        };
        let mut n = 0;
        let mut cur = parent_op.start();
        while let Some(rid) = cur {
            match self.store.get(rid) {
                Some(Operation::Insert(rec)) => {
                    if !rec.deleted {
                        n += rec.len();
                    }
                    cur = rec.right;
                }
                _ => break,
            }
        }
        n
    }

    /// Live primitive value under `key`, if any.
    pub fn map_get(&self, parent: OpId, key: &str) -> Option<Value> {
        let head = self.store.get(parent)?.map_entry(key)?;
        match self.store.get(head)? {
            Operation::Insert(rec) if !rec.deleted => match &rec.content {
                InsertContent::Values(v) => v.first().cloned(),
                _ => None,
            },
            _ => None,
        }
    }
}

//! Two-stage reclamation of tombstoned insertions.
//!
//! Deleted records queue into `gc1`; each epoch that finds the document
//! globally synchronized reclaims everything in `gc2` and promotes `gc1`.
//! Surviving a full epoch between queueing and reclamation guarantees no
//! replica can still be unaware of the tombstone.
//!
//! Eligibility: a record queues only if it is deleted AND its left neighbor
//! is deleted too, or its run is long enough to split a head unit off. The
//! leftmost element of a container is therefore never reclaimed directly,
//! keeping an anchor for future concurrent insertions with no left.
//!
//! Reclamation drops the content but keeps a stub under the same id span, so
//! a reference to a reclaimed unit resolves to "exists, deleted" instead of
//! being indistinguishable from a missing dependency.

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::op::{Insert, InsertContent, OpId, Operation};
use crate::txn::Transaction;

/// Queues the deleted record at `id` if it is eligible. A long run is split
/// so its head unit stays behind as the anchor. Returns whether anything
/// was queued.
pub fn add_to_garbage_collector(txn: &mut Transaction<'_>, id: OpId) -> Result<bool> {
    let (deleted, gc, left, len) = match txn.get_operation(id) {
        Some(Operation::Insert(i)) => (i.deleted, i.gc, i.left, i.len()),
        _ => return Ok(false),
    };
    if gc || !deleted {
        return Ok(false);
    }
    let left_deleted = match left {
        Some(l) => txn.get_insertion(l).is_some_and(|o| o.deleted()),
        None => false,
    };
    let target = if left_deleted {
        id
    } else if len > 1 {
        txn.get_insertion_clean_start(OpId::new(id.client, id.clock + 1))?
    } else {
        return Ok(false);
    };
    if let Some(Operation::Insert(i)) = txn.store.ops.get_mut(&target) {
        i.gc = true;
    }
    if txn.store.connected {
        txn.store.gc1.push(target);
    }
    Ok(true)
}

/// Unqueues a record whose eligibility lapsed (it gained a live left
/// anchor) and clears its flag.
pub fn remove_from_garbage_collector(txn: &mut Transaction<'_>, id: OpId) {
    txn.store.gc1.retain(|&g| g != id);
    txn.store.gc2.retain(|&g| g != id);
    if let Some(Operation::Insert(i)) = txn.store.ops.get_mut(&id) {
        i.gc = false;
    }
}

/// Runs one epoch: reclaim `gc2`, promote `gc1`. Gated on global sync.
/// Returns whether the epoch did any work.
pub fn collect_epoch(txn: &mut Transaction<'_>) -> Result<bool> {
    if txn.store.gc1.is_empty() && txn.store.gc2.is_empty() {
        return Ok(false);
    }
    if !txn.store.connected {
        warn!("reclamation queues should be empty while disconnected");
    }
    if !txn.store.synced {
        return Ok(false);
    }
    let batch = std::mem::take(&mut txn.store.gc2);
    let reclaimed = batch.len();
    for id in batch {
        garbage_collect_operation(txn, id)?;
    }
    txn.store.gc2 = std::mem::take(&mut txn.store.gc1);
    debug!(reclaimed, promoted = txn.store.gc2.len(), "reclamation epoch");
    Ok(true)
}

/// Physically reclaims one queued record: marks its range in the delete
/// store, unlinks it from the chain, and replaces it with a stub.
pub fn garbage_collect_operation(txn: &mut Transaction<'_>, id: OpId) -> Result<()> {
    let rec = match txn.get_operation(id) {
        Some(Operation::Insert(i)) if i.gc => i.clone(),
        Some(Operation::Insert(_)) | None => return Ok(()), // revived or merged away
        Some(other) => {
            debug!(id = ?other.id(), "skipping non-insertion in reclamation queue");
            return Ok(());
        }
    };
    if !rec.deleted {
        error!(?id, "queued record is not tombstoned; refusing to reclaim");
        return Ok(());
    }
    if matches!(rec.content, InsertContent::Reclaimed(_)) {
        return Ok(());
    }
    txn.store.ds.mark_reclaimed(id, rec.len());
    // unlink from the chain
    if let Some(left) = rec.left {
        if let Some(left_rec) = txn.store.find_covering_id(left) {
            if let Some(Operation::Insert(l)) = txn.store.ops.get_mut(&left_rec) {
                if l.right == Some(id) {
                    l.right = rec.right;
                }
            }
        }
    }
    if let Some(right) = rec.right {
        if let Some(right_rec) = txn.store.find_covering_id(right) {
            if let Some(Operation::Insert(r)) = txn.store.ops.get_mut(&right_rec) {
                if r.left == Some(rec.last_id()) {
                    r.left = rec.left;
                }
            }
        }
    }
    // container pointers, for chains deleted wholesale
    let (start, end) = match txn.get_operation(rec.parent) {
        Some(p) => (p.start(), p.end()),
        None => (None, None),
    };
    if start == Some(id) || end == Some(rec.last_id()) {
        if let Some(parent) = txn.store.ops.get_mut(&rec.parent) {
            if start == Some(id) {
                parent.set_start(rec.right);
            }
            if end == Some(rec.last_id()) {
                parent.set_end(rec.left);
            }
        }
    }
    let len = rec.len();
    txn.set_operation(Operation::Insert(Insert {
        id,
        left: None,
        right: None,
        origin: None,
        parent: rec.parent,
        parent_sub: rec.parent_sub,
        content: InsertContent::Reclaimed(len),
        deleted: true,
        gc: true,
    }));
    debug!(?id, len, "reclaimed");
    Ok(())
}

/// Empties both queues and clears every queued record's flag. Used when a
/// replica goes offline and can no longer establish reclamation safety.
pub fn stop_garbage_collector(txn: &mut Transaction<'_>) -> Result<()> {
    let mut ungc = std::mem::take(&mut txn.store.gc1);
    ungc.extend(std::mem::take(&mut txn.store.gc2));
    for id in ungc {
        if let Some(Operation::Insert(i)) = txn.store.ops.get_mut(&id) {
            i.gc = false;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Delete;
    use crate::store::DocStore;
    use serde_json::{json, Value};

    const ROOT: OpId = OpId { client: 0, clock: 0 };

    fn replica(client: u64) -> DocStore {
        let mut store = DocStore::new(client).unwrap();
        let mut txn = Transaction::new(&mut store);
        txn.ensure_root_list(0).unwrap();
        store
    }

    #[test]
    fn single_deleted_unit_with_live_left_is_not_queued() {
        let mut store = replica(1);
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("a")]).unwrap();
        txn.insert_at(ROOT, 1, vec![json!("b")]).unwrap();
        txn.delete_at(ROOT, 1, 1).unwrap();
        assert!(txn.store.gc1.is_empty());
        assert!(!txn.get_operation(OpId::new(1, 1)).unwrap().as_insert().unwrap().gc);
    }

    #[test]
    fn deleting_the_left_neighbor_makes_the_right_eligible() {
        let mut store = replica(1);
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("a")]).unwrap();
        txn.insert_at(ROOT, 1, vec![json!("b")]).unwrap();
        txn.delete_at(ROOT, 1, 1).unwrap();
        assert!(txn.store.gc1.is_empty());
        // deleting "a" re-checks "b": both become eligible, but "a" itself
        // is the leftmost anchor and stays unqueued
        txn.delete_at(ROOT, 0, 1).unwrap();
        assert_eq!(txn.store.gc1, vec![OpId::new(1, 1)]);
        assert!(!txn.get_operation(OpId::new(1, 0)).unwrap().as_insert().unwrap().gc);
    }

    #[test]
    fn long_run_splits_off_its_anchor_unit() {
        let mut store = replica(1);
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("x"), json!("y"), json!("z")]).unwrap();
        txn.delete_at(ROOT, 0, 3).unwrap();
        // head unit stays, tail is queued
        assert_eq!(txn.store.gc1, vec![OpId::new(1, 1)]);
        let head = txn.get_operation(OpId::new(1, 0)).unwrap().as_insert().unwrap();
        assert!(head.deleted && !head.gc);
        assert_eq!(head.len(), 1);
    }

    #[test]
    fn epochs_are_gated_on_sync() {
        let mut store = replica(1);
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("x"), json!("y")]).unwrap();
        txn.delete_at(ROOT, 0, 2).unwrap();
        assert_eq!(txn.store.gc1.len(), 1);
        assert!(!collect_epoch(&mut txn).unwrap());
        assert_eq!(txn.store.gc1.len(), 1);
        txn.store.synced = true;
        // first epoch only promotes
        assert!(collect_epoch(&mut txn).unwrap());
        assert!(txn.store.gc1.is_empty());
        assert_eq!(txn.store.gc2, vec![OpId::new(1, 1)]);
        assert!(matches!(
            txn.get_operation(OpId::new(1, 1)).unwrap().as_insert().unwrap().content,
            InsertContent::Values(_)
        ));
        // second epoch reclaims
        assert!(collect_epoch(&mut txn).unwrap());
        let stub = txn.get_operation(OpId::new(1, 1)).unwrap().as_insert().unwrap();
        assert_eq!(stub.content, InsertContent::Reclaimed(1));
        assert!(stub.deleted);
        assert!(txn.store.ds.is_garbage_collected(OpId::new(1, 1)));
        // the anchor is unlinked past the stub
        let head = txn.get_operation(OpId::new(1, 0)).unwrap().as_insert().unwrap();
        assert_eq!(head.right, None);
    }

    #[test]
    fn operations_against_reclaimed_ranges_are_discarded() {
        let mut store = replica(1);
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("x"), json!("y")]).unwrap();
        txn.delete_at(ROOT, 0, 2).unwrap();
        txn.store.synced = true;
        collect_epoch(&mut txn).unwrap();
        collect_epoch(&mut txn).unwrap();
        // a redelivered delete against the reclaimed unit is a no-op
        txn.try_execute(Operation::Delete(Delete {
            target: OpId::new(1, 1),
            length: 1,
        }))
        .unwrap();
        assert_eq!(txn.list_content(ROOT), Vec::<Value>::new());
    }

    #[test]
    fn arriving_anchor_revives_a_queued_tombstone() {
        // an insertion whose right neighbor is queued must unqueue it
        let mut a = replica(1);
        let mut b = replica(2);
        let base = {
            let mut txn = Transaction::new(&mut a);
            txn.insert_at(ROOT, 0, vec![json!("a"), json!("b")]).unwrap();
            std::mem::take(&mut txn.store.outbox)
        };
        {
            let mut txn = Transaction::new(&mut b);
            txn.apply_remote(base).unwrap();
        }
        // B inserts between "a" and "b" while A concurrently deletes both
        let from_b = {
            let mut txn = Transaction::new(&mut b);
            txn.insert_at(ROOT, 1, vec![json!("c")]).unwrap();
            std::mem::take(&mut txn.store.outbox)
        };
        let mut txn = Transaction::new(&mut a);
        txn.delete_at(ROOT, 0, 2).unwrap();
        assert_eq!(txn.store.gc1, vec![OpId::new(1, 1)]);
        txn.apply_remote(from_b).unwrap();
        // "c" lands left of the queued unit, which regains a live left
        // anchor and must survive
        assert_eq!(txn.list_content(ROOT), vec![json!("c")]);
        assert!(txn.store.gc1.is_empty());
        assert!(!txn.get_operation(OpId::new(1, 1)).unwrap().as_insert().unwrap().gc);
    }

    #[test]
    fn mid_run_anchor_splits_instead_of_reclaiming() {
        let mut a = replica(1);
        let mut b = replica(2);
        let base = {
            let mut txn = Transaction::new(&mut a);
            txn.insert_at(ROOT, 0, vec![json!("x"), json!("y"), json!("z")]).unwrap();
            std::mem::take(&mut txn.store.outbox)
        };
        {
            let mut txn = Transaction::new(&mut b);
            txn.apply_remote(base).unwrap();
        }
        // B anchors a new insertion on the middle unit
        let from_b = {
            let mut txn = Transaction::new(&mut b);
            txn.insert_at(ROOT, 2, vec![json!("!")]).unwrap();
            std::mem::take(&mut txn.store.outbox)
        };
        let mut txn = Transaction::new(&mut a);
        txn.delete_at(ROOT, 0, 3).unwrap();
        txn.store.synced = true;
        collect_epoch(&mut txn).unwrap(); // promote only
        txn.apply_remote(from_b).unwrap();
        assert_eq!(txn.list_content(ROOT), vec![json!("!")]);
        collect_epoch(&mut txn).unwrap();
        collect_epoch(&mut txn).unwrap();
        // everything tombstoned is reclaimable except the leftmost anchor,
        // and the new insertion still resolves
        assert_eq!(txn.list_content(ROOT), vec![json!("!")]);
        let head = txn.get_operation(OpId::new(1, 0)).unwrap().as_insert().unwrap();
        assert!(head.deleted && !head.gc);
        assert!(txn.get_operation(OpId::new(2, 0)).is_some());
    }

    #[test]
    fn stop_clears_queues_and_flags() {
        let mut store = replica(1);
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("x"), json!("y")]).unwrap();
        txn.delete_at(ROOT, 0, 2).unwrap();
        assert!(!txn.store.gc1.is_empty());
        stop_garbage_collector(&mut txn).unwrap();
        assert!(txn.store.gc1.is_empty() && txn.store.gc2.is_empty());
        assert!(!txn.get_operation(OpId::new(1, 1)).unwrap().as_insert().unwrap().gc);
    }

    #[test]
    fn disconnected_replicas_queue_nothing() {
        let mut store = replica(1);
        store.connected = false;
        let mut txn = Transaction::new(&mut store);
        txn.insert_at(ROOT, 0, vec![json!("x"), json!("y")]).unwrap();
        txn.delete_at(ROOT, 0, 2).unwrap();
        assert!(txn.store.gc1.is_empty());
    }
}

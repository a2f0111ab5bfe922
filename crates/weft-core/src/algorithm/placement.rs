//! Insertion placement: positions a new insertion between concurrent ones so
//! every replica produces the same final order.
//!
//! The algorithm is of the YATA/RGA family. Each insertion anchors on its
//! `origin` (the left neighbor at creation time, immutable). At execution
//! time the distance from the current `left` back to the origin is
//! recomputed by walking the live chain, and the scan below resolves runs of
//! concurrent insertions sharing the same causal depth by client id. Given
//! the same set of delivered operations both replicas see the same chain, so
//! they compute the same comparisons.

use smallvec::SmallVec;

use crate::error::{Result, WeftError};
use crate::op::{Insert, OpId, Operation};
use crate::txn::Transaction;

use super::reclaim;

/// Left-hops from `left` back to the record covering `origin` along the
/// current chain. Zero when there is no left anchor.
pub fn distance_to_origin(
    txn: &Transaction<'_>,
    left: Option<OpId>,
    origin: Option<OpId>,
) -> Result<u64> {
    let Some(start) = left else {
        return Ok(0);
    };
    let mut d = 0u64;
    let mut o = txn
        .get_insertion(start)
        .ok_or(WeftError::MissingRecord(start))?;
    loop {
        if origin.is_some_and(|og| o.contains(og)) {
            break;
        }
        d += 1;
        let Some(next) = o.as_insert().and_then(|i| i.left) else {
            break;
        };
        o = txn
            .get_insertion(next)
            .ok_or(WeftError::MissingRecord(next))?;
    }
    Ok(d)
}

/// Splices `op` into its parent's chain at the deterministic position,
/// rewires neighbor and container pointers, applies the keyed-container
/// head rules, and re-merges records split along the way.
///
/// The conflict scan distinguishes three cases against each candidate `o`
/// between `op.left` and `op.right`:
/// 1. equal origin distance: a true concurrent conflict, broken by client
///    id; the larger client moves right past the smaller one.
/// 2. `o` is closer to the origin than `op`: `op` moves past `o` only while
///    it has not yet drifted further than `o`'s own depth.
/// 3. `o` is further from the origin: `op` belongs before `o`, forever.
pub fn integrate(txn: &mut Transaction<'_>, op: &mut Insert) -> Result<()> {
    // records split while placing; candidates for re-merging afterwards
    let mut remerge: SmallVec<[OpId; 4]> = SmallVec::new();

    if let Some(origin) = op.origin {
        let origin_rec = txn.get_insertion_clean_end(origin)?;
        if let Some(r) = txn
            .get_operation(origin_rec)
            .and_then(|o| o.as_insert())
            .and_then(|o| o.right)
        {
            remerge.push(r);
        }
    }

    let mut dist = distance_to_origin(txn, op.left, op.origin)?;
    let mut i = dist;

    // the scan cursor: first record right of op.left, or the chain head
    let mut cursor: Option<OpId>;
    if let Some(left) = op.left {
        let left_rec = txn.get_insertion_clean_end(left)?;
        let left_right = txn
            .get_operation(left_rec)
            .and_then(|o| o.as_insert())
            .and_then(|o| o.right);
        if op.left != op.origin {
            if let Some(r) = left_right {
                remerge.push(r);
            }
        }
        cursor = match left_right {
            Some(r) => Some(
                txn.store
                    .find_covering_id(r)
                    .ok_or(WeftError::MissingRecord(r))?,
            ),
            None => None,
        };
    } else {
        let parent = txn
            .get_operation(op.parent)
            .ok_or(WeftError::MissingRecord(op.parent))?;
        cursor = match &op.parent_sub {
            Some(sub) => parent.map_entry(sub),
            None => parent.start(),
        };
    }

    // make sure op.right starts a record of its own
    if let Some(right) = op.right {
        remerge.push(right);
        txn.get_insertion_clean_start(right)?;
    }

    while let Some(o_id) = cursor {
        if Some(o_id) == op.right {
            break;
        }
        let (o_left, o_origin, o_right, o_last) = match txn.get_operation(o_id) {
            Some(Operation::Insert(o)) => (o.left, o.origin, o.right, o.last_id()),
            _ => {
                return Err(WeftError::Corrupt(format!(
                    "chain cursor {o_id:?} is not an insertion"
                )))
            }
        };
        let od = distance_to_origin(txn, o_left, o_origin)?;
        if od == i {
            // case 1
            if o_id.client < op.id.client {
                op.left = Some(o_last);
                dist = i + 1;
            }
        } else if od < i {
            // case 2
            if i - dist <= od {
                op.left = Some(o_last);
                dist = i + 1;
            }
        } else {
            // case 3
            break;
        }
        i += 1;
        cursor = match o_right {
            Some(r) => Some(
                txn.store
                    .find_covering_id(r)
                    .ok_or(WeftError::MissingRecord(r))?,
            ),
            None => None,
        };
    }

    // splice: wire left and derive op.right
    if let Some(left) = op.left {
        let left_rec = txn
            .store
            .find_covering_id(left)
            .ok_or(WeftError::MissingRecord(left))?;
        match txn.store.ops.get_mut(&left_rec) {
            Some(Operation::Insert(l)) => {
                op.right = l.right;
                l.right = Some(op.id);
            }
            _ => return Err(WeftError::MissingRecord(left_rec)),
        }
    } else {
        let parent = txn
            .get_operation(op.parent)
            .ok_or(WeftError::MissingRecord(op.parent))?;
        op.right = match &op.parent_sub {
            Some(sub) => parent.map_entry(sub),
            None => parent.start(),
        };
    }

    // wire right
    if let Some(right) = op.right {
        let right_rec = txn
            .store
            .find_covering_id(right)
            .ok_or(WeftError::MissingRecord(right))?;
        let (right_gc, right_len) = match txn.store.ops.get_mut(&right_rec) {
            Some(Operation::Insert(r)) => {
                r.left = Some(op.last_id());
                (r.gc, r.len())
            }
            Some(other) => {
                return Err(WeftError::Corrupt(format!(
                    "right neighbor {:?} is not an insertion",
                    other.id()
                )))
            }
            None => return Err(WeftError::MissingRecord(right_rec)),
        };
        // a queued tombstone gaining a live left anchor must not be
        // reclaimed: shrink it to one unit and unqueue that unit
        if right_gc {
            if right_len > 1 {
                txn.get_insertion_clean_end(right_rec)?;
            }
            reclaim::remove_from_garbage_collector(txn, right_rec);
        }
    }

    // container pointers
    if let Some(sub) = op.parent_sub.clone() {
        if op.left.is_none() {
            if let Some(parent) = txn.store.ops.get_mut(&op.parent) {
                parent.set_map_entry(&sub, op.id);
            }
        }
        // a map key exposes at most one live value: the current head.
        // Displacement tombstones are internal and never notify observers.
        if let Some(right) = op.right {
            txn.delete_operation(right, 1, true)?;
        }
        if op.left.is_some() {
            // op landed right of the head; it is dead on arrival (recorded
            // through the delete store, the record is not stored yet)
            txn.delete_operation(op.id, 1, true)?;
        }
    } else {
        if op.right.is_none() || op.left.is_none() {
            if let Some(parent) = txn.store.ops.get_mut(&op.parent) {
                if op.right.is_none() {
                    parent.set_end(Some(op.last_id()));
                }
                if op.left.is_none() {
                    parent.set_start(Some(op.id));
                }
            }
        }
    }

    for m in remerge {
        if txn.get_operation(m).is_some() {
            txn.try_combine_with_left(m)?;
        }
    }
    Ok(())
}

//! Operation model: identifiers and the five structure kinds.
//!
//! An operation doubles as a structure record: insertions and container
//! operations are stored in the operation arena and mutated in place as
//! concurrent edits arrive, while deletions are transient instructions that
//! only flip tombstone flags on stored insertions.
//!
//! All references between records are [`OpId`]s resolved through the store,
//! never native pointers, so the doubly linked chains can be rewired freely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

/// Identifies the replica that created an operation.
pub type ClientId = u64;
/// Per-client monotonically increasing counter.
pub type Clock = u64;

/// Client id reserved for pre-shared root containers. Every replica
/// synthesizes identical root records under this client, so roots need no
/// handshake. It is never a valid replica identity.
pub const ROOT_CLIENT: ClientId = 0;

/// Unique operation identifier: `(client, clock)`.
///
/// Ordering compares client first, then clock, which makes a `BTreeMap`
/// keyed by `OpId` cluster each client's clock range contiguously.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpId {
    pub client: ClientId,
    pub clock: Clock,
}

impl OpId {
    pub fn new(client: ClientId, clock: Clock) -> Self {
        OpId { client, clock }
    }

    /// Id of a pre-shared root container occupying the given slot.
    pub fn root(slot: Clock) -> Self {
        OpId { client: ROOT_CLIENT, clock: slot }
    }
}

/// What an insertion carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertContent {
    /// Ordered run of atomic values. A run longer than one unit is always
    /// same-author, contiguous ids.
    Values(Vec<Value>),
    /// A nested container operation; always exactly one unit.
    Type(OpId),
    /// Stub left behind after physical reclamation: the id span survives so
    /// references resolve to "exists, deleted", the values do not.
    Reclaimed(u64),
}

impl InsertContent {
    pub fn len(&self) -> u64 {
        match self {
            InsertContent::Values(v) => v.len() as u64,
            InsertContent::Type(_) => 1,
            InsertContent::Reclaimed(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transient deletion instruction. Never stored in the arena; it marks the
/// range `[target.clock, target.clock + length)` deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub target: OpId,
    #[serde(default)]
    pub length: u64,
}

/// Insertion: one run of content linked into its parent's child chain.
///
/// `left`/`right` are the current neighbors and are rewired as concurrent
/// insertions arrive; `origin` is the neighbor at creation time and never
/// changes, it is the causal anchor of conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub id: OpId,
    pub left: Option<OpId>,
    pub right: Option<OpId>,
    pub origin: Option<OpId>,
    pub parent: OpId,
    /// Set when the parent is a keyed (map-like) container: the key this
    /// value occupies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_sub: Option<String>,
    pub content: InsertContent,
    #[serde(default)]
    pub deleted: bool,
    /// Queued for physical reclamation.
    #[serde(default)]
    pub gc: bool,
}

impl Insert {
    pub fn len(&self) -> u64 {
        self.content.len()
    }

    /// Id of the last content unit of this run.
    pub fn last_id(&self) -> OpId {
        OpId::new(self.id.client, self.id.clock + self.len().saturating_sub(1))
    }

    /// Whether `id` addresses a unit inside this run.
    pub fn contains(&self, id: OpId) -> bool {
        id.client == self.id.client
            && id.clock >= self.id.clock
            && id.clock < self.id.clock + self.len()
    }

    /// Nested container id, if this insertion carries one.
    pub fn op_content(&self) -> Option<OpId> {
        match self.content {
            InsertContent::Type(id) => Some(id),
            _ => None,
        }
    }
}

/// Sequence container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListContainer {
    pub id: OpId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<OpId>,
    #[serde(default)]
    pub deleted: bool,
}

/// Keyed container: latest-writer-wins per key, where "latest" is decided by
/// the same placement algorithm as list insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapContainer {
    pub id: OpId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub map: HashMap<String, OpId>,
    #[serde(default)]
    pub deleted: bool,
}

/// List and Map fused, plus a node name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XmlContainer {
    pub id: OpId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<OpId>,
    #[serde(default)]
    pub map: HashMap<String, OpId>,
    #[serde(default)]
    pub deleted: bool,
}

/// The closed set of operation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "struct")]
pub enum Operation {
    Delete(Delete),
    Insert(Insert),
    List(ListContainer),
    Map(MapContainer),
    Xml(XmlContainer),
}

impl Operation {
    /// Identity of the first unit. Deletions have no identity of their own;
    /// they report their target.
    pub fn id(&self) -> OpId {
        match self {
            Operation::Delete(d) => d.target,
            Operation::Insert(i) => i.id,
            Operation::List(l) => l.id,
            Operation::Map(m) => m.id,
            Operation::Xml(x) => x.id,
        }
    }

    /// Number of logical content units this operation occupies.
    pub fn len(&self) -> u64 {
        match self {
            Operation::Insert(i) => i.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> OpId {
        let id = self.id();
        OpId::new(id.client, id.clock + self.len().saturating_sub(1))
    }

    /// Whether `id` addresses a unit inside this operation's id span.
    pub fn contains(&self, id: OpId) -> bool {
        let own = self.id();
        id.client == own.client
            && id.clock >= own.clock
            && id.clock < own.clock + self.len()
    }

    /// Every id that must be locally resolvable before this operation can
    /// execute.
    ///
    /// Deliberately empty for deletions: a deletion is allowed to run ahead
    /// of the insertion it targets (the delete store reconciles on arrival),
    /// which avoids deadlock when deletes race inserts. Container creation
    /// has no prerequisites either.
    pub fn required_ops(&self) -> SmallVec<[OpId; 5]> {
        let mut ids = SmallVec::new();
        if let Operation::Insert(op) = self {
            if let Some(left) = op.left {
                ids.push(left);
            }
            if let Some(right) = op.right {
                ids.push(right);
            }
            if let Some(origin) = op.origin {
                if op.left != Some(origin) {
                    ids.push(origin);
                }
            }
            ids.push(op.parent);
            if let Some(nested) = op.op_content() {
                ids.push(nested);
            }
        }
        ids
    }

    pub fn deleted(&self) -> bool {
        match self {
            Operation::Delete(_) => false,
            Operation::Insert(i) => i.deleted,
            Operation::List(l) => l.deleted,
            Operation::Map(m) => m.deleted,
            Operation::Xml(x) => x.deleted,
        }
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        match self {
            Operation::Delete(_) => {}
            Operation::Insert(i) => i.deleted = deleted,
            Operation::List(l) => l.deleted = deleted,
            Operation::Map(m) => m.deleted = deleted,
            Operation::Xml(x) => x.deleted = deleted,
        }
    }

    /// Head of the child chain, for containers that have one.
    pub fn start(&self) -> Option<OpId> {
        match self {
            Operation::List(l) => l.start,
            Operation::Xml(x) => x.start,
            _ => None,
        }
    }

    pub fn set_start(&mut self, start: Option<OpId>) {
        match self {
            Operation::List(l) => l.start = start,
            Operation::Xml(x) => x.start = start,
            _ => {}
        }
    }

    pub fn end(&self) -> Option<OpId> {
        match self {
            Operation::List(l) => l.end,
            Operation::Xml(x) => x.end,
            _ => None,
        }
    }

    pub fn set_end(&mut self, end: Option<OpId>) {
        match self {
            Operation::List(l) => l.end = end,
            Operation::Xml(x) => x.end = end,
            _ => {}
        }
    }

    /// Current head for a map key, for containers that keep one.
    pub fn map_entry(&self, key: &str) -> Option<OpId> {
        match self {
            Operation::Map(m) => m.map.get(key).copied(),
            Operation::Xml(x) => x.map.get(key).copied(),
            _ => None,
        }
    }

    pub fn set_map_entry(&mut self, key: &str, id: OpId) {
        match self {
            Operation::Map(m) => {
                m.map.insert(key.to_owned(), id);
            }
            Operation::Xml(x) => {
                x.map.insert(key.to_owned(), id);
            }
            _ => {}
        }
    }

    /// All current map-key heads, for containers that keep them.
    pub fn map_entries(&self) -> Vec<OpId> {
        match self {
            Operation::Map(m) => m.map.values().copied().collect(),
            Operation::Xml(x) => x.map.values().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Operation::List(_) | Operation::Map(_) | Operation::Xml(_)
        )
    }

    pub fn as_insert(&self) -> Option<&Insert> {
        match self {
            Operation::Insert(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_insert_mut(&mut self) -> Option<&mut Insert> {
        match self {
            Operation::Insert(i) => Some(i),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(id: OpId, values: Vec<Value>) -> Insert {
        Insert {
            id,
            left: None,
            right: None,
            origin: None,
            parent: OpId::root(0),
            parent_sub: None,
            content: InsertContent::Values(values),
            deleted: false,
            gc: false,
        }
    }

    #[test]
    fn run_span_helpers() {
        let op = insert(OpId::new(3, 10), vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(op.len(), 3);
        assert_eq!(op.last_id(), OpId::new(3, 12));
        assert!(op.contains(OpId::new(3, 11)));
        assert!(!op.contains(OpId::new(3, 13)));
        assert!(!op.contains(OpId::new(4, 11)));
    }

    #[test]
    fn required_ops_skips_origin_equal_to_left() {
        let anchor = OpId::new(2, 5);
        let mut op = insert(OpId::new(3, 0), vec![json!(1)]);
        op.left = Some(anchor);
        op.origin = Some(anchor);
        let req = Operation::Insert(op).required_ops();
        // left and parent only
        assert_eq!(req.as_slice(), &[anchor, OpId::root(0)]);
    }

    #[test]
    fn required_ops_lists_origin_when_distinct() {
        let mut op = insert(OpId::new(3, 0), vec![json!(1)]);
        op.left = Some(OpId::new(2, 5));
        op.right = Some(OpId::new(4, 1));
        op.origin = Some(OpId::new(2, 2));
        let req = Operation::Insert(op).required_ops();
        assert_eq!(
            req.as_slice(),
            &[OpId::new(2, 5), OpId::new(4, 1), OpId::new(2, 2), OpId::root(0)]
        );
    }

    #[test]
    fn deletes_and_containers_have_no_prerequisites() {
        let del = Operation::Delete(Delete { target: OpId::new(1, 0), length: 4 });
        assert!(del.required_ops().is_empty());
        let list = Operation::List(ListContainer {
            id: OpId::root(0),
            type_name: "Array".into(),
            start: None,
            end: None,
            deleted: false,
        });
        assert!(list.required_ops().is_empty());
    }

    #[test]
    fn ordering_clusters_by_client_then_clock() {
        let mut ids = vec![OpId::new(2, 0), OpId::new(1, 9), OpId::new(1, 1)];
        ids.sort();
        assert_eq!(ids, vec![OpId::new(1, 1), OpId::new(1, 9), OpId::new(2, 0)]);
    }
}

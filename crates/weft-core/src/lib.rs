//! weft-core: operation log and merge engine for conflict-free replicated
//! documents.
//!
//! Replicas independently create operations against a shared logical
//! document (sequences, keyed maps, XML-like trees) and exchange them in any
//! order, with duplication and reordering; all replicas converge to the same
//! state without coordination. The crate covers:
//!
//! - **op / codec**: the five operation kinds, their dependency lists, and
//!   the self-describing binary wire format.
//! - **algorithm::placement**: deterministic placement of concurrent
//!   insertions into one total order (origin anchors + client-id
//!   tie-breaks).
//! - **scheduler**: defers operations until their causal prerequisites are
//!   locally resolvable.
//! - **algorithm::reclaim**: two-stage reclamation of tombstones, gated on
//!   global synchronization.
//! - **doc**: the serialized transaction gateway wrapping it all.

pub mod algorithm;
pub mod codec;
pub mod doc;
pub mod error;
pub mod op;
pub mod scheduler;
pub mod store;
pub mod txn;

pub use crate::doc::{Doc, DocOptions, WorkUnit};
pub use crate::error::{Result, WeftError};
pub use crate::op::{
    ClientId, Clock, Delete, Insert, InsertContent, ListContainer, MapContainer,
    OpId, Operation, XmlContainer, ROOT_CLIENT,
};
pub use crate::store::{DocStore, Observer, SendHook};
pub use crate::txn::Transaction;

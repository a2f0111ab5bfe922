//! The two correctness-critical algorithms: insertion placement and
//! tombstone reclamation.

pub mod placement;
pub mod reclaim;

//! Snapshot rebuild pipelines.
//!
//! Each pipeline run is an independently schedulable unit dispatched from
//! the rebuild queue. Mutual exclusion is per resource: one shard rebuild
//! per shard id at a time, one index rebuild at a time, both enforced by
//! KeyDB locks. Upload always happens before commit, and snapshot keys are
//! generation-addressed, so any run interrupted between the two is safe to
//! repeat.

pub mod index;
pub mod shard;

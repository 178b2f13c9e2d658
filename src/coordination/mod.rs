//! Distributed coordination layer backed by KeyDB (Redis-compatible).
//!
//! Provides the rebuild locks, the rebuild job queue with its durable
//! pending markers, and worker heartbeat registration. All state is stored
//! in KeyDB so that rebuild workers on different hosts can coordinate
//! without shared filesystems.

pub mod lock;
pub mod node;
pub mod queue;
pub mod redis;

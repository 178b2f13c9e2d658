//! Object storage layer.
//!
//! Uploads shard and index snapshots to S3-compatible storage under
//! immutable, generation-addressed keys, and derives the public URLs that
//! registry clients download them from.

pub mod s3;

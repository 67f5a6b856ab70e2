//! Workspace tree
//!
//! Path canonicalization, content and snapshot hashing, the cancellable walk
//! that produces descriptor and path indices, and the read-only projection
//! handed to subscribers.

pub mod hasher;
pub mod path;
pub mod projection;
pub mod walker;

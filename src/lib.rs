//! Skein: workspace snapshots, AI context preparation and streamed conversations
//!
//! Two engines share one process. The workspace engine owns an immutable,
//! content-hashed snapshot of a watched directory tree together with the
//! user's selection and context-inclusion preferences. The conversation engine
//! turns that snapshot into budgeted context segments, streams replies from an
//! AI transport and persists each committed exchange.

pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod fs;
pub mod logging;
pub mod provider;
pub mod tree;
pub mod types;
pub mod workspace;

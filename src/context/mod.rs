//! AI context: budget application, segmentation and preparation from a
//! workspace snapshot.

pub mod budget;
pub mod preparer;
pub mod segment;

pub use budget::{
    estimate_tokens, ContextBudget, ContextBuildResult, ContextBuilder, ExclusionReason,
    LoadedFile,
};
pub use preparer::ContextPreparer;
pub use segment::{encode_segments, ContextSegment, SegmentLimits};

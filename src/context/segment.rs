//! Greedy whole-file segmentation

use crate::context::budget::LoadedFile;
use crate::tree::path::lexicographic_order;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

/// Per-segment limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLimits {
    pub max_bytes: usize,
    pub max_tokens: usize,
}

/// A group of whole files sent together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSegment {
    pub files: Vec<PathBuf>,
    pub total_bytes: usize,
    pub total_tokens: usize,
    pub encoded: String,
}

/// Pack files into segments in lexicographic path order.
///
/// A file is never split. A file that alone exceeds the limits gets a segment
/// of its own.
pub fn encode_segments(files: &[LoadedFile], limits: &SegmentLimits) -> Vec<ContextSegment> {
    let mut ordered: Vec<&LoadedFile> = files.iter().collect();
    ordered.sort_by(|a, b| lexicographic_order(&a.path, &b.path));

    let mut segments = Vec::new();
    let mut current: Vec<&LoadedFile> = Vec::new();
    let mut bytes = 0usize;
    let mut tokens = 0usize;

    for file in ordered {
        let overflows = bytes + file.byte_count > limits.max_bytes
            || tokens + file.token_count > limits.max_tokens;
        if overflows && !current.is_empty() {
            segments.push(seal(std::mem::take(&mut current)));
            bytes = 0;
            tokens = 0;
        }
        bytes += file.byte_count;
        tokens += file.token_count;
        current.push(file);
    }
    if !current.is_empty() {
        segments.push(seal(current));
    }
    segments
}

fn seal(files: Vec<&LoadedFile>) -> ContextSegment {
    let mut encoded = String::new();
    for (index, file) in files.iter().enumerate() {
        if index > 0 {
            encoded.push('\n');
        }
        render_file(&mut encoded, file);
    }
    ContextSegment {
        files: files.iter().map(|f| f.path.clone()).collect(),
        total_bytes: files.iter().map(|f| f.byte_count).sum(),
        total_tokens: files.iter().map(|f| f.token_count).sum(),
        encoded,
    }
}

fn render_file(out: &mut String, file: &LoadedFile) {
    let _ = write!(out, "### {}", file.path.display());
    if let Some(reason) = file.truncation {
        let _ = write!(out, " (truncated: {})", reason);
    }
    let fence = if file.content.contains("```") { "````" } else { "```" };
    let _ = write!(
        out,
        "\n{}{}\n{}",
        fence,
        file.language.as_deref().unwrap_or(""),
        file.content
    );
    if !file.content.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(fence);
    out.push('\n');
}

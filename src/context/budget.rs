//! Context budget application
//!
//! [`ContextBuilder::build`] partitions loaded files into attached, truncated
//! and excluded sets. Files are visited in lexicographic path order; per-file
//! limits truncate, total limits exclude the offending file and everything
//! after it.

use crate::context::segment::{encode_segments, ContextSegment, SegmentLimits};
use crate::tree::path::lexicographic_order;
use crate::types::{language_for_path, FileId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Approximate bytes per token used when no count is supplied
pub const BYTES_PER_TOKEN: usize = 4;

/// `ceil(bytes / 4)`
pub fn estimate_tokens(bytes: usize) -> usize {
    bytes.div_ceil(BYTES_PER_TOKEN)
}

/// Byte and token limits for one AI request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    #[serde(default = "default_max_per_file_bytes")]
    pub max_per_file_bytes: usize,
    #[serde(default = "default_max_per_file_tokens")]
    pub max_per_file_tokens: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    #[serde(default = "default_max_total_tokens")]
    pub max_total_tokens: usize,
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: usize,
    #[serde(default = "default_max_segment_tokens")]
    pub max_segment_tokens: usize,
}

fn default_max_per_file_bytes() -> usize {
    64 * 1024
}

fn default_max_per_file_tokens() -> usize {
    16_000
}

fn default_max_total_bytes() -> usize {
    512 * 1024
}

fn default_max_total_tokens() -> usize {
    128_000
}

fn default_max_segment_bytes() -> usize {
    64 * 1024
}

fn default_max_segment_tokens() -> usize {
    16_000
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_per_file_bytes: default_max_per_file_bytes(),
            max_per_file_tokens: default_max_per_file_tokens(),
            max_total_bytes: default_max_total_bytes(),
            max_total_tokens: default_max_total_tokens(),
            max_segment_bytes: default_max_segment_bytes(),
            max_segment_tokens: default_max_segment_tokens(),
        }
    }
}

impl ContextBudget {
    pub fn segment_limits(&self) -> SegmentLimits {
        SegmentLimits {
            max_bytes: self.max_segment_bytes,
            max_tokens: self.max_segment_tokens,
        }
    }

    /// Check that every limit is non-zero
    pub fn validate(&self) -> Result<(), String> {
        let limits = [
            ("max_per_file_bytes", self.max_per_file_bytes),
            ("max_per_file_tokens", self.max_per_file_tokens),
            ("max_total_bytes", self.max_total_bytes),
            ("max_total_tokens", self.max_total_tokens),
            ("max_segment_bytes", self.max_segment_bytes),
            ("max_segment_tokens", self.max_segment_tokens),
        ];
        match limits.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(format!("context.{} must be greater than 0", name)),
            None => Ok(()),
        }
    }
}

/// Why a file was truncated or left out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExclusionReason {
    ExceedsPerFileBytes,
    ExceedsPerFileTokens,
    ExceedsTotalBytes,
    ExceedsTotalTokens,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExclusionReason::ExceedsPerFileBytes => "exceeds per-file byte limit",
            ExclusionReason::ExceedsPerFileTokens => "exceeds per-file token limit",
            ExclusionReason::ExceedsTotalBytes => "exceeds total byte limit",
            ExclusionReason::ExceedsTotalTokens => "exceeds total token limit",
        };
        f.write_str(text)
    }
}

/// File content ready for budgeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub descriptor_id: Option<FileId>,
    pub content: String,
    pub byte_count: usize,
    pub token_count: usize,
    pub language: Option<String>,
    /// Set when the content was cut down to a per-file limit
    pub truncation: Option<ExclusionReason>,
}

impl LoadedFile {
    /// Token count is estimated from the byte length
    pub fn new(path: PathBuf, content: String) -> Self {
        let byte_count = content.len();
        let language = language_for_path(&path).map(str::to_string);
        Self {
            path,
            descriptor_id: None,
            content,
            byte_count,
            token_count: estimate_tokens(byte_count),
            language,
            truncation: None,
        }
    }

    pub fn with_descriptor(mut self, id: FileId) -> Self {
        self.descriptor_id = Some(id);
        self
    }

    pub fn with_token_count(mut self, token_count: usize) -> Self {
        self.token_count = token_count;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        if language.is_some() {
            self.language = language;
        }
        self
    }

    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }

    /// Cut content to at most `max_bytes` on a char boundary. The token count
    /// shrinks in proportion to the bytes kept.
    fn truncate_to(&mut self, max_bytes: usize, reason: ExclusionReason) {
        if self.byte_count <= max_bytes {
            return;
        }
        let mut cut = max_bytes.min(self.content.len());
        while !self.content.is_char_boundary(cut) {
            cut -= 1;
        }
        self.content.truncate(cut);
        let previous_bytes = self.byte_count.max(1);
        self.token_count = (self.token_count * cut).div_ceil(previous_bytes);
        self.byte_count = cut;
        self.truncation = Some(reason);
    }
}

/// Outcome of applying a budget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextBuildResult {
    pub attachments: Vec<LoadedFile>,
    pub truncated_files: Vec<LoadedFile>,
    pub excluded_files: Vec<(LoadedFile, ExclusionReason)>,
    pub total_bytes: usize,
    pub total_tokens: usize,
    pub encoded_segments: Vec<ContextSegment>,
}

impl ContextBuildResult {
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn attachment_paths(&self) -> Vec<PathBuf> {
        self.attachments.iter().map(|f| f.path.clone()).collect()
    }
}

/// Stateless budget application
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn build(mut files: Vec<LoadedFile>, budget: &ContextBudget) -> ContextBuildResult {
        files.sort_by(|a, b| lexicographic_order(&a.path, &b.path));

        let mut result = ContextBuildResult::default();
        let mut stopped: Option<ExclusionReason> = None;

        for file in files {
            if let Some(reason) = stopped {
                result.excluded_files.push((file, reason));
                continue;
            }

            let limited = apply_per_file_limits(file.clone(), budget);
            if result.total_bytes + limited.byte_count > budget.max_total_bytes {
                stopped = Some(ExclusionReason::ExceedsTotalBytes);
            } else if result.total_tokens + limited.token_count > budget.max_total_tokens {
                stopped = Some(ExclusionReason::ExceedsTotalTokens);
            }
            if let Some(reason) = stopped {
                debug!(path = %file.path.display(), %reason, "Context budget exhausted");
                result.excluded_files.push((file, reason));
                continue;
            }

            result.total_bytes += limited.byte_count;
            result.total_tokens += limited.token_count;
            if limited.is_truncated() {
                result.truncated_files.push(limited.clone());
            }
            result.attachments.push(limited);
        }

        result.encoded_segments = encode_segments(&result.attachments, &budget.segment_limits());
        debug!(
            attached = result.attachments.len(),
            truncated = result.truncated_files.len(),
            excluded = result.excluded_files.len(),
            total_bytes = result.total_bytes,
            total_tokens = result.total_tokens,
            segments = result.encoded_segments.len(),
            "Built context"
        );
        result
    }
}

fn apply_per_file_limits(mut file: LoadedFile, budget: &ContextBudget) -> LoadedFile {
    if file.byte_count > budget.max_per_file_bytes {
        file.truncate_to(budget.max_per_file_bytes, ExclusionReason::ExceedsPerFileBytes);
    }
    if file.token_count > budget.max_per_file_tokens {
        let keep = file.byte_count * budget.max_per_file_tokens / file.token_count;
        file.truncate_to(keep, ExclusionReason::ExceedsPerFileTokens);
        file.token_count = file.token_count.min(budget.max_per_file_tokens);
    }
    file
}

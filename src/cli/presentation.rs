//! CLI presentation: text, table and json formatters.

use crate::context::ContextBuildResult;
use crate::conversation::Conversation;
use crate::error::EngineError;
use crate::tree::projection::{TreeNode, TreeProjection};
use crate::types::FileKind;
use crate::workspace::{UpdateNotice, WorkspaceSnapshot, WorkspaceUpdate};
use comfy_table::Table;
use serde_json::json;
use std::path::Path;

pub fn format_tree_text(projection: &TreeProjection, show_inclusion: bool) -> String {
    let Some(root) = &projection.root else {
        return "No workspace is open.".to_string();
    };
    let mut lines = Vec::new();
    push_node(root, 0, show_inclusion, &mut lines);
    lines.join("\n")
}

fn push_node(node: &TreeNode, depth: usize, show_inclusion: bool, lines: &mut Vec<String>) {
    let suffix = if node.kind == FileKind::Directory { "/" } else { "" };
    let mut line = format!("{}{}{}", "  ".repeat(depth), node.name, suffix);
    if show_inclusion {
        line.push_str(&format!("  [{}]", node.inclusion.as_str()));
    }
    lines.push(line);
    for child in &node.children {
        push_node(child, depth + 1, show_inclusion, lines);
    }
}

fn display_relative(path: &Path, root: Option<&Path>) -> String {
    root.and_then(|root| path.strip_prefix(root).ok())
        .unwrap_or(path)
        .display()
        .to_string()
}

pub fn format_context_text(result: &ContextBuildResult, root: Option<&Path>) -> String {
    if result.is_empty() && result.excluded_files.is_empty() {
        return "No context files resolved.".to_string();
    }

    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Path", "Bytes", "Tokens", "Status"]);
    for file in &result.attachments {
        let status = match file.truncation {
            Some(reason) => format!("truncated ({})", reason),
            None => "attached".to_string(),
        };
        table.add_row(vec![
            display_relative(&file.path, root),
            file.byte_count.to_string(),
            file.token_count.to_string(),
            status,
        ]);
    }
    for (file, reason) in &result.excluded_files {
        table.add_row(vec![
            display_relative(&file.path, root),
            file.byte_count.to_string(),
            file.token_count.to_string(),
            format!("excluded ({})", reason),
        ]);
    }

    format!(
        "{}\nTotal: {} bytes, {} tokens in {} segment(s)",
        table,
        result.total_bytes,
        result.total_tokens,
        result.encoded_segments.len()
    )
}

pub fn format_context_json(result: &ContextBuildResult) -> Result<String, EngineError> {
    let attachments: Vec<_> = result
        .attachments
        .iter()
        .map(|f| {
            json!({
                "path": f.path,
                "bytes": f.byte_count,
                "tokens": f.token_count,
                "truncated": f.truncation.map(|r| r.to_string()),
            })
        })
        .collect();
    let excluded: Vec<_> = result
        .excluded_files
        .iter()
        .map(|(f, reason)| json!({ "path": f.path, "reason": reason.to_string() }))
        .collect();
    let out = json!({
        "attachments": attachments,
        "excluded": excluded,
        "total_bytes": result.total_bytes,
        "total_tokens": result.total_tokens,
        "segments": result.encoded_segments.len(),
    });
    serde_json::to_string_pretty(&out).map_err(|e| EngineError::ConfigError(e.to_string()))
}

pub fn format_snapshot_summary(snapshot: &WorkspaceSnapshot) -> String {
    let hash = snapshot.snapshot_hash.get(..12).unwrap_or(&snapshot.snapshot_hash);
    let selected = snapshot
        .selected_path
        .as_deref()
        .map(|p| display_relative(p, snapshot.root_path.as_deref()))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} entries, hash {}, selected {}",
        snapshot.descriptors.len(),
        hash,
        selected
    )
}

pub fn format_update_line(update: &WorkspaceUpdate) -> String {
    match &update.notice {
        None => format!("update: {}", format_snapshot_summary(&update.snapshot)),
        Some(UpdateNotice::RefreshFailed(reason)) => format!("refresh failed: {}", reason),
        Some(UpdateNotice::WatcherUnavailable) => "watcher stopped".to_string(),
    }
}

pub fn format_conversations_table(conversations: &[std::sync::Arc<Conversation>]) -> String {
    if conversations.is_empty() {
        return "No conversations.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Id", "Title", "Messages", "Updated"]);
    for conversation in conversations {
        table.add_row(vec![
            conversation.id.to_string(),
            conversation.title.clone(),
            conversation.message_count().to_string(),
            conversation.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table.to_string()
}

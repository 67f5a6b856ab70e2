//! CLI domain: parse, route, output, and presentation only.
//! No domain orchestration; single route table dispatches to the engines.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{
    format_context_json, format_context_text, format_conversations_table,
    format_snapshot_summary, format_tree_text, format_update_line,
};
pub use route::RunContext;

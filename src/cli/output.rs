//! CLI output: error mapping from engine errors to the CLI surface.

use crate::error::EngineError;

/// Map engine errors to a single line for the terminal
pub fn map_error(e: &EngineError) -> String {
    match e {
        EngineError::StreamingTransport(inner) => format!("AI request failed: {}", inner),
        other => other.to_string(),
    }
}

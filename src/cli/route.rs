//! CLI route: single route table and run context. Dispatches to the engines and presentation.

use crate::cli::parse::Commands;
use crate::cli::presentation::{
    format_context_json, format_context_text, format_conversations_table,
    format_snapshot_summary, format_tree_text, format_update_line,
};
use crate::config::SkeinConfig;
use crate::context::ContextPreparer;
use crate::conversation::{
    ContextRequest, ConversationEngine, ConversationKey, SendOutcome, SledConversationStore,
    StreamCallback, StreamDelta,
};
use crate::error::EngineError;
use crate::provider::OpenAiCompatibleClient;
use crate::workspace::{WorkspaceCollaborators, WorkspaceEngine};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runtime context for CLI execution: workspace root and loaded configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: SkeinConfig,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config: SkeinConfig) -> Self {
        Self {
            workspace_root,
            config,
        }
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, EngineError> {
        let workspace = self.open_workspace().await?;
        let result = match command {
            Commands::Tree { inclusion } => {
                Ok(format_tree_text(&workspace.tree_projection(), *inclusion))
            }
            Commands::Context { path, format } => {
                self.handle_context(&workspace, path.as_deref(), format).await
            }
            Commands::Watch => self.handle_watch(&workspace).await,
            Commands::Chat { message, path } => {
                self.handle_chat(&workspace, message, path.as_deref()).await
            }
            Commands::Conversations => self.handle_conversations().await,
        };
        workspace.shutdown();
        result
    }

    async fn open_workspace(&self) -> Result<WorkspaceEngine, EngineError> {
        let collaborators = WorkspaceCollaborators::local(self.config.watch.clone())?;
        let engine = WorkspaceEngine::new(collaborators);
        let snapshot = engine.open_workspace(&self.workspace_root).await?;
        info!(summary = %format_snapshot_summary(&snapshot), "Workspace opened");
        Ok(engine)
    }

    fn conversation_engine(&self) -> Result<ConversationEngine, EngineError> {
        let store_path = self
            .config
            .conversations
            .resolved_store_path()
            .map_err(EngineError::persistence)?;
        let store = SledConversationStore::new(store_path).map_err(EngineError::persistence)?;
        let transport = OpenAiCompatibleClient::new(&self.config.transport)?;
        Ok(ConversationEngine::new(
            Arc::new(store),
            Arc::new(transport),
            ContextPreparer::local(),
            self.config.conversations.cache_capacity,
        ))
    }

    async fn handle_context(
        &self,
        workspace: &WorkspaceEngine,
        path: Option<&Path>,
        format: &str,
    ) -> Result<String, EngineError> {
        let snapshot = match path {
            Some(path) => workspace.select(Some(path)).await?,
            None => workspace.current_snapshot(),
        };
        let result = ContextPreparer::local()
            .prepare(&snapshot, None, &self.config.context)
            .await?;
        if format == "json" {
            format_context_json(&result)
        } else {
            Ok(format_context_text(&result, snapshot.root_path.as_deref()))
        }
    }

    async fn handle_watch(&self, workspace: &WorkspaceEngine) -> Result<String, EngineError> {
        let mut updates = workspace.subscribe();
        println!("watching: {}", format_snapshot_summary(&workspace.current_snapshot()));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                update = updates.recv() => match update {
                    Some(update) => println!("{}", format_update_line(&update)),
                    None => break,
                },
            }
        }
        Ok("Stopped watching.".to_string())
    }

    async fn handle_chat(
        &self,
        workspace: &WorkspaceEngine,
        message: &str,
        path: Option<&Path>,
    ) -> Result<String, EngineError> {
        let snapshot = match path {
            Some(path) => workspace.select(Some(path)).await?,
            None => workspace.current_snapshot(),
        };
        let focus = snapshot
            .selected_path
            .clone()
            .or_else(|| snapshot.root_path.clone())
            .ok_or(EngineError::WorkspaceNotOpened)?;

        let engine = self.conversation_engine()?;
        engine.hydrate().await?;
        let conversation = engine.ensure_conversation(&ConversationKey::Path(focus), None)?;

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        let printed = Mutex::new(0usize);
        let print_delta = |delta: StreamDelta| match delta {
            StreamDelta::Context {
                attachments,
                total_tokens,
                ..
            } => {
                eprintln!("[{} file(s), ~{} tokens attached]", attachments.len(), total_tokens);
            }
            StreamDelta::Text { aggregate } => {
                let mut printed = printed.lock();
                let fresh = aggregate.get(*printed..).unwrap_or(aggregate.as_str());
                print!("{}", fresh);
                if let Err(e) = std::io::stdout().flush() {
                    warn!(error = %e, "Failed to flush stdout");
                }
                *printed = aggregate.len();
            }
        };
        let on_stream: StreamCallback<'_> = &print_delta;

        let request = ContextRequest {
            snapshot: Some(Arc::clone(&snapshot)),
            budget: self.config.context,
            ..ContextRequest::default()
        };
        let outcome = engine
            .send_message(message, conversation.id, Some(request), Some(on_stream), &cancel)
            .await;
        ctrl_c.abort();

        match outcome? {
            SendOutcome::Completed(conversation) => Ok(format!(
                "\n\n[{}: {} message(s)]",
                conversation.title,
                conversation.message_count()
            )),
            SendOutcome::Cancelled => Ok("\n[cancelled]".to_string()),
        }
    }

    async fn handle_conversations(&self) -> Result<String, EngineError> {
        let engine = self.conversation_engine()?;
        engine.hydrate().await?;
        Ok(format_conversations_table(&engine.conversations()))
    }
}

//! Workspace domain: snapshot, state owner, engine and watch loop.

pub mod engine;
pub mod preferences;
pub mod snapshot;
pub mod state;
mod watch;

pub use engine::{WorkspaceCollaborators, WorkspaceEngine};
pub use preferences::{
    ContextPreferencesState, InclusionState, JsonPreferencesStore, PreferencesDriver,
    WorkspacePreferences,
};
pub use snapshot::{DescriptorPathResolver, Selection, WorkspaceSnapshot};
pub use state::{UpdateNotice, UpdateStream, WorkspaceStateOwner, WorkspaceUpdate};

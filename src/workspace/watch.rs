//! Watch loop: turns change events into refreshes

use crate::fs::ChangeEvent;
use crate::workspace::engine::EngineInner;
use crate::workspace::state::UpdateNotice;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run until `cancel` fires, the event source ends or the engine is dropped.
///
/// Events already queued when a refresh starts are folded into it. A failed
/// refresh republishes the last good snapshot with [`UpdateNotice::RefreshFailed`];
/// an ended source publishes [`UpdateNotice::WatcherUnavailable`].
pub(crate) async fn run_watch_loop(
    engine: Weak<EngineInner>,
    mut events: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Watch loop cancelled");
                return;
            }
            event = events.recv() => event,
        };

        let Some(event) = event else {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(engine) = engine.upgrade() {
                warn!("Watch source ended");
                engine.owner.publish_notice(UpdateNotice::WatcherUnavailable);
            }
            return;
        };

        let mut folded = 1usize;
        while events.try_recv().is_ok() {
            folded += 1;
        }
        debug!(path = %event.path().display(), folded, "Change detected");

        let Some(engine) = engine.upgrade() else {
            return;
        };
        match engine.refresh(&cancel).await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {
                debug!("Watch-triggered refresh cancelled");
            }
            Err(e) => {
                warn!(error = %e, "Watch-triggered refresh failed");
                engine
                    .owner
                    .publish_notice(UpdateNotice::RefreshFailed(e.to_string()));
            }
        }
    }
}

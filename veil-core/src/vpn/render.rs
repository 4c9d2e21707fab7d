//! State rendering capability
//!
//! Presentation layers implement `StateRenderer` and are driven by a pump
//! task over the orchestrator's broadcast. Renderers only observe; they
//! never drive transitions.

use crate::vpn::state::StateChange;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

pub trait StateRenderer: Send + 'static {
    fn render(&mut self, change: &StateChange);
}

/// Feed every transition to `renderer` until the orchestrator goes away
///
/// Returns the renderer when the stream closes.
pub fn spawn_renderer<R: StateRenderer>(
    mut events: broadcast::Receiver<StateChange>,
    mut renderer: R,
) -> JoinHandle<R> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(change) => renderer.render(&change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Renderer fell behind, transitions skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        renderer
    })
}

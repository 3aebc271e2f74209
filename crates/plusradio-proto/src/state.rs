//! Published player view.
//!
//! The playback controller is the only writer; the socket and HTTP servers
//! read snapshots.  Every publish bumps `rev`.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::protocol::PlayerView;

#[derive(Clone, Default)]
pub struct StateManager {
    state: Arc<RwLock<PlayerView>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_state(&self) -> PlayerView {
        self.state.read().await.clone()
    }

    /// Replace the view, keeping the revision monotonic.
    pub async fn publish(&self, mut view: PlayerView) {
        let mut state = self.state.write().await;
        view.rev = state.rev + 1;
        *state = view;
    }

    /// Publish the startup-failure view: no stations, fatal message set.
    pub async fn set_fatal(&self, message: impl Into<String>) {
        let mut state = self.state.write().await;
        let rev = state.rev + 1;
        *state = PlayerView {
            rev,
            fatal: Some(message.into()),
            ..PlayerView::default()
        };
    }
}

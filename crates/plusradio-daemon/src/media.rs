//! Host media facility boundary.
//!
//! The controller never talks to a decoder directly.  It issues requests
//! through [`MediaHost`] and receives [`MediaEvent`]s on its event channel.
//! Events are best-effort: they may be duplicated, reordered or missing.

use async_trait::async_trait;

/// Signals emitted by the host media facility.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Audio is flowing.
    Started,
    Paused,
    Errored(String),
    LoadStarted,
    /// Enough data to begin playback; cancels the load timeout.
    CanPlay,
    Stalled,
    TimeProgress(f64),
    /// Stream metadata arrived (e.g. an ICY title).
    MetadataReady(Option<String>),
}

/// Buffering state reported by the host, ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

impl ReadyState {
    /// A stall check fails unless buffering reached this level.
    pub const PARTIALLY_BUFFERED: ReadyState = ReadyState::HaveFutureData;

    pub fn is_buffered(self) -> bool {
        self >= Self::PARTIALLY_BUFFERED
    }
}

#[async_trait]
pub trait MediaHost: Send {
    /// Tear down the current stream and begin loading `url`.
    async fn load(&mut self, url: &str) -> anyhow::Result<()>;

    /// Start playback.  An error means the host declined to start (e.g. no
    /// user gesture yet); it is not a stream failure.
    async fn play(&mut self) -> anyhow::Result<()>;

    async fn pause(&mut self) -> anyhow::Result<()>;

    /// Drop whatever is buffered for the current source.
    async fn reset(&mut self) -> anyhow::Result<()>;

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()>;

    async fn ready_state(&mut self) -> ReadyState;

    /// Release host resources on shutdown.
    async fn shutdown(&mut self) {}
}

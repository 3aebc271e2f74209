//! plusradio daemon: the playback controller, its mpv media host and the
//! socket/HTTP surfaces that expose the published player view.

pub mod core;
pub mod http;
pub mod loader;
pub mod media;
pub mod mpv;
pub mod socket;

use plusradio_proto::protocol::Notice;

/// Fan-out messages from the controller (and the logging layer) to every
/// connected client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The published view changed; clients re-read it from the state manager.
    StateUpdated,
    Notice(Notice),
    /// Startup failed; no controller is running.
    Fatal(String),
    /// A warning or error log line.
    Log(String),
}

//! Shared types for the plusradio daemon and its clients: the playlist
//! parser, the station registry and its key-value store, configuration and
//! the wire protocol.

pub mod config;
pub mod platform;
pub mod playlist;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod store;

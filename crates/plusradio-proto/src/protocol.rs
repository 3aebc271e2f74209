use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a presentation client to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Select a station by identity (`name|url`) and start it.
    Select { id: StationId },
    Next,
    Prev,
    Random,
    TogglePause,
    Stop,
    Volume { value: f32 },
    ToggleMute,
    ToggleFavorite { id: StationId },
    /// Change the displayed listing scope (clears any search query).
    SetScope { scope: Scope },
    Search { query: String },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full view snapshot.
    Hello {
        protocol_version: u32,
        state: PlayerView,
    },
    State {
        data: PlayerView,
    },
    /// Transient user-facing notification.
    Notice {
        notice: Notice,
    },
    /// Startup failed; the controller is not running.
    Fatal {
        message: String,
    },
    Log {
        message: String,
    },
}

/// Playback status of the current selection.
///
/// Transitions:
///   Idle/Failed -> Loading (select)
///   Loading -> Playing (started) -> Paused (paused) -> Playing ...
///   any -> Failed (error, load timeout, stall timeout)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Failed,
}

/// Identity of a station: `name|url`.  Two stations with the same name and
/// url are the same station regardless of their category.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    pub fn new(name: &str, url: &str) -> Self {
        Self(format!("{}|{}", name, url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StationId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for StationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// A named audio stream endpoint.  Created only by the playlist parser and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Station {
    pub name: String,
    pub logo_url: String,
    /// Category label, declared or inferred from the name.
    pub group: String,
    pub url: String,
}

impl Station {
    pub fn id(&self) -> StationId {
        StationId::new(&self.name, &self.url)
    }

    pub fn is(&self, id: &StationId) -> bool {
        // Avoid allocating the joined id for every comparison.
        let raw = id.as_str();
        raw.len() == self.name.len() + 1 + self.url.len()
            && raw.starts_with(self.name.as_str())
            && raw[self.name.len()..].starts_with('|')
            && raw.ends_with(self.url.as_str())
    }

    /// Logo url suitable for an https page: plain-http logos are upgraded.
    pub fn display_logo_url(&self) -> String {
        match self.logo_url.strip_prefix("http://") {
            Some(rest) => format!("https://{}", rest),
            None => self.logo_url.clone(),
        }
    }
}

/// Which station listing is displayed.  Automatic failover and next/prev
/// navigation draw their candidates from the active scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", content = "name")]
pub enum Scope {
    #[default]
    All,
    Category(String),
    Favorites,
    RecentlyPlayed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl Notice {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            at: chrono::Utc::now(),
        }
    }
}

/// One row of the visible station listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationEntry {
    pub station: Station,
    pub logo_url: String,
    pub favorite: bool,
    pub recent: bool,
    /// True for the currently selected station.
    pub current: bool,
}

/// Everything the presentation layer may read.  `rev` is a monotonically
/// increasing counter bumped on every publish.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlayerView {
    #[serde(default)]
    pub rev: u64,
    pub current_station: Option<Station>,
    pub status: PlaybackStatus,
    pub is_playing: bool,
    pub is_loading: bool,
    pub volume: f32,
    pub scope: Scope,
    #[serde(default)]
    pub query: String,
    pub categories: Vec<String>,
    /// Visible listing for `scope`/`query`, broken stations already removed.
    pub stations: Vec<StationEntry>,
    /// Latest stream metadata title, if the host reported one.
    #[serde(default)]
    pub stream_title: Option<String>,
    /// Set when startup failed; distinct from an empty listing.
    #[serde(default)]
    pub fatal: Option<String>,
}

/// Largest frame body a peer may announce; anything bigger drops the peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Body length announced by the frame header, once all 4 bytes are in.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        let Some(len) = Self::frame_len(data) else {
            anyhow::bail!("Insufficient data for length header");
        };
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

//! Startup playlist loading.
//!
//! The source is either an http(s) URL or a local path.  Any failure here is
//! fatal: the parser never runs on a failed fetch and the controller is not
//! started.

use std::path::PathBuf;

use plusradio_proto::playlist::Playlist;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("playlist not found: {0}")]
    NotFound(String),
    #[error("playlist request failed with HTTP {0}")]
    Http(reqwest::StatusCode),
    #[error("playlist request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("cannot read playlist {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("media host unavailable: {0}")]
    MediaHost(String),
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Raw playlist text from `source`.
pub async fn fetch_playlist_text(source: &str) -> Result<String, StartupError> {
    if is_remote(source) {
        let response = reqwest::get(source).await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StartupError::NotFound(source.to_string()));
        }
        if !status.is_success() {
            return Err(StartupError::Http(status));
        }
        return Ok(response.text().await?);
    }

    let path = PathBuf::from(source);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StartupError::NotFound(path.display().to_string()))
        }
        Err(source) => Err(StartupError::Io { path, source }),
    }
}

/// Fetch and parse the playlist.
pub async fn load_playlist(source: &str) -> Result<Playlist, StartupError> {
    info!("Loading playlist from {}", source);
    let text = fetch_playlist_text(source).await?;
    let playlist = Playlist::parse(&text);
    info!(
        "Loaded {} stations in {} categories",
        playlist.stations().len(),
        playlist.categories().len()
    );
    Ok(playlist)
}

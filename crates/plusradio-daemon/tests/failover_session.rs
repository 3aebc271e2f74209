//! End-to-end controller sessions against a scripted media host.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plusradio_daemon::core::{ControllerEvent, PlaybackController};
use plusradio_daemon::media::{MediaEvent, MediaHost, ReadyState};
use plusradio_daemon::BroadcastMessage;
use plusradio_proto::config::PlaybackConfig;
use plusradio_proto::playlist::Playlist;
use plusradio_proto::protocol::{Command, PlaybackStatus, PlayerView, Scope, StationId};
use plusradio_proto::registry::{StationRegistry, BROKEN_KEY};
use plusradio_proto::state::StateManager;
use plusradio_proto::store::{KeyValueStore, MemoryStore};
use tokio::sync::{broadcast, mpsc};

const PLAYLIST: &str = r#"#EXTM3U
#EXTINF:-1 tvg-logo="http://logos/a.png" group-title="Jazz",Jazz A
http://a/stream
#EXTINF:-1 group-title="Jazz",Jazz B
http://b/stream
#EXTINF:-1 group-title="Jazz",Jazz C
http://c/stream
#EXTINF:-1,Rock Kanal
http://rock/stream
"#;

/// Emits the events a real host would after each load: dead urls error out,
/// the rest start playing.
struct ScriptedHost {
    tx: mpsc::Sender<ControllerEvent>,
    dead: HashSet<String>,
    loads: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MediaHost for ScriptedHost {
    async fn load(&mut self, url: &str) -> anyhow::Result<()> {
        self.loads.lock().unwrap().push(url.to_string());
        let tx = self.tx.clone();
        let dead = self.dead.contains(url);
        tokio::spawn(async move {
            let _ = tx.send(ControllerEvent::Media(MediaEvent::LoadStarted)).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let script = if dead {
                vec![MediaEvent::Errored("connection refused".into())]
            } else {
                vec![MediaEvent::CanPlay, MediaEvent::Started]
            };
            for evt in script {
                let _ = tx.send(ControllerEvent::Media(evt)).await;
            }
        });
        Ok(())
    }

    async fn play(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_volume(&mut self, _volume: f32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ready_state(&mut self) -> ReadyState {
        ReadyState::HaveEnoughData
    }
}

struct Session {
    controller: PlaybackController,
    event_tx: mpsc::Sender<ControllerEvent>,
    event_rx: mpsc::Receiver<ControllerEvent>,
    state: StateManager,
    store: MemoryStore,
    loads: Arc<Mutex<Vec<String>>>,
}

fn session(dead: &[&str], store: MemoryStore) -> Session {
    let (event_tx, event_rx) = mpsc::channel(64);
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(64);
    let loads = Arc::new(Mutex::new(Vec::new()));
    let host = ScriptedHost {
        tx: event_tx.clone(),
        dead: dead.iter().map(|s| s.to_string()).collect(),
        loads: loads.clone(),
    };
    let state = StateManager::new();
    let controller = PlaybackController::new(
        Playlist::parse(PLAYLIST),
        StationRegistry::new(Box::new(store.clone())),
        Box::new(host),
        PlaybackConfig::default(),
        state.clone(),
        broadcast_tx,
        event_tx.clone(),
    );
    Session {
        controller,
        event_tx,
        event_rx,
        state,
        store,
        loads,
    }
}

/// Poll the published view until `done` holds (virtual time).
async fn wait_for(state: &StateManager, done: impl Fn(&PlayerView) -> bool) -> PlayerView {
    for _ in 0..600 {
        let view = state.get_state().await;
        if done(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached: {:?}", state.get_state().await);
}

fn current_name(view: &PlayerView) -> Option<&str> {
    view.current_station.as_ref().map(|s| s.name.as_str())
}

#[tokio::test(start_paused = true)]
async fn test_failover_skips_stored_broken_station() {
    let store = MemoryStore::new();
    let mut seeded = store.clone();
    seeded
        .set(BROKEN_KEY, r#"["Jazz B|http://b/stream"]"#)
        .unwrap();

    let s = session(&["http://a/stream"], store);
    let tx = s.event_tx.clone();
    let state = s.state.clone();

    let driver = async move {
        tx.send(ControllerEvent::Command(Command::SetScope {
            scope: Scope::Category("Jazz".into()),
        }))
        .await
        .unwrap();
        tx.send(ControllerEvent::Command(Command::Select {
            id: StationId::new("Jazz A", "http://a/stream"),
        }))
        .await
        .unwrap();

        let view = wait_for(&state, |v| {
            current_name(v) == Some("Jazz C") && v.status == PlaybackStatus::Playing
        })
        .await;
        tx.send(ControllerEvent::Shutdown).await.unwrap();
        view
    };

    let (result, view) = tokio::join!(s.controller.run(s.event_rx), driver);
    result.unwrap();

    assert_eq!(
        *s.loads.lock().unwrap(),
        vec!["http://a/stream".to_string(), "http://c/stream".to_string()]
    );
    let names: Vec<&str> = view.stations.iter().map(|e| e.station.name.as_str()).collect();
    assert_eq!(names, vec!["Jazz C"]);
    assert!(view.stations[0].current);

    let stored = s.store.get(BROKEN_KEY).unwrap();
    let broken: Vec<String> = serde_json::from_str(&stored).unwrap();
    assert_eq!(broken, vec!["Jazz A|http://a/stream", "Jazz B|http://b/stream"]);
}

#[tokio::test(start_paused = true)]
async fn test_everything_dead_stops_with_failed_status() {
    let s = session(
        &["http://a/stream", "http://b/stream", "http://c/stream"],
        MemoryStore::new(),
    );
    let tx = s.event_tx.clone();
    let state = s.state.clone();

    let driver = async move {
        tx.send(ControllerEvent::Command(Command::SetScope {
            scope: Scope::Category("Jazz".into()),
        }))
        .await
        .unwrap();
        tx.send(ControllerEvent::Command(Command::Select {
            id: StationId::new("Jazz A", "http://a/stream"),
        }))
        .await
        .unwrap();

        let view = wait_for(&state, |v| {
            v.status == PlaybackStatus::Failed && v.stations.is_empty()
        })
        .await;
        // nothing else gets scheduled
        tokio::time::sleep(Duration::from_secs(30)).await;
        tx.send(ControllerEvent::Shutdown).await.unwrap();
        view
    };

    let (result, view) = tokio::join!(s.controller.run(s.event_rx), driver);
    result.unwrap();

    assert_eq!(view.status, PlaybackStatus::Failed);
    assert_eq!(current_name(&view), Some("Jazz C"));
    assert_eq!(s.loads.lock().unwrap().len(), 3);
    assert_eq!(view.categories, vec!["Rock".to_string(), "Jazz".to_string()]);
}

/// PlaybackController: single-owner event loop for all playback state.
///
/// Client commands, media-host events and timer expiries all arrive on one
/// `mpsc` channel as `ControllerEvent`s and are handled strictly one at a
/// time.  The controller owns the playlist, the station registry and the
/// media host; no other task touches them.
///
/// Failure detection: a load that starts but never becomes playable within
/// the load timeout, a stall that has not recovered by the stall check, or a
/// host error all mark the current station broken and schedule a failover to
/// the next working station in the active scope.  Every timer carries the
/// selection generation it was armed for and is aborted on the next
/// selection, so a late expiry can never touch a newer selection.
///
/// After every event the controller rebuilds the `PlayerView`, publishes it
/// through the `StateManager` and broadcasts `StateUpdated`.
use std::time::Duration;

use plusradio_proto::config::PlaybackConfig;
use plusradio_proto::playlist::Playlist;
use plusradio_proto::protocol::{
    Command, Notice, PlaybackStatus, PlayerView, Scope, Severity, Station, StationEntry,
    StationId,
};
use plusradio_proto::registry::{StationRegistry, RECENTLY_PLAYED_CAP};
use plusradio_proto::state::StateManager;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::media::{MediaEvent, MediaHost};
use crate::BroadcastMessage;

/// Volume restored by ToggleMute when currently muted.
const UNMUTE_VOLUME: f32 = 0.8;

// ── ControllerEvent ───────────────────────────────────────────────────────────

/// All inputs into the PlaybackController loop.
#[derive(Debug)]
pub enum ControllerEvent {
    /// A command from a socket or HTTP client.
    Command(Command),
    /// Forwarded from the media host.
    Media(MediaEvent),
    /// A controller timer expired.  `selection` is the generation it was
    /// armed for.
    TimerFired { timer: Timer, selection: u64 },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    LoadTimeout,
    StallCheck,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureCause {
    HostError,
    LoadTimeout,
    Stalled,
}

impl FailureCause {
    fn notice(self) -> &'static str {
        match self {
            FailureCause::HostError => "Stream is not working. The list was updated.",
            FailureCause::LoadTimeout | FailureCause::Stalled => {
                "Stream is loading too slowly. The list was updated."
            }
        }
    }
}

/// Status transition for a media event.  Failed is terminal until the next
/// selection and an idle controller ignores host chatter.  Only a playing
/// stream can be paused by the host; a pause echo during a load is noise.
pub fn next_status(current: PlaybackStatus, event: &MediaEvent) -> PlaybackStatus {
    use PlaybackStatus::*;
    match (current, event) {
        (Idle, _) => Idle,
        (_, MediaEvent::Errored(_)) => Failed,
        (Failed, _) => Failed,
        (_, MediaEvent::Started) => Playing,
        (Playing, MediaEvent::Paused) => Paused,
        (other, _) => other,
    }
}

// ── session and timers ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Session {
    station: Option<Station>,
    status: PlaybackStatus,
    /// Bumped on every selection and on stop.
    selection: u64,
    /// A load was requested and the host has not yet reported it playable.
    load_pending: bool,
}

#[derive(Debug, Default)]
struct Timers {
    load: Option<AbortHandle>,
    stall: Option<AbortHandle>,
    failover: Option<AbortHandle>,
}

impl Timers {
    fn slot(&mut self, timer: Timer) -> &mut Option<AbortHandle> {
        match timer {
            Timer::LoadTimeout => &mut self.load,
            Timer::StallCheck => &mut self.stall,
            Timer::Failover => &mut self.failover,
        }
    }

    fn is_armed(&self, timer: Timer) -> bool {
        match timer {
            Timer::LoadTimeout => self.load.is_some(),
            Timer::StallCheck => self.stall.is_some(),
            Timer::Failover => self.failover.is_some(),
        }
    }

    fn cancel(&mut self, timer: Timer) {
        if let Some(handle) = self.slot(timer).take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel(Timer::LoadTimeout);
        self.cancel(Timer::StallCheck);
        self.cancel(Timer::Failover);
    }
}

// ── PlaybackController ────────────────────────────────────────────────────────

pub struct PlaybackController {
    playlist: Playlist,
    registry: StationRegistry,
    host: Box<dyn MediaHost>,
    config: PlaybackConfig,
    state_manager: StateManager,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Our own event channel; timers post their expiry here.
    event_tx: mpsc::Sender<ControllerEvent>,
    session: Session,
    timers: Timers,
    /// Station the armed failover timer will select.
    pending_failover: Option<StationId>,
    /// Consecutive automatic failovers without a successful start.
    failover_streak: usize,
    scope: Scope,
    /// Recently played order as of entering that scope.  Selections only
    /// add to it, so navigation walks a stable list.
    recent_order: Vec<StationId>,
    query: String,
    volume: f32,
    stream_title: Option<String>,
}

impl PlaybackController {
    pub fn new(
        playlist: Playlist,
        registry: StationRegistry,
        host: Box<dyn MediaHost>,
        config: PlaybackConfig,
        state_manager: StateManager,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        let volume = registry
            .volume()
            .unwrap_or(config.default_volume)
            .clamp(0.0, 1.0);
        let scope = match registry.scope() {
            Some(Scope::Category(label))
                if !playlist.categories().iter().any(|c| *c == label) =>
            {
                debug!("Stored category {:?} no longer exists, using all", label);
                Scope::All
            }
            Some(scope) => scope,
            None => Scope::All,
        };
        let recent_order = registry.recently_played().to_vec();

        Self {
            playlist,
            registry,
            host,
            config,
            state_manager,
            broadcast_tx,
            event_tx,
            session: Session::default(),
            timers: Timers::default(),
            pending_failover: None,
            failover_streak: 0,
            scope,
            recent_order,
            query: String::new(),
            volume,
            stream_title: None,
        }
    }

    /// Run the event loop until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<ControllerEvent>) -> anyhow::Result<()> {
        info!(
            "PlaybackController: starting event loop ({} stations, {} categories)",
            self.playlist.stations().len(),
            self.playlist.categories().len()
        );
        if let Err(e) = self.host.set_volume(self.volume).await {
            warn!("PlaybackController: initial volume not applied: {}", e);
        }
        self.publish().await;

        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt).await {
                info!("PlaybackController: shutdown requested");
                break;
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Handle a single event.  Returns false when the loop should stop.
    pub async fn handle_event(&mut self, evt: ControllerEvent) -> bool {
        let publish = match evt {
            ControllerEvent::Shutdown => return false,
            ControllerEvent::Command(cmd) => {
                info!("PlaybackController: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("PlaybackController: command error: {}", e);
                }
                true
            }
            ControllerEvent::Media(MediaEvent::TimeProgress(_)) => false,
            ControllerEvent::Media(evt) => {
                self.handle_media(evt).await;
                true
            }
            ControllerEvent::TimerFired { timer, selection } => {
                self.handle_timer(timer, selection).await;
                true
            }
        };
        if publish {
            self.publish().await;
        }
        true
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Select { id } => match self.playlist.find(&id).cloned() {
                Some(station) => {
                    self.failover_streak = 0;
                    self.select_station(station).await;
                }
                None => {
                    warn!("Select: unknown station {}", id);
                    self.notify(Severity::Warning, "Station not found.");
                }
            },
            Command::Next => self.navigate(Direction::Forward).await,
            Command::Prev => self.navigate(Direction::Backward).await,
            Command::Random => self.random().await,
            Command::TogglePause => self.toggle_pause().await,
            Command::Stop => self.stop().await,
            Command::Volume { value } => self.set_volume(value).await?,
            Command::ToggleMute => {
                let target = if self.volume > 0.0 { 0.0 } else { UNMUTE_VOLUME };
                self.set_volume(target).await?;
            }
            Command::ToggleFavorite { id } => match self.playlist.find(&id) {
                Some(station) => {
                    let now = self.registry.toggle_favorite(station);
                    debug!("Favorite {} -> {}", id, now);
                }
                None => warn!("ToggleFavorite: unknown station {}", id),
            },
            Command::SetScope { scope } => {
                self.registry.set_scope(&scope);
                self.recent_order = self.registry.recently_played().to_vec();
                self.scope = scope;
                self.query.clear();
            }
            Command::Search { query } => self.query = query.trim().to_string(),
            Command::GetState => {
                // State will be published automatically
            }
        }
        Ok(())
    }

    /// Make `station` the current selection and start it.
    pub async fn select_station(&mut self, station: Station) {
        self.timers.cancel_all();
        self.pending_failover = None;
        self.session.selection += 1;
        self.session.load_pending = true;
        self.stream_title = None;
        self.set_status(PlaybackStatus::Loading);

        info!("Selecting station: {} ({})", station.name, station.url);
        self.registry.add_to_recently_played(&station);
        if !self.recent_order.iter().any(|id| station.is(id)) {
            self.recent_order.insert(0, station.id());
            self.recent_order.truncate(RECENTLY_PLAYED_CAP);
        }
        let url = station.url.clone();
        self.session.station = Some(station);

        if let Err(e) = self.host.load(&url).await {
            warn!("Host failed to load {}: {}", url, e);
            self.declare_failure(FailureCause::HostError).await;
            return;
        }

        if let Err(e) = self.host.play().await {
            // Declined start (no user gesture yet); wait for TogglePause.
            info!("Host declined to start playback: {}", e);
            self.set_status(PlaybackStatus::Paused);
        }
    }

    async fn navigate(&mut self, direction: Direction) {
        match self.neighbour(direction) {
            Some(station) => {
                self.failover_streak = 0;
                self.select_station(station).await;
            }
            None => self.notify(Severity::Info, "No other working station in this list."),
        }
    }

    async fn random(&mut self) {
        let pick = {
            let current = self.session.station.as_ref().map(Station::id);
            let candidates: Vec<&Station> = self
                .scope_stations()
                .into_iter()
                .filter(|s| !self.registry.is_broken(s))
                .filter(|s| !current.as_ref().is_some_and(|id| s.is(id)))
                .collect();
            candidates.choose(&mut rand::thread_rng()).map(|s| (*s).clone())
        };
        match pick {
            Some(station) => {
                self.failover_streak = 0;
                self.select_station(station).await;
            }
            None => self.notify(Severity::Info, "No other working station in this list."),
        }
    }

    async fn toggle_pause(&mut self) {
        let Some(station) = self.session.station.clone() else {
            self.notify(Severity::Info, "Select a station first.");
            return;
        };

        match self.session.status {
            PlaybackStatus::Playing => {
                if let Err(e) = self.host.pause().await {
                    warn!("Host failed to pause: {}", e);
                }
            }
            PlaybackStatus::Loading | PlaybackStatus::Paused => {
                if let Err(e) = self.host.play().await {
                    warn!("Host declined to resume: {}", e);
                    self.notify(Severity::Error, "Could not start the stream. Please try again.");
                }
            }
            PlaybackStatus::Idle => {
                self.failover_streak = 0;
                self.select_station(station).await;
            }
            PlaybackStatus::Failed => {
                self.notify(Severity::Warning, "This station is not working. Pick another one.");
            }
        }
    }

    async fn stop(&mut self) {
        self.timers.cancel_all();
        self.pending_failover = None;
        self.session.selection += 1;
        self.session.load_pending = false;
        self.stream_title = None;
        if let Err(e) = self.host.pause().await {
            debug!("Host pause on stop: {}", e);
        }
        if let Err(e) = self.host.reset().await {
            warn!("Host reset on stop failed: {}", e);
        }
        self.set_status(PlaybackStatus::Idle);
    }

    async fn set_volume(&mut self, value: f32) -> anyhow::Result<()> {
        let value = value.clamp(0.0, 1.0);
        self.volume = value;
        self.registry.set_volume(value);
        self.host.set_volume(value).await
    }

    // ── media events ──────────────────────────────────────────────────────────

    async fn handle_media(&mut self, evt: MediaEvent) {
        if self.session.station.is_none() {
            debug!("Ignoring {:?}: no station selected", evt);
            return;
        }
        let before = self.session.status;
        let after = next_status(before, &evt);

        match &evt {
            MediaEvent::Errored(reason) => {
                if before != PlaybackStatus::Idle {
                    warn!("Host reported error: {}", reason);
                    self.declare_failure(FailureCause::HostError).await;
                }
                return;
            }
            MediaEvent::Started if after == PlaybackStatus::Playing => {
                self.timers.cancel(Timer::LoadTimeout);
                self.session.load_pending = false;
                self.failover_streak = 0;
            }
            MediaEvent::LoadStarted if self.session.load_pending => {
                let delay = self.config.load_timeout();
                self.arm(Timer::LoadTimeout, delay);
            }
            MediaEvent::CanPlay => {
                self.timers.cancel(Timer::LoadTimeout);
                self.session.load_pending = false;
            }
            MediaEvent::Stalled
                if !matches!(before, PlaybackStatus::Idle | PlaybackStatus::Failed)
                    && !self.timers.is_armed(Timer::StallCheck) =>
            {
                debug!("Stream stalled, checking again in {:?}", self.config.stall_check());
                let delay = self.config.stall_check();
                self.arm(Timer::StallCheck, delay);
            }
            MediaEvent::MetadataReady(title)
                if !matches!(before, PlaybackStatus::Idle | PlaybackStatus::Failed) =>
            {
                self.stream_title = title.clone();
            }
            _ => {}
        }

        self.set_status(after);
    }

    // ── timers ────────────────────────────────────────────────────────────────

    fn arm(&mut self, timer: Timer, delay: Duration) {
        self.timers.cancel(timer);
        let tx = self.event_tx.clone();
        let selection = self.session.selection;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControllerEvent::TimerFired { timer, selection }).await;
        });
        *self.timers.slot(timer) = Some(handle.abort_handle());
    }

    async fn handle_timer(&mut self, timer: Timer, selection: u64) {
        if selection != self.session.selection {
            debug!("Ignoring stale {:?} timer (selection {})", timer, selection);
            return;
        }
        self.timers.slot(timer).take();

        match timer {
            Timer::LoadTimeout => {
                if self.session.load_pending {
                    warn!("Load timed out after {:?}", self.config.load_timeout());
                    self.declare_failure(FailureCause::LoadTimeout).await;
                }
            }
            Timer::StallCheck => {
                if matches!(
                    self.session.status,
                    PlaybackStatus::Idle | PlaybackStatus::Failed
                ) {
                    return;
                }
                let ready = self.host.ready_state().await;
                if ready.is_buffered() {
                    debug!("Stall recovered ({:?})", ready);
                } else {
                    warn!("Stream still stalled ({:?})", ready);
                    self.declare_failure(FailureCause::Stalled).await;
                }
            }
            Timer::Failover => {
                let Some(id) = self.pending_failover.take() else {
                    return;
                };
                match self.playlist.find(&id).cloned() {
                    Some(station) => {
                        info!("Failover to {}", station.name);
                        self.select_station(station).await;
                    }
                    None => warn!("Failover target {} vanished", id),
                }
            }
        }
    }

    // ── failure handling ──────────────────────────────────────────────────────

    /// Mark the current selection failed.  Runs at most once per selection.
    async fn declare_failure(&mut self, cause: FailureCause) {
        if matches!(
            self.session.status,
            PlaybackStatus::Idle | PlaybackStatus::Failed
        ) {
            debug!("Failure ({:?}) already handled for this selection", cause);
            return;
        }
        let Some(station) = self.session.station.clone() else {
            return;
        };

        self.timers.cancel(Timer::LoadTimeout);
        self.timers.cancel(Timer::StallCheck);
        self.session.load_pending = false;
        self.set_status(PlaybackStatus::Failed);

        if self.registry.mark_broken(&station) {
            warn!("Marked broken: {} ({:?})", station.name, cause);
        }
        if cause == FailureCause::LoadTimeout {
            if let Err(e) = self.host.reset().await {
                warn!("Host reset after timeout failed: {}", e);
            }
        }
        self.notify(Severity::Warning, cause.notice());
        self.schedule_failover();
    }

    fn schedule_failover(&mut self) {
        let limit = self.scope_stations().len();
        if self.failover_streak >= limit {
            warn!("Failover stopped after {} attempts", self.failover_streak);
            self.notify(Severity::Error, "No working station left in this list.");
            return;
        }

        match self.neighbour(Direction::Forward) {
            Some(next) => {
                self.failover_streak += 1;
                info!(
                    "Scheduling failover to {} in {:?} (attempt {})",
                    next.name,
                    self.config.failover_delay(),
                    self.failover_streak
                );
                self.pending_failover = Some(next.id());
                let delay = self.config.failover_delay();
                self.arm(Timer::Failover, delay);
            }
            None => {
                info!("No working station left in scope {:?}", self.scope);
                self.notify(Severity::Error, "No working station left in this list.");
            }
        }
    }

    // ── listings ──────────────────────────────────────────────────────────────

    /// Stations of the active scope in display order, broken ones included.
    fn scope_stations(&self) -> Vec<&Station> {
        match &self.scope {
            Scope::All => self.playlist.stations().iter().collect(),
            Scope::Category(label) => self.playlist.get_stations_by_category(label),
            Scope::Favorites => self.resolve(self.registry.favorites()),
            Scope::RecentlyPlayed => self.resolve(&self.recent_order),
        }
    }

    fn resolve<'a>(&'a self, ids: &[StationId]) -> Vec<&'a Station> {
        ids.iter().filter_map(|id| self.playlist.find(id)).collect()
    }

    /// The listing shown to clients: search results when a query is set,
    /// otherwise the active scope.  Broken stations are never listed.
    fn visible_stations(&self) -> Vec<&Station> {
        let listed = if self.query.is_empty() {
            self.scope_stations()
        } else {
            self.playlist.search_stations(&self.query)
        };
        listed
            .into_iter()
            .filter(|s| !self.registry.is_broken(s))
            .collect()
    }

    /// Next or previous working station in the active scope, wrapping around.
    /// The current station keeps its position even when broken; `None` when
    /// no other working station exists.
    pub fn neighbour(&self, direction: Direction) -> Option<Station> {
        let current = self.session.station.as_ref().map(Station::id);
        let is_current = |s: &Station| current.as_ref().is_some_and(|id| s.is(id));

        let positional: Vec<&Station> = self
            .scope_stations()
            .into_iter()
            .filter(|s| is_current(*s) || !self.registry.is_broken(s))
            .collect();
        if !positional.iter().any(|s| !is_current(*s)) {
            return None;
        }

        let len = positional.len();
        let Some(pos) = positional.iter().position(|s| is_current(*s)) else {
            let edge = match direction {
                Direction::Forward => positional.first(),
                Direction::Backward => positional.last(),
            };
            return edge.map(|s| (*s).clone());
        };

        (1..len)
            .map(|step| match direction {
                Direction::Forward => (pos + step) % len,
                Direction::Backward => (pos + len - step) % len,
            })
            .map(|i| positional[i])
            .find(|s| !is_current(*s))
            .cloned()
    }

    // ── publishing ────────────────────────────────────────────────────────────

    fn build_view(&self) -> PlayerView {
        let current = self.session.station.as_ref();
        let current_id = current.map(Station::id);
        let stations = self
            .visible_stations()
            .into_iter()
            .map(|s| StationEntry {
                station: s.clone(),
                logo_url: s.display_logo_url(),
                favorite: self.registry.is_favorite(s),
                recent: self.registry.is_recent(s),
                current: current_id.as_ref().is_some_and(|id| s.is(id)),
            })
            .collect();

        PlayerView {
            rev: 0,
            current_station: current.cloned(),
            status: self.session.status,
            is_playing: self.session.status == PlaybackStatus::Playing,
            is_loading: self.session.load_pending,
            volume: self.volume,
            scope: self.scope.clone(),
            query: self.query.clone(),
            categories: self.playlist.categories().to_vec(),
            stations,
            stream_title: self.stream_title.clone(),
            fatal: None,
        }
    }

    async fn publish(&self) {
        self.state_manager.publish(self.build_view()).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn set_status(&mut self, status: PlaybackStatus) {
        if self.session.status != status {
            debug!("Status {:?} -> {:?}", self.session.status, status);
            self.session.status = status;
        }
    }

    fn notify(&self, severity: Severity, message: &str) {
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Notice(Notice::new(severity, message)));
    }

    async fn cleanup(&mut self) {
        info!("PlaybackController: cleanup");
        self.timers.cancel_all();
        self.host.shutdown().await;
    }
}

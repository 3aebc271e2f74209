use plusradio_daemon::core::{ControllerEvent, PlaybackController};
use plusradio_daemon::loader::{self, StartupError};
use plusradio_daemon::mpv::MpvHost;
use plusradio_daemon::{http, socket, BroadcastMessage};
use plusradio_proto::config::Config;
use plusradio_proto::platform;
use plusradio_proto::playlist::Playlist;
use plusradio_proto::registry::StationRegistry;
use plusradio_proto::state::StateManager;
use plusradio_proto::store::FileStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Forwards WARN and ERROR events to connected clients.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // no receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

async fn startup(config: &Config) -> Result<Playlist, StartupError> {
    if platform::find_mpv_binary().is_none() {
        return Err(StartupError::MediaHost(
            "mpv binary not found (set MPV_PATH or install mpv)".into(),
        ));
    }
    loader::load_playlist(&config.playlist.source).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,plusradio_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let state_manager = StateManager::new();
    let (event_tx, event_rx) = mpsc::channel::<ControllerEvent>(256);

    let playlist = match startup(&config).await {
        Ok(playlist) => playlist,
        Err(e) => {
            // Keep the servers up so clients can show the failure.
            error!("Startup failed: {}", e);
            state_manager.set_fatal(e.to_string()).await;
            let _ = broadcast_tx.send(BroadcastMessage::Fatal(e.to_string()));
            start_servers(&config, &state_manager, None, &broadcast_tx);
            tokio::signal::ctrl_c().await?;
            return Ok(());
        }
    };

    let mut registry = StationRegistry::new(Box::new(FileStore::open(&config.daemon.storage_file)));
    if config.daemon.reset_broken_on_start {
        warn!("Clearing {} broken stations", registry.broken().len());
        registry.reset_broken();
    }

    let controller = PlaybackController::new(
        playlist,
        registry,
        Box::new(MpvHost::new(event_tx.clone())),
        config.playback.clone(),
        state_manager.clone(),
        broadcast_tx.clone(),
        event_tx.clone(),
    );

    start_servers(&config, &state_manager, Some(event_tx.clone()), &broadcast_tx);

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(ControllerEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    controller.run(event_rx).await?;

    Ok(())
}

fn start_servers(
    config: &Config,
    state_manager: &StateManager,
    event_tx: socket::CommandSink,
    broadcast_tx: &broadcast::Sender<BroadcastMessage>,
) {
    socket::start_server(
        config.http.bind_address.clone(),
        platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx,
        );
    }
}

mod display;
mod engine;
mod logs;
mod mpd;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use karaconfig::get_config;
use karacontrol::{
    CommandAdvance, CommandClient, ControllerSettings, KeyTrackMap, ManifestLocator,
    PlayerController, bind_cache,
};
use karaevents::{EventStreamClient, ReconnectPolicy, StreamSettings};
use karastate::StateCache;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::display::DisplaySettings;
use crate::engine::HeadlessEngine;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Configuration et logs ==========
    let config = get_config();
    logs::init_logging(&config)?;
    info!("🎤 Starting KaraHost...");
    // Le chargement a eu lieu avant les logs : on en refait le bilan.
    match (config.config_dir(), config.load_error()) {
        (Some(dir), _) => info!("⚙️ Configuration loaded from {}", dir.display()),
        (None, Some(reason)) => warn!("⚠️ Cannot load configuration ({}), using built-in defaults", reason),
        (None, None) => warn!("⚠️ Running on built-in defaults"),
    }
    for name in config.overrides() {
        info!("⚙️ Overridden from environment: {}", name);
    }

    let server = Url::parse(&config.get_server_url())
        .with_context(|| format!("invalid server url {:?}", config.get_server_url()))?;
    info!("📡 Karaoke server: {}", server);

    let cache = StateCache::new();
    let http = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("cannot build HTTP client")?;

    // ========== PHASE 2 : Commandes et flux d'événements ==========
    let commands = CommandClient::with_client(http.clone(), server.clone(), cache.clone())
        .with_timeout(Duration::from_secs(config.get_request_timeout_secs()));

    let stream_settings = StreamSettings::new(&server, &config.get_events_path())
        .context("invalid events path")?
        .with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(config.get_reconnect_initial_delay_ms()),
            max_delay: Duration::from_millis(config.get_reconnect_max_delay_ms()),
            max_attempts: config.get_reconnect_max_attempts(),
            ..ReconnectPolicy::default()
        })
        .with_idle_timeout(Duration::from_secs(config.get_idle_timeout_secs()));
    info!("📻 Event stream: {}", stream_settings.url);
    let stream = EventStreamClient::with_client(http.clone(), cache.clone(), stream_settings);
    let connection = stream.subscribe_state();

    // ========== PHASE 3 : Lecteur ==========
    let settings = ControllerSettings {
        manifest: ManifestLocator::new(config.get_manifest_template()),
        key_tracks: KeyTrackMap::Offset {
            base: config.get_key_track_base(),
        },
        autoplay: config.get_autoplay(),
        ..ControllerSettings::new(server.clone())
    };
    info!("🎬 Manifests: {}", settings.manifest.template());
    let engine = HeadlessEngine::new(http.clone());
    let (controller, player_events) = PlayerController::new(
        Box::new(engine),
        Arc::new(CommandAdvance::new(commands.clone())),
        settings,
    );
    let player_view = controller.subscribe_view();
    let (binding, inputs) = bind_cache(&cache);

    // ========== PHASE 4 : Démarrage des tâches ==========
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.get_hydrate_on_start() {
        info!("🔄 Fetching current state from the server...");
        tasks.push(tokio::spawn(async move { commands.hydrate().await }));
    }
    tasks.push(tokio::spawn(controller.run(
        inputs,
        player_events,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(stream.run(shutdown.clone())));
    tasks.push(tokio::spawn(display::run(
        DisplaySettings::from_config(&config),
        cache.clone(),
        player_view,
        connection,
        shutdown.clone(),
    )));

    info!("✅ KaraHost is ready!");
    info!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl+C")?;
    info!("🛑 Shutting down...");
    shutdown.cancel();

    for task in tasks {
        if let Err(err) = task.await {
            warn!("⚠️ Task ended abnormally: {}", err);
        }
    }
    drop(binding);

    info!("👋 KaraHost stopped");
    Ok(())
}

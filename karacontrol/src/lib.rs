//! # karacontrol
//!
//! Drives the karaoke display's media player from the shared state cache, and
//! sends commands back to the queue server.
//!
//! - [`controller`] : [`PlayerController`], the single-instance lifecycle of the player
//! - [`player`] : the [`MediaEngine`] / [`MediaPlayer`] seam implemented by engines
//! - [`command`] : [`CommandClient`] for `play_next` and the startup queries
//!
//! ```no_run
//! use std::sync::Arc;
//! use karacontrol::{
//!     CommandAdvance, CommandClient, ControllerSettings, MediaEngine, PlayerController, bind_cache,
//! };
//! use karastate::StateCache;
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # async fn demo(engine: Box<dyn MediaEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = StateCache::new();
//! let server = Url::parse("http://192.168.1.20:8000")?;
//! let commands = CommandClient::new(server.clone(), cache.clone())?;
//!
//! let (controller, player_events) = PlayerController::new(
//!     engine,
//!     Arc::new(CommandAdvance::new(commands)),
//!     ControllerSettings::new(server),
//! );
//! let (_binding, inputs) = bind_cache(&cache);
//! controller.run(inputs, player_events, CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod controller;
pub mod error;
pub mod player;

pub use command::{
    Advance, CommandAdvance, CommandClient, DEFAULT_ADVANCE_ATTEMPTS, DEFAULT_ADVANCE_RETRY_DELAY,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};
pub use controller::{
    AdvanceRequester, CacheBinding, ControllerInput, ControllerSettings, PlayerController,
    PlayerPhase, PlayerView, bind_cache,
};
pub use error::{CommandError, PlayerError, Result};
pub use player::{
    AudioTrack, DEFAULT_KEY_TRACK_BASE, DEFAULT_MANIFEST_TEMPLATE, InstanceId, KeyTrackMap,
    ManifestLocator, MediaEngine, MediaPlayer, PlayerEvent, PlayerEventKind, PlayerEventReceiver,
    PlayerEventSender,
};

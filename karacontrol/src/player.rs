//! Media engine seam.
//!
//! The controller never plays media itself: it drives one [`MediaPlayer`]
//! created through a [`MediaEngine`]. Engines report back asynchronously with
//! [`PlayerEvent`]s tagged by the [`InstanceId`] they were created with, so
//! that late events from a destroyed instance can be told apart.

use std::fmt;
use std::sync::Arc;

use karaevents::KeyOffset;
use tokio::sync::mpsc;
use url::Url;

use crate::error::PlayerError;

/// Default manifest location, relative to the server URL.
pub const DEFAULT_MANIFEST_TEMPLATE: &str = "dash/{id}/{id}.mpd";

/// Default audio track for a zero key offset.
pub const DEFAULT_KEY_TRACK_BASE: i32 = 4;

/// Identity of one player instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

/// One alternative audio rendition of the current stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioTrack {
    pub id: u32,
    pub lang: Option<String>,
    pub label: Option<String>,
}

impl AudioTrack {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            lang: None,
            label: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEventKind {
    /// The manifest was loaded and the audio tracks are known.
    StreamInitialized,
    /// The position moved; read it with [`MediaPlayer::time`].
    TimeUpdated,
    Ended,
    Error(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayerEvent {
    pub instance: InstanceId,
    pub kind: PlayerEventKind,
}

impl PlayerEvent {
    pub fn new(instance: InstanceId, kind: PlayerEventKind) -> Self {
        Self { instance, kind }
    }
}

pub type PlayerEventSender = mpsc::UnboundedSender<PlayerEvent>;
pub type PlayerEventReceiver = mpsc::UnboundedReceiver<PlayerEvent>;

/// A live media player bound to one stream.
///
/// Calls never block on I/O: loading and playback progress are reported
/// through the event sender given at creation.
pub trait MediaPlayer: Send {
    fn instance(&self) -> InstanceId;

    /// Starts loading `manifest`; `StreamInitialized` follows once ready.
    fn initialize(&mut self, manifest: &Url, autoplay: bool) -> Result<(), PlayerError>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Tracks known so far; empty before `StreamInitialized`.
    fn audio_tracks(&self) -> Vec<AudioTrack>;

    fn set_audio_track(&mut self, track: &AudioTrack) -> Result<(), PlayerError>;

    /// Current position in seconds.
    fn time(&self) -> f64;

    /// Stream duration in seconds, once known.
    fn duration(&self) -> Option<f64>;

    /// Releases every resource. No event is emitted afterwards.
    fn destroy(&mut self);
}

pub trait MediaEngine: Send {
    fn create_player(
        &mut self,
        instance: InstanceId,
        events: PlayerEventSender,
    ) -> Result<Box<dyn MediaPlayer>, PlayerError>;
}

/// Maps a key offset to the id of the audio track carrying that transposition.
#[derive(Clone)]
pub enum KeyTrackMap {
    /// Track id is `base + offset`.
    Offset { base: i32 },
    Custom(Arc<dyn Fn(KeyOffset) -> Option<u32> + Send + Sync>),
}

impl Default for KeyTrackMap {
    fn default() -> Self {
        KeyTrackMap::Offset {
            base: DEFAULT_KEY_TRACK_BASE,
        }
    }
}

impl fmt::Debug for KeyTrackMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyTrackMap::Offset { base } => f.debug_struct("Offset").field("base", base).finish(),
            KeyTrackMap::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl KeyTrackMap {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(KeyOffset) -> Option<u32> + Send + Sync + 'static,
    {
        KeyTrackMap::Custom(Arc::new(f))
    }

    /// Track id for `offset`, `None` when the mapping has no track for it.
    pub fn track_for(&self, offset: KeyOffset) -> Option<u32> {
        match self {
            KeyTrackMap::Offset { base } => {
                base.checked_add(offset.0).and_then(|id| u32::try_from(id).ok())
            }
            KeyTrackMap::Custom(f) => f(offset),
        }
    }
}

/// Builds the manifest URL of a song from a path template.
///
/// Every `{id}` in the template is replaced by the song id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestLocator {
    template: String,
}

impl Default for ManifestLocator {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_TEMPLATE)
    }
}

impl ManifestLocator {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn locate(&self, server: &Url, song_id: &str) -> Result<Url, PlayerError> {
        let song_id = song_id.trim();
        if song_id.is_empty() {
            return Err(PlayerError::Manifest("empty song id".to_string()));
        }
        if song_id.contains(['/', '?', '#']) {
            return Err(PlayerError::Manifest(format!(
                "song id {song_id:?} is not a path segment"
            )));
        }

        // Base traitée comme un répertoire : http://h/kara -> http://h/kara/dash/...
        let mut base = server.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let relative = self.template.replace("{id}", song_id);
        Ok(base.join(relative.trim_start_matches('/'))?)
    }
}

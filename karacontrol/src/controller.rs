//! Player Controller
//!
//! Reconciles the pushed current song, playback toggle and key offset with a
//! single media player instance.
//!
//! ```text
//!            song cleared / empty id
//!   ┌─────────────────────────────────────────────┐
//!   ▼                                             │
//! Idle ──InProgress/Ready──► Preparing ──Success──► Active ──Failed──► Failed
//!   └──────────────────────Success────────────────▲
//! ```
//!
//! At most one instance exists at any time: the previous one is destroyed
//! before the next one is created. Events emitted by a destroyed instance are
//! recognised by their [`InstanceId`] and dropped.

use std::sync::Arc;

use karaevents::{KeyOffset, Song, Status, keys};
use karastate::{StateCache, Subscription};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::player::{
    InstanceId, KeyTrackMap, ManifestLocator, MediaEngine, MediaPlayer, PlayerEvent,
    PlayerEventKind, PlayerEventReceiver, PlayerEventSender,
};

/// Asks the server to move on to the next song.
///
/// Called by the controller when the current stream ends. Implementations
/// must not block.
pub trait AdvanceRequester: Send + Sync {
    fn request_advance(&self);
}

/// A cache notification relevant to the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerInput {
    CurrentSong(Option<Song>),
    Playback(bool),
    KeyChange(KeyOffset),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlayerPhase {
    #[default]
    Idle,
    Preparing,
    Active,
    Failed,
}

impl PlayerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerPhase::Idle => "idle",
            PlayerPhase::Preparing => "preparing",
            PlayerPhase::Active => "active",
            PlayerPhase::Failed => "failed",
        }
    }
}

/// What the display needs to know about the player.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayerView {
    pub phase: PlayerPhase,
    pub song: Option<Song>,
    pub instance: Option<InstanceId>,
    /// Playback progress in percent, 0 to 100.
    pub progress: f64,
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub server_url: Url,
    pub manifest: ManifestLocator,
    pub key_tracks: KeyTrackMap,
    /// Autoplay used while no toggle was received.
    pub autoplay: bool,
}

impl ControllerSettings {
    pub fn new(server_url: Url) -> Self {
        Self {
            server_url,
            manifest: ManifestLocator::default(),
            key_tracks: KeyTrackMap::default(),
            autoplay: true,
        }
    }
}

struct Attached {
    id: InstanceId,
    song_id: String,
    player: Box<dyn MediaPlayer>,
    advance_requested: bool,
}

pub struct PlayerController {
    engine: Box<dyn MediaEngine>,
    advance: Arc<dyn AdvanceRequester>,
    settings: ControllerSettings,
    events: PlayerEventSender,
    next_instance: u64,
    attached: Option<Attached>,
    song: Option<Song>,
    phase: PlayerPhase,
    key: Option<KeyOffset>,
    playing: Option<bool>,
    progress: f64,
    view: watch::Sender<PlayerView>,
}

impl PlayerController {
    /// Builds a controller and the receiving end of its player events.
    ///
    /// The receiver must be fed back to [`PlayerController::on_player_event`],
    /// usually through [`PlayerController::run`].
    pub fn new(
        engine: Box<dyn MediaEngine>,
        advance: Arc<dyn AdvanceRequester>,
        settings: ControllerSettings,
    ) -> (Self, PlayerEventReceiver) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (view, _) = watch::channel(PlayerView::default());
        let controller = Self {
            engine,
            advance,
            settings,
            events,
            next_instance: 0,
            attached: None,
            song: None,
            phase: PlayerPhase::Idle,
            key: None,
            playing: None,
            progress: 0.0,
            view,
        };
        (controller, events_rx)
    }

    pub fn subscribe_view(&self) -> watch::Receiver<PlayerView> {
        self.view.subscribe()
    }

    pub fn phase(&self) -> PlayerPhase {
        self.phase
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Instance currently attached, if any.
    pub fn instance(&self) -> Option<InstanceId> {
        self.attached.as_ref().map(|attached| attached.id)
    }

    pub fn handle_input(&mut self, input: ControllerInput) {
        match input {
            ControllerInput::CurrentSong(song) => self.on_current_song(song),
            ControllerInput::Playback(playing) => self.on_playback(playing),
            ControllerInput::KeyChange(key) => self.on_key_change(key),
        }
    }

    pub fn on_current_song(&mut self, song: Option<Song>) {
        let song = song.filter(Song::has_id);
        if let Some(song) = &song {
            debug!(song = %song.uuid, status = song.status.as_str(), "current song pushed");
        }

        self.phase = match &song {
            None => {
                self.detach("no current song");
                PlayerPhase::Idle
            }
            Some(song) => match song.status {
                Status::Success => {
                    let same = self
                        .attached
                        .as_ref()
                        .is_some_and(|attached| attached.song_id == song.uuid);
                    if same {
                        debug!(song = %song.uuid, "current song unchanged");
                    } else {
                        self.detach("current song changed");
                        self.attach(song);
                    }
                    PlayerPhase::Active
                }
                Status::InProgress | Status::Ready => {
                    self.detach("current song not ready");
                    PlayerPhase::Preparing
                }
                Status::Failed => {
                    self.detach("current song failed");
                    PlayerPhase::Failed
                }
            },
        };

        self.song = song;
        self.publish_view();
    }

    pub fn on_playback(&mut self, playing: bool) {
        self.playing = Some(playing);
        self.apply_playback();
    }

    pub fn on_key_change(&mut self, key: KeyOffset) {
        self.key = Some(key);
        self.apply_key();
    }

    pub fn on_player_event(&mut self, event: PlayerEvent) {
        let Some(attached) = self
            .attached
            .as_mut()
            .filter(|attached| attached.id == event.instance)
        else {
            debug!(instance = %event.instance, kind = ?event.kind, "event from a stale player ignored");
            return;
        };

        match event.kind {
            PlayerEventKind::StreamInitialized => {
                info!(instance = %event.instance, song = %attached.song_id, "stream initialized");
                self.apply_key();
                self.apply_playback();
            }
            PlayerEventKind::TimeUpdated => {
                let player = &attached.player;
                self.progress = player
                    .duration()
                    .map_or(0.0, |duration| progress_percent(player.time(), duration));
                self.publish_view();
            }
            PlayerEventKind::Ended => {
                if attached.advance_requested {
                    debug!(instance = %event.instance, "end already handled");
                    return;
                }
                attached.advance_requested = true;
                info!(song = %attached.song_id, "song ended, requesting next one");
                self.progress = 100.0;
                self.publish_view();
                self.advance.request_advance();
            }
            PlayerEventKind::Error(message) => {
                warn!(instance = %event.instance, song = %attached.song_id, error = %message, "player error");
            }
        }
    }

    /// Destroys the instance, if any.
    pub fn teardown(&mut self) {
        if self.attached.is_some() {
            self.detach("controller shutting down");
            self.publish_view();
        }
    }

    /// Event loop: processes inputs and player events one at a time until
    /// `shutdown` fires or every input sender is gone.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<ControllerInput>,
        mut player_events: PlayerEventReceiver,
        shutdown: CancellationToken,
    ) {
        info!("player controller started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = player_events.recv() => self.on_player_event(event),
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
            }
        }
        self.teardown();
        info!("player controller stopped");
    }

    fn attach(&mut self, song: &Song) {
        let manifest = match self
            .settings
            .manifest
            .locate(&self.settings.server_url, &song.uuid)
        {
            Ok(url) => url,
            Err(err) => {
                warn!(song = %song.uuid, error = %err, "cannot locate manifest");
                return;
            }
        };

        self.next_instance += 1;
        let id = InstanceId(self.next_instance);

        let mut player = match self.engine.create_player(id, self.events.clone()) {
            Ok(player) => player,
            Err(err) => {
                warn!(song = %song.uuid, error = %err, "cannot create player");
                return;
            }
        };

        let autoplay = self.playing.unwrap_or(self.settings.autoplay);
        if let Err(err) = player.initialize(&manifest, autoplay) {
            warn!(song = %song.uuid, error = %err, "cannot initialize player");
            player.destroy();
            return;
        }

        info!(instance = %id, song = %song.formatted_name, %manifest, autoplay, "player attached");
        self.attached = Some(Attached {
            id,
            song_id: song.uuid.clone(),
            player,
            advance_requested: false,
        });
        self.progress = 0.0;

        self.apply_key();
        self.apply_playback();
    }

    fn detach(&mut self, reason: &str) {
        if let Some(mut attached) = self.attached.take() {
            info!(instance = %attached.id, song = %attached.song_id, reason, "destroying player");
            attached.player.destroy();
        }
        self.progress = 0.0;
    }

    fn apply_key(&mut self) {
        let (Some(attached), Some(key)) = (self.attached.as_mut(), self.key) else {
            return;
        };
        let Some(track_id) = self.settings.key_tracks.track_for(key) else {
            debug!(%key, "no audio track mapped for key");
            return;
        };

        let tracks = attached.player.audio_tracks();
        let Some(track) = tracks.iter().find(|track| track.id == track_id) else {
            debug!(%key, track_id, available = tracks.len(), "audio track not available yet");
            return;
        };

        match attached.player.set_audio_track(track) {
            Ok(()) => debug!(%key, track_id, "audio track selected"),
            Err(err) => warn!(%key, track_id, error = %err, "cannot select audio track"),
        }
    }

    fn apply_playback(&mut self) {
        let (Some(attached), Some(playing)) = (self.attached.as_mut(), self.playing) else {
            return;
        };
        if playing {
            attached.player.play();
        } else {
            attached.player.pause();
        }
    }

    fn publish_view(&self) {
        let next = PlayerView {
            phase: self.phase,
            song: self.song.clone(),
            instance: self.instance(),
            progress: self.progress,
        };
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.detach("controller dropped");
    }
}

fn progress_percent(time: f64, duration: f64) -> f64 {
    if duration.is_finite() && duration > 0.0 && time.is_finite() {
        (time / duration * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Live link between the cache and a controller's input channel.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct CacheBinding {
    _subscriptions: Vec<Subscription>,
}

/// Forwards the controller's cache keys as [`ControllerInput`]s.
///
/// Values already cached are sent first, key offset and toggle before the
/// current song, so that a new instance starts with the right settings.
pub fn bind_cache(
    cache: &StateCache,
) -> (CacheBinding, mpsc::UnboundedReceiver<ControllerInput>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let key_tx = tx.clone();
    let key = cache.subscribe_with_current(&keys::KEY_OFFSET, move |key| {
        if let Some(key) = key {
            let _ = key_tx.send(ControllerInput::KeyChange(*key));
        }
    });

    let playback_tx = tx.clone();
    let playback = cache.subscribe_with_current(&keys::PLAYBACK, move |playing| {
        if let Some(playing) = playing {
            let _ = playback_tx.send(ControllerInput::Playback(*playing));
        }
    });

    let song = cache.subscribe_with_current(&keys::CURRENT_SONG, move |song| {
        let _ = tx.send(ControllerInput::CurrentSong(song.cloned()));
    });

    (
        CacheBinding {
            _subscriptions: vec![key, playback, song],
        },
        rx,
    )
}

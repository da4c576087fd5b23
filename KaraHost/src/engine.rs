//! Headless media engine.
//!
//! Plays nothing: it loads the manifest, exposes its audio tracks, and runs a
//! clock that reports progress and the end of the song, which is enough to
//! drive the queue from a machine without a screen.

use std::sync::Arc;
use std::time::Duration;

use karacontrol::{
    AudioTrack, InstanceId, MediaEngine, MediaPlayer, PlayerError, PlayerEvent, PlayerEventKind,
    PlayerEventSender,
};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::mpd::{ManifestInfo, parse_manifest};

/// Default clock resolution
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub struct HeadlessEngine {
    http: Client,
    tick: Duration,
}

impl HeadlessEngine {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

impl MediaEngine for HeadlessEngine {
    fn create_player(
        &mut self,
        instance: InstanceId,
        events: PlayerEventSender,
    ) -> Result<Box<dyn MediaPlayer>, PlayerError> {
        debug!(%instance, "creating headless player");
        Ok(Box::new(HeadlessPlayer::new(
            instance,
            self.http.clone(),
            self.tick,
            events,
        )))
    }
}

#[derive(Default)]
struct PlaybackState {
    tracks: Vec<AudioTrack>,
    selected: Option<u32>,
    time: f64,
    duration: Option<f64>,
}

pub struct HeadlessPlayer {
    instance: InstanceId,
    http: Client,
    tick: Duration,
    events: PlayerEventSender,
    state: Arc<Mutex<PlaybackState>>,
    playing: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl HeadlessPlayer {
    fn new(instance: InstanceId, http: Client, tick: Duration, events: PlayerEventSender) -> Self {
        let (playing, _) = watch::channel(false);
        Self {
            instance,
            http,
            tick,
            events,
            state: Arc::default(),
            playing,
            cancel: CancellationToken::new(),
        }
    }
}

impl MediaPlayer for HeadlessPlayer {
    fn instance(&self) -> InstanceId {
        self.instance
    }

    fn initialize(&mut self, manifest: &Url, autoplay: bool) -> Result<(), PlayerError> {
        let runtime = Handle::try_current()
            .map_err(|_| PlayerError::engine("headless player needs a tokio runtime"))?;

        // Réinitialisation : l'horloge précédente est arrêtée.
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        *self.state.lock() = PlaybackState::default();
        self.playing.send_replace(autoplay);

        let clock = Clock {
            instance: self.instance,
            http: self.http.clone(),
            manifest: manifest.clone(),
            tick: self.tick,
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            playing: self.playing.subscribe(),
            cancel: self.cancel.clone(),
        };
        runtime.spawn(clock.run());
        Ok(())
    }

    fn play(&mut self) {
        self.playing.send_replace(true);
    }

    fn pause(&mut self) {
        self.playing.send_replace(false);
    }

    fn audio_tracks(&self) -> Vec<AudioTrack> {
        self.state.lock().tracks.clone()
    }

    fn set_audio_track(&mut self, track: &AudioTrack) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if !state.tracks.iter().any(|known| known.id == track.id) {
            return Err(PlayerError::Engine(format!(
                "audio track {} is not in the manifest",
                track.id
            )));
        }
        let previous = state.selected.replace(track.id);
        info!(instance = %self.instance, track = track.id, ?previous, lang = ?track.lang, "audio track switched");
        Ok(())
    }

    fn time(&self) -> f64 {
        self.state.lock().time
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    fn destroy(&mut self) {
        debug!(instance = %self.instance, "headless player destroyed");
        self.cancel.cancel();
    }
}

impl Drop for HeadlessPlayer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Clock {
    instance: InstanceId,
    http: Client,
    manifest: Url,
    tick: Duration,
    events: PlayerEventSender,
    state: Arc<Mutex<PlaybackState>>,
    playing: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Clock {
    fn emit(&self, kind: PlayerEventKind) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(PlayerEvent::new(self.instance, kind));
    }

    async fn run(mut self) {
        let loaded = tokio::select! {
            _ = self.cancel.cancelled() => return,
            loaded = load_manifest(&self.http, &self.manifest) => loaded,
        };

        let info = match loaded {
            Ok(info) => info,
            Err(err) => {
                warn!(instance = %self.instance, manifest = %self.manifest, error = %err, "cannot load manifest");
                self.emit(PlayerEventKind::Error(err.to_string()));
                return;
            }
        };

        {
            let mut state = self.state.lock();
            state.tracks = info.audio_tracks;
            state.duration = info.duration;
        }
        self.emit(PlayerEventKind::StreamInitialized);

        let Some(duration) = info.duration.filter(|d| *d > 0.0) else {
            self.emit(PlayerEventKind::Error(
                "manifest has no usable mediaPresentationDuration".to_string(),
            ));
            return;
        };

        let step = self.tick.as_secs_f64();
        loop {
            if !*self.playing.borrow_and_update() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = self.playing.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(self.tick) => {}
                // Pause pendant le tic : on repart de l'état courant.
                changed = self.playing.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }

            let time = {
                let mut state = self.state.lock();
                state.time = (state.time + step).min(duration);
                state.time
            };
            self.emit(PlayerEventKind::TimeUpdated);

            if time >= duration {
                self.emit(PlayerEventKind::Ended);
                return;
            }
        }
    }
}

async fn load_manifest(http: &Client, manifest: &Url) -> Result<ManifestInfo, PlayerError> {
    let response = http
        .get(manifest.clone())
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| PlayerError::Engine(format!("manifest request failed: {err}")))?;
    let body = response
        .text()
        .await
        .map_err(|err| PlayerError::Engine(format!("manifest download failed: {err}")))?;
    parse_manifest(&body)
}

//! Player controller behaviour against a recording engine

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use karacontrol::{
    AdvanceRequester, AudioTrack, ControllerSettings, InstanceId, KeyTrackMap, MediaEngine,
    MediaPlayer, PlayerController, PlayerError, PlayerEvent, PlayerEventKind, PlayerEventReceiver,
    PlayerEventSender, PlayerPhase, bind_cache,
};
use karaevents::{KeyOffset, Song, Status, keys};
use karastate::StateCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Create(InstanceId),
    Initialize(InstanceId, String, bool),
    Play(InstanceId),
    Pause(InstanceId),
    SetTrack(InstanceId, u32),
    Destroy(InstanceId),
}

#[derive(Default)]
struct Recorder {
    calls: Vec<Call>,
    live: HashSet<InstanceId>,
    max_live: usize,
    loaded: HashSet<InstanceId>,
    fail_create: bool,
    senders: Vec<PlayerEventSender>,
    positions: HashMap<InstanceId, (f64, f64)>,
}

type Shared = Arc<Mutex<Recorder>>;

struct FakeEngine {
    shared: Shared,
    tracks: Vec<u32>,
}

struct FakePlayer {
    id: InstanceId,
    shared: Shared,
    tracks: Vec<u32>,
}

impl MediaEngine for FakeEngine {
    fn create_player(
        &mut self,
        instance: InstanceId,
        events: PlayerEventSender,
    ) -> Result<Box<dyn MediaPlayer>, PlayerError> {
        let mut rec = self.shared.lock();
        if rec.fail_create {
            return Err(PlayerError::engine("no decoder"));
        }
        rec.calls.push(Call::Create(instance));
        rec.live.insert(instance);
        rec.max_live = rec.max_live.max(rec.live.len());
        rec.senders.push(events);
        Ok(Box::new(FakePlayer {
            id: instance,
            shared: Arc::clone(&self.shared),
            tracks: self.tracks.clone(),
        }))
    }
}

impl MediaPlayer for FakePlayer {
    fn instance(&self) -> InstanceId {
        self.id
    }

    fn initialize(&mut self, manifest: &Url, autoplay: bool) -> Result<(), PlayerError> {
        self.shared
            .lock()
            .calls
            .push(Call::Initialize(self.id, manifest.to_string(), autoplay));
        Ok(())
    }

    fn play(&mut self) {
        self.shared.lock().calls.push(Call::Play(self.id));
    }

    fn pause(&mut self) {
        self.shared.lock().calls.push(Call::Pause(self.id));
    }

    fn audio_tracks(&self) -> Vec<AudioTrack> {
        if self.shared.lock().loaded.contains(&self.id) {
            self.tracks.iter().copied().map(AudioTrack::new).collect()
        } else {
            Vec::new()
        }
    }

    fn set_audio_track(&mut self, track: &AudioTrack) -> Result<(), PlayerError> {
        self.shared
            .lock()
            .calls
            .push(Call::SetTrack(self.id, track.id));
        Ok(())
    }

    fn time(&self) -> f64 {
        self.shared
            .lock()
            .positions
            .get(&self.id)
            .map_or(0.0, |(time, _)| *time)
    }

    fn duration(&self) -> Option<f64> {
        self.shared
            .lock()
            .positions
            .get(&self.id)
            .map(|(_, duration)| *duration)
    }

    fn destroy(&mut self) {
        let mut rec = self.shared.lock();
        rec.calls.push(Call::Destroy(self.id));
        rec.live.remove(&self.id);
    }
}

#[derive(Default)]
struct CountingAdvance(AtomicUsize);

impl AdvanceRequester for CountingAdvance {
    fn request_advance(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    controller: PlayerController,
    events: PlayerEventReceiver,
    shared: Shared,
    advance: Arc<CountingAdvance>,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(|settings| settings)
    }

    fn with_settings(f: impl FnOnce(ControllerSettings) -> ControllerSettings) -> Self {
        let shared: Shared = Arc::default();
        let engine = FakeEngine {
            shared: Arc::clone(&shared),
            tracks: (1..=7).collect(),
        };
        let advance = Arc::new(CountingAdvance::default());
        let settings = f(ControllerSettings::new(
            Url::parse("http://karaoke.local:8000").unwrap(),
        ));
        let (controller, events) = PlayerController::new(Box::new(engine), advance.clone(), settings);
        Self {
            controller,
            events,
            shared,
            advance,
        }
    }

    fn push(&mut self, uuid: &str, status: Status) {
        self.controller
            .on_current_song(Some(Song::new(uuid, format!("Song {uuid}"), status)));
    }

    fn calls(&self) -> Vec<Call> {
        self.shared.lock().calls.clone()
    }

    fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Create(_)))
            .count()
    }

    fn live(&self) -> usize {
        self.shared.lock().live.len()
    }

    /// Simule le chargement du manifeste par le moteur.
    fn load(&mut self, id: InstanceId) {
        self.shared.lock().loaded.insert(id);
        self.controller
            .on_player_event(PlayerEvent::new(id, PlayerEventKind::StreamInitialized));
    }

    fn event(&mut self, id: InstanceId, kind: PlayerEventKind) {
        self.controller.on_player_event(PlayerEvent::new(id, kind));
    }

    /// Avance la position du lecteur puis le signale.
    fn seek(&mut self, id: InstanceId, time: f64, duration: f64) {
        self.shared.lock().positions.insert(id, (time, duration));
        self.event(id, PlayerEventKind::TimeUpdated);
    }

    fn advances(&self) -> usize {
        self.advance.0.load(Ordering::SeqCst)
    }
}

#[test]
fn test_at_most_one_live_instance() {
    let mut h = Harness::new();

    let pushes: &[(Option<&str>, Status)] = &[
        (Some("A"), Status::Success),
        (Some("A"), Status::Success),
        (Some("B"), Status::InProgress),
        (Some("B"), Status::Success),
        (Some("C"), Status::Success),
        (None, Status::Success),
        (Some("D"), Status::Success),
        (Some("D"), Status::Failed),
        (Some("E"), Status::Ready),
        (Some("E"), Status::Success),
        (Some("F"), Status::Success),
    ];

    for (uuid, status) in pushes {
        match uuid {
            Some(uuid) => h.push(uuid, *status),
            None => h.controller.on_current_song(None),
        }
        assert!(h.live() <= 1, "more than one live player after {uuid:?}");
    }

    assert_eq!(h.shared.lock().max_live, 1);
    // A, B, C, D, E, F
    assert_eq!(h.creates(), 6);

    h.controller.teardown();
    assert_eq!(h.live(), 0);
}

#[test]
fn test_repeated_push_is_a_noop() {
    let mut h = Harness::new();
    h.push("A", Status::Success);
    let before = h.calls();
    h.push("A", Status::Success);
    assert_eq!(h.calls(), before);
    assert_eq!(h.controller.instance(), Some(InstanceId(1)));
}

#[test]
fn test_key_pushed_before_success_applied_once_track_exists() {
    let mut h = Harness::new();
    h.controller.on_key_change(KeyOffset(-1));
    h.push("A", Status::InProgress);
    h.push("A", Status::Success);

    let id = h.controller.instance().unwrap();
    // Pas encore de pistes : aucune sélection
    assert!(!h.calls().iter().any(|call| matches!(call, Call::SetTrack(..))));

    h.load(id);
    assert!(h.calls().contains(&Call::SetTrack(id, 3)));
}

#[test]
fn test_key_change_on_live_instance_and_unmapped_track() {
    let mut h = Harness::with_settings(|mut settings| {
        settings.key_tracks = KeyTrackMap::Offset { base: 2 };
        settings
    });
    h.push("A", Status::Success);
    let id = h.controller.instance().unwrap();
    h.load(id);

    h.controller.on_key_change(KeyOffset(3));
    assert!(h.calls().contains(&Call::SetTrack(id, 5)));

    // 2 + 6 = 8 : piste absente, ignorée sans erreur
    let before = h.calls();
    h.controller.on_key_change(KeyOffset(6));
    assert_eq!(h.calls(), before);
}

#[test]
fn test_toggle_drives_play_and_pause() {
    let mut h = Harness::new();
    h.push("A", Status::Success);
    let id = h.controller.instance().unwrap();

    h.controller.on_playback(false);
    h.controller.on_playback(true);
    let calls = h.calls();
    assert_eq!(&calls[calls.len() - 2..], &[Call::Pause(id), Call::Play(id)]);
}

#[test]
fn test_toggle_without_song_is_a_noop() {
    let mut h = Harness::new();
    h.controller.on_playback(false);
    assert!(h.calls().is_empty());
    assert_eq!(h.controller.phase(), PlayerPhase::Idle);

    // Le dernier état est tout de même utilisé à la création suivante
    h.push("A", Status::Success);
    let id = h.controller.instance().unwrap();
    let calls = h.calls();
    assert!(calls.contains(&Call::Initialize(
        id,
        "http://karaoke.local:8000/dash/A/A.mpd".to_string(),
        false
    )));
    assert_eq!(calls.last(), Some(&Call::Pause(id)));
}

#[test]
fn test_stale_ended_does_not_advance_twice() {
    let mut h = Harness::new();
    h.push("A", Status::Success);
    let first = h.controller.instance().unwrap();

    h.event(first, PlayerEventKind::Ended);
    h.event(first, PlayerEventKind::Ended);
    assert_eq!(h.advances(), 1);

    h.push("B", Status::Success);
    let second = h.controller.instance().unwrap();
    assert_ne!(first, second);

    h.event(first, PlayerEventKind::Ended);
    assert_eq!(h.advances(), 1);

    h.event(second, PlayerEventKind::Ended);
    assert_eq!(h.advances(), 2);
}

#[test]
fn test_prepare_then_switch_scenario() {
    let mut h = Harness::new();
    let view = h.controller.subscribe_view();

    h.push("A", Status::InProgress);
    assert_eq!(h.controller.phase(), PlayerPhase::Preparing);
    assert_eq!(h.creates(), 0);
    assert_eq!(view.borrow().phase, PlayerPhase::Preparing);

    h.push("A", Status::Success);
    assert_eq!(h.controller.phase(), PlayerPhase::Active);
    let a = h.controller.instance().unwrap();
    assert_eq!(
        h.calls()[..2],
        [
            Call::Create(a),
            Call::Initialize(a, "http://karaoke.local:8000/dash/A/A.mpd".to_string(), true),
        ]
    );

    h.push("B", Status::Success);
    let b = h.controller.instance().unwrap();
    let calls = h.calls();
    let destroy_a = calls.iter().position(|c| *c == Call::Destroy(a)).unwrap();
    let create_b = calls.iter().position(|c| *c == Call::Create(b)).unwrap();
    assert!(destroy_a < create_b);
    assert!(calls.contains(&Call::Initialize(
        b,
        "http://karaoke.local:8000/dash/B/B.mpd".to_string(),
        true
    )));

    // Rappels tardifs de A ignorés
    h.seek(a, 50.0, 100.0);
    h.event(a, PlayerEventKind::Error("decode".to_string()));
    assert_eq!(h.controller.progress(), 0.0);
    assert_eq!(h.controller.instance(), Some(b));

    let current = view.borrow();
    assert_eq!(current.phase, PlayerPhase::Active);
    assert_eq!(current.instance, Some(b));
    assert_eq!(current.song.as_ref().map(|s| s.uuid.as_str()), Some("B"));
}

#[test]
fn test_failed_and_cleared_songs() {
    let mut h = Harness::new();
    h.push("A", Status::Success);
    h.push("A", Status::Failed);
    assert_eq!(h.controller.phase(), PlayerPhase::Failed);
    assert_eq!(h.live(), 0);

    h.push("B", Status::Success);
    h.controller.on_current_song(None);
    assert_eq!(h.controller.phase(), PlayerPhase::Idle);
    assert_eq!(h.live(), 0);

    h.controller
        .on_current_song(Some(Song::new("  ", "blank", Status::Success)));
    assert_eq!(h.controller.phase(), PlayerPhase::Idle);
    assert_eq!(h.creates(), 2);
}

#[test]
fn test_progress_follows_time_updates() {
    let mut h = Harness::new();
    h.push("A", Status::Success);
    let id = h.controller.instance().unwrap();

    h.seek(id, 30.0, 120.0);
    assert_eq!(h.controller.progress(), 25.0);
    assert_eq!(h.controller.subscribe_view().borrow().progress, 25.0);

    // Durée inconnue : pas de pourcentage
    h.shared.lock().positions.remove(&id);
    h.event(id, PlayerEventKind::TimeUpdated);
    assert_eq!(h.controller.progress(), 0.0);
}

#[test]
fn test_engine_failure_retried_on_next_push() {
    let mut h = Harness::new();
    h.shared.lock().fail_create = true;
    h.push("A", Status::Success);
    assert_eq!(h.controller.phase(), PlayerPhase::Active);
    assert_eq!(h.controller.instance(), None);

    h.shared.lock().fail_create = false;
    h.push("A", Status::Success);
    assert!(h.controller.instance().is_some());
}

#[test]
fn test_drop_destroys_instance() {
    let mut h = Harness::new();
    h.push("A", Status::Success);
    let shared = Arc::clone(&h.shared);
    drop(h);
    assert!(shared.lock().live.is_empty());
}

#[tokio::test]
async fn test_run_loop_follows_cache() {
    let h = Harness::new();
    let Harness {
        controller,
        events,
        shared,
        advance,
    } = h;

    let cache = StateCache::new();
    cache.set(&keys::KEY_OFFSET, Some(KeyOffset(1))).unwrap();

    let mut view = controller.subscribe_view();
    let (binding, inputs) = bind_cache(&cache);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(controller.run(inputs, events, shutdown.clone()));

    cache
        .set(&keys::CURRENT_SONG, Some(Song::new("A", "Song A", Status::Success)))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while view.borrow_and_update().instance.is_none() {
            view.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let id = view.borrow().instance.unwrap();
    let sender = shared.lock().senders[0].clone();
    shared.lock().loaded.insert(id);
    sender
        .send(PlayerEvent::new(id, PlayerEventKind::StreamInitialized))
        .unwrap();
    sender
        .send(PlayerEvent::new(id, PlayerEventKind::Ended))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while advance.0.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(shared.lock().calls.contains(&Call::SetTrack(id, 5)));

    shutdown.cancel();
    task.await.unwrap();
    drop(binding);
    assert!(shared.lock().live.is_empty());
}

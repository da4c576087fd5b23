//! Display chrome: now playing, up next, QR banner and the error screen.
//!
//! Rendering is textual; every change of what the screen would show is
//! logged once.

use karaconfig::Config;
use karacontrol::{PlayerPhase, PlayerView};
use karaevents::{ConnectionState, QueueEntry, Song, keys, up_next};
use karastate::StateCache;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplaySettings {
    pub qr_code: Option<String>,
    pub up_next: usize,
}

impl DisplaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            qr_code: config.get_qr_code(),
            up_next: config.get_up_next_count(),
        }
    }
}

/// Line shown in the now-playing banner, `None` hides the banner.
pub fn now_playing_line(song: Option<&Song>) -> Option<String> {
    song.map(|song| format!("♪ {}", song.formatted_name))
}

/// "Up next" list: the first `count` queued songs, or `None`.
pub fn up_next_lines(queue: &[Song], count: usize) -> Vec<String> {
    let next = up_next(queue, count);
    if next.is_empty() {
        return vec!["None".to_string()];
    }
    next.iter()
        .enumerate()
        .map(|(i, song)| format!("{}. {}", i + 1, song.formatted_name))
        .collect()
}

pub fn phase_line(view: &PlayerView) -> String {
    match view.phase {
        PlayerPhase::Idle => "splash screen".to_string(),
        PlayerPhase::Preparing => "preparing song...".to_string(),
        PlayerPhase::Active => format!("playing ({:.0}%)", view.progress),
        PlayerPhase::Failed => "song could not be prepared".to_string(),
    }
}

enum Update {
    CurrentSong(Option<Song>),
    Queue(Option<QueueEntry>),
}

#[derive(Default)]
struct Screen {
    now_playing: Option<String>,
    up_next: Vec<String>,
    phase: Option<PlayerPhase>,
    error: bool,
}

impl Screen {
    fn show_now_playing(&mut self, song: Option<&Song>) {
        let line = now_playing_line(song);
        if line != self.now_playing {
            match &line {
                Some(line) => info!("🎤 Now playing: {}", line),
                None => info!("🎤 Nothing playing"),
            }
            self.now_playing = line;
        }
    }

    fn show_up_next(&mut self, queue: &[Song], count: usize) {
        let lines = up_next_lines(queue, count);
        if lines != self.up_next {
            info!("📋 Up next: {}", lines.join(" | "));
            self.up_next = lines;
        }
    }

    fn show_player(&mut self, view: &PlayerView) {
        if self.phase != Some(view.phase) {
            info!(phase = view.phase.as_str(), "🎬 Player: {}", phase_line(view));
            self.phase = Some(view.phase);
        } else {
            debug!(progress = view.progress, "player progress");
        }
    }

    fn show_connection(&mut self, state: &ConnectionState) {
        if state.has_given_up() && !self.error {
            if let ConnectionState::Error { message, .. } = state {
                error!("❌ Lost connection to the karaoke server: {}", message);
            }
            self.error = true;
        } else if state.is_open() && self.error {
            info!("✅ Connection to the karaoke server restored");
            self.error = false;
        }
    }
}

/// Follows the cache, the player and the connection until `shutdown`.
pub async fn run(
    settings: DisplaySettings,
    cache: StateCache,
    mut player: watch::Receiver<PlayerView>,
    mut connection: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
) {
    match &settings.qr_code {
        Some(code) => info!("🔗 QR banner: {}", code),
        None => info!("🔗 QR banner not configured"),
    }

    let (tx, mut updates) = mpsc::unbounded_channel();
    let song_tx = tx.clone();
    let _song = cache.subscribe_with_current(&keys::CURRENT_SONG, move |song| {
        let _ = song_tx.send(Update::CurrentSong(song.cloned()));
    });
    let _queue = cache.subscribe_with_current(&keys::QUEUE, move |queue| {
        let _ = tx.send(Update::Queue(queue.cloned()));
    });

    let mut screen = Screen::default();
    let mut following = true;
    screen.show_up_next(&[], settings.up_next);
    screen.show_player(&player.borrow_and_update());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(update) = updates.recv() => match update {
                Update::CurrentSong(song) => screen.show_now_playing(song.as_ref()),
                Update::Queue(queue) => {
                    screen.show_up_next(queue.as_deref().unwrap_or_default(), settings.up_next)
                }
            },
            changed = player.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = player.borrow_and_update().clone();
                screen.show_player(&view);
            }
            changed = connection.changed(), if following => {
                // Le client a terminé : l'état final reste affiché.
                following = changed.is_ok();
                let state = connection.borrow_and_update().clone();
                screen.show_connection(&state);
            }
        }
    }
    debug!("display stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use karaevents::Status;

    #[test]
    fn test_up_next_lines() {
        let queue = vec![
            Song::new("1", "ABBA - Waterloo (Official Video)", Status::Ready),
            Song::new("2", "Queen - Don't Stop Me Now", Status::InProgress),
            Song::new("3", "Toto - Africa", Status::InProgress),
        ];
        assert_eq!(
            up_next_lines(&queue, 2),
            vec!["1. ABBA - Waterloo", "2. Queen - Don't Stop Me Now"]
        );
        assert_eq!(up_next_lines(&[], 2), vec!["None"]);
    }

    #[test]
    fn test_now_playing_and_phase() {
        let song = Song::new("1", "Toto - Africa [HD]", Status::Success);
        assert_eq!(now_playing_line(Some(&song)).as_deref(), Some("♪ Toto - Africa"));
        assert_eq!(now_playing_line(None), None);

        let view = PlayerView {
            phase: PlayerPhase::Active,
            progress: 42.4,
            ..PlayerView::default()
        };
        assert_eq!(phase_line(&view), "playing (42%)");
    }

    #[test]
    fn test_error_screen_shown_until_reconnected() {
        let mut screen = Screen::default();
        screen.show_connection(&ConnectionState::Error {
            message: "refused".to_string(),
            retry_in: Some(std::time::Duration::from_millis(500)),
        });
        assert!(!screen.error);

        screen.show_connection(&ConnectionState::Error {
            message: "refused".to_string(),
            retry_in: None,
        });
        assert!(screen.error);
        screen.show_connection(&ConnectionState::Connecting);
        assert!(screen.error);

        screen.show_connection(&ConnectionState::Open);
        assert!(!screen.error);
    }
}

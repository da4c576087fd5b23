//! Data model shared with the queue server.

use serde::{Deserialize, Serialize};

/// Preparation status of a song on the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Being downloaded / transcoded.
    InProgress,
    /// Prepared, not yet selected as current.
    Ready,
    /// Fully available for playback.
    Success,
    /// Preparation failed.
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::InProgress => "InProgress",
            Status::Ready => "Ready",
            Status::Success => "Success",
            Status::Failed => "Failed",
        }
    }
}

/// Latest snapshot of a song, as pushed by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireSong")]
pub struct Song {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "formattedName")]
    pub formatted_name: String,
    pub status: Status,
}

// Forme reçue du serveur : formattedName est optionnel, les champs en plus
// (yt_link, ...) sont ignorés.
#[derive(Deserialize)]
struct WireSong {
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "formattedName", alias = "formatted_name")]
    formatted_name: Option<String>,
    status: Status,
}

impl From<WireSong> for Song {
    fn from(wire: WireSong) -> Self {
        let formatted_name = match wire.formatted_name {
            Some(formatted) if !formatted.trim().is_empty() => formatted,
            _ => format_song_name(&wire.name),
        };
        Song {
            uuid: wire.uuid,
            name: wire.name,
            formatted_name,
            status: wire.status,
        }
    }
}

impl Song {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, status: Status) -> Self {
        let name = name.into();
        Song {
            uuid: uuid.into(),
            formatted_name: format_song_name(&name),
            name,
            status,
        }
    }

    pub fn has_id(&self) -> bool {
        !self.uuid.trim().is_empty()
    }

    pub fn is_playable(&self) -> bool {
        self.status == Status::Success
    }
}

/// Upcoming songs in play order.
pub type QueueEntry = Vec<Song>;

/// The first `count` songs of the queue.
pub fn up_next(queue: &[Song], count: usize) -> &[Song] {
    &queue[..queue.len().min(count)]
}

/// Pitch shift in semitones selected on the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyOffset(pub i32);

impl std::fmt::Display for KeyOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

const NOISE_WORDS: &[&str] = &[
    "official", "video", "audio", "lyrics", "lyric", "karaoke", "hd", "4k", "mv",
];

/// Human-friendly display name.
///
/// Drops bracketed segments that only describe the upload, e.g.
/// `"Queen - Bohemian Rhapsody (Official Video) [HD]"` becomes
/// `"Queen - Bohemian Rhapsody"`, and collapses whitespace. Falls back to the
/// trimmed raw name when nothing is left.
pub fn format_song_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find(['(', '[']) {
        let close = if rest[start..].starts_with('(') { ')' } else { ']' };
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(close) {
            Some(end) => {
                if !is_noise(&after[..end]) {
                    out.push_str(&rest[start..start + end + 2]);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        raw.trim().to_string()
    } else {
        collapsed
    }
}

fn is_noise(segment: &str) -> bool {
    segment
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| NOISE_WORDS.iter().any(|noise| word.eq_ignore_ascii_case(noise)))
}

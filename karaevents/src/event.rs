//! Push messages and their routing into the state cache.
//!
//! Every frame is a JSON record `{ "type": <tag>, ...payload }`. Known tags
//! are routed to their cache key; unknown tags are ignored so that a newer
//! server can add events without breaking older displays.

use karastate::StateCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProtocolError;
use crate::keys;
use crate::model::{KeyOffset, QueueEntry, Song};

/// Tags understood by this client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventTag {
    CurrentSongUpdated,
    QueueUpdated,
    TogglePlayback,
    KeyChange,
}

impl EventTag {
    pub const ALL: [EventTag; 4] = [
        EventTag::CurrentSongUpdated,
        EventTag::QueueUpdated,
        EventTag::TogglePlayback,
        EventTag::KeyChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::CurrentSongUpdated => "CurrentSongUpdated",
            EventTag::QueueUpdated => "QueueUpdated",
            EventTag::TogglePlayback => "TogglePlayback",
            EventTag::KeyChange => "KeyChange",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|known| known.as_str() == tag)
    }

    /// Name of the cache key this tag writes to.
    pub fn cache_key(&self) -> &'static str {
        match self {
            EventTag::CurrentSongUpdated => keys::CURRENT_SONG.name(),
            EventTag::QueueUpdated => keys::QUEUE.name(),
            EventTag::TogglePlayback => keys::PLAYBACK.name(),
            EventTag::KeyChange => keys::KEY_OFFSET.name(),
        }
    }
}

/// A decoded push message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    CurrentSongUpdated {
        current_song: Option<Song>,
    },
    QueueUpdated {
        queue: Option<QueueEntry>,
    },
    /// Without payload the event flips the current toggle.
    TogglePlayback {
        #[serde(default, alias = "isPlaying", skip_serializing_if = "Option::is_none")]
        is_playing: Option<bool>,
    },
    KeyChange {
        #[serde(alias = "offset")]
        current_key: KeyOffset,
    },
}

impl ServerEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            ServerEvent::CurrentSongUpdated { .. } => EventTag::CurrentSongUpdated,
            ServerEvent::QueueUpdated { .. } => EventTag::QueueUpdated,
            ServerEvent::TogglePlayback { .. } => EventTag::TogglePlayback,
            ServerEvent::KeyChange { .. } => EventTag::KeyChange,
        }
    }

    /// Writes the payload to the cache key registered for the tag.
    ///
    /// Returns the sequence number of the write.
    pub fn publish(self, cache: &StateCache) -> karastate::Result<u64> {
        match self {
            ServerEvent::CurrentSongUpdated { current_song } => {
                cache.set(&keys::CURRENT_SONG, current_song)
            }
            ServerEvent::QueueUpdated { queue } => cache.set(&keys::QUEUE, queue),
            ServerEvent::TogglePlayback {
                is_playing: Some(playing),
            } => cache.set(&keys::PLAYBACK, Some(playing)),
            // Le lecteur démarre en autoplay : sans valeur connue on part de `true`.
            ServerEvent::TogglePlayback { is_playing: None } => {
                cache.update(&keys::PLAYBACK, |current| {
                    Some(!current.copied().unwrap_or(true))
                })
            }
            ServerEvent::KeyChange { current_key } => {
                cache.set(&keys::KEY_OFFSET, Some(current_key))
            }
        }
    }
}

/// Decodes one frame payload.
///
/// `Ok(None)` means the tag is unknown and the frame must be ignored.
pub fn parse_event(data: &str) -> Result<Option<ServerEvent>, ProtocolError> {
    let raw: Value = serde_json::from_str(data).map_err(ProtocolError::Unparseable)?;
    let tag = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingTag)?;

    let Some(tag) = EventTag::from_tag(tag) else {
        debug!(tag, "ignoring push event with unknown tag");
        return Ok(None);
    };

    serde_json::from_value(raw)
        .map(Some)
        .map_err(|source| ProtocolError::Malformed {
            tag: tag.as_str(),
            source,
        })
}

//! Cache keys for the facts pushed by the server.
//!
//! One key per push tag; names mirror the tag so logs read naturally.

use karastate::CacheKey;

use crate::model::{KeyOffset, QueueEntry, Song};

/// Current song; an explicit null means "nothing playing".
pub const CURRENT_SONG: CacheKey<Song> = CacheKey::new("sse/CurrentSongUpdated");

pub const QUEUE: CacheKey<QueueEntry> = CacheKey::new("sse/QueueUpdated");

/// `true` while playback should run.
pub const PLAYBACK: CacheKey<bool> = CacheKey::new("sse/TogglePlayback");

pub const KEY_OFFSET: CacheKey<KeyOffset> = CacheKey::new("sse/KeyChange");

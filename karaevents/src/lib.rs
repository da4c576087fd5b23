//! # karaevents
//!
//! Data model of the karaoke queue server and the client of its push channel.
//!
//! - [`model`] : `Song`, `Status`, `QueueEntry`, `KeyOffset`
//! - [`event`] : tagged push messages and their routing to cache keys
//! - [`sse`] : `text/event-stream` framing
//! - [`client`] : the long-lived connection with bounded reconnect
//! - [`keys`] : cache keys written by the client
//!
//! ```no_run
//! use karaevents::{EventStreamClient, StreamSettings};
//! use karastate::StateCache;
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = StateCache::new();
//! let server = Url::parse("http://192.168.1.20:8000")?;
//! let client = EventStreamClient::new(cache.clone(), StreamSettings::new(&server, "/sse")?)?;
//! let mut state = client.subscribe_state();
//! tokio::spawn(client.run(CancellationToken::new()));
//! state.changed().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod event;
pub mod keys;
pub mod model;
pub mod sse;

pub use client::{
    ConnectionState, DEFAULT_EVENTS_PATH, EventStreamClient, ReconnectPolicy, StreamSettings,
    dispatch_frame,
};
pub use error::{EventStreamError, ProtocolError, Result};
pub use event::{EventTag, ServerEvent, parse_event};
pub use model::{KeyOffset, QueueEntry, Song, Status, format_song_name, up_next};
pub use sse::{SseDecoder, SseFrame};

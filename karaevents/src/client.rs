//! Event Stream Client
//!
//! Keeps one long-lived `GET /sse` connection to the queue server and
//! republishes every push message into the [`StateCache`].
//!
//! Connection lifecycle, observable through [`EventStreamClient::subscribe_state`]:
//!
//! ```text
//! Connecting ──► Open ──► Error { retry_in: Some(d) } ──► Connecting ...
//!      │                          │
//!      └──────────────────────────┴──► Error { retry_in: None }   (attempts exhausted)
//!                                 any ──► Closed                  (shutdown)
//! ```
//!
//! The cache is never reset when the connection drops: consumers keep the
//! last known values, and entries never received stay absent ("unknown").

use std::io;
use std::pin::pin;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use karastate::StateCache;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{EventStreamError, Result};
use crate::event::{EventTag, parse_event};
use crate::sse::{SseDecoder, SseFrame};

/// Default path of the push endpoint.
pub const DEFAULT_EVENTS_PATH: &str = "/sse";

/// Default inactivity timeout; the server sends keep-alives well below it.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 45;

/// A session open at least this long counts as healthy even without frames.
pub const DEFAULT_STABLE_AFTER_SECS: u64 = 10;

/// Default timeout for establishing the TCP/TLS connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// `retry_in == None` means the client gave up.
    Error {
        message: String,
        retry_in: Option<Duration>,
    },
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn has_given_up(&self) -> bool {
        matches!(self, ConnectionState::Error { retry_in: None, .. })
    }
}

/// Bounded exponential backoff.
///
/// The delay doubles with every consecutive failed attempt and is capped at
/// `max_delay`. Only a healthy session resets the attempt count: one that
/// delivered at least one frame, or stayed open for `stable_after`. A server
/// that accepts the request and closes the body at once keeps counting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever (still with backoff).
    pub max_attempts: Option<u32>,
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            stable_after: Duration::from_secs(DEFAULT_STABLE_AFTER_SECS),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay.saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_delay))
    }
}

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl StreamSettings {
    /// Settings for `{server}{path}` with default timeouts and policy.
    pub fn new(server: &Url, path: &str) -> Result<Self> {
        Ok(Self {
            url: server.join(path)?,
            reconnect: ReconnectPolicy::default(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        })
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }
}

pub struct EventStreamClient {
    http: Client,
    settings: StreamSettings,
    cache: StateCache,
    state_tx: watch::Sender<ConnectionState>,
}

impl EventStreamClient {
    pub fn new(cache: StateCache, settings: StreamSettings) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()?;
        Ok(Self::with_client(http, cache, settings))
    }

    /// Client sharing an existing connection pool.
    pub fn with_client(http: Client, cache: StateCache, settings: StreamSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            http,
            settings,
            cache,
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Runs until `shutdown` fires or reconnect attempts are exhausted.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);

            let (healthy, cause) = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.session() => outcome,
            };

            if healthy {
                attempt = 0;
            }
            attempt += 1;

            let retry_in = self.settings.reconnect.delay_for(attempt);
            self.set_state(ConnectionState::Error {
                message: cause.to_string(),
                retry_in,
            });

            let Some(delay) = retry_in else {
                error!(
                    url = %self.settings.url,
                    error = %cause,
                    attempts = attempt - 1,
                    "event stream unavailable, giving up"
                );
                return;
            };

            warn!(error = %cause, attempt, ?delay, "event stream interrupted, reconnecting");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!("event stream closed");
        self.set_state(ConnectionState::Closed);
    }

    /// One connection, from request to end of body.
    ///
    /// Returns whether the session was healthy, and why it ended.
    async fn session(&self) -> (bool, EventStreamError) {
        let response = match self.connect().await {
            Ok(response) => response,
            Err(err) => return (false, err),
        };

        info!(url = %self.settings.url, "event stream open");
        self.set_state(ConnectionState::Open);
        let opened_at = Instant::now();
        let mut received: u64 = 0;

        let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let mut frames = pin!(FramedRead::new(body, SseDecoder::default()));

        let cause = loop {
            match timeout(self.settings.idle_timeout, frames.next()).await {
                Err(_) => break EventStreamError::Idle(self.settings.idle_timeout),
                Ok(None) => break EventStreamError::Closed,
                Ok(Some(Err(err))) => break err,
                Ok(Some(Ok(frame))) => {
                    received += 1;
                    dispatch_frame(&self.cache, &frame);
                }
            }
        };

        let healthy =
            received > 0 || opened_at.elapsed() >= self.settings.reconnect.stable_after;
        if !healthy {
            debug!(error = %cause, "event stream closed before delivering anything");
        }
        (healthy, cause)
    }

    async fn connect(&self) -> Result<Response> {
        debug!(url = %self.settings.url, "connecting event stream");
        let response = self
            .http
            .get(self.settings.url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EventStreamError::Status(status.as_u16()));
        }
        Ok(response)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Applies one frame to the cache.
///
/// Returns the tag that was applied, `None` when the frame was ignored or
/// dropped.
pub fn dispatch_frame(cache: &StateCache, frame: &SseFrame) -> Option<EventTag> {
    if let Some(name) = &frame.event {
        trace!(event = %name, "named SSE event, routing on payload tag");
    }

    match parse_event(&frame.data) {
        Ok(Some(event)) => {
            let tag = event.tag();
            match event.publish(cache) {
                Ok(seq) => {
                    debug!(tag = tag.as_str(), key = tag.cache_key(), seq, "push event applied");
                    Some(tag)
                }
                Err(err) => {
                    warn!(tag = tag.as_str(), error = %err, "push event rejected by cache");
                    None
                }
            }
        }
        Ok(None) => None,
        Err(err) => {
            warn!(error = %err, "dropping push frame");
            None
        }
    }
}

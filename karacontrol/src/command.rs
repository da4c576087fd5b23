//! Command client for the queue server.
//!
//! Commands are plain request/response calls. Their effects come back through
//! the push channel, except for the "queue empty" answer of `play_next`, which
//! the server does not push and which is therefore written to the cache here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use karaevents::{KeyOffset, Song, keys};
use karastate::StateCache;
use reqwest::{Client, Response, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::controller::AdvanceRequester;
use crate::error::{CommandError, Result};

/// Default timeout for command requests
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Tries of `play_next` made by [`CommandAdvance`] before giving up.
pub const DEFAULT_ADVANCE_ATTEMPTS: u32 = 3;
/// Delay before the first retry; doubles after each failure.
pub const DEFAULT_ADVANCE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of a successful `play_next`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Accepted; the new current song will arrive on the push channel.
    Requested,
    /// Nothing left to play; the current song was cleared locally.
    QueueEmpty,
}

#[derive(Clone, Debug)]
pub struct CommandClient {
    http: Client,
    server: Url,
    cache: StateCache,
    request_timeout: Duration,
}

impl CommandClient {
    pub fn new(server: Url, cache: StateCache) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(http, server, cache))
    }

    /// Client sharing an existing connection pool.
    pub fn with_client(http: Client, server: Url, cache: StateCache) -> Self {
        Self {
            http,
            server,
            cache,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        if self.server.path().ends_with('/') {
            return Ok(self.server.join(path)?);
        }
        let mut base = self.server.clone();
        base.set_path(&format!("{}/", self.server.path()));
        Ok(base.join(path)?)
    }

    /// `POST /play_next`.
    ///
    /// On `204 No Content` the current song is cleared in the cache (explicit
    /// null, distinct from "never received"). Errors leave the cache untouched.
    ///
    /// ```no_run
    /// # use karacontrol::{Advance, CommandClient};
    /// # use karastate::StateCache;
    /// # tokio_test::block_on(async {
    /// let server = url::Url::parse("http://192.168.1.20:8000").unwrap();
    /// let commands = CommandClient::new(server, StateCache::new()).unwrap();
    /// if commands.advance_to_next_song().await.unwrap() == Advance::QueueEmpty {
    ///     println!("nothing left to sing");
    /// }
    /// # });
    /// ```
    pub async fn advance_to_next_song(&self) -> Result<Advance> {
        let url = self.endpoint("play_next")?;
        debug!(%url, "requesting next song");

        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                info!("queue is empty, clearing current song");
                if let Err(err) = self.cache.clear(&keys::CURRENT_SONG) {
                    warn!(error = %err, "cannot clear current song");
                }
                Ok(Advance::QueueEmpty)
            }
            status if status.is_success() => Ok(Advance::Requested),
            status => Err(CommandError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// `GET /current_song`; `None` when the server answers 204.
    pub async fn fetch_current_song(&self) -> Result<Option<Song>> {
        let response = self.get("current_song").await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// `GET /get_key`.
    pub async fn fetch_key(&self) -> Result<KeyOffset> {
        let body = self.get("get_key").await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Seeds the cache with the server's current song and key offset.
    ///
    /// Values already received on the push channel win. Failures are only
    /// logged: the push channel stays the authority.
    pub async fn hydrate(&self) {
        match self.fetch_current_song().await {
            Ok(song) => {
                let label = song.as_ref().map(|s| s.formatted_name.clone());
                match self.cache.set_if_absent(&keys::CURRENT_SONG, song) {
                    Ok(true) => info!(song = ?label, "current song hydrated"),
                    Ok(false) => debug!("current song already pushed, hydration skipped"),
                    Err(err) => warn!(error = %err, "cannot hydrate current song"),
                }
            }
            Err(err) => warn!(error = %err, "cannot fetch current song"),
        }

        match self.fetch_key().await {
            Ok(key) => match self.cache.set_if_absent(&keys::KEY_OFFSET, Some(key)) {
                Ok(true) => info!(%key, "key offset hydrated"),
                Ok(false) => debug!("key offset already pushed, hydration skipped"),
                Err(err) => warn!(error = %err, "cannot hydrate key offset"),
            },
            Err(err) => warn!(error = %err, "cannot fetch key offset"),
        }
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CommandError::UnexpectedStatus(status.as_u16()));
        }
        Ok(response)
    }
}

/// Advances the queue on behalf of the player controller.
///
/// Each request runs on its own tokio task; a request made while another one
/// is still in flight is dropped. Transient failures are retried with a
/// doubling delay.
#[derive(Clone, Debug)]
pub struct CommandAdvance {
    client: CommandClient,
    in_flight: Arc<AtomicBool>,
    attempts: u32,
    retry_delay: Duration,
}

impl CommandAdvance {
    pub fn new(client: CommandClient) -> Self {
        Self {
            client,
            in_flight: Arc::new(AtomicBool::new(false)),
            attempts: DEFAULT_ADVANCE_ATTEMPTS,
            retry_delay: DEFAULT_ADVANCE_RETRY_DELAY,
        }
    }

    /// Network errors and 5xx answers are retried up to `attempts` tries in
    /// total, waiting `delay` then twice as long after each failure.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }
}

fn is_transient(err: &CommandError) -> bool {
    match err {
        CommandError::Network(_) => true,
        CommandError::UnexpectedStatus(status) => *status >= 500,
        _ => false,
    }
}

async fn advance_with_retry(client: &CommandClient, attempts: u32, mut delay: Duration) {
    for attempt in 1..=attempts {
        match client.advance_to_next_song().await {
            Ok(Advance::Requested) => {
                info!("next song requested");
                return;
            }
            Ok(Advance::QueueEmpty) => {
                info!("no next song");
                return;
            }
            Err(err) if attempt < attempts && is_transient(&err) => {
                warn!(error = %err, attempt, ?delay, "cannot advance to next song, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => {
                error!(error = %err, attempt, "cannot advance to next song, giving up");
                return;
            }
        }
    }
}

impl AdvanceRequester for CommandAdvance {
    fn request_advance(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, cannot request next song");
            return;
        };
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("next song already requested");
            return;
        }

        let client = self.client.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let (attempts, delay) = (self.attempts, self.retry_delay);
        runtime.spawn(async move {
            advance_with_retry(&client, attempts, delay).await;
            in_flight.store(false, Ordering::Release);
        });
    }
}

/// Message-to-playback dispatch.
///
/// The `Dispatcher` owns the playback session and the URL cache. It is driven
/// one message at a time, so two player processes never overlap.
use std::future::Future;

use tracing::{debug, error, info, warn};

use crate::{
    broker::Backoff,
    cache::{FallbackFetcher, PlaylistCache},
    error::{DaemonError, Result},
    models,
    player::Player,
};

// ── Message source ────────────────────────────────────────────────────────────

/// A delivered message awaiting ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

pub trait Inbox {
    /// Next message; `None` once the consumer is closed.
    async fn recv(&mut self) -> Option<Result<Envelope>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    /// Drop the message without requeueing it.
    async fn reject(&mut self, delivery_tag: u64) -> Result<()>;
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher<P> {
    player: P,
    cache: PlaylistCache,
}

impl<P: Player> Dispatcher<P> {
    pub fn new(player: P, cache: PlaylistCache) -> Self {
        Self { player, cache }
    }

    /// Play the cached (or fallback) playlist. Called once, before consuming.
    pub async fn start<F: FallbackFetcher>(&mut self, fetcher: &F) -> String {
        let url = self.cache.resolve_startup_url(fetcher).await;
        self.play(&url).await;
        url
    }

    /// Open an inbox with `connect`, retrying with `backoff`. The last known
    /// playlist is kept playing between attempts, so an unreachable broker
    /// never means silence. Config and TLS errors are not retried.
    pub async fn connect<I, C, Fut>(&mut self, backoff: &mut Backoff, mut connect: C) -> Result<I>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<I>>,
    {
        loop {
            self.ensure_playing().await;

            match connect().await {
                Ok(inbox) => {
                    if backoff.attempt() > 0 {
                        info!("connected after {} retries", backoff.attempt());
                    }
                    backoff.reset();
                    return Ok(inbox);
                }
                Err(e @ (DaemonError::InsecureBroker { .. } | DaemonError::Config(_))) => {
                    return Err(e);
                }
                Err(e) => warn!("amqp connection failed: {e}"),
            }

            let Some(delay) = backoff.next_delay() else {
                return Err(DaemonError::ReconnectExhausted(backoff.max_retries()));
            };
            warn!(
                "reconnecting in {}s (attempt {}/{})",
                delay.as_secs(),
                backoff.attempt(),
                backoff.max_retries()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Restart the last known playlist if the player is not running.
    pub async fn ensure_playing(&mut self) {
        if self.player.current().is_some() {
            return;
        }
        let url = self.cache.last_known_url().await;
        warn!("nothing playing, falling back to {url}");
        self.play(&url).await;
    }

    /// Consume `inbox` until it closes. Returns `Ok(())` when the consumer
    /// stream ends and `Err` on a broker failure; both mean the connection
    /// needs to be re-established.
    pub async fn run<I: Inbox>(&mut self, inbox: &mut I) -> Result<()> {
        while let Some(next) = inbox.recv().await {
            let envelope = next?;
            self.handle(inbox, envelope).await?;
        }
        Ok(())
    }

    async fn handle<I: Inbox>(&mut self, inbox: &mut I, envelope: Envelope) -> Result<()> {
        let tag = envelope.delivery_tag;
        debug!("msgid {tag}: got message");

        let url = match models::parse_play_command(&envelope.body) {
            Ok(url) => url,
            Err(e) => {
                error!("msgid {tag}: discarding message: {e}");
                return inbox.reject(tag).await;
            }
        };

        info!("msgid {tag}: new playlist URL {url}");
        if let Err(e) = self.cache.store(&url).await {
            warn!("msgid {tag}: {e}");
        }
        inbox.ack(tag).await?;
        self.play(&url).await;
        Ok(())
    }

    /// Failures are logged; the session stays empty until the next command.
    async fn play(&mut self, url: &str) {
        if let Err(e) = self.player.play(url).await {
            error!("{e}");
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(url) = self.player.current() {
            info!("stopping playback of {url}");
        }
        self.player.stop().await;
    }

    #[cfg(test)]
    pub fn player(&self) -> &P {
        &self.player
    }
}

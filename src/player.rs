/// Wrapper around the external media player.
///
/// At most one player process runs at a time. Starting a new URL kills and
/// reaps the previous process first.
use std::{process::Stdio, time::Duration};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{DaemonError, Result},
};

pub trait Player {
    /// Stop whatever is playing, then start playing `url`.
    async fn play(&mut self, url: &str) -> Result<()>;

    /// Stop the current player process, if any.
    async fn stop(&mut self);

    /// URL of the live playback session, if the player is still running.
    fn current(&mut self) -> Option<&str>;
}

// ── Playback session ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct PlaybackSession {
    url: String,
    child: Child,
}

// ── mpv ───────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MpvPlayer {
    path: String,
    args: Vec<String>,
    startup_timeout: Duration,
    session: Option<PlaybackSession>,
}

impl MpvPlayer {
    pub fn new(path: impl Into<String>, args: Vec<String>, startup_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            args,
            startup_timeout,
            session: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.player_path.clone(),
            config.player_args.clone(),
            config.startup_timeout(),
        )
    }
}

impl Player for MpvPlayer {
    async fn play(&mut self, url: &str) -> Result<()> {
        self.stop().await;

        let mut cmd = Command::new(&self.path);
        cmd.args(&self.args)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!("run {} {} {url}", self.path, self.args.join(" "));
        let mut child = cmd
            .spawn()
            .map_err(|e| DaemonError::Playback(format!("spawn {}: {e}", self.path)))?;

        // A player that survives the startup window is assumed to be playing.
        let early_exit = tokio::time::timeout(self.startup_timeout, child.wait()).await;
        match early_exit {
            Err(_elapsed) => {
                self.session = Some(PlaybackSession {
                    url: url.to_string(),
                    child,
                });
                Ok(())
            }
            Ok(Ok(status)) => Err(DaemonError::Playback(format!(
                "player dead after {}s ({status}), assuming failure for {url}",
                self.startup_timeout.as_secs_f32()
            ))),
            Ok(Err(e)) => Err(DaemonError::Playback(format!("wait for player: {e}"))),
        }
    }

    async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.child.start_kill() {
            // Already exited on its own; still reap it below.
            debug!("kill player for {}: {e}", session.url);
        }
        match session.child.wait().await {
            Ok(status) => info!("stopped player for {} ({status})", session.url),
            Err(e) => warn!("could not reap player for {}: {e}", session.url),
        }
    }

    fn current(&mut self) -> Option<&str> {
        let exited = match self.session.as_mut() {
            None => return None,
            Some(session) => match session.child.try_wait() {
                Ok(None) => false,
                Ok(Some(status)) => {
                    warn!("player for {} exited ({status})", session.url);
                    true
                }
                Err(e) => {
                    warn!("player for {} is unreachable: {e}", session.url);
                    true
                }
            },
        };
        if exited {
            self.session = None;
        }
        self.session.as_ref().map(|s| s.url.as_str())
    }
}

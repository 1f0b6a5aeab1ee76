/// Persisted last-known-good playlist URL.
///
/// The cache file holds `{"playlisturl": "..."}`. It is read once at startup
/// and rewritten whenever a new URL is accepted or the remote fallback
/// playlist has been confirmed reachable.
use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    error::{DaemonError, Result},
    models::{self, PlaylistPayload},
};

// ── Remote fallback probe ─────────────────────────────────────────────────────

pub trait FallbackFetcher {
    /// Fetch the fallback playlist and return the URL it resolved to.
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Probes the fallback playlist over HTTP. Only the response head is read;
/// the final URL after redirects is what gets cached.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rpimusicd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

impl FallbackFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        Ok(resp.url().to_string())
    }
}

// ── Cache file ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PlaylistCache {
    path: PathBuf,
    fallback_url: String,
}

impl PlaylistCache {
    pub fn new(path: PathBuf, fallback_url: String) -> Self {
        Self { path, fallback_url }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Read the cached URL. A missing or corrupt file counts as empty.
    pub async fn load(&self) -> Option<String> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No cached URL at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Could not read URL cache {}: {e}", self.path.display());
                return None;
            }
        };

        let payload = match serde_json::from_str::<PlaylistPayload>(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!("Ignoring corrupt URL cache {}: {e}", self.path.display());
                return None;
            }
        };

        match models::validate_url(&payload.playlisturl) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Ignoring cached URL in {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Cached URL, or the configured fallback when there is none.
    pub async fn last_known_url(&self) -> String {
        match self.load().await {
            Some(url) => url,
            None => self.fallback_url.clone(),
        }
    }

    /// Overwrite the cache file with `url`.
    pub async fn store(&self, url: &str) -> Result<()> {
        if let Some(parent) = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DaemonError::Cache(format!("create {}: {e}", parent.display())))?;
        }

        let body = serde_json::to_string(&PlaylistPayload {
            playlisturl: url.to_string(),
        })
        .map_err(|e| DaemonError::Cache(format!("encode cache entry: {e}")))?;

        // Write beside the target and rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| DaemonError::Cache(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DaemonError::Cache(format!("replace {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Pick the URL to play before any message arrives.
    ///
    /// The cached URL wins. Without one, the remote fallback playlist is
    /// probed; if it answers, the resolved URL is cached first and then
    /// returned. If it doesn't, the configured fallback URL is returned as is.
    pub async fn resolve_startup_url<F: FallbackFetcher>(&self, fetcher: &F) -> String {
        if let Some(url) = self.load().await {
            info!("Restored last URL: {url}");
            return url;
        }

        info!("Fetching fallback playlist {}", self.fallback_url);
        match fetcher.fetch(&self.fallback_url).await {
            Ok(resolved) => {
                if let Err(e) = self.store(&resolved).await {
                    warn!("Fallback playlist fetched but not cached: {e}");
                }
                resolved
            }
            Err(e) => {
                warn!("Fallback playlist unreachable, using it uncached: {e:#}");
                self.fallback_url.clone()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    pub(crate) fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("rpimusicd-{tag}-{}", uuid::Uuid::new_v4()))
            .join("url.json")
    }

    /// Answers every fetch with a fixed result and records the URLs asked for.
    pub(crate) struct StaticFetcher {
        pub result: std::result::Result<String, String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub(crate) fn ok(url: &str) -> Self {
            Self {
                result: Ok(url.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                result: Err("connection refused".to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl FallbackFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push(url.to_string());
            self.result.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn cache(path: PathBuf) -> PlaylistCache {
        PlaylistCache::new(path, "http://radio.example/fallback.m3u".into())
    }

    #[tokio::test]
    async fn last_known_url_prefers_cache_over_fallback() {
        let cache = cache(temp_path("last-known"));
        assert_eq!(
            cache.last_known_url().await,
            "http://radio.example/fallback.m3u"
        );
        cache.store("http://radio.example/picked.m3u").await.unwrap();
        assert_eq!(
            cache.last_known_url().await,
            "http://radio.example/picked.m3u"
        );
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        assert_eq!(cache(temp_path("missing")).load().await, None);
    }

    #[tokio::test]
    async fn store_then_load() {
        let cache = cache(temp_path("store"));
        cache.store("http://radio.example/a.m3u").await.unwrap();
        cache.store("http://radio.example/b.m3u").await.unwrap();
        assert_eq!(
            cache.load().await.as_deref(),
            Some("http://radio.example/b.m3u")
        );

        let raw = std::fs::read_to_string(cache.path()).unwrap();
        let payload: PlaylistPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(payload.playlisturl, "http://radio.example/b.m3u");
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(cache(path).load().await, None);
    }

    #[tokio::test]
    async fn cached_url_wins_without_fetching() {
        let cache = cache(temp_path("cached"));
        cache.store("http://radio.example/last.m3u").await.unwrap();
        let fetcher = StaticFetcher::ok("http://radio.example/fresh.m3u");

        let url = cache.resolve_startup_url(&fetcher).await;

        assert_eq!(url, "http://radio.example/last.m3u");
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetched_fallback_is_cached_before_use() {
        let cache = cache(temp_path("fetched"));
        let fetcher = StaticFetcher::ok("https://cdn.example/fallback.m3u");

        let url = cache.resolve_startup_url(&fetcher).await;

        assert_eq!(url, "https://cdn.example/fallback.m3u");
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec!["http://radio.example/fallback.m3u".to_string()]
        );
        assert_eq!(cache.load().await.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn unreachable_fallback_is_used_uncached() {
        let cache = cache(temp_path("unreachable"));
        let url = cache.resolve_startup_url(&StaticFetcher::failing()).await;

        assert_eq!(url, "http://radio.example/fallback.m3u");
        assert_eq!(cache.load().await, None);
    }
}

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

// ── Queue / exchange identity ─────────────────────────────────────────────────

/// Direct exchange every instance binds its queue to.
pub const EXCHANGE: &str = "Xall";

pub const QUEUE_PREFIX: &str = "RPiMusic_";

/// Routing key that reaches every instance bound to the exchange.
pub const BROADCAST_ROUTING_KEY: &str = "RPiMusic_All";

/// Queue name for an instance. The UUID is used verbatim.
pub fn queue_name(uuid: &str) -> String {
    format!("{QUEUE_PREFIX}{uuid}")
}

// ── Wire payloads ─────────────────────────────────────────────────────────────

/// Body of a play command, and the on-disk layout of the URL cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistPayload {
    pub playlisturl: String,
}

/// Extract the playlist URL from a message body.
///
/// Publishers send `{"playlisturl": "..."}`; a bare URL in the body is
/// accepted as well.
pub fn parse_play_command(body: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(body)
        .map_err(|e| DaemonError::Message(format!("body is not UTF-8: {e}")))?
        .trim();

    if text.is_empty() {
        return Err(DaemonError::Message("empty body".into()));
    }

    let candidate = if text.starts_with('{') {
        serde_json::from_str::<PlaylistPayload>(text)
            .map_err(|e| DaemonError::Message(format!("invalid JSON payload: {e}")))?
            .playlisturl
    } else {
        text.to_string()
    };

    validate_url(&candidate).map_err(DaemonError::Message)
}

/// Accept absolute URLs only; `"hello"` or `"/radio.m3u"` are rejected.
pub fn validate_url(raw: &str) -> std::result::Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty URL".into());
    }
    let url = Url::parse(raw).map_err(|e| format!("not a URL ({e}): {raw:?}"))?;
    if url.cannot_be_a_base() {
        return Err(format!("not a playable URL: {raw:?}"));
    }
    Ok(raw.to_string())
}

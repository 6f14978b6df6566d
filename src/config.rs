//! Client configuration file parser.
//!
//! Parses a flat `key = value` file. Lines starting with `#` are comments,
//! unknown keys are ignored and unparsable numbers keep their default.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::auth::Credentials;
use crate::error::{LinkError, Result};

// Default constants (milliseconds unless noted)
const BASE_DELAY_MS:         u64 = 1_000;
const MAX_DELAY_MS:          u64 = 30_000;
const JITTER_FACTOR:         f64 = 0.3;
const MAX_ATTEMPTS:          u32 = 10;
const HEARTBEAT_INTERVAL_MS: u64 = 25_000;
const HEARTBEAT_TIMEOUT_MS:  u64 = 10_000;
const HANDSHAKE_TIMEOUT_MS:  u64 = 10_000;
const QUEUE_CAPACITY:        usize = 100;

/// Tuning knobs for one [`ConnectionManager`](crate::link::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    /// First reconnect delay; doubled per attempt.
    pub base_delay: Duration,
    /// Upper bound for the un-jittered reconnect delay.
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.3 = up to +30%).
    pub jitter_factor: f64,
    /// Automatic retries before the link goes terminal.
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Outbound messages buffered while not open.
    pub queue_capacity: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            base_delay:         Duration::from_millis(BASE_DELAY_MS),
            max_delay:          Duration::from_millis(MAX_DELAY_MS),
            jitter_factor:      JITTER_FACTOR,
            max_attempts:       MAX_ATTEMPTS,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout:  Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            handshake_timeout:  Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            queue_capacity:     QUEUE_CAPACITY,
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    // ── Endpoints ─────────────────────────────────────────────────────────────
    /// Chat transport URL (e.g. `wss://events.example.com/ws/chat`).
    pub ws_url: Option<String>,
    /// Live-update channel URL; disabled when absent.
    pub live_url: Option<String>,
    /// Base URL of the HTTP API serving chat history.
    pub history_url: Option<String>,
    // ── Credentials ───────────────────────────────────────────────────────────
    pub auth_token:     Option<String>,
    pub session_cookie: Option<String>,
    // ── Behaviour ─────────────────────────────────────────────────────────────
    /// Connect immediately on startup.
    pub auto_connect: bool,
    pub link: LinkSettings,
}

impl ClientConfig {
    /// Credentials to attach at connect time. A bearer token wins over a cookie.
    pub fn credentials(&self) -> Credentials {
        match (&self.auth_token, &self.session_cookie) {
            (Some(t), _)    => Credentials::Bearer(t.clone()),
            (None, Some(c)) => Credentials::SessionCookie(c.clone()),
            (None, None)    => Credentials::None,
        }
    }

    pub fn link_settings(&self) -> LinkSettings {
        self.link.clone()
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(val, "true" | "1" | "yes")
}

/// Parse `path` as a `teamlink.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| LinkError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

/// Parse configuration text. Never fails; bad values keep defaults.
pub fn parse_config(content: &str) -> ClientConfig {
    let mut cfg = ClientConfig { auto_connect: true, ..ClientConfig::default() };
    let link = &mut cfg.link;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().to_string();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "ws_url"                => cfg.ws_url         = Some(val),
            "live_url"              => cfg.live_url       = Some(val),
            "history_url"           => cfg.history_url    = Some(val),
            "auth_token"            => cfg.auth_token     = Some(val),
            "session_cookie"        => cfg.session_cookie = Some(val),
            "auto_connect"          => cfg.auto_connect   = parse_bool(&val),
            "base_delay_ms"         => link.base_delay    = millis(&val, BASE_DELAY_MS),
            "max_delay_ms"          => link.max_delay     = millis(&val, MAX_DELAY_MS),
            "jitter_factor"         => link.jitter_factor = val.parse().unwrap_or(JITTER_FACTOR),
            "max_attempts"          => link.max_attempts  = val.parse().unwrap_or(MAX_ATTEMPTS),
            "heartbeat_interval_ms" => link.heartbeat_interval = millis(&val, HEARTBEAT_INTERVAL_MS),
            "heartbeat_timeout_ms"  => link.heartbeat_timeout  = millis(&val, HEARTBEAT_TIMEOUT_MS),
            "handshake_timeout_ms"  => link.handshake_timeout  = millis(&val, HANDSHAKE_TIMEOUT_MS),
            "queue_capacity"        => link.queue_capacity     = val.parse().unwrap_or(QUEUE_CAPACITY),
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

fn millis(val: &str, default: u64) -> Duration {
    Duration::from_millis(val.parse().unwrap_or(default))
}

/// Validate that required fields are populated and limits are sane.
pub fn validate_config(cfg: &ClientConfig) -> Result<()> {
    let Some(ws_url) = cfg.ws_url.as_deref() else {
        return Err(LinkError::Config("ws_url is required".into()));
    };
    for url in std::iter::once(ws_url).chain(cfg.live_url.as_deref()) {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(LinkError::Config(format!("{url}: expected a ws:// or wss:// URL")));
        }
    }
    validate_link_settings(&cfg.link)
}

pub fn validate_link_settings(link: &LinkSettings) -> Result<()> {
    if link.base_delay.is_zero() {
        return Err(LinkError::Config("base_delay_ms must be positive".into()));
    }
    if link.max_delay < link.base_delay {
        return Err(LinkError::Config("max_delay_ms must be >= base_delay_ms".into()));
    }
    if !(0.0..=1.0).contains(&link.jitter_factor) {
        return Err(LinkError::Config("jitter_factor must be within 0.0..=1.0".into()));
    }
    if link.heartbeat_interval.is_zero() || link.heartbeat_timeout.is_zero() {
        return Err(LinkError::Config("heartbeat interval and timeout must be positive".into()));
    }
    if link.queue_capacity == 0 {
        return Err(LinkError::Config("queue_capacity must be at least 1".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_ignores_comments() {
        let cfg = parse_config(
            "# chat endpoint\n\
             ws_url = wss://events.example.com/ws/chat\n\
             auth_token = abc123\n\
             max_attempts = 3\n\
             heartbeat_timeout_ms = 500\n\
             queue_capacity = 7\n\
             colour = blue\n",
        );
        assert_eq!(cfg.ws_url.as_deref(), Some("wss://events.example.com/ws/chat"));
        assert_eq!(cfg.link.max_attempts, 3);
        assert_eq!(cfg.link.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(cfg.link.queue_capacity, 7);
        assert_eq!(cfg.credentials(), Credentials::Bearer("abc123".into()));
        assert!(cfg.auto_connect);
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let cfg = parse_config("max_delay_ms = soon\njitter_factor = lots\n");
        assert_eq!(cfg.link.max_delay, Duration::from_millis(MAX_DELAY_MS));
        assert_eq!(cfg.link.jitter_factor, JITTER_FACTOR);
    }

    #[test]
    fn validation_requires_websocket_url() {
        let mut cfg = parse_config("");
        assert!(validate_config(&cfg).is_err());
        cfg.ws_url = Some("https://events.example.com".into());
        assert!(validate_config(&cfg).is_err());
        cfg.ws_url = Some("ws://localhost:8000/ws/chat".into());
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn validation_rejects_zero_capacity() {
        let link = LinkSettings { queue_capacity: 0, ..LinkSettings::default() };
        assert!(validate_link_settings(&link).is_err());
    }

    #[test]
    fn cookie_used_without_token() {
        let cfg = parse_config("session_cookie = sessionid=xyz\n");
        assert_eq!(cfg.credentials(), Credentials::SessionCookie("sessionid=xyz".into()));
    }
}

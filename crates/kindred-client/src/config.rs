//! Session configuration loaded from environment variables.
//!
//! Every setting has a default except the identity: a session needs a user
//! id and a token.

use std::time::Duration;

use anyhow::Context;
use tracing::warn;

use kindred_call::CallTimeouts;
use kindred_net::{ConnectionConfig, ReconnectPolicy};
use kindred_shared::constants::{
    ACK_TIMEOUT, CALL_GRACE_PERIOD, CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_BUFFERED_FRAMES,
    MAX_EARLY_CALL_EVENTS, MAX_MESSAGE_SIZE, RING_TIMEOUT, TICK_INTERVAL, TYPING_DEBOUNCE,
    TYPING_EXPIRY, TYPING_IDLE,
};
use kindred_shared::UserId;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the realtime server.
    /// Env: `KINDRED_SERVER_URL`
    /// Default: `ws://127.0.0.1:3000/socket`
    pub server_url: String,

    /// Auth token sent in the `authenticate` handshake.
    /// Env: `KINDRED_TOKEN`
    pub token: Option<String>,

    /// Identity of the logged-in user; needed to recognise echoes of our
    /// own messages.
    /// Env: `KINDRED_USER_ID`
    pub user_id: Option<UserId>,

    /// Env: `KINDRED_ACK_TIMEOUT_SECS`
    /// Default: 10s
    pub ack_timeout: Duration,

    /// Default: 10s
    pub handshake_timeout: Duration,

    /// Env: `KINDRED_RING_TIMEOUT_SECS`
    /// Default: 45s
    pub ring_timeout: Duration,

    /// Env: `KINDRED_CONNECT_TIMEOUT_SECS`
    /// Default: 30s
    pub connect_timeout: Duration,

    pub call_grace: Duration,
    pub typing_debounce: Duration,
    pub typing_idle: Duration,
    pub typing_expiry: Duration,

    /// Housekeeping period for call timeouts and typing sweeps.
    pub tick_interval: Duration,

    /// `max_attempts` is read from `KINDRED_RECONNECT_ATTEMPTS`.
    pub reconnect: ReconnectPolicy,

    pub max_buffered_frames: usize,
    pub max_early_call_events: usize,
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000/socket".to_string(),
            token: None,
            user_id: None,
            ack_timeout: ACK_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            ring_timeout: RING_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            call_grace: CALL_GRACE_PERIOD,
            typing_debounce: TYPING_DEBOUNCE,
            typing_idle: TYPING_IDLE,
            typing_expiry: TYPING_EXPIRY,
            tick_interval: TICK_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            max_buffered_frames: MAX_BUFFERED_FRAMES,
            max_early_call_events: MAX_EARLY_CALL_EVENTS,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = var("KINDRED_SERVER_URL") {
            config.server_url = url;
        }

        if let Some(token) = var("KINDRED_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }

        if let Some(id) = var("KINDRED_USER_ID") {
            if !id.is_empty() {
                config.user_id = Some(UserId::new(id));
            }
        }

        if let Some(secs) = parse_var(&var, "KINDRED_ACK_TIMEOUT_SECS") {
            config.ack_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "KINDRED_RING_TIMEOUT_SECS") {
            config.ring_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "KINDRED_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_var(&var, "KINDRED_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = attempts;
        }

        config
    }

    /// The user id and token a session cannot start without.
    pub fn credentials(&self) -> anyhow::Result<(UserId, String)> {
        let user_id = self.user_id.clone().context("KINDRED_USER_ID is not set")?;
        let token = self.token.clone().context("KINDRED_TOKEN is not set")?;
        Ok((user_id, token))
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: self.handshake_timeout,
            reconnect: self.reconnect.clone(),
            max_buffered_frames: self.max_buffered_frames,
            ack_sweep_interval: self.tick_interval,
        }
    }

    pub fn call_timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            ring: self.ring_timeout,
            connect: self.connect_timeout,
            grace: self.call_grace,
            max_early_events: self.max_early_call_events,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = var(key)?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_reads_overrides() {
        let config = SessionConfig::from_vars(vars(&[
            ("KINDRED_SERVER_URL", "wss://rt.example.com/socket"),
            ("KINDRED_TOKEN", "secret"),
            ("KINDRED_USER_ID", "u-1"),
            ("KINDRED_RING_TIMEOUT_SECS", "20"),
            ("KINDRED_RECONNECT_ATTEMPTS", "2"),
        ]));
        assert_eq!(config.server_url, "wss://rt.example.com/socket");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.user_id, Some(UserId::new("u-1")));
        assert_eq!(config.ring_timeout, Duration::from_secs(20));
        assert_eq!(config.reconnect.max_attempts, 2);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = SessionConfig::from_vars(vars(&[
            ("KINDRED_ACK_TIMEOUT_SECS", "soon"),
            ("KINDRED_TOKEN", ""),
        ]));
        assert_eq!(config.ack_timeout, ACK_TIMEOUT);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_credentials_require_user_id() {
        let config = SessionConfig::from_vars(vars(&[("KINDRED_TOKEN", "secret")]));
        let err = config.credentials().unwrap_err();
        assert!(err.to_string().contains("KINDRED_USER_ID"));

        let config = SessionConfig::from_vars(vars(&[
            ("KINDRED_TOKEN", "secret"),
            ("KINDRED_USER_ID", "u-1"),
        ]));
        let (user_id, token) = config.credentials().unwrap();
        assert_eq!(user_id, UserId::new("u-1"));
        assert_eq!(token, "secret");
    }

    #[test]
    fn test_builds_component_configs() {
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(7),
            ..SessionConfig::default()
        };
        assert_eq!(config.call_timeouts().connect, Duration::from_secs(7));
        assert_eq!(config.connection_config().ack_sweep_interval, TICK_INTERVAL);
    }
}

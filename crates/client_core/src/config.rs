use std::{collections::HashMap, fs, time::Duration};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the messaging backend, e.g. `https://chat.example.com`.
    /// The push channel lives at `<server_url>/ws` with the scheme swapped
    /// to ws/wss.
    pub server_url: String,
    /// Bound on the connect + auth handshake before failing into `Error`.
    pub connect_timeout: Duration,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_cap: Duration,
    /// Safety net: a typing entry with no stop event is evicted after this.
    pub typing_expiry: Duration,
    /// Local typing auto-stops after this much keyboard inactivity.
    pub typing_idle_stop: Duration,
    pub page_size: u32,
    /// Distance from the bottom (in viewport units) within which the view
    /// still counts as "at the bottom" for tail-follow purposes.
    pub near_bottom_threshold: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
            typing_expiry: Duration::from_secs(6),
            typing_idle_stop: Duration::from_secs(3),
            page_size: 20,
            near_bottom_threshold: 48.0,
        }
    }
}

/// Loads `client.toml` from the working directory, then applies `APP__*`
/// environment overrides on top.
pub fn load_config() -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                config.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("connect_timeout_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    config.connect_timeout = Duration::from_millis(parsed);
                }
            }
            if let Some(v) = file_cfg.get("page_size") {
                if let Ok(parsed) = v.parse::<u32>() {
                    config.page_size = parsed.clamp(1, 100);
                }
            }
        }
    }

    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        config.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__CONNECT_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.connect_timeout = Duration::from_millis(parsed);
        }
    }
    if let Ok(v) = std::env::var("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            config.page_size = parsed.clamp(1, 100);
        }
    }

    config
}

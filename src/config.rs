// Engine configuration.
// Defaults live in constants; every knob can be overridden from the environment.

use std::time::Duration;

use url::Url;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug"; // verbose while developing

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Environment variable holding a tracing filter directive.
pub const LOG_FILTER_ENV: &str = "PEERCALL_LOG";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_ICE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIME_LIMIT: Duration = Duration::from_secs(6 * 60);
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Settings for one call engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total setup attempts allowed before `ConnectionFailed` is surfaced.
    pub max_retries: u32,
    /// Backoff base; the n-th retry waits `base * 2^(n-1)`.
    pub retry_base_delay: Duration,
    pub ice_fetch_timeout: Duration,
    /// Deadline for a freshly built connection to reach `connected`.
    pub connect_timeout: Duration,
    pub media_timeout: Duration,
    /// `GET <endpoint>?apiKey=<key>` returns the TURN server list.
    pub turn_endpoint: Option<Url>,
    pub turn_api_key: Option<String>,
    pub stun_fallback: String,
    pub permission_probe: bool,
    pub ice_restart_on_disconnect: bool,
    /// `None` disables the countdown.
    pub call_time_limit: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            ice_fetch_timeout: DEFAULT_ICE_FETCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            media_timeout: DEFAULT_MEDIA_TIMEOUT,
            turn_endpoint: None,
            turn_api_key: None,
            stun_fallback: DEFAULT_STUN_URL.to_string(),
            permission_probe: true,
            ice_restart_on_disconnect: true,
            call_time_limit: Some(DEFAULT_CALL_TIME_LIMIT),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `PEERCALL_*` variables that parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(endpoint) = env_string("PEERCALL_TURN_ENDPOINT") {
            match Url::parse(&endpoint) {
                Ok(url) => config.turn_endpoint = Some(url),
                Err(err) => {
                    tracing::warn!(endpoint, error = %err, "ignoring invalid turn endpoint")
                }
            }
        }
        config.turn_api_key = env_string("PEERCALL_TURN_API_KEY");
        if let Some(value) = env_parse::<u32>("PEERCALL_MAX_RETRIES") {
            config.max_retries = value.max(1);
        }
        if let Some(ms) = env_parse::<u64>("PEERCALL_RETRY_BASE_MS") {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PEERCALL_ICE_TIMEOUT_MS") {
            config.ice_fetch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PEERCALL_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("PEERCALL_CALL_LIMIT_SECS") {
            config.call_time_limit = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(url) = env_string("PEERCALL_STUN_URL") {
            config.stun_fallback = url;
        }
        config
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ice_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.ice_fetch_timeout = timeout;
        self
    }

    pub fn with_turn_endpoint(mut self, endpoint: Url, api_key: impl Into<String>) -> Self {
        self.turn_endpoint = Some(endpoint);
        self.turn_api_key = Some(api_key.into());
        self
    }

    pub fn with_call_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.call_time_limit = limit;
        self
    }

    pub fn with_permission_probe(mut self, enabled: bool) -> Self {
        self.permission_probe = enabled;
        self
    }

    pub fn with_ice_restart_on_disconnect(mut self, enabled: bool) -> Self {
        self.ice_restart_on_disconnect = enabled;
        self
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}

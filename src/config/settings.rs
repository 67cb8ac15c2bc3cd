use std::env;

/// Runtime configuration, loaded from the environment with conservative
/// defaults matching the upstream source's recommended pacing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the trade data service, e.g. `http://127.0.0.1:8000/`.
    pub api_base_url: String,
    pub api_key: String,
    pub league: String,
    /// Comma-separated account names used to spot our own listings.
    pub account_name: Option<String>,
    /// Listings requested per pair.
    pub desired_count: usize,
    /// Fallback background sweep interval when the service does not
    /// recommend one.
    pub background_check_interval_secs: u64,
    /// Fixed delay between sequential refreshes in a batch, to avoid bursts.
    pub inter_request_delay_ms: u64,
    /// At most this many stale pairs are refreshed per background tick.
    pub stale_batch_size: usize,
    pub stream_channel_capacity: usize,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: "http://127.0.0.1:8000/".to_string(),
            api_key: String::new(),
            league: "Standard".to_string(),
            account_name: None,
            desired_count: 5,
            background_check_interval_secs: 30,
            inter_request_delay_ms: 2000,
            stale_batch_size: 2,
            stream_channel_capacity: 64,
            request_timeout_secs: 20,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            api_base_url: env::var("DESK_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_key: env::var("DESK_API_KEY").unwrap_or_default(),
            league: env::var("DESK_LEAGUE").unwrap_or(defaults.league),
            account_name: env::var("DESK_ACCOUNT_NAME")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            desired_count: env::var("DESK_DESIRED_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.desired_count),
            background_check_interval_secs: env::var("DESK_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.background_check_interval_secs),
            inter_request_delay_ms: env::var("DESK_INTER_REQUEST_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.inter_request_delay_ms),
            stale_batch_size: env::var("DESK_STALE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.stale_batch_size),
            stream_channel_capacity: env::var("DESK_STREAM_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.stream_channel_capacity),
            request_timeout_secs: env::var("DESK_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    pub fn validate_and_log(&self) {
        log::info!(
            "Configuration: base_url={} league={} desired_count={} check_interval={}s delay={}ms batch={}",
            self.api_base_url,
            self.league,
            self.desired_count,
            self.background_check_interval_secs,
            self.inter_request_delay_ms,
            self.stale_batch_size
        );
        if self.api_key.is_empty() {
            log::warn!("DESK_API_KEY is empty; the upstream service will reject requests");
        }
        if self.stale_batch_size == 0 {
            log::warn!("DESK_STALE_BATCH_SIZE is 0; background refresh will never run");
        }
    }
}

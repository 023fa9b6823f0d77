use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `MAILWRIGHT__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

/// Step scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on enrollments processed concurrently within one tick.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Send attempts per step before the enrollment exits.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential retry backoff, in seconds.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
}

/// Delivery pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Per-attempt mailer timeout; elapsed timeouts count as transient
    /// failures.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Mailer attempts per recipient during a bulk campaign send.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Provider rate limit, sends per second.
    #[serde(default = "default_max_sends_per_second")]
    pub max_sends_per_second: u64,
    /// Link substituted for `{{unsubscribe_url}}`; `{contact_id}` is
    /// replaced per recipient.
    #[serde(default = "default_unsubscribe_base_url")]
    pub unsubscribe_base_url: String,
}

/// Event ingress tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Maximum tag-triggered enrollment hops before an event is dropped.
    #[serde(default = "default_max_trigger_depth")]
    pub max_trigger_depth: u8,
}

fn default_node_id() -> String {
    "mailwright-1".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    32
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base_secs() -> u64 {
    60
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_max_sends_per_second() -> u64 {
    100
}
fn default_unsubscribe_base_url() -> String {
    "https://mail.example.com/unsubscribe/{contact_id}".to_string()
}
fn default_max_trigger_depth() -> u8 {
    5
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            retry_base_secs: default_retry_base_secs(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_base_secs: default_retry_base_secs(),
            max_sends_per_second: default_max_sends_per_second(),
            unsubscribe_base_url: default_unsubscribe_base_url(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_trigger_depth: default_max_trigger_depth(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            scheduler: SchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            ingress: IngressConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("MAILWRIGHT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.ingress.max_trigger_depth, 5);
        assert!(config.delivery.unsubscribe_base_url.contains("{contact_id}"));
    }
}

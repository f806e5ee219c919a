use std::time::Duration;

pub const DEFAULT_URL: &str = "amqp://127.0.0.1:5672";

/// Transport options.
///
/// `loadbalancing` is accepted and stored but does not change behavior yet.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub loadbalancing: bool,
    pub max_connect_attempts: u32,
    pub retry_delay: Duration,
    /// `None` waits for a reply forever.
    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            loadbalancing: false,
            max_connect_attempts: 15,
            retry_delay: Duration::from_millis(500),
            request_timeout: None,
        }
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn loadbalancing(mut self, enabled: bool) -> Self {
        self.config.loadbalancing = enabled;
        self
    }

    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connect_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay = Duration::from_millis(ms);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout = Some(Duration::from_millis(ms));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

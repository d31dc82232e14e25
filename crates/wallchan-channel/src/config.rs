use std::time::Duration;

/// How long a request for an unregistered channel waits before giving up.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of registry lookups before `get_channel` fails.
pub const DEFAULT_LOOKUP_ATTEMPTS: u32 = 8;

/// Delay before the second registry lookup; doubles per attempt.
pub const DEFAULT_LOOKUP_BACKOFF: Duration = Duration::from_millis(25);

/// Ceiling for the registry lookup delay.
pub const DEFAULT_LOOKUP_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Configuration for one channel server.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Time a request for an unknown channel is held before it is rejected
    /// (`Promise`) or dropped (`EventListen`). Default: 1s.
    pub pending_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

/// Configuration for a [`ConnectionRegistry`](crate::ConnectionRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Applied to every connection's channel server.
    pub channel: ChannelConfig,
    /// Lookups `get_channel` makes before failing. Default: 8.
    pub lookup_attempts: u32,
    /// Initial delay between lookups. Default: 25ms.
    pub lookup_backoff: Duration,
    /// Upper bound for the doubling delay. Default: 500ms.
    pub lookup_backoff_max: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            lookup_attempts: DEFAULT_LOOKUP_ATTEMPTS,
            lookup_backoff: DEFAULT_LOOKUP_BACKOFF,
            lookup_backoff_max: DEFAULT_LOOKUP_BACKOFF_MAX,
        }
    }
}

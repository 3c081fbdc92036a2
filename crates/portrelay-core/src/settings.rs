//! Runtime knobs shared by every listener and session.

use std::time::Duration;

/// Resolved relay settings (file values with CLI overrides applied).
///
/// Timeouts use `None` for "disabled"; a session cap of `0` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Local address every listener binds on.
    pub bind_address: String,
    /// Upper bound on dialing a backend.
    pub connect_timeout: Option<Duration>,
    /// Maximum time a single read or write may wait. Renewed after every
    /// successful I/O.
    pub idle_timeout: Option<Duration>,
    /// Concurrent sessions allowed per listener.
    pub max_sessions_per_listener: usize,
    /// How long a stopping listener waits for in-flight sessions.
    pub shutdown_grace: Duration,
    /// Copy buffer size for each direction.
    pub buffer_size: usize,
}

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            connect_timeout: Some(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
            idle_timeout: None,
            max_sessions_per_listener: 0,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Seconds → optional duration, where `0` disables the timeout.
pub fn secs_or_disabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_disables() {
        assert_eq!(secs_or_disabled(0), None);
        assert_eq!(secs_or_disabled(3), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.bind_address, "0.0.0.0");
        assert_eq!(s.idle_timeout, None);
        assert_eq!(s.max_sessions_per_listener, 0);
    }
}

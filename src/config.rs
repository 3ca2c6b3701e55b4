//! Environment-driven gateway settings.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    /// How long one worker iteration blocks on the queue before looping
    /// back to maintenance.
    pub queue_poll_timeout: Duration,
    /// Upper bound on records inspected per maintenance pass.
    pub maintenance_scan_limit: usize,
    /// Minimum spacing between two consecutive streaming turns.
    pub stream_gap: Duration,
    /// Smallest delay inserted once pacing kicks in.
    pub stream_gap_floor: Duration,
    /// How long a caller waits on its result sink before giving up.
    pub completion_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: "0.0.0.0:3000".to_string(),
            queue_poll_timeout: Duration::from_secs(5),
            maintenance_scan_limit: 10,
            stream_gap: Duration::from_secs(1),
            stream_gap_floor: Duration::from_millis(500),
            completion_timeout: Duration::from_secs(420),
        }
    }
}

impl Settings {
    pub fn from_env() -> Settings {
        let defaults = Settings::default();
        let host = std::env::var("HOST").unwrap_or("0.0.0.0".to_string());
        let port = env_parse("PORT", 3000u16);
        Settings {
            bind_addr: format!("{host}:{port}"),
            queue_poll_timeout: Duration::from_secs(env_parse("QUEUE_POLL_TIMEOUT_SECS", 5)),
            maintenance_scan_limit: env_parse(
                "MAINTENANCE_SCAN_LIMIT",
                defaults.maintenance_scan_limit,
            ),
            stream_gap: Duration::from_millis(env_parse("STREAM_GAP_MS", 1000)),
            stream_gap_floor: Duration::from_millis(env_parse("STREAM_GAP_FLOOR_MS", 500)),
            completion_timeout: Duration::from_secs(env_parse("COMPLETION_TIMEOUT_SECS", 420)),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| T::from_str(&s).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_worker_constants() {
        let settings = Settings::default();
        assert_eq!(settings.queue_poll_timeout, Duration::from_secs(5));
        assert_eq!(settings.maintenance_scan_limit, 10);
        assert_eq!(settings.stream_gap, Duration::from_secs(1));
        assert_eq!(settings.stream_gap_floor, Duration::from_millis(500));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Variable unset in the test environment.
        assert_eq!(env_parse("SESSION_LLM_GATEWAY_NO_SUCH_VAR", 7usize), 7);
    }
}

//! Request-scoped configuration.
//!
//! There is deliberately no global, mutable configuration. A [`Config`] is
//! built once per request and passed down to whoever needs it.

use std::time::Duration;

/// Tunables for one request.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of simultaneous in-flight downloads.
    pub concurrency_limit: usize,
    /// Per-attempt read timeout for HTTP requests.
    pub request_timeout: Duration,
    /// Total budget for downloading a single artifact, across all retries.
    pub total_timeout: Duration,
    /// Timeout for subprocess tools (`go`, `yarn`, `cargo`, `git`).
    pub subprocess_timeout: Duration,
    /// The Go module proxy used when populating the module cache.
    pub goproxy_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            request_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(600),
            subprocess_timeout: Duration::from_secs(300),
            goproxy_url: "https://proxy.golang.org,direct".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency_limit, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.total_timeout, Duration::from_secs(600));
    }
}

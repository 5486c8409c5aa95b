//! Waiting for a local listener to come up

use crate::errors::ReadinessError;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Delay between connection attempts
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Polls `http://127.0.0.1:<port>/` until something answers
#[derive(Clone, Debug)]
pub struct ReadinessPoller {
    req: reqwest::Client,
    interval: Duration,
}

impl ReadinessPoller {
    pub fn new() -> Self {
        ReadinessPoller::with_interval(POLL_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        let req = reqwest::Client::builder()
            .connect_timeout(ATTEMPT_TIMEOUT)
            .timeout(ATTEMPT_TIMEOUT)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        ReadinessPoller { req, interval }
    }

    /// Wait until the port answers with any status in 100..=499
    ///
    /// Any such answer proves the listener is up, whatever the status. On
    /// timeout the last error seen is returned.
    pub async fn wait(&self, port: u16, timeout: Duration) -> Result<(), ReadinessError> {
        let url = format!("http://127.0.0.1:{}/", port);
        let deadline = Instant::now() + timeout;
        loop {
            let last_error = match self.req.get(&url).send().await {
                Ok(response) if (100..500).contains(&response.status().as_u16()) => {
                    log::debug!("{} answered {}", url, response.status());
                    return Ok(());
                }
                Ok(response) => ReadinessError::Status(response.status().as_u16()),
                Err(err) => ReadinessError::Request(err),
            };
            log::trace!("{} not ready: {}", url, last_error);
            let now = Instant::now();
            if now >= deadline {
                return Err(last_error);
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        ReadinessPoller::new()
    }
}

use std::time::Duration;

use crate::delivery::RetryPolicy;

/// Pipeline tuning shared by all partition workers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records requested per poll
    pub batch_size: usize,
    /// Sleep between polls when a partition is caught up
    pub poll_interval: Duration,
    /// Destination publish retries
    pub publish_retry: RetryPolicy,
    /// Backoff for failed offset commits; commits are retried until they succeed
    pub commit_backoff: RetryPolicy,
    /// Grace period for in-flight publishes after shutdown is requested
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            publish_retry: RetryPolicy::default(),
            commit_backoff: RetryPolicy::doubling(u32::MAX, Duration::from_millis(200), Duration::from_secs(10)),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_retry = policy;
        self
    }

    pub fn with_commit_backoff(mut self, policy: RetryPolicy) -> Self {
        self.commit_backoff = policy;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

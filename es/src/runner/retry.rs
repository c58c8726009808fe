//! Retry wrapper for run callbacks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, warn};

use super::callback::RunCallback;
use super::config::RunnerConfig;

/// Retries a failing iteration before letting the error stop the runner
pub struct Retry {
    inner: Arc<dyn RunCallback>,
    max_attempts: u32,
    delay: Duration,
}

impl Retry {
    pub fn new(inner: Arc<dyn RunCallback>, max_attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Build from runner config
    pub fn from_config(inner: Arc<dyn RunCallback>, config: &RunnerConfig) -> Self {
        Self::new(inner, config.retry_max_attempts, config.retry_delay())
    }
}

#[async_trait]
impl RunCallback for Retry {
    async fn run(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.run().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.max_attempts => {
                    warn!(attempt, max_attempts = self.max_attempts, error = %err, "Iteration failed, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, "Retry::run: attempts exhausted");
                    return Err(err);
                }
            }
        }
    }
}

//! Per-call retry ladder.
//!
//! Up to `max_retries` attempts per webservice call, linear delay
//! (`attempt × base`) by default, exponential (`base × 2^(attempt-1)`)
//! opt-in. Only transport errors re-enter the ladder; credentials, domain
//! rejections, and malformed responses exit immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub strategy: Strategy,
    pub base_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: Strategy::Linear,
            base_delay_ms: 1_000,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            Strategy::Linear => self.base_delay_ms * attempt as u64,
            Strategy::Exponential => self.base_delay_ms * 2u64.pow(attempt.saturating_sub(1)),
        };
        Duration::from_millis(ms)
    }
}

/// Run `op` under the policy. `what` names the call in logs.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    call = what,
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retryable webservice failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

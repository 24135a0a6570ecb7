//! Bounded fixed-delay retry for the realtime handshake.
//!
//! [`connect_with_retry`] tries up to [`ReconnectConfig::max_attempts`]
//! handshakes, pausing [`ReconnectConfig::delay`] between them, and
//! gives up early when the [`CancellationToken`] fires.

use std::time::Duration;

use singwithme_core::DeliveryConfig;
use tokio_util::sync::CancellationToken;

use crate::client::{ConnectError, Connection, Connector};

/// Tunable parameters for the retry strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Handshake attempts per connect cycle (at least one is made).
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
    /// Upper bound on a single attempt.
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

impl From<&DeliveryConfig> for ReconnectConfig {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            delay: config.reconnect_delay,
            handshake_timeout: config.handshake_timeout,
        }
    }
}

/// Result of one connect cycle.
#[derive(Debug)]
pub enum RetryOutcome {
    Connected(Connection),
    Exhausted { attempts: u32, last_error: ConnectError },
    Cancelled,
}

/// Attempt the handshake until it succeeds, attempts run out, or
/// `cancel` is triggered.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> RetryOutcome {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::debug!(attempt, max_attempts, "Connecting to realtime endpoint");

        let result = tokio::select! {
            _ = cancel.cancelled() => return RetryOutcome::Cancelled,
            result = tokio::time::timeout(config.handshake_timeout, connector.connect()) => result,
        };

        let error = match result {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Realtime connection established after retry");
                }
                return RetryOutcome::Connected(conn);
            }
            Ok(Err(e)) => e,
            Err(_) => ConnectError::Timeout(config.handshake_timeout),
        };

        tracing::warn!(error = %error, "Connect attempt {attempt}/{max_attempts} failed");

        if attempt >= max_attempts {
            return RetryOutcome::Exhausted {
                attempts: attempt,
                last_error: error,
            };
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return RetryOutcome::Cancelled,
            _ = tokio::time::sleep(config.delay) => {}
        }
    }
}

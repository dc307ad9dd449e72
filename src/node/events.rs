//! Reconnecting subscriptions to node streams
//!
//! Each stream the node exposes (intercepted HTLCs, channel events, wallet
//! transactions) is consumed by one task spawned through
//! [`subscribe_with_retry`]. The task forwards every item to an mpsc channel
//! and re-subscribes with exponential backoff when the stream drops with a
//! transient error.

use super::{GatewayError, GatewayResult, GatewayStream};
use futures::StreamExt;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backoff bounds for re-subscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Next delay after `current`, doubled and capped
    fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Up to a quarter of `delay` added on top
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter_ms = (delay.as_millis() / 4) as u64;
    if max_jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
}

/// Spawn a task that keeps `connect`'s stream subscribed and forwards its
/// items to `sink`.
///
/// The task ends with `Ok(())` when `cancel` fires or `sink` is closed, and
/// with the error when the stream fails with a non-transient error.
pub fn subscribe_with_retry<T, F, Fut>(
    name: &'static str,
    policy: RetryPolicy,
    cancel: CancellationToken,
    connect: F,
    sink: mpsc::Sender<T>,
) -> JoinHandle<GatewayResult<()>>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = GatewayResult<GatewayStream<T>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = policy.initial_delay;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                connected = connect() => connected,
            };

            let error = match connected {
                Ok(mut stream) => {
                    info!("Subscribed to {} stream", name);
                    delay = policy.initial_delay;

                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(item)) => {
                                if sink.send(item).await.is_err() {
                                    debug!("{} consumer dropped, stopping subscription", name);
                                    return Ok(());
                                }
                            }
                            Some(Err(e)) => break e,
                            None => break GatewayError::StreamClosed,
                        }
                    }
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                error!("{} stream failed: {}", name, error);
                return Err(error);
            }

            let wait = with_jitter(delay);
            warn!("{} stream interrupted: {}. Reconnecting in {:?}", name, error, wait);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
            delay = policy.next_delay(delay);
        }
    })
}

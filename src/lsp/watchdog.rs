//! Payment timeout watchdog
//!
//! A multi-part payment must arrive in full within the payment timeout of
//! its first HTLC. One timer task per collecting request sleeps until that
//! deadline; the interception engine wakes it early when the request makes
//! progress so it can exit.

use super::LspContext;
use crate::db::ChannelRequestQueries;
use crate::{LspError, LspResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Fails channel requests that stay incomplete past their deadline
pub struct PaymentWatchdog {
    ctx: Arc<LspContext>,
    signals: Mutex<HashMap<i64, Arc<Notify>>>,
}

impl PaymentWatchdog {
    pub(crate) fn new(ctx: Arc<LspContext>) -> Self {
        Self {
            ctx,
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Start the timeout of a request
    pub fn start(self: &Arc<Self>, request_id: i64) -> JoinHandle<()> {
        let deadline = Instant::now() + self.ctx.config.lsp.payment_timeout();
        let signal = Arc::new(Notify::new());
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, signal.clone());

        debug!("Payment timeout started for request {}", request_id);
        let watchdog = self.clone();
        tokio::spawn(async move {
            watchdog.watch(request_id, deadline, signal.clone()).await;
            watchdog.forget(request_id, &signal);
        })
    }

    /// Wake the request's timer to re-check its status
    pub fn notify_progress(&self, request_id: i64) {
        let signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(signal) = signals.get(&request_id) {
            signal.notify_one();
        }
    }

    /// Number of running timers
    pub fn active(&self) -> usize {
        self.signals.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn forget(&self, request_id: i64, signal: &Arc<Notify>) {
        let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        if signals.get(&request_id).is_some_and(|s| Arc::ptr_eq(s, signal)) {
            signals.remove(&request_id);
        }
    }

    async fn watch(&self, request_id: i64, deadline: Instant, signal: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    if let Err(e) = self.expire(request_id).await {
                        error!("Payment timeout of request {} could not fail it: {}", request_id, e);
                    }
                    return;
                }
                _ = signal.notified() => {
                    match self.still_collecting(request_id).await {
                        Ok(true) => continue,
                        Ok(false) => {
                            debug!("Request {} made progress, payment timeout stopped", request_id);
                            return;
                        }
                        Err(e) => error!("Payment timeout of request {}: {}", request_id, e),
                    }
                }
            }
        }
    }

    async fn still_collecting(&self, request_id: i64) -> LspResult<bool> {
        let request = ChannelRequestQueries::new(&self.ctx.db)
            .get_by_id(request_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?;
        Ok(request.is_some_and(|r| r.status.is_collecting()))
    }

    async fn expire(&self, request_id: i64) -> LspResult<()> {
        let _guard = self.ctx.locks.lock(request_id).await;
        let request = ChannelRequestQueries::new(&self.ctx.db)
            .get_by_id(request_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?;

        match request {
            Some(mut request) if request.status.is_collecting() => {
                info!(
                    "Payment timeout for request {}: {}/{} msat received",
                    request.id, request.settled_msat, request.amount_msat
                );
                self.ctx
                    .fail_request_locked(&mut request, "payment timed out")
                    .await?;
            }
            _ => debug!("Payment timeout of request {} no longer applies", request_id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChannelRequestHtlcQueries, ChannelRequestStatus};
    use crate::metrics::HtlcOutcome;
    use crate::node::ResolveHoldForwardAction;
    use crate::test_utils::{attach_sink, insert_request, test_context, MockGateway};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_payment_fails_at_deadline() {
        let ctx = test_context(Arc::new(MockGateway::new())).await;
        let mut replies = attach_sink(&ctx);
        let watchdog = Arc::new(PaymentWatchdog::new(ctx.clone()));

        let mut request = insert_request(&ctx, 100_000, 1).await;
        request.status = ChannelRequestStatus::AwaitingPayments;
        request.settled_msat = 40_000;
        ChannelRequestQueries::new(&ctx.db).update(&request).await.unwrap();
        let htlcs = ChannelRequestHtlcQueries::new(&ctx.db);
        htlcs.insert(request.id, 5, 1, 40_000, false).await.unwrap();

        let start = Instant::now();
        watchdog.start(request.id).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));

        let stored = ChannelRequestQueries::new(&ctx.db).get_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelRequestStatus::Failed);
        assert!(htlcs.list(request.id).await.unwrap().iter().all(|h| h.is_failed));

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.action, ResolveHoldForwardAction::Fail);
        assert_eq!(ctx.metrics.htlc_count(HtlcOutcome::Failed), 1);
        assert_eq!(watchdog.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_stops_timer_without_touching_request() {
        let ctx = test_context(Arc::new(MockGateway::new())).await;
        let watchdog = Arc::new(PaymentWatchdog::new(ctx.clone()));

        let mut request = insert_request(&ctx, 100_000, 2).await;
        request.status = ChannelRequestStatus::AwaitingPayments;
        ChannelRequestQueries::new(&ctx.db).update(&request).await.unwrap();

        let handle = watchdog.start(request.id);
        tokio::time::sleep(Duration::from_secs(5)).await;

        request.status = ChannelRequestStatus::OpeningChannel;
        request.settled_msat = 100_000;
        ChannelRequestQueries::new(&ctx.db).update(&request).await.unwrap();
        watchdog.notify_progress(request.id);

        let start = Instant::now();
        handle.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(25));

        let stored = ChannelRequestQueries::new(&ctx.db).get_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelRequestStatus::OpeningChannel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_leaving_collection_is_not_failed_at_deadline() {
        let ctx = test_context(Arc::new(MockGateway::new())).await;
        let watchdog = Arc::new(PaymentWatchdog::new(ctx.clone()));

        let mut request = insert_request(&ctx, 100_000, 3).await;
        request.status = ChannelRequestStatus::AwaitingPayments;
        ChannelRequestQueries::new(&ctx.db).update(&request).await.unwrap();
        let handle = watchdog.start(request.id);

        // No progress signal: the deadline re-check must still spare it
        request.status = ChannelRequestStatus::OpeningChannel;
        ChannelRequestQueries::new(&ctx.db).update(&request).await.unwrap();
        handle.await.unwrap();

        let stored = ChannelRequestQueries::new(&ctx.db).get_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelRequestStatus::OpeningChannel);
    }
}

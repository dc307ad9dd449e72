//! SCID alias pool
//!
//! Channel requests are handed an SCID alias up front so the payer can build
//! a route hint before the channel exists. Aliases are reserved on the node
//! ahead of time and consumed at most once.

use super::LspContext;
use crate::db::NodeScidQueries;
use crate::{LspError, LspResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hands out pre-allocated SCID aliases
pub struct ScidAllocator {
    ctx: Arc<LspContext>,
    lock: Mutex<()>,
}

impl ScidAllocator {
    pub(crate) fn new(ctx: Arc<LspContext>) -> Self {
        Self {
            ctx,
            lock: Mutex::new(()),
        }
    }

    /// Take one alias from the pool and replenish it in the background
    pub async fn allocate_scid(&self) -> LspResult<u64> {
        let (scid, _replenish) = self.allocate().await?;
        Ok(scid)
    }

    async fn allocate(&self) -> LspResult<(u64, JoinHandle<()>)> {
        let _guard = self.lock.lock().await;
        let node_id = self.ctx.node_id()?.to_string();

        let popped = NodeScidQueries::new(&self.ctx.db)
            .pop(&node_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to pop scid: {}", e)))?;

        let scid = match popped {
            Some(entry) => entry.scid,
            None => {
                warn!("SCID pool of {} is empty, allocating an alias directly", node_id);
                self.ctx.gateway.allocate_alias().await?
            }
        };

        let ctx = self.ctx.clone();
        let replenish = tokio::spawn(async move {
            if let Err(e) = add_alias(&ctx, &node_id).await {
                error!("Failed to replenish SCID pool: {}", e);
            }
        });

        debug!("Allocated scid {}", scid);
        Ok((scid, replenish))
    }

    /// Fill the pool up to the configured size; returns how many were added
    pub async fn top_up(&self) -> LspResult<u32> {
        let _guard = self.lock.lock().await;
        let node_id = self.ctx.node_id()?.to_string();
        let target = self.ctx.config.lsp.scid_cache_size;

        let count = NodeScidQueries::new(&self.ctx.db)
            .count(&node_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to count scids: {}", e)))?;

        let missing = target.saturating_sub(count);
        for i in 0..missing {
            add_alias(&self.ctx, &node_id).await?;
            debug!("[SCID Pool {}/{}] Alias reserved", i + 1, missing);
        }
        if missing > 0 {
            info!("SCID pool of {} holds {} aliases", node_id, target);
        }
        Ok(missing)
    }
}

async fn add_alias(ctx: &LspContext, node_id: &str) -> LspResult<u64> {
    let scid = ctx.gateway.allocate_alias().await?;
    NodeScidQueries::new(&ctx.db)
        .insert(node_id, scid)
        .await
        .map_err(|e| LspError::Database(format!("Failed to store scid: {}", e)))?;
    Ok(scid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_context, MockGateway};
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_allocations_are_unique_and_pool_refills() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway).await;
        let allocator = ScidAllocator::new(ctx.clone());
        assert_eq!(allocator.top_up().await.unwrap(), 10);
        assert_eq!(allocator.top_up().await.unwrap(), 0);

        let mut seen = HashSet::new();
        for _ in 0..25 {
            let (scid, replenish) = allocator.allocate().await.unwrap();
            replenish.await.unwrap();
            assert!(seen.insert(scid), "scid {} handed out twice", scid);

            let count = NodeScidQueries::new(&ctx.db).count("03lspnode").await.unwrap();
            assert_eq!(count, 10);
        }
    }

    #[tokio::test]
    async fn test_empty_pool_allocates_directly() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway).await;
        let allocator = ScidAllocator::new(ctx.clone());

        let (first, replenish) = allocator.allocate().await.unwrap();
        replenish.await.unwrap();
        let second = allocator.allocate_scid().await.unwrap();
        assert_ne!(first, second);
    }
}

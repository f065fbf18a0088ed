use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::blocks::{Blocks, ChainState};
use crate::config::SyncingConfig;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::{NetworkClient, PeerSnapshot};
use crate::pool::TransactionPool;
use crate::sequence::Sequence;
use crate::types::BlockId;

/// Seconds between sync checks.
const SYNC_INTERVAL_SECS: u64 = 10;
/// Recent block ids offered to a peer when probing for a common ancestor.
const COMMON_ID_CANDIDATES: usize = 50;
/// Ceiling on how far the loader will roll back to rejoin a better chain.
const MAX_ROLLBACK_BLOCKS: u64 = 101;

/// Pulls the network state in: unconfirmed transactions at boot and block
/// pages from a forward peer whenever the chain goes stale.
pub struct Loader {
    config: SyncingConfig,
    network: Arc<dyn NetworkClient>,
    blocks: Arc<Blocks>,
    pool: Arc<TransactionPool>,
    sequence: Arc<Sequence>,
    syncing: AtomicBool,
}

impl Loader {
    pub fn new(
        config: SyncingConfig,
        network: Arc<dyn NetworkClient>,
        blocks: Arc<Blocks>,
        pool: Arc<TransactionPool>,
        sequence: Arc<Sequence>,
    ) -> Self {
        Self {
            config,
            network,
            blocks,
            pool,
            sequence,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Startup pull of the shared pool from one forward peer; items enter
    /// the pool as bundled transactions.
    pub async fn load_unconfirmed_transactions(&self) -> ChainResult<usize> {
        let Some(peer) = self.pick_forward_peer().await? else {
            debug!("no forward peer for unconfirmed transaction load");
            return Ok(0);
        };
        let transactions = self.network.fetch_transactions(&peer.id).await?;
        let mut accepted = 0;
        for tx in transactions {
            match self.pool.add(tx, true) {
                Ok(()) => accepted += 1,
                Err(err) => debug!(%err, "skipping shared transaction"),
            }
        }
        let processed = self.pool.process_received(accepted);
        info!(accepted, processed, "loaded unconfirmed transactions");
        Ok(accepted)
    }

    /// One synchronization pass under the main sequence: find the common
    /// ancestor with a forward peer, roll back past it when we are on the
    /// losing fork, then fetch and apply block pages until caught up.
    pub async fn sync(self: Arc<Self>) -> ChainResult<()> {
        if !self.config.active {
            return Ok(());
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.blocks.set_state(ChainState::Syncing);
        let loader = self.clone();
        let result = self
            .sequence
            .add("sync", async move { loader.sync_inner().await })
            .await;
        self.blocks.set_state(ChainState::Synced);
        self.syncing.store(false, Ordering::SeqCst);
        if let Err(err) = &result {
            warn!(%err, "synchronization pass failed");
        }
        result
    }

    async fn sync_inner(&self) -> ChainResult<()> {
        let Some(peer) = self.pick_forward_peer().await? else {
            debug!("no forward peer available for sync");
            return Ok(());
        };
        let peer_height = peer.height();
        let candidates = self.recent_block_ids()?;
        let common = self
            .network
            .common_block(&peer.id, &candidates)
            .await?
            .ok_or_else(|| {
                ChainError::Network(format!("no common block with peer {}", peer.id))
            })?;
        let our_height = self.blocks.height();
        if common.height + MAX_ROLLBACK_BLOCKS < our_height {
            return Err(ChainError::Consensus(
                "common block is too far behind to roll back".into(),
            ));
        }
        while self.blocks.height() > common.height {
            self.blocks.delete_last_block()?;
        }

        let mut last_id = common.id.clone();
        loop {
            let page = self.network.fetch_blocks(&peer.id, &last_id).await?;
            if page.is_empty() {
                break;
            }
            for block in page {
                let id = block.id.clone();
                self.blocks.process_block(block, false)?;
                last_id = id;
            }
            if self.blocks.height() >= peer_height {
                break;
            }
        }
        info!(
            height = self.blocks.height(),
            peer = %peer.id,
            "synchronization pass finished"
        );
        Ok(())
    }

    /// Ids of our most recent blocks, newest first, for the common-block
    /// probe.
    fn recent_block_ids(&self) -> ChainResult<Vec<BlockId>> {
        let tip = self.blocks.last_block();
        let mut ids = Vec::with_capacity(COMMON_ID_CANDIDATES);
        let mut height = tip.header.height;
        ids.push(tip.id);
        while ids.len() < COMMON_ID_CANDIDATES && height > 1 {
            height -= 1;
            if let Some(block) = self.blocks.block_at_height(height)? {
                ids.push(block.id);
            }
        }
        Ok(ids)
    }

    /// Forward peer with the greatest advertised height.
    async fn pick_forward_peer(&self) -> ChainResult<Option<PeerSnapshot>> {
        let our_height = self.blocks.height();
        let peers = self.network.connected_peers().await?;
        Ok(peers
            .into_iter()
            .filter(|peer| peer.height() > our_height)
            .max_by_key(|peer| peer.height()))
    }

    /// Timer loop: skip while disabled, already syncing, or fresh; run a
    /// pass when the chain went stale or a forward block was rejected.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SYNC_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.config.active || self.syncing() {
                        continue;
                    }
                    let requested = self.blocks.take_sync_request();
                    if !requested && !self.blocks.is_stale() {
                        continue;
                    }
                    if let Err(err) = self.clone().sync().await {
                        warn!(%err, "scheduled sync failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

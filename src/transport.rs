use std::sync::Arc;

use tracing::debug;

use crate::blocks::{Blocks, ReceiveOutcome, BLOCKS_PER_PAGE};
use crate::broadcaster::Broadcaster;
use crate::config::ChainConstants;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::NetworkClient;
use crate::loader::Loader;
use crate::pool::TransactionPool;
use crate::sequence::Sequence;
use crate::types::{Block, BlockId, CommonBlock, Transaction, TransactionId};

/// Upper bound on candidate ids accepted by the common-block probe.
const MAX_COMMON_IDS: usize = 1_000;

/// Inbound RPC surface exposed to peers. Every payload is validated here;
/// peers sending malformed data are flagged through the network penalty
/// hook.
pub struct Transport {
    constants: Arc<ChainConstants>,
    blocks: Arc<Blocks>,
    pool: Arc<TransactionPool>,
    loader: Arc<Loader>,
    broadcaster: Arc<Broadcaster>,
    sequence: Arc<Sequence>,
    network: Arc<dyn NetworkClient>,
}

impl Transport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        constants: Arc<ChainConstants>,
        blocks: Arc<Blocks>,
        pool: Arc<TransactionPool>,
        loader: Arc<Loader>,
        broadcaster: Arc<Broadcaster>,
        sequence: Arc<Sequence>,
        network: Arc<dyn NetworkClient>,
    ) -> Self {
        Self {
            constants,
            blocks,
            pool,
            loader,
            broadcaster,
            sequence,
            network,
        }
    }

    /// A block announced by a peer. Ignored while syncing (the sync loop
    /// fetches its own pages) and while broadcasts are disabled.
    pub async fn post_block(&self, peer: &str, block: Block) -> ChainResult<ReceiveOutcome> {
        if !self.broadcaster.enabled() {
            return Err(ChainError::Network("block relaying is disabled".into()));
        }
        if self.loader.syncing() {
            debug!(peer = %peer, "ignoring posted block while syncing");
            return Ok(ReceiveOutcome::Ignored);
        }
        if block.compute_id() != block.id {
            self.network.penalize(peer, "block id mismatch");
            return Err(ChainError::Validation("block id does not match contents".into()));
        }
        let blocks = self.blocks.clone();
        let outcome = self
            .sequence
            .add("receive-block", async move {
                blocks.receive_block_from_network(block)
            })
            .await;
        if let Err(err) = &outcome {
            if err.is_non_retryable() {
                self.network.penalize(peer, "rejected block");
            }
        }
        outcome
    }

    /// Single synchronous transaction ingest.
    pub async fn post_transaction(&self, transaction: Transaction) -> ChainResult<TransactionId> {
        let id = transaction.id.clone();
        let pool = self.pool.clone();
        self.sequence
            .add("post-transaction", async move {
                pool.process_unconfirmed(transaction, true)
            })
            .await?;
        Ok(id)
    }

    /// Bundled ingest from a peer's shared pool. Per-item failures are
    /// logged and the batch continues.
    pub async fn post_transactions(
        &self,
        peer: &str,
        transactions: Vec<Transaction>,
    ) -> ChainResult<usize> {
        if !self.broadcaster.enabled() {
            return Err(ChainError::Network("transaction relaying is disabled".into()));
        }
        let mut accepted = 0;
        for transaction in transactions {
            match self.pool.add(transaction, true) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    debug!(peer = %peer, %err, "skipping relayed transaction");
                    if matches!(err, ChainError::Validation(_)) {
                        self.network.penalize(peer, "malformed transaction");
                    }
                }
            }
        }
        let pool = self.pool.clone();
        let processed = self
            .sequence
            .add("process-received", async move { Ok(pool.process_received(accepted)) })
            .await?;
        Ok(processed)
    }

    /// Up to 34 blocks following `last_id`.
    pub fn blocks(&self, last_id: &str) -> ChainResult<Vec<Block>> {
        self.blocks.load_blocks_data(last_id, BLOCKS_PER_PAGE)
    }

    /// Fork probe: the first of up to 1000 candidate ids we hold. Ids are
    /// comma-separated and must be numeric.
    pub fn blocks_common(&self, peer: &str, ids_csv: &str) -> ChainResult<Option<CommonBlock>> {
        let ids: Vec<BlockId> = ids_csv
            .split(',')
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.len() > MAX_COMMON_IDS {
            self.network.penalize(peer, "oversized common-block probe");
            return Err(ChainError::Validation(
                "ids property contains more than 1000 values".into(),
            ));
        }
        for id in &ids {
            if !id.bytes().all(|b| b.is_ascii_digit()) {
                self.network.penalize(peer, "malformed block id");
                return Err(ChainError::Validation(format!(
                    "invalid block id {id} in common-block probe"
                )));
            }
        }
        self.blocks.common_block(&ids)
    }

    /// The shared unconfirmed pool, bounded by the share limit.
    pub fn get_transactions(&self) -> Vec<Transaction> {
        self.pool
            .merged_transaction_list(false, self.constants.max_shared_transactions)
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;
use crate::types::{Block, BlockId, CommonBlock, Transaction};

/// Module state a peer advertises for one chain module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerModuleState {
    pub broadhash: String,
    pub height: u64,
}

/// Snapshot of a connected peer as reported by the network collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: String,
    /// State advertised for this chain's module alias, when present.
    pub module_state: Option<PeerModuleState>,
}

impl PeerSnapshot {
    pub fn height(&self) -> u64 {
        self.module_state.as_ref().map(|state| state.height).unwrap_or(0)
    }
}

/// The peer-to-peer transport is an external collaborator; the chain engine
/// drives it through this seam. Implementations own connection management,
/// timeouts and retries.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Connected peers advertising any module state.
    async fn connected_peers(&self) -> ChainResult<Vec<PeerSnapshot>>;

    async fn post_block(&self, peer: &str, block: &Block) -> ChainResult<()>;

    async fn post_transactions(&self, peer: &str, transactions: &[Transaction]) -> ChainResult<()>;

    /// Pull the shared unconfirmed pool from a peer.
    async fn fetch_transactions(&self, peer: &str) -> ChainResult<Vec<Transaction>>;

    /// Fetch up to one page of blocks following `last_id`.
    async fn fetch_blocks(&self, peer: &str, last_id: &BlockId) -> ChainResult<Vec<Block>>;

    /// Probe which of `ids` the peer has; the first match wins.
    async fn common_block(&self, peer: &str, ids: &[BlockId]) -> ChainResult<Option<CommonBlock>>;

    /// Flag a peer that sent malformed or hostile data.
    fn penalize(&self, peer: &str, reason: &str);
}

/// Stand-in used when the node runs without a peer-to-peer integration:
/// no peers, every outbound call is a no-op.
pub struct OfflineNetwork;

#[async_trait]
impl NetworkClient for OfflineNetwork {
    async fn connected_peers(&self) -> ChainResult<Vec<PeerSnapshot>> {
        Ok(Vec::new())
    }

    async fn post_block(&self, _peer: &str, _block: &Block) -> ChainResult<()> {
        Ok(())
    }

    async fn post_transactions(
        &self,
        _peer: &str,
        _transactions: &[Transaction],
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn fetch_transactions(&self, _peer: &str) -> ChainResult<Vec<Transaction>> {
        Ok(Vec::new())
    }

    async fn fetch_blocks(&self, _peer: &str, _last_id: &BlockId) -> ChainResult<Vec<Block>> {
        Ok(Vec::new())
    }

    async fn common_block(
        &self,
        _peer: &str,
        _ids: &[BlockId],
    ) -> ChainResult<Option<CommonBlock>> {
        Ok(None)
    }

    fn penalize(&self, _peer: &str, _reason: &str) {}
}

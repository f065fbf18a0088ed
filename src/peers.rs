use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ChainConstants;
use crate::errors::ChainResult;
use crate::interfaces::NetworkClient;

/// Broadhash consensus over the connected peer set. Consensus is advisory:
/// forging refuses under poor consensus unless forced.
pub struct Peers {
    constants: Arc<ChainConstants>,
    network: Arc<dyn NetworkClient>,
    forging_force: bool,
    last_consensus: RwLock<f64>,
}

impl Peers {
    pub fn new(
        constants: Arc<ChainConstants>,
        network: Arc<dyn NetworkClient>,
        forging_force: bool,
    ) -> Self {
        Self {
            constants,
            network,
            forging_force,
            last_consensus: RwLock::new(0.0),
        }
    }

    /// Share of connected peers whose advertised broadhash matches ours,
    /// as a percentage rounded to two decimals. The active set is clamped
    /// to `max_peers`.
    pub async fn calculate_consensus(&self, broadhash: &str) -> ChainResult<f64> {
        let peers = self.network.connected_peers().await?;
        let mut active = 0usize;
        let mut matched = 0usize;
        for peer in peers {
            let Some(state) = peer.module_state else {
                continue;
            };
            if active >= self.constants.max_peers {
                break;
            }
            active += 1;
            if state.broadhash == broadhash {
                matched += 1;
            }
        }
        let consensus = if active == 0 {
            0.0
        } else {
            (matched as f64 / active as f64 * 100.0 * 100.0).round() / 100.0
        };
        *self.last_consensus.write() = consensus;
        Ok(consensus)
    }

    /// The value computed by the most recent consensus refresh.
    pub fn last_consensus(&self) -> f64 {
        *self.last_consensus.read()
    }

    pub async fn is_poor_consensus(&self, broadhash: &str) -> ChainResult<bool> {
        if self.forging_force {
            return Ok(false);
        }
        let consensus = self.calculate_consensus(broadhash).await?;
        Ok(consensus < self.constants.min_broadhash_consensus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ChainError;
    use crate::interfaces::{PeerModuleState, PeerSnapshot};
    use crate::types::{Block, BlockId, CommonBlock, Transaction};
    use async_trait::async_trait;

    struct StaticPeers {
        peers: Vec<PeerSnapshot>,
    }

    #[async_trait]
    impl NetworkClient for StaticPeers {
        async fn connected_peers(&self) -> ChainResult<Vec<PeerSnapshot>> {
            Ok(self.peers.clone())
        }

        async fn post_block(&self, _peer: &str, _block: &Block) -> ChainResult<()> {
            Err(ChainError::Network("unsupported".into()))
        }

        async fn post_transactions(
            &self,
            _peer: &str,
            _transactions: &[Transaction],
        ) -> ChainResult<()> {
            Err(ChainError::Network("unsupported".into()))
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

    fn peer(id: &str, broadhash: Option<&str>) -> PeerSnapshot {
        PeerSnapshot {
            id: id.to_string(),
            module_state: broadhash.map(|broadhash| PeerModuleState {
                broadhash: broadhash.to_string(),
                height: 10,
            }),
        }
    }

    fn peers_with(snapshots: Vec<PeerSnapshot>, force: bool) -> Peers {
        Peers::new(
            Arc::new(ChainConstants::default()),
            Arc::new(StaticPeers { peers: snapshots }),
            force,
        )
    }

    #[tokio::test]
    async fn full_agreement_is_one_hundred() {
        let peers = peers_with(vec![peer("a", Some("bh")), peer("b", Some("bh"))], false);
        let consensus = peers.calculate_consensus("bh").await.expect("consensus");
        assert_eq!(consensus, 100.0);
        assert_eq!(peers.last_consensus(), 100.0);
    }

    #[tokio::test]
    async fn no_matches_is_zero() {
        let peers = peers_with(vec![peer("a", Some("other")), peer("b", None)], false);
        let consensus = peers.calculate_consensus("bh").await.expect("consensus");
        assert_eq!(consensus, 0.0);
    }

    #[tokio::test]
    async fn ratio_rounds_to_two_decimals() {
        let peers = peers_with(
            vec![
                peer("a", Some("bh")),
                peer("b", Some("other")),
                peer("c", Some("other")),
            ],
            false,
        );
        let consensus = peers.calculate_consensus("bh").await.expect("consensus");
        assert_eq!(consensus, 33.33);
    }

    #[tokio::test]
    async fn active_set_clamps_at_max_peers() {
        let mut snapshots = Vec::new();
        for index in 0..150 {
            snapshots.push(peer(&format!("p{index}"), Some("bh")));
        }
        let peers = peers_with(snapshots, false);
        let consensus = peers.calculate_consensus("bh").await.expect("consensus");
        assert_eq!(consensus, 100.0);
    }

    #[tokio::test]
    async fn forging_force_never_reports_poor_consensus() {
        let peers = peers_with(vec![peer("a", Some("other"))], true);
        assert!(!peers.is_poor_consensus("bh").await.expect("check"));
        let strict = peers_with(vec![peer("a", Some("other"))], false);
        assert!(strict.is_poor_consensus("bh").await.expect("check"));
    }
}

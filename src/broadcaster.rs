use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::BroadcastsConfig;
use crate::errors::ChainResult;
use crate::interfaces::NetworkClient;
use crate::types::{Block, Transaction};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AnnouncementKey {
    api: &'static str,
    id: String,
}

#[derive(Clone)]
enum Payload {
    Transaction(Arc<Transaction>),
    Block(Arc<Block>),
}

struct Announcement {
    key: AnnouncementKey,
    payload: Payload,
    relays_left: u32,
}

#[derive(Default)]
struct OutboundQueue {
    entries: VecDeque<Announcement>,
    keys: HashSet<AnnouncementKey>,
}

/// Batches outbound block and transaction announcements, flushing them to
/// a random peer subset on a fixed interval. Failures are per-peer and
/// non-fatal; an announcement stays queued until its relay budget runs out.
pub struct Broadcaster {
    config: BroadcastsConfig,
    network: Arc<dyn NetworkClient>,
    queue: Mutex<OutboundQueue>,
}

impl Broadcaster {
    pub fn new(config: BroadcastsConfig, network: Arc<dyn NetworkClient>) -> Self {
        Self {
            config,
            network,
            queue: Mutex::new(OutboundQueue::default()),
        }
    }

    /// Disabling broadcasts turns off both outbound batching and inbound
    /// relay handling; transport checks this flag too.
    pub fn enabled(&self) -> bool {
        self.config.active
    }

    pub fn enqueue_transaction(&self, transaction: Arc<Transaction>) {
        self.enqueue(
            AnnouncementKey {
                api: "postTransactions",
                id: transaction.id.clone(),
            },
            Payload::Transaction(transaction),
        );
    }

    pub fn enqueue_block(&self, block: Arc<Block>) {
        self.enqueue(
            AnnouncementKey {
                api: "postBlock",
                id: block.id.clone(),
            },
            Payload::Block(block),
        );
    }

    fn enqueue(&self, key: AnnouncementKey, payload: Payload) {
        if !self.config.active {
            return;
        }
        let mut queue = self.queue.lock();
        if !queue.keys.insert(key.clone()) {
            return;
        }
        queue.entries.push_back(Announcement {
            key,
            payload,
            relays_left: self.config.relay_lifetime,
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// One drain cycle: take a batch, pick a random peer subset and push
    /// every announcement to every selected peer.
    pub async fn flush(&self) -> ChainResult<()> {
        if !self.config.active {
            return Ok(());
        }
        let batch: Vec<(AnnouncementKey, Payload, u32)> = {
            let mut queue = self.queue.lock();
            let take = queue.entries.len().min(self.config.release_limit);
            (0..take)
                .filter_map(|_| queue.entries.pop_front())
                .map(|entry| (entry.key, entry.payload, entry.relays_left))
                .collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        let peers = self.network.connected_peers().await?;
        let selected: Vec<String> = {
            let mut rng = rand::thread_rng();
            peers
                .choose_multiple(&mut rng, self.config.broadcast_limit)
                .map(|peer| peer.id.clone())
                .collect()
        };
        debug!(
            announcements = batch.len(),
            peers = selected.len(),
            "flushing broadcast batch"
        );
        for (key, payload, relays_left) in batch {
            for peer in &selected {
                let result = match &payload {
                    Payload::Transaction(tx) => {
                        self.network
                            .post_transactions(peer, std::slice::from_ref(tx.as_ref()))
                            .await
                    }
                    Payload::Block(block) => self.network.post_block(peer, block).await,
                };
                if let Err(err) = result {
                    warn!(peer = %peer, api = key.api, %err, "broadcast to peer failed");
                }
            }
            let relays_left = relays_left.saturating_sub(1);
            let mut queue = self.queue.lock();
            if relays_left > 0 {
                queue.entries.push_back(Announcement {
                    key,
                    payload,
                    relays_left,
                });
            } else {
                queue.keys.remove(&key);
            }
        }
        Ok(())
    }

    /// Timer loop driven by the orchestrator; exits on shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.broadcast_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.flush().await {
                        warn!(%err, "broadcast cycle failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ChainError;
    use crate::interfaces::{PeerSnapshot, NetworkClient};
    use crate::types::{BlockId, CommonBlock};
    use async_trait::async_trait;
    use parking_lot::RwLock;

    #[derive(Default)]
    struct RecordingNetwork {
        peers: Vec<PeerSnapshot>,
        posted_blocks: RwLock<Vec<(String, BlockId)>>,
        posted_txs: RwLock<Vec<(String, String)>>,
        fail_peers: HashSet<String>,
    }

    #[async_trait]
    impl NetworkClient for RecordingNetwork {
        async fn connected_peers(&self) -> ChainResult<Vec<PeerSnapshot>> {
            Ok(self.peers.clone())
        }

        async fn post_block(&self, peer: &str, block: &Block) -> ChainResult<()> {
            if self.fail_peers.contains(peer) {
                return Err(ChainError::Network("unreachable".into()));
            }
            self.posted_blocks
                .write()
                .push((peer.to_string(), block.id.clone()));
            Ok(())
        }

        async fn post_transactions(
            &self,
            peer: &str,
            transactions: &[Transaction],
        ) -> ChainResult<()> {
            if self.fail_peers.contains(peer) {
                return Err(ChainError::Network("unreachable".into()));
            }
            for tx in transactions {
                self.posted_txs
                    .write()
                    .push((peer.to_string(), tx.id.clone()));
            }
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

    fn peer(id: &str) -> PeerSnapshot {
        PeerSnapshot {
            id: id.to_string(),
            module_state: None,
        }
    }

    fn sample_block() -> Arc<Block> {
        Arc::new(Block::genesis(0, Vec::new()))
    }

    #[tokio::test]
    async fn flush_posts_to_selected_peers_and_respects_ttl() {
        let network = Arc::new(RecordingNetwork {
            peers: vec![peer("a"), peer("b")],
            ..Default::default()
        });
        let mut config = BroadcastsConfig::default();
        config.relay_lifetime = 2;
        let broadcaster = Broadcaster::new(config, network.clone());
        broadcaster.enqueue_block(sample_block());
        assert_eq!(broadcaster.pending(), 1);

        broadcaster.flush().await.expect("flush");
        assert_eq!(network.posted_blocks.read().len(), 2);
        // One relay left, so the announcement is still pending.
        assert_eq!(broadcaster.pending(), 1);

        broadcaster.flush().await.expect("flush");
        assert_eq!(broadcaster.pending(), 0);
    }

    #[tokio::test]
    async fn duplicate_announcements_are_dropped() {
        let network = Arc::new(RecordingNetwork {
            peers: vec![peer("a")],
            ..Default::default()
        });
        let broadcaster = Broadcaster::new(BroadcastsConfig::default(), network);
        let block = sample_block();
        broadcaster.enqueue_block(block.clone());
        broadcaster.enqueue_block(block);
        assert_eq!(broadcaster.pending(), 1);
    }

    #[tokio::test]
    async fn per_peer_failures_do_not_abort_the_batch() {
        let mut fail_peers = HashSet::new();
        fail_peers.insert("a".to_string());
        let network = Arc::new(RecordingNetwork {
            peers: vec![peer("a"), peer("b")],
            fail_peers,
            ..Default::default()
        });
        let mut config = BroadcastsConfig::default();
        config.relay_lifetime = 1;
        let broadcaster = Broadcaster::new(config, network.clone());
        broadcaster.enqueue_block(sample_block());
        broadcaster.flush().await.expect("flush");
        assert_eq!(network.posted_blocks.read().len(), 1);
        assert_eq!(network.posted_blocks.read()[0].0, "b");
    }

    #[tokio::test]
    async fn disabled_broadcasts_never_enqueue() {
        let network = Arc::new(RecordingNetwork::default());
        let mut config = BroadcastsConfig::default();
        config.active = false;
        let broadcaster = Broadcaster::new(config, network);
        broadcaster.enqueue_block(sample_block());
        assert_eq!(broadcaster.pending(), 0);
        assert!(!broadcaster.enabled());
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::blocks::Blocks;
use crate::config::{ChainConstants, ForgingConfig};
use crate::crypto::{decrypt_secret, keypair_from_secret};
use crate::errors::{ChainError, ChainResult};
use crate::peers::Peers;
use crate::pool::TransactionPool;
use crate::rounds::Rounds;
use crate::sequence::Sequence;
use crate::slots::Slots;
use crate::types::Block;

/// Milliseconds between forging checks.
const FORGE_INTERVAL_MS: u64 = 1_000;

struct ForgingKey {
    keypair: Keypair,
    enabled: bool,
}

/// Delegate key custody and the slot-aligned block production loop.
pub struct Forger {
    config: ForgingConfig,
    constants: Arc<ChainConstants>,
    slots: Slots,
    blocks: Arc<Blocks>,
    pool: Arc<TransactionPool>,
    rounds: Arc<Rounds>,
    peers: Arc<Peers>,
    sequence: Arc<Sequence>,
    keys: RwLock<HashMap<String, ForgingKey>>,
    last_forged_slot: RwLock<Option<u64>>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ForgingStatus {
    pub public_key: String,
    pub forging: bool,
}

impl Forger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ForgingConfig,
        constants: Arc<ChainConstants>,
        blocks: Arc<Blocks>,
        pool: Arc<TransactionPool>,
        rounds: Arc<Rounds>,
        peers: Arc<Peers>,
        sequence: Arc<Sequence>,
    ) -> Self {
        let slots = Slots::new(&constants);
        Self {
            config,
            constants,
            slots,
            blocks,
            pool,
            rounds,
            peers,
            sequence,
            keys: RwLock::new(HashMap::new()),
            last_forged_slot: RwLock::new(None),
        }
    }

    /// Decrypt every configured delegate key with the default password and
    /// keep the keypairs in memory, keyed by public key.
    pub fn load_delegates(&self) -> ChainResult<usize> {
        if self.config.delegates.is_empty() {
            return Ok(0);
        }
        let password = self.config.default_password.as_deref().ok_or_else(|| {
            ChainError::Config("forging delegates configured without a default password".into())
        })?;
        let mut keys = self.keys.write();
        for entry in &self.config.delegates {
            let keypair = self.unlock(&entry.public_key, &entry.encrypted_secret, password)?;
            keys.insert(
                entry.public_key.clone(),
                ForgingKey {
                    keypair,
                    enabled: true,
                },
            );
        }
        info!(delegates = keys.len(), "loaded forging delegates");
        Ok(keys.len())
    }

    fn unlock(
        &self,
        public_key: &str,
        encrypted_secret: &str,
        password: &str,
    ) -> ChainResult<Keypair> {
        let secret = decrypt_secret(encrypted_secret, password)?;
        let keypair = keypair_from_secret(&secret)?;
        if hex::encode(keypair.public.to_bytes()) != public_key {
            return Err(ChainError::Config(format!(
                "decrypted key does not match configured public key {public_key}"
            )));
        }
        Ok(keypair)
    }

    /// Toggle one delegate. The password must decrypt that delegate's key
    /// even when turning forging off.
    pub fn update_forging_status(
        &self,
        public_key: &str,
        password: &str,
        forging: bool,
    ) -> ChainResult<ForgingStatus> {
        let entry = self
            .config
            .delegates
            .iter()
            .find(|entry| entry.public_key == public_key)
            .ok_or_else(|| {
                ChainError::Config(format!("delegate {public_key} is not configured"))
            })?;
        let keypair = self.unlock(&entry.public_key, &entry.encrypted_secret, password)?;
        let mut keys = self.keys.write();
        keys.insert(
            public_key.to_string(),
            ForgingKey {
                keypair,
                enabled: forging,
            },
        );
        Ok(ForgingStatus {
            public_key: public_key.to_string(),
            forging,
        })
    }

    pub fn forging_status(&self) -> Vec<ForgingStatus> {
        self.keys
            .read()
            .iter()
            .map(|(public_key, key)| ForgingStatus {
                public_key: public_key.clone(),
                forging: key.enabled,
            })
            .collect()
    }

    /// Refresh the round schedule ahead of the next slot.
    pub fn before_forge(&self) -> ChainResult<()> {
        let next_height = self.blocks.height() + 1;
        let round = self.slots.calc_round(next_height);
        self.rounds.generate_delegate_list(round, None).map(|_| ())
    }

    /// One forging attempt. Skips quietly when the slot is not ours, is
    /// already forged, or no enabled key matches; refuses under poor
    /// consensus unless forced.
    pub async fn forge(&self) -> ChainResult<bool> {
        let last = self.blocks.last_block();
        let current_slot = self.slots.slot_number(None);
        let last_slot = self.slots.slot_number(Some(last.header.timestamp));
        if current_slot <= last_slot {
            return Ok(false);
        }
        if *self.last_forged_slot.read() == Some(current_slot) {
            return Ok(false);
        }
        let height = last.header.height + 1;
        let round = self.slots.calc_round(height);
        let delegate = self.rounds.delegate_for_slot(current_slot, round)?;
        {
            let keys = self.keys.read();
            match keys.get(&delegate) {
                Some(key) if key.enabled => {}
                _ => return Ok(false),
            }
        }
        let broadhash = self.blocks.broadhash();
        if self.peers.is_poor_consensus(&broadhash).await? {
            warn!(
                consensus = self.peers.last_consensus(),
                "refusing to forge under poor broadhash consensus"
            );
            return Ok(false);
        }

        let transactions = self.select_transactions();
        let timestamp = self.slots.slot_time(current_slot);
        let reward = self.rounds.calculate_reward(height);
        let block = {
            let keys = self.keys.read();
            let key = keys
                .get(&delegate)
                .ok_or_else(|| ChainError::Config("forging key disappeared".into()))?;
            Block::build(
                height,
                Some(last.id.clone()),
                timestamp,
                reward,
                transactions,
                &key.keypair,
            )
        };
        info!(
            height,
            slot = current_slot,
            delegate = %delegate,
            transactions = block.transactions.len(),
            "forging block"
        );
        self.blocks.process_block(block, true)?;
        *self.last_forged_slot.write() = Some(current_slot);
        Ok(true)
    }

    /// Ready transactions within the block's count and payload budgets.
    fn select_transactions(&self) -> Vec<crate::types::Transaction> {
        let candidates = self
            .pool
            .merged_transaction_list(false, self.constants.max_transactions_per_block);
        let mut selected = Vec::with_capacity(candidates.len());
        let mut payload = 0usize;
        for tx in candidates {
            let size = tx.size();
            if payload + size > self.constants.max_payload_length {
                continue;
            }
            payload += size;
            selected.push(tx);
        }
        selected
    }

    /// Timer loop: refresh the schedule, then attempt to forge under the
    /// main sequence.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(FORGE_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.keys.read().values().all(|key| !key.enabled) {
                        continue;
                    }
                    if let Err(err) = self.before_forge() {
                        debug!(%err, "delegate schedule refresh failed");
                        continue;
                    }
                    let forger = self.clone();
                    let result = self
                        .sequence
                        .add("forge", async move { forger.forge().await })
                        .await;
                    if let Err(err) = result {
                        warn!(%err, "forging attempt failed");
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

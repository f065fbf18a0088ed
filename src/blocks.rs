use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{ChainEvent, EventBus};
use crate::config::ChainConstants;
use crate::crypto::{hash, public_key_from_hex};
use crate::errors::{ChainError, ChainResult};
use crate::ledger::Ledger;
use crate::pool::TransactionPool;
use crate::rounds::Rounds;
use crate::slots::Slots;
use crate::storage::Storage;
use crate::types::{Block, BlockId, BlockMetadata, Transaction, TransactionId};

/// Page size served to peers fetching blocks.
pub const BLOCKS_PER_PAGE: usize = 34;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    Loading,
    Synced,
    Syncing,
    Rebuilding,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Appended on top of the current tip.
    Accepted,
    /// Same block we already hold.
    Ignored,
    /// Competing block replaced the tip.
    ForkResolved,
    /// Not applicable to the tip; sync was requested when it was ahead.
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    GenesisApplied,
    Loaded,
    /// Replay for a rebuild finished at the requested round.
    RebuildCompleted { round: u64 },
}

/// The chain state machine. Owns the tip, the broadhash and the receipt
/// clock; every mutation runs inside the main sequence.
pub struct Blocks {
    constants: Arc<ChainConstants>,
    slots: Slots,
    storage: Storage,
    ledger: Arc<Ledger>,
    pool: Arc<TransactionPool>,
    rounds: Arc<Rounds>,
    bus: Arc<EventBus>,
    last_block: RwLock<Option<Block>>,
    last_receipt: RwLock<u64>,
    broadhash: RwLock<String>,
    state: RwLock<ChainState>,
    sync_requested: AtomicBool,
}

impl Blocks {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        constants: Arc<ChainConstants>,
        storage: Storage,
        ledger: Arc<Ledger>,
        pool: Arc<TransactionPool>,
        rounds: Arc<Rounds>,
        bus: Arc<EventBus>,
    ) -> Self {
        let slots = Slots::new(&constants);
        Self {
            constants,
            slots,
            storage,
            ledger,
            pool,
            rounds,
            bus,
            last_block: RwLock::new(None),
            last_receipt: RwLock::new(now_secs()),
            broadhash: RwLock::new(String::new()),
            state: RwLock::new(ChainState::Loading),
            sync_requested: AtomicBool::new(false),
        }
    }

    pub fn last_block(&self) -> Block {
        self.last_block
            .read()
            .clone()
            .expect("blockchain not loaded")
    }

    pub fn height(&self) -> u64 {
        self.last_block.read().as_ref().map(|b| b.header.height).unwrap_or(0)
    }

    pub fn broadhash(&self) -> String {
        self.broadhash.read().clone()
    }

    pub fn state(&self) -> ChainState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ChainState) {
        *self.state.write() = state;
    }

    pub fn is_stale(&self) -> bool {
        now_secs().saturating_sub(*self.last_receipt.read()) > self.constants.block_receipt_timeout
    }

    pub fn last_receipt(&self) -> u64 {
        *self.last_receipt.read()
    }

    /// Set when a rejected network block was ahead of the tip; drained by
    /// the sync timer.
    pub fn take_sync_request(&self) -> bool {
        self.sync_requested.swap(false, Ordering::SeqCst)
    }

    /// Boot entry point. Applies genesis on an empty store, otherwise
    /// verifies the stored chain and, for a rebuild, replays it from
    /// genesis up to the requested round.
    pub fn load_blockchain(
        &self,
        genesis: Block,
        rebuild_up_to_round: Option<u64>,
        load_per_iteration: usize,
    ) -> ChainResult<LoadOutcome> {
        self.set_state(ChainState::Loading);
        let tip = self.storage.tip()?;
        let outcome = match (tip, rebuild_up_to_round) {
            (None, _) => {
                self.apply_genesis_block(genesis)?;
                LoadOutcome::GenesisApplied
            }
            (Some(_), Some(round)) => {
                self.set_state(ChainState::Rebuilding);
                let reached = self.rebuild(genesis, round)?;
                return Ok(LoadOutcome::RebuildCompleted { round: reached });
            }
            (Some(tip), None) => {
                self.verify_chain_integrity(tip.height, load_per_iteration.max(1))?;
                let block = self
                    .storage
                    .read_block(tip.height)?
                    .ok_or_else(|| ChainError::State("tip block missing from storage".into()))?;
                *self.last_block.write() = Some(block);
                self.refresh_broadhash(false)?;
                LoadOutcome::Loaded
            }
        };
        self.set_state(ChainState::Synced);
        self.touch_receipt();
        Ok(outcome)
    }

    /// Persist the genesis block and apply its transactions. Genesis is
    /// unsigned and exempt from slot checks.
    pub fn apply_genesis_block(&self, genesis: Block) -> ChainResult<()> {
        if !genesis.is_genesis() {
            return Err(ChainError::Consensus("genesis block malformed".into()));
        }
        if genesis.compute_id() != genesis.id {
            return Err(ChainError::Consensus("genesis id mismatch".into()));
        }
        for tx in &genesis.transactions {
            self.ledger.apply_transaction(tx)?;
        }
        let accounts = self.ledger.take_dirty_accounts();
        let memberships = self.ledger.take_dirty_memberships();
        self.storage
            .append_block(&genesis, &accounts, &memberships, &[])?;
        info!(id = %genesis.id, "applied genesis block");
        *self.last_block.write() = Some(genesis);
        self.refresh_broadhash(false)?;
        Ok(())
    }

    /// Replay the stored chain from genesis, stopping once the target
    /// round is reached. The caller shuts the process down afterwards.
    fn rebuild(&self, genesis: Block, target_round: u64) -> ChainResult<u64> {
        let max_height = self.storage.max_height()?;
        let stored_genesis = self
            .storage
            .read_block(1)?
            .ok_or_else(|| ChainError::State("genesis missing from storage".into()))?;
        if stored_genesis.id != genesis.id {
            return Err(ChainError::Consensus("stored genesis does not match".into()));
        }
        for tx in &genesis.transactions {
            self.ledger.apply_transaction(tx)?;
        }
        *self.last_block.write() = Some(stored_genesis);
        let mut height = 2;
        while height <= max_height {
            let round = self.slots.calc_round(height);
            if round > target_round {
                break;
            }
            let block = self
                .storage
                .read_block(height)?
                .ok_or_else(|| ChainError::State(format!("block {height} missing during rebuild")))?;
            for tx in &block.transactions {
                self.ledger.apply_transaction(tx)?;
            }
            *self.last_block.write() = Some(block);
            height += 1;
        }
        let reached = self.slots.calc_round(self.height());
        info!(round = reached, "rebuild replay finished");
        Ok(reached)
    }

    /// Link and id integrity over the stored chain, read in pages.
    fn verify_chain_integrity(&self, tip_height: u64, page_size: usize) -> ChainResult<()> {
        let mut previous: Option<Block> = None;
        let mut verified = 0u64;
        while verified < tip_height {
            let page = self.storage.blocks_after(verified, page_size)?;
            if page.is_empty() {
                return Err(ChainError::State(format!(
                    "missing block at height {}",
                    verified + 1
                )));
            }
            for block in page {
                if block.header.height != verified + 1 {
                    return Err(ChainError::State("height gap in stored chain".into()));
                }
                if block.compute_id() != block.id {
                    return Err(ChainError::State(format!(
                        "stored block {} fails id verification",
                        block.header.height
                    )));
                }
                if let Some(previous) = previous.as_ref() {
                    if block.header.previous_block_id.as_deref() != Some(previous.id.as_str()) {
                        return Err(ChainError::State("broken previous-id link".into()));
                    }
                }
                verified = block.header.height;
                previous = Some(block);
            }
        }
        debug!(tip_height, "verified stored chain integrity");
        Ok(())
    }

    /// Fork rules for a block arriving from a peer. Must run inside the
    /// main sequence.
    pub fn receive_block_from_network(&self, block: Block) -> ChainResult<ReceiveOutcome> {
        let last = self.last_block();
        if block.header.previous_block_id.as_deref() == Some(last.id.as_str())
            && block.header.height == last.header.height + 1
        {
            // Announced blocks must sit close to the wall clock; sync pages
            // are exempt because they replay history.
            let slot = self.slots.slot_number(Some(block.header.timestamp));
            let current_slot = self.slots.slot_number(None);
            if slot + self.constants.block_slot_window < current_slot {
                return Err(ChainError::Consensus(
                    "block slot outside the receive window".into(),
                ));
            }
            self.process_block(block, false)?;
            return Ok(ReceiveOutcome::Accepted);
        }
        if block.header.height == last.header.height && block.id == last.id {
            return Ok(ReceiveOutcome::Ignored);
        }
        if block.header.height == last.header.height
            && block.header.previous_block_id == last.header.previous_block_id
            && block.id != last.id
        {
            let incoming_wins = block.header.timestamp < last.header.timestamp
                || (block.header.timestamp == last.header.timestamp
                    && block.numeric_id_value() < last.numeric_id_value());
            if incoming_wins {
                info!(
                    ours = %last.id,
                    theirs = %block.id,
                    height = block.header.height,
                    "resolving fork in favor of earlier block"
                );
                self.delete_last_block()?;
                self.process_block(block, false)?;
                return Ok(ReceiveOutcome::ForkResolved);
            }
            return Err(ChainError::Consensus(
                "competing block loses the fork tiebreak".into(),
            ));
        }
        if block.header.height > last.header.height {
            self.sync_requested.store(true, Ordering::SeqCst);
            warn!(
                height = block.header.height,
                tip = last.header.height,
                "received block ahead of tip, requesting sync"
            );
        }
        Ok(ReceiveOutcome::Rejected)
    }

    /// Consensus checks that do not touch account state.
    pub fn verify_block(&self, block: &Block, last: &Block) -> ChainResult<()> {
        if block.header.height != last.header.height + 1 {
            return Err(ChainError::Consensus("unexpected block height".into()));
        }
        if block.header.previous_block_id.as_deref() != Some(last.id.as_str()) {
            return Err(ChainError::Consensus("previous block id mismatch".into()));
        }
        if block.compute_id() != block.id {
            return Err(ChainError::Consensus("block id does not match contents".into()));
        }
        block.verify_payload()?;
        if block.transactions.len() > self.constants.max_transactions_per_block {
            return Err(ChainError::Consensus("too many transactions in block".into()));
        }
        if block.header.payload_length > self.constants.max_payload_length {
            return Err(ChainError::Consensus("payload exceeds maximum length".into()));
        }
        let expected_reward = self.rounds.calculate_reward(block.header.height);
        if block.header.reward != expected_reward {
            return Err(ChainError::Consensus(format!(
                "invalid block reward {} (expected {expected_reward})",
                block.header.reward
            )));
        }
        let slot = self.slots.slot_number(Some(block.header.timestamp));
        let last_slot = self.slots.slot_number(Some(last.header.timestamp));
        if slot <= last_slot {
            return Err(ChainError::Consensus("block slot precedes the chain tip".into()));
        }
        let current_slot = self.slots.slot_number(None);
        if slot > current_slot {
            return Err(ChainError::Consensus("block timestamp is in the future".into()));
        }
        let round = self.slots.calc_round(block.header.height);
        let expected_generator = self.rounds.delegate_for_slot(slot, round)?;
        if expected_generator != block.header.generator_public_key {
            return Err(ChainError::Consensus(format!(
                "slot {slot} belongs to another delegate"
            )));
        }
        let generator = public_key_from_hex(&block.header.generator_public_key)?;
        block.verify_signature(&generator)?;
        Ok(())
    }

    /// The append pipeline: verify, apply, persist atomically, update the
    /// tip, emit events. Any failure leaves chain state untouched.
    pub fn process_block(&self, block: Block, broadcast: bool) -> ChainResult<()> {
        let last = self.last_block();
        self.verify_block(&block, &last)?;

        for tx in &block.transactions {
            self.ledger.check_allowed(tx, &last)?;
            tx.validate_schema()?;
            self.ledger.verify_transaction(tx)?;
        }

        let mut applied: Vec<&Transaction> = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if let Err(err) = self.ledger.apply_transaction(tx) {
                self.unwind_applied(&applied);
                return Err(err);
            }
            applied.push(tx);
        }
        let generator_address =
            match crate::crypto::address_from_public_key_hex(&block.header.generator_public_key) {
                Ok(address) => address,
                Err(err) => {
                    self.unwind_applied(&applied);
                    return Err(err);
                }
            };
        if block.header.reward > 0 {
            self.ledger
                .credit(&generator_address, u128::from(block.header.reward));
        }

        let reward_rows = if self.rounds.is_round_end(block.header.height) {
            match self.rounds.settle_round(&block) {
                Ok(rows) => rows,
                Err(err) => {
                    self.undo_generator_reward(&generator_address, block.header.reward);
                    self.unwind_applied(&applied);
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        let accounts = self.ledger.take_dirty_accounts();
        let memberships = self.ledger.take_dirty_memberships();
        if let Err(err) = self
            .storage
            .append_block(&block, &accounts, &memberships, &reward_rows)
        {
            // The batch never landed; revert the in-memory effects.
            for row in &reward_rows {
                if row.fees > 0 {
                    if let Ok(address) =
                        crate::crypto::address_from_public_key_hex(&row.generator_public_key)
                    {
                        let _ = self.ledger.debit(&address, u128::from(row.fees));
                    }
                }
            }
            self.undo_generator_reward(&generator_address, block.header.reward);
            self.unwind_applied(&applied);
            self.ledger.take_dirty_accounts();
            self.ledger.take_dirty_memberships();
            return Err(err);
        }
        drop(applied);

        self.pool.on_confirmed(&block.transactions);
        let confirmed_ids: Vec<TransactionId> =
            block.transactions.iter().map(|tx| tx.id.clone()).collect();
        let block = Arc::new(block);
        *self.last_block.write() = Some((*block).clone());
        self.touch_receipt();
        info!(
            height = block.header.height,
            id = %block.id,
            transactions = block.transactions.len(),
            "applied block"
        );
        if !confirmed_ids.is_empty() {
            self.bus
                .publish(&ChainEvent::ConfirmedTransactions { ids: confirmed_ids });
        }
        self.bus.publish(&ChainEvent::NewBlock { block: block.clone() });
        self.refresh_broadhash(true)?;
        if broadcast {
            self.bus
                .publish(&ChainEvent::BroadcastBlock { block });
        }
        Ok(())
    }

    fn unwind_applied(&self, applied: &[&Transaction]) {
        for tx in applied.iter().rev() {
            if let Err(err) = self.ledger.undo_transaction(tx) {
                warn!(%err, id = %tx.id, "failed to unwind transaction after aborted append");
            }
        }
    }

    fn undo_generator_reward(&self, address: &str, reward: u64) {
        if reward > 0 {
            if let Err(err) = self.ledger.debit(address, u128::from(reward)) {
                warn!(%err, "failed to revert generator reward after aborted append");
            }
        }
    }

    /// Remove the tip block, reverse its effects and hand its transactions
    /// back to the pool.
    pub fn delete_last_block(&self) -> ChainResult<Block> {
        let last = self.last_block();
        if last.is_genesis() {
            return Err(ChainError::State("cannot delete the genesis block".into()));
        }
        let previous_id = last
            .header
            .previous_block_id
            .clone()
            .ok_or_else(|| ChainError::State("tip has no previous block".into()))?;
        let previous = self
            .storage
            .block_by_id(&previous_id)?
            .ok_or_else(|| ChainError::State("previous block missing from storage".into()))?;

        for tx in last.transactions.iter().rev() {
            self.ledger.undo_transaction(tx)?;
        }
        if last.header.reward > 0 {
            let generator =
                crate::crypto::address_from_public_key_hex(&last.header.generator_public_key)?;
            self.ledger.debit(&generator, u128::from(last.header.reward))?;
        }
        let reverted_round = if self.rounds.is_round_end(last.header.height) {
            Some(self.rounds.revert_round(&last)?)
        } else {
            None
        };

        let accounts = self.ledger.take_dirty_accounts();
        let memberships = self.ledger.take_dirty_memberships();
        self.storage.delete_block(
            &last,
            &BlockMetadata::from(&previous),
            &accounts,
            &memberships,
            reverted_round,
        )?;

        *self.last_block.write() = Some(previous);
        self.refresh_broadhash(true)?;
        info!(height = last.header.height, id = %last.id, "deleted last block");
        self.pool.on_deleted(&last.transactions);
        let deleted_ids: Vec<TransactionId> = last.transactions.iter().map(|tx| tx.id.clone()).collect();
        if !deleted_ids.is_empty() {
            self.bus
                .publish(&ChainEvent::DeletedTransactions { ids: deleted_ids });
        }
        self.bus.publish(&ChainEvent::DeleteBlock {
            block: Arc::new(last.clone()),
        });
        Ok(last)
    }

    pub fn block_at_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.storage.read_block(height)
    }

    pub fn common_block(&self, ids: &[BlockId]) -> ChainResult<Option<crate::types::CommonBlock>> {
        self.storage.common_block(ids)
    }

    /// Up to `limit` blocks following `last_id`, for peers catching up.
    pub fn load_blocks_data(&self, last_id: &str, limit: usize) -> ChainResult<Vec<Block>> {
        let after_height = match self.storage.block_height_by_id(last_id)? {
            Some(height) => height,
            None => return Ok(Vec::new()),
        };
        self.storage
            .blocks_after(after_height, limit.min(BLOCKS_PER_PAGE))
    }

    fn touch_receipt(&self) {
        *self.last_receipt.write() = now_secs();
    }

    /// Recompute the fingerprint over the last five block ids and publish
    /// a change event when it moves.
    fn refresh_broadhash(&self, publish: bool) -> ChainResult<()> {
        let tip = self.last_block();
        let mut ids = Vec::with_capacity(5);
        let start = tip.header.height.saturating_sub(4).max(1);
        for height in start..tip.header.height {
            if let Some(block) = self.storage.read_block(height)? {
                ids.push(block.id);
            }
        }
        ids.push(tip.id.clone());
        let broadhash = hex::encode(hash(ids.join(",").as_bytes()));
        let changed = {
            let mut current = self.broadhash.write();
            if *current != broadhash {
                *current = broadhash.clone();
                true
            } else {
                false
            }
        };
        if changed && publish {
            self.bus.publish(&ChainEvent::NewBroadhash {
                broadhash,
                height: tip.header.height,
            });
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

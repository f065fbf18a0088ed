use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use malachite::Natural;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::ChainConstants;
use crate::crypto::{address_from_public_key_hex, hash};
use crate::errors::{ChainError, ChainResult};
use crate::ledger::Ledger;
use crate::slots::Slots;
use crate::storage::{RoundRewardRow, Storage};
use crate::types::Block;

/// Round bookkeeping: the per-round delegate schedule and the fee
/// settlement that runs when a round closes.
pub struct Rounds {
    constants: Arc<ChainConstants>,
    slots: Slots,
    ledger: Arc<Ledger>,
    storage: Storage,
    ticking: AtomicBool,
    /// Cached schedule for the round it was generated for.
    cached_list: RwLock<Option<(u64, Vec<String>)>>,
}

impl Rounds {
    pub fn new(
        constants: Arc<ChainConstants>,
        ledger: Arc<Ledger>,
        storage: Storage,
    ) -> Self {
        let slots = Slots::new(&constants);
        Self {
            constants,
            slots,
            ledger,
            storage,
            ticking: AtomicBool::new(false),
            cached_list: RwLock::new(None),
        }
    }

    /// True while a round boundary settlement is being applied.
    pub fn ticking(&self) -> bool {
        self.ticking.load(Ordering::SeqCst)
    }

    /// The delegate schedule for a round: top-voted delegates shuffled with
    /// a seed derived from the previous round's last block id. `source`
    /// overrides the seed during replay and rebuild.
    pub fn generate_delegate_list(
        &self,
        round: u64,
        source: Option<&str>,
    ) -> ChainResult<Vec<String>> {
        if let Some((cached_round, list)) = self.cached_list.read().as_ref() {
            if *cached_round == round && source.is_none() {
                return Ok(list.clone());
            }
        }
        let seed_source = match source {
            Some(source) => source.to_string(),
            None => self.round_seed(round)?,
        };
        let mut list = self
            .ledger
            .top_delegates(self.constants.active_delegates as usize);
        if list.is_empty() {
            return Err(ChainError::State("no registered delegates".into()));
        }
        shuffle_delegates(&mut list, seed_source.as_bytes());
        if source.is_none() {
            *self.cached_list.write() = Some((round, list.clone()));
        }
        Ok(list)
    }

    pub fn invalidate_schedule(&self) {
        *self.cached_list.write() = None;
    }

    fn round_seed(&self, round: u64) -> ChainResult<String> {
        if round <= 1 {
            return Ok(round.to_string());
        }
        let previous_round_end = self.slots.round_end_height(round - 1);
        match self.storage.read_block(previous_round_end)? {
            Some(block) => Ok(block.id),
            // During replay the boundary block may not be stored yet.
            None => Ok(round.to_string()),
        }
    }

    /// The delegate assigned to a slot in the given round's schedule.
    pub fn delegate_for_slot(&self, slot: u64, round: u64) -> ChainResult<String> {
        let list = self.generate_delegate_list(round, None)?;
        let index = self.slots.delegate_slot_index(slot) % list.len();
        Ok(list[index].clone())
    }

    pub fn calculate_milestone(&self, height: u64) -> u64 {
        let rewards = &self.constants.rewards;
        if height < rewards.offset {
            return 0;
        }
        ((height - rewards.offset) / rewards.distance)
            .min(rewards.milestones.len() as u64 - 1)
    }

    pub fn calculate_reward(&self, height: u64) -> u64 {
        let rewards = &self.constants.rewards;
        if height < rewards.offset {
            return 0;
        }
        rewards.milestones[self.calculate_milestone(height) as usize]
    }

    /// Total supply at a height: the genesis amount plus every block reward
    /// paid so far. Unbounded arithmetic, rendered as a decimal string at
    /// the query surface.
    pub fn calculate_supply(&self, height: u64) -> Natural {
        let mut supply = Natural::from(self.constants.total_amount);
        let rewards = &self.constants.rewards;
        if height < rewards.offset {
            return supply;
        }
        let mut processed = rewards.offset - 1;
        for (index, milestone) in rewards.milestones.iter().enumerate() {
            let last_milestone = index == rewards.milestones.len() - 1;
            let milestone_end = rewards.offset - 1 + (index as u64 + 1) * rewards.distance;
            let span_end = if last_milestone {
                height
            } else {
                milestone_end.min(height)
            };
            if span_end > processed {
                supply += Natural::from(*milestone) * Natural::from(span_end - processed);
                processed = span_end;
            }
            if processed >= height {
                break;
            }
        }
        supply
    }

    /// Whether appending a block at this height closes its round.
    pub fn is_round_end(&self, height: u64) -> bool {
        height == self.slots.round_end_height(self.slots.calc_round(height))
    }

    /// Fee settlement for a closing round. The round's total fees are split
    /// evenly per forged block; the remainder goes to the forger of the
    /// closing block. Credits are applied to the ledger and returned as
    /// rows for atomic persistence with the closing block.
    pub fn settle_round(&self, closing_block: &Block) -> ChainResult<Vec<RoundRewardRow>> {
        let round = self.slots.calc_round(closing_block.header.height);
        self.ticking.store(true, Ordering::SeqCst);
        let result = self.settle_round_inner(round, closing_block);
        self.ticking.store(false, Ordering::SeqCst);
        result
    }

    fn settle_round_inner(
        &self,
        round: u64,
        closing_block: &Block,
    ) -> ChainResult<Vec<RoundRewardRow>> {
        let blocks = self.round_blocks(round, closing_block)?;
        let total_fees: u64 = blocks.iter().map(|(_, _, fees, _)| fees).sum();
        let share = total_fees / u64::from(self.constants.active_delegates);
        let remainder = total_fees - share * blocks.len() as u64;
        let mut rows = Vec::with_capacity(blocks.len());
        let last_index = blocks.len() - 1;
        for (index, (height, generator, _, reward)) in blocks.into_iter().enumerate() {
            let mut fees = share;
            if index == last_index {
                fees += remainder;
            }
            // The unsigned genesis block carries no generator to pay.
            if fees > 0 && !generator.is_empty() {
                let address = address_from_public_key_hex(&generator)?;
                self.ledger.credit(&address, u128::from(fees));
            }
            rows.push(RoundRewardRow {
                round,
                height,
                generator_public_key: generator,
                fees,
                reward,
            });
        }
        debug!(round, total_fees, "settled round fees");
        self.invalidate_schedule();
        Ok(rows)
    }

    /// Reverse a round settlement when its closing block is deleted.
    pub fn revert_round(&self, closing_block: &Block) -> ChainResult<u64> {
        let round = self.slots.calc_round(closing_block.header.height);
        self.ticking.store(true, Ordering::SeqCst);
        let result = (|| {
            for row in self.storage.round_rewards(round)? {
                if row.fees > 0 && !row.generator_public_key.is_empty() {
                    let address = address_from_public_key_hex(&row.generator_public_key)?;
                    self.ledger.debit(&address, u128::from(row.fees))?;
                }
            }
            Ok(round)
        })();
        self.ticking.store(false, Ordering::SeqCst);
        self.invalidate_schedule();
        result
    }

    fn round_blocks(
        &self,
        round: u64,
        closing_block: &Block,
    ) -> ChainResult<Vec<(u64, String, u64, u64)>> {
        let start = self.slots.round_start_height(round);
        let mut blocks: HashMap<u64, (String, u64, u64)> = HashMap::new();
        for block in self
            .storage
            .blocks_after(start.saturating_sub(1), self.constants.active_delegates as usize)?
        {
            if block.header.height >= start && block.header.height < closing_block.header.height {
                blocks.insert(
                    block.header.height,
                    (
                        block.header.generator_public_key.clone(),
                        block.header.total_fee,
                        block.header.reward,
                    ),
                );
            }
        }
        blocks.insert(
            closing_block.header.height,
            (
                closing_block.header.generator_public_key.clone(),
                closing_block.header.total_fee,
                closing_block.header.reward,
            ),
        );
        let mut ordered: Vec<(u64, String, u64, u64)> = blocks
            .into_iter()
            .map(|(height, (generator, fees, reward))| (height, generator, fees, reward))
            .collect();
        ordered.sort_by_key(|(height, ..)| *height);
        Ok(ordered)
    }
}

/// Deterministic in-place shuffle: a rolling hash of the seed drives
/// repeated swaps, four per digest refresh.
fn shuffle_delegates(list: &mut [String], seed_source: &[u8]) {
    let count = list.len();
    if count == 0 {
        return;
    }
    let mut seed = hash(seed_source);
    let mut i = 0;
    while i < count {
        for x in 0..4 {
            if i >= count {
                break;
            }
            let new_index = seed[x] as usize % count;
            list.swap(new_index, i);
            i += 1;
        }
        seed = hash(&seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::HandlerRegistry;
    use crate::types::VoteWeight;
    use tempfile::tempdir;

    fn rounds_fixture(delegates: usize) -> (Rounds, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open storage");
        let ledger = Arc::new(Ledger::new(HandlerRegistry::builtin()));
        for index in 0..delegates {
            ledger.with_account_mut(&format!("delegate-{index:03}"), |account| {
                account.is_delegate = true;
                account.public_key = Some(format!("{index:02x}").repeat(32));
                account.vote_weight = VoteWeight::from_u128((delegates - index) as u128);
            });
        }
        let constants = Arc::new(ChainConstants::default());
        (Rounds::new(constants, ledger, storage), dir)
    }

    #[test]
    fn delegate_list_is_deterministic_per_seed() {
        let (rounds, _dir) = rounds_fixture(5);
        let first = rounds
            .generate_delegate_list(1, Some("seed"))
            .expect("list");
        let second = rounds
            .generate_delegate_list(1, Some("seed"))
            .expect("list");
        assert_eq!(first, second);
        let other = rounds
            .generate_delegate_list(1, Some("other-seed"))
            .expect("list");
        assert_eq!(first.len(), other.len());
        assert_ne!(first, other);
    }

    #[test]
    fn shuffle_keeps_every_delegate() {
        let mut list: Vec<String> = (0..101).map(|i| format!("pk{i}")).collect();
        let mut expected = list.clone();
        shuffle_delegates(&mut list, b"round-7");
        expected.sort();
        let mut shuffled = list.clone();
        shuffled.sort();
        assert_eq!(shuffled, expected);
    }

    #[test]
    fn milestone_and_reward_follow_the_schedule() {
        let (rounds, _dir) = rounds_fixture(1);
        let offset = rounds.constants.rewards.offset;
        let distance = rounds.constants.rewards.distance;
        assert_eq!(rounds.calculate_reward(offset - 1), 0);
        assert_eq!(rounds.calculate_milestone(offset), 0);
        assert_eq!(rounds.calculate_reward(offset), 500_000_000);
        assert_eq!(rounds.calculate_milestone(offset + distance), 1);
        assert_eq!(rounds.calculate_reward(offset + distance), 400_000_000);
        // Beyond the table the final milestone holds.
        assert_eq!(
            rounds.calculate_milestone(offset + distance * 100),
            rounds.constants.rewards.milestones.len() as u64 - 1
        );
    }

    #[test]
    fn supply_accumulates_rewards_from_offset() {
        let (rounds, _dir) = rounds_fixture(1);
        let constants = rounds.constants.clone();
        let offset = constants.rewards.offset;
        assert_eq!(
            rounds.calculate_supply(offset - 1).to_string(),
            constants.total_amount.to_string()
        );
        let expected = Natural::from(constants.total_amount)
            + Natural::from(constants.rewards.milestones[0]) * Natural::from(3u32);
        assert_eq!(rounds.calculate_supply(offset + 2), expected);
    }

    #[test]
    fn settlement_splits_fees_and_reverts_cleanly() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open storage");
        let ledger = Arc::new(Ledger::new(HandlerRegistry::builtin()));
        let mut constants = ChainConstants::default();
        constants.active_delegates = 3;
        let rounds = Rounds::new(Arc::new(constants), ledger.clone(), storage.clone());

        let forger_two = crate::crypto::keypair_from_secret(&[2u8; 32]).expect("keypair");
        let forger_three = crate::crypto::keypair_from_secret(&[3u8; 32]).expect("keypair");
        let genesis = crate::types::Block::genesis(0, Vec::new());
        storage.append_block(&genesis, &[], &[], &[]).expect("genesis");
        let mut block_two =
            crate::types::Block::build(2, Some(genesis.id.clone()), 10, 0, Vec::new(), &forger_two);
        block_two.header.total_fee = 30;
        storage.append_block(&block_two, &[], &[], &[]).expect("block two");
        let mut closing =
            crate::types::Block::build(3, Some(block_two.id.clone()), 20, 0, Vec::new(), &forger_three);
        closing.header.total_fee = 60;

        assert!(rounds.is_round_end(3));
        let rows = rounds.settle_round(&closing).expect("settle");
        assert!(!rounds.ticking());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].height, 1);
        assert_eq!(rows[2].generator_public_key, hex::encode(forger_three.public.to_bytes()));

        let address_two = crate::crypto::address_from_public_key(&forger_two.public);
        let address_three = crate::crypto::address_from_public_key(&forger_three.public);
        assert_eq!(ledger.balance_of(&address_two), 30);
        assert_eq!(ledger.balance_of(&address_three), 30);

        storage.append_block(&closing, &[], &[], &rows).expect("persist closing");
        rounds.revert_round(&closing).expect("revert");
        assert_eq!(ledger.balance_of(&address_two), 0);
        assert_eq!(ledger.balance_of(&address_three), 0);
    }

    #[test]
    fn round_end_detection() {
        let (rounds, _dir) = rounds_fixture(1);
        assert!(!rounds.is_round_end(1));
        assert!(rounds.is_round_end(101));
        assert!(!rounds.is_round_end(102));
        assert!(rounds.is_round_end(202));
    }
}

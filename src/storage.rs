use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Account, Address, Block, BlockId, BlockMetadata, CommonBlock, Transaction};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_BLOCKS: &str = "blocks";
const CF_BLOCK_IDS: &str = "block_ids";
const CF_TRANSACTIONS: &str = "trs";
const CF_ACCOUNTS: &str = "accounts";
const CF_MULTISIG: &str = "multisig";
const CF_ROUND_REWARDS: &str = "round_rewards";
const CF_METADATA: &str = "metadata";

const TIP_HEIGHT_KEY: &[u8] = b"tip_height";
const TIP_ID_KEY: &[u8] = b"tip_id";
const TIP_TIMESTAMP_KEY: &[u8] = b"tip_timestamp";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Confirmed transaction row joined to its block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub transaction: Transaction,
    pub block_id: BlockId,
    pub height: u64,
}

/// Settlement row recorded when a round closes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundRewardRow {
    pub round: u64,
    pub height: u64,
    pub generator_public_key: String,
    pub fees: u64,
    pub reward: u64,
}

/// Direction filter for address-scoped transaction queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// Outcome of the schema migration pass.
#[derive(Clone, Debug, Default)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub upgraded_blocks: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.from_version == self.to_version && self.upgraded_blocks == 0
    }
}

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = [
            CF_BLOCKS,
            CF_BLOCK_IDS,
            CF_TRANSACTIONS,
            CF_ACCOUNTS,
            CF_MULTISIG,
            CF_ROUND_REWARDS,
            CF_METADATA,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect::<Vec<_>>();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    /// Bring the schema to the supported version. A newer on-disk schema is
    /// an error; callers decide whether that is fatal.
    pub fn migrate(&self) -> ChainResult<MigrationReport> {
        let current = self.read_schema_version()?;
        let mut report = MigrationReport {
            from_version: current.unwrap_or(0),
            to_version: STORAGE_SCHEMA_VERSION,
            upgraded_blocks: 0,
        };
        match current {
            Some(version) if version > STORAGE_SCHEMA_VERSION => {
                return Err(ChainError::Config(format!(
                    "database schema version {version} is newer than supported {STORAGE_SCHEMA_VERSION}"
                )));
            }
            Some(version) if version == STORAGE_SCHEMA_VERSION => {
                report.from_version = version;
            }
            _ => {
                // Version 1 is the first persisted layout; stamping the
                // version is the whole upgrade.
                self.write_schema_version(STORAGE_SCHEMA_VERSION)?;
            }
        }
        Ok(report)
    }

    fn read_schema_version(&self) -> ChainResult<Option<u32>> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn write_schema_version(&self, version: u32) -> ChainResult<()> {
        let cf = self.cf(CF_METADATA)?;
        self.db.put_cf(&cf, SCHEMA_VERSION_KEY, version.to_be_bytes())?;
        Ok(())
    }

    /// Persist a block, its transactions, the touched accounts and any
    /// round-settlement rows in one atomic batch. Either the whole append
    /// lands or none of it does.
    pub fn append_block(
        &self,
        block: &Block,
        accounts: &[Account],
        memberships: &[(Address, Vec<String>)],
        reward_rows: &[RoundRewardRow],
    ) -> ChainResult<()> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let ids_cf = self.cf(CF_BLOCK_IDS)?;
        let trs_cf = self.cf(CF_TRANSACTIONS)?;
        let accounts_cf = self.cf(CF_ACCOUNTS)?;
        let multisig_cf = self.cf(CF_MULTISIG)?;
        let rewards_cf = self.cf(CF_ROUND_REWARDS)?;
        let metadata_cf = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let height_key = block.header.height.to_be_bytes();
        batch.put_cf(&blocks_cf, height_key, bincode::serialize(block)?);
        batch.put_cf(&ids_cf, block.id.as_bytes(), height_key);
        for tx in &block.transactions {
            let row = StoredTransaction {
                transaction: tx.clone(),
                block_id: block.id.clone(),
                height: block.header.height,
            };
            batch.put_cf(&trs_cf, tx.id.as_bytes(), bincode::serialize(&row)?);
        }
        for account in accounts {
            batch.put_cf(
                &accounts_cf,
                account.address.as_bytes(),
                bincode::serialize(account)?,
            );
        }
        for (address, members) in memberships {
            if members.is_empty() {
                batch.delete_cf(&multisig_cf, address.as_bytes());
            } else {
                batch.put_cf(&multisig_cf, address.as_bytes(), bincode::serialize(members)?);
            }
        }
        for row in reward_rows {
            batch.put_cf(&rewards_cf, reward_row_key(row.round, row.height), bincode::serialize(row)?);
        }
        batch.put_cf(&metadata_cf, TIP_HEIGHT_KEY, height_key);
        batch.put_cf(&metadata_cf, TIP_ID_KEY, block.id.as_bytes());
        batch.put_cf(
            &metadata_cf,
            TIP_TIMESTAMP_KEY,
            block.header.timestamp.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    /// Remove the tip block and restore the previous tip metadata, again in
    /// one batch. `reverted_round` drops that round's settlement rows.
    pub fn delete_block(
        &self,
        block: &Block,
        previous: &BlockMetadata,
        accounts: &[Account],
        memberships: &[(Address, Vec<String>)],
        reverted_round: Option<u64>,
    ) -> ChainResult<()> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let ids_cf = self.cf(CF_BLOCK_IDS)?;
        let trs_cf = self.cf(CF_TRANSACTIONS)?;
        let accounts_cf = self.cf(CF_ACCOUNTS)?;
        let multisig_cf = self.cf(CF_MULTISIG)?;
        let rewards_cf = self.cf(CF_ROUND_REWARDS)?;
        let metadata_cf = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&blocks_cf, block.header.height.to_be_bytes());
        batch.delete_cf(&ids_cf, block.id.as_bytes());
        for tx in &block.transactions {
            batch.delete_cf(&trs_cf, tx.id.as_bytes());
        }
        for account in accounts {
            batch.put_cf(
                &accounts_cf,
                account.address.as_bytes(),
                bincode::serialize(account)?,
            );
        }
        for (address, members) in memberships {
            if members.is_empty() {
                batch.delete_cf(&multisig_cf, address.as_bytes());
            } else {
                batch.put_cf(&multisig_cf, address.as_bytes(), bincode::serialize(members)?);
            }
        }
        if let Some(round) = reverted_round {
            for row in self.round_rewards(round)? {
                batch.delete_cf(&rewards_cf, reward_row_key(row.round, row.height));
            }
        }
        batch.put_cf(&metadata_cf, TIP_HEIGHT_KEY, previous.height.to_be_bytes());
        batch.put_cf(&metadata_cf, TIP_ID_KEY, previous.id.as_bytes());
        batch.put_cf(
            &metadata_cf,
            TIP_TIMESTAMP_KEY,
            previous.timestamp.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    pub fn read_block(&self, height: u64) -> ChainResult<Option<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf, height.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn block_height_by_id(&self, id: &str) -> ChainResult<Option<u64>> {
        let cf = self.cf(CF_BLOCK_IDS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid block height encoding".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn block_by_id(&self, id: &str) -> ChainResult<Option<Block>> {
        match self.block_height_by_id(id)? {
            Some(height) => self.read_block(height),
            None => Ok(None),
        }
    }

    /// Blocks with heights in (`after_height`, `after_height` + `limit`].
    pub fn blocks_after(&self, after_height: u64, limit: usize) -> ChainResult<Vec<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        let start = after_height.saturating_add(1).to_be_bytes();
        let iterator = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        let mut blocks = Vec::new();
        for entry in iterator {
            let (_key, value) = entry?;
            blocks.push(bincode::deserialize::<Block>(&value)?);
            if blocks.len() >= limit {
                break;
            }
        }
        Ok(blocks)
    }

    /// Exclusive lower bound, inclusive upper bound.
    pub fn blocks_between_heights(
        &self,
        from_height: u64,
        to_height: u64,
        limit: usize,
    ) -> ChainResult<Vec<Block>> {
        let mut blocks = self.blocks_after(from_height, limit)?;
        blocks.retain(|block| block.header.height <= to_height);
        Ok(blocks)
    }

    /// Latest block with `timestamp <= at`, scanning back from the tip.
    pub fn block_at_timestamp(&self, at: u64) -> ChainResult<Option<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        let iterator = self.db.iterator_cf(&cf, IteratorMode::End);
        for entry in iterator {
            let (_key, value) = entry?;
            let block: Block = bincode::deserialize(&value)?;
            if block.header.timestamp <= at {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Highest-height block among the candidate ids, if any is ours.
    pub fn common_block(&self, ids: &[BlockId]) -> ChainResult<Option<CommonBlock>> {
        let mut best: Option<Block> = None;
        for id in ids {
            if let Some(block) = self.block_by_id(id)? {
                if best
                    .as_ref()
                    .map(|current| block.header.height > current.header.height)
                    .unwrap_or(true)
                {
                    best = Some(block);
                }
            }
        }
        Ok(best.map(|block| CommonBlock {
            id: block.id.clone(),
            height: block.header.height,
            previous_block_id: block.header.previous_block_id.clone(),
        }))
    }

    pub fn transaction(&self, id: &str) -> ChainResult<Option<StoredTransaction>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Address-scoped confirmed transactions. Addresses compare
    /// case-insensitively. Results are ordered by transaction timestamp.
    pub fn transactions_for_address(
        &self,
        address: &str,
        direction: TransferDirection,
        from_timestamp: Option<u64>,
        limit: usize,
    ) -> ChainResult<Vec<StoredTransaction>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            let row: StoredTransaction = bincode::deserialize(&value)?;
            let tx = &row.transaction;
            let matches = match direction {
                TransferDirection::Inbound => tx
                    .recipient_id
                    .as_deref()
                    .map(|recipient| recipient.eq_ignore_ascii_case(address))
                    .unwrap_or(false),
                TransferDirection::Outbound => tx.sender_id.eq_ignore_ascii_case(address),
            };
            if !matches {
                continue;
            }
            if let Some(from) = from_timestamp {
                if tx.timestamp < from {
                    continue;
                }
            }
            rows.push(row);
        }
        rows.sort_by_key(|row| (row.transaction.timestamp, row.transaction.id.clone()));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn transactions_in_block(&self, block_id: &str) -> ChainResult<Vec<StoredTransaction>> {
        match self.block_by_id(block_id)? {
            Some(block) => Ok(block
                .transactions
                .iter()
                .map(|tx| StoredTransaction {
                    transaction: tx.clone(),
                    block_id: block.id.clone(),
                    height: block.header.height,
                })
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    pub fn persist_account(&self, account: &Account) -> ChainResult<()> {
        let cf = self.cf(CF_ACCOUNTS)?;
        self.db
            .put_cf(&cf, account.address.as_bytes(), bincode::serialize(account)?)?;
        Ok(())
    }

    pub fn load_accounts(&self) -> ChainResult<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            accounts.push(bincode::deserialize::<Account>(&value)?);
        }
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(accounts)
    }

    pub fn multisig_members(&self, address: &str) -> ChainResult<Option<Vec<String>>> {
        let cf = self.cf(CF_MULTISIG)?;
        match self.db.get_cf(&cf, address.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn load_multisig_memberships(&self) -> ChainResult<Vec<(Address, Vec<String>)>> {
        let cf = self.cf(CF_MULTISIG)?;
        let mut memberships = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|err| ChainError::Config(format!("invalid multisig key: {err}")))?;
            memberships.push((address, bincode::deserialize(&value)?));
        }
        Ok(memberships)
    }

    pub fn round_rewards(&self, round: u64) -> ChainResult<Vec<RoundRewardRow>> {
        let cf = self.cf(CF_ROUND_REWARDS)?;
        let prefix = round.to_be_bytes();
        let iterator = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut rows = Vec::new();
        for entry in iterator {
            let (key, value) = entry?;
            if key.len() < 8 || key[..8] != prefix {
                break;
            }
            rows.push(bincode::deserialize::<RoundRewardRow>(&value)?);
        }
        Ok(rows)
    }

    pub fn tip(&self) -> ChainResult<Option<BlockMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        let height_bytes = match self.db.get_cf(&cf, TIP_HEIGHT_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let id_bytes = self
            .db
            .get_cf(&cf, TIP_ID_KEY)?
            .ok_or_else(|| ChainError::Config("missing tip id".into()))?;
        let timestamp_bytes = self
            .db
            .get_cf(&cf, TIP_TIMESTAMP_KEY)?
            .ok_or_else(|| ChainError::Config("missing tip timestamp".into()))?;
        let height = u64::from_be_bytes(
            height_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid tip height encoding".into()))?,
        );
        let id = String::from_utf8(id_bytes.to_vec())
            .map_err(|err| ChainError::Config(format!("invalid tip id encoding: {err}")))?;
        let timestamp = u64::from_be_bytes(
            timestamp_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid tip timestamp encoding".into()))?,
        );
        Ok(Some(BlockMetadata {
            height,
            id,
            timestamp,
        }))
    }

    pub fn max_height(&self) -> ChainResult<u64> {
        Ok(self.tip()?.map(|tip| tip.height).unwrap_or(0))
    }
}

fn reward_row_key(round: u64, height: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&round.to_be_bytes());
    key[8..].copy_from_slice(&height.to_be_bytes());
    key
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypair_from_secret;
    use tempfile::tempdir;

    fn block_at(height: u64, previous: Option<&Block>) -> Block {
        let keypair = keypair_from_secret(&[height as u8; 32]).expect("keypair");
        Block::build(
            height,
            previous.map(|block| block.id.clone()),
            height * 10,
            0,
            Vec::new(),
            &keypair,
        )
    }

    #[test]
    fn append_and_read_blocks() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let genesis = Block::genesis(0, Vec::new());
        storage
            .append_block(&genesis, &[], &[], &[])
            .expect("append genesis");
        let block = block_at(2, Some(&genesis));
        storage.append_block(&block, &[], &[], &[]).expect("append");

        let tip = storage.tip().expect("tip").expect("some tip");
        assert_eq!(tip.height, 2);
        assert_eq!(tip.id, block.id);
        let loaded = storage.read_block(2).expect("read").expect("block");
        assert_eq!(loaded.id, block.id);
        assert_eq!(
            storage.block_by_id(&block.id).expect("by id").expect("block").header.height,
            2
        );
        assert_eq!(storage.blocks_after(1, 10).expect("page").len(), 1);
    }

    #[test]
    fn delete_block_restores_previous_tip() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let genesis = Block::genesis(0, Vec::new());
        storage.append_block(&genesis, &[], &[], &[]).expect("append");
        let block = block_at(2, Some(&genesis));
        storage.append_block(&block, &[], &[], &[]).expect("append");

        storage
            .delete_block(&block, &BlockMetadata::from(&genesis), &[], &[], None)
            .expect("delete");
        let tip = storage.tip().expect("tip").expect("some tip");
        assert_eq!(tip.height, 1);
        assert_eq!(tip.id, genesis.id);
        assert!(storage.read_block(2).expect("read").is_none());
        assert!(storage.block_by_id(&block.id).expect("by id").is_none());
    }

    #[test]
    fn common_block_prefers_highest_match() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let genesis = Block::genesis(0, Vec::new());
        storage.append_block(&genesis, &[], &[], &[]).expect("append");
        let block = block_at(2, Some(&genesis));
        storage.append_block(&block, &[], &[], &[]).expect("append");

        let common = storage
            .common_block(&[genesis.id.clone(), block.id.clone(), "12345".into()])
            .expect("common")
            .expect("match");
        assert_eq!(common.height, 2);
        assert_eq!(common.id, block.id);
    }

    #[test]
    fn migration_stamps_fresh_databases() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let report = storage.migrate().expect("migrate");
        assert_eq!(report.to_version, STORAGE_SCHEMA_VERSION);
        let again = storage.migrate().expect("migrate again");
        assert!(again.is_noop());
    }
}

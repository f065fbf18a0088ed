use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::blocks::{Blocks, ChainState, LoadOutcome, ReceiveOutcome};
use crate::broadcaster::Broadcaster;
use crate::bus::{ChainEvent, EventBus, SubscriptionId};
use crate::config::ChainConfig;
use crate::errors::{ChainError, ChainResult};
use crate::forger::{Forger, ForgingStatus};
use crate::interfaces::NetworkClient;
use crate::ledger::{HandlerRegistry, Ledger};
use crate::loader::Loader;
use crate::peers::Peers;
use crate::pool::{PoolCounts, PoolQuery, TransactionPool};
use crate::rounds::Rounds;
use crate::sequence::Sequence;
use crate::slots::Slots;
use crate::storage::{Storage, TransferDirection};
use crate::transport::Transport;
use crate::types::{
    Address, Block, BlockId, CommonBlock, SanitizedTransaction, Transaction, TransactionId,
};

/// Seconds between broadhash consensus refreshes.
const CONSENSUS_INTERVAL_SECS: u64 = 5;
/// Backlog bounds for the main sequence.
const SEQUENCE_MAX_PENDING: usize = 1_000;
const SEQUENCE_WARN_THRESHOLD: usize = 100;

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub consensus: f64,
    pub loaded: bool,
    pub syncing: bool,
    pub unconfirmed_transactions: usize,
    pub seconds_since_epoch: u64,
    pub height: u64,
    pub last_block_id: BlockId,
    pub broadhash: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModuleOptions {
    pub module_alias: String,
    pub active_delegates: u32,
    pub block_time: u64,
    pub max_transactions_per_block: usize,
    pub max_payload_length: usize,
}

struct ChainInner {
    config: ChainConfig,
    storage: Storage,
    bus: Arc<EventBus>,
    sequence: Arc<Sequence>,
    ledger: Arc<Ledger>,
    pool: Arc<TransactionPool>,
    rounds: Arc<Rounds>,
    blocks: Arc<Blocks>,
    peers: Arc<Peers>,
    broadcaster: Arc<Broadcaster>,
    loader: Arc<Loader>,
    forger: Arc<Forger>,
    transport: Transport,
    slots: Slots,
    shutdown: watch::Sender<bool>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    load_outcome: LoadOutcome,
}

/// The chain module: builds every component, wires the event bus, runs the
/// timers and exposes the public actions.
///
/// Construction requires a tokio runtime because the main sequence spawns
/// its consumer task.
pub struct Chain {
    inner: Arc<ChainInner>,
}

#[derive(Clone)]
pub struct ChainHandle {
    inner: Arc<ChainInner>,
}

impl Chain {
    pub fn new(config: ChainConfig, network: Arc<dyn NetworkClient>) -> ChainResult<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let constants = Arc::new(config.constants.clone());
        let slots = Slots::new(&constants);

        let storage = Storage::open(&config.data_dir.join("db"))?;
        // A failed migration is a warning, not a boot failure; the event is
        // published once listeners are wired.
        let migration_warning = match storage.migrate() {
            Ok(report) => {
                if !report.is_noop() {
                    info!(
                        from = report.from_version,
                        to = report.to_version,
                        "storage schema migrated"
                    );
                }
                None
            }
            Err(err) => {
                warn!(%err, "storage migration failed, continuing");
                Some(err.to_string())
            }
        };

        let bus = Arc::new(EventBus::new());
        let sequence = Arc::new(Sequence::new(SEQUENCE_MAX_PENDING, SEQUENCE_WARN_THRESHOLD));

        let fresh_store = storage.tip()?.is_none();
        let rebuilding = config.loading.rebuild_up_to_round.is_some();
        // A rebuild replays account state from genesis; stored accounts are
        // only authoritative on a normal boot.
        let (stored_accounts, stored_memberships) = if rebuilding {
            (Vec::new(), Vec::new())
        } else {
            (storage.load_accounts()?, storage.load_multisig_memberships()?)
        };
        let ledger = Arc::new(Ledger::load(
            HandlerRegistry::builtin(),
            stored_accounts,
            stored_memberships,
        ));
        let pool = Arc::new(TransactionPool::new(
            config.transactions.clone(),
            ledger.clone(),
            bus.clone(),
        ));
        let rounds = Arc::new(Rounds::new(
            constants.clone(),
            ledger.clone(),
            storage.clone(),
        ));
        let blocks = Arc::new(Blocks::new(
            constants.clone(),
            storage.clone(),
            ledger.clone(),
            pool.clone(),
            rounds.clone(),
            bus.clone(),
        ));
        let peers = Arc::new(Peers::new(
            constants.clone(),
            network.clone(),
            config.forging.force,
        ));
        let broadcaster = Arc::new(Broadcaster::new(config.broadcasts.clone(), network.clone()));
        let loader = Arc::new(Loader::new(
            config.syncing.clone(),
            network.clone(),
            blocks.clone(),
            pool.clone(),
            sequence.clone(),
        ));
        let forger = Arc::new(Forger::new(
            config.forging.clone(),
            constants.clone(),
            blocks.clone(),
            pool.clone(),
            rounds.clone(),
            peers.clone(),
            sequence.clone(),
        ));
        let transport = Transport::new(
            constants.clone(),
            blocks.clone(),
            pool.clone(),
            loader.clone(),
            broadcaster.clone(),
            sequence.clone(),
            network,
        );

        if fresh_store || rebuilding {
            ledger.seed_genesis(&config.genesis_accounts);
        }
        let genesis = Block::genesis(0, Vec::new());
        let load_outcome = blocks.load_blockchain(
            genesis,
            config.loading.rebuild_up_to_round,
            config.loading.load_per_iteration,
        )?;
        forger.load_delegates()?;

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ChainInner {
            config,
            storage,
            bus,
            sequence,
            ledger,
            pool,
            rounds,
            blocks,
            peers,
            broadcaster,
            loader,
            forger,
            transport,
            slots,
            shutdown,
            subscriptions: Mutex::new(Vec::new()),
            load_outcome,
        });
        inner.register_subscriptions();
        if let Some(detail) = migration_warning {
            inner
                .bus
                .publish(&ChainEvent::MigrationWarning { detail });
        }
        inner.bus.publish(&ChainEvent::Bootstrap);
        Ok(Self { inner })
    }

    pub fn handle(&self) -> ChainHandle {
        ChainHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn load_outcome(&self) -> LoadOutcome {
        self.inner.load_outcome.clone()
    }

    /// Run the timer jobs until `cleanup` fires. Rebuild boots skip the
    /// timers entirely; the process exits after replay.
    pub async fn start(&self) -> ChainResult<()> {
        if matches!(self.inner.load_outcome, LoadOutcome::RebuildCompleted { .. }) {
            info!("rebuild finished, skipping timers");
            return Ok(());
        }
        let inner = &self.inner;
        if let Err(err) = inner.loader.load_unconfirmed_transactions().await {
            warn!(%err, "unconfirmed transaction load failed");
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            inner.broadcaster.clone().run(inner.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            inner.loader.clone().run(inner.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            inner.forger.clone().run(inner.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(consensus_job(
            inner.clone_refs(),
            inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(expiry_job(
            inner.clone_refs(),
            inner.shutdown.subscribe(),
        )));

        let mut shutdown = inner.shutdown.subscribe();
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                break;
            }
        }
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    /// Best-effort teardown: unsubscribe listeners, stop the timers, drain
    /// the sequence, release components in order.
    pub fn cleanup(&self, error: Option<&ChainError>) {
        if let Some(error) = error {
            warn!(%error, "cleaning up after error");
        }
        self.inner.cleanup();
    }
}

#[derive(Clone)]
struct InnerRefs {
    bus: Arc<EventBus>,
    pool: Arc<TransactionPool>,
    blocks: Arc<Blocks>,
    peers: Arc<Peers>,
    sequence: Arc<Sequence>,
    expiry_interval: u64,
}

impl ChainInner {
    fn clone_refs(&self) -> InnerRefs {
        InnerRefs {
            bus: self.bus.clone(),
            pool: self.pool.clone(),
            blocks: self.blocks.clone(),
            peers: self.peers.clone(),
            sequence: self.sequence.clone(),
            expiry_interval: self.config.constants.expiry_interval,
        }
    }

    /// Boot-time bus wiring. Listeners only hand work to other queues.
    fn register_subscriptions(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        {
            let broadcaster = self.broadcaster.clone();
            subscriptions.push(self.bus.subscribe(move |event| match event {
                ChainEvent::UnconfirmedTransaction {
                    transaction,
                    broadcast: true,
                } => broadcaster.enqueue_transaction(transaction.clone()),
                ChainEvent::BroadcastBlock { block } => broadcaster.enqueue_block(block.clone()),
                _ => {}
            }));
        }
        {
            let bus = self.bus.clone();
            subscriptions.push(self.bus.subscribe(move |event| {
                if let ChainEvent::NewBroadhash { broadhash, height } = event {
                    bus.publish(&ChainEvent::ModuleState {
                        broadhash: broadhash.clone(),
                        height: *height,
                    });
                }
            }));
        }
    }

    fn cleanup(&self) {
        let subscriptions: Vec<SubscriptionId> =
            self.subscriptions.lock().drain(..).collect();
        for id in subscriptions {
            self.bus.unsubscribe(id);
        }
        self.bus.clear();
        let _ = self.shutdown.send(true);
        self.sequence.shutdown();
        info!("chain module cleaned up");
    }
}

async fn consensus_job(refs: InnerRefs, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(CONSENSUS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let broadhash = refs.blocks.broadhash();
                match refs.peers.calculate_consensus(&broadhash).await {
                    Ok(_) => {
                        refs.bus.publish(&ChainEvent::ModuleState {
                            broadhash,
                            height: refs.blocks.height(),
                        });
                    }
                    Err(err) => warn!(%err, "consensus refresh failed"),
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

async fn expiry_job(refs: InnerRefs, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(refs.expiry_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pool = refs.pool.clone();
                let result = refs
                    .sequence
                    .add("pool-expiry", async move {
                        pool.expire();
                        pool.process_received(usize::MAX);
                        Ok(())
                    })
                    .await;
                if let Err(err) = result {
                    warn!(%err, "pool maintenance failed");
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

impl ChainHandle {
    pub fn calculate_supply(&self, height: u64) -> String {
        self.inner.rounds.calculate_supply(height).to_string()
    }

    pub fn calculate_milestone(&self, height: u64) -> u64 {
        self.inner.rounds.calculate_milestone(height)
    }

    pub fn calculate_reward(&self, height: u64) -> String {
        self.inner.rounds.calculate_reward(height).to_string()
    }

    pub fn generate_delegate_list(
        &self,
        round: u64,
        source: Option<&str>,
    ) -> ChainResult<Vec<String>> {
        self.inner.rounds.generate_delegate_list(round, source)
    }

    pub fn update_forging_status(
        &self,
        public_key: &str,
        password: &str,
        forging: bool,
    ) -> ChainResult<ForgingStatus> {
        self.inner
            .forger
            .update_forging_status(public_key, password, forging)
    }

    pub fn forging_status_for_all_delegates(&self) -> Vec<ForgingStatus> {
        self.inner.forger.forging_status()
    }

    /// The shared pool, as served to peers.
    pub fn get_transactions(&self) -> Vec<Transaction> {
        self.inner.transport.get_transactions()
    }

    pub fn get_transactions_from_pool(&self, query: &PoolQuery) -> Vec<Transaction> {
        self.inner.pool.pooled_transactions(query)
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.inner.pool.counts()
    }

    pub async fn post_transaction(&self, transaction: Transaction) -> ChainResult<TransactionId> {
        self.inner.transport.post_transaction(transaction).await
    }

    pub async fn post_block(&self, peer: &str, block: Block) -> ChainResult<ReceiveOutcome> {
        self.inner.transport.post_block(peer, block).await
    }

    pub async fn post_transactions(
        &self,
        peer: &str,
        transactions: Vec<Transaction>,
    ) -> ChainResult<usize> {
        self.inner.transport.post_transactions(peer, transactions).await
    }

    pub fn get_node_status(&self) -> NodeStatus {
        let last = self.inner.blocks.last_block();
        NodeStatus {
            consensus: self.inner.peers.last_consensus(),
            loaded: self.inner.blocks.state() != ChainState::Loading,
            syncing: self.inner.loader.syncing(),
            unconfirmed_transactions: self.inner.pool.counts().total,
            seconds_since_epoch: self.inner.slots.epoch_time(None),
            height: last.header.height,
            last_block_id: last.id,
            broadhash: self.inner.blocks.broadhash(),
        }
    }

    pub fn get_last_block(&self) -> Block {
        self.inner.blocks.last_block()
    }

    pub fn blocks(&self, last_block_id: &str) -> ChainResult<Vec<Block>> {
        self.inner.transport.blocks(last_block_id)
    }

    pub fn blocks_common(&self, peer: &str, ids_csv: &str) -> ChainResult<Option<CommonBlock>> {
        self.inner.transport.blocks_common(peer, ids_csv)
    }

    pub fn get_slot_number(&self, epoch_time: Option<u64>) -> u64 {
        self.inner.slots.slot_number(epoch_time)
    }

    pub fn calc_slot_round(&self, height: u64) -> u64 {
        self.inner.slots.calc_round(height)
    }

    /// Member addresses of a multisignature wallet.
    pub fn get_multisig_wallet_members(&self, wallet_address: &str) -> ChainResult<Vec<Address>> {
        let members = self
            .inner
            .ledger
            .multisig_members(wallet_address)
            .ok_or_else(|| {
                ChainError::State(format!("wallet {wallet_address} is not multisignature"))
            })?;
        members
            .iter()
            .map(|member| crate::crypto::address_from_public_key_hex(member))
            .collect()
    }

    pub fn get_min_multisig_required_signatures(&self, wallet_address: &str) -> ChainResult<u32> {
        let account = self
            .inner
            .ledger
            .get_account(wallet_address)
            .ok_or_else(|| ChainError::State(format!("account {wallet_address} not found")))?;
        if !account.is_multisig() {
            return Err(ChainError::State(format!(
                "wallet {wallet_address} is not multisignature"
            )));
        }
        Ok(account.multimin)
    }

    pub fn get_inbound_transactions(
        &self,
        wallet_address: &str,
        from_timestamp: Option<u64>,
        limit: Option<usize>,
    ) -> ChainResult<Vec<SanitizedTransaction>> {
        self.address_transactions(
            wallet_address,
            TransferDirection::Inbound,
            from_timestamp,
            limit,
        )
    }

    pub fn get_outbound_transactions(
        &self,
        wallet_address: &str,
        from_timestamp: Option<u64>,
        limit: Option<usize>,
    ) -> ChainResult<Vec<SanitizedTransaction>> {
        self.address_transactions(
            wallet_address,
            TransferDirection::Outbound,
            from_timestamp,
            limit,
        )
    }

    fn address_transactions(
        &self,
        wallet_address: &str,
        direction: TransferDirection,
        from_timestamp: Option<u64>,
        limit: Option<usize>,
    ) -> ChainResult<Vec<SanitizedTransaction>> {
        let limit = limit.unwrap_or(100).min(100);
        let rows = self.inner.storage.transactions_for_address(
            wallet_address,
            direction,
            from_timestamp,
            limit,
        )?;
        Ok(rows
            .into_iter()
            .map(|row| self.sanitize(row.transaction, Some(row.block_id)))
            .collect())
    }

    pub fn get_inbound_transactions_from_block(
        &self,
        wallet_address: &str,
        block_id: &str,
    ) -> ChainResult<Vec<SanitizedTransaction>> {
        self.block_transactions(wallet_address, block_id, TransferDirection::Inbound)
    }

    pub fn get_outbound_transactions_from_block(
        &self,
        wallet_address: &str,
        block_id: &str,
    ) -> ChainResult<Vec<SanitizedTransaction>> {
        self.block_transactions(wallet_address, block_id, TransferDirection::Outbound)
    }

    fn block_transactions(
        &self,
        wallet_address: &str,
        block_id: &str,
        direction: TransferDirection,
    ) -> ChainResult<Vec<SanitizedTransaction>> {
        let rows = self.inner.storage.transactions_in_block(block_id)?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                let tx = &row.transaction;
                match direction {
                    TransferDirection::Inbound => tx
                        .recipient_id
                        .as_deref()
                        .map(|recipient| recipient.eq_ignore_ascii_case(wallet_address))
                        .unwrap_or(false),
                    TransferDirection::Outbound => {
                        tx.sender_id.eq_ignore_ascii_case(wallet_address)
                    }
                }
            })
            .map(|row| self.sanitize(row.transaction, Some(row.block_id)))
            .collect())
    }

    fn sanitize(&self, tx: Transaction, block_id: Option<BlockId>) -> SanitizedTransaction {
        let members = self
            .inner
            .ledger
            .get_account(&tx.sender_id)
            .filter(|account| account.is_multisig())
            .and_then(|_| self.inner.ledger.multisig_members(&tx.sender_id));
        tx.sanitized(block_id.as_ref(), members.as_deref())
    }

    pub fn get_last_block_at_timestamp(&self, timestamp: u64) -> ChainResult<Option<Block>> {
        self.inner.storage.block_at_timestamp(timestamp)
    }

    pub fn get_max_block_height(&self) -> ChainResult<u64> {
        self.inner.storage.max_height()
    }

    pub fn get_blocks_between_heights(
        &self,
        from_height: u64,
        to_height: u64,
        limit: usize,
    ) -> ChainResult<Vec<Block>> {
        self.inner
            .storage
            .blocks_between_heights(from_height, to_height, limit)
    }

    pub fn get_block_at_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.storage.read_block(height)
    }

    pub fn get_account(&self, address: &str) -> Option<crate::types::Account> {
        self.inner.ledger.get_account(address)
    }

    pub fn get_module_options(&self) -> ModuleOptions {
        ModuleOptions {
            module_alias: self.inner.config.module_alias.clone(),
            active_delegates: self.inner.config.constants.active_delegates,
            block_time: self.inner.config.constants.block_time,
            max_transactions_per_block: self.inner.config.constants.max_transactions_per_block,
            max_payload_length: self.inner.config.constants.max_payload_length,
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.inner.bus.clone()
    }

    pub fn syncing(&self) -> bool {
        self.inner.loader.syncing()
    }

    pub async fn sync_now(&self) -> ChainResult<()> {
        self.inner.loader.clone().sync().await
    }

    pub async fn load_unconfirmed_now(&self) -> ChainResult<usize> {
        self.inner.loader.load_unconfirmed_transactions().await
    }

    pub fn is_stale(&self) -> bool {
        self.inner.blocks.is_stale()
    }

    pub async fn forge_once(&self) -> ChainResult<bool> {
        self.inner.forger.before_forge()?;
        let forger = self.inner.forger.clone();
        self.inner
            .sequence
            .add("forge", async move { forger.forge().await })
            .await
    }

    pub fn delete_last_block(&self) -> ChainResult<Block> {
        self.inner.blocks.delete_last_block()
    }

    pub fn cleanup(&self) {
        self.inner.cleanup();
    }
}

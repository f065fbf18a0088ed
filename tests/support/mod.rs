//! Helpers shared by the integration tests: deterministic keypairs, node
//! configuration builders, signed fixtures and an in-memory network.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use parking_lot::RwLock;

use dpos_chain::config::{ChainConfig, ForgingDelegate, GenesisAccount};
use dpos_chain::crypto::{
    address_from_public_key, encrypt_secret, keypair_from_secret, sign_message, signature_to_hex,
};
use dpos_chain::errors::ChainResult;
use dpos_chain::interfaces::{NetworkClient, PeerModuleState, PeerSnapshot};
use dpos_chain::slots::Slots;
use dpos_chain::types::{Block, BlockId, CommonBlock, Transaction, TransactionAsset};

pub const PASSWORD: &str = "delegate password";

pub fn delegate_keypair() -> Keypair {
    keypair_from_secret(&[11u8; 32]).expect("delegate keypair")
}

pub fn wallet_keypair() -> Keypair {
    keypair_from_secret(&[22u8; 32]).expect("wallet keypair")
}

pub fn public_key_hex(keypair: &Keypair) -> String {
    hex::encode(keypair.public.to_bytes())
}

pub fn address_of(keypair: &Keypair) -> String {
    address_from_public_key(&keypair.public)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Node configuration rooted in a temp directory with one-second slots and
/// the epoch pushed `epoch_back_secs` into the past.
pub fn base_config(dir: &Path, block_time: u64, epoch_back_secs: u64) -> ChainConfig {
    let mut config = ChainConfig::default();
    config.data_dir = dir.join("data");
    config.key_path = dir.join("keys/node.toml");
    config.constants.block_time = block_time;
    config.constants.epoch_time_ms = now_ms().saturating_sub(epoch_back_secs * 1_000);
    config
}

/// Register a forging delegate: a genesis delegate account plus an
/// encrypted forging key unlocked by [`PASSWORD`].
pub fn add_forging_delegate(config: &mut ChainConfig, keypair: &Keypair) {
    let public_key = public_key_hex(keypair);
    config.genesis_accounts.push(GenesisAccount {
        address: address_of(keypair),
        public_key: Some(public_key.clone()),
        balance: 0,
        is_delegate: true,
        username: Some("gen0".to_string()),
    });
    config.forging.delegates.push(ForgingDelegate {
        public_key,
        encrypted_secret: encrypt_secret(&keypair.secret.to_bytes(), PASSWORD),
    });
    config.forging.default_password = Some(PASSWORD.to_string());
    // Single-node fixtures have no peers to agree with.
    config.forging.force = true;
}

pub fn fund_account(config: &mut ChainConfig, keypair: &Keypair, balance: u128) {
    config.genesis_accounts.push(GenesisAccount {
        address: address_of(keypair),
        public_key: Some(public_key_hex(keypair)),
        balance,
        is_delegate: false,
        username: None,
    });
}

/// A signed transfer; timestamp doubles as a uniqueness source.
pub fn signed_transfer(
    sender: &Keypair,
    recipient: &str,
    amount: u128,
    fee: u64,
    timestamp: u64,
    data: Option<Vec<u8>>,
) -> Transaction {
    let mut tx = Transaction {
        id: String::new(),
        sender_public_key: public_key_hex(sender),
        sender_id: address_of(sender),
        recipient_id: Some(recipient.to_string()),
        amount,
        fee,
        timestamp,
        asset: TransactionAsset::Transfer { data },
        signature: String::new(),
        sign_signature: None,
        signatures: None,
    };
    seal(&mut tx, sender);
    tx
}

/// Sign the primary signature and recompute the content id. Call after any
/// field edit, and after attaching member signatures.
pub fn seal(tx: &mut Transaction, sender: &Keypair) {
    tx.signature = signature_to_hex(&sign_message(sender, &tx.signing_bytes()));
    tx.id = tx.compute_id();
}

/// Attach multisignature member signatures and re-derive the id.
pub fn attach_member_signatures(tx: &mut Transaction, members: &[&Keypair]) {
    let signing_bytes = tx.signing_bytes();
    tx.signatures = Some(
        members
            .iter()
            .map(|member| signature_to_hex(&sign_message(member, &signing_bytes)))
            .collect(),
    );
    tx.id = tx.compute_id();
}

/// Build and sign a block for the delegate at the given slot.
pub fn build_block(
    config: &ChainConfig,
    keypair: &Keypair,
    height: u64,
    previous: &BlockId,
    slot: u64,
    transactions: Vec<Transaction>,
) -> Block {
    let slots = Slots::new(&config.constants);
    Block::build(
        height,
        Some(previous.clone()),
        slots.slot_time(slot),
        0,
        transactions,
        keypair,
    )
}

/// In-memory network collaborator: serves a scripted peer chain and shared
/// pool, records outbound posts and penalties.
#[derive(Default)]
pub struct InMemoryNetwork {
    pub peers: RwLock<Vec<PeerSnapshot>>,
    /// The peer's chain including genesis, height-ordered.
    pub peer_chain: RwLock<Vec<Block>>,
    pub shared_pool: RwLock<Vec<Transaction>>,
    pub posted_blocks: RwLock<Vec<BlockId>>,
    pub posted_transactions: RwLock<Vec<String>>,
    pub penalties: RwLock<Vec<(String, String)>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_peer(&self, id: &str, broadhash: &str, height: u64) {
        self.peers.write().push(PeerSnapshot {
            id: id.to_string(),
            module_state: Some(PeerModuleState {
                broadhash: broadhash.to_string(),
                height,
            }),
        });
    }

    pub fn set_peer_chain(&self, blocks: Vec<Block>) {
        *self.peer_chain.write() = blocks;
    }
}

#[async_trait]
impl NetworkClient for InMemoryNetwork {
    async fn connected_peers(&self) -> ChainResult<Vec<PeerSnapshot>> {
        Ok(self.peers.read().clone())
    }

    async fn post_block(&self, _peer: &str, block: &Block) -> ChainResult<()> {
        self.posted_blocks.write().push(block.id.clone());
        Ok(())
    }

    async fn post_transactions(
        &self,
        _peer: &str,
        transactions: &[Transaction],
    ) -> ChainResult<()> {
        let mut posted = self.posted_transactions.write();
        for tx in transactions {
            posted.push(tx.id.clone());
        }
        Ok(())
    }

    async fn fetch_transactions(&self, _peer: &str) -> ChainResult<Vec<Transaction>> {
        Ok(self.shared_pool.read().clone())
    }

    async fn fetch_blocks(&self, _peer: &str, last_id: &BlockId) -> ChainResult<Vec<Block>> {
        let chain = self.peer_chain.read();
        let position = chain.iter().position(|block| &block.id == last_id);
        Ok(match position {
            Some(index) => chain.iter().skip(index + 1).take(34).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn common_block(
        &self,
        _peer: &str,
        ids: &[BlockId],
    ) -> ChainResult<Option<CommonBlock>> {
        let chain = self.peer_chain.read();
        Ok(chain
            .iter()
            .filter(|block| ids.contains(&block.id))
            .max_by_key(|block| block.header.height)
            .map(|block| CommonBlock {
                id: block.id.clone(),
                height: block.header.height,
                previous_block_id: block.header.previous_block_id.clone(),
            }))
    }

    fn penalize(&self, peer: &str, reason: &str) {
        self.penalties
            .write()
            .push((peer.to_string(), reason.to_string()));
    }
}

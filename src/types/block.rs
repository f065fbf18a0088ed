use ed25519_dalek::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{hash, sign_message, signature_from_hex, signature_to_hex, verify_signature};
use crate::errors::{ChainError, ChainResult};

use super::{BlockId, Transaction};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_block_id: Option<BlockId>,
    /// Seconds since the chain epoch; always the start of the forging slot.
    pub timestamp: u64,
    pub generator_public_key: String,
    pub payload_hash: String,
    pub payload_length: usize,
    pub number_of_transactions: usize,
    pub total_amount: u128,
    pub total_fee: u64,
    pub reward: u64,
}

impl BlockHeader {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing block header")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub block_signature: String,
}

impl Block {
    /// Assemble and sign a block over the given transactions. The payload
    /// hash covers the canonical bytes of every transaction in order.
    pub fn build(
        height: u64,
        previous_block_id: Option<BlockId>,
        timestamp: u64,
        reward: u64,
        transactions: Vec<Transaction>,
        keypair: &Keypair,
    ) -> Self {
        let (payload_hash, payload_length) = payload_digest(&transactions);
        let total_amount = transactions.iter().map(|tx| tx.amount).sum();
        let total_fee = transactions.iter().map(|tx| u64::from(tx.fee)).sum();
        let header = BlockHeader {
            height,
            previous_block_id,
            timestamp,
            generator_public_key: hex::encode(keypair.public.to_bytes()),
            payload_hash,
            payload_length,
            number_of_transactions: transactions.len(),
            total_amount,
            total_fee,
            reward,
        };
        let signature = sign_message(keypair, &header.canonical_bytes());
        let block_signature = signature_to_hex(&signature);
        let id = compute_block_id(&header, &block_signature);
        Self {
            id,
            header,
            transactions,
            block_signature,
        }
    }

    /// The genesis block is unsigned; account state is seeded alongside it.
    pub fn genesis(timestamp: u64, transactions: Vec<Transaction>) -> Self {
        let (payload_hash, payload_length) = payload_digest(&transactions);
        let total_amount = transactions.iter().map(|tx| tx.amount).sum();
        let total_fee = transactions.iter().map(|tx| u64::from(tx.fee)).sum();
        let header = BlockHeader {
            height: 1,
            previous_block_id: None,
            timestamp,
            generator_public_key: String::new(),
            payload_hash,
            payload_length,
            number_of_transactions: transactions.len(),
            total_amount,
            total_fee,
            reward: 0,
        };
        let block_signature = String::new();
        let id = compute_block_id(&header, &block_signature);
        Self {
            id,
            header,
            transactions,
            block_signature,
        }
    }

    pub fn compute_id(&self) -> BlockId {
        compute_block_id(&self.header, &self.block_signature)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 1 && self.header.previous_block_id.is_none()
    }

    pub fn verify_signature(&self, public_key: &PublicKey) -> ChainResult<()> {
        let signature = signature_from_hex(&self.block_signature)?;
        verify_signature(public_key, &self.header.canonical_bytes(), &signature)
    }

    /// Re-serialize the transactions and compare the digest with the
    /// header's payload hash.
    pub fn verify_payload(&self) -> ChainResult<()> {
        let (payload_hash, payload_length) = payload_digest(&self.transactions);
        if payload_hash != self.header.payload_hash {
            return Err(ChainError::Consensus("payload hash mismatch".into()));
        }
        if payload_length != self.header.payload_length {
            return Err(ChainError::Consensus("payload length mismatch".into()));
        }
        if self.transactions.len() != self.header.number_of_transactions {
            return Err(ChainError::Consensus("transaction count mismatch".into()));
        }
        let total_amount: u128 = self.transactions.iter().map(|tx| tx.amount).sum();
        if total_amount != self.header.total_amount {
            return Err(ChainError::Consensus("total amount mismatch".into()));
        }
        let total_fee: u64 = self.transactions.iter().map(|tx| u64::from(tx.fee)).sum();
        if total_fee != self.header.total_fee {
            return Err(ChainError::Consensus("total fee mismatch".into()));
        }
        Ok(())
    }

    /// Numeric value of the id, used by the fork rule's tiebreak.
    pub fn numeric_id_value(&self) -> u64 {
        self.id.parse().unwrap_or(u64::MAX)
    }
}

fn payload_digest(transactions: &[Transaction]) -> (String, usize) {
    let mut payload = Vec::new();
    for tx in transactions {
        payload.extend_from_slice(&tx.canonical_bytes());
    }
    (hex::encode(hash(&payload)), payload.len())
}

fn compute_block_id(header: &BlockHeader, block_signature: &str) -> BlockId {
    let mut bytes = header.canonical_bytes();
    bytes.extend_from_slice(block_signature.as_bytes());
    super::numeric_id(&hash(&bytes))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub id: BlockId,
    pub timestamp: u64,
}

impl From<&Block> for BlockMetadata {
    fn from(block: &Block) -> Self {
        Self {
            height: block.header.height,
            id: block.id.clone(),
            timestamp: block.header.timestamp,
        }
    }
}

/// Row returned by the common-block probe during fork detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommonBlock {
    pub id: BlockId,
    pub height: u64,
    pub previous_block_id: Option<BlockId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypair_from_secret;

    #[test]
    fn built_block_round_trips_id_and_signature() {
        let keypair = keypair_from_secret(&[5u8; 32]).expect("keypair");
        let block = Block::build(2, Some("99".into()), 120, 0, Vec::new(), &keypair);
        assert_eq!(block.compute_id(), block.id);
        assert!(block.id.bytes().all(|b| b.is_ascii_digit()));
        block.verify_signature(&keypair.public).expect("signature");
        block.verify_payload().expect("payload");
    }

    #[test]
    fn serialization_preserves_canonical_bytes_and_id() {
        let keypair = keypair_from_secret(&[5u8; 32]).expect("keypair");
        let block = Block::build(2, Some("99".into()), 120, 0, Vec::new(), &keypair);
        let encoded = serde_json::to_vec(&block).expect("encode");
        let decoded: Block = serde_json::from_slice(&encoded).expect("decode");
        assert_eq!(decoded.header.canonical_bytes(), block.header.canonical_bytes());
        assert_eq!(decoded.compute_id(), block.id);
    }

    #[test]
    fn payload_mismatch_is_detected() {
        let keypair = keypair_from_secret(&[5u8; 32]).expect("keypair");
        let mut block = Block::build(2, Some("99".into()), 120, 0, Vec::new(), &keypair);
        block.header.payload_hash = "00".repeat(32);
        assert!(block.verify_payload().is_err());
    }

    #[test]
    fn genesis_block_is_unsigned_and_stable() {
        let first = Block::genesis(0, Vec::new());
        let second = Block::genesis(0, Vec::new());
        assert!(first.is_genesis());
        assert_eq!(first.id, second.id);
        assert!(first.block_signature.is_empty());
    }
}

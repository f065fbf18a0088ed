mod account;
mod block;
mod transaction;

pub use account::{Account, VoteWeight};
pub use block::{Block, BlockHeader, BlockMetadata, CommonBlock};
pub use transaction::{
    SanitizedSignature, SanitizedSignatures, SanitizedTransaction, Transaction, TransactionAsset,
    TRANSACTION_TYPE_COUNT,
};

pub type Address = String;
pub type BlockId = String;
pub type TransactionId = String;

/// Content ids are the first eight hash bytes rendered as a decimal
/// string, which keeps them numeric and totally ordered.
pub(crate) fn numeric_id(hash: &[u8; 32]) -> String {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(bytes).to_string()
}

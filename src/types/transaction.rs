use serde::{Deserialize, Serialize};

use crate::crypto::{
    address_from_public_key, hash, public_key_from_hex, signature_from_hex, verify_signature,
};
use crate::errors::{ChainError, ChainResult};

use super::{Address, BlockId, TransactionId};

pub const TRANSACTION_TYPE_COUNT: u8 = 8;

const MAX_TRANSFER_DATA_LENGTH: usize = 64;
const MAX_VOTES_PER_TRANSACTION: usize = 33;
const MAX_MULTISIG_KEYSGROUP: usize = 15;
const MAX_MULTISIG_LIFETIME: u32 = 72;
const MAX_USERNAME_LENGTH: usize = 20;
const MAX_DAPP_NAME_LENGTH: usize = 32;

/// Type-specific payload. The variant order fixes the numeric type tags
/// 0..7 reserved for the built-in set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionAsset {
    Transfer {
        data: Option<Vec<u8>>,
    },
    SecondSignature {
        public_key: String,
    },
    DelegateRegistration {
        username: String,
    },
    Vote {
        votes: Vec<String>,
    },
    Multisignature {
        min: u32,
        lifetime: u32,
        keysgroup: Vec<String>,
    },
    Dapp {
        name: String,
        link: String,
    },
    InTransfer {
        dapp_id: String,
    },
    OutTransfer {
        dapp_id: String,
        transaction_id: TransactionId,
    },
}

impl TransactionAsset {
    pub fn type_tag(&self) -> u8 {
        match self {
            TransactionAsset::Transfer { .. } => 0,
            TransactionAsset::SecondSignature { .. } => 1,
            TransactionAsset::DelegateRegistration { .. } => 2,
            TransactionAsset::Vote { .. } => 3,
            TransactionAsset::Multisignature { .. } => 4,
            TransactionAsset::Dapp { .. } => 5,
            TransactionAsset::InTransfer { .. } => 6,
            TransactionAsset::OutTransfer { .. } => 7,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender_public_key: String,
    pub sender_id: Address,
    pub recipient_id: Option<Address>,
    pub amount: u128,
    pub fee: u64,
    pub timestamp: u64,
    pub asset: TransactionAsset,
    pub signature: String,
    pub sign_signature: Option<String>,
    pub signatures: Option<Vec<String>>,
}

/// The signed portion of a transaction, serialized in declaration order.
#[derive(Serialize)]
struct SigningView<'a> {
    tx_type: u8,
    sender_public_key: &'a str,
    sender_id: &'a str,
    recipient_id: &'a Option<Address>,
    amount: u128,
    fee: u64,
    timestamp: u64,
    asset: &'a TransactionAsset,
}

impl Transaction {
    pub fn tx_type(&self) -> u8 {
        self.asset.type_tag()
    }

    /// Bytes covered by the sender signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let view = SigningView {
            tx_type: self.tx_type(),
            sender_public_key: &self.sender_public_key,
            sender_id: &self.sender_id,
            recipient_id: &self.recipient_id,
            amount: self.amount,
            fee: self.fee,
            timestamp: self.timestamp,
            asset: &self.asset,
        };
        serde_json::to_vec(&view).expect("serializing transaction")
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        hash(&self.signing_bytes())
    }

    /// Canonical bytes: the signed view followed by every attached
    /// signature. The content id derives from these bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = self.signing_bytes();
        bytes.extend_from_slice(self.signature.as_bytes());
        if let Some(sign_signature) = &self.sign_signature {
            bytes.extend_from_slice(sign_signature.as_bytes());
        }
        if let Some(signatures) = &self.signatures {
            for signature in signatures {
                bytes.extend_from_slice(signature.as_bytes());
            }
        }
        bytes
    }

    pub fn compute_id(&self) -> TransactionId {
        super::numeric_id(&hash(&self.canonical_bytes()))
    }

    pub fn size(&self) -> usize {
        self.canonical_bytes().len()
    }

    /// Ordering key for pool selection: milli-fee per canonical byte.
    pub fn fee_per_byte(&self) -> u128 {
        let size = self.size().max(1) as u128;
        u128::from(self.fee) * 1_000 / size
    }

    /// Structural checks: id, address derivation, type-specific asset
    /// schema. No state access.
    pub fn validate_schema(&self) -> ChainResult<()> {
        let sender_public = public_key_from_hex(&self.sender_public_key)?;
        let derived = address_from_public_key(&sender_public);
        if !derived.eq_ignore_ascii_case(&self.sender_id) {
            return Err(ChainError::Validation(
                "sender address does not match sender public key".into(),
            ));
        }
        if self.id != self.compute_id() {
            return Err(ChainError::Validation(
                "transaction id does not match contents".into(),
            ));
        }
        if self.fee == 0 {
            return Err(ChainError::Validation("transaction fee must be positive".into()));
        }
        self.validate_asset()
    }

    fn validate_asset(&self) -> ChainResult<()> {
        match &self.asset {
            TransactionAsset::Transfer { data } => {
                if self.recipient_id.is_none() {
                    return Err(ChainError::Validation("transfer requires a recipient".into()));
                }
                if self.amount == 0 {
                    return Err(ChainError::Validation("transfer amount must be positive".into()));
                }
                if let Some(data) = data {
                    if data.len() > MAX_TRANSFER_DATA_LENGTH {
                        return Err(ChainError::Validation(format!(
                            "transfer data exceeds {MAX_TRANSFER_DATA_LENGTH} bytes"
                        )));
                    }
                }
            }
            TransactionAsset::SecondSignature { public_key } => {
                public_key_from_hex(public_key)?;
                if self.amount != 0 {
                    return Err(ChainError::Validation(
                        "second signature registration carries no amount".into(),
                    ));
                }
            }
            TransactionAsset::DelegateRegistration { username } => {
                if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
                    return Err(ChainError::Validation("invalid delegate username length".into()));
                }
                if !username
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                {
                    return Err(ChainError::Validation(
                        "delegate username must be lowercase alphanumeric".into(),
                    ));
                }
                if self.amount != 0 {
                    return Err(ChainError::Validation(
                        "delegate registration carries no amount".into(),
                    ));
                }
            }
            TransactionAsset::Vote { votes } => {
                if votes.is_empty() || votes.len() > MAX_VOTES_PER_TRANSACTION {
                    return Err(ChainError::Validation("invalid vote count".into()));
                }
                for vote in votes {
                    let (op, key) = vote.split_at(1.min(vote.len()));
                    if op != "+" && op != "-" {
                        return Err(ChainError::Validation(
                            "vote entries must carry a +/- prefix".into(),
                        ));
                    }
                    public_key_from_hex(key)?;
                }
            }
            TransactionAsset::Multisignature {
                min,
                lifetime,
                keysgroup,
            } => {
                if keysgroup.is_empty() || keysgroup.len() > MAX_MULTISIG_KEYSGROUP {
                    return Err(ChainError::Validation("invalid multisignature keysgroup".into()));
                }
                if *min == 0 || *min as usize > keysgroup.len() {
                    return Err(ChainError::Validation(
                        "multisignature min outside keysgroup bounds".into(),
                    ));
                }
                if *lifetime == 0 || *lifetime > MAX_MULTISIG_LIFETIME {
                    return Err(ChainError::Validation("invalid multisignature lifetime".into()));
                }
                for key in keysgroup {
                    public_key_from_hex(key)?;
                }
            }
            TransactionAsset::Dapp { name, .. } => {
                if name.is_empty() || name.len() > MAX_DAPP_NAME_LENGTH {
                    return Err(ChainError::Validation("invalid dapp name length".into()));
                }
            }
            TransactionAsset::InTransfer { dapp_id } => {
                if self.amount == 0 {
                    return Err(ChainError::Validation("in-transfer amount must be positive".into()));
                }
                require_numeric(dapp_id, "dapp id")?;
            }
            TransactionAsset::OutTransfer {
                dapp_id,
                transaction_id,
            } => {
                require_numeric(dapp_id, "dapp id")?;
                require_numeric(transaction_id, "transaction id")?;
            }
        }
        Ok(())
    }

    /// Verify the primary sender signature over the signing bytes.
    pub fn verify_sender_signature(&self) -> ChainResult<()> {
        let public = public_key_from_hex(&self.sender_public_key)?;
        let signature = signature_from_hex(&self.signature)?;
        verify_signature(&public, &self.signing_bytes(), &signature)
    }

    /// Verify the second signature under the registered second public key.
    pub fn verify_second_signature(&self, second_public_key: &str) -> ChainResult<()> {
        let sign_signature = self.sign_signature.as_deref().ok_or_else(|| {
            ChainError::Consensus("sender requires a second signature".into())
        })?;
        let public = public_key_from_hex(second_public_key)?;
        let signature = signature_from_hex(sign_signature)?;
        verify_signature(&public, &self.signing_bytes(), &signature)
    }

    /// Count member signatures that verify against the signing hash.
    pub fn count_valid_member_signatures(&self, members: &[String]) -> usize {
        let signing_bytes = self.signing_bytes();
        let Some(signatures) = &self.signatures else {
            return 0;
        };
        signatures
            .iter()
            .filter(|signature| {
                resolve_member(&signing_bytes, signature, members).is_some()
            })
            .count()
    }

    /// Query shape for inbound/outbound transaction listings.
    pub fn sanitized(
        &self,
        block_id: Option<&BlockId>,
        multisig_members: Option<&[String]>,
    ) -> SanitizedTransaction {
        let message = match &self.asset {
            TransactionAsset::Transfer { data: Some(data) } => {
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        };
        let signatures = match (&self.signatures, multisig_members, self.tx_type()) {
            (Some(signatures), Some(members), 0) => {
                // The signing bytes are computed once; every member key is
                // tried against the same digest.
                let signing_bytes = self.signing_bytes();
                SanitizedSignatures::Resolved(
                    signatures
                        .iter()
                        .map(|signature| SanitizedSignature {
                            signer_address: resolve_member(&signing_bytes, signature, members),
                            signature: signature.clone(),
                        })
                        .collect(),
                )
            }
            (Some(signatures), _, _) => SanitizedSignatures::Raw(signatures.clone()),
            (None, _, _) => SanitizedSignatures::Raw(Vec::new()),
        };
        SanitizedTransaction {
            id: self.id.clone(),
            tx_type: self.tx_type(),
            sender_address: self.sender_id.clone(),
            sender_public_key: self.sender_public_key.clone(),
            timestamp: self.timestamp,
            recipient_address: self.recipient_id.clone(),
            amount: self.amount,
            block_id: block_id.cloned(),
            message,
            signatures,
        }
    }
}

fn require_numeric(value: &str, what: &str) -> ChainResult<()> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChainError::Validation(format!("{what} must be numeric")));
    }
    Ok(())
}

fn resolve_member(signing_bytes: &[u8], signature_hex: &str, members: &[String]) -> Option<Address> {
    let signature = signature_from_hex(signature_hex).ok()?;
    members.iter().find_map(|member| {
        let public = public_key_from_hex(member).ok()?;
        verify_signature(&public, signing_bytes, &signature)
            .ok()
            .map(|_| address_from_public_key(&public))
    })
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedTransaction {
    pub id: TransactionId,
    #[serde(rename = "type")]
    pub tx_type: u8,
    pub sender_address: Address,
    pub sender_public_key: String,
    pub timestamp: u64,
    pub recipient_address: Option<Address>,
    pub amount: u128,
    pub block_id: Option<BlockId>,
    pub message: Option<String>,
    pub signatures: SanitizedSignatures,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SanitizedSignatures {
    Raw(Vec<String>),
    Resolved(Vec<SanitizedSignature>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedSignature {
    pub signer_address: Option<Address>,
    pub signature: String,
}

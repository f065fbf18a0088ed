use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Account, Address, Block, Transaction, TransactionAsset};

/// Type-specific transaction behavior. The generic amount+fee movement is
/// the ledger's job; handlers apply and undo everything else.
pub trait TransactionHandler: Send + Sync {
    fn type_tag(&self) -> u8;

    /// State checks beyond balance and signatures.
    fn verify(&self, _tx: &Transaction, _ledger: &Ledger) -> ChainResult<()> {
        Ok(())
    }

    /// Gate a transaction against the current tip.
    fn check_allowed(&self, _tx: &Transaction, _last_block: &Block) -> ChainResult<()> {
        Ok(())
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()>;

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()>;
}

/// Dispatch table from numeric type tag to handler, populated at boot.
pub struct HandlerRegistry {
    handlers: HashMap<u8, Arc<dyn TransactionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in handlers for tags 0..7.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TransferHandler));
        registry.register(Arc::new(SecondSignatureHandler));
        registry.register(Arc::new(DelegateHandler));
        registry.register(Arc::new(VoteHandler));
        registry.register(Arc::new(MultisignatureHandler));
        registry.register(Arc::new(DappHandler));
        registry.register(Arc::new(InTransferHandler));
        registry.register(Arc::new(OutTransferHandler));
        debug_assert_eq!(
            registry.handlers.len(),
            usize::from(crate::types::TRANSACTION_TYPE_COUNT)
        );
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TransactionHandler>) {
        self.handlers.insert(handler.type_tag(), handler);
    }

    pub fn get(&self, tag: u8) -> ChainResult<&Arc<dyn TransactionHandler>> {
        self.handlers
            .get(&tag)
            .ok_or_else(|| ChainError::Validation(format!("unknown transaction type {tag}")))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// In-memory account state. The storage layer is written through under the
/// sequence; this map is the authoritative working copy.
pub struct Ledger {
    accounts: RwLock<HashMap<Address, Account>>,
    memberships: RwLock<HashMap<Address, Vec<String>>>,
    dirty_accounts: RwLock<HashSet<Address>>,
    dirty_memberships: RwLock<HashSet<Address>>,
    handlers: HandlerRegistry,
}

impl Ledger {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            dirty_accounts: RwLock::new(HashSet::new()),
            dirty_memberships: RwLock::new(HashSet::new()),
            handlers,
        }
    }

    pub fn load(
        handlers: HandlerRegistry,
        accounts: Vec<Account>,
        memberships: Vec<(Address, Vec<String>)>,
    ) -> Self {
        let ledger = Ledger::new(handlers);
        {
            let mut map = ledger.accounts.write();
            for account in accounts {
                map.insert(account.address.clone(), account);
            }
        }
        {
            let mut map = ledger.memberships.write();
            for (address, members) in memberships {
                map.insert(address, members);
            }
        }
        ledger
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn get_account(&self, address: &str) -> Option<Account> {
        self.accounts.read().get(address).cloned()
    }

    pub fn account_exists(&self, address: &str) -> bool {
        self.accounts.read().contains_key(address)
    }

    pub fn balance_of(&self, address: &str) -> u128 {
        self.accounts
            .read()
            .get(address)
            .map(|account| account.balance)
            .unwrap_or(0)
    }

    pub fn accounts_snapshot(&self) -> Vec<Account> {
        let mut accounts = self.accounts.read().values().cloned().collect::<Vec<_>>();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }

    pub fn multisig_members(&self, address: &str) -> Option<Vec<String>> {
        self.memberships.read().get(address).cloned()
    }

    /// Top `n` delegates by vote weight, public key as tiebreak.
    pub fn top_delegates(&self, n: usize) -> Vec<String> {
        let accounts = self.accounts.read();
        let mut delegates: Vec<&Account> = accounts
            .values()
            .filter(|account| account.is_delegate && account.public_key.is_some())
            .collect();
        delegates.sort_by(|a, b| {
            b.vote_weight
                .cmp(&a.vote_weight)
                .then_with(|| a.public_key.cmp(&b.public_key))
        });
        delegates
            .into_iter()
            .take(n)
            .filter_map(|account| account.public_key.clone())
            .collect()
    }

    pub(crate) fn with_account_mut<T>(
        &self,
        address: &str,
        f: impl FnOnce(&mut Account) -> T,
    ) -> T {
        let mut accounts = self.accounts.write();
        let account = accounts
            .entry(address.to_string())
            .or_insert_with(|| Account::new(address.to_string()));
        let result = f(account);
        drop(accounts);
        self.dirty_accounts.write().insert(address.to_string());
        result
    }

    pub(crate) fn set_membership(&self, address: &str, members: Vec<String>) {
        self.memberships.write().insert(address.to_string(), members);
        self.dirty_memberships.write().insert(address.to_string());
    }

    pub(crate) fn clear_membership(&self, address: &str) {
        self.memberships.write().remove(address);
        self.dirty_memberships.write().insert(address.to_string());
    }

    pub fn credit(&self, address: &str, amount: u128) {
        self.with_account_mut(address, |account| account.credit(amount));
    }

    pub fn debit(&self, address: &str, amount: u128) -> ChainResult<()> {
        let ok = self.with_account_mut(address, |account| account.debit(amount));
        if ok {
            Ok(())
        } else {
            Err(ChainError::State(format!(
                "balance underflow for account {address}"
            )))
        }
    }

    /// Accounts touched since the last drain, for write-through persistence.
    pub fn take_dirty_accounts(&self) -> Vec<Account> {
        let addresses: Vec<Address> = self.dirty_accounts.write().drain().collect();
        let accounts = self.accounts.read();
        addresses
            .iter()
            .filter_map(|address| accounts.get(address).cloned())
            .collect()
    }

    pub fn take_dirty_memberships(&self) -> Vec<(Address, Vec<String>)> {
        let addresses: Vec<Address> = self.dirty_memberships.write().drain().collect();
        let memberships = self.memberships.read();
        addresses
            .into_iter()
            .map(|address| {
                let members = memberships.get(&address).cloned().unwrap_or_default();
                (address, members)
            })
            .collect()
    }

    pub fn seed_genesis(&self, accounts: &[crate::config::GenesisAccount]) {
        for entry in accounts {
            self.with_account_mut(&entry.address, |account| {
                account.public_key = entry.public_key.clone();
                account.balance = entry.balance;
                account.u_balance = entry.balance;
                account.is_delegate = entry.is_delegate;
                account.username = entry.username.clone();
            });
        }
    }

    /// Full stateful verification of a transaction against confirmed state:
    /// sender presence, signatures (second/multi included), balance cover,
    /// and the handler's own checks.
    pub fn verify_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        tx.verify_sender_signature()?;
        let sender = self
            .get_account(&tx.sender_id)
            .ok_or_else(|| ChainError::State(format!("sender account {} not found", tx.sender_id)))?;
        if let Some(second_public_key) = &sender.second_public_key {
            tx.verify_second_signature(second_public_key)?;
        }
        if sender.is_multisig() {
            let members = self.multisig_members(&tx.sender_id).unwrap_or_default();
            let valid = tx.count_valid_member_signatures(&members);
            if valid < sender.multimin as usize {
                return Err(ChainError::Consensus(format!(
                    "multisignature threshold not met: {valid} of {}",
                    sender.multimin
                )));
            }
        }
        let total = tx
            .amount
            .checked_add(u128::from(tx.fee))
            .ok_or_else(|| ChainError::Validation("transaction amount overflow".into()))?;
        if sender.balance < total {
            return Err(ChainError::State(format!(
                "insufficient balance for account {}",
                tx.sender_id
            )));
        }
        let handler = self.handlers.get(tx.tx_type())?;
        handler.verify(tx, self)
    }

    /// Move the funds and apply the type-specific effects. Callers verify
    /// first; a failed apply mid-block is unwound by the block rollback.
    pub fn apply_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        let total = tx
            .amount
            .checked_add(u128::from(tx.fee))
            .ok_or_else(|| ChainError::Validation("transaction amount overflow".into()))?;
        self.debit(&tx.sender_id, total)?;
        let handler = self.handlers.get(tx.tx_type())?;
        handler.apply(tx, self)
    }

    /// Exact inverse of `apply_transaction`. The handler undo runs before
    /// the sender refund so it observes the same balances apply did.
    pub fn undo_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        let handler = self.handlers.get(tx.tx_type())?;
        handler.undo(tx, self)?;
        let total = tx
            .amount
            .checked_add(u128::from(tx.fee))
            .ok_or_else(|| ChainError::Validation("transaction amount overflow".into()))?;
        self.credit(&tx.sender_id, total);
        Ok(())
    }

    pub fn check_allowed(&self, tx: &Transaction, last_block: &Block) -> ChainResult<()> {
        let handler = self.handlers.get(tx.tx_type())?;
        handler.check_allowed(tx, last_block)
    }
}

fn recipient_of(tx: &Transaction) -> ChainResult<&str> {
    tx.recipient_id
        .as_deref()
        .ok_or_else(|| ChainError::Validation("transaction requires a recipient".into()))
}

struct TransferHandler;

impl TransactionHandler for TransferHandler {
    fn type_tag(&self) -> u8 {
        0
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.credit(recipient_of(tx)?, tx.amount);
        Ok(())
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.debit(recipient_of(tx)?, tx.amount)
    }
}

struct SecondSignatureHandler;

impl TransactionHandler for SecondSignatureHandler {
    fn type_tag(&self) -> u8 {
        1
    }

    fn verify(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        let sender = ledger.get_account(&tx.sender_id);
        if sender.and_then(|account| account.second_public_key).is_some() {
            return Err(ChainError::State("second signature already enabled".into()));
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        let TransactionAsset::SecondSignature { public_key } = &tx.asset else {
            return Err(ChainError::Validation("asset does not match type tag".into()));
        };
        ledger.with_account_mut(&tx.sender_id, |account| {
            account.second_public_key = Some(public_key.clone());
        });
        Ok(())
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.with_account_mut(&tx.sender_id, |account| {
            account.second_public_key = None;
        });
        Ok(())
    }
}

struct DelegateHandler;

impl TransactionHandler for DelegateHandler {
    fn type_tag(&self) -> u8 {
        2
    }

    fn verify(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        let TransactionAsset::DelegateRegistration { username } = &tx.asset else {
            return Err(ChainError::Validation("asset does not match type tag".into()));
        };
        if let Some(sender) = ledger.get_account(&tx.sender_id) {
            if sender.is_delegate {
                return Err(ChainError::State("account is already a delegate".into()));
            }
        }
        let taken = ledger
            .accounts
            .read()
            .values()
            .any(|account| account.username.as_deref() == Some(username.as_str()));
        if taken {
            return Err(ChainError::State(format!("username {username} already taken")));
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        let TransactionAsset::DelegateRegistration { username } = &tx.asset else {
            return Err(ChainError::Validation("asset does not match type tag".into()));
        };
        ledger.with_account_mut(&tx.sender_id, |account| {
            account.is_delegate = true;
            account.username = Some(username.clone());
            account.public_key = Some(tx.sender_public_key.clone());
        });
        Ok(())
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.with_account_mut(&tx.sender_id, |account| {
            account.is_delegate = false;
            account.username = None;
        });
        Ok(())
    }
}

struct VoteHandler;

impl VoteHandler {
    fn shift(tx: &Transaction, ledger: &Ledger, reverse: bool) -> ChainResult<()> {
        let TransactionAsset::Vote { votes } = &tx.asset else {
            return Err(ChainError::Validation("asset does not match type tag".into()));
        };
        // The sender balance after the fee debit fixes the weight moved by
        // this vote; undo observes the identical balance in reverse order.
        let weight = ledger.balance_of(&tx.sender_id);
        for vote in votes {
            let (op, delegate_key) = vote.split_at(1);
            let adding = (op == "+") != reverse;
            let delegate_address = crate::crypto::address_from_public_key_hex(delegate_key)?;
            ledger.with_account_mut(&delegate_address, |account| {
                if adding {
                    account.vote_weight.add_assign(weight);
                } else {
                    account.vote_weight.saturating_sub(weight);
                }
            });
            ledger.with_account_mut(&tx.sender_id, |account| {
                if adding {
                    if !account.votes.contains(&delegate_key.to_string()) {
                        account.votes.push(delegate_key.to_string());
                    }
                } else {
                    account.votes.retain(|existing| existing != delegate_key);
                }
            });
        }
        Ok(())
    }
}

impl TransactionHandler for VoteHandler {
    fn type_tag(&self) -> u8 {
        3
    }

    fn verify(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        let TransactionAsset::Vote { votes } = &tx.asset else {
            return Err(ChainError::Validation("asset does not match type tag".into()));
        };
        let sender_votes = ledger
            .get_account(&tx.sender_id)
            .map(|account| account.votes)
            .unwrap_or_default();
        for vote in votes {
            let (op, delegate_key) = vote.split_at(1);
            let delegate_address = crate::crypto::address_from_public_key_hex(delegate_key)?;
            let is_delegate = ledger
                .get_account(&delegate_address)
                .map(|account| account.is_delegate)
                .unwrap_or(false);
            if !is_delegate {
                return Err(ChainError::State(format!(
                    "voted account {delegate_key} is not a delegate"
                )));
            }
            let already = sender_votes.iter().any(|existing| existing == delegate_key);
            if op == "+" && already {
                return Err(ChainError::State("already voted for delegate".into()));
            }
            if op == "-" && !already {
                return Err(ChainError::State("cannot remove a vote never cast".into()));
            }
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        Self::shift(tx, ledger, false)
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        Self::shift(tx, ledger, true)
    }
}

struct MultisignatureHandler;

impl TransactionHandler for MultisignatureHandler {
    fn type_tag(&self) -> u8 {
        4
    }

    fn verify(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        if let Some(sender) = ledger.get_account(&tx.sender_id) {
            if sender.is_multisig() {
                return Err(ChainError::State("account is already multisignature".into()));
            }
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        let TransactionAsset::Multisignature {
            min,
            lifetime,
            keysgroup,
        } = &tx.asset
        else {
            return Err(ChainError::Validation("asset does not match type tag".into()));
        };
        ledger.with_account_mut(&tx.sender_id, |account| {
            account.multimin = *min;
            account.multilifetime = *lifetime;
        });
        ledger.set_membership(&tx.sender_id, keysgroup.clone());
        Ok(())
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.with_account_mut(&tx.sender_id, |account| {
            account.multimin = 0;
            account.multilifetime = 0;
        });
        ledger.clear_membership(&tx.sender_id);
        Ok(())
    }
}

struct DappHandler;

impl TransactionHandler for DappHandler {
    fn type_tag(&self) -> u8 {
        5
    }

    fn apply(&self, _tx: &Transaction, _ledger: &Ledger) -> ChainResult<()> {
        // Registration only burns the fee; the dapp registry itself lives
        // with the embedding application.
        Ok(())
    }

    fn undo(&self, _tx: &Transaction, _ledger: &Ledger) -> ChainResult<()> {
        Ok(())
    }
}

struct InTransferHandler;

impl TransactionHandler for InTransferHandler {
    fn type_tag(&self) -> u8 {
        6
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.credit(recipient_of(tx)?, tx.amount);
        Ok(())
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.debit(recipient_of(tx)?, tx.amount)
    }
}

struct OutTransferHandler;

impl TransactionHandler for OutTransferHandler {
    fn type_tag(&self) -> u8 {
        7
    }

    fn apply(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.credit(recipient_of(tx)?, tx.amount);
        Ok(())
    }

    fn undo(&self, tx: &Transaction, ledger: &Ledger) -> ChainResult<()> {
        ledger.debit(recipient_of(tx)?, tx.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        address_from_public_key, keypair_from_secret, sign_message, signature_to_hex,
    };
    use ed25519_dalek::Keypair;

    fn funded_ledger(keypair: &Keypair, balance: u128) -> Ledger {
        let ledger = Ledger::new(HandlerRegistry::builtin());
        let address = address_from_public_key(&keypair.public);
        ledger.with_account_mut(&address, |account| {
            account.public_key = Some(hex::encode(keypair.public.to_bytes()));
            account.balance = balance;
            account.u_balance = balance;
        });
        ledger.take_dirty_accounts();
        ledger
    }

    fn sign(tx: &mut Transaction, keypair: &Keypair) {
        tx.signature = signature_to_hex(&sign_message(keypair, &tx.signing_bytes()));
        tx.id = tx.compute_id();
    }

    fn transfer(keypair: &Keypair, recipient: &str, amount: u128, fee: u64) -> Transaction {
        let mut tx = Transaction {
            id: String::new(),
            sender_public_key: hex::encode(keypair.public.to_bytes()),
            sender_id: address_from_public_key(&keypair.public),
            recipient_id: Some(recipient.to_string()),
            amount,
            fee,
            timestamp: 5,
            asset: TransactionAsset::Transfer { data: None },
            signature: String::new(),
            sign_signature: None,
            signatures: None,
        };
        sign(&mut tx, keypair);
        tx
    }

    #[test]
    fn transfer_moves_funds_and_undo_restores_them() {
        let keypair = keypair_from_secret(&[7u8; 32]).expect("keypair");
        let ledger = funded_ledger(&keypair, 1_000);
        let sender = address_from_public_key(&keypair.public);
        let tx = transfer(&keypair, &"bb".repeat(32), 100, 10);

        ledger.verify_transaction(&tx).expect("verify");
        ledger.apply_transaction(&tx).expect("apply");
        assert_eq!(ledger.balance_of(&sender), 890);
        assert_eq!(ledger.balance_of(&"bb".repeat(32)), 100);

        ledger.undo_transaction(&tx).expect("undo");
        assert_eq!(ledger.balance_of(&sender), 1_000);
        assert_eq!(ledger.balance_of(&"bb".repeat(32)), 0);
    }

    #[test]
    fn insufficient_balance_is_a_state_error() {
        let keypair = keypair_from_secret(&[7u8; 32]).expect("keypair");
        let ledger = funded_ledger(&keypair, 50);
        let tx = transfer(&keypair, &"bb".repeat(32), 100, 10);
        let err = ledger.verify_transaction(&tx).unwrap_err();
        assert!(matches!(err, ChainError::State(_)));
    }

    #[test]
    fn vote_shifts_delegate_weight_and_reverses() {
        let voter = keypair_from_secret(&[7u8; 32]).expect("keypair");
        let delegate = keypair_from_secret(&[8u8; 32]).expect("keypair");
        let delegate_key = hex::encode(delegate.public.to_bytes());
        let delegate_address = address_from_public_key(&delegate.public);
        let ledger = funded_ledger(&voter, 1_000);
        ledger.with_account_mut(&delegate_address, |account| {
            account.is_delegate = true;
            account.public_key = Some(delegate_key.clone());
            account.username = Some("gen0".into());
        });

        let mut tx = transfer(&voter, &address_from_public_key(&voter.public), 0, 10);
        tx.amount = 0;
        tx.asset = TransactionAsset::Vote {
            votes: vec![format!("+{delegate_key}")],
        };
        sign(&mut tx, &voter);

        ledger.verify_transaction(&tx).expect("verify vote");
        ledger.apply_transaction(&tx).expect("apply vote");
        let weight = ledger
            .get_account(&delegate_address)
            .expect("delegate")
            .vote_weight;
        assert_eq!(weight.to_string(), "990");
        assert_eq!(
            ledger.get_account(&tx.sender_id).expect("voter").votes,
            vec![delegate_key.clone()]
        );

        ledger.undo_transaction(&tx).expect("undo vote");
        let account = ledger.get_account(&delegate_address).expect("delegate");
        assert_eq!(account.vote_weight.to_string(), "0");
        assert!(ledger.get_account(&tx.sender_id).expect("voter").votes.is_empty());
    }

    #[test]
    fn multisig_registration_records_membership() {
        let keypair = keypair_from_secret(&[7u8; 32]).expect("keypair");
        let member = keypair_from_secret(&[9u8; 32]).expect("keypair");
        let ledger = funded_ledger(&keypair, 1_000);
        let mut tx = transfer(&keypair, &"bb".repeat(32), 0, 10);
        tx.amount = 0;
        tx.recipient_id = None;
        tx.asset = TransactionAsset::Multisignature {
            min: 1,
            lifetime: 24,
            keysgroup: vec![hex::encode(member.public.to_bytes())],
        };
        sign(&mut tx, &keypair);

        ledger.apply_transaction(&tx).expect("apply");
        let account = ledger.get_account(&tx.sender_id).expect("account");
        assert!(account.is_multisig());
        assert_eq!(
            ledger.multisig_members(&tx.sender_id).expect("members").len(),
            1
        );

        ledger.undo_transaction(&tx).expect("undo");
        assert!(!ledger.get_account(&tx.sender_id).expect("account").is_multisig());
        assert!(ledger.multisig_members(&tx.sender_id).is_none());
    }

    #[test]
    fn top_delegates_order_by_weight_then_key() {
        let ledger = Ledger::new(HandlerRegistry::builtin());
        for (key, weight) in [("aa", 50u128), ("bb", 90), ("cc", 90)] {
            ledger.with_account_mut(&format!("addr-{key}"), |account| {
                account.is_delegate = true;
                account.public_key = Some(key.repeat(32));
                account.vote_weight = crate::types::VoteWeight::from_u128(weight);
            });
        }
        let top = ledger.top_delegates(2);
        assert_eq!(top, vec!["bb".repeat(32), "cc".repeat(32)]);
    }

    #[test]
    fn dirty_tracking_drains_touched_accounts() {
        let ledger = Ledger::new(HandlerRegistry::builtin());
        ledger.credit("one", 5);
        ledger.credit("two", 5);
        let dirty = ledger.take_dirty_accounts();
        assert_eq!(dirty.len(), 2);
        assert!(ledger.take_dirty_accounts().is_empty());
    }
}

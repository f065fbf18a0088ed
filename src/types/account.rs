use std::fmt;
use std::ops::{AddAssign, SubAssign};
use std::str::FromStr;

use malachite::Natural;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Address;

/// Accumulated vote weight of a delegate. Unbounded, serialized as a
/// decimal string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VoteWeight {
    inner: Natural,
}

impl VoteWeight {
    pub fn zero() -> Self {
        Self {
            inner: Natural::from(0u32),
        }
    }

    pub fn from_natural(inner: Natural) -> Self {
        Self { inner }
    }

    pub fn from_u128(value: u128) -> Self {
        Self {
            inner: Natural::from(value),
        }
    }

    pub fn as_natural(&self) -> &Natural {
        &self.inner
    }

    pub fn add_assign(&mut self, amount: u128) {
        self.inner.add_assign(Natural::from(amount));
    }

    pub fn saturating_sub(&mut self, amount: u128) {
        let amount = Natural::from(amount);
        if self.inner >= amount {
            self.inner.sub_assign(amount);
        } else {
            self.inner = Natural::from(0u32);
        }
    }
}

impl Default for VoteWeight {
    fn default() -> Self {
        Self::zero()
    }
}

impl FromStr for VoteWeight {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Natural::from_str(s).map(VoteWeight::from_natural)
    }
}

impl Serialize for VoteWeight {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.inner.to_string())
    }
}

impl<'de> Deserialize<'de> for VoteWeight {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Natural::from_str(&value)
            .map(VoteWeight::from_natural)
            .map_err(|_| serde::de::Error::custom("invalid vote weight value"))
    }
}

impl fmt::Display for VoteWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub public_key: Option<String>,
    pub balance: u128,
    /// Confirmed balance minus outstanding pool reservations; re-synced to
    /// `balance` whenever a block commits or rolls back.
    pub u_balance: u128,
    pub second_public_key: Option<String>,
    pub is_delegate: bool,
    pub username: Option<String>,
    pub vote_weight: VoteWeight,
    /// Public keys of delegates this account votes for.
    pub votes: Vec<String>,
    pub multimin: u32,
    pub multilifetime: u32,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            public_key: None,
            balance: 0,
            u_balance: 0,
            second_public_key: None,
            is_delegate: false,
            username: None,
            vote_weight: VoteWeight::zero(),
            votes: Vec::new(),
            multimin: 0,
            multilifetime: 0,
        }
    }

    pub fn credit(&mut self, amount: u128) {
        self.balance = self.balance.saturating_add(amount);
        self.u_balance = self.balance;
    }

    pub fn debit(&mut self, amount: u128) -> bool {
        if self.balance >= amount {
            self.balance -= amount;
            self.u_balance = self.balance;
            true
        } else {
            false
        }
    }

    pub fn is_multisig(&self) -> bool {
        self.multimin > 0
    }
}

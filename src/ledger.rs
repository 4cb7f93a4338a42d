//! Transaction Ledger
//!
//! Append-only in-memory record of settlement attempts, plus the spend
//! bookkeeping that policies read. The ledger and the spend counters live
//! in one [`PaymentBook`] so a successful settlement updates both in a
//! single mutation, and the settled-today total in the ledger can never
//! diverge from the spend-state counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::SpendState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Settled,
    Failed,
}

/// One settlement attempt. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Endpoint the payment was for.
    pub endpoint: String,
    /// Amount in the smallest currency unit. For failed attempts this is
    /// the amount that was requested, not spent.
    pub amount: u64,
    /// Settlement network label (e.g. "base").
    pub chain: String,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: Option<String>,
}

/// Read-only spend snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendSummary {
    /// Settled amount for the current UTC day, smallest currency unit.
    pub today: u64,
    /// Total transactions recorded (settled and failed).
    pub transaction_count: usize,
}

impl SpendSummary {
    /// Today's spend in whole currency units (micro-units / 1e6).
    pub fn today_usd(&self) -> f64 {
        self.today as f64 / 1e6
    }
}

/// Ledger and spend counters, mutated together.
#[derive(Debug)]
pub struct PaymentBook {
    transactions: Vec<Transaction>,
    spend: SpendState,
}

impl PaymentBook {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            transactions: Vec::new(),
            spend: SpendState::new(now),
        }
    }

    /// Record a successful settlement: append the transaction and advance
    /// the spend counters in one step.
    pub fn record_settlement(
        &mut self,
        endpoint: String,
        amount: u64,
        chain: String,
        tx_hash: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.transactions.push(Transaction {
            endpoint,
            amount,
            chain,
            status: TxStatus::Settled,
            timestamp: now,
            tx_hash,
        });
        self.spend.record_settlement(amount, now);
    }

    /// Record a failed settlement attempt. Spend counters are untouched.
    pub fn record_failure(
        &mut self,
        endpoint: String,
        amount: u64,
        chain: String,
        now: DateTime<Utc>,
    ) {
        self.transactions.push(Transaction {
            endpoint,
            amount,
            chain,
            status: TxStatus::Failed,
            timestamp: now,
            tx_hash: None,
        });
    }

    pub fn summarize(&self, now: DateTime<Utc>) -> SpendSummary {
        SpendSummary {
            today: self.spend.spent_today(now),
            transaction_count: self.transactions.len(),
        }
    }

    /// Cloned snapshot in insertion order, re-readable any number of times.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }

    pub fn spend_state(&self) -> &SpendState {
        &self.spend
    }
}

//! Credit reservations: the gate in front of every paid job.
//!
//! A job first reserves its price against the actor's available credits
//! (`balance - reserved_total`), then settles the reservation exactly once:
//! success spends the reserved amount, refund releases it, partial settlement
//! spends part and releases the rest. Repeated settlement is a logged no-op.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("unknown reservation: {0}")]
    UnknownReservation(Uuid),
}

/// A hold on part of an actor's balance pending a job outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub actor_id: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Settlement {
    /// Spend the reserved amount.
    Success,
    /// Release the reserved amount untouched.
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub reservation_id: Uuid,
    pub charged: Decimal,
    pub refunded: Decimal,
    pub balance_after: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled(SettlementReceipt),
    /// The reservation was settled before; nothing changed.
    AlreadySettled,
}

/// Snapshot of an actor's credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub actor_id: String,
    pub balance: Decimal,
    pub reserved_total: Decimal,
}

impl CreditAccount {
    /// Credits not held by any in-flight reservation.
    pub fn available(&self) -> Decimal {
        self.balance - self.reserved_total
    }
}

/// The authoritative balance store.
pub trait CreditLedger: Send + Sync {
    fn reserve(
        &self,
        actor_id: &str,
        amount: Decimal,
    ) -> impl Future<Output = Result<Reservation, LedgerError>> + Send;

    fn settle(
        &self,
        reservation: &Reservation,
        settlement: Settlement,
    ) -> impl Future<Output = Result<SettleOutcome, LedgerError>> + Send;

    /// Charge `actual` (≤ the reserved amount) and release the difference.
    fn settle_partial(
        &self,
        reservation: &Reservation,
        actual: Decimal,
    ) -> impl Future<Output = Result<SettleOutcome, LedgerError>> + Send;

    fn account(&self, actor_id: &str) -> impl Future<Output = CreditAccount> + Send;
}

// Settled reservation ids remembered per actor for duplicate detection.
// Older ids settle again as `UnknownReservation`, which still changes nothing;
// a persistent ledger keeps the full history.
const SETTLED_HISTORY: usize = 1024;

#[derive(Debug, Default)]
struct AccountState {
    balance: Decimal,
    reserved_total: Decimal,
    open: HashMap<Uuid, Decimal>,
    settled: HashSet<Uuid>,
    settled_order: VecDeque<Uuid>,
}

impl AccountState {
    fn remember_settled(&mut self, id: Uuid) {
        self.settled.insert(id);
        self.settled_order.push_back(id);
        while self.settled_order.len() > SETTLED_HISTORY {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }
}

/// In-process ledger with one lock per actor.
#[derive(Default)]
pub struct InMemoryLedger {
    accounts: Mutex<HashMap<String, Arc<Mutex<AccountState>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add purchased credits to an actor's balance.
    pub async fn grant(&self, actor_id: &str, amount: Decimal) -> Result<CreditAccount, LedgerError> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let account = self.account_lock(actor_id).await;
        let mut state = account.lock().await;
        state.balance += amount;
        tracing::info!(actor = actor_id, %amount, balance = %state.balance, "Credits granted");
        Ok(snapshot(actor_id, &state))
    }

    async fn account_lock(&self, actor_id: &str) -> Arc<Mutex<AccountState>> {
        let mut accounts = self.accounts.lock().await;
        Arc::clone(accounts.entry(actor_id.to_string()).or_default())
    }

    async fn settle_amount(
        &self,
        reservation: &Reservation,
        charged: Decimal,
    ) -> Result<SettleOutcome, LedgerError> {
        let account = self.account_lock(&reservation.actor_id).await;
        let mut state = account.lock().await;

        if state.settled.contains(&reservation.id) {
            tracing::warn!(
                actor = %reservation.actor_id,
                reservation = %reservation.id,
                "Duplicate settlement ignored"
            );
            return Ok(SettleOutcome::AlreadySettled);
        }
        let Some(amount) = state.open.remove(&reservation.id) else {
            return Err(LedgerError::UnknownReservation(reservation.id));
        };
        if charged < Decimal::ZERO || charged > amount {
            state.open.insert(reservation.id, amount);
            return Err(LedgerError::InvalidAmount(charged));
        }

        state.reserved_total -= amount;
        state.balance -= charged;
        state.remember_settled(reservation.id);

        let receipt = SettlementReceipt {
            reservation_id: reservation.id,
            charged,
            refunded: amount - charged,
            balance_after: state.balance,
        };
        tracing::info!(
            actor = %reservation.actor_id,
            reservation = %reservation.id,
            charged = %receipt.charged,
            refunded = %receipt.refunded,
            balance = %receipt.balance_after,
            "Reservation settled"
        );
        Ok(SettleOutcome::Settled(receipt))
    }
}

fn snapshot(actor_id: &str, state: &AccountState) -> CreditAccount {
    CreditAccount {
        actor_id: actor_id.to_string(),
        balance: state.balance,
        reserved_total: state.reserved_total,
    }
}

impl CreditLedger for InMemoryLedger {
    async fn reserve(&self, actor_id: &str, amount: Decimal) -> Result<Reservation, LedgerError> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let account = self.account_lock(actor_id).await;
        let mut state = account.lock().await;

        let available = state.balance - state.reserved_total;
        if available < amount {
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            actor_id: actor_id.to_string(),
            amount,
            created_at: Utc::now(),
        };
        state.reserved_total += amount;
        state.open.insert(reservation.id, amount);
        tracing::debug!(
            actor = actor_id,
            reservation = %reservation.id,
            %amount,
            reserved_total = %state.reserved_total,
            "Credits reserved"
        );
        Ok(reservation)
    }

    async fn settle(
        &self,
        reservation: &Reservation,
        settlement: Settlement,
    ) -> Result<SettleOutcome, LedgerError> {
        let charged = match settlement {
            Settlement::Success => reservation.amount,
            Settlement::Refund => Decimal::ZERO,
        };
        self.settle_amount(reservation, charged).await
    }

    async fn settle_partial(
        &self,
        reservation: &Reservation,
        actual: Decimal,
    ) -> Result<SettleOutcome, LedgerError> {
        self.settle_amount(reservation, actual).await
    }

    async fn account(&self, actor_id: &str) -> CreditAccount {
        let account = self.account_lock(actor_id).await;
        let state = account.lock().await;
        snapshot(actor_id, &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn funded(amount: Decimal) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger.grant("alice", amount).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn reserve_then_refund_restores_everything() {
        let ledger = funded(dec!(10)).await;
        let r = ledger.reserve("alice", dec!(3)).await.unwrap();
        let acct = ledger.account("alice").await;
        assert_eq!(acct.reserved_total, dec!(3));
        assert_eq!(acct.available(), dec!(7));

        ledger.settle(&r, Settlement::Refund).await.unwrap();
        let acct = ledger.account("alice").await;
        assert_eq!(acct.balance, dec!(10));
        assert_eq!(acct.reserved_total, dec!(0));
    }

    #[tokio::test]
    async fn success_spends_the_reservation() {
        let ledger = funded(dec!(10)).await;
        let r = ledger.reserve("alice", dec!(3)).await.unwrap();
        let outcome = ledger.settle(&r, Settlement::Success).await.unwrap();
        match outcome {
            SettleOutcome::Settled(receipt) => {
                assert_eq!(receipt.charged, dec!(3));
                assert_eq!(receipt.refunded, dec!(0));
                assert_eq!(receipt.balance_after, dec!(7));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let acct = ledger.account("alice").await;
        assert_eq!(acct.balance, dec!(7));
        assert_eq!(acct.reserved_total, dec!(0));
    }

    #[tokio::test]
    async fn insufficient_credits_counts_reservations() {
        let ledger = funded(dec!(5)).await;
        ledger.reserve("alice", dec!(4)).await.unwrap();
        let err = ledger.reserve("alice", dec!(2)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCredits {
                required: dec!(2),
                available: dec!(1),
            }
        );
        // Unknown actors start at zero.
        assert!(ledger.reserve("nobody", dec!(1)).await.is_err());
        assert_eq!(ledger.account("nobody").await.balance, dec!(0));
    }

    #[tokio::test]
    async fn double_settlement_is_a_noop() {
        let ledger = funded(dec!(10)).await;
        let r = ledger.reserve("alice", dec!(3)).await.unwrap();
        ledger.settle(&r, Settlement::Success).await.unwrap();

        assert_eq!(
            ledger.settle(&r, Settlement::Refund).await.unwrap(),
            SettleOutcome::AlreadySettled
        );
        assert_eq!(
            ledger.settle(&r, Settlement::Success).await.unwrap(),
            SettleOutcome::AlreadySettled
        );
        assert_eq!(ledger.account("alice").await.balance, dec!(7));
    }

    #[tokio::test]
    async fn partial_settlement_refunds_difference() {
        let ledger = funded(dec!(10)).await;
        let r = ledger.reserve("alice", dec!(4)).await.unwrap();
        let outcome = ledger.settle_partial(&r, dec!(1.5)).await.unwrap();
        match outcome {
            SettleOutcome::Settled(receipt) => {
                assert_eq!(receipt.charged, dec!(1.5));
                assert_eq!(receipt.refunded, dec!(2.5));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let acct = ledger.account("alice").await;
        assert_eq!(acct.balance, dec!(8.5));
        assert_eq!(acct.reserved_total, dec!(0));
    }

    #[tokio::test]
    async fn partial_settlement_above_reservation_is_rejected() {
        let ledger = funded(dec!(10)).await;
        let r = ledger.reserve("alice", dec!(2)).await.unwrap();
        assert_eq!(
            ledger.settle_partial(&r, dec!(3)).await,
            Err(LedgerError::InvalidAmount(dec!(3)))
        );
        // The reservation is still open and can be settled normally.
        ledger.settle(&r, Settlement::Refund).await.unwrap();
        assert_eq!(ledger.account("alice").await.reserved_total, dec!(0));
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let ledger = funded(dec!(10)).await;
        assert!(matches!(
            ledger.reserve("alice", dec!(-1)).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(ledger.grant("alice", dec!(-5)).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overdraw() {
        let ledger = Arc::new(funded(dec!(10)).await);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.reserve("alice", dec!(1)).await.is_ok()
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(ledger.account("alice").await.available(), dec!(0));
    }

    #[tokio::test]
    async fn settled_history_is_bounded() {
        let ledger = funded(dec!(10)).await;
        let first = ledger.reserve("alice", dec!(0)).await.unwrap();
        ledger.settle(&first, Settlement::Refund).await.unwrap();
        for _ in 0..SETTLED_HISTORY {
            let r = ledger.reserve("alice", dec!(0)).await.unwrap();
            ledger.settle(&r, Settlement::Success).await.unwrap();
        }

        let account = ledger.account_lock("alice").await;
        let state = account.lock().await;
        assert_eq!(state.settled.len(), SETTLED_HISTORY);
        assert!(!state.settled.contains(&first.id));
        drop(state);

        // Forgotten ids are still refused, and nothing moves.
        assert_eq!(
            ledger.settle(&first, Settlement::Success).await.unwrap_err(),
            LedgerError::UnknownReservation(first.id)
        );
        assert_eq!(ledger.account("alice").await.balance, dec!(10));
    }
}

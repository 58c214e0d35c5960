//! Order-Event Reconciler
//!
//! Maps state-transition notifications pushed by the external order engine
//! onto Balance Service operations. Delivery is at-least-once: every mapping
//! is idempotent against redelivery (keyed on the order reference), and
//! events arriving out of order are rejected against the order record rather
//! than applied blindly.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balance::BalanceService;
use crate::customer_account::CustomerId;
use crate::errors::RewardError;

/// Order lifecycle states owned by the external order engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    AddingItems,
    ArrangingPayment,
    PaymentAuthorized,
    PaymentSettled,
    PaymentDeclined,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::AddingItems => "AddingItems",
            OrderState::ArrangingPayment => "ArrangingPayment",
            OrderState::PaymentAuthorized => "PaymentAuthorized",
            OrderState::PaymentSettled => "PaymentSettled",
            OrderState::PaymentDeclined => "PaymentDeclined",
            OrderState::Shipped => "Shipped",
            OrderState::Delivered => "Delivered",
            OrderState::Cancelled => "Cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "AddingItems" => Some(OrderState::AddingItems),
            "ArrangingPayment" => Some(OrderState::ArrangingPayment),
            "PaymentAuthorized" => Some(OrderState::PaymentAuthorized),
            "PaymentSettled" => Some(OrderState::PaymentSettled),
            "PaymentDeclined" => Some(OrderState::PaymentDeclined),
            "Shipped" => Some(OrderState::Shipped),
            "Delivered" => Some(OrderState::Delivered),
            "Cancelled" => Some(OrderState::Cancelled),
            _ => None,
        }
    }
}

/// One pushed notification from the order engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderNotification {
    StateChanged {
        order_ref: String,
        customer_id: CustomerId,
        from_state: OrderState,
        to_state: OrderState,
        order_total_cents: u64,
        timestamp_ms: i64,
    },
    RefundIssued {
        order_ref: String,
        customer_id: CustomerId,
        refund_cents: u64,
        order_total_cents: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Settled { redeemed: u64, earned: u64 },
    Released { points: u64 },
    Reversed { refunded: u64, removed: u64, shortfall: u64 },
    PartialRemoval { removed: u64, shortfall: u64 },
    NoAction,
}

pub struct Reconciler {
    service: Arc<BalanceService>,
}

impl Reconciler {
    pub fn new(service: Arc<BalanceService>) -> Self {
        Self { service }
    }

    /// Apply one notification. Storage errors propagate so the caller can
    /// redeliver; every path below is safe to replay.
    pub fn handle(&self, notification: &OrderNotification) -> Result<ReconcileOutcome, RewardError> {
        match notification {
            OrderNotification::StateChanged {
                order_ref,
                customer_id,
                from_state,
                to_state,
                order_total_cents,
                ..
            } => match to_state {
                OrderState::PaymentSettled => {
                    self.on_settled(order_ref, *customer_id, *order_total_cents)
                }
                OrderState::PaymentDeclined => self.on_release(order_ref, *customer_id),
                OrderState::Cancelled => self.on_cancelled(order_ref, *customer_id, *from_state),
                _ => Ok(ReconcileOutcome::NoAction),
            },
            OrderNotification::RefundIssued {
                order_ref,
                customer_id,
                refund_cents,
                order_total_cents,
            } => self.on_partial_refund(order_ref, *customer_id, *refund_cents, *order_total_cents),
        }
    }

    /// Settlement: commit the redemption (if one is reserved), then award
    /// the earn. Both halves are idempotent per order.
    fn on_settled(
        &self,
        order_ref: &str,
        customer_id: CustomerId,
        order_total_cents: u64,
    ) -> Result<ReconcileOutcome, RewardError> {
        if let Some(rec) = self.service.order_record(order_ref) {
            if rec.phase.is_terminal() {
                return Err(RewardError::OutOfOrderEvent {
                    order_ref: order_ref.to_string(),
                    detail: format!("settlement for order already {}", rec.phase.as_str()),
                });
            }
        }

        let mut redeemed = 0;
        if self.service.reservation_of(order_ref).is_some() {
            match self.service.commit_redeem(customer_id, order_ref) {
                Ok(txn) => redeemed = txn.points.unsigned_abs(),
                // Raced with a release; settlement still proceeds without the
                // discount commitment.
                Err(RewardError::NoReservationFound { .. }) => {
                    log::warn!("Reservation for order {} vanished before commit", order_ref);
                }
                Err(e) => return Err(e),
            }
        } else if let Some(rec) = self.service.order_record(order_ref) {
            // Redelivered settlement: the commit already happened.
            redeemed = rec.points_redeemed;
        }

        let earned = self.service.earn(customer_id, order_total_cents, order_ref)?.points();
        Ok(ReconcileOutcome::Settled { redeemed, earned })
    }

    /// Pre-settlement release path (cancellation before payment, or decline).
    fn on_release(
        &self,
        order_ref: &str,
        customer_id: CustomerId,
    ) -> Result<ReconcileOutcome, RewardError> {
        let held = self.service.reservation_of(order_ref).map(|r| r.points);
        match self.service.release(customer_id, order_ref)? {
            Some(_) => Ok(ReconcileOutcome::Released { points: held.unwrap_or(0) }),
            None => Ok(ReconcileOutcome::NoAction),
        }
    }

    fn on_cancelled(
        &self,
        order_ref: &str,
        customer_id: CustomerId,
        from_state: OrderState,
    ) -> Result<ReconcileOutcome, RewardError> {
        let rec = match self.service.order_record(order_ref) {
            Some(rec) if rec.phase.is_settled() => rec,
            _ => {
                if from_state == OrderState::PaymentSettled {
                    // Redelivery ordering bug: the cancellation overtook the
                    // settlement event. Reject so the engine redelivers in
                    // order.
                    return Err(RewardError::OutOfOrderEvent {
                        order_ref: order_ref.to_string(),
                        detail: "post-settlement cancellation for order never settled here"
                            .to_string(),
                    });
                }
                return self.on_release(order_ref, customer_id);
            }
        };

        // One order can carry both a spend and an earn to reverse; the two
        // halves are independent and individually idempotent.
        let mut refunded = 0;
        if rec.points_redeemed > 0 {
            let txn = self.service.refund(customer_id, order_ref, rec.points_redeemed)?;
            refunded = txn.points.max(0) as u64;
        }
        let mut removed = 0;
        let mut shortfall = 0;
        if rec.points_earned > 0 {
            let outcome = self.service.remove(customer_id, order_ref, rec.points_earned)?;
            removed = outcome.removed;
            shortfall = outcome.shortfall;
        }
        Ok(ReconcileOutcome::Reversed { refunded, removed, shortfall })
    }

    /// Partial refund: proportionally reverse the earn. One proportional
    /// removal per order; redelivery returns the recorded outcome.
    fn on_partial_refund(
        &self,
        order_ref: &str,
        customer_id: CustomerId,
        refund_cents: u64,
        order_total_cents: u64,
    ) -> Result<ReconcileOutcome, RewardError> {
        if order_total_cents == 0 {
            return Err(RewardError::InvalidAmount("order total must be positive".to_string()));
        }
        let rec = match self.service.order_record(order_ref) {
            Some(rec) => rec,
            // Order never touched points
            None => return Ok(ReconcileOutcome::NoAction),
        };
        if !rec.phase.is_settled() {
            return Err(RewardError::OutOfOrderEvent {
                order_ref: order_ref.to_string(),
                detail: "refund issued before settlement".to_string(),
            });
        }
        if rec.points_earned == 0 {
            return Ok(ReconcileOutcome::NoAction);
        }

        let proportional = ((rec.points_earned as u128 * refund_cents as u128)
            / order_total_cents as u128) as u64;
        let proportional = proportional.min(rec.points_earned);
        if proportional == 0 {
            return Ok(ReconcileOutcome::NoAction);
        }

        let outcome = self.service.remove(customer_id, order_ref, proportional)?;
        Ok(ReconcileOutcome::PartialRemoval {
            removed: outcome.removed,
            shortfall: outcome.shortfall,
        })
    }
}

// ==========================================
// Consumer adapter
// ==========================================

const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Channel consumer: the process-internal stand-in for whatever subscription
/// mechanism delivers order events. Retryable failures go back onto a local
/// queue with backoff; exhausted or non-retryable notifications are logged
/// and dropped so the stream keeps moving.
pub fn run_consumer(
    reconciler: Arc<Reconciler>,
    rx: mpsc::Receiver<OrderNotification>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut pending: VecDeque<(OrderNotification, u32)> = VecDeque::new();
        loop {
            let (notification, attempts) = match pending.pop_front() {
                Some(item) => item,
                None => match rx.recv() {
                    Ok(n) => (n, 0),
                    Err(_) => break,
                },
            };

            match reconciler.handle(&notification) {
                Ok(outcome) => log::debug!("Reconciled {:?}: {:?}", notification, outcome),
                Err(e) if e.is_retryable() && attempts + 1 < MAX_DELIVERY_ATTEMPTS => {
                    log::warn!(
                        "Retryable failure (attempt {}): {}",
                        attempts + 1,
                        e
                    );
                    thread::sleep(RETRY_BACKOFF);
                    pending.push_back((notification, attempts + 1));
                }
                Err(e) if e.is_retryable() => {
                    log::error!(
                        "Giving up on {:?} after {} attempts: {}",
                        notification,
                        MAX_DELIVERY_ATTEMPTS,
                        e
                    );
                }
                Err(e) => log::warn!("Dropped notification {:?}: {}", notification, e),
            }
        }
    })
}

//! Order Points State Machine
//!
//! Tracks how one order's point activity progresses from reservation through
//! settlement or reversal.

use serde::{Deserialize, Serialize};

use crate::customer_account::CustomerId;

/// Phase of an order's point bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPhase {
    /// No points activity recorded yet
    Open,
    /// Points held against the order, not yet committed
    Reserved,
    /// Settlement applied: redemption committed and/or earn awarded
    Settled,
    /// Hold dropped before settlement, balance untouched
    Released,
    /// Post-settlement reversal applied (refund and/or removal)
    Reversed,
}

impl OrderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPhase::Open => "open",
            OrderPhase::Reserved => "reserved",
            OrderPhase::Settled => "settled",
            OrderPhase::Released => "released",
            OrderPhase::Reversed => "reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderPhase::Open),
            "reserved" => Some(OrderPhase::Reserved),
            "settled" => Some(OrderPhase::Settled),
            "released" => Some(OrderPhase::Released),
            "reversed" => Some(OrderPhase::Reversed),
            _ => None,
        }
    }

    /// Check if this is a terminal phase (no further point activity expected)
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderPhase::Released | OrderPhase::Reversed)
    }

    /// Check if settlement has been applied to this order
    pub fn is_settled(&self) -> bool {
        matches!(self, OrderPhase::Settled | OrderPhase::Reversed)
    }
}

/// Inputs that move an order's point phase
#[derive(Debug, Clone, Copy)]
pub enum PointsEvent {
    /// Points held at checkout
    Reserve,
    /// Payment settled: commit redemption, award earn
    Settle,
    /// Pre-settlement cancellation or payment decline
    ReleaseHold,
    /// Post-settlement cancellation or refund
    Reverse,
}

/// Phase transition function
///
/// Given the current phase and an event, returns the next phase.
/// Invalid transitions return the current phase (no change).
pub fn transition(current: OrderPhase, event: PointsEvent) -> OrderPhase {
    use OrderPhase::*;
    use PointsEvent::*;

    match (current, event) {
        (Open, Reserve) => Reserved,
        // An order can settle with no reservation (earn only)
        (Open, Settle) => Settled,
        (Open, ReleaseHold) => Released,

        (Reserved, Settle) => Settled,
        (Reserved, ReleaseHold) => Released,

        (Settled, Reverse) => Reversed,
        // Reversal is split into refund + removal; the second half lands here
        (Reversed, Reverse) => Reversed,

        // Invalid transitions - stay in current phase
        _ => current,
    }
}

/// Per-order point bookkeeping owned by this core.
///
/// Created when a customer applies points at checkout or when an order
/// settles, mutated only by the reconciler's ledger commands, immutable once
/// the phase is terminal and the reversal fields are finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPointsRecord {
    pub order_ref: String,
    pub customer_id: CustomerId,
    /// Points currently held, not yet committed
    pub points_reserved: u64,
    pub points_redeemed: u64,
    pub points_earned: u64,
    pub points_released: u64,
    pub points_refunded: u64,
    pub points_removed: u64,
    /// Monetary value of the reservation/redemption in minor units
    pub points_discount_value: u64,
    pub phase: OrderPhase,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OrderPointsRecord {
    pub fn new(order_ref: &str, customer_id: CustomerId, at: i64) -> Self {
        Self {
            order_ref: order_ref.to_string(),
            customer_id,
            points_reserved: 0,
            points_redeemed: 0,
            points_earned: 0,
            points_released: 0,
            points_refunded: 0,
            points_removed: 0,
            points_discount_value: 0,
            phase: OrderPhase::Open,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn advance(&mut self, event: PointsEvent, at: i64) {
        self.phase = transition(self.phase, event);
        self.updated_at = at;
    }
}

//! Balance Service
//!
//! The only writer of the ledger store. Every mutating operation runs under a
//! per-customer lock so concurrent check-then-act sequences against the same
//! available balance cannot interleave; operations for different customers
//! proceed in parallel.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::customer_account::CustomerId;
use crate::errors::RewardError;
use crate::ledger::{LedgerCommand, LedgerStore, Reservation, RewardTransaction, TxnType};
use crate::order_points::{OrderPhase, OrderPointsRecord};
use crate::settings::{RewardSettings, SettingsStore};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub customer_id: CustomerId,
    pub balance: u64,
    pub reserved: u64,
    pub available: u64,
    pub lifetime_earned: u64,
    pub lifetime_redeemed: u64,
}

#[derive(Debug, Clone)]
pub enum EarnOutcome {
    /// Earning is switched off in settings; nothing recorded
    Disabled,
    Credited(RewardTransaction),
    /// Redelivered settlement: the original transaction is returned
    AlreadyCredited(RewardTransaction),
}

impl EarnOutcome {
    pub fn points(&self) -> u64 {
        match self {
            EarnOutcome::Disabled => 0,
            EarnOutcome::Credited(t) | EarnOutcome::AlreadyCredited(t) => t.points.max(0) as u64,
        }
    }
}

/// Result of an earn reversal. `shortfall > 0` means part of the earned
/// points had already been spent or reserved elsewhere and was deliberately
/// left untouched.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RemoveOutcome {
    pub removed: u64,
    pub shortfall: u64,
}

/// Upstream customer data used to join display names onto admin listings.
pub trait CustomerDirectory: Send + Sync {
    fn display_name(&self, customer_id: CustomerId) -> Option<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerBalanceRow {
    pub customer_id: CustomerId,
    pub display_name: Option<String>,
    pub summary: BalanceSummary,
}

pub struct BalanceService {
    store: RwLock<LedgerStore>,
    settings: Arc<SettingsStore>,
    locks: Mutex<FxHashMap<CustomerId, Arc<Mutex<()>>>>,
}

impl BalanceService {
    pub fn new(store: LedgerStore, settings: Arc<SettingsStore>) -> Self {
        Self { store: RwLock::new(store), settings, locks: Mutex::new(FxHashMap::default()) }
    }

    pub fn open(data_dir: &Path, settings: Arc<SettingsStore>) -> Result<Self, RewardError> {
        let store = LedgerStore::open(data_dir)?;
        Ok(Self::new(store, settings))
    }

    pub fn settings(&self) -> Arc<SettingsStore> {
        self.settings.clone()
    }

    pub fn update_settings(&self, settings: RewardSettings) -> Result<(), RewardError> {
        self.settings.update(settings)
    }

    fn customer_lock(&self, customer_id: CustomerId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks.entry(customer_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn txn_by_seq(
        store: &LedgerStore,
        customer_id: CustomerId,
        seq: u64,
    ) -> Result<RewardTransaction, RewardError> {
        store
            .transactions_of(customer_id)
            .iter()
            .find(|t| t.id == seq)
            .cloned()
            .ok_or_else(|| RewardError::Storage(format!("transaction {} missing after apply", seq)))
    }

    // ==========================================
    // Reads
    // ==========================================

    /// Balance summary; untouched customers read as all zeros.
    pub fn balance_of(&self, customer_id: CustomerId) -> BalanceSummary {
        let store = self.store.read().expect("store lock poisoned");
        match store.ledger(customer_id) {
            Some(l) => BalanceSummary {
                customer_id,
                balance: l.balance,
                reserved: l.reserved,
                available: l.available(),
                lifetime_earned: l.lifetime_earned,
                lifetime_redeemed: l.lifetime_redeemed,
            },
            None => BalanceSummary {
                customer_id,
                balance: 0,
                reserved: 0,
                available: 0,
                lifetime_earned: 0,
                lifetime_redeemed: 0,
            },
        }
    }

    pub fn transactions_of(&self, customer_id: CustomerId) -> Vec<RewardTransaction> {
        self.store.read().expect("store lock poisoned").transactions_of(customer_id).to_vec()
    }

    pub fn reservation_of(&self, order_ref: &str) -> Option<Reservation> {
        self.store.read().expect("store lock poisoned").reservation(order_ref).cloned()
    }

    pub fn order_record(&self, order_ref: &str) -> Option<OrderPointsRecord> {
        self.store.read().expect("store lock poisoned").order(order_ref).cloned()
    }

    /// Paginated admin listing, sorted by customer id, joined with display
    /// names from the upstream directory when one is wired in.
    pub fn all_balances(
        &self,
        page: usize,
        per_page: usize,
        directory: Option<&dyn CustomerDirectory>,
    ) -> Vec<CustomerBalanceRow> {
        let per_page = if per_page == 0 { 50 } else { per_page };
        let mut ids: Vec<CustomerId> = {
            let store = self.store.read().expect("store lock poisoned");
            store.accounts().keys().copied().collect()
        };
        ids.sort_unstable();

        ids.into_iter()
            .skip(page * per_page)
            .take(per_page)
            .map(|id| CustomerBalanceRow {
                customer_id: id,
                display_name: directory.and_then(|d| d.display_name(id)),
                summary: self.balance_of(id),
            })
            .collect()
    }

    // ==========================================
    // Ledger operations
    // ==========================================

    /// Credit earned points for a settled order. Idempotent per `order_ref`:
    /// redelivery returns the original transaction.
    pub fn earn(
        &self,
        customer_id: CustomerId,
        order_total_cents: u64,
        order_ref: &str,
    ) -> Result<EarnOutcome, RewardError> {
        let settings = self.settings.current();
        if !settings.enabled {
            return Ok(EarnOutcome::Disabled);
        }

        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        {
            let store = self.store.read().expect("store lock poisoned");
            if let Some(txn) = store.find_transaction(customer_id, order_ref, TxnType::Earned) {
                log::debug!("Duplicate earn for order {} suppressed", order_ref);
                return Ok(EarnOutcome::AlreadyCredited(txn.clone()));
            }
        }

        let points = settings.points_for_total(order_total_cents);
        let cmd = LedgerCommand::Earn {
            customer_id,
            points,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };

        let mut store = self.store.write().expect("store lock poisoned");
        let seq = store.apply(&cmd)?;
        log::info!("Customer {} earned {} points on order {}", customer_id, points, order_ref);
        Ok(EarnOutcome::Credited(Self::txn_by_seq(&store, customer_id, seq)?))
    }

    /// Hold points against an in-flight order. Idempotent when the same
    /// `order_ref` already carries an open reservation.
    pub fn reserve(
        &self,
        customer_id: CustomerId,
        points: u64,
        order_ref: &str,
    ) -> Result<(), RewardError> {
        if points == 0 {
            return Err(RewardError::InvalidAmount("reservation must be positive".to_string()));
        }
        let settings = self.settings.current();

        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        let available = {
            let store = self.store.read().expect("store lock poisoned");
            if let Some(res) = store.reservation(order_ref) {
                if res.points != points {
                    log::warn!(
                        "Re-reserve for order {} with {} points, {} already held",
                        order_ref,
                        points,
                        res.points
                    );
                }
                return Ok(());
            }
            if let Some(rec) = store.order(order_ref) {
                if rec.phase != OrderPhase::Open {
                    return Err(RewardError::OutOfOrderEvent {
                        order_ref: order_ref.to_string(),
                        detail: format!("reserve for order already {}", rec.phase.as_str()),
                    });
                }
            }
            store.ledger(customer_id).map(|l| l.available()).unwrap_or(0)
        };

        if settings.max_redeem_per_order > 0 && points > settings.max_redeem_per_order {
            return Err(RewardError::RedemptionOverCap {
                points,
                cap: settings.max_redeem_per_order,
            });
        }
        let value_cents = settings.value_of_points(points);
        if value_cents < settings.min_redeem_value {
            return Err(RewardError::RedemptionBelowMinimum {
                value_cents,
                min_cents: settings.min_redeem_value,
            });
        }
        if points > available {
            return Err(RewardError::InsufficientAvailable { available, requested: points });
        }

        let cmd = LedgerCommand::Reserve {
            customer_id,
            points,
            value_cents,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        store.apply(&cmd)?;
        log::info!(
            "Customer {} reserved {} points (value {}) on order {}",
            customer_id,
            points,
            value_cents,
            order_ref
        );
        Ok(())
    }

    /// Convert the reservation for `order_ref` into a committed redemption.
    pub fn commit_redeem(
        &self,
        customer_id: CustomerId,
        order_ref: &str,
    ) -> Result<RewardTransaction, RewardError> {
        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        let points = {
            let store = self.store.read().expect("store lock poisoned");
            match store.reservation(order_ref) {
                Some(res) if res.customer_id == customer_id => res.points,
                Some(res) => {
                    log::warn!(
                        "Reservation for order {} belongs to customer {}, not {}",
                        order_ref,
                        res.customer_id,
                        customer_id
                    );
                    return Err(RewardError::NoReservationFound {
                        order_ref: order_ref.to_string(),
                    });
                }
                None => {
                    return Err(RewardError::NoReservationFound {
                        order_ref: order_ref.to_string(),
                    })
                }
            }
        };

        let cmd = LedgerCommand::CommitRedeem {
            customer_id,
            points,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        let seq = store.apply(&cmd)?;
        log::info!("Customer {} redeemed {} points on order {}", customer_id, points, order_ref);
        Self::txn_by_seq(&store, customer_id, seq)
    }

    /// Drop an uncommitted reservation; the balance is untouched.
    /// Idempotent: releasing an already released or committed reservation is
    /// a no-op returning `None`.
    pub fn release(
        &self,
        customer_id: CustomerId,
        order_ref: &str,
    ) -> Result<Option<RewardTransaction>, RewardError> {
        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        let points = {
            let store = self.store.read().expect("store lock poisoned");
            match store.reservation(order_ref) {
                Some(res) if res.customer_id == customer_id => res.points,
                _ => {
                    log::debug!("Release for order {} without open reservation", order_ref);
                    return Ok(None);
                }
            }
        };

        let cmd = LedgerCommand::Release {
            customer_id,
            points,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        let seq = store.apply(&cmd)?;
        log::info!("Released {} held points on order {}", points, order_ref);
        Ok(Some(Self::txn_by_seq(&store, customer_id, seq)?))
    }

    /// Sweep entry point: drop a stale reservation, recording an EXPIRED row.
    pub fn expire_reservation(
        &self,
        order_ref: &str,
    ) -> Result<Option<RewardTransaction>, RewardError> {
        let (customer_id, points) = {
            let store = self.store.read().expect("store lock poisoned");
            match store.reservation(order_ref) {
                Some(res) => (res.customer_id, res.points),
                None => return Ok(None),
            }
        };

        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        // The reservation may have been committed or released while we were
        // acquiring the lock.
        {
            let store = self.store.read().expect("store lock poisoned");
            if store.reservation(order_ref).is_none() {
                return Ok(None);
            }
        }

        let cmd = LedgerCommand::Expire {
            customer_id,
            points,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        let seq = store.apply(&cmd)?;
        log::warn!(
            "Expired stale reservation of {} points on order {} for customer {}",
            points,
            order_ref,
            customer_id
        );
        Ok(Some(Self::txn_by_seq(&store, customer_id, seq)?))
    }

    /// Restore previously redeemed points after a post-settlement
    /// cancellation. Idempotent per `order_ref`.
    pub fn refund(
        &self,
        customer_id: CustomerId,
        order_ref: &str,
        points: u64,
    ) -> Result<RewardTransaction, RewardError> {
        if points == 0 {
            return Err(RewardError::InvalidAmount("refund must be positive".to_string()));
        }

        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        {
            let store = self.store.read().expect("store lock poisoned");
            if let Some(txn) = store.find_transaction(customer_id, order_ref, TxnType::Refunded) {
                log::debug!("Duplicate refund for order {} suppressed", order_ref);
                return Ok(txn.clone());
            }
        }

        let cmd = LedgerCommand::Refund {
            customer_id,
            points,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        let seq = store.apply(&cmd)?;
        log::info!("Refunded {} points to customer {} for order {}", points, customer_id, order_ref);
        Self::txn_by_seq(&store, customer_id, seq)
    }

    /// Reverse previously earned points after a cancellation or refund.
    ///
    /// Removes at most the customer's currently available points: points the
    /// customer has since reserved against other open orders are deliberately
    /// left alone, and the shortfall is reported instead of silently ignored.
    /// Idempotent per `order_ref`.
    pub fn remove(
        &self,
        customer_id: CustomerId,
        order_ref: &str,
        points_earned: u64,
    ) -> Result<RemoveOutcome, RewardError> {
        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        let available = {
            let store = self.store.read().expect("store lock poisoned");
            if let Some(txn) = store.find_transaction(customer_id, order_ref, TxnType::Removed) {
                log::debug!("Duplicate removal for order {} suppressed", order_ref);
                return Ok(RemoveOutcome { removed: txn.points.unsigned_abs(), shortfall: 0 });
            }
            store.ledger(customer_id).map(|l| l.available()).unwrap_or(0)
        };

        let removed = points_earned.min(available);
        let shortfall = points_earned - removed;
        if shortfall > 0 {
            log::warn!(
                "Removing only {} of {} earned points for order {} (customer {} has {} available)",
                removed,
                points_earned,
                order_ref,
                customer_id,
                available
            );
        }

        let cmd = LedgerCommand::Remove {
            customer_id,
            points: removed,
            requested: points_earned,
            order_ref: order_ref.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        store.apply(&cmd)?;
        Ok(RemoveOutcome { removed, shortfall })
    }

    /// Manual admin credit or debit.
    pub fn adjust(
        &self,
        customer_id: CustomerId,
        points: i64,
        description: &str,
    ) -> Result<RewardTransaction, RewardError> {
        if points == 0 {
            return Err(RewardError::InvalidAmount("adjustment must be non-zero".to_string()));
        }

        let lock = self.customer_lock(customer_id);
        let _guard = lock.lock().expect("customer lock poisoned");

        if points < 0 {
            let available = {
                let store = self.store.read().expect("store lock poisoned");
                store.ledger(customer_id).map(|l| l.available()).unwrap_or(0)
            };
            if points.unsigned_abs() > available {
                return Err(RewardError::InsufficientAvailable {
                    available,
                    requested: points.unsigned_abs(),
                });
            }
        }

        let cmd = LedgerCommand::Adjust {
            customer_id,
            points,
            description: description.to_string(),
            at: now_ms(),
        };
        let mut store = self.store.write().expect("store lock poisoned");
        let seq = store.apply(&cmd)?;
        log::info!("Adjusted customer {} by {} points: {}", customer_id, points, description);
        Self::txn_by_seq(&store, customer_id, seq)
    }

    // ==========================================
    // Sweep support
    // ==========================================

    /// Open reservations older than `ttl_ms`.
    pub fn stale_reservations(&self, ttl_ms: i64) -> Vec<(String, CustomerId)> {
        let cutoff = now_ms() - ttl_ms;
        let store = self.store.read().expect("store lock poisoned");
        store
            .open_reservations()
            .filter(|(_, res)| res.created_at < cutoff)
            .map(|(order_ref, res)| (order_ref.clone(), res.customer_id))
            .collect()
    }

    /// Reservations still open although their order record is terminal.
    /// These indicate a reconciliation bug and are surfaced, not repaired.
    pub fn orphaned_reservations(&self) -> Vec<String> {
        let store = self.store.read().expect("store lock poisoned");
        store
            .open_reservations()
            .filter(|(order_ref, _)| {
                store.order(order_ref).map(|rec| rec.phase.is_terminal()).unwrap_or(false)
            })
            .map(|(order_ref, _)| order_ref.clone())
            .collect()
    }
}

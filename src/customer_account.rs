use serde::{Deserialize, Serialize};

pub type CustomerId = u64;

/// Per-customer point counters.
///
/// `balance` is the total credited points; `reserved` is the slice of
/// `balance` held against in-flight orders. The amount a customer may newly
/// reserve is `available() = balance - reserved`, and `reserved <= balance`
/// holds after every mutation. Lifetime counters only ever grow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CustomerLedger {
    pub customer_id: CustomerId,
    pub balance: u64,
    pub reserved: u64,
    pub lifetime_earned: u64,
    pub lifetime_redeemed: u64,
    pub version: u64,
}

impl CustomerLedger {
    pub fn new(customer_id: CustomerId) -> Self {
        Self { customer_id, ..Default::default() }
    }

    #[inline]
    pub fn available(&self) -> u64 {
        self.balance - self.reserved
    }

    /// Credit newly earned points.
    pub fn credit_earned(&mut self, points: u64) -> Result<(), &'static str> {
        self.balance = self.balance.checked_add(points).ok_or("Balance overflow")?;
        self.lifetime_earned =
            self.lifetime_earned.checked_add(points).ok_or("Lifetime earned overflow")?;
        self.version += 1;
        Ok(())
    }

    /// Credit points restored by a post-settlement refund.
    pub fn credit_refund(&mut self, points: u64) -> Result<(), &'static str> {
        self.balance = self.balance.checked_add(points).ok_or("Balance overflow")?;
        self.version += 1;
        Ok(())
    }

    /// Admin credit. Does not count toward lifetime earn totals.
    pub fn credit_adjust(&mut self, points: u64) -> Result<(), &'static str> {
        self.balance = self.balance.checked_add(points).ok_or("Balance overflow")?;
        self.version += 1;
        Ok(())
    }

    /// Hold points against an in-flight order.
    pub fn hold(&mut self, points: u64) -> Result<(), &'static str> {
        if self.available() < points {
            return Err("Insufficient available points");
        }
        self.reserved += points;
        self.version += 1;
        Ok(())
    }

    /// Drop a hold without touching the balance.
    pub fn release_hold(&mut self, points: u64) -> Result<(), &'static str> {
        if self.reserved < points {
            return Err("Insufficient reserved points");
        }
        self.reserved -= points;
        self.version += 1;
        Ok(())
    }

    /// Commit a hold: the held points leave the balance for good.
    pub fn spend_held(&mut self, points: u64) -> Result<(), &'static str> {
        if self.reserved < points {
            return Err("Insufficient reserved points");
        }
        self.reserved -= points;
        self.balance -= points;
        self.lifetime_redeemed =
            self.lifetime_redeemed.checked_add(points).ok_or("Lifetime redeemed overflow")?;
        self.version += 1;
        Ok(())
    }

    /// Debit unreserved points (earn reversal, negative adjustment).
    pub fn debit_available(&mut self, points: u64) -> Result<(), &'static str> {
        if self.available() < points {
            return Err("Insufficient available points");
        }
        self.balance -= points;
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_and_spend() {
        let mut ledger = CustomerLedger::new(1);
        ledger.credit_earned(1000).unwrap();
        assert_eq!(ledger.available(), 1000);

        ledger.hold(400).unwrap();
        assert_eq!(ledger.balance, 1000);
        assert_eq!(ledger.reserved, 400);
        assert_eq!(ledger.available(), 600);

        ledger.spend_held(400).unwrap();
        assert_eq!(ledger.balance, 600);
        assert_eq!(ledger.reserved, 0);
        assert_eq!(ledger.lifetime_redeemed, 400);
    }

    #[test]
    fn test_hold_rejects_more_than_available() {
        let mut ledger = CustomerLedger::new(1);
        ledger.credit_earned(100).unwrap();
        ledger.hold(80).unwrap();
        assert!(ledger.hold(30).is_err());
        assert_eq!(ledger.reserved, 80);
    }

    #[test]
    fn test_debit_respects_reserved() {
        let mut ledger = CustomerLedger::new(1);
        ledger.credit_earned(100).unwrap();
        ledger.hold(60).unwrap();
        // Only 40 points are unreserved.
        assert!(ledger.debit_available(50).is_err());
        ledger.debit_available(40).unwrap();
        assert_eq!(ledger.balance, 60);
        assert_eq!(ledger.reserved, 60);
        assert_eq!(ledger.available(), 0);
    }

    #[test]
    fn test_overflow_protection() {
        let mut ledger = CustomerLedger::new(1);
        ledger.credit_adjust(u64::MAX - 10).unwrap();
        assert!(ledger.credit_adjust(20).is_err());
        assert_eq!(ledger.balance, u64::MAX - 10);
    }

    #[test]
    fn test_version_bumps_on_every_mutation() {
        let mut ledger = CustomerLedger::new(1);
        ledger.credit_earned(10).unwrap();
        ledger.hold(5).unwrap();
        ledger.release_hold(5).unwrap();
        assert_eq!(ledger.version, 3);
    }
}

use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const SETTINGS_KEY: &[u8] = b"reward_settings";

/// Program-wide reward configuration.
///
/// Created with defaults on first boot and mutated only through
/// [`SettingsStore::update`]. Rates are decimals; every multiplication is
/// floored so fractional points never exist and the rounding direction is
/// fixed in the platform's favor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardSettings {
    pub enabled: bool,
    /// Points credited per major currency unit of settled order total
    pub earn_rate: Decimal,
    /// Major currency value of one point
    pub redeem_rate: Decimal,
    /// Minimum discount value (minor units) a reservation must carry; 0 = none
    pub min_redeem_value: u64,
    /// Maximum points redeemable on one order; 0 = no cap
    pub max_redeem_per_order: u64,
}

impl Default for RewardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            earn_rate: Decimal::ONE,
            redeem_rate: Decimal::new(1, 2), // 0.01 = one cent per point
            min_redeem_value: 0,
            max_redeem_per_order: 0,
        }
    }
}

impl RewardSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.earn_rate.is_sign_negative() {
            return Err(format!("earn_rate must not be negative: {}", self.earn_rate));
        }
        if self.redeem_rate <= Decimal::ZERO {
            return Err(format!("redeem_rate must be positive: {}", self.redeem_rate));
        }
        Ok(())
    }

    /// Points earned for a settled order total, `floor(total * earn_rate)`.
    pub fn points_for_total(&self, order_total_cents: u64) -> u64 {
        let major = Decimal::from(order_total_cents) / Decimal::from(100);
        (major * self.earn_rate).floor().to_u64().unwrap_or(0)
    }

    /// Discount value of a point quantity in minor units,
    /// `floor(points * redeem_rate * 100)`.
    pub fn value_of_points(&self, points: u64) -> u64 {
        (Decimal::from(points) * self.redeem_rate * Decimal::from(100))
            .floor()
            .to_u64()
            .unwrap_or(0)
    }
}

/// Figures shown next to the settings form in the admin UI. Computed with the
/// same floor arithmetic as the live earn/redeem path so the display cannot
/// drift from what the ledger will do.
#[derive(Debug, Clone, Serialize)]
pub struct ExampleCalculation {
    pub order_total_cents: u64,
    pub points_earned: u64,
    pub redeem_value_cents: u64,
}

pub fn example_calculation(settings: &RewardSettings, order_total_cents: u64) -> ExampleCalculation {
    let points_earned = settings.points_for_total(order_total_cents);
    ExampleCalculation {
        order_total_cents,
        points_earned,
        redeem_value_cents: settings.value_of_points(points_earned),
    }
}

/// Durable singleton holding the current [`RewardSettings`].
///
/// Backed by a single sled key; reads go to an in-process cache, updates
/// validate, persist and then swap the cache.
pub struct SettingsStore {
    db: sled::Db,
    cached: RwLock<RewardSettings>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).context("open settings db")?;
        let settings = match db.get(SETTINGS_KEY)? {
            Some(raw) => bincode::deserialize(&raw).context("decode stored settings")?,
            None => {
                let defaults = RewardSettings::default();
                db.insert(SETTINGS_KEY, bincode::serialize(&defaults)?)?;
                db.flush()?;
                defaults
            }
        };
        Ok(Self { db, cached: RwLock::new(settings) })
    }

    pub fn current(&self) -> RewardSettings {
        self.cached.read().expect("settings lock poisoned").clone()
    }

    pub fn update(&self, settings: RewardSettings) -> Result<(), crate::errors::RewardError> {
        settings.validate().map_err(crate::errors::RewardError::Config)?;
        let raw = bincode::serialize(&settings)
            .map_err(|e| crate::errors::RewardError::Storage(e.to_string()))?;
        self.db
            .insert(SETTINGS_KEY, raw)
            .and_then(|_| self.db.flush().map(|_| ()))
            .map_err(|e| crate::errors::RewardError::Storage(e.to_string()))?;
        *self.cached.write().expect("settings lock poisoned") = settings;
        Ok(())
    }
}

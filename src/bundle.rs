//! Bundle Pricing/Stock Evaluator
//!
//! Read-mostly: invoked synchronously by checkout and catalog queries.
//! Component stock comes from the external inventory system through the
//! [`StockProvider`] seam.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::errors::RewardError;

pub type BundleId = u64;
pub type VariantId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleStatus {
    Draft,
    Active,
    Broken,
    Archived,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Draft => "DRAFT",
            BundleStatus::Active => "ACTIVE",
            BundleStatus::Broken => "BROKEN",
            BundleStatus::Archived => "ARCHIVED",
        }
    }
}

/// Exactly one discount shape per bundle; the fixed/percent exclusivity of
/// the data model is carried by the enum itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BundleDiscount {
    /// The bundle sells at this price, in minor units
    Fixed(u64),
    /// Percentage off the component sum, in (0, 100]
    PercentOff(Decimal),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleItem {
    pub variant_id: VariantId,
    pub quantity: u32,
    /// Component price snapshot taken when the bundle was assembled
    pub unit_price_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub name: String,
    pub status: BundleStatus,
    pub discount: BundleDiscount,
    /// Increments on every publish
    pub version: u32,
    /// Optional marketing cap on sellable bundles
    pub bundle_cap: Option<u32>,
    /// Bundles held by unsettled orders, counted against the cap
    pub reserved_open: u32,
    pub items: Vec<BundleItem>,
}

/// Read-only view of component stock, per variant. `None` means the variant
/// is unknown to the inventory system.
pub trait StockProvider {
    fn stock_of(&self, variant_id: VariantId) -> Option<u64>;
}

impl StockProvider for FxHashMap<VariantId, u64> {
    fn stock_of(&self, variant_id: VariantId) -> Option<u64> {
        self.get(&variant_id).copied()
    }
}

impl Bundle {
    pub fn component_total_cents(&self) -> u64 {
        self.items.iter().map(|i| i.unit_price_cents * i.quantity as u64).sum()
    }

    /// Effective bundle price in minor units.
    ///
    /// Percent discounts round half-up to the minor unit, e.g. components
    /// worth 95.00 at 25% off price at 71.25.
    pub fn compute_price(&self) -> Result<u64, RewardError> {
        self.validate()?;
        match &self.discount {
            BundleDiscount::Fixed(cents) => Ok(*cents),
            BundleDiscount::PercentOff(percent) => {
                let total = Decimal::from(self.component_total_cents());
                let factor = (Decimal::from(100) - percent) / Decimal::from(100);
                let price = (total * factor)
                    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
                price.to_u64().ok_or_else(|| {
                    RewardError::Config(format!("bundle {} price out of range", self.id))
                })
            }
        }
    }

    /// Virtual availability: the sellable bundle quantity.
    ///
    /// `min` over components of `floor(stock / quantity)`, further capped by
    /// `bundle_cap - reserved_open` when a cap is set. A missing or exhausted
    /// component yields 0, never a negative count.
    pub fn compute_availability(&self, stock: &(impl StockProvider + ?Sized)) -> u64 {
        let component_limit = self
            .items
            .iter()
            .map(|item| {
                let on_hand = stock.stock_of(item.variant_id).unwrap_or(0);
                if item.quantity == 0 {
                    0
                } else {
                    on_hand / item.quantity as u64
                }
            })
            .min()
            .unwrap_or(0);

        match self.bundle_cap {
            Some(cap) => {
                let cap_left = cap.saturating_sub(self.reserved_open) as u64;
                component_limit.min(cap_left)
            }
            None => component_limit,
        }
    }

    /// Enforce the discount invariants from the data model.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.items.is_empty() {
            return Err(RewardError::Config(format!("bundle {} has no components", self.id)));
        }
        if self.items.iter().any(|i| i.quantity == 0) {
            return Err(RewardError::Config(format!(
                "bundle {} has a zero-quantity component",
                self.id
            )));
        }
        match &self.discount {
            BundleDiscount::Fixed(cents) => {
                if *cents == 0 {
                    return Err(RewardError::Config(format!(
                        "bundle {} fixed price must be positive",
                        self.id
                    )));
                }
            }
            BundleDiscount::PercentOff(percent) => {
                if *percent <= Decimal::ZERO || *percent > Decimal::from(100) {
                    return Err(RewardError::Config(format!(
                        "bundle {} percent_off {} outside (0, 100]",
                        self.id, percent
                    )));
                }
            }
        }
        Ok(())
    }

    /// Publish: validate, move DRAFT -> ACTIVE and bump the version.
    pub fn publish(&mut self) -> Result<(), RewardError> {
        if self.status != BundleStatus::Draft {
            return Err(RewardError::Config(format!(
                "bundle {} cannot be published from {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.validate()?;
        self.status = BundleStatus::Active;
        self.version += 1;
        Ok(())
    }

    fn references(&self, variant_id: VariantId) -> bool {
        self.items.iter().any(|i| i.variant_id == variant_id)
    }
}

/// In-memory bundle catalog with the referential-integrity guard.
#[derive(Default)]
pub struct BundleCatalog {
    bundles: FxHashMap<BundleId, Bundle>,
}

impl BundleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bundle after validation.
    pub fn save(&mut self, bundle: Bundle) -> Result<(), RewardError> {
        bundle.validate()?;
        self.bundles.insert(bundle.id, bundle);
        Ok(())
    }

    pub fn get(&self, id: BundleId) -> Option<&Bundle> {
        self.bundles.get(&id)
    }

    pub fn publish(&mut self, id: BundleId) -> Result<(), RewardError> {
        let bundle = self
            .bundles
            .get_mut(&id)
            .ok_or_else(|| RewardError::Config(format!("unknown bundle {}", id)))?;
        bundle.publish()
    }

    pub fn archive(&mut self, id: BundleId) -> Result<(), RewardError> {
        let bundle = self
            .bundles
            .get_mut(&id)
            .ok_or_else(|| RewardError::Config(format!("unknown bundle {}", id)))?;
        bundle.status = BundleStatus::Archived;
        Ok(())
    }

    /// A component variant may only be deleted upstream when no DRAFT or
    /// ACTIVE bundle still references it.
    pub fn guard_variant_delete(&self, variant_id: VariantId) -> Result<(), RewardError> {
        let holders: Vec<BundleId> = self
            .bundles
            .values()
            .filter(|b| {
                matches!(b.status, BundleStatus::Draft | BundleStatus::Active)
                    && b.references(variant_id)
            })
            .map(|b| b.id)
            .collect();
        if holders.is_empty() {
            Ok(())
        } else {
            Err(RewardError::Config(format!(
                "variant {} is referenced by bundles {:?}",
                variant_id, holders
            )))
        }
    }

    pub fn availability(&self, id: BundleId, stock: &(impl StockProvider + ?Sized)) -> Option<u64> {
        self.bundles.get(&id).map(|b| b.compute_availability(stock))
    }

    /// Sweep support: an ACTIVE bundle whose component is unknown to the
    /// inventory system can no longer be sold and is marked BROKEN.
    pub fn mark_broken(&mut self, stock: &(impl StockProvider + ?Sized)) -> Vec<BundleId> {
        let mut broken = Vec::new();
        for bundle in self.bundles.values_mut() {
            if bundle.status == BundleStatus::Active
                && bundle.items.iter().any(|i| stock.stock_of(i.variant_id).is_none())
            {
                bundle.status = BundleStatus::Broken;
                broken.push(bundle.id);
            }
        }
        for id in &broken {
            log::warn!("Bundle {} marked BROKEN: component variant missing upstream", id);
        }
        broken
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }
}

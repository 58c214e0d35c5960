use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use reward_ledger::bundle::{Bundle, BundleCatalog, BundleDiscount, BundleItem, BundleStatus};
use reward_ledger::errors::RewardError;

fn item(variant_id: u64, quantity: u32, unit_price_cents: u64) -> BundleItem {
    BundleItem { variant_id, quantity, unit_price_cents }
}

fn bundle(id: u64, discount: BundleDiscount, items: Vec<BundleItem>) -> Bundle {
    Bundle {
        id,
        name: format!("bundle-{}", id),
        status: BundleStatus::Draft,
        discount,
        version: 0,
        bundle_cap: None,
        reserved_open: 0,
        items,
    }
}

fn stock(levels: &[(u64, u64)]) -> FxHashMap<u64, u64> {
    levels.iter().copied().collect()
}

#[test]
fn test_availability_is_min_over_components() {
    let b = bundle(
        1,
        BundleDiscount::Fixed(1_000),
        vec![item(10, 1, 500), item(11, 1, 300), item(12, 2, 200)],
    );
    let stock = stock(&[(10, 10), (11, 3), (12, 20)]);

    // min(10/1, 3/1, 20/2) = 3
    assert_eq!(b.compute_availability(&stock), 3);
}

#[test]
fn test_availability_zero_when_component_missing_or_empty() {
    let b = bundle(1, BundleDiscount::Fixed(1_000), vec![item(10, 1, 500), item(11, 1, 300)]);

    assert_eq!(b.compute_availability(&stock(&[(10, 5), (11, 0)])), 0);
    // Variant 11 unknown to the inventory system
    assert_eq!(b.compute_availability(&stock(&[(10, 5)])), 0);
}

#[test]
fn test_availability_respects_marketing_cap() {
    let mut b = bundle(1, BundleDiscount::Fixed(1_000), vec![item(10, 1, 500)]);
    b.bundle_cap = Some(5);
    b.reserved_open = 2;
    let stock = stock(&[(10, 100)]);

    assert_eq!(b.compute_availability(&stock), 3);

    // Cap exhausted by open orders: clamps to zero, never negative.
    b.reserved_open = 9;
    assert_eq!(b.compute_availability(&stock), 0);
}

#[test]
fn test_availability_monotonicity() {
    let mut b = bundle(1, BundleDiscount::Fixed(1_000), vec![item(10, 2, 500)]);
    b.bundle_cap = Some(50);

    let mut last = u64::MAX;
    for reserved_open in 0..10u32 {
        b.reserved_open = reserved_open;
        let avail = b.compute_availability(&stock(&[(10, 40)]));
        assert!(avail <= last, "availability must not grow with reserved_open");
        last = avail;
    }

    let mut last = 0;
    b.reserved_open = 0;
    for on_hand in 0..20u64 {
        let avail = b.compute_availability(&stock(&[(10, on_hand)]));
        assert!(avail >= last, "availability must not shrink with more stock");
        last = avail;
    }
}

#[test]
fn test_percent_price() {
    let b = bundle(
        1,
        BundleDiscount::PercentOff(Decimal::from(25)),
        vec![item(10, 1, 4_000), item(11, 1, 3_000), item(12, 1, 2_500)],
    );
    // 95.00 * 0.75 = 71.25
    assert_eq!(b.compute_price().unwrap(), 7_125);
}

#[test]
fn test_percent_price_rounds_half_up() {
    let b = bundle(1, BundleDiscount::PercentOff(Decimal::from(25)), vec![item(10, 1, 150)]);
    // 150 * 0.75 = 112.5 -> 113
    assert_eq!(b.compute_price().unwrap(), 113);
}

#[test]
fn test_fixed_price() {
    let b = bundle(1, BundleDiscount::Fixed(9_999), vec![item(10, 1, 4_000), item(11, 2, 3_000)]);
    assert_eq!(b.compute_price().unwrap(), 9_999);
    assert_eq!(b.component_total_cents(), 10_000);
}

#[test]
fn test_validate_discount_bounds() {
    let b = bundle(1, BundleDiscount::PercentOff(Decimal::ZERO), vec![item(10, 1, 100)]);
    assert!(matches!(b.validate(), Err(RewardError::Config(_))));

    let b = bundle(1, BundleDiscount::PercentOff(Decimal::from(101)), vec![item(10, 1, 100)]);
    assert!(matches!(b.validate(), Err(RewardError::Config(_))));

    let b = bundle(1, BundleDiscount::PercentOff(Decimal::from(100)), vec![item(10, 1, 100)]);
    assert!(b.validate().is_ok());
    assert_eq!(b.compute_price().unwrap(), 0);

    let b = bundle(1, BundleDiscount::Fixed(0), vec![item(10, 1, 100)]);
    assert!(matches!(b.validate(), Err(RewardError::Config(_))));

    let b = bundle(1, BundleDiscount::Fixed(100), vec![]);
    assert!(matches!(b.validate(), Err(RewardError::Config(_))));
}

#[test]
fn test_publish_transitions_and_versions() {
    let mut b = bundle(1, BundleDiscount::Fixed(1_000), vec![item(10, 1, 500)]);
    assert_eq!(b.version, 0);

    b.publish().unwrap();
    assert_eq!(b.status, BundleStatus::Active);
    assert_eq!(b.version, 1);

    // Publishing an already active bundle is rejected.
    assert!(matches!(b.publish(), Err(RewardError::Config(_))));
}

#[test]
fn test_variant_delete_guard() {
    let mut catalog = BundleCatalog::new();

    let mut active = bundle(1, BundleDiscount::Fixed(1_000), vec![item(10, 1, 500)]);
    active.publish().unwrap();
    catalog.save(active).unwrap();

    let draft = bundle(2, BundleDiscount::Fixed(2_000), vec![item(11, 1, 900)]);
    catalog.save(draft).unwrap();

    let mut archived = bundle(3, BundleDiscount::Fixed(500), vec![item(12, 1, 400)]);
    archived.status = BundleStatus::Archived;
    catalog.save(archived).unwrap();

    // Referenced by ACTIVE and DRAFT bundles: deletion rejected.
    assert!(matches!(catalog.guard_variant_delete(10), Err(RewardError::Config(_))));
    assert!(matches!(catalog.guard_variant_delete(11), Err(RewardError::Config(_))));
    // Only an ARCHIVED bundle references this one: deletion allowed.
    assert!(catalog.guard_variant_delete(12).is_ok());
    assert!(catalog.guard_variant_delete(99).is_ok());
}

#[test]
fn test_mark_broken_on_missing_component() {
    let mut catalog = BundleCatalog::new();
    let mut b = bundle(1, BundleDiscount::Fixed(1_000), vec![item(10, 1, 500), item(11, 1, 300)]);
    b.publish().unwrap();
    catalog.save(b).unwrap();

    // Variant 11 vanished upstream.
    let inventory = stock(&[(10, 5)]);
    let broken = catalog.mark_broken(&inventory);
    assert_eq!(broken, vec![1]);
    assert_eq!(catalog.get(1).unwrap().status, BundleStatus::Broken);

    // Second sweep finds nothing new.
    assert!(catalog.mark_broken(&inventory).is_empty());
}

#[test]
fn test_catalog_availability_lookup() {
    let mut catalog = BundleCatalog::new();
    let b = bundle(5, BundleDiscount::Fixed(1_000), vec![item(10, 2, 500)]);
    catalog.save(b).unwrap();

    let inventory = stock(&[(10, 9)]);
    assert_eq!(catalog.availability(5, &inventory), Some(4));
    assert_eq!(catalog.availability(99, &inventory), None);
}

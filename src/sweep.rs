//! Periodic consistency sweep
//!
//! Expires stale reservations, surfaces orphaned ones, and keeps bundle
//! availability honest. Abandoned orders that never reach a terminal state
//! would otherwise lock points in `reserved` forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::balance::BalanceService;
use crate::bundle::{BundleCatalog, StockProvider};

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Reservations older than this are expired; zero disables expiry
    pub reservation_ttl: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub expired: u32,
    pub orphaned: u32,
    pub broken: u32,
}

pub fn run_once(
    service: &BalanceService,
    catalog: Option<&Mutex<BundleCatalog>>,
    stock: Option<&(dyn StockProvider + Send + Sync)>,
    reservation_ttl: Duration,
) -> SweepStats {
    let mut stats = SweepStats::default();

    if reservation_ttl > Duration::ZERO {
        for (order_ref, customer_id) in service.stale_reservations(reservation_ttl.as_millis() as i64)
        {
            match service.expire_reservation(&order_ref) {
                Ok(Some(_)) => stats.expired += 1,
                Ok(None) => {}
                Err(e) => log::error!(
                    "Failed to expire reservation on order {} (customer {}): {}",
                    order_ref,
                    customer_id,
                    e
                ),
            }
        }
    }

    let orphans = service.orphaned_reservations();
    stats.orphaned = orphans.len() as u32;
    for order_ref in &orphans {
        log::warn!("Orphaned reservation on terminal order {}", order_ref);
    }

    if let (Some(catalog), Some(stock)) = (catalog, stock) {
        let mut catalog = catalog.lock().expect("catalog lock poisoned");
        stats.broken = catalog.mark_broken(stock).len() as u32;
        for bundle in catalog.iter() {
            log::debug!(
                "Bundle {} availability {}",
                bundle.id,
                bundle.compute_availability(stock)
            );
        }
    }

    stats
}

pub struct Sweeper {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(
        service: Arc<BalanceService>,
        catalog: Option<Arc<Mutex<BundleCatalog>>>,
        stock: Option<Arc<dyn StockProvider + Send + Sync>>,
        config: SweepConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            let tick = Duration::from_millis(250);
            loop {
                let mut waited = Duration::ZERO;
                while waited < config.interval {
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(tick);
                    waited += tick;
                }

                let stats = run_once(
                    &service,
                    catalog.as_deref(),
                    stock.as_deref(),
                    config.reservation_ttl,
                );
                log::info!(
                    "Sweep done: {} expired, {} orphaned, {} broken",
                    stats.expired,
                    stats.orphaned,
                    stats.broken
                );
            }
        });

        Self { stop, handle }
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use reward_ledger::balance::BalanceService;
use reward_ledger::settings::{RewardSettings, SettingsStore};

/// A Balance Service on fresh temp directories. The dirs must outlive the
/// service, so they ride along.
pub struct TestEnv {
    pub service: Arc<BalanceService>,
    pub ledger_dir: TempDir,
    pub settings_dir: TempDir,
}

pub fn service_with_defaults() -> TestEnv {
    service_with_settings(RewardSettings::default())
}

pub fn service_with_settings(settings: RewardSettings) -> TestEnv {
    let ledger_dir = TempDir::new().unwrap();
    let settings_dir = TempDir::new().unwrap();

    let settings_store = Arc::new(SettingsStore::open(settings_dir.path()).unwrap());
    settings_store.update(settings).unwrap();

    let service =
        Arc::new(BalanceService::open(ledger_dir.path(), settings_store).unwrap());
    TestEnv { service, ledger_dir, settings_dir }
}

/// Tear down the service and reopen the same directories, simulating a
/// restart. The caller must not hold other clones of the service Arc, since
/// sled keeps a file lock until the last one drops.
pub fn reopen(env: TestEnv) -> TestEnv {
    let TestEnv { service, ledger_dir, settings_dir } = env;
    drop(service);
    let settings_store = Arc::new(SettingsStore::open(settings_dir.path()).unwrap());
    let service =
        Arc::new(BalanceService::open(ledger_dir.path(), settings_store).unwrap());
    TestEnv { service, ledger_dir, settings_dir }
}

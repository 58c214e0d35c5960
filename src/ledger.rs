use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use crc32fast::Hasher;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::customer_account::{CustomerId, CustomerLedger};
use crate::order_points::{OrderPointsRecord, PointsEvent};

const MAX_RECORD_SIZE: usize = 1024 * 1024;
const READ_BUFFER_SIZE: usize = 256 * 1024;

const JOURNAL_FILE: &str = "ledger.journal";

// ==========================================
// 1. Transactions
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnType {
    Earned,
    Redeemed,
    Adjusted,
    Expired,
    Released,
    Refunded,
    Removed,
}

impl TxnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnType::Earned => "EARNED",
            TxnType::Redeemed => "REDEEMED",
            TxnType::Adjusted => "ADJUSTED",
            TxnType::Expired => "EXPIRED",
            TxnType::Released => "RELEASED",
            TxnType::Refunded => "REFUNDED",
            TxnType::Removed => "REMOVED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "EARNED" => Some(TxnType::Earned),
            "REDEEMED" => Some(TxnType::Redeemed),
            "ADJUSTED" => Some(TxnType::Adjusted),
            "EXPIRED" => Some(TxnType::Expired),
            "RELEASED" => Some(TxnType::Released),
            "REFUNDED" => Some(TxnType::Refunded),
            "REMOVED" => Some(TxnType::Removed),
            _ => None,
        }
    }
}

/// One row of the append-only transaction history.
///
/// `points` is signed: positive credits the balance, negative debits it.
/// The signed sum of a customer's transactions equals their balance.
/// RELEASED and EXPIRED rows carry zero points since dropping a hold moves
/// no balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardTransaction {
    pub id: u64,
    pub customer_id: CustomerId,
    pub txn_type: TxnType,
    pub points: i64,
    pub description: String,
    pub order_ref: Option<String>,
    pub created_at: i64,
}

/// An open hold on points, keyed by order reference.
///
/// Not a ledger event: reservations move `reserved`, never `balance`, and
/// produce a transaction row only when committed, released or expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub customer_id: CustomerId,
    pub points: u64,
    pub value_cents: u64,
    pub created_at: i64,
}

// ==========================================
// 2. Ledger Commands
// ==========================================

/// LedgerCommand is the unit of durability: one command per journal record,
/// carrying resolved amounts so replay is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerCommand {
    /// Credit earned points on order settlement
    Earn { customer_id: CustomerId, points: u64, order_ref: String, at: i64 },
    /// Hold points against an in-flight order
    Reserve { customer_id: CustomerId, points: u64, value_cents: u64, order_ref: String, at: i64 },
    /// Convert a hold into a committed redemption
    CommitRedeem { customer_id: CustomerId, points: u64, order_ref: String, at: i64 },
    /// Drop an uncommitted hold (cancellation or payment decline)
    Release { customer_id: CustomerId, points: u64, order_ref: String, at: i64 },
    /// Drop a stale hold found by the consistency sweep
    Expire { customer_id: CustomerId, points: u64, order_ref: String, at: i64 },
    /// Restore redeemed points after a post-settlement cancellation
    Refund { customer_id: CustomerId, points: u64, order_ref: String, at: i64 },
    /// Reverse earned points; `points` is what was actually removed,
    /// `requested` what the cancellation asked for
    Remove { customer_id: CustomerId, points: u64, requested: u64, order_ref: String, at: i64 },
    /// Manual admin credit/debit
    Adjust { customer_id: CustomerId, points: i64, description: String, at: i64 },
}

impl LedgerCommand {
    pub fn customer_id(&self) -> CustomerId {
        match self {
            LedgerCommand::Earn { customer_id, .. }
            | LedgerCommand::Reserve { customer_id, .. }
            | LedgerCommand::CommitRedeem { customer_id, .. }
            | LedgerCommand::Release { customer_id, .. }
            | LedgerCommand::Expire { customer_id, .. }
            | LedgerCommand::Refund { customer_id, .. }
            | LedgerCommand::Remove { customer_id, .. }
            | LedgerCommand::Adjust { customer_id, .. } => *customer_id,
        }
    }
}

// ==========================================
// 3. Journal (append-only, CRC-framed)
// ==========================================

/// Append-only journal: each record is Len(4) | CRC(4) | Seq(8) | Payload.
/// Len covers Seq + Payload; the CRC covers Len, Seq and Payload.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: BufWriter::new(file), path: path.to_path_buf() })
    }

    pub fn append(&mut self, seq: u64, cmd: &LedgerCommand) -> Result<()> {
        let cmd_bytes = bincode::serialize(cmd)?;
        let data_len = 8 + cmd_bytes.len();
        if data_len > MAX_RECORD_SIZE {
            bail!("Record too large: {} bytes", data_len);
        }

        let len_bytes = (data_len as u32).to_le_bytes();
        let seq_bytes = seq.to_le_bytes();

        let mut hasher = Hasher::new();
        hasher.update(&len_bytes);
        hasher.update(&seq_bytes);
        hasher.update(&cmd_bytes);
        let crc_bytes = hasher.finalize().to_le_bytes();

        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&crc_bytes)?;
        self.writer.write_all(&seq_bytes)?;
        self.writer.write_all(&cmd_bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Streaming journal reader used for startup replay.
pub struct JournalIterator {
    reader: BufReader<File>,
    path: PathBuf,
}

impl JournalIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        Ok(Self { reader, path: path.to_path_buf() })
    }
}

impl Iterator for JournalIterator {
    type Item = Result<(u64, LedgerCommand)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        }

        let payload_len = u32::from_le_bytes(len_buf) as usize;
        if payload_len > MAX_RECORD_SIZE {
            return Some(Err(anyhow::anyhow!("Record too large in {:?}", self.path)));
        }
        if payload_len < 8 {
            return Some(Err(anyhow::anyhow!("Record too short in {:?}", self.path)));
        }

        let mut crc_buf = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut crc_buf) {
            return Some(Err(e.into()));
        }
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut data_buf = vec![0u8; payload_len];
        if let Err(e) = self.reader.read_exact(&mut data_buf) {
            return Some(Err(e.into()));
        }

        let mut hasher = Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data_buf);
        if hasher.finalize() != stored_crc {
            return Some(Err(anyhow::anyhow!("CRC mismatch in {:?}", self.path)));
        }

        let (seq_bytes, cmd_bytes) = data_buf.split_at(8);
        let seq = u64::from_le_bytes(seq_bytes.try_into().unwrap_or([0; 8]));
        let cmd = match bincode::deserialize(cmd_bytes) {
            Ok(c) => c,
            Err(e) => return Some(Err(e.into())),
        };

        Some(Ok((seq, cmd)))
    }
}

// ==========================================
// 4. Ledger Store
// ==========================================

/// Durable state image of every customer ledger, transaction history, open
/// reservation and order record.
///
/// All mutation goes through [`LedgerStore::apply`]: the command is appended
/// and fsynced to the journal first, then folded into the in-memory maps.
/// Startup replays the journal from sequence 1 and rejects gaps and CRC
/// mismatches. Callers validate preconditions before applying, so a live
/// `apply` only fails on storage problems.
pub struct LedgerStore {
    accounts: FxHashMap<CustomerId, CustomerLedger>,
    transactions: FxHashMap<CustomerId, Vec<RewardTransaction>>,
    reservations: FxHashMap<String, Reservation>,
    orders: FxHashMap<String, OrderPointsRecord>,
    journal: Option<Journal>,
    pub last_seq: u64,
}

impl LedgerStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let journal_path = dir.join(JOURNAL_FILE);

        let mut store = Self {
            accounts: FxHashMap::default(),
            transactions: FxHashMap::default(),
            reservations: FxHashMap::default(),
            orders: FxHashMap::default(),
            journal: None,
            last_seq: 0,
        };

        if journal_path.exists() {
            log::info!("Replaying journal {:?}", journal_path);
            let mut count = 0u64;
            for res in JournalIterator::new(&journal_path)? {
                let (seq, cmd) = res?;
                if seq != store.last_seq + 1 {
                    bail!("Journal gap: expected {}, found {}", store.last_seq + 1, seq);
                }
                store.apply_state(seq, &cmd)?;
                store.last_seq = seq;
                count += 1;
            }
            log::info!("Replay done: {} commands, last seq {}", count, store.last_seq);
        }

        store.journal = Some(Journal::open(&journal_path)?);
        Ok(store)
    }

    /// Append a command to the journal and fold it into memory.
    /// Returns the sequence number assigned to the command.
    ///
    /// The command is first validated against a scratch copy of the affected
    /// account, so a rejected command never reaches the journal and a journaled
    /// command cannot fail to apply.
    pub fn apply(&mut self, cmd: &LedgerCommand) -> Result<u64> {
        self.check_state(cmd)?;
        let seq = self.last_seq + 1;
        if let Some(journal) = &mut self.journal {
            journal.append(seq, cmd)?;
            journal.flush()?;
        }
        self.apply_state(seq, cmd)?;
        self.last_seq = seq;
        Ok(seq)
    }

    /// Dry-run a command against a copy of the affected account.
    fn check_state(&self, cmd: &LedgerCommand) -> Result<()> {
        let mut acct = self
            .accounts
            .get(&cmd.customer_id())
            .copied()
            .unwrap_or_else(|| CustomerLedger::new(cmd.customer_id()));

        let result = match cmd {
            LedgerCommand::Earn { points, .. } => acct.credit_earned(*points),
            LedgerCommand::Reserve { points, order_ref, .. } => {
                if self.reservations.contains_key(order_ref) {
                    bail!("Reservation already open for order {}", order_ref);
                }
                acct.hold(*points)
            }
            LedgerCommand::CommitRedeem { points, order_ref, .. } => {
                if !self.reservations.contains_key(order_ref) {
                    bail!("No reservation for order {}", order_ref);
                }
                acct.spend_held(*points)
            }
            LedgerCommand::Release { points, order_ref, .. }
            | LedgerCommand::Expire { points, order_ref, .. } => {
                if !self.reservations.contains_key(order_ref) {
                    bail!("No reservation for order {}", order_ref);
                }
                acct.release_hold(*points)
            }
            LedgerCommand::Refund { points, .. } => acct.credit_refund(*points),
            LedgerCommand::Remove { points, .. } => acct.debit_available(*points),
            LedgerCommand::Adjust { points, .. } => {
                if *points >= 0 {
                    acct.credit_adjust(*points as u64)
                } else {
                    acct.debit_available(points.unsigned_abs())
                }
            }
        };
        result.map_err(|e| {
            anyhow::anyhow!("Command rejected for customer {}: {}", cmd.customer_id(), e)
        })
    }

    fn apply_state(&mut self, seq: u64, cmd: &LedgerCommand) -> Result<()> {
        match cmd {
            LedgerCommand::Earn { customer_id, points, order_ref, at } => {
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                acct.credit_earned(*points).map_err(|e| {
                    anyhow::anyhow!("Earn failed for customer {}: {}", customer_id, e)
                })?;
                self.push_txn(RewardTransaction {
                    id: seq,
                    customer_id: *customer_id,
                    txn_type: TxnType::Earned,
                    points: *points as i64,
                    description: format!("Points earned for order {}", order_ref),
                    order_ref: Some(order_ref.clone()),
                    created_at: *at,
                });
                let rec = Self::order_mut(&mut self.orders, order_ref, *customer_id, *at);
                rec.points_earned = *points;
                rec.advance(PointsEvent::Settle, *at);
            }
            LedgerCommand::Reserve { customer_id, points, value_cents, order_ref, at } => {
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                acct.hold(*points).map_err(|e| {
                    anyhow::anyhow!("Reserve failed for customer {}: {}", customer_id, e)
                })?;
                self.reservations.insert(
                    order_ref.clone(),
                    Reservation {
                        customer_id: *customer_id,
                        points: *points,
                        value_cents: *value_cents,
                        created_at: *at,
                    },
                );
                let rec = Self::order_mut(&mut self.orders, order_ref, *customer_id, *at);
                rec.points_reserved = *points;
                rec.points_discount_value = *value_cents;
                rec.advance(PointsEvent::Reserve, *at);
            }
            LedgerCommand::CommitRedeem { customer_id, points, order_ref, at } => {
                if self.reservations.remove(order_ref).is_none() {
                    bail!("CommitRedeem without reservation for order {}", order_ref);
                }
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                acct.spend_held(*points).map_err(|e| {
                    anyhow::anyhow!("CommitRedeem failed for customer {}: {}", customer_id, e)
                })?;
                self.push_txn(RewardTransaction {
                    id: seq,
                    customer_id: *customer_id,
                    txn_type: TxnType::Redeemed,
                    points: -(*points as i64),
                    description: format!("Points redeemed on order {}", order_ref),
                    order_ref: Some(order_ref.clone()),
                    created_at: *at,
                });
                let rec = Self::order_mut(&mut self.orders, order_ref, *customer_id, *at);
                rec.points_redeemed = *points;
                rec.points_reserved = 0;
                rec.advance(PointsEvent::Settle, *at);
            }
            LedgerCommand::Release { customer_id, points, order_ref, at }
            | LedgerCommand::Expire { customer_id, points, order_ref, at } => {
                if self.reservations.remove(order_ref).is_none() {
                    bail!("Release without reservation for order {}", order_ref);
                }
                let expired = matches!(cmd, LedgerCommand::Expire { .. });
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                acct.release_hold(*points).map_err(|e| {
                    anyhow::anyhow!("Release failed for customer {}: {}", customer_id, e)
                })?;
                self.push_txn(RewardTransaction {
                    id: seq,
                    customer_id: *customer_id,
                    txn_type: if expired { TxnType::Expired } else { TxnType::Released },
                    points: 0,
                    description: if expired {
                        format!("Expired stale hold of {} points on order {}", points, order_ref)
                    } else {
                        format!("Released hold of {} points on order {}", points, order_ref)
                    },
                    order_ref: Some(order_ref.clone()),
                    created_at: *at,
                });
                let rec = Self::order_mut(&mut self.orders, order_ref, *customer_id, *at);
                rec.points_released = *points;
                rec.points_reserved = 0;
                rec.advance(PointsEvent::ReleaseHold, *at);
            }
            LedgerCommand::Refund { customer_id, points, order_ref, at } => {
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                acct.credit_refund(*points).map_err(|e| {
                    anyhow::anyhow!("Refund failed for customer {}: {}", customer_id, e)
                })?;
                self.push_txn(RewardTransaction {
                    id: seq,
                    customer_id: *customer_id,
                    txn_type: TxnType::Refunded,
                    points: *points as i64,
                    description: format!("Refunded redeemed points for order {}", order_ref),
                    order_ref: Some(order_ref.clone()),
                    created_at: *at,
                });
                let rec = Self::order_mut(&mut self.orders, order_ref, *customer_id, *at);
                rec.points_refunded = *points;
                rec.advance(PointsEvent::Reverse, *at);
            }
            LedgerCommand::Remove { customer_id, points, requested, order_ref, at } => {
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                acct.debit_available(*points).map_err(|e| {
                    anyhow::anyhow!("Remove failed for customer {}: {}", customer_id, e)
                })?;
                let description = if points < requested {
                    format!(
                        "Removed {} of {} earned points for order {} (shortfall {})",
                        points,
                        requested,
                        order_ref,
                        requested - points
                    )
                } else {
                    format!("Removed earned points for order {}", order_ref)
                };
                self.push_txn(RewardTransaction {
                    id: seq,
                    customer_id: *customer_id,
                    txn_type: TxnType::Removed,
                    points: -(*points as i64),
                    description,
                    order_ref: Some(order_ref.clone()),
                    created_at: *at,
                });
                let rec = Self::order_mut(&mut self.orders, order_ref, *customer_id, *at);
                rec.points_removed = *points;
                rec.advance(PointsEvent::Reverse, *at);
            }
            LedgerCommand::Adjust { customer_id, points, description, at } => {
                let acct = Self::account_mut(&mut self.accounts, *customer_id);
                if *points >= 0 {
                    acct.credit_adjust(*points as u64).map_err(|e| {
                        anyhow::anyhow!("Adjust failed for customer {}: {}", customer_id, e)
                    })?;
                } else {
                    acct.debit_available(points.unsigned_abs()).map_err(|e| {
                        anyhow::anyhow!("Adjust failed for customer {}: {}", customer_id, e)
                    })?;
                }
                self.push_txn(RewardTransaction {
                    id: seq,
                    customer_id: *customer_id,
                    txn_type: TxnType::Adjusted,
                    points: *points,
                    description: description.clone(),
                    order_ref: None,
                    created_at: *at,
                });
            }
        }
        Ok(())
    }

    fn account_mut(
        accounts: &mut FxHashMap<CustomerId, CustomerLedger>,
        customer_id: CustomerId,
    ) -> &mut CustomerLedger {
        accounts.entry(customer_id).or_insert_with(|| CustomerLedger::new(customer_id))
    }

    fn order_mut<'a>(
        orders: &'a mut FxHashMap<String, OrderPointsRecord>,
        order_ref: &str,
        customer_id: CustomerId,
        at: i64,
    ) -> &'a mut OrderPointsRecord {
        orders
            .entry(order_ref.to_string())
            .or_insert_with(|| OrderPointsRecord::new(order_ref, customer_id, at))
    }

    fn push_txn(&mut self, txn: RewardTransaction) {
        self.transactions.entry(txn.customer_id).or_default().push(txn);
    }

    // ==========================================
    // Queries
    // ==========================================

    pub fn ledger(&self, customer_id: CustomerId) -> Option<&CustomerLedger> {
        self.accounts.get(&customer_id)
    }

    pub fn transactions_of(&self, customer_id: CustomerId) -> &[RewardTransaction] {
        self.transactions.get(&customer_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn find_transaction(
        &self,
        customer_id: CustomerId,
        order_ref: &str,
        txn_type: TxnType,
    ) -> Option<&RewardTransaction> {
        self.transactions
            .get(&customer_id)?
            .iter()
            .find(|t| t.txn_type == txn_type && t.order_ref.as_deref() == Some(order_ref))
    }

    pub fn reservation(&self, order_ref: &str) -> Option<&Reservation> {
        self.reservations.get(order_ref)
    }

    pub fn open_reservations(&self) -> impl Iterator<Item = (&String, &Reservation)> {
        self.reservations.iter()
    }

    pub fn order(&self, order_ref: &str) -> Option<&OrderPointsRecord> {
        self.orders.get(order_ref)
    }

    pub fn accounts(&self) -> &FxHashMap<CustomerId, CustomerLedger> {
        &self.accounts
    }
}

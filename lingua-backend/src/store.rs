//! Persistent state: user accounts and the append-only transaction ledger.
//!
//! Both stores follow the same shape: an in-memory backend for tests and a
//! sled-backed persistent backend selected via environment configuration.
//! Values are stored as JSON.

use std::{
    collections::{BTreeSet, HashMap},
    env, fs,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use lingua_common::Level;
use serde::{Deserialize, Serialize};
use sled::Db;
use uuid::Uuid;

const ACCOUNTS_DB_ENV: &str = "LINGUA_ACCOUNTS_DB";
const DEFAULT_ACCOUNTS_DB_PATH: &str = "data/accounts.db";
const LEDGER_DB_ENV: &str = "LINGUA_LEDGER_DB";
const DEFAULT_LEDGER_DB_PATH: &str = "data/ledger.db";

const TREE_TRANSACTIONS: &str = "transactions";
const TREE_DEDUP: &str = "dedup";

/// Seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// A user profile as the payment pipeline sees it.
///
/// `credit_balance` and `owned_levels` are mutated only by reconciliation;
/// `streak_count` is written by engagement logic elsewhere and read here as
/// a pricing input. An owned level is never removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub credit_balance: i64,
    pub streak_count: u32,
    pub owned_levels: BTreeSet<Level>,
    pub created_at: u64,
    pub last_active_at: u64,
}

impl UserAccount {
    pub fn new(id: impl Into<String>) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            credit_balance: 0,
            streak_count: 0,
            owned_levels: BTreeSet::new(),
            created_at: now,
            last_active_at: now,
        }
    }
}

/// One reconciled payment. The `description` doubles as the idempotency key
/// for the (user, gateway payment) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: String,
    pub description: String,
    pub amount_charged: i64,
    pub tokens_redeemed: i64,
    pub created_at: u64,
}

fn open_db(path_ref: &Path, what: &str) -> Db {
    if let Some(parent) = path_ref.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).unwrap_or_else(|err| {
                panic!(
                    "failed to create directory for {} db at {}: {}",
                    what,
                    path_ref.display(),
                    err
                )
            });
        }
    }
    sled::open(path_ref).unwrap_or_else(|err| {
        panic!("failed to open {} db at {}: {}", what, path_ref.display(), err)
    })
}

#[derive(Clone)]
pub struct AccountStore {
    backend: Arc<AccountBackend>,
}

enum AccountBackend {
    InMemory(Mutex<HashMap<String, UserAccount>>),
    Persistent(Db),
}

impl AccountStore {
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(AccountBackend::InMemory(Mutex::new(HashMap::new()))),
        }
    }

    pub fn persistent(path: impl AsRef<Path>) -> Self {
        let db = open_db(path.as_ref(), "accounts");
        Self {
            backend: Arc::new(AccountBackend::Persistent(db)),
        }
    }

    pub fn from_env() -> Self {
        let path =
            env::var(ACCOUNTS_DB_ENV).unwrap_or_else(|_| DEFAULT_ACCOUNTS_DB_PATH.to_string());
        Self::persistent(path)
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserAccount>, String> {
        match &*self.backend {
            AccountBackend::InMemory(store) => Ok(store
                .lock()
                .expect("account store poisoned")
                .get(user_id)
                .cloned()),
            AccountBackend::Persistent(db) => {
                let value = db
                    .get(user_id.as_bytes())
                    .map_err(|err| format!("accounts db get error: {err}"))?;
                match value {
                    Some(bytes) => serde_json::from_slice(&bytes)
                        .map(Some)
                        .map_err(|err| format!("accounts db decode error: {err}")),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn upsert(&self, account: UserAccount) -> Result<(), String> {
        match &*self.backend {
            AccountBackend::InMemory(store) => {
                store
                    .lock()
                    .expect("account store poisoned")
                    .insert(account.id.clone(), account);
                Ok(())
            }
            AccountBackend::Persistent(db) => {
                let value = serde_json::to_vec(&account)
                    .map_err(|err| format!("accounts db encode error: {err}"))?;
                db.insert(account.id.as_bytes(), value)
                    .map_err(|err| format!("accounts db insert error: {err}"))?;
                Ok(())
            }
        }
    }

    pub fn all(&self) -> Result<Vec<UserAccount>, String> {
        match &*self.backend {
            AccountBackend::InMemory(store) => Ok(store
                .lock()
                .expect("account store poisoned")
                .values()
                .cloned()
                .collect()),
            AccountBackend::Persistent(db) => {
                let mut out = Vec::new();
                for item in db.iter() {
                    let (_, value) =
                        item.map_err(|err| format!("accounts db iter error: {err}"))?;
                    let account = serde_json::from_slice(&value)
                        .map_err(|err| format!("accounts db decode error: {err}"))?;
                    out.push(account);
                }
                Ok(out)
            }
        }
    }
}

/// Outcome of attempting to claim a payment in the ledger.
pub enum ClaimOutcome {
    /// The row was appended; this reconciliation owns the payment.
    Recorded,
    /// Another reconciliation already claimed this payment.
    Duplicate(Transaction),
}

#[derive(Clone)]
pub struct TransactionLedger {
    backend: Arc<LedgerBackend>,
}

enum LedgerBackend {
    InMemory(Mutex<LedgerInner>),
    Persistent(Db),
}

#[derive(Default)]
struct LedgerInner {
    rows: HashMap<Uuid, Transaction>,
    dedup: HashMap<(String, String), Uuid>,
}

fn dedup_key(user_id: &str, description: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 1 + description.len());
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key.extend_from_slice(description.as_bytes());
    key
}

impl TransactionLedger {
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(LedgerBackend::InMemory(Mutex::new(LedgerInner::default()))),
        }
    }

    pub fn persistent(path: impl AsRef<Path>) -> Self {
        let db = open_db(path.as_ref(), "ledger");
        Self {
            backend: Arc::new(LedgerBackend::Persistent(db)),
        }
    }

    pub fn from_env() -> Self {
        let path = env::var(LEDGER_DB_ENV).unwrap_or_else(|_| DEFAULT_LEDGER_DB_PATH.to_string());
        Self::persistent(path)
    }

    /// Look up a prior reconciliation of this (user, description) pair.
    pub fn find_reconciled(
        &self,
        user_id: &str,
        description: &str,
    ) -> Result<Option<Transaction>, String> {
        match &*self.backend {
            LedgerBackend::InMemory(store) => {
                let inner = store.lock().expect("ledger poisoned");
                Ok(inner
                    .dedup
                    .get(&(user_id.to_string(), description.to_string()))
                    .and_then(|id| inner.rows.get(id))
                    .cloned())
            }
            LedgerBackend::Persistent(db) => {
                let dedup = db
                    .open_tree(TREE_DEDUP)
                    .map_err(|err| format!("ledger db open_tree error: {err}"))?;
                let Some(id_bytes) = dedup
                    .get(dedup_key(user_id, description))
                    .map_err(|err| format!("ledger db get error: {err}"))?
                else {
                    return Ok(None);
                };
                self.load_row(db, &id_bytes).map(Some)
            }
        }
    }

    /// Append a row, claiming the dedup key if it is still free.
    ///
    /// The claim is an insert-if-absent on (user_id, description); losing the
    /// race yields `Duplicate` with the winning row, never an error. This is
    /// what makes firing both reconciliation entry points safe.
    pub fn claim(&self, row: Transaction) -> Result<ClaimOutcome, String> {
        match &*self.backend {
            LedgerBackend::InMemory(store) => {
                let mut inner = store.lock().expect("ledger poisoned");
                let key = (row.user_id.clone(), row.description.clone());
                if let Some(existing_id) = inner.dedup.get(&key) {
                    let existing = inner
                        .rows
                        .get(existing_id)
                        .cloned()
                        .ok_or_else(|| "dedup entry without ledger row".to_string())?;
                    return Ok(ClaimOutcome::Duplicate(existing));
                }
                inner.dedup.insert(key, row.id);
                inner.rows.insert(row.id, row);
                Ok(ClaimOutcome::Recorded)
            }
            LedgerBackend::Persistent(db) => {
                let rows = db
                    .open_tree(TREE_TRANSACTIONS)
                    .map_err(|err| format!("ledger db open_tree error: {err}"))?;
                let dedup = db
                    .open_tree(TREE_DEDUP)
                    .map_err(|err| format!("ledger db open_tree error: {err}"))?;

                let id_bytes = row.id.as_bytes().to_vec();
                let value = serde_json::to_vec(&row)
                    .map_err(|err| format!("ledger db encode error: {err}"))?;
                rows.insert(id_bytes.as_slice(), value)
                    .map_err(|err| format!("ledger db insert error: {err}"))?;

                let key = dedup_key(&row.user_id, &row.description);
                let swap = dedup
                    .compare_and_swap(key, None::<&[u8]>, Some(id_bytes.as_slice()))
                    .map_err(|err| format!("ledger db cas error: {err}"))?;
                match swap {
                    Ok(()) => Ok(ClaimOutcome::Recorded),
                    Err(prior) => {
                        // Lost the race: drop our row and report the winner.
                        rows.remove(id_bytes.as_slice())
                            .map_err(|err| format!("ledger db remove error: {err}"))?;
                        let winner_id = prior
                            .current
                            .ok_or_else(|| "dedup cas lost without current value".to_string())?;
                        self.load_row(db, &winner_id).map(ClaimOutcome::Duplicate)
                    }
                }
            }
        }
    }

    pub fn all(&self) -> Result<Vec<Transaction>, String> {
        match &*self.backend {
            LedgerBackend::InMemory(store) => Ok(store
                .lock()
                .expect("ledger poisoned")
                .rows
                .values()
                .cloned()
                .collect()),
            LedgerBackend::Persistent(db) => {
                let rows = db
                    .open_tree(TREE_TRANSACTIONS)
                    .map_err(|err| format!("ledger db open_tree error: {err}"))?;
                let mut out = Vec::new();
                for item in rows.iter() {
                    let (_, value) = item.map_err(|err| format!("ledger db iter error: {err}"))?;
                    let row = serde_json::from_slice(&value)
                        .map_err(|err| format!("ledger db decode error: {err}"))?;
                    out.push(row);
                }
                Ok(out)
            }
        }
    }

    fn load_row(&self, db: &Db, id_bytes: &[u8]) -> Result<Transaction, String> {
        let rows = db
            .open_tree(TREE_TRANSACTIONS)
            .map_err(|err| format!("ledger db open_tree error: {err}"))?;
        let value = rows
            .get(id_bytes)
            .map_err(|err| format!("ledger db get error: {err}"))?
            .ok_or_else(|| "dedup entry without ledger row".to_string())?;
        serde_json::from_slice(&value).map_err(|err| format!("ledger db decode error: {err}"))
    }
}

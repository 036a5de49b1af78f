//! Dropbox/transaction persistence (spec §3.1, §3.2, C8/C9), grounded in the
//! `rusqlite`-backed wrapper shape of [`crate::store::Store`] and the exact
//! column set of `original_source/src/python/fsmonitor/sql/orm.py`'s
//! `SQLPackage`/`SQLPackageTransaction`/`SQLTransactionFile`. Kept as a
//! separate connection from the C3 `Store`, mirroring the original's split
//! between `zfs/sql/orm.py` and `fsmonitor/sql/orm.py`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::TransactionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlPackage {
    pub id: i64,
    pub host: String,
    pub root_path: String,
    pub package_path: String,
    pub managed_at: DateTime<Utc>,
    pub unmanaged_at: Option<DateTime<Utc>>,
    pub stable_since: DateTime<Utc>,
    pub comment: Option<String>,
}

impl SqlPackage {
    pub fn is_managed(&self) -> bool {
        self.unmanaged_at.is_none()
    }
}

/// Approval marker used in `approved_by_login` (spec §3.2): empty string is
/// "pending approval"; `REJECTED` is a terminal rejection.
pub const TO_BE_APPROVED_MARKER: &str = "";
pub const REJECTED_MARKER: &str = "REJECTED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Queued,
    PendingApproval,
    Rejected,
    Canceled,
    Failed,
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub host: String,
    pub type_name: String,
    pub in_package_id: Option<i64>,
    pub in_package_stable_since: DateTime<Utc>,
    pub out_package_id: Option<i64>,
    /// `None` = no approval needed; `Some("")` = pending; `Some("REJECTED")`
    /// = rejected; otherwise the approving login (spec §3.2).
    pub approved_by_login: Option<String>,
    pub percent_done: Option<f64>,
    pub spooled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub comment: Option<String>,
    pub reason: Option<String>,
}

impl Transaction {
    /// Derives lifecycle state from the persisted fields (spec §3.2).
    pub fn state(&self) -> TransactionState {
        if self.approved_by_login.as_deref() == Some(REJECTED_MARKER) {
            return TransactionState::Rejected;
        }
        if self.started_at.is_none() && self.finished_at.is_some() {
            return TransactionState::Canceled;
        }
        if self.finished_at.is_some() && self.started_at.is_some() && self.error.is_some() {
            return TransactionState::Failed;
        }
        if self.finished_at.is_some() && self.started_at.is_some() {
            return TransactionState::Finished;
        }
        if self.approved_by_login.as_deref() == Some(TO_BE_APPROVED_MARKER) {
            return TransactionState::PendingApproval;
        }
        if self.finished_at.is_none() && self.percent_done.is_some() {
            if self.started_at.is_some() {
                return TransactionState::Running;
            }
            return TransactionState::Queued;
        }
        TransactionState::PendingApproval
    }

    pub fn is_queued(&self) -> bool {
        self.finished_at.is_none() && self.percent_done.is_some()
    }

    pub fn is_rejected(&self) -> bool {
        self.approved_by_login.as_deref() == Some(REJECTED_MARKER)
    }

    pub fn is_canceled(&self) -> bool {
        self.started_at.is_none() && self.finished_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFile {
    pub id: i64,
    pub transaction_id: i64,
    pub path: String,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

pub struct DropboxStore {
    conn: Connection,
}

impl DropboxStore {
    pub fn open_in_memory() -> Result<Self, TransactionError> {
        let conn = Connection::open_in_memory()?;
        let store = DropboxStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &str) -> Result<Self, TransactionError> {
        let conn = Connection::open(path)?;
        let store = DropboxStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), TransactionError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS package (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL,
                root_path TEXT NOT NULL,
                package_path TEXT NOT NULL,
                managed_at TEXT NOT NULL,
                unmanaged_at TEXT,
                stable_since TEXT NOT NULL,
                comment TEXT
            );
            CREATE TABLE IF NOT EXISTS package_transaction (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL,
                type_name TEXT NOT NULL,
                in_package_id INTEGER,
                in_package_stable_since TEXT NOT NULL,
                out_package_id INTEGER,
                approved_by_login TEXT,
                percent_done REAL,
                spooled_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                error TEXT,
                comment TEXT,
                reason TEXT
            );
            CREATE TABLE IF NOT EXISTS transaction_file (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                mode INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn insert_package(&self, pkg: &SqlPackage) -> Result<i64, TransactionError> {
        self.conn.execute(
            "INSERT INTO package (host, root_path, package_path, managed_at, unmanaged_at, stable_since, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pkg.host, pkg.root_path, pkg.package_path, pkg.managed_at.to_rfc3339(),
                pkg.unmanaged_at.map(|t| t.to_rfc3339()), pkg.stable_since.to_rfc3339(), pkg.comment,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_package(&self, host: &str, root_path: &str, package_path: &str) -> Result<Option<SqlPackage>, TransactionError> {
        self.conn
            .query_row(
                "SELECT * FROM package WHERE host = ?1 AND root_path = ?2 AND package_path = ?3 AND unmanaged_at IS NULL",
                params![host, root_path, package_path],
                Self::row_to_package,
            )
            .optional()
            .map_err(TransactionError::from)
    }

    pub fn update_package(&self, pkg: &SqlPackage) -> Result<(), TransactionError> {
        self.conn.execute(
            "UPDATE package SET unmanaged_at = ?1, stable_since = ?2, comment = ?3 WHERE id = ?4",
            params![
                pkg.unmanaged_at.map(|t| t.to_rfc3339()), pkg.stable_since.to_rfc3339(), pkg.comment, pkg.id,
            ],
        )?;
        Ok(())
    }

    pub fn managed_packages(&self, host: &str, root_path: &str) -> Result<Vec<SqlPackage>, TransactionError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM package WHERE host = ?1 AND root_path = ?2 AND unmanaged_at IS NULL")?;
        let rows = stmt.query_map(params![host, root_path], Self::row_to_package)?;
        rows.collect::<Result<_, _>>().map_err(TransactionError::from)
    }

    fn row_to_package(row: &rusqlite::Row) -> rusqlite::Result<SqlPackage> {
        Ok(SqlPackage {
            id: row.get("id")?,
            host: row.get("host")?,
            root_path: row.get("root_path")?,
            package_path: row.get("package_path")?,
            managed_at: parse_dt(row.get::<_, String>("managed_at")?),
            unmanaged_at: row.get::<_, Option<String>>("unmanaged_at")?.map(parse_dt),
            stable_since: parse_dt(row.get::<_, String>("stable_since")?),
            comment: row.get("comment")?,
        })
    }

    pub fn insert_transaction(&self, tr: &Transaction) -> Result<i64, TransactionError> {
        self.conn.execute(
            "INSERT INTO package_transaction
                (host, type_name, in_package_id, in_package_stable_since, out_package_id,
                 approved_by_login, percent_done, spooled_at, started_at, finished_at, error, comment, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                tr.host, tr.type_name, tr.in_package_id, tr.in_package_stable_since.to_rfc3339(),
                tr.out_package_id, tr.approved_by_login, tr.percent_done, tr.spooled_at.to_rfc3339(),
                tr.started_at.map(|t| t.to_rfc3339()), tr.finished_at.map(|t| t.to_rfc3339()),
                tr.error, tr.comment, tr.reason,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_transaction(&self, tr: &Transaction) -> Result<(), TransactionError> {
        self.conn.execute(
            "UPDATE package_transaction SET
                out_package_id = ?1, approved_by_login = ?2, percent_done = ?3,
                started_at = ?4, finished_at = ?5, error = ?6, comment = ?7, reason = ?8
             WHERE id = ?9",
            params![
                tr.out_package_id, tr.approved_by_login, tr.percent_done,
                tr.started_at.map(|t| t.to_rfc3339()), tr.finished_at.map(|t| t.to_rfc3339()),
                tr.error, tr.comment, tr.reason, tr.id,
            ],
        )?;
        Ok(())
    }

    pub fn find_transaction(&self, id: i64) -> Result<Option<Transaction>, TransactionError> {
        self.conn
            .query_row("SELECT * FROM package_transaction WHERE id = ?1", params![id], Self::row_to_transaction)
            .optional()
            .map_err(TransactionError::from)
    }

    /// Unfinished, non-queued transactions for `in_package_id`/`type_name`
    /// (spec §3.2: at most one such transaction per input-package, type).
    pub fn unfinished_unqueued_for_package(&self, in_package_id: i64, type_name: &str) -> Result<Vec<Transaction>, TransactionError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM package_transaction
             WHERE in_package_id = ?1 AND type_name = ?2 AND finished_at IS NULL AND percent_done IS NULL",
        )?;
        let rows = stmt.query_map(params![in_package_id, type_name], Self::row_to_transaction)?;
        rows.collect::<Result<_, _>>().map_err(TransactionError::from)
    }

    pub fn rejected_transactions_for_package(&self, in_package_id: i64, type_name: &str) -> Result<Vec<Transaction>, TransactionError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM package_transaction WHERE in_package_id = ?1 AND type_name = ?2 AND approved_by_login = ?3",
        )?;
        let rows = stmt.query_map(params![in_package_id, type_name, REJECTED_MARKER], Self::row_to_transaction)?;
        rows.collect::<Result<_, _>>().map_err(TransactionError::from)
    }

    /// Transactions awaiting authorization resolution (spec §4.10 Transaction
    /// check task): `finished_at IS NULL AND percent_done IS NULL AND
    /// approved_by_login NOT IN (NULL, '')`.
    pub fn pending_authorization(&self) -> Result<Vec<Transaction>, TransactionError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM package_transaction
             WHERE finished_at IS NULL AND percent_done IS NULL
               AND approved_by_login IS NOT NULL AND approved_by_login != ''",
        )?;
        let rows = stmt.query_map([], Self::row_to_transaction)?;
        rows.collect::<Result<_, _>>().map_err(TransactionError::from)
    }

    fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        Ok(Transaction {
            id: row.get("id")?,
            host: row.get("host")?,
            type_name: row.get("type_name")?,
            in_package_id: row.get("in_package_id")?,
            in_package_stable_since: parse_dt(row.get::<_, String>("in_package_stable_since")?),
            out_package_id: row.get("out_package_id")?,
            approved_by_login: row.get("approved_by_login")?,
            percent_done: row.get("percent_done")?,
            spooled_at: parse_dt(row.get::<_, String>("spooled_at")?),
            started_at: row.get::<_, Option<String>>("started_at")?.map(parse_dt),
            finished_at: row.get::<_, Option<String>>("finished_at")?.map(parse_dt),
            error: row.get("error")?,
            comment: row.get("comment")?,
            reason: row.get("reason")?,
        })
    }

    pub fn insert_transaction_file(&self, f: &TransactionFile) -> Result<i64, TransactionError> {
        self.conn.execute(
            "INSERT INTO transaction_file (transaction_id, path, size, uid, gid, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![f.transaction_id, f.path, f.size as i64, f.uid, f.gid, f.mode],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn files_for_transaction(&self, transaction_id: i64) -> Result<Vec<TransactionFile>, TransactionError> {
        let mut stmt = self.conn.prepare("SELECT * FROM transaction_file WHERE transaction_id = ?1")?;
        let rows = stmt.query_map(params![transaction_id], |row| {
            Ok(TransactionFile {
                id: row.get("id")?,
                transaction_id: row.get("transaction_id")?,
                path: row.get("path")?,
                size: row.get::<_, i64>("size")? as u64,
                uid: row.get("uid")?,
                gid: row.get("gid")?,
                mode: row.get("mode")?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(TransactionError::from)
    }
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).expect("stored timestamps are always RFC3339").with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(host: &str, root: &str, path: &str) -> SqlPackage {
        SqlPackage {
            id: 0,
            host: host.into(),
            root_path: root.into(),
            package_path: path.into(),
            managed_at: Utc::now(),
            unmanaged_at: None,
            stable_since: Utc::now(),
            comment: None,
        }
    }

    fn tr(host: &str, type_name: &str, in_package_id: Option<i64>) -> Transaction {
        Transaction {
            id: 0,
            host: host.into(),
            type_name: type_name.into(),
            in_package_id,
            in_package_stable_since: Utc::now(),
            out_package_id: None,
            approved_by_login: None,
            percent_done: None,
            spooled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            comment: None,
            reason: None,
        }
    }

    #[test]
    fn insert_and_find_package_roundtrips() {
        let store = DropboxStore::open_in_memory().unwrap();
        let id = store.insert_package(&pkg("h1", "/drop", "a")).unwrap();
        let found = store.find_package("h1", "/drop", "a").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.is_managed());
    }

    #[test]
    fn state_derivation_matches_invariants() {
        let mut t = tr("h1", "delete", Some(1));
        assert_eq!(t.state(), TransactionState::PendingApproval);

        t.approved_by_login = Some(TO_BE_APPROVED_MARKER.to_string());
        assert_eq!(t.state(), TransactionState::PendingApproval);

        t.approved_by_login = Some(REJECTED_MARKER.to_string());
        assert_eq!(t.state(), TransactionState::Rejected);
        assert!(t.is_rejected());

        t.approved_by_login = None;
        t.percent_done = Some(0.0);
        assert!(t.is_queued());
        assert_eq!(t.state(), TransactionState::Queued);

        t.started_at = Some(Utc::now());
        t.finished_at = Some(Utc::now());
        assert_eq!(t.state(), TransactionState::Finished);

        t.error = Some("boom".into());
        assert_eq!(t.state(), TransactionState::Failed);

        let mut canceled = tr("h1", "delete", Some(1));
        canceled.finished_at = Some(Utc::now());
        assert!(canceled.is_canceled());
        assert_eq!(canceled.state(), TransactionState::Canceled);
    }

    #[test]
    fn at_most_one_unfinished_unqueued_per_package_type() {
        let store = DropboxStore::open_in_memory().unwrap();
        store.insert_transaction(&tr("h1", "delete", Some(1))).unwrap();
        let existing = store.unfinished_unqueued_for_package(1, "delete").unwrap();
        assert_eq!(existing.len(), 1);
    }
}

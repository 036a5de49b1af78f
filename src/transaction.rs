//! Transaction Engine (spec §4.9, C9): ordered compensatable operations with
//! persistent progress and approval gating, grounded in
//! `original_source/src/python/fsmonitor/transaction/base.py`'s
//! `DropboxTransactionBase`/`DropboxTransactionProgressIndicatorMixin` and
//! `fsops.py`/`transfer.py`'s concrete plugins.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::resolve_placeholders;
use crate::dropboxstore::{DropboxStore, Transaction, TransactionFile, REJECTED_MARKER, TO_BE_APPROVED_MARKER};
use crate::error::TransactionError;
use crate::tree::Package;

/// A single compensatable step of a transaction (spec §4.9).
pub trait Operation {
    fn apply(&mut self) -> Result<(), TransactionError>;
    fn rollback(&mut self);
    fn describe(&self) -> String;
}

/// Runs `ops` in order; on the first failure, rolls back completed
/// operations in reverse and returns that failure (spec §4.9 `apply()`).
pub fn execute_ops(ops: &mut [Box<dyn Operation>]) -> Result<(), TransactionError> {
    for i in 0..ops.len() {
        if let Err(e) = ops[i].apply() {
            for op in ops[..i].iter_mut().rev() {
                op.rollback();
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Persists progress to the DB at most every `UPDATE_DB_INTERVAL` and on
/// begin/end boundaries (spec §4.9).
pub struct ProgressSink<'a> {
    store: &'a DropboxStore,
    last_update: Instant,
    interval: Duration,
}

const UPDATE_DB_INTERVAL_SECS: u64 = 1;

impl<'a> ProgressSink<'a> {
    pub fn new(store: &'a DropboxStore) -> ProgressSink<'a> {
        ProgressSink {
            store,
            last_update: Instant::now() - Duration::from_secs(UPDATE_DB_INTERVAL_SECS),
            interval: Duration::from_secs(UPDATE_DB_INTERVAL_SECS),
        }
    }

    pub fn begin(&mut self, tr: &mut Transaction) -> Result<(), TransactionError> {
        tr.started_at = Some(Utc::now());
        self.store.update_transaction(tr)?;
        self.last_update = Instant::now();
        Ok(())
    }

    /// Sets percent-done and an optional message; only writes through if the
    /// update interval elapsed since the last write.
    pub fn set(&mut self, tr: &mut Transaction, percent: f64, message: &str) -> Result<(), TransactionError> {
        tr.percent_done = Some(percent);
        tr.comment = Some(message.to_string());
        if self.last_update.elapsed() >= self.interval {
            self.store.update_transaction(tr)?;
            self.last_update = Instant::now();
        }
        Ok(())
    }

    pub fn end(&mut self, tr: &mut Transaction) -> Result<(), TransactionError> {
        tr.finished_at = Some(Utc::now());
        self.store.update_transaction(tr)
    }
}

/// Records the completion outcome: on success `percent_done = 100`, on
/// failure the exception is stored in `error`; either way every file in the
/// input package is appended as a `TransactionFile` row (spec §4.9
/// `_completed`/`_add_package_files`).
pub fn complete(
    store: &DropboxStore,
    tr: &mut Transaction,
    package: &Package,
    error: Option<String>,
) -> Result<(), TransactionError> {
    match &error {
        Some(e) => tr.error = Some(e.clone()),
        None => tr.percent_done = Some(100.0),
    }
    tr.finished_at = Some(Utc::now());
    store.update_transaction(tr)?;

    for (rela, stat) in package.entries() {
        let abs_path = package.root().join(&rela);
        store.insert_transaction_file(&TransactionFile {
            id: 0,
            transaction_id: tr.id,
            path: abs_path.to_string_lossy().into_owned(),
            size: stat.size,
            uid: stat.uid,
            gid: stat.gid,
            mode: stat.mode,
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthToken {
    Ok,
    Wait,
    Rejected,
    Failure,
    NotNeeded,
}

struct CachedGroups {
    fetched_at: Instant,
    groups: Vec<String>,
}

/// Process-wide, lock-guarded cache over the platform `id` command (spec §5
/// Authorization cache; §4.9 `authentication_token`).
pub struct IdParserCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedGroups>>,
}

impl IdParserCache {
    pub fn new(ttl: Duration) -> IdParserCache {
        IdParserCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Group names for `login`, refreshed from `id -Gn <login>` when the
    /// cached entry is stale.
    pub fn groups(&self, login: &str) -> Option<Vec<String>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(cached) = entries.get(login) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Some(cached.groups.clone());
            }
        }
        let output = Command::new("id").arg("-Gn").arg(login).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let groups: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        entries.insert(
            login.to_string(),
            CachedGroups {
                fetched_at: Instant::now(),
                groups: groups.clone(),
            },
        );
        Some(groups)
    }
}

/// `authentication_token` (spec §4.9): `approved_by_login` drives the
/// decision; `OK` additionally requires membership of `user_group`.
pub fn authentication_token(tr: &Transaction, user_group: &str, id_cache: &IdParserCache) -> AuthToken {
    match tr.approved_by_login.as_deref() {
        Some(TO_BE_APPROVED_MARKER) => AuthToken::Wait,
        None => AuthToken::NotNeeded,
        Some(REJECTED_MARKER) => AuthToken::Rejected,
        Some(login) => match id_cache.groups(login) {
            Some(groups) if groups.iter().any(|g| g == user_group) => AuthToken::Ok,
            Some(_) => {
                log::warn!("user '{login}' is not a member of required group '{user_group}'");
                AuthToken::Failure
            }
            None => {
                log::error!("could not resolve groups for login '{login}'");
                AuthToken::Failure
            }
        },
    }
}

/// Static pre-instantiation check used by the scheduler before spawning a
/// transaction (spec §4.9 `can_enqueue`).
pub trait TransactionPlugin {
    fn type_name(&self) -> &'static str;
}

/// **delete**: enqueue once the package has been stable for
/// `after_being_stable_for` seconds (spec §4.9).
pub fn delete_can_enqueue(package: &Package, now: i64, after_being_stable_for: i64) -> bool {
    now - package.stable_since() >= after_being_stable_for
}

pub struct DeleteOperation {
    path: std::path::PathBuf,
    removed: bool,
}

impl DeleteOperation {
    pub fn new(path: std::path::PathBuf) -> DeleteOperation {
        DeleteOperation { path, removed: false }
    }
}

impl Operation for DeleteOperation {
    fn apply(&mut self) -> Result<(), TransactionError> {
        let meta = std::fs::symlink_metadata(&self.path)?;
        if meta.is_dir() {
            std::fs::remove_dir_all(&self.path)?;
        } else {
            std::fs::remove_file(&self.path)?;
        }
        self.removed = true;
        Ok(())
    }

    fn rollback(&mut self) {
        // Deletions are not recoverable without a backup copy; nothing to undo.
    }

    fn describe(&self) -> String {
        format!("delete {}", self.path.display())
    }
}

/// **move**: computes a destination from a stat time field via a strftime
/// template (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Ctime,
    Mtime,
    Atime,
}

pub fn move_destination(package: &Package, date_field: DateField, destination_template: &str) -> std::path::PathBuf {
    let stat = package
        .entries()
        .first()
        .map(|(_, s)| *s)
        .unwrap_or(crate::tree::FileStat::default());
    let epoch = match date_field {
        DateField::Ctime => stat.ctime,
        DateField::Mtime => stat.mtime,
        DateField::Atime => stat.atime,
    };
    let now = chrono::DateTime::<Utc>::from_timestamp(epoch, 0).unwrap_or_else(Utc::now);
    let resolved = resolve_placeholders(destination_template, now);
    let destination = std::path::PathBuf::from(resolved);
    if destination.is_absolute() {
        destination
    } else {
        let root = package.root();
        match root.parent() {
            Some(parent) => parent.join(destination),
            None => destination,
        }
    }
}

pub struct MoveOperation {
    source: std::path::PathBuf,
    destination: std::path::PathBuf,
    moved: bool,
}

impl MoveOperation {
    pub fn new(source: std::path::PathBuf, destination: std::path::PathBuf) -> MoveOperation {
        MoveOperation {
            source,
            destination,
            moved: false,
        }
    }
}

impl Operation for MoveOperation {
    fn apply(&mut self) -> Result<(), TransactionError> {
        if let Some(parent) = self.destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&self.source, &self.destination)?;
        self.moved = true;
        Ok(())
    }

    fn rollback(&mut self) {
        if self.moved {
            let _ = std::fs::rename(&self.destination, &self.source);
        }
    }

    fn describe(&self) -> String {
        format!("move {} -> {}", self.source.display(), self.destination.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Move,
    Copy,
    Sync,
}

/// **transfer** `can_enqueue` (spec §4.9): refuses if any prior transaction
/// of this type was rejected; in `copy` mode also refuses a repeat copy of a
/// package that has not changed since the last successful one.
pub fn transfer_can_enqueue(prior: &[Transaction], mode: TransferMode, in_package_stable_since: chrono::DateTime<Utc>) -> bool {
    if prior.iter().any(|t| t.is_rejected()) {
        return false;
    }
    if mode == TransferMode::Move {
        return true;
    }
    !prior
        .iter()
        .any(|t| t.error.is_none() && t.in_package_stable_since == in_package_stable_since)
}

/// Builds the `rsync` command line for a transfer (spec §4.9: "rsync over
/// SSH"); execution is left to the caller, matching the teacher's pattern of
/// emitting subprocess commandlines for operator review.
pub fn transfer_command(source: &std::path::Path, destination: &std::path::Path, mode: TransferMode) -> Vec<String> {
    let mut args = vec!["-a".to_string()];
    if mode == TransferMode::Sync {
        args.push("--delete".to_string());
    }
    args.push(format!("{}/", source.display()));
    args.push(destination.display().to_string());
    let mut cmd = vec!["rsync".to_string()];
    cmd.extend(args);
    if mode == TransferMode::Move {
        cmd.push("&&".to_string());
        cmd.push("rm".to_string());
        cmd.push("-rf".to_string());
        cmd.push(source.display().to_string());
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn execute_ops_rolls_back_completed_steps_on_failure() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct Recorder(Arc<AtomicBool>, bool);
        impl Operation for Recorder {
            fn apply(&mut self) -> Result<(), TransactionError> {
                if self.1 {
                    Err(TransactionError::OperationFailed("boom".into()))
                } else {
                    Ok(())
                }
            }
            fn rollback(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
            fn describe(&self) -> String {
                "op".into()
            }
        }

        let first_rolled_back = Arc::new(AtomicBool::new(false));
        let mut ops: Vec<Box<dyn Operation>> = vec![
            Box::new(Recorder(first_rolled_back.clone(), false)),
            Box::new(Recorder(Arc::new(AtomicBool::new(false)), true)),
        ];
        let result = execute_ops(&mut ops);
        assert!(result.is_err());
        assert!(first_rolled_back.load(Ordering::SeqCst));
    }

    #[test]
    fn delete_operation_removes_file_and_rollback_is_noop() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hi").unwrap();
        let mut op = DeleteOperation::new(file.clone());
        op.apply().unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn move_operation_creates_destination_parent_and_rolls_back() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "hi").unwrap();
        let dst = dir.path().join("nested/dst.txt");
        let mut op = MoveOperation::new(src.clone(), dst.clone());
        op.apply().unwrap();
        assert!(dst.exists());
        op.rollback();
        assert!(src.exists());
        assert!(!dst.exists());
    }

    #[test]
    fn transfer_can_enqueue_blocks_after_rejection() {
        let mut tr = Transaction {
            id: 1,
            host: "h1".into(),
            type_name: "transfer".into(),
            in_package_id: Some(1),
            in_package_stable_since: Utc::now(),
            out_package_id: None,
            approved_by_login: Some(REJECTED_MARKER.to_string()),
            percent_done: None,
            spooled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            comment: None,
            reason: None,
        };
        assert!(!transfer_can_enqueue(&[tr.clone()], TransferMode::Copy, Utc::now()));
        tr.approved_by_login = None;
        assert!(transfer_can_enqueue(&[tr.clone()], TransferMode::Move, Utc::now()));

        let since = Utc::now() - Duration::seconds(10);
        tr.in_package_stable_since = since;
        tr.error = None;
        assert!(!transfer_can_enqueue(&[tr], TransferMode::Copy, since));
    }

    #[test]
    fn delete_can_enqueue_respects_stability_window() {
        assert!(delete_can_enqueue_fixture(100, 40, 60));
        assert!(!delete_can_enqueue_fixture(100, 80, 60));
    }

    fn delete_can_enqueue_fixture(now: i64, stable_since: i64, after: i64) -> bool {
        now - stable_since >= after
    }

    #[test]
    fn transfer_command_appends_cleanup_for_move_mode() {
        let cmd = transfer_command(&PathBuf::from("/src"), &PathBuf::from("/dst"), TransferMode::Move);
        assert!(cmd.contains(&"rsync".to_string()));
        assert!(cmd.last().unwrap() == "/src");
    }
}

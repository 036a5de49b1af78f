//! Dropbox Daemon Scheduler (spec §4.10, §5, C10): periodic schedulers over
//! two bounded worker pools with threadlocal DB sessions, grounded in
//! `original_source/src/python/fsmonitor/daemon/base.py`'s `DaemonThread`.
//! No async runtime is used (matching the teacher's plain-thread style in
//! `replicate.rs`'s subprocess pipelines): worker pools are `std::thread` +
//! `mpsc`, per spec §5's "parallel workers ... bounded worker pools via FIFO
//! queues".

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;

use crate::config::{ConfigValue, DaemonConfig};
use crate::dropbox::{Dropbox, DropboxFinder};
use crate::dropboxstore::{DropboxStore, SqlPackage, Transaction, TO_BE_APPROVED_MARKER};
use crate::error::TransactionError;
use crate::transaction::{
    authentication_token, complete, execute_ops, move_destination, AuthToken, DateField, DeleteOperation, IdParserCache,
    MoveOperation, Operation, ProgressSink,
};
use crate::tree::{diff_packages, ChangeKind, Package};

pub const MAX_WORKERS: usize = 17;
/// Backpressure threshold (spec §4.10): package-diff scheduling is skipped
/// wholesale while the update queue holds more than this many tasks.
pub const MAX_UPDATE_QUEUE_SCHEDULE_TASKS: usize = 40;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A bounded FIFO worker pool; each worker thread runs until dropped
/// (cooperative shutdown via closing the channel), matching spec §5's
/// "cancel all workers, ... join with a periodic still-waiting log" model
/// minus the logging, which callers layer on top via `log`.
pub struct WorkerPool {
    sender: mpsc::Sender<Task>,
    handles: Vec<JoinHandle<()>>,
    queue_len: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> WorkerPool {
        assert!((1..MAX_WORKERS).contains(&num_workers) || num_workers == MAX_WORKERS);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let queue_len = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let receiver = receiver.clone();
            let queue_len = queue_len.clone();
            handles.push(std::thread::spawn(move || loop {
                let task = {
                    let rx = receiver.lock().unwrap();
                    rx.recv()
                };
                match task {
                    Ok(task) => {
                        task();
                        queue_len.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(_) => break,
                }
            }));
        }
        WorkerPool { sender, handles, queue_len }
    }

    pub fn submit(&self, task: Task) {
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(task);
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: drop the sender so workers see a closed channel
    /// and exit their loop, then join every worker.
    pub fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Per-dropbox transaction-type configuration needed by the possibly-stable
/// handler (spec §4.10): how long a package must be stable before this type
/// becomes eligible, and whether it is auto-approved.
pub struct TransactionTypeConfig {
    pub name: String,
    pub after_being_stable_for: i64,
}

pub enum PossiblyStableOutcome {
    Skipped,
    Created { transaction_id: i64, type_name: String, auto_approved: bool },
}

/// Per spec §4.10: "If `now - stable_since >= stable_after`, for each
/// configured transaction type, if no unfinished-unqueued transaction exists
/// and `can_enqueue` returns true, create a new SQL transaction row. If the
/// type is in auto_approve, mark approved (by system) and set_queued (ready
/// for the operation pool); otherwise mark it pending approval. Only the
/// first viable type is enqueued per cycle."
pub fn possibly_stable_handler(
    store: &DropboxStore,
    host: &str,
    package_id: i64,
    package_stable_since: i64,
    now: i64,
    dropbox_stable_after: i64,
    types: &[TransactionTypeConfig],
    auto_approve: &[String],
) -> Result<PossiblyStableOutcome, TransactionError> {
    if now - package_stable_since < dropbox_stable_after {
        return Ok(PossiblyStableOutcome::Skipped);
    }

    for t in types {
        if now - package_stable_since < t.after_being_stable_for {
            continue;
        }
        let existing = store.unfinished_unqueued_for_package(package_id, &t.name)?;
        if !existing.is_empty() {
            continue;
        }
        let auto_approved = auto_approve.iter().any(|n| n == &t.name);
        let tr = Transaction {
            id: 0,
            host: host.to_string(),
            type_name: t.name.clone(),
            in_package_id: Some(package_id),
            in_package_stable_since: chrono::DateTime::<Utc>::from_timestamp(package_stable_since, 0).unwrap_or_else(Utc::now),
            out_package_id: None,
            approved_by_login: Some(if auto_approved { "system".to_string() } else { TO_BE_APPROVED_MARKER.to_string() }),
            percent_done: if auto_approved { Some(0.0) } else { None },
            spooled_at: chrono::DateTime::<Utc>::from_timestamp(now, 0).unwrap_or_else(Utc::now),
            started_at: None,
            finished_at: None,
            error: None,
            comment: None,
            reason: None,
        };
        let transaction_id = store.insert_transaction(&tr)?;
        return Ok(PossiblyStableOutcome::Created {
            transaction_id,
            type_name: t.name.clone(),
            auto_approved,
        });
    }
    Ok(PossiblyStableOutcome::Skipped)
}

/// Instantiates the plugin for `tr.type_name` against `package` and runs it
/// to completion (spec §4.9/§4.10: the path a queued, approved transaction
/// takes once the operation pool picks it up). `type_config` is the
/// dropbox's per-type settings (e.g. `move`'s `destination_template`/
/// `date_field`), taken from `DropboxFileConfig::transactions`.
pub fn execute_transaction(
    store: &DropboxStore,
    tr: &mut Transaction,
    package: &Package,
    type_config: &BTreeMap<String, ConfigValue>,
) -> Result<(), TransactionError> {
    let mut sink = ProgressSink::new(store);
    sink.begin(tr)?;

    let mut ops: Vec<Box<dyn Operation>> = match tr.type_name.as_str() {
        "delete" => vec![Box::new(DeleteOperation::new(package.root()))],
        "move" => {
            let template = type_config.get("destination_template").and_then(ConfigValue::as_str).unwrap_or("");
            let date_field = match type_config.get("date_field").and_then(ConfigValue::as_str) {
                Some("mtime") => DateField::Mtime,
                Some("atime") => DateField::Atime,
                _ => DateField::Ctime,
            };
            let destination = move_destination(package, date_field, template);
            vec![Box::new(MoveOperation::new(package.root(), destination))]
        }
        other => return Err(TransactionError::OperationFailed(format!("unknown transaction type '{other}'"))),
    };

    let result = execute_ops(&mut ops);
    let error = result.as_ref().err().map(ToString::to_string);
    complete(store, tr, package, error)?;
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionCheckOutcome {
    Queued,
    ResetToPending,
    Canceled,
    Skipped,
}

/// Transaction check task (spec §4.10): resolves the authorization token for
/// a transaction awaiting approval resolution and decides its next state.
pub fn check_transaction_auth(auth: AuthToken) -> TransactionCheckOutcome {
    match auth {
        AuthToken::Ok | AuthToken::NotNeeded => TransactionCheckOutcome::Queued,
        AuthToken::Failure => TransactionCheckOutcome::ResetToPending,
        AuthToken::Rejected => TransactionCheckOutcome::Canceled,
        AuthToken::Wait => TransactionCheckOutcome::Skipped,
    }
}

/// Runs the transaction-check task over every transaction pending
/// authorization resolution (spec §4.10).
pub fn run_transaction_check(
    store: &DropboxStore,
    user_group: &str,
    id_cache: &IdParserCache,
) -> Result<Vec<(i64, TransactionCheckOutcome)>, TransactionError> {
    let mut outcomes = Vec::new();
    for mut tr in store.pending_authorization()? {
        let token = authentication_token(&tr, user_group, id_cache);
        let outcome = check_transaction_auth(token);
        match outcome {
            TransactionCheckOutcome::Queued => {
                tr.percent_done = Some(0.0);
                store.update_transaction(&tr)?;
            }
            TransactionCheckOutcome::ResetToPending => {
                tr.approved_by_login = Some(TO_BE_APPROVED_MARKER.to_string());
                store.update_transaction(&tr)?;
            }
            TransactionCheckOutcome::Canceled => {
                tr.finished_at = Some(Utc::now());
                store.update_transaction(&tr)?;
            }
            TransactionCheckOutcome::Skipped => {}
        }
        outcomes.push((tr.id, outcome));
    }
    Ok(outcomes)
}

/// Handles package-diff results for one dropbox against the DB (spec §4.10
/// "Package change handler"). Takes ownership of an already-sampled `next`
/// package set, diffed against `prev` (the dropbox's last sample).
pub fn handle_package_diff(
    store: &DropboxStore,
    host: &str,
    root_path: &str,
    prev: Vec<Package>,
    next: Vec<Package>,
    now: i64,
) -> Result<(), TransactionError> {
    for entry in diff_packages(prev, next) {
        let package_path = entry.package.root_relative().to_string();
        match entry.kind {
            ChangeKind::Added => {
                let existing = store.find_package(host, root_path, &package_path)?;
                let stable_since = match &existing {
                    Some(e) if e.stable_since.timestamp() > entry.package.stable_since() => e.stable_since,
                    _ => chrono::DateTime::<Utc>::from_timestamp(entry.package.stable_since(), 0).unwrap_or_else(Utc::now),
                };
                if let Some(mut sql_pkg) = existing {
                    sql_pkg.unmanaged_at = None;
                    sql_pkg.stable_since = stable_since;
                    store.update_package(&sql_pkg)?;
                } else {
                    store.insert_package(&SqlPackage {
                        id: 0,
                        host: host.to_string(),
                        root_path: root_path.to_string(),
                        package_path,
                        managed_at: chrono::DateTime::<Utc>::from_timestamp(now, 0).unwrap_or_else(Utc::now),
                        unmanaged_at: None,
                        stable_since,
                        comment: None,
                    })?;
                }
            }
            ChangeKind::Removed => {
                if let Some(mut sql_pkg) = store.find_package(host, root_path, &package_path)? {
                    sql_pkg.unmanaged_at = Some(chrono::DateTime::<Utc>::from_timestamp(now, 0).unwrap_or_else(Utc::now));
                    sql_pkg.comment = Some("package removed from disk".to_string());
                    store.update_package(&sql_pkg)?;
                }
            }
            ChangeKind::PossiblyChanged { modified } => {
                if modified {
                    if let Some(mut sql_pkg) = store.find_package(host, root_path, &package_path)? {
                        sql_pkg.stable_since = chrono::DateTime::<Utc>::from_timestamp(entry.package.stable_since(), 0).unwrap_or_else(Utc::now);
                        store.update_package(&sql_pkg)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Orchestrates the three periodic schedulers against a live `DropboxFinder`
/// (spec §4.10). Method bodies are single-tick operations; the long-running
/// loop is the caller's responsibility (sleep-and-repeat), matching spec §5's
/// "single cooperative loop" description without baking in a particular
/// sleep granularity here.
pub struct Scheduler {
    pub finder: DropboxFinder,
    pub config: DaemonConfig,
    update_dropboxes_scheduled: AtomicBool,
    update_pool: WorkerPool,
    operation_pool: WorkerPool,
}

impl Scheduler {
    pub fn new(finder: DropboxFinder, config: DaemonConfig) -> Scheduler {
        let update_pool = WorkerPool::new(config.threads.num_update_threads);
        let operation_pool = WorkerPool::new(config.threads.num_operation_threads);
        Scheduler {
            finder,
            config,
            update_dropboxes_scheduled: AtomicBool::new(false),
            update_pool,
            operation_pool,
        }
    }

    /// Dropbox update is a singleton task: never enqueue a second one while
    /// one is outstanding (spec §4.10, §5).
    pub fn schedule_dropbox_update(&self) -> bool {
        if self
            .update_dropboxes_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        true
    }

    pub fn finish_dropbox_update(&self) {
        self.update_dropboxes_scheduled.store(false, Ordering::SeqCst);
    }

    /// Whether per-dropbox package-diff tasks should be scheduled this cycle
    /// (spec §4.10 backpressure).
    pub fn should_schedule_package_checks(&self) -> bool {
        self.update_pool.queue_len() <= MAX_UPDATE_QUEUE_SCHEDULE_TASKS
    }

    /// Runs the possibly-stable check for one managed package and, when a
    /// transaction is auto-approved, submits its execution to the operation
    /// pool (spec §4.10: the end-to-end path from "package has been stable
    /// long enough" to "operation actually ran"). The submitted task opens
    /// its own DB connection and re-samples the package tree rather than
    /// capturing `store`/`package` directly, since neither `rusqlite::
    /// Connection` nor `Package` (which holds an `Rc`) is `Send`  — matching
    /// this module's threadlocal-DB-session model.
    #[allow(clippy::too_many_arguments)]
    pub fn check_package_stability(
        &self,
        store: &DropboxStore,
        db_url: String,
        host: String,
        root_path: std::path::PathBuf,
        one_package_per_file: bool,
        package_path: String,
        package_id: i64,
        package_stable_since: i64,
        now: i64,
        dropbox_stable_after: i64,
        types: &[TransactionTypeConfig],
        auto_approve: &[String],
        type_configs: BTreeMap<String, BTreeMap<String, ConfigValue>>,
    ) -> Result<PossiblyStableOutcome, TransactionError> {
        let outcome = possibly_stable_handler(
            store,
            &host,
            package_id,
            package_stable_since,
            now,
            dropbox_stable_after,
            types,
            auto_approve,
        )?;

        if let PossiblyStableOutcome::Created { transaction_id, type_name, auto_approved: true } = &outcome {
            let transaction_id = *transaction_id;
            let type_name = type_name.clone();
            self.operation_pool.submit(Box::new(move || {
                let store = match DropboxStore::open(&db_url) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let mut tr = match store.find_transaction(transaction_id) {
                    Ok(Some(t)) => t,
                    _ => return,
                };
                let tree = match crate::tree::TreeRoot::sample(&root_path, one_package_per_file) {
                    Ok(t) => std::rc::Rc::new(t),
                    Err(_) => return,
                };
                let package = tree.iter_packages().into_iter().find(|p| p.root_relative() == package_path);
                let package = match package {
                    Some(p) => p,
                    None => return,
                };
                let type_config = type_configs.get(&type_name).cloned().unwrap_or_default();
                let _ = execute_transaction(&store, &mut tr, &package, &type_config);
            }));
        }

        Ok(outcome)
    }

    pub fn dropboxes(&self) -> impl Iterator<Item = &Dropbox> {
        self.finder.iter_dropboxes()
    }

    pub fn update_pool(&self) -> &WorkerPool {
        &self.update_pool
    }

    pub fn operation_pool(&self) -> &WorkerPool {
        &self.operation_pool
    }

    pub fn shutdown(self) {
        self.update_pool.shutdown();
        self.operation_pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropboxstore::Transaction;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn worker_pool_runs_submitted_tasks() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn possibly_stable_handler_creates_first_viable_type_only() {
        let store = DropboxStore::open_in_memory().unwrap();
        let types = vec![
            TransactionTypeConfig { name: "delete".into(), after_being_stable_for: 60 },
            TransactionTypeConfig { name: "move".into(), after_being_stable_for: 0 },
        ];
        let outcome = possibly_stable_handler(&store, "h1", 1, 0, 100, 30, &types, &["move".to_string()]).unwrap();
        match outcome {
            PossiblyStableOutcome::Created { transaction_id, type_name, auto_approved } => {
                assert_eq!(type_name, "delete");
                assert!(!auto_approved);
                let tr = store.find_transaction(transaction_id).unwrap().unwrap();
                assert_eq!(tr.approved_by_login, Some(TO_BE_APPROVED_MARKER.to_string()));
                assert_eq!(tr.percent_done, None);
            }
            _ => panic!("expected a created transaction"),
        }
    }

    #[test]
    fn possibly_stable_handler_auto_approves_and_queues() {
        let store = DropboxStore::open_in_memory().unwrap();
        let types = vec![TransactionTypeConfig { name: "delete".into(), after_being_stable_for: 0 }];
        let outcome = possibly_stable_handler(&store, "h1", 1, 0, 100, 30, &types, &["delete".to_string()]).unwrap();
        match outcome {
            PossiblyStableOutcome::Created { transaction_id, auto_approved, .. } => {
                assert!(auto_approved);
                let tr = store.find_transaction(transaction_id).unwrap().unwrap();
                assert_eq!(tr.approved_by_login, Some("system".to_string()));
                assert_eq!(tr.percent_done, Some(0.0));
            }
            _ => panic!("expected a created transaction"),
        }
    }

    #[test]
    fn possibly_stable_handler_skips_when_not_yet_stable_enough() {
        let store = DropboxStore::open_in_memory().unwrap();
        let types = vec![TransactionTypeConfig { name: "delete".into(), after_being_stable_for: 60 }];
        let outcome = possibly_stable_handler(&store, "h1", 1, 90, 100, 5, &types, &[]).unwrap();
        assert!(matches!(outcome, PossiblyStableOutcome::Skipped));
    }

    #[test]
    fn check_transaction_auth_maps_tokens_to_outcomes() {
        assert_eq!(check_transaction_auth(AuthToken::Ok), TransactionCheckOutcome::Queued);
        assert_eq!(check_transaction_auth(AuthToken::NotNeeded), TransactionCheckOutcome::Queued);
        assert_eq!(check_transaction_auth(AuthToken::Failure), TransactionCheckOutcome::ResetToPending);
        assert_eq!(check_transaction_auth(AuthToken::Rejected), TransactionCheckOutcome::Canceled);
        assert_eq!(check_transaction_auth(AuthToken::Wait), TransactionCheckOutcome::Skipped);
    }

    #[test]
    fn run_transaction_check_resets_unresolvable_login_to_pending() {
        // pending_authorization only yields rows with a non-empty
        // approved_by_login (spec §3.2); a login that doesn't resolve via
        // `id -Gn` maps to AuthToken::Failure, which resets the transaction
        // back to TO_BE_APPROVED_MARKER rather than queuing it.
        let store = DropboxStore::open_in_memory().unwrap();
        let tr = Transaction {
            id: 0,
            host: "h1".into(),
            type_name: "delete".into(),
            in_package_id: Some(1),
            in_package_stable_since: Utc::now(),
            out_package_id: None,
            approved_by_login: Some("no-such-login-zzz".to_string()),
            percent_done: None,
            spooled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            comment: None,
            reason: None,
        };
        store.insert_transaction(&tr).unwrap();
        let cache = IdParserCache::new(std::time::Duration::from_secs(60));
        let outcomes = run_transaction_check(&store, "admins", &cache).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1, TransactionCheckOutcome::ResetToPending);
    }

    #[test]
    fn execute_transaction_deletes_package_and_records_completion() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("pkgA")).unwrap();
        std::fs::write(tmp.path().join("pkgA/file.txt"), b"data").unwrap();

        let tree = std::rc::Rc::new(crate::tree::TreeRoot::sample(tmp.path(), false).unwrap());
        let package = tree.iter_packages().into_iter().find(|p| p.root_relative() == "pkgA").unwrap();

        let store = DropboxStore::open_in_memory().unwrap();
        let mut tr = Transaction {
            id: 0,
            host: "h1".into(),
            type_name: "delete".into(),
            in_package_id: Some(1),
            in_package_stable_since: Utc::now(),
            out_package_id: None,
            approved_by_login: Some("system".to_string()),
            percent_done: Some(0.0),
            spooled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            comment: None,
            reason: None,
        };
        tr.id = store.insert_transaction(&tr).unwrap();

        execute_transaction(&store, &mut tr, &package, &BTreeMap::new()).unwrap();

        assert!(!tmp.path().join("pkgA").exists());
        let persisted = store.find_transaction(tr.id).unwrap().unwrap();
        assert_eq!(persisted.percent_done, Some(100.0));
        assert!(persisted.finished_at.is_some());
        assert_eq!(store.files_for_transaction(tr.id).unwrap().len(), 1);
    }

    #[test]
    fn check_package_stability_submits_auto_approved_execution_to_operation_pool() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("pkgA")).unwrap();
        std::fs::write(tmp.path().join("pkgA/file.txt"), b"data").unwrap();
        let db_path = tmp.path().join("dropbox.db");
        let db_url = db_path.to_str().unwrap().to_string();

        let store = DropboxStore::open(&db_url).unwrap();
        let finder = DropboxFinder::new(vec![], 1, ".dropbox.yaml".to_string());
        let config = DaemonConfig {
            search: crate::config::SearchConfig { paths: vec![], max_directory_depth: 1, config_file_glob: ".dropbox.yaml".to_string() },
            check: Default::default(),
            threads: Default::default(),
            db: crate::config::DbConfig { url: db_url.clone() },
            authentication: Default::default(),
        };
        let scheduler = Scheduler::new(finder, config);

        let types = vec![TransactionTypeConfig { name: "delete".into(), after_being_stable_for: 0 }];
        let outcome = scheduler
            .check_package_stability(
                &store,
                db_url,
                "h1".to_string(),
                tmp.path().to_path_buf(),
                false,
                "pkgA".to_string(),
                1,
                0,
                100,
                0,
                &types,
                &["delete".to_string()],
                BTreeMap::new(),
            )
            .unwrap();
        let transaction_id = match outcome {
            PossiblyStableOutcome::Created { transaction_id, auto_approved: true, .. } => transaction_id,
            _ => panic!("expected an auto-approved transaction"),
        };

        scheduler.shutdown();

        assert!(!tmp.path().join("pkgA").exists());
        let persisted = store.find_transaction(transaction_id).unwrap().unwrap();
        assert_eq!(persisted.percent_done, Some(100.0));
    }
}

//! Filesystem-Inventory Engine (spec §4.11, C11): a wide per-path table
//! (path, size, times, uid/gid, nblocks/nlink/mode, symlink target, SHA-1,
//! compression ratio), grounded in the schema of
//! `original_source/src/python/itool/fsstat_schema.py` and the crawl/update
//! logic of `itool/fsstat.py`. Persistence follows the `rusqlite` connection
//! shape of `store.rs` (C3); hashing streams in fixed chunks and folds in a
//! running LZ4 compression ratio via `lz4_flex`, the pack's pure-Rust LZ4
//! implementation standing in for the original's optional `lz4` module.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sha1::{Digest, Sha1};

use crate::error::InventoryError;

/// Default streaming chunk size for hashing (spec §4.11).
pub const DEFAULT_CHUNK_SIZE: usize = 25 * 1024 * 1024;
/// Commit batches are bounded by record count...
pub const DEFAULT_BATCH_RECORDS: usize = 15_000;
/// ...or elapsed time, whichever comes first (spec §4.11).
pub const DEFAULT_BATCH_TIME: Duration = Duration::from_secs(30);
/// Fast-update and merge both pull rows in fixed-size windows (spec §4.11).
pub const WINDOW_SIZE: i64 = 1_000_000;

/// A deleted path is recorded with this sentinel size rather than a
/// separate boolean column, preserving the last-known `sha1`/`ratio` as the
/// spec requires ("append a deletion row (preserve sha1 as last-known)").
pub const DELETED_SIZE: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct FsItem {
    pub id: i64,
    pub path: Option<PathBuf>,
    pub size: i64,
    pub atime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub nblocks: Option<i64>,
    pub nlink: Option<i64>,
    pub mode: Option<u32>,
    pub ldest: Option<String>,
    pub sha1: Option<[u8; 20]>,
    pub ratio: Option<f64>,
}

impl FsItem {
    pub fn is_deleted(&self) -> bool {
        self.size == DELETED_SIZE
    }

    /// `None` means the path is present but isn't valid UTF-8 (spec §4.11
    /// "encoding discipline").
    fn path_text(&self) -> Option<Option<&str>> {
        self.path.as_ref().map(|p| p.to_str())
    }
}

pub struct InventoryStore {
    conn: Connection,
}

impl InventoryStore {
    pub fn open_in_memory() -> Result<Self, InventoryError> {
        let conn = Connection::open_in_memory()?;
        let store = InventoryStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &str) -> Result<Self, InventoryError> {
        let conn = Connection::open(path)?;
        let store = InventoryStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), InventoryError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS fsitem (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT,
                size INTEGER NOT NULL,
                atime TEXT,
                ctime TEXT,
                mtime TEXT,
                uid INTEGER,
                gid INTEGER,
                nblocks INTEGER,
                nlink INTEGER,
                mode INTEGER,
                ldest TEXT,
                sha1 BLOB,
                ratio REAL
            );
            ",
        )?;
        Ok(())
    }

    /// Inserts a batch inside one transaction. On an encoding failure (a
    /// path that isn't valid UTF-8), rolls back, then retries with the
    /// offending rows' paths nulled out (spec §4.11 "encoding discipline").
    pub fn insert_batch(&mut self, items: &[FsItem]) -> Result<usize, InventoryError> {
        match self.try_insert_all(items) {
            Ok(n) => Ok(n),
            Err(InventoryError::Encoding(_)) => {
                let mut clean = Vec::new();
                let mut quarantined = Vec::new();
                for item in items {
                    match item.path_text() {
                        Some(None) => {
                            let mut row = item.clone();
                            row.path = None;
                            quarantined.push(row);
                        }
                        _ => clean.push(item.clone()),
                    }
                }
                let mut total = self.try_insert_all(&clean)?;
                total += self.try_insert_all(&quarantined)?;
                Ok(total)
            }
            Err(e) => Err(e),
        }
    }

    fn try_insert_all(&mut self, items: &[FsItem]) -> Result<usize, InventoryError> {
        if items.iter().any(|i| matches!(i.path_text(), Some(None))) {
            return Err(InventoryError::Encoding(
                "batch contains a non-UTF-8 path".to_string(),
            ));
        }
        let tx = self.conn.transaction()?;
        for item in items {
            let path_text = item.path.as_ref().and_then(|p| p.to_str());
            tx.execute(
                "INSERT INTO fsitem
                 (path, size, atime, ctime, mtime, uid, gid, nblocks, nlink, mode, ldest, sha1, ratio)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    path_text,
                    item.size,
                    item.atime.map(|t| t.to_rfc3339()),
                    item.ctime.map(|t| t.to_rfc3339()),
                    item.mtime.map(|t| t.to_rfc3339()),
                    item.uid,
                    item.gid,
                    item.nblocks,
                    item.nlink,
                    item.mode,
                    item.ldest,
                    item.sha1.map(|s| s.to_vec()),
                    item.ratio,
                ],
            )?;
        }
        tx.commit()?;
        Ok(items.len())
    }

    /// Rows whose path could never be recovered (spec §4.11: "rows with
    /// null path are swept at the end").
    pub fn sweep_null_paths(&self) -> Result<usize, InventoryError> {
        Ok(self.conn.execute("DELETE FROM fsitem WHERE path IS NULL", [])?)
    }

    /// Deletes every row but the highest-id one per path (spec §4.11
    /// dedup; invariant: `count(path) <= 1` afterward, survivor has max id).
    pub fn dedup(&self) -> Result<usize, InventoryError> {
        Ok(self.conn.execute(
            "DELETE FROM fsitem WHERE path IS NOT NULL AND id NOT IN
             (SELECT MAX(id) FROM fsitem WHERE path IS NOT NULL GROUP BY path)",
            [],
        )?)
    }

    /// Creates the `path`/`id` indices after a bulk load rather than
    /// up front, grounded in the original schema's comment: "we create the
    /// indices after the fact as it is faster (less IOPs)".
    pub fn create_indices(&self) -> Result<(), InventoryError> {
        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS fsitem_path_id ON fsitem (path, id);",
        )?;
        Ok(())
    }

    pub fn row_count(&self) -> Result<i64, InventoryError> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM fsitem", [], |r| r.get(0))?)
    }

    /// Latest row per path within a fixed window, ordered `(path asc, id
    /// desc)` per spec §4.11's fast-update windowing.
    fn window(&self, offset: i64, limit: i64) -> Result<Vec<FsItem>, InventoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM fsitem ORDER BY path ASC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], Self::row_to_item)?;
        let all: Vec<FsItem> = rows.collect::<Result<_, _>>()?;

        let mut dedup = Vec::with_capacity(all.len());
        let mut last_path: Option<&Option<PathBuf>> = None;
        for item in &all {
            if last_path != Some(&item.path) {
                dedup.push(item.clone());
                last_path = Some(&item.path);
            }
        }
        Ok(dedup)
    }

    /// Raw row window in insertion order, used by `merge_from` (no dedup:
    /// the source database's full history is imported as-is).
    fn window_raw_by_id(&self, offset: i64, limit: i64) -> Result<Vec<FsItem>, InventoryError> {
        let mut stmt = self.conn.prepare("SELECT * FROM fsitem ORDER BY id ASC LIMIT ?1 OFFSET ?2")?;
        let rows = stmt.query_map(params![limit, offset], Self::row_to_item)?;
        rows.collect::<Result<_, _>>().map_err(InventoryError::from)
    }

    fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<FsItem> {
        let path_text: Option<String> = row.get("path")?;
        let sha1: Option<Vec<u8>> = row.get("sha1")?;
        Ok(FsItem {
            id: row.get("id")?,
            path: path_text.map(PathBuf::from),
            size: row.get("size")?,
            atime: parse_rfc3339(row.get("atime")?),
            ctime: parse_rfc3339(row.get("ctime")?),
            mtime: parse_rfc3339(row.get("mtime")?),
            uid: row.get("uid")?,
            gid: row.get("gid")?,
            nblocks: row.get("nblocks")?,
            nlink: row.get("nlink")?,
            mode: row.get("mode")?,
            ldest: row.get("ldest")?,
            sha1: sha1.and_then(|v| v.try_into().ok()),
            ratio: row.get("ratio")?,
        })
    }

    /// Known (non-deleted) immediate children of `dir`, latest row per path.
    fn known_children(&self, dir: &Path) -> Result<BTreeSet<PathBuf>, InventoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT path FROM fsitem WHERE id IN (SELECT MAX(id) FROM fsitem WHERE path IS NOT NULL GROUP BY path)
             AND size >= 0 AND path IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = BTreeSet::new();
        for path in rows {
            let path = PathBuf::from(path?);
            if path.parent() == Some(dir) {
                out.insert(path);
            }
        }
        Ok(out)
    }

    /// Imports another store's rows in windowed batches, always nulling the
    /// id so they're reassigned by this store's autoincrement (spec §4.11
    /// merge).
    pub fn merge_from(&mut self, other: &InventoryStore) -> Result<usize, InventoryError> {
        let mut offset = 0i64;
        let mut total = 0usize;
        loop {
            let rows = other.window_raw_by_id(offset, WINDOW_SIZE)?;
            if rows.is_empty() {
                break;
            }
            let n = rows.len();
            let to_insert: Vec<FsItem> = rows
                .into_iter()
                .map(|mut r| {
                    r.id = 0;
                    r
                })
                .collect();
            total += self.insert_batch(&to_insert)?;
            offset += n as i64;
            if (n as i64) < WINDOW_SIZE {
                break;
            }
        }
        Ok(total)
    }
}

fn parse_rfc3339(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Streams a file in fixed-size chunks, computing its SHA-1 digest and a
/// running-mean LZ4 compression ratio (spec §4.11 initial crawl).
fn hash_and_ratio(path: &Path, chunk_size: usize) -> std::io::Result<([u8; 20], f64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut ratio_sum = 0.0;
    let mut ratio_count = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        let compressed = lz4_flex::compress_prepend_size(&buf[..n]);
        if !compressed.is_empty() {
            ratio_sum += n as f64 / compressed.len() as f64;
            ratio_count += 1;
        }
    }
    let ratio = if ratio_count == 0 { 1.0 } else { ratio_sum / ratio_count as f64 };
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    Ok((out, ratio))
}

#[cfg(unix)]
fn stat_fields(meta: &fs::Metadata) -> (u32, u32, i64, i64, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid(), meta.blocks() as i64, meta.nlink() as i64, meta.mode())
}

#[cfg(not(unix))]
fn stat_fields(_meta: &fs::Metadata) -> (u32, u32, i64, i64, u32) {
    (0, 0, 0, 1, 0)
}

fn times(meta: &fs::Metadata) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let at = DateTime::from_timestamp(meta.atime(), 0);
        let ct = DateTime::from_timestamp(meta.ctime(), 0);
        let mt = DateTime::from_timestamp(meta.mtime(), 0);
        (at, ct, mt)
    }
    #[cfg(not(unix))]
    {
        let mt = meta.modified().ok().map(DateTime::<Utc>::from);
        (None, None, mt)
    }
}

/// Builds the row for `path` without touching its contents: used for
/// plain re-stats where the hash can be carried over unchanged.
fn stat_only_item(path: &Path, meta: &fs::Metadata) -> FsItem {
    let (uid, gid, nblocks, nlink, mode) = stat_fields(meta);
    let (atime, ctime, mtime) = times(meta);
    let ldest = if meta.file_type().is_symlink() {
        fs::read_link(path).ok().map(|p| p.to_string_lossy().into_owned())
    } else {
        None
    };
    FsItem {
        id: 0,
        path: Some(path.to_path_buf()),
        size: meta.len() as i64,
        atime,
        ctime,
        mtime,
        uid: Some(uid),
        gid: Some(gid),
        nblocks: Some(nblocks),
        nlink: Some(nlink),
        mode: Some(mode),
        ldest,
        sha1: None,
        ratio: None,
    }
}

/// Builds the full row for `path`, hashing regular files (symlinks and
/// other non-regular entries get a `None` sha1, per the original schema's
/// "SHA will be NULL if we are seeing a symlink").
fn full_item(path: &Path, meta: &fs::Metadata, chunk_size: usize) -> std::io::Result<FsItem> {
    let mut item = stat_only_item(path, meta);
    if meta.is_file() {
        let (sha1, ratio) = hash_and_ratio(path, chunk_size)?;
        item.sha1 = Some(sha1);
        item.ratio = Some(ratio);
    }
    Ok(item)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlStats {
    pub files: usize,
    pub commits: usize,
}

/// Initial crawl (spec §4.11): walks `root` recursively, streaming and
/// hashing every regular file and recording every symlink, committing in
/// batches bounded by record count or elapsed time.
pub fn crawl(
    store: &mut InventoryStore,
    root: &Path,
    chunk_size: usize,
    batch_records: usize,
    batch_time: Duration,
) -> Result<CrawlStats, InventoryError> {
    let mut stats = CrawlStats::default();
    let mut pending = Vec::new();
    let mut batch_start = Instant::now();

    walk_recursive(root, &mut |path, meta| {
        let item = full_item(path, meta, chunk_size)?;
        stats.files += 1;
        pending.push(item);
        if pending.len() >= batch_records || batch_start.elapsed() >= batch_time {
            store.insert_batch(&pending)?;
            stats.commits += 1;
            pending.clear();
            batch_start = Instant::now();
        }
        Ok(())
    })?;

    if !pending.is_empty() {
        store.insert_batch(&pending)?;
        stats.commits += 1;
    }
    Ok(stats)
}

fn walk_recursive(
    dir: &Path,
    visit: &mut impl FnMut(&Path, &fs::Metadata) -> Result<(), InventoryError>,
) -> Result<(), InventoryError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            walk_recursive(&path, visit)?;
        } else {
            visit(&path, &meta)?;
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FastUpdateStats {
    pub deleted: usize,
    pub rehashed: usize,
    pub restated: usize,
}

/// Fast update (spec §4.11): pulls the latest row per path in windows,
/// comparing stat facts against the filesystem. A size change triggers a
/// fresh hash; any other change re-stats and carries the prior hash
/// forward; a failed `stat` appends a deletion row.
pub fn fast_update(store: &mut InventoryStore, chunk_size: usize) -> Result<FastUpdateStats, InventoryError> {
    let mut stats = FastUpdateStats::default();
    let mut offset = 0i64;
    loop {
        let window = store.window(offset, WINDOW_SIZE)?;
        if window.is_empty() {
            break;
        }
        let window_len = window.len() as i64;
        let mut updates = Vec::new();

        for item in &window {
            let path = match &item.path {
                Some(p) => p,
                None => continue,
            };
            if item.is_deleted() {
                continue;
            }
            match fs::symlink_metadata(path) {
                Err(_) => {
                    let mut deletion = item.clone();
                    deletion.id = 0;
                    deletion.size = DELETED_SIZE;
                    updates.push(deletion);
                    stats.deleted += 1;
                }
                Ok(meta) => {
                    let stat_only = stat_only_item(path, &meta);
                    if stat_changed(item, &stat_only) {
                        if meta.len() as i64 != item.size {
                            let mut fresh = full_item(path, &meta, chunk_size)?;
                            fresh.id = 0;
                            updates.push(fresh);
                            stats.rehashed += 1;
                        } else {
                            let mut carried = stat_only;
                            carried.sha1 = item.sha1;
                            carried.ratio = item.ratio;
                            updates.push(carried);
                            stats.restated += 1;
                        }
                    }
                }
            }
        }

        if !updates.is_empty() {
            store.insert_batch(&updates)?;
        }
        offset += window_len;
        if window_len < WINDOW_SIZE {
            break;
        }
    }
    Ok(stats)
}

fn stat_changed(prior: &FsItem, fresh: &FsItem) -> bool {
    prior.mtime != fresh.mtime
        || prior.size != fresh.size
        || prior.uid != fresh.uid
        || prior.gid != fresh.gid
        || prior.mode != fresh.mode
        || prior.nlink != fresh.nlink
        || prior.ldest != fresh.ldest
}

/// Added-file discovery (spec §4.11): for each directory the crawl visited,
/// compares its known (non-deleted) entries against the live listing and
/// inserts anything new, recursing into new subdirectories.
pub fn discover_added(
    store: &mut InventoryStore,
    visited_dirs: &BTreeSet<PathBuf>,
    chunk_size: usize,
) -> Result<usize, InventoryError> {
    let mut inserted = 0;
    for dir in visited_dirs {
        let known = store.known_children(dir)?;
        let actual: BTreeSet<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => continue,
        };
        for new_path in actual.difference(&known) {
            let meta = match fs::symlink_metadata(new_path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                let mut pending = Vec::new();
                walk_recursive(new_path, &mut |path, meta| {
                    pending.push(full_item(path, meta, chunk_size)?);
                    Ok(())
                })?;
                inserted += pending.len();
                if !pending.is_empty() {
                    store.insert_batch(&pending)?;
                }
            } else {
                let item = full_item(new_path, &meta, chunk_size)?;
                store.insert_batch(&[item])?;
                inserted += 1;
            }
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn sha1_of(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    #[test]
    fn crawl_hashes_files_and_commits_in_batches() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"nested contents").unwrap();

        let mut store = InventoryStore::open_in_memory().unwrap();
        let stats = crawl(&mut store, dir.path(), 4096, 1, Duration::from_secs(30)).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.commits, 2);
        assert_eq!(store.row_count().unwrap(), 2);

        let window = store.window(0, 10).unwrap();
        let a = window.iter().find(|i| i.path.as_deref() == Some(Path::new(dir.path().join("a.txt").as_path()))).unwrap();
        assert_eq!(a.sha1, Some(sha1_of(b"hello world")));
        assert!(a.ratio.unwrap() > 0.0);
    }

    #[test]
    fn fast_update_detects_resize_and_deletion() {
        let dir = tempdir().unwrap();
        let keep = dir.path().join("keep.txt");
        let remove = dir.path().join("remove.txt");
        fs::write(&keep, b"short").unwrap();
        fs::write(&remove, b"will be deleted").unwrap();

        let mut store = InventoryStore::open_in_memory().unwrap();
        crawl(&mut store, dir.path(), 4096, 100, Duration::from_secs(30)).unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        {
            let mut f = fs::OpenOptions::new().write(true).open(&keep).unwrap();
            f.write_all(b"a much longer replacement body").unwrap();
        }
        fs::remove_file(&remove).unwrap();

        let stats = fast_update(&mut store, 4096).unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.rehashed, 1);

        let window = store.window(0, 10).unwrap();
        let removed_row = window.iter().find(|i| i.path.as_deref() == Some(remove.as_path())).unwrap();
        assert!(removed_row.is_deleted());
        assert_eq!(removed_row.sha1, Some(sha1_of(b"will be deleted")));

        let kept_row = window.iter().find(|i| i.path.as_deref() == Some(keep.as_path())).unwrap();
        assert_eq!(kept_row.sha1, Some(sha1_of(b"a much longer replacement body")));
    }

    #[test]
    fn fast_update_carries_hash_forward_on_metadata_only_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"stable body").unwrap();

        let mut store = InventoryStore::open_in_memory().unwrap();
        crawl(&mut store, dir.path(), 4096, 100, Duration::from_secs(30)).unwrap();
        let original_sha1 = store.window(0, 10).unwrap()[0].sha1;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = fs::metadata(&path).unwrap().permissions();
            perm.set_mode(0o600);
            fs::set_permissions(&path, perm).unwrap();
        }

        let stats = fast_update(&mut store, 4096).unwrap();
        assert_eq!(stats.rehashed, 0);

        let row = &store.window(0, 10).unwrap()[0];
        assert_eq!(row.sha1, original_sha1);
    }

    #[test]
    fn dedup_keeps_only_the_newest_row_per_path() {
        let mut store = InventoryStore::open_in_memory().unwrap();
        let base = FsItem {
            id: 0,
            path: Some(PathBuf::from("/a")),
            size: 1,
            atime: None,
            ctime: None,
            mtime: None,
            uid: None,
            gid: None,
            nblocks: None,
            nlink: None,
            mode: None,
            ldest: None,
            sha1: None,
            ratio: None,
        };
        store.insert_batch(&[base.clone()]).unwrap();
        let mut newer = base.clone();
        newer.size = 2;
        store.insert_batch(&[newer]).unwrap();
        assert_eq!(store.row_count().unwrap(), 2);

        let deleted = store.dedup().unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.row_count().unwrap(), 1);
        let rows = store.window(0, 10).unwrap();
        assert_eq!(rows[0].size, 2);
    }

    #[test]
    fn merge_imports_rows_with_reassigned_ids() {
        let mut a = InventoryStore::open_in_memory().unwrap();
        let mut b = InventoryStore::open_in_memory().unwrap();
        let item = FsItem {
            id: 0,
            path: Some(PathBuf::from("/from/b")),
            size: 10,
            atime: None,
            ctime: None,
            mtime: None,
            uid: None,
            gid: None,
            nblocks: None,
            nlink: None,
            mode: None,
            ldest: None,
            sha1: None,
            ratio: None,
        };
        b.insert_batch(&[item]).unwrap();
        a.insert_batch(&[FsItem { path: Some(PathBuf::from("/from/a")), ..FsItem {
            id: 0, path: None, size: 5, atime: None, ctime: None, mtime: None, uid: None, gid: None,
            nblocks: None, nlink: None, mode: None, ldest: None, sha1: None, ratio: None,
        } }]).unwrap();

        let imported = a.merge_from(&b).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(a.row_count().unwrap(), 2);
    }

    #[test]
    fn discover_added_finds_new_files_in_visited_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("existing.txt"), b"old").unwrap();

        let mut store = InventoryStore::open_in_memory().unwrap();
        crawl(&mut store, dir.path(), 4096, 100, Duration::from_secs(30)).unwrap();

        fs::write(dir.path().join("new.txt"), b"fresh").unwrap();
        let mut visited = BTreeSet::new();
        visited.insert(dir.path().to_path_buf());

        let inserted = discover_added(&mut store, &visited, 4096).unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.row_count().unwrap(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn insert_batch_quarantines_non_utf8_paths_and_sweep_removes_them() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut store = InventoryStore::open_in_memory().unwrap();
        let bad_bytes = [0x66, 0x6f, 0xff, 0x6f]; // "fo\xFFo" - invalid UTF-8
        let bad_path = PathBuf::from(OsStr::from_bytes(&bad_bytes));
        let good = FsItem {
            id: 0,
            path: Some(PathBuf::from("/ok/path")),
            size: 1,
            atime: None,
            ctime: None,
            mtime: None,
            uid: None,
            gid: None,
            nblocks: None,
            nlink: None,
            mode: None,
            ldest: None,
            sha1: None,
            ratio: None,
        };
        let mut bad = good.clone();
        bad.path = Some(bad_path);

        let inserted = store.insert_batch(&[good, bad]).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.row_count().unwrap(), 2);

        let swept = store.sweep_null_paths().unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.row_count().unwrap(), 1);
    }
}

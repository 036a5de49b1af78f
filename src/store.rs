//! ZFS State Store (spec §4.3, C3): a `rusqlite`-backed relational mirror of
//! per-host pool/dataset inventories, grounded in the `Store`/connection
//! wrapper shape of `ah-local-db` (`blocksense-network-agent-harbor`) and the
//! exact column set of `original_source/src/python/zfs/sql/orm.py`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{NotFoundError, StoreError};
use crate::model::{Dataset, Pool};
use crate::url::ZFSURL;

/// Entities are deleted in batches this large, to avoid oversized `DELETE`
/// statements against hosts with very large fleets (spec §4.3 step 2).
const DELETE_CHUNK_SIZE: usize = 50;

pub struct Store {
    conn: Connection,
}

pub enum Looked {
    Pool(Pool),
    Dataset(Dataset),
}

impl Store {
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pool (
                host TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                free INTEGER NOT NULL,
                alloc INTEGER NOT NULL,
                cap REAL NOT NULL,
                health TEXT NOT NULL,
                dedup_ratio REAL NOT NULL,
                version TEXT NOT NULL,
                feature_flags TEXT NOT NULL,
                read_only INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (host, name)
            );
            CREATE TABLE IF NOT EXISTS dataset (
                host TEXT NOT NULL,
                name TEXT NOT NULL,
                dataset_type TEXT NOT NULL,
                creation TEXT NOT NULL,
                used INTEGER NOT NULL,
                avail INTEGER,
                refer INTEGER NOT NULL,
                compress_ratio REAL NOT NULL,
                quota INTEGER,
                reservation INTEGER,
                usedds INTEGER NOT NULL,
                usedchild INTEGER NOT NULL,
                usedsnap INTEGER NOT NULL,
                compression TEXT NOT NULL,
                zfs_priority INTEGER,
                zfs_receive_url TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (host, name)
            );
            ",
        )?;
        Ok(())
    }

    /// Upsert every supplied pool for `host`, then delete the set difference
    /// (spec §4.3: sync). Refuses to delete anything when `pools` is empty.
    pub fn sync_pools(&mut self, host: &str, pools: &[Pool]) -> Result<(), StoreError> {
        if pools.is_empty() {
            log::warn!("refusing empty pool sync for host {host}; no rows will be deleted");
            return Err(StoreError::EmptySync(host.to_string()));
        }

        let now = Utc::now();
        let tx = self.conn.transaction()?;
        for pool in pools {
            tx.execute(
                "INSERT INTO pool (host, name, size, free, alloc, cap, health, dedup_ratio, version, feature_flags, read_only, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(host, name) DO UPDATE SET
                    size=excluded.size, free=excluded.free, alloc=excluded.alloc, cap=excluded.cap,
                    health=excluded.health, dedup_ratio=excluded.dedup_ratio, version=excluded.version,
                    feature_flags=excluded.feature_flags, read_only=excluded.read_only, updated_at=excluded.updated_at",
                params![
                    host, pool.name, pool.size as i64, pool.free as i64, pool.alloc as i64, pool.cap,
                    pool.health, pool.dedup_ratio, pool.version, pool.feature_flags, pool.read_only, now.to_rfc3339(),
                ],
            )?;
        }

        let supplied: HashSet<String> = pools.iter().map(|p| p.name.clone()).collect();
        let mut existing_stmt = tx.prepare("SELECT name FROM pool WHERE host = ?1")?;
        let existing: Vec<String> = existing_stmt
            .query_map(params![host], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(existing_stmt);

        let to_delete: Vec<&String> = existing.iter().filter(|n| !supplied.contains(*n)).collect();
        for chunk in to_delete.chunks(DELETE_CHUNK_SIZE) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM pool WHERE host = ? AND name IN ({placeholders})");
            let mut stmt = tx.prepare(&sql)?;
            let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&host];
            for name in chunk {
                bind.push(*name as &dyn rusqlite::ToSql);
            }
            stmt.execute(bind.as_slice())?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn sync_datasets(&mut self, host: &str, datasets: &[Dataset]) -> Result<(), StoreError> {
        if datasets.is_empty() {
            log::warn!("refusing empty dataset sync for host {host}; no rows will be deleted");
            return Err(StoreError::EmptySync(host.to_string()));
        }

        let now = Utc::now();
        let tx = self.conn.transaction()?;
        for ds in datasets {
            tx.execute(
                "INSERT INTO dataset (host, name, dataset_type, creation, used, avail, refer, compress_ratio, quota, reservation, usedds, usedchild, usedsnap, compression, zfs_priority, zfs_receive_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(host, name) DO UPDATE SET
                    dataset_type=excluded.dataset_type, creation=excluded.creation, used=excluded.used,
                    avail=excluded.avail, refer=excluded.refer, compress_ratio=excluded.compress_ratio,
                    quota=excluded.quota, reservation=excluded.reservation, usedds=excluded.usedds,
                    usedchild=excluded.usedchild, usedsnap=excluded.usedsnap, compression=excluded.compression,
                    zfs_priority=excluded.zfs_priority, zfs_receive_url=excluded.zfs_receive_url,
                    updated_at=excluded.updated_at",
                params![
                    host, ds.name, ds.dataset_type, ds.creation.to_rfc3339(), ds.used as i64,
                    ds.avail.map(|a| a as i64), ds.refer as i64, ds.compress_ratio,
                    ds.quota.map(|q| q as i64), ds.reservation.map(|r| r as i64),
                    ds.usedds as i64, ds.usedchild as i64, ds.usedsnap as i64, ds.compression,
                    ds.zfs_priority, ds.zfs_receive_url, now.to_rfc3339(),
                ],
            )?;
        }

        let supplied: HashSet<String> = datasets.iter().map(|d| d.name.clone()).collect();
        let mut existing_stmt = tx.prepare("SELECT name FROM dataset WHERE host = ?1")?;
        let existing: Vec<String> = existing_stmt
            .query_map(params![host], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(existing_stmt);

        let to_delete: Vec<&String> = existing.iter().filter(|n| !supplied.contains(*n)).collect();
        for chunk in to_delete.chunks(DELETE_CHUNK_SIZE) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM dataset WHERE host = ? AND name IN ({placeholders})");
            let mut stmt = tx.prepare(&sql)?;
            let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&host];
            for name in chunk {
                bind.push(*name as &dyn rusqlite::ToSql);
            }
            stmt.execute(bind.as_slice())?;
        }

        tx.commit()?;
        Ok(())
    }

    fn row_to_dataset(row: &rusqlite::Row) -> rusqlite::Result<Dataset> {
        let creation: String = row.get("creation")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(Dataset {
            host: row.get("host")?,
            name: row.get("name")?,
            dataset_type: row.get("dataset_type")?,
            creation: DateTime::parse_from_rfc3339(&creation).unwrap().with_timezone(&Utc),
            used: row.get::<_, i64>("used")? as u64,
            avail: row.get::<_, Option<i64>>("avail")?.map(|v| v as u64),
            refer: row.get::<_, i64>("refer")? as u64,
            compress_ratio: row.get("compress_ratio")?,
            quota: row.get::<_, Option<i64>>("quota")?.map(|v| v as u64),
            reservation: row.get::<_, Option<i64>>("reservation")?.map(|v| v as u64),
            usedds: row.get::<_, i64>("usedds")? as u64,
            usedchild: row.get::<_, i64>("usedchild")? as u64,
            usedsnap: row.get::<_, i64>("usedsnap")? as u64,
            compression: row.get("compression")?,
            zfs_priority: row.get("zfs_priority")?,
            zfs_receive_url: row.get("zfs_receive_url")?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
        })
    }

    fn row_to_pool(row: &rusqlite::Row) -> rusqlite::Result<Pool> {
        let updated_at: String = row.get("updated_at")?;
        Ok(Pool {
            host: row.get("host")?,
            name: row.get("name")?,
            size: row.get::<_, i64>("size")? as u64,
            free: row.get::<_, i64>("free")? as u64,
            alloc: row.get::<_, i64>("alloc")? as u64,
            cap: row.get("cap")?,
            health: row.get("health")?,
            dedup_ratio: row.get("dedup_ratio")?,
            version: row.get("version")?,
            feature_flags: row.get("feature_flags")?,
            read_only: row.get("read_only")?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
        })
    }

    pub fn find_dataset(&self, host: &str, name: &str) -> Result<Option<Dataset>, StoreError> {
        self.conn
            .query_row(
                "SELECT * FROM dataset WHERE host = ?1 AND name = ?2",
                params![host, name],
                Self::row_to_dataset,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn find_pool(&self, host: &str, name: &str) -> Result<Option<Pool>, StoreError> {
        self.conn
            .query_row(
                "SELECT * FROM pool WHERE host = ?1 AND name = ?2",
                params![host, name],
                Self::row_to_pool,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Given a ZFSURL, return the matching Pool or Dataset (spec §4.3).
    /// `force_dataset` biases a pool-URL to its mirror Dataset row.
    pub fn lookup_by_url(&self, url: &ZFSURL, force_dataset: bool) -> Result<Looked, StoreError> {
        if url.is_pool_filesystem() && !force_dataset && !url.is_snapshot() {
            if let Some(pool) = self.find_pool(url.host(), url.pool())? {
                return Ok(Looked::Pool(pool));
            }
        }
        self.find_dataset(url.host(), &url.name())?
            .map(Looked::Dataset)
            .ok_or_else(|| NotFoundError::Url(url.to_string()).into())
    }

    /// The immediate parent filesystem, URL-derived (spec §4.3).
    pub fn parent(&self, ds: &Dataset) -> Result<Option<Dataset>, StoreError> {
        match ds.parent_name() {
            Some(parent) => self.find_dataset(&ds.host, &parent),
            None => Ok(None),
        }
    }

    /// Immediate (one path-depth) children filesystems only, not snapshots.
    pub fn children(&self, ds: &Dataset) -> Result<Vec<Dataset>, StoreError> {
        let prefix = format!("{}/", ds.filesystem_name());
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM dataset WHERE host = ?1 AND avail IS NOT NULL AND name LIKE ?2")?;
        let like = format!("{prefix}%");
        let rows = stmt.query_map(params![ds.host, like], Self::row_to_dataset)?;
        let mut out = Vec::new();
        for row in rows {
            let candidate = row?;
            let rest = &candidate.name[prefix.len()..];
            if !rest.contains('/') {
                out.push(candidate);
            }
        }
        Ok(out)
    }

    /// Every descendant filesystem (not snapshots) under `pool_name` on
    /// `host`, at any depth (spec §1 item 3 reservation/quota calculator).
    pub fn children_recursive(&self, host: &str, pool_name: &str) -> Result<Vec<Dataset>, StoreError> {
        let prefix = format!("{pool_name}/");
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM dataset WHERE host = ?1 AND avail IS NOT NULL AND name LIKE ?2")?;
        let like = format!("{prefix}%");
        let rows = stmt.query_map(params![host, like], Self::row_to_dataset)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    /// Snapshots of `ds`, ascending by creation time.
    pub fn snapshots(&self, ds: &Dataset) -> Result<Vec<Dataset>, StoreError> {
        let prefix = format!("{}@", ds.filesystem_name());
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM dataset WHERE host = ?1 AND avail IS NULL AND name LIKE ?2 ORDER BY creation ASC")?;
        let like = format!("{prefix}%");
        let rows = stmt.query_map(params![ds.host, like], Self::row_to_dataset)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub fn latest_snapshot(&self, ds: &Dataset) -> Result<Option<Dataset>, StoreError> {
        Ok(self.snapshots(ds)?.into_iter().last())
    }

    pub fn pool(&self, ds: &Dataset) -> Result<Option<Pool>, StoreError> {
        self.find_pool(&ds.host, ds.pool_name())
    }

    /// `is_compressed()`: true iff `compress != 'off'`; snapshots defer to
    /// their parent filesystem (spec §4.3).
    pub fn is_compressed(&self, ds: &Dataset) -> Result<bool, StoreError> {
        if !ds.is_snapshot() {
            return Ok(ds.is_compressed());
        }
        match self.parent(ds)? {
            Some(parent) => Ok(parent.is_compressed()),
            None => Ok(ds.is_compressed()),
        }
    }

    /// Existing filesystems (not snapshots) on hosts other than `exclude_host`
    /// whose basename matches `basename`, ordered by `avail` descending
    /// (spec §4.5 candidate enumeration).
    /// Every non-snapshot dataset across the whole fleet (spec §4.6
    /// duplication report: the candidate set handed to `duplication::generate`).
    pub fn all_filesystems(&self) -> Result<Vec<Dataset>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT * FROM dataset WHERE avail IS NOT NULL")?;
        let rows = stmt.query_map([], Self::row_to_dataset)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub fn datasets_by_basename(&self, exclude_host: &str, basename: &str) -> Result<Vec<Dataset>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM dataset WHERE host != ?1 AND avail IS NOT NULL")?;
        let rows = stmt.query_map(params![exclude_host], Self::row_to_dataset)?;
        let mut out = Vec::new();
        for row in rows {
            let ds = row?;
            if ds.filesystem_name().rsplit('/').next() == Some(basename) {
                out.push(ds);
            }
        }
        out.sort_by(|a, b| b.avail.cmp(&a.avail));
        Ok(out)
    }

    /// All pools on hosts other than `exclude_host` (spec §4.5 candidate
    /// enumeration).
    pub fn pools_excluding_host(&self, exclude_host: &str) -> Result<Vec<Pool>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT * FROM pool WHERE host != ?1")?;
        let rows = stmt.query_map(params![exclude_host], Self::row_to_pool)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    /// True iff the named custom property's value equals the parent's value
    /// (spec §4.3 `property_is_inherited`). Only `zfs_receive_url` and
    /// `zfs_priority` are modeled as first-class columns.
    pub fn property_is_inherited(&self, ds: &Dataset, name: &str) -> Result<bool, StoreError> {
        let parent = match self.parent(ds)? {
            Some(p) => p,
            None => return Ok(false),
        };
        Ok(match name {
            "zfs_receive_url" => ds.zfs_receive_url == parent.zfs_receive_url,
            "zfs_priority" => ds.zfs_priority == parent.zfs_priority,
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> Pool {
        Pool {
            host: "h1".into(),
            name: name.into(),
            size: 1000,
            free: 500,
            alloc: 500,
            cap: 50.0,
            health: "ONLINE".into(),
            dedup_ratio: 1.0,
            version: "5000".into(),
            feature_flags: "".into(),
            read_only: false,
            updated_at: Utc::now(),
        }
    }

    fn dataset(name: &str, avail: Option<u64>, receive_url: Option<&str>) -> Dataset {
        Dataset {
            host: "h1".into(),
            name: name.into(),
            dataset_type: "filesystem".into(),
            creation: Utc::now(),
            used: 10,
            avail,
            refer: 10,
            compress_ratio: 1.0,
            quota: None,
            reservation: None,
            usedds: 0,
            usedchild: 0,
            usedsnap: 0,
            compression: "lz4".into(),
            zfs_priority: None,
            zfs_receive_url: receive_url.map(|s| s.to_string()),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sync_exactness_and_refusal() {
        let mut store = Store::open_in_memory().unwrap();
        store.sync_pools("h1", &[pool("tank")]).unwrap();
        assert!(store.find_pool("h1", "tank").unwrap().is_some());

        assert!(matches!(store.sync_pools("h1", &[]), Err(StoreError::EmptySync(_))));
        assert!(store.find_pool("h1", "tank").unwrap().is_some());

        store.sync_pools("h1", &[pool("tank2")]).unwrap();
        assert!(store.find_pool("h1", "tank").unwrap().is_none());
        assert!(store.find_pool("h1", "tank2").unwrap().is_some());
    }

    #[test]
    fn traversal_helpers() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .sync_datasets(
                "h1",
                &[
                    dataset("tank", Some(100), None),
                    dataset("tank/fs", Some(50), Some("zfs://h2/tank2/")),
                    dataset("tank/fs/sub", Some(20), Some("zfs://h2/tank2/")),
                    dataset("tank/fs@snap1", None, None),
                ],
            )
            .unwrap();

        let fs = store.find_dataset("h1", "tank/fs").unwrap().unwrap();
        let children = store.children(&fs).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "tank/fs/sub");

        let snaps = store.snapshots(&fs).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(store.latest_snapshot(&fs).unwrap().unwrap().name, "tank/fs@snap1");

        let parent = store.parent(&fs).unwrap().unwrap();
        assert_eq!(parent.name, "tank");

        let sub = store.find_dataset("h1", "tank/fs/sub").unwrap().unwrap();
        assert!(store.property_is_inherited(&sub, "zfs_receive_url").unwrap());
    }

    #[test]
    fn lookup_by_url_pool_vs_force_dataset() {
        let mut store = Store::open_in_memory().unwrap();
        store.sync_pools("h1", &[pool("tank")]).unwrap();
        store.sync_datasets("h1", &[dataset("tank", Some(100), None)]).unwrap();

        let url = ZFSURL::parse("zfs://h1/tank/").unwrap();
        assert!(matches!(store.lookup_by_url(&url, false).unwrap(), Looked::Pool(_)));
        assert!(matches!(store.lookup_by_url(&url, true).unwrap(), Looked::Dataset(_)));
    }
}

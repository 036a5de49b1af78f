//! Persisted entities (spec §3.1, C3): `Pool` and `Dataset` rows, mirroring
//! the column set of `original_source/src/python/zfs/sql/orm.py`'s
//! `ZPool`/`ZDataset`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    pub host: String,
    pub name: String,
    pub size: u64,
    pub free: u64,
    pub alloc: u64,
    pub cap: f64,
    pub health: String,
    pub dedup_ratio: f64,
    pub version: String,
    pub feature_flags: String,
    pub read_only: bool,
    pub updated_at: DateTime<Utc>,
}

/// `avail IS NULL` uniquely identifies a snapshot (spec §3.2).
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub host: String,
    /// Includes pool prefix and optional `@snapshot`.
    pub name: String,
    pub dataset_type: String,
    pub creation: DateTime<Utc>,
    pub used: u64,
    pub avail: Option<u64>,
    pub refer: u64,
    pub compress_ratio: f64,
    pub quota: Option<u64>,
    pub reservation: Option<u64>,
    pub usedds: u64,
    pub usedchild: u64,
    pub usedsnap: u64,
    pub compression: String,
    pub zfs_priority: Option<i64>,
    pub zfs_receive_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    pub fn is_snapshot(&self) -> bool {
        self.avail.is_none()
    }

    /// Immediate filesystem path, with the `@snapshot` suffix (if any) removed.
    pub fn filesystem_name(&self) -> &str {
        self.name.split('@').next().unwrap_or(&self.name)
    }

    pub fn pool_name(&self) -> &str {
        self.filesystem_name().split('/').next().unwrap_or(&self.name)
    }

    /// Immediate parent filesystem's name, or `None` at the pool root.
    pub fn parent_name(&self) -> Option<String> {
        let fs = self.filesystem_name();
        let (parent, _) = fs.rsplit_once('/')?;
        Some(parent.to_string())
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str, avail: Option<u64>) -> Dataset {
        Dataset {
            host: "h1".into(),
            name: name.into(),
            dataset_type: "filesystem".into(),
            creation: Utc::now(),
            used: 0,
            avail,
            refer: 0,
            compress_ratio: 1.0,
            quota: None,
            reservation: None,
            usedds: 0,
            usedchild: 0,
            usedsnap: 0,
            compression: "lz4".into(),
            zfs_priority: None,
            zfs_receive_url: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_detection_follows_avail() {
        assert!(ds("tank/fs@snap", None).is_snapshot());
        assert!(!ds("tank/fs", Some(100)).is_snapshot());
    }

    #[test]
    fn parent_and_pool_names() {
        let d = ds("tank/a/b@snap", None);
        assert_eq!(d.filesystem_name(), "tank/a/b");
        assert_eq!(d.pool_name(), "tank");
        assert_eq!(d.parent_name(), Some("tank/a".to_string()));

        let root = ds("tank", Some(1));
        assert_eq!(root.parent_name(), None);
    }
}

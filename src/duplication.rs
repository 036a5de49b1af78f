//! Duplication report (spec §2 C6, supplemented per `SPEC_FULL.md` §3):
//! groups leaf filesystems across hosts by basename to flag likely-redundant
//! copies, grounded in
//! `original_source/src/python/zfs/sql/reports/duplication.py`'s
//! `ZDuplicationReportGenerator`.

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::model::Dataset;
use crate::report::{Column, Reducer, Report, Value};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct DuplicationGroup {
    pub basename: String,
    pub master: Dataset,
    /// Each shadow copy with its equivalence to `master` in `[0.0, 1.0]`,
    /// and the latest snapshot name in common (if any).
    pub copies: Vec<(Dataset, f64, Option<String>)>,
}

impl DuplicationGroup {
    pub fn num_copies(&self) -> usize {
        self.copies.len() + 1
    }
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Equivalence of `shadow` against `master`: `1.0` if their latest snapshots
/// match; otherwise the fraction of `master`'s snapshot history (by elapsed
/// time) still represented in `shadow`; `0.0` with no snapshot in common.
fn compute_equivalence(master_snapshots: &[Dataset], shadow: &Store, shadow_ds: &Dataset) -> Result<(f64, Option<String>), StoreError> {
    let master_names: Vec<&str> = master_snapshots
        .iter()
        .filter_map(|s| s.name.split('@').nth(1))
        .collect();

    let shadow_snaps = shadow.snapshots(shadow_ds)?;
    let mut index: Option<usize> = None;
    for ss in shadow_snaps.iter().rev() {
        if let Some(snap_name) = ss.name.split('@').nth(1) {
            if let Some(pos) = master_names.iter().position(|n| *n == snap_name) {
                index = Some(pos);
                break;
            }
        }
    }

    let Some(index) = index else {
        return Ok((0.0, None));
    };

    let matched = &master_snapshots[index];
    let matched_name = matched.name.split('@').nth(1).map(|s| s.to_string());

    if index + 1 == master_snapshots.len() {
        return Ok((1.0, matched_name));
    }

    let total_time = (master_snapshots.last().unwrap().creation - master_snapshots[0].creation)
        .num_seconds()
        .max(1);
    let missing_time = (master_snapshots.last().unwrap().creation - matched.creation).num_seconds();
    let equivalence = (total_time - missing_time) as f64 / total_time as f64;
    Ok((equivalence, matched_name))
}

/// Groups leaf filesystems (no children, not the pool-filesystem) matching
/// `name_like` by basename; the oldest filesystem in a group is the master.
/// Groups below `min_copies` or `ignore_smaller_than` are omitted.
pub fn generate(
    store: &Store,
    candidates: Vec<Dataset>,
    min_copies: usize,
    ignore_smaller_than: u64,
) -> Result<Vec<DuplicationGroup>, StoreError> {
    let mut by_basename: BTreeMap<String, Vec<Dataset>> = BTreeMap::new();
    for ds in candidates {
        if ds.is_snapshot() {
            continue;
        }
        if !store.children(&ds)?.is_empty() {
            continue;
        }
        by_basename
            .entry(basename(ds.filesystem_name()).to_string())
            .or_default()
            .push(ds);
    }

    let mut out = Vec::new();
    for (basename, mut filesystems) in by_basename {
        filesystems.sort_by_key(|d| d.creation);
        if filesystems.len() < 2 {
            continue;
        }
        let master = filesystems.remove(0);
        if (filesystems.len() + 1) < min_copies || master.used < ignore_smaller_than {
            continue;
        }

        let master_snaps = store.snapshots(&master)?;
        let mut copies = Vec::new();
        for shadow in filesystems {
            let (equivalence, common) = compute_equivalence(&master_snaps, store, &shadow)?;
            copies.push((shadow, equivalence, common));
        }
        out.push(DuplicationGroup { basename, master, copies });
    }

    out.sort_by_key(|g| std::cmp::Reverse(g.num_copies()));
    Ok(out)
}

pub fn report_schema() -> Vec<Column> {
    vec![
        Column::new("url"),
        Column::with_reducer("copies", Reducer::Sum),
        Column::new("equivalence"),
        Column::new("common_ss"),
        Column::with_reducer("used", Reducer::Sum),
    ]
}

pub fn to_report(groups: &[DuplicationGroup]) -> Report {
    let mut rep = Report::new(report_schema());
    for g in groups {
        rep.push(vec![
            Value::Str(g.master.name.clone()),
            Value::Int(g.num_copies() as i64),
            Value::Str("-".into()),
            Value::Str("-".into()),
            Value::Int(g.master.used as i64),
        ]);
        for (copy, equivalence, common) in &g.copies {
            rep.push(vec![
                Value::Str(copy.name.clone()),
                Value::Int(1),
                Value::Float(equivalence * 100.0),
                Value::Str(common.clone().unwrap_or_else(|| "-".into())),
                Value::Int(copy.used as i64),
            ]);
        }
    }
    rep
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn ds(host: &str, name: &str, created_offset: i64, used: u64) -> Dataset {
        Dataset {
            host: host.into(),
            name: name.into(),
            dataset_type: "filesystem".into(),
            creation: Utc::now() - Duration::seconds(created_offset),
            used,
            avail: Some(1000),
            refer: used,
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
    fn groups_leaf_filesystems_by_basename_oldest_is_master() {
        let mut store = Store::open_in_memory().unwrap();
        let master = ds("h1", "tank/webdata", 1000, 500);
        let copy = ds("h2", "tank2/webdata", 500, 500);
        store.sync_datasets("h1", &[master.clone()]).unwrap();
        store.sync_datasets("h2", &[copy.clone()]).unwrap();

        let groups = generate(&store, vec![master, copy], 0, 0).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].master.host, "h1");
        assert_eq!(groups[0].num_copies(), 2);
    }

    #[test]
    fn no_snapshots_in_common_yields_zero_equivalence() {
        let mut store = Store::open_in_memory().unwrap();
        let master = ds("h1", "tank/webdata", 1000, 500);
        let copy = ds("h2", "tank2/webdata", 500, 500);
        store.sync_datasets("h1", &[master.clone()]).unwrap();
        store.sync_datasets("h2", &[copy.clone()]).unwrap();

        let groups = generate(&store, vec![master, copy], 0, 0).unwrap();
        assert_eq!(groups[0].copies[0].1, 0.0);
        assert_eq!(groups[0].copies[0].2, None);
    }
}

//! Reservation/quota calculator (spec §1 item 3, §2 C3 share): distributes a
//! pool's free space across its priority-tagged filesystems (spec §3.1
//! `zfs_priority`), grounded in
//! `original_source/src/python/zfs/sql/reports/reserve.py`'s
//! `ZReserveReportGenerator`. Supplemented feature per `SPEC_FULL.md` §3.

use crate::error::StoreError;
use crate::model::{Dataset, Pool};
use crate::report::{Column, Reducer, Report, Value};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveMode {
    Quota,
    Reservation,
}

#[derive(Debug, Clone)]
pub struct ReserveConfig {
    pub mode: ReserveMode,
    /// Percentage of pool size to distribute; mutually exclusive with
    /// `distribute_space`.
    pub max_cap: Option<f64>,
    /// Absolute bytes to distribute; mutually exclusive with `max_cap`.
    pub distribute_space: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReserveRecord {
    pub dataset: Dataset,
    pub priority: i64,
    pub used: u64,
    pub reserved: u64,
}

/// Computes, for every filesystem under `pool` carrying a non-inherited
/// `zfs_priority`, a proportional share of `config`'s distributable space
/// (never below the filesystem's current usage is NOT enforced here — the
/// reference generator surfaces under-reservation as a warning in the fix
/// script instead, see `fix_script_comment`).
pub fn compute(store: &Store, pool: &Pool, config: &ReserveConfig) -> Result<Vec<ReserveRecord>, StoreError> {
    if config.max_cap.is_some() && config.distribute_space.is_some() {
        return Err(StoreError::EmptySync(
            "specify either max_cap or distribute_space, not both".to_string(),
        ));
    }

    let mut candidates = Vec::new();
    for fs in store.children_recursive(&pool.host, &pool.name)? {
        if fs.is_snapshot() || fs.zfs_priority.is_none() {
            continue;
        }
        if store.property_is_inherited(&fs, "zfs_priority")? {
            continue;
        }
        candidates.push(fs);
    }

    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let total_parts: i64 = candidates.iter().filter_map(|d| d.zfs_priority).sum();
    let total_alloc = match (config.distribute_space, config.max_cap) {
        (Some(bytes), None) => bytes as f64,
        (None, Some(pct)) => pool.size as f64 * (pct / 100.0),
        _ => pool.size as f64 * 0.8,
    };

    let mut out = Vec::new();
    for fs in candidates {
        let prio = fs.zfs_priority.unwrap_or(0);
        let reserve = if total_parts == 0 {
            0.0
        } else {
            (total_alloc / total_parts as f64) * prio as f64
        };
        out.push(ReserveRecord {
            used: fs.used,
            priority: prio,
            reserved: reserve.max(0.0) as u64,
            dataset: fs,
        });
    }
    Ok(out)
}

pub fn report_schema() -> Vec<Column> {
    vec![
        Column::new("url"),
        Column::with_reducer("priority", Reducer::Sum),
        Column::with_reducer("used", Reducer::Sum),
        Column::with_reducer("reserved", Reducer::Sum),
        Column::with_reducer("remaining", Reducer::Sum),
    ]
}

pub fn to_report(records: &[ReserveRecord]) -> Report {
    let mut rep = Report::new(report_schema());
    for r in records {
        rep.push(vec![
            Value::Str(r.dataset.name.clone()),
            Value::Int(r.priority),
            Value::Int(r.used as i64),
            Value::Int(r.reserved as i64),
            Value::Int(r.reserved as i64 - r.used as i64),
        ]);
    }
    if rep.records.len() > 1 {
        rep.append_aggregate_row();
    }
    rep
}

/// `zfs set <mode>=<size> <name>` script line, or a warning comment when the
/// computed reserve would already be under water (spec §7 "Script
/// generators emit commented errors rather than destructive commands").
pub fn fix_script_line(record: &ReserveRecord, mode: ReserveMode) -> String {
    if record.reserved < record.used {
        return format!(
            "# reserve for '{}' is already too low ({} reserved vs {} used); consider increasing its zfs:priority\n",
            record.dataset.name, record.reserved, record.used
        );
    }
    let prop = match mode {
        ReserveMode::Quota => "quota",
        ReserveMode::Reservation => "reservation",
    };
    format!("zfs set {prop}={} {}\n", record.reserved, record.dataset.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ds(name: &str, used: u64, priority: Option<i64>) -> Dataset {
        Dataset {
            host: "h1".into(),
            name: name.into(),
            dataset_type: "filesystem".into(),
            creation: Utc::now(),
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
            zfs_priority: priority,
            zfs_receive_url: None,
            updated_at: Utc::now(),
        }
    }

    fn pool(name: &str, size: u64) -> Pool {
        Pool {
            host: "h1".into(),
            name: name.into(),
            size,
            free: size / 2,
            alloc: size / 2,
            cap: 50.0,
            health: "ONLINE".into(),
            dedup_ratio: 1.0,
            version: "5000".into(),
            feature_flags: "".into(),
            read_only: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn distributes_proportionally_by_priority() {
        let mut store = Store::open_in_memory().unwrap();
        let pool = pool("tank", 1000);
        store.sync_pools("h1", &[pool.clone()]).unwrap();
        store
            .sync_datasets(
                "h1",
                &[
                    ds("tank", 0, None),
                    ds("tank/a", 50, Some(1)),
                    ds("tank/b", 50, Some(3)),
                ],
            )
            .unwrap();

        let config = ReserveConfig {
            mode: ReserveMode::Quota,
            max_cap: Some(80.0),
            distribute_space: None,
        };
        let records = compute(&store, &pool, &config).unwrap();
        assert_eq!(records.len(), 2);
        let total: u64 = records.iter().map(|r| r.reserved).sum();
        assert_eq!(total, 800);
        let b = records.iter().find(|r| r.dataset.name == "tank/b").unwrap();
        assert_eq!(b.reserved, 600);
    }

    #[test]
    fn fix_script_warns_when_under_water() {
        let record = ReserveRecord {
            dataset: ds("tank/a", 900, Some(1)),
            priority: 1,
            used: 900,
            reserved: 100,
        };
        let line = fix_script_line(&record, ReserveMode::Quota);
        assert!(line.starts_with("# reserve"));
    }
}

//! Snapshot Sender (spec §4.5, C5): resolves a destination for a source
//! filesystem, plans the minimal incremental send, and emits an
//! operator-runnable transport script, grounded in `replicate.rs`'s
//! `replicate_dataset` (kept for its send/receive/rollback shell shape) but
//! driven off the C3 `Store` instead of the teacher's `Machine`/`Dataset`.

use crate::error::StoreError;
use crate::model::Dataset;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Property,
    Search,
    Auto,
    Configured,
}

#[derive(Debug, Clone)]
pub struct SendPlan {
    pub source: Dataset,
    pub destination_host: String,
    pub destination_name: String,
    /// Snapshot name the incremental send starts from; `None` means a full send.
    pub ss_from: Option<String>,
    pub ss_to_incl: String,
    pub ss_to_send: Vec<String>,
    /// Destination snapshots newer than `ss_from` that must be rolled back.
    pub dest_ss_drop: Vec<String>,
    pub ss_size: u64,
    pub tr_size: u64,
    pub fs_free_after: i64,
    pub pool_cap_after: f64,
    pub replicate: bool,
    pub replicate_force: bool,
    pub dest_exists: bool,
}

/// Destination filesystem/pool candidates (spec §4.5 candidate enumeration):
/// existing filesystems elsewhere whose basename matches, ordered by `avail`
/// descending, followed by pools with enough free space to hold `source`
/// plus every one of its snapshots (`free >= source.used + Σ snapshot
/// deltas`) — a pool that can only fit the live filesystem but not its
/// retained snapshots is not a usable destination.
pub fn candidates(store: &Store, source: &Dataset) -> Result<Vec<String>, StoreError> {
    let basename = source.filesystem_name().rsplit('/').next().unwrap_or(source.filesystem_name());
    let mut out: Vec<String> = store
        .datasets_by_basename(&source.host, basename)?
        .into_iter()
        .map(|d| d.name)
        .collect();

    let snapshot_deltas: u64 = store.snapshots(source)?.iter().map(|s| s.used).sum();
    let needed = source.used + snapshot_deltas;
    for pool in store.pools_excluding_host(&source.host)? {
        if pool.free >= needed {
            let suffix = source.filesystem_name();
            let joined = format!("{}/{}", pool.name, suffix.rsplit('/').next().unwrap_or(suffix));
            if !out.contains(&joined) {
                out.push(joined);
            }
        }
    }
    Ok(out)
}

/// Resolves the destination name for `source` per `mode` (spec §4.5
/// Destination resolution modes). `property` and `auto` read
/// `zfs_receive_url`, refusing an inherited value; `search`/fallback picks the
/// smallest-estimated-size candidate from [`candidates`].
pub fn resolve_destination(store: &Store, source: &Dataset, mode: DestinationMode) -> Result<Option<String>, StoreError> {
    let try_property = |store: &Store, source: &Dataset| -> Result<Option<String>, StoreError> {
        if source.zfs_receive_url.is_none() {
            return Ok(None);
        }
        if store.property_is_inherited(source, "zfs_receive_url")? {
            return Ok(None);
        }
        Ok(source.zfs_receive_url.clone())
    };

    match mode {
        DestinationMode::Property => try_property(store, source),
        DestinationMode::Search | DestinationMode::Configured => {
            Ok(candidates(store, source)?.into_iter().next())
        }
        DestinationMode::Auto => {
            if let Some(url) = try_property(store, source)? {
                return Ok(Some(url));
            }
            Ok(candidates(store, source)?.into_iter().next())
        }
    }
}

/// Plan computation (spec §4.5 `_dest_info`). `dest` is `None` when the
/// destination filesystem does not yet exist.
pub fn plan(
    store: &Store,
    source: &Dataset,
    destination_host: &str,
    destination_name: &str,
    dest: Option<&Dataset>,
    query: &crate::url::QueryFields,
) -> Result<SendPlan, StoreError> {
    let src_snaps = store.snapshots(source)?;
    let src_names: Vec<String> = src_snaps
        .iter()
        .filter_map(|s| s.name.split('@').nth(1).map(str::to_string))
        .collect();

    let (ss_from, dest_ss_drop, dest_exists) = match dest {
        Some(dest_ds) => {
            let dest_snaps = store.snapshots(dest_ds)?;
            let dest_names: Vec<String> = dest_snaps
                .iter()
                .filter_map(|s| s.name.split('@').nth(1).map(str::to_string))
                .collect();

            let common = dest_names
                .iter()
                .rev()
                .find(|n| src_names.contains(n))
                .cloned();

            match &common {
                Some(common_name) => {
                    let idx = dest_names.iter().position(|n| n == common_name).unwrap();
                    let dropped = dest_names[idx + 1..].to_vec();
                    (Some(common_name.clone()), dropped, true)
                }
                None => (None, Vec::new(), true),
            }
        }
        None => (None, Vec::new(), false),
    };

    let ss_to_incl = src_names.last().cloned().unwrap_or_default();
    let ss_to_send: Vec<String> = match &ss_from {
        Some(from) => {
            let idx = src_names.iter().position(|n| n == from).map(|i| i + 1).unwrap_or(0);
            src_names[idx..].to_vec()
        }
        None => src_names.clone(),
    };

    let ss_size: u64 = src_snaps
        .iter()
        .filter(|s| ss_to_send.iter().any(|n| s.name.ends_with(&format!("@{n}"))))
        .map(|s| s.used)
        .sum();
    let tr_size: u64 = src_snaps
        .iter()
        .filter(|s| ss_to_send.iter().any(|n| s.name.ends_with(&format!("@{n}"))))
        .map(|s| s.refer)
        .sum();

    let pool = store.pool(source)?;
    let (fs_free_after, pool_cap_after) = match &pool {
        Some(p) => {
            let free_after = p.free as i64 - ss_size as i64;
            let cap_after = if p.size > 0 {
                ((p.alloc + ss_size) as f64 / p.size as f64) * 100.0
            } else {
                0.0
            };
            (free_after, cap_after)
        }
        None => (0, 0.0),
    };

    Ok(SendPlan {
        source: source.clone(),
        destination_host: destination_host.to_string(),
        destination_name: destination_name.to_string(),
        ss_from,
        ss_to_incl,
        ss_to_send,
        dest_ss_drop,
        ss_size,
        tr_size,
        fs_free_after,
        pool_cap_after,
        replicate: query.sync.as_deref() == Some("replicate"),
        replicate_force: query.sync.as_deref() == Some("replicate_force"),
        dest_exists,
    })
}

/// Safety preamble every emitted, directly-runnable shell script must begin
/// with (spec §6 "Script outputs"): require root, default to a dry run via a
/// `prefix=echo` toggle, and only drop the prefix after the operator both
/// passes the `DOIT` magic argument and confirms interactively.
pub fn safety_preamble() -> &'static str {
    "#!/bin/sh\n\
set -eu\n\
if [ \"$(id -u)\" -ne 0 ]; then\n\
    echo 'must be run as root' >&2\n\
    exit 1\n\
fi\n\
prefix=echo\n\
if [ \"${1:-}\" = DOIT ]; then\n\
    printf 'about to run destructive commands against the fleet. continue? [y/N] '\n\
    read -r reply\n\
    case \"$reply\" in\n\
        y|Y) prefix='' ;;\n\
        *) echo aborted >&2; exit 1 ;;\n\
    esac\n\
fi\n\n"
}

/// Emits the transport script for `plan` (spec §4.5 Script emission).
/// Refuses destructive plans with comment-only output: no common snapshot
/// against an existing destination, or nothing left to send.
pub fn emit_script(plan: &SendPlan) -> String {
    if plan.dest_exists && plan.ss_from.is_none() {
        return format!(
            "# refusing to send: '{}' and '{}' have no snapshot in common\n",
            plan.source.name, plan.destination_name
        );
    }
    if plan.dest_exists && plan.ss_to_send.is_empty() {
        return format!(
            "# nothing to send: '{}' is already up to date with '{}'\n",
            plan.destination_name, plan.source.name
        );
    }

    let cross_host = plan.source.host != plan.destination_host;
    let mut out = String::from(safety_preamble());

    if !plan.dest_ss_drop.is_empty() {
        let rollback_to = plan.ss_from.as_deref().unwrap_or("");
        out.push_str(&format!(
            "${{prefix}} sh -c 'zfs rollback -r {}@{}'\n",
            plan.destination_name, rollback_to
        ));
    }

    let flags = match (plan.replicate, plan.replicate_force) {
        (_, true) => "-R -F",
        (true, false) => "-R",
        _ => "",
    };

    let send_arg = match &plan.ss_from {
        Some(from) => format!("-I {from} {}@{}", plan.source.name, plan.ss_to_incl),
        None => format!("{}@{}", plan.source.name, plan.ss_to_incl),
    };

    let send_cmd = format!("zfs send {flags} {send_arg}").trim().to_string();
    let recv_cmd = format!("zfs receive -v {}", plan.destination_name);

    let pipeline = if cross_host {
        format!(
            "ssh {} '{}' | lz4 | ssh {} 'lz4 -d | pv | {}'",
            plan.source.host, send_cmd, plan.destination_host, recv_cmd
        )
    } else {
        format!("{send_cmd} | pv | {recv_cmd}")
    };
    out.push_str(&format!("${{prefix}} sh -c '{pipeline}'\n"));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Pool;
    use chrono::{Duration, Utc};

    fn fs(host: &str, name: &str, used: u64) -> Dataset {
        Dataset {
            host: host.into(),
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
            zfs_priority: None,
            zfs_receive_url: None,
            updated_at: Utc::now(),
        }
    }

    fn snap(host: &str, name: &str, offset_secs: i64, used: u64) -> Dataset {
        Dataset {
            host: host.into(),
            name: name.into(),
            dataset_type: "snapshot".into(),
            creation: Utc::now() - Duration::seconds(offset_secs),
            used,
            avail: None,
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
    fn full_send_when_destination_missing() {
        let mut store = Store::open_in_memory().unwrap();
        let source = fs("h1", "tank/webdata", 100);
        store.sync_datasets("h1", &[source.clone()]).unwrap();
        store
            .sync_datasets(
                "h1",
                &[
                    source.clone(),
                    snap("h1", "tank/webdata@s1", 200, 10),
                    snap("h1", "tank/webdata@s2", 100, 10),
                ],
            )
            .unwrap();

        let query = crate::url::QueryFields::default();
        let plan = plan(&store, &source, "h2", "tank2/webdata", None, &query).unwrap();
        assert!(plan.ss_from.is_none());
        assert_eq!(plan.ss_to_send, vec!["s1".to_string(), "s2".to_string()]);
        assert!(!plan.dest_exists);

        let script = emit_script(&plan);
        assert!(script.contains("ssh h1"));
        assert!(script.contains("zfs send"));
    }

    #[test]
    fn refuses_when_no_common_snapshot_against_existing_destination() {
        let mut store = Store::open_in_memory().unwrap();
        let source = fs("h1", "tank/webdata", 100);
        let dest = fs("h2", "tank2/webdata", 100);
        store.sync_datasets("h1", &[source.clone()]).unwrap();
        store.sync_datasets("h2", &[dest.clone()]).unwrap();

        let query = crate::url::QueryFields::default();
        let plan = plan(&store, &source, "h2", "tank2/webdata", Some(&dest), &query).unwrap();
        let script = emit_script(&plan);
        assert!(script.starts_with("# refusing"));
    }

    #[test]
    fn nothing_to_send_when_already_up_to_date() {
        let mut store = Store::open_in_memory().unwrap();
        let source = fs("h1", "tank/webdata", 100);
        let dest = fs("h2", "tank2/webdata", 100);
        store.sync_datasets("h1", &[source.clone()]).unwrap();
        store.sync_datasets("h2", &[dest.clone()]).unwrap();
        store
            .sync_datasets("h1", &[source.clone(), snap("h1", "tank/webdata@s1", 100, 10)])
            .unwrap();
        store
            .sync_datasets("h2", &[dest.clone(), snap("h2", "tank2/webdata@s1", 100, 10)])
            .unwrap();

        let query = crate::url::QueryFields::default();
        let plan = plan(&store, &source, "h2", "tank2/webdata", Some(&dest), &query).unwrap();
        assert_eq!(plan.ss_from, Some("s1".to_string()));
        assert!(plan.ss_to_send.is_empty());
        let script = emit_script(&plan);
        assert!(script.starts_with("# nothing to send"));
    }

    #[test]
    fn candidate_pools_require_enough_free_space() {
        let mut store = Store::open_in_memory().unwrap();
        let source = fs("h1", "tank/webdata", 500);
        store.sync_datasets("h1", &[source.clone()]).unwrap();
        store
            .sync_pools(
                "h2",
                &[Pool {
                    host: "h2".into(),
                    name: "tank2".into(),
                    size: 1000,
                    free: 900,
                    alloc: 100,
                    cap: 10.0,
                    health: "ONLINE".into(),
                    dedup_ratio: 1.0,
                    version: "5000".into(),
                    feature_flags: "".into(),
                    read_only: false,
                    updated_at: Utc::now(),
                }],
            )
            .unwrap();

        let cands = candidates(&store, &source).unwrap();
        assert_eq!(cands, vec!["tank2/webdata".to_string()]);
    }
}

//! Version Bundler (spec §4.2, C2): groups `(path, meta)` records into
//! version bundles keyed by a regex-extracted version token, grounded in
//! `original_source/src/python/bit/bundler.py`'s `Bundler`/`VersionBundle`/
//! `VersionBundleList`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::retention::RetentionPolicy;

/// Capture group 2 isolates the version digits, e.g. `([_/\-]v)(\d+)([_/\-.])`.
const VERSION_PATTERN: &str = r"([_/.-]v)(\d+)([_/.-])";

pub trait BundleMeta {
    fn size(&self) -> u64;
    fn ratio(&self) -> f64;
    fn created(&self) -> DateTime<Utc>;
    fn modified(&self) -> DateTime<Utc>;
}

/// A concrete, ready-to-use metadata record for the common case: a file's
/// logical size, its ZFS compression ratio, and its timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileMeta {
    pub size: u64,
    pub ratio: f64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl BundleMeta for FileMeta {
    fn size(&self) -> u64 {
        self.size
    }
    fn ratio(&self) -> f64 {
        self.ratio
    }
    fn created(&self) -> DateTime<Utc> {
        self.created
    }
    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }
}

/// Normalized version value: integer if the captured token parses as such,
/// the raw string otherwise (spec §4.2 rebuild stage).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Int(i64),
    Str(String),
}

fn convert_version(token: &str) -> Version {
    match token.parse::<i64>() {
        Ok(n) => Version::Int(n),
        Err(_) => Version::Str(token.to_string()),
    }
}

pub struct VersionBundle<T> {
    pub version: Version,
    pub items: Vec<(String, T)>,
    pub marked_for_deletion: bool,
}

impl<T: BundleMeta> VersionBundle<T> {
    pub fn num_files(&self) -> usize {
        self.items.len()
    }

    /// Sum of size/ratio across items (the on-disk footprint after
    /// compression).
    pub fn disk_size(&self) -> f64 {
        self.items.iter().map(|(_, m)| m.size() as f64 / m.ratio()).sum()
    }

    pub fn logical_size(&self) -> u64 {
        self.items.iter().map(|(_, m)| m.size()).sum()
    }

    pub fn min_created(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|(_, m)| m.created()).min()
    }

    pub fn avg_created_epoch(&self) -> Option<i64> {
        average_epoch(self.items.iter().map(|(_, m)| m.created()))
    }

    pub fn avg_modified_epoch(&self) -> Option<i64> {
        average_epoch(self.items.iter().map(|(_, m)| m.modified()))
    }
}

fn average_epoch(times: impl Iterator<Item = DateTime<Utc>>) -> Option<i64> {
    let (sum, count) = times.fold((0i64, 0i64), |(sum, count), t| (sum + t.timestamp(), count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count)
    }
}

pub struct VersionBundleList<T> {
    pub prefix: String,
    /// Ascending by normalized version value.
    pub bundles: Vec<VersionBundle<T>>,
}

impl<T: BundleMeta> VersionBundleList<T> {
    pub fn num_deleted(&self) -> usize {
        self.bundles.iter().filter(|b| b.marked_for_deletion).count()
    }

    pub fn freed_disk_space(&self) -> f64 {
        self.bundles
            .iter()
            .filter(|b| b.marked_for_deletion)
            .map(|b| b.disk_size())
            .sum()
    }

    pub fn total_disk_size(&self) -> f64 {
        self.bundles.iter().map(|b| b.disk_size()).sum()
    }

    pub fn total_logical_size(&self) -> u64 {
        self.bundles.iter().map(|b| b.logical_size()).sum()
    }

    /// Mark bundles for deletion via the retention evaluator (C1), keyed by
    /// each bundle's min-created timestamp.
    pub fn apply_retention(&mut self, policy: &RetentionPolicy, now: i64) {
        let samples: Vec<(i64, usize)> = self
            .bundles
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.min_created().map(|t| (t.timestamp(), i)))
            .collect();
        let (_, dropped) = policy.filter(now, &samples);
        for (_, idx) in dropped {
            self.bundles[idx].marked_for_deletion = true;
        }
    }

    /// Mark all but the N newest bundles (by ascending version order) for
    /// deletion.
    pub fn keep_latest_n(&mut self, n: usize) {
        let len = self.bundles.len();
        for (i, bundle) in self.bundles.iter_mut().enumerate() {
            if len - i > n {
                bundle.marked_for_deletion = true;
            }
        }
    }
}

pub struct Bundler {
    re_version: Regex,
}

impl Default for Bundler {
    fn default() -> Self {
        Self::new()
    }
}

type RawBundle<T> = BTreeMap<String, BTreeMap<String, Vec<(String, T)>>>;

impl Bundler {
    pub fn new() -> Self {
        Bundler {
            re_version: Regex::new(VERSION_PATTERN).expect("static regex"),
        }
    }

    fn extract_version_span(&self, path: &str) -> Option<(usize, usize)> {
        let caps = self.re_version.captures(path)?;
        let m = caps.get(2)?;
        Some((m.start(), m.end()))
    }

    /// Groups `records` into `prefix -> version -> [(path, meta)]`. A record
    /// without a version token, or a prefix change, prunes the
    /// previously-accumulated prefix (single-version trees or trees with a
    /// single item are discarded); the prefix still open when the stream
    /// ends is left unpruned, matching the reference bundler.
    pub fn bundle<T>(&self, records: impl IntoIterator<Item = (String, T)>) -> RawBundle<T> {
        let mut out: RawBundle<T> = BTreeMap::new();
        let mut cur_prefix: Option<String> = None;

        for (path, meta) in records {
            match self.extract_version_span(&path) {
                Some((start, end)) => {
                    let prefix = path[..start].to_string();
                    let version = path[start..end].to_string();

                    if let Some(cp) = cur_prefix.as_ref() {
                        if *cp != prefix {
                            Self::prune_entry(&mut out, cp);
                        }
                    }

                    out.entry(prefix.clone())
                        .or_default()
                        .entry(version)
                        .or_default()
                        .push((path, meta));

                    cur_prefix = Some(prefix);
                }
                None => {
                    if let Some(cp) = cur_prefix.as_ref() {
                        Self::prune_entry(&mut out, cp);
                    }
                    cur_prefix = None;
                }
            }
        }
        out
    }

    fn prune_entry<T>(out: &mut RawBundle<T>, prefix: &str) {
        let remove = match out.get(prefix) {
            None => false,
            Some(vl) if vl.is_empty() || vl.len() > 1 => false,
            Some(vl) => vl.values().next().map(|v| v.len() < 2).unwrap_or(false),
        };
        if remove {
            out.remove(prefix);
        }
    }

    /// Converts a raw `bundle()` map into `prefix -> VersionBundleList`,
    /// sorted ascending by normalized version.
    pub fn rebuild<T: BundleMeta>(&self, raw: RawBundle<T>) -> BTreeMap<String, VersionBundleList<T>> {
        let mut out = BTreeMap::new();
        for (prefix, versions) in raw {
            let mut bundles: Vec<VersionBundle<T>> = versions
                .into_iter()
                .map(|(version_str, items)| VersionBundle {
                    version: convert_version(&version_str),
                    items,
                    marked_for_deletion: false,
                })
                .collect();
            bundles.sort_by(|a, b| a.version.cmp(&b.version));
            out.insert(prefix.clone(), VersionBundleList { prefix, bundles });
        }
        out
    }
}

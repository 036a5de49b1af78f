//! `zfs://host/pool[/filesystem[@snapshot]][?k=v&...]` value object (spec §3.1, §6).

use std::collections::BTreeMap;
use std::fmt;

use crate::error::InputError;

/// Recognized query keys (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFields {
    /// `sync` ∈ `{replicate, replicate_force}`.
    pub sync: Option<String>,
    /// `children_only` ∈ `{0,1}`.
    pub children_only: bool,
}

impl QueryFields {
    fn from_pairs(pairs: &BTreeMap<String, String>) -> Self {
        QueryFields {
            sync: pairs.get("sync").cloned(),
            children_only: pairs.get("children_only").map(|v| v == "1").unwrap_or(false),
        }
    }
}

/// A parsed `zfs://` URL.
///
/// Invariant: a trailing slash on the pool segment denotes the
/// pool-filesystem (distinct from the pool itself) — see `is_pool_filesystem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZFSURL {
    host: String,
    pool: String,
    /// Path components below the pool, not including the pool itself.
    filesystem_rest: Vec<String>,
    /// True when the URL names the pool-as-filesystem (trailing slash, or no
    /// filesystem component at all but constructed via `new_from_dataset`
    /// with `as_dataset = true`).
    pool_is_filesystem: bool,
    snapshot: Option<String>,
    query: QueryFields,
}

impl ZFSURL {
    pub fn parse(s: &str) -> Result<ZFSURL, InputError> {
        let rest = s
            .strip_prefix("zfs://")
            .ok_or_else(|| InputError::InvalidUrl(format!("{s}: missing zfs:// scheme")))?;

        let (authority_and_path, query_str) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (host, path) = match authority_and_path.split_once('/') {
            Some((h, p)) => (h, p),
            None => (authority_and_path, ""),
        };
        if host.is_empty() {
            return Err(InputError::InvalidUrl(format!("{s}: missing host")));
        }

        let pool_is_filesystem = path.ends_with('/') || path.is_empty();
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(InputError::InvalidUrl(format!("{s}: missing pool")));
        }
        let pool = components.remove(0).to_string();

        let (fs_rest, snapshot) = if let Some(last) = components.last().cloned() {
            if let Some((tail, snap)) = last.split_once('@') {
                let mut v: Vec<String> = components[..components.len() - 1]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                if !tail.is_empty() {
                    v.push(tail.to_string());
                }
                (v, Some(snap.to_string()))
            } else {
                (components.iter().map(|s| s.to_string()).collect(), None)
            }
        } else {
            (Vec::new(), None)
        };

        let query = if let Some(q) = query_str {
            let mut pairs = BTreeMap::new();
            for kv in q.split('&').filter(|s| !s.is_empty()) {
                let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
                pairs.insert(k.to_string(), v.to_string());
            }
            QueryFields::from_pairs(&pairs)
        } else {
            QueryFields::default()
        };

        Ok(ZFSURL {
            host: host.to_string(),
            pool,
            filesystem_rest: fs_rest,
            pool_is_filesystem,
            snapshot,
            query,
        })
    }

    /// Build a URL from a dataset name as stored in the DB (pool, or
    /// `pool/path[@snap]`). `as_dataset` marks a bare pool name as the
    /// pool-filesystem (trailing slash) rather than the pool itself.
    pub fn new_from_dataset(host: &str, name: &str, as_dataset: bool) -> ZFSURL {
        let (base, snapshot) = match name.split_once('@') {
            Some((b, s)) => (b, Some(s.to_string())),
            None => (name, None),
        };
        let mut parts: Vec<String> = base.split('/').map(|s| s.to_string()).collect();
        let pool = parts.remove(0);
        let pool_is_filesystem = if parts.is_empty() { as_dataset } else { true };
        ZFSURL {
            host: host.to_string(),
            pool,
            filesystem_rest: parts,
            pool_is_filesystem,
            snapshot,
            query: QueryFields::default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn is_pool_filesystem(&self) -> bool {
        self.filesystem_rest.is_empty() && self.pool_is_filesystem
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// The dataset's full name, e.g. `poolA/fs/sub` or `poolA/fs/sub@snap`.
    pub fn name(&self) -> String {
        let mut name = self.filesystem();
        if let Some(snap) = &self.snapshot {
            name.push('@');
            name.push_str(snap);
        }
        name
    }

    /// Just the filesystem path (pool + rest, no snapshot).
    pub fn filesystem(&self) -> String {
        let mut name = self.pool.clone();
        for c in &self.filesystem_rest {
            name.push('/');
            name.push_str(c);
        }
        name
    }

    pub fn snapshot_name(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn query_fields(&self) -> &QueryFields {
        &self.query
    }

    /// The parent filesystem URL, or `None` if this is already the
    /// pool-filesystem. Dropping a snapshot yields the filesystem itself.
    pub fn parent_filesystem_url(&self) -> Option<ZFSURL> {
        if self.snapshot.is_some() {
            return Some(ZFSURL {
                host: self.host.clone(),
                pool: self.pool.clone(),
                filesystem_rest: self.filesystem_rest.clone(),
                pool_is_filesystem: self.filesystem_rest.is_empty(),
                snapshot: None,
                query: QueryFields::default(),
            });
        }
        if self.filesystem_rest.is_empty() {
            return None;
        }
        let mut rest = self.filesystem_rest.clone();
        rest.pop();
        Some(ZFSURL {
            host: self.host.clone(),
            pool: self.pool.clone(),
            pool_is_filesystem: rest.is_empty(),
            filesystem_rest: rest,
            snapshot: None,
            query: QueryFields::default(),
        })
    }
}

impl fmt::Display for ZFSURL {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zfs://{}/{}", self.host, self.pool)?;
        for c in &self.filesystem_rest {
            write!(f, "/{c}")?;
        }
        if self.filesystem_rest.is_empty() && self.pool_is_filesystem {
            write!(f, "/")?;
        }
        if let Some(snap) = &self.snapshot {
            write!(f, "@{snap}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_url_roundtrip() {
        let u = ZFSURL::parse("zfs://h1/poolA/fs/sub@snap?sync=replicate").unwrap();
        assert_eq!(u.name(), "poolA/fs/sub@snap");
        assert_eq!(u.snapshot_name(), Some("snap"));
        assert_eq!(u.query_fields().sync.as_deref(), Some("replicate"));

        let parent = u.parent_filesystem_url().unwrap();
        assert_eq!(parent.name(), "poolA/fs/sub");
    }

    #[test]
    fn pool_filesystem_trailing_slash() {
        let u = ZFSURL::parse("zfs://h1/tank/").unwrap();
        assert!(u.is_pool_filesystem());
        assert_eq!(u.name(), "tank");

        let pool_itself = ZFSURL::new_from_dataset("h1", "tank", false);
        assert!(!pool_itself.is_pool_filesystem());
        let pool_fs = ZFSURL::new_from_dataset("h1", "tank", true);
        assert!(pool_fs.is_pool_filesystem());
    }

    #[test]
    fn children_only_flag() {
        let u = ZFSURL::parse("zfs://h1/tank/fs?children_only=1").unwrap();
        assert!(u.query_fields().children_only);
    }
}

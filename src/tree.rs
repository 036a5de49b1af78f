//! Tree Sampler & Package Differ (spec §4.7, C7), grounded in
//! `original_source/src/python/fsmonitor/tree.py`'s `TreeRoot`/`Package`/
//! `PackageDiffer`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stat facts captured per file (the subset the differ and transactions need).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FileStat {
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub atime: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl FileStat {
    #[cfg(unix)]
    fn from_metadata(meta: &fs::Metadata) -> FileStat {
        use std::os::unix::fs::MetadataExt;
        FileStat {
            size: meta.size(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            atime: meta.atime(),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        }
    }

    #[cfg(not(unix))]
    fn from_metadata(meta: &fs::Metadata) -> FileStat {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        FileStat {
            size: meta.len(),
            mtime,
            ctime: mtime,
            atime: mtime,
            uid: 0,
            gid: 0,
            mode: 0,
        }
    }
}

/// A directory tree entry: either a leaf file's stat, or a nested subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    File(FileStat),
    Dir(BTreeMap<String, Entry>),
}

impl Entry {
    pub fn as_dir(&self) -> Option<&BTreeMap<String, Entry>> {
        match self {
            Entry::Dir(d) => Some(d),
            _ => None,
        }
    }
}

/// An immutable recursive sample of a directory tree (spec §3.1 Tree).
#[derive(Debug)]
pub struct TreeRoot {
    root_path: PathBuf,
    sample_time: i64,
    contents: BTreeMap<String, Entry>,
    one_package_per_file: bool,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl TreeRoot {
    /// Depth-first `listdir`/`stat` of `root_path`. `EACCES`/`ENOENT` on
    /// individual entries are silently skipped. `sample_time` is stamped
    /// *after* the recursion completes (spec §4.7).
    pub fn sample(root_path: impl Into<PathBuf>, one_package_per_file: bool) -> std::io::Result<TreeRoot> {
        let root_path = root_path.into();
        let contents = Self::recurse_dir(&root_path)?;
        Ok(TreeRoot {
            root_path,
            sample_time: now_secs(),
            contents,
            one_package_per_file,
        })
    }

    fn recurse_dir(dir: &Path) -> std::io::Result<BTreeMap<String, Entry>> {
        let mut out = BTreeMap::new();
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                return Ok(out)
            }
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                let sub = Self::recurse_dir(&entry.path())?;
                out.insert(name, Entry::Dir(sub));
            } else {
                out.insert(name, Entry::File(FileStat::from_metadata(&meta)));
            }
        }
        Ok(out)
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn sample_time(&self) -> i64 {
        self.sample_time
    }

    fn lookup(&self, root_relative: &str) -> Option<&Entry> {
        if root_relative.is_empty() {
            return None;
        }
        let mut cur: Option<&Entry> = None;
        let mut dir = &self.contents;
        let parts: Vec<&str> = root_relative.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            let entry = dir.get(*part)?;
            if i + 1 == parts.len() {
                cur = Some(entry);
            } else {
                dir = entry.as_dir()?;
            }
        }
        cur
    }

    /// All entries depth-first, files only, as `(rela_path, stat)`.
    pub fn entries(&self, root_relative: &str) -> Vec<(String, FileStat)> {
        let mut out = Vec::new();
        let start: &BTreeMap<String, Entry> = if root_relative.is_empty() {
            &self.contents
        } else {
            match self.lookup(root_relative) {
                Some(Entry::Dir(d)) => d,
                Some(Entry::File(s)) => return vec![(root_relative.to_string(), *s)],
                None => return out,
            }
        };
        fn recurse(dir: &BTreeMap<String, Entry>, prefix: &str, out: &mut Vec<(String, FileStat)>) {
            for (name, entry) in dir {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                match entry {
                    Entry::File(s) => out.push((path, *s)),
                    Entry::Dir(sub) => recurse(sub, &path, out),
                }
            }
        }
        recurse(start, root_relative, &mut out);
        out
    }

    /// Every file directly beneath the root, and every directory containing
    /// at least one file — the walk does not descend past the first
    /// directory level that contains files (spec §4.7 Package discovery).
    /// In `one_package_per_file` mode, every file is its own package.
    pub fn iter_packages(self: &Rc<Self>) -> Vec<Package> {
        let mut out = Vec::new();

        let mut files: Vec<&str> = Vec::new();
        let mut dirs: Vec<&str> = Vec::new();
        for (name, entry) in &self.contents {
            match entry {
                Entry::File(_) => files.push(name.as_str()),
                Entry::Dir(_) => dirs.push(name.as_str()),
            }
        }
        for name in files {
            out.push(Package::new(Rc::clone(self), name.to_string()));
        }

        fn recurse(tree: &Rc<TreeRoot>, dir: &BTreeMap<String, Entry>, rel: &str, out: &mut Vec<Package>) {
            let mut files: Vec<&str> = Vec::new();
            let mut dirs: Vec<(&str, &BTreeMap<String, Entry>)> = Vec::new();
            for (name, entry) in dir {
                match entry {
                    Entry::File(_) => files.push(name.as_str()),
                    Entry::Dir(sub) => dirs.push((name.as_str(), sub)),
                }
            }
            if !files.is_empty() {
                if tree.one_package_per_file {
                    for f in files {
                        out.push(Package::new(Rc::clone(tree), format!("{rel}/{f}")));
                    }
                } else {
                    out.push(Package::new(Rc::clone(tree), rel.to_string()));
                }
            } else {
                for (name, sub) in dirs {
                    recurse(tree, sub, &format!("{rel}/{name}"), out);
                }
            }
        }

        for (name, entry) in &self.contents {
            if let Entry::Dir(sub) = entry {
                recurse(self, sub, name, &mut out);
            }
        }

        out
    }
}

/// A pointer `(tree, root_relative_path)` (spec §3.1 Package). Holds a
/// strong reference to its tree via `Rc`, not ownership semantics implying
/// the tree must outlive it implicitly — the handle keeps it alive exactly
/// as long as needed.
#[derive(Clone)]
pub struct Package {
    tree: Rc<TreeRoot>,
    root_relative: String,
    stable_since: i64,
}

impl Package {
    fn new(tree: Rc<TreeRoot>, root_relative: String) -> Package {
        let stable_since = tree.sample_time();
        Package {
            tree,
            root_relative,
            stable_since,
        }
    }

    pub fn tree(&self) -> &Rc<TreeRoot> {
        &self.tree
    }

    pub fn root_relative(&self) -> &str {
        &self.root_relative
    }

    pub fn root(&self) -> PathBuf {
        self.tree.root_path().join(&self.root_relative)
    }

    pub fn stable_since(&self) -> i64 {
        self.stable_since
    }

    pub fn set_stable_since(&mut self, t: i64) {
        self.stable_since = t;
    }

    pub fn entries(&self) -> Vec<(String, FileStat)> {
        self.tree.entries(&self.root_relative)
    }

    fn content(&self) -> Option<&Entry> {
        self.tree.lookup(&self.root_relative)
    }

    /// Content equality, independent of `stable_since` (spec §4.7 diff).
    fn content_eq(&self, other: &Package) -> bool {
        self.content() == other.content()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    PossiblyChanged { modified: bool },
}

pub struct DiffEntry {
    pub kind: ChangeKind,
    pub package: Package,
}

/// Compares two package sets by absolute root-relative path (spec §4.7,
/// §8 property 6). On an unmodified possibly-changed package, the rhs
/// package inherits `stable_since` from the lhs, propagating stability.
pub fn diff_packages(lhs: Vec<Package>, rhs: Vec<Package>) -> Vec<DiffEntry> {
    let lhs_map: BTreeMap<String, Package> =
        lhs.into_iter().map(|p| (p.root_relative.clone(), p)).collect();
    let mut rhs_map: BTreeMap<String, Package> =
        rhs.into_iter().map(|p| (p.root_relative.clone(), p)).collect();

    let mut out = Vec::new();

    for key in lhs_map.keys() {
        if !rhs_map.contains_key(key) {
            out.push(DiffEntry {
                kind: ChangeKind::Removed,
                package: lhs_map[key].clone(),
            });
        }
    }

    let keys: Vec<String> = rhs_map.keys().cloned().collect();
    for key in keys {
        match lhs_map.get(&key) {
            None => {
                out.push(DiffEntry {
                    kind: ChangeKind::Added,
                    package: rhs_map.remove(&key).unwrap(),
                });
            }
            Some(lhs_pkg) => {
                let mut rhs_pkg = rhs_map.remove(&key).unwrap();
                let modified = !lhs_pkg.content_eq(&rhs_pkg);
                if !modified {
                    rhs_pkg.set_stable_since(lhs_pkg.stable_since());
                }
                out.push(DiffEntry {
                    kind: ChangeKind::PossiblyChanged { modified },
                    package: rhs_pkg,
                });
            }
        }
    }

    out
}

//! Dropbox & Finder (spec §4.8, C8), grounded in
//! `original_source/src/python/fsmonitor/finder.py`'s `DropboxFinder` and
//! `fsmonitor/base.py`'s `Dropbox`. `Dropbox` owns a config path and the
//! last tree sample; `DropboxFinder` indexes dropboxes by configuration-file
//! path and reports add/remove/change events on re-walk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use crate::config::DropboxFileConfig;
use crate::error::ConfigError;
use crate::tree::TreeRoot;

#[derive(Debug, Clone)]
pub struct Dropbox {
    config_path: PathBuf,
    config: DropboxFileConfig,
    /// Last tree samples, one per search path (spec §3.3: the Dropbox owns
    /// its cached TreeRoot list, last sample only).
    trees: Vec<Rc<TreeRoot>>,
}

impl Dropbox {
    pub fn load(config_path: &Path) -> Result<Dropbox, ConfigError> {
        let config = DropboxFileConfig::load(config_path)?;
        Ok(Dropbox {
            config_path: config_path.to_path_buf(),
            config,
            trees: Vec::new(),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config(&self) -> &DropboxFileConfig {
        &self.config
    }

    /// Config-relative or absolute search paths, resolved against the
    /// dropbox's directory (spec §4.8: "absolute or config-relative").
    pub fn package_search_paths(&self) -> Vec<PathBuf> {
        let base = self.config_path.parent().unwrap_or_else(|| Path::new("."));
        self.config
            .package
            .search_paths
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { base.join(p) })
            .collect()
    }

    pub fn clear_configuration_cache(&mut self) -> Result<(), ConfigError> {
        self.config = DropboxFileConfig::load(&self.config_path)?;
        Ok(())
    }

    pub fn trees(&self) -> &[Rc<TreeRoot>] {
        &self.trees
    }

    /// Re-samples every search path, replacing the cached tree list.
    pub fn sample(&mut self) -> std::io::Result<()> {
        let mut trees = Vec::new();
        for path in self.package_search_paths() {
            trees.push(Rc::new(TreeRoot::sample(&path, self.config.one_package_per_file)?));
        }
        self.trees = trees;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StatKey {
    size: u64,
    mtime: i64,
}

fn stat_key(path: &Path) -> std::io::Result<StatKey> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(StatKey { size: meta.len(), mtime })
}

/// Minimal `fnmatch`-style glob: `*` matches any run of characters, `?`
/// matches exactly one. No character classes, matching the simple globs used
/// for `config_file_glob` (e.g. `.dropbox.yaml`, `*.yaml`).
fn fnmatch(name: &str, pattern: &str) -> bool {
    fn go(name: &[u8], pattern: &[u8]) -> bool {
        match (name.first(), pattern.first()) {
            (_, Some(b'*')) => go(name, &pattern[1..]) || (!name.is_empty() && go(&name[1..], pattern)),
            (Some(_), Some(b'?')) => go(&name[1..], &pattern[1..]),
            (Some(n), Some(p)) if n == p => go(&name[1..], &pattern[1..]),
            (None, None) => true,
            _ => false,
        }
    }
    go(name.as_bytes(), pattern.as_bytes())
}

#[derive(Debug, Clone)]
pub enum FinderEvent {
    Added(PathBuf),
    Removed(PathBuf),
    Changed(PathBuf),
}

pub struct DropboxFinder {
    paths: Vec<PathBuf>,
    max_depth: usize,
    config_file_glob: String,
    dropboxes: BTreeMap<PathBuf, (StatKey, Dropbox)>,
}

impl DropboxFinder {
    pub fn new(paths: Vec<PathBuf>, max_depth: usize, config_file_glob: String) -> DropboxFinder {
        DropboxFinder {
            paths,
            max_depth: max_depth.max(1),
            config_file_glob,
            dropboxes: BTreeMap::new(),
        }
    }

    pub fn iter_dropboxes(&self) -> impl Iterator<Item = &Dropbox> {
        self.dropboxes.values().map(|(_, db)| db)
    }

    pub fn get(&self, config_path: &Path) -> Option<&Dropbox> {
        self.dropboxes.get(config_path).map(|(_, db)| db)
    }

    /// `dropbox_by_contained_path`: matches by search path, not config path
    /// (spec §4.8).
    pub fn dropbox_by_contained_path(&self, path: &Path) -> Option<&Dropbox> {
        self.iter_dropboxes()
            .find(|db| db.package_search_paths().iter().any(|sp| path.starts_with(sp)))
    }

    fn walk(&self, base: &Path, events: &mut Vec<FinderEvent>, new_map: &mut BTreeMap<PathBuf, StatKey>) {
        self.walk_depth(base, base, 1, events, new_map);
    }

    fn walk_depth(&self, base: &Path, dir: &Path, depth: usize, events: &mut Vec<FinderEvent>, new_map: &mut BTreeMap<PathBuf, StatKey>) {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        let _ = base;
        for entry in entries.flatten() {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                if depth < self.max_depth {
                    self.walk_depth(base, &path, depth + 1, events, new_map);
                }
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !fnmatch(name, &self.config_file_glob) {
                continue;
            }
            let stat = match stat_key(&path) {
                Ok(s) => s,
                Err(_) => continue,
            };
            new_map.insert(path, stat);
        }
    }

    /// Re-walks the roots, matching `config_file_glob`, emitting *added*,
    /// *removed*, *changed* events. `known_only=true` only re-stats already
    /// known paths (spec §4.8).
    pub fn update(&mut self, known_only: bool) -> Vec<FinderEvent> {
        let mut events = Vec::new();

        if known_only {
            let known: Vec<PathBuf> = self.dropboxes.keys().cloned().collect();
            for path in known {
                match stat_key(&path) {
                    Ok(new_stat) => {
                        let (old_stat, _) = self.dropboxes.get(&path).unwrap();
                        if *old_stat != new_stat {
                            if let Some((stat, db)) = self.dropboxes.get_mut(&path) {
                                *stat = new_stat;
                                if db.clear_configuration_cache().is_ok() {
                                    events.push(FinderEvent::Changed(path));
                                }
                            }
                        }
                    }
                    Err(_) => {
                        self.dropboxes.remove(&path);
                        events.push(FinderEvent::Removed(path));
                    }
                }
            }
            return events;
        }

        let mut seen: BTreeMap<PathBuf, StatKey> = BTreeMap::new();
        for base in self.paths.clone() {
            if !base.is_dir() {
                log::warn!("skipping unaccessible dropbox search base {}", base.display());
                continue;
            }
            self.walk(&base, &mut events, &mut seen);
        }

        for (path, stat) in &seen {
            if let Some((old_stat, db)) = self.dropboxes.get_mut(path) {
                if old_stat != stat {
                    *old_stat = *stat;
                    if db.clear_configuration_cache().is_ok() {
                        events.push(FinderEvent::Changed(path.clone()));
                    }
                }
            } else {
                match Dropbox::load(path) {
                    Ok(db) => {
                        self.dropboxes.insert(path.clone(), (*stat, db));
                        events.push(FinderEvent::Added(path.clone()));
                    }
                    Err(e) => log::error!("couldn't load dropbox config at {}: {e}", path.display()),
                }
            }
        }

        let removed: Vec<PathBuf> = self
            .dropboxes
            .keys()
            .filter(|p| !seen.contains_key(*p))
            .cloned()
            .collect();
        for path in removed {
            self.dropboxes.remove(&path);
            events.push(FinderEvent::Removed(path));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_dropbox_yaml(dir: &Path, search_path: &Path) {
        fs::write(
            dir.join(".dropbox.yaml"),
            format!(
                "package:\n  stable_after: 30\n  search_paths:\n    - {}\n",
                search_path.display()
            ),
        )
        .unwrap();
    }

    #[test]
    fn finder_detects_added_changed_removed() {
        let root = tempdir().unwrap();
        let drop_dir = root.path().join("drop1");
        fs::create_dir_all(&drop_dir).unwrap();
        let search = root.path().join("incoming");
        fs::create_dir_all(&search).unwrap();
        write_dropbox_yaml(&drop_dir, &search);

        let mut finder = DropboxFinder::new(vec![root.path().to_path_buf()], 2, ".dropbox.yaml".to_string());
        let events = finder.update(false);
        assert!(matches!(events.as_slice(), [FinderEvent::Added(_)]));
        assert_eq!(finder.iter_dropboxes().count(), 1);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        write_dropbox_yaml(&drop_dir, &search);
        let events = finder.update(false);
        assert!(matches!(events.as_slice(), [FinderEvent::Changed(_)]));

        fs::remove_file(drop_dir.join(".dropbox.yaml")).unwrap();
        let events = finder.update(false);
        assert!(matches!(events.as_slice(), [FinderEvent::Removed(_)]));
        assert_eq!(finder.iter_dropboxes().count(), 0);
    }

    #[test]
    fn dropbox_by_contained_path_matches_search_roots() {
        let root = tempdir().unwrap();
        let drop_dir = root.path().join("drop1");
        fs::create_dir_all(&drop_dir).unwrap();
        let search = root.path().join("incoming");
        fs::create_dir_all(&search).unwrap();
        write_dropbox_yaml(&drop_dir, &search);

        let mut finder = DropboxFinder::new(vec![root.path().to_path_buf()], 2, ".dropbox.yaml".to_string());
        finder.update(false);

        let pkg_path = search.join("a_file.txt");
        let found = finder.dropbox_by_contained_path(&pkg_path);
        assert!(found.is_some());
        assert!(finder.dropbox_by_contained_path(Path::new("/nowhere")).is_none());
    }

    #[test]
    fn fnmatch_supports_star_and_question_mark() {
        assert!(fnmatch(".dropbox.yaml", ".dropbox.yaml"));
        assert!(fnmatch("a.yaml", "*.yaml"));
        assert!(!fnmatch("a.yml", "*.yaml"));
        assert!(fnmatch("abc", "a?c"));
    }
}

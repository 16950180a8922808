use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::error::{Error, Result};

/// Fingerprint of one eclass file: where it lives and when it last changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EclassData {
    /// Directory or file path the eclass was loaded from.
    pub path: PathBuf,
    /// Modification time in seconds since the epoch.
    pub mtime: i64,
}

/// The eclasses a package inherited, keyed by name.
///
/// Iteration is in name order, so `INHERITED` strings built from a chain are
/// stable across rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EclassChain {
    entries: BTreeMap<String, EclassData>,
}

impl EclassChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an eclass fingerprint.
    pub fn insert(&mut self, name: impl Into<String>, data: EclassData) {
        self.entries.insert(name.into(), data);
    }

    /// Look up a single eclass.
    pub fn get(&self, name: &str) -> Option<&EclassData> {
        self.entries.get(name)
    }

    /// Iterate `(name, fingerprint)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EclassData)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Eclass names in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of eclasses in the chain.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is inherited.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest mtime among the inherited eclasses.
    pub fn max_mtime(&self) -> Option<i64> {
        self.entries.values().map(|d| d.mtime).max()
    }

    /// Flatten to the legacy space separated `INHERITED` form.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_cache::{EclassChain, EclassData};
    ///
    /// let mut chain = EclassChain::new();
    /// chain.insert("eutils", EclassData { path: "/e".into(), mtime: 100 });
    /// chain.insert("base", EclassData { path: "/e".into(), mtime: 200 });
    /// assert_eq!(chain.to_inherited(), "base eutils");
    /// ```
    pub fn to_inherited(&self) -> String {
        self.names().collect::<Vec<_>>().join(" ")
    }

    /// Serialize as tab separated `name path mtime` triples.
    pub fn serialize(&self) -> String {
        let mut parts = Vec::with_capacity(self.entries.len() * 3);
        for (name, data) in &self.entries {
            parts.push(name.clone());
            parts.push(data.path.display().to_string());
            parts.push(data.mtime.to_string());
        }
        parts.join("\t")
    }

    /// Parse the output of [`EclassChain::serialize`].
    ///
    /// Returns a description of the problem on malformed input, callers turn
    /// it into a cache corruption for the entry at hand.
    pub fn deserialize(input: &str) -> std::result::Result<EclassChain, String> {
        let input = input.trim();
        let mut chain = EclassChain::new();
        if input.is_empty() {
            return Ok(chain);
        }
        let parts: Vec<&str> = input.split('\t').collect();
        if parts.len() % 3 != 0 {
            return Err(format!(
                "_eclasses_ has {} fields, expected triples",
                parts.len()
            ));
        }
        for triple in parts.chunks(3) {
            let mtime = triple[2]
                .parse::<i64>()
                .map_err(|_| format!("bad eclass mtime {:?} for {}", triple[2], triple[0]))?;
            chain.insert(
                triple[0],
                EclassData {
                    path: PathBuf::from(triple[1]),
                    mtime,
                },
            );
        }
        Ok(chain)
    }
}

/// Read-only table of the eclasses available in a repository.
///
/// Built once and shared by every derivation; a changed eclass directory
/// needs a fresh table.
#[derive(Debug, Clone, Default)]
pub struct EclassCache {
    location: PathBuf,
    table: BTreeMap<String, EclassData>,
}

impl EclassCache {
    /// Scan `dir` for `*.eclass` files.
    ///
    /// A missing directory yields an empty table.
    pub fn scan(dir: impl AsRef<Path>) -> Result<EclassCache> {
        let dir = dir.as_ref();
        let mut table = BTreeMap::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(EclassCache {
                    location: dir.to_path_buf(),
                    table,
                })
            }
            Err(source) => {
                return Err(Error::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let Some(name) = path
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(|f| f.strip_suffix(".eclass"))
            else {
                continue;
            };
            let mtime = file_mtime(&path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            table.insert(
                name.to_string(),
                EclassData {
                    path: dir.to_path_buf(),
                    mtime,
                },
            );
        }

        tracing::debug!(location = %dir.display(), eclasses = table.len(), "scanned eclasses");
        Ok(EclassCache {
            location: dir.to_path_buf(),
            table,
        })
    }

    /// Build a table from known fingerprints.
    pub fn from_entries<I, S>(location: impl Into<PathBuf>, entries: I) -> EclassCache
    where
        I: IntoIterator<Item = (S, EclassData)>,
        S: Into<String>,
    {
        EclassCache {
            location: location.into(),
            table: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Directory the table was built from.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Current fingerprint of an eclass.
    pub fn get(&self, name: &str) -> Option<&EclassData> {
        self.table.get(name)
    }

    /// Build a chain for the named eclasses from their current fingerprints.
    pub fn get_eclass_data<'a, I>(&self, names: I) -> Result<EclassChain>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut chain = EclassChain::new();
        for name in names {
            let data = self
                .table
                .get(name)
                .ok_or_else(|| Error::UnknownEclass(name.to_string()))?;
            chain.insert(name, data.clone());
        }
        Ok(chain)
    }

    /// Whether every eclass in `chain` still fingerprints identically.
    ///
    /// A missing eclass or any mtime/path mismatch invalidates the chain.
    pub fn is_valid(&self, chain: &EclassChain) -> bool {
        chain
            .iter()
            .all(|(name, data)| self.table.get(name) == Some(data))
    }
}

/// Modification time of `path` in whole seconds.
pub(crate) fn file_mtime(path: &Path) -> io::Result<i64> {
    let meta = fs::metadata(path)?;
    Ok(FileTime::from_last_modification_time(&meta).unix_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;

    fn data(mtime: i64) -> EclassData {
        EclassData {
            path: PathBuf::from("/usr/portage/eclass"),
            mtime,
        }
    }

    #[test]
    fn inherited_order_is_stable() {
        let mut a = EclassChain::new();
        a.insert("eutils", data(100));
        a.insert("base", data(200));
        let mut b = EclassChain::new();
        b.insert("base", data(200));
        b.insert("eutils", data(100));
        assert_eq!(a.to_inherited(), "base eutils");
        assert_eq!(a.to_inherited(), b.to_inherited());
    }

    #[test]
    fn inherited_reconstructs_chain() {
        let cache = EclassCache::from_entries(
            "/usr/portage/eclass",
            [("eutils", data(100)), ("base", data(200))],
        );
        let mut chain = EclassChain::new();
        chain.insert("eutils", data(100));
        chain.insert("base", data(200));
        let rebuilt = cache
            .get_eclass_data(chain.to_inherited().split_whitespace())
            .unwrap();
        assert_eq!(rebuilt, chain);
    }

    #[test]
    fn serialize_round_trip() {
        let mut chain = EclassChain::new();
        chain.insert("eutils", data(100));
        chain.insert("toolchain-funcs", data(1_170_000_000));
        let text = chain.serialize();
        assert_eq!(
            text,
            "eutils\t/usr/portage/eclass\t100\ttoolchain-funcs\t/usr/portage/eclass\t1170000000"
        );
        assert_eq!(EclassChain::deserialize(&text).unwrap(), chain);
    }

    #[test]
    fn deserialize_rejects_partial_triples() {
        assert!(EclassChain::deserialize("eutils\t/path").is_err());
        assert!(EclassChain::deserialize("eutils\t/path\tnotanumber").is_err());
        assert!(EclassChain::deserialize("").unwrap().is_empty());
    }

    #[test]
    fn validity() {
        let cache = EclassCache::from_entries("/e", [("eutils", data(100))]);
        let mut chain = EclassChain::new();
        chain.insert("eutils", data(100));
        assert!(cache.is_valid(&chain));
        assert!(cache.is_valid(&EclassChain::new()));

        let mut stale = EclassChain::new();
        stale.insert("eutils", data(99));
        assert!(!cache.is_valid(&stale));

        let mut missing = chain.clone();
        missing.insert("flag-o-matic", data(100));
        assert!(!cache.is_valid(&missing));
    }

    #[test]
    fn unknown_eclass() {
        let cache = EclassCache::from_entries("/e", [("eutils", data(100))]);
        let err = cache.get_eclass_data(["eutils", "gnome2"]).unwrap_err();
        assert!(matches!(err, Error::UnknownEclass(ref name) if name == "gnome2"));
    }

    #[test]
    fn scan_directory() {
        let dir = tempfile::tempdir().unwrap();
        let eutils = dir.path().join("eutils.eclass");
        fs::write(&eutils, "# eutils\n").unwrap();
        fs::write(dir.path().join("README"), "not an eclass\n").unwrap();
        set_file_mtime(&eutils, FileTime::from_unix_time(1234, 0)).unwrap();

        let cache = EclassCache::scan(dir.path()).unwrap();
        let entry = cache.get("eutils").unwrap();
        assert_eq!(entry.mtime, 1234);
        assert_eq!(entry.path, dir.path());
        assert!(cache.get("README").is_none());
    }

    #[test]
    fn scan_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EclassCache::scan(dir.path().join("eclass")).unwrap();
        assert!(cache.get("eutils").is_none());
    }
}

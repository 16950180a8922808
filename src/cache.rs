use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use filetime::FileTime;

use crate::eclass::{file_mtime, EclassCache, EclassChain};
use crate::error::{Error, Result};
use crate::record::{MetadataRecord, AUXDB_KEYS, ECLASSES_KEY, MTIME_KEY};

/// Line count of a flat-list cache entry. Fixed by the legacy format.
pub const MAGIC_LINE_COUNT: usize = 22;

static UPDATE_SEQ: AtomicU64 = AtomicU64::new(0);

/// On-disk encoding of a [`MetadataCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLayout {
    /// Exactly [`MAGIC_LINE_COUNT`] lines, one value per line in
    /// [`AUXDB_KEYS`] order. Eclasses are stored as `INHERITED`.
    FlatList,
    /// `KEY=value` lines with a structured `_eclasses_` field.
    FlatHash,
    /// Lenient reader accepting both of the above; writes `KEY=value`
    /// lines with eclasses flattened to `INHERITED`.
    Protective,
}

/// Settings for a [`MetadataCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Repository base; entries live below `<location>/metadata/cache`.
    pub location: PathBuf,
    /// Name used in diagnostics.
    pub label: String,
    pub layout: CacheLayout,
    pub readonly: bool,
    /// Flat-list line schema. Defaults to [`AUXDB_KEYS`]; `KEY=value`
    /// layouts also store fields outside it.
    pub known_keys: Option<Vec<String>>,
}

impl CacheConfig {
    /// A writable [`CacheLayout::FlatList`] cache below `location` with the
    /// default schema.
    pub fn new(location: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        CacheConfig {
            location: location.into(),
            label: label.into(),
            layout: CacheLayout::FlatList,
            readonly: false,
            known_keys: None,
        }
    }

    /// Set the on-disk layout.
    pub fn layout(mut self, layout: CacheLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Refuse writes when `readonly` is true.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Replace the field schema. Keys missing from [`AUXDB_KEYS`] have no
    /// flat-list line and are only stored by the `KEY=value` layouts.
    pub fn known_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }
}

/// A keyed store of [`MetadataRecord`]s.
///
/// Implementations must be safe to share between worker threads; writes are
/// expected to become visible atomically.
pub trait CacheStore: Send + Sync {
    /// Name used in diagnostics.
    fn label(&self) -> &str;

    /// Whether [`CacheStore::set`] is refused.
    fn readonly(&self) -> bool;

    /// Whether `field` can be stored and read back unchanged.
    fn accepts(&self, _field: &str) -> bool {
        true
    }

    /// Read the record for `key`, `Ok(None)` if there is no entry.
    fn get(&self, key: &str) -> Result<Option<MetadataRecord>>;

    /// Store `record` under `key`, replacing any previous entry.
    fn set(&self, key: &str, record: &MetadataRecord) -> Result<()>;
}

/// File-per-package metadata cache below `<base>/metadata/cache/`.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    label: String,
    location: PathBuf,
    layout: CacheLayout,
    readonly: bool,
    line_index: Vec<(usize, &'static str)>,
    eclasses: Arc<EclassCache>,
}

impl MetadataCache {
    /// Create a cache sharing an existing eclass table.
    pub fn new(config: CacheConfig, eclasses: Arc<EclassCache>) -> Self {
        let known_keys: BTreeSet<String> = match config.known_keys {
            Some(keys) => keys.into_iter().collect(),
            None => AUXDB_KEYS.iter().map(|k| k.to_string()).collect(),
        };
        let line_index = AUXDB_KEYS
            .iter()
            .enumerate()
            .filter(|(_, key)| known_keys.contains(**key))
            .map(|(idx, key)| (idx, *key))
            .collect();

        MetadataCache {
            label: config.label,
            location: config.location.join("metadata").join("cache"),
            layout: config.layout,
            readonly: config.readonly,
            line_index,
            eclasses,
        }
    }

    /// Create a cache, scanning `<base>/eclass` for the eclass table.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let eclasses = EclassCache::scan(config.location.join("eclass"))?;
        Ok(MetadataCache::new(config, Arc::new(eclasses)))
    }

    /// Directory holding the entries.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// On-disk layout of the entries.
    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    /// Eclass table used to rebuild chains from `INHERITED`.
    pub fn eclasses(&self) -> &Arc<EclassCache> {
        &self.eclasses
    }

    /// All keys present, as `category/name-version`, sorted.
    ///
    /// In-flight temporary files are skipped.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let categories = match fs::read_dir(&self.location) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(source) => {
                return Err(Error::Io {
                    path: self.location.clone(),
                    source,
                })
            }
        };
        for category in categories {
            let category = category.map_err(|source| self.io_error(source))?;
            if !category.path().is_dir() {
                continue;
            }
            let cat_name = category.file_name().to_string_lossy().into_owned();
            let entries = fs::read_dir(category.path()).map_err(|source| Error::Io {
                path: category.path(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| self.io_error(source))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                keys.push(format!("{cat_name}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::Io {
            path: self.location.clone(),
            source,
        }
    }

    fn parse_lines(&self, key: &str, lines: &[&str]) -> Result<BTreeMap<String, String>> {
        match self.layout {
            CacheLayout::FlatList => {
                if lines.len() != MAGIC_LINE_COUNT {
                    return Err(Error::GeneralCacheCorruption {
                        key: key.to_string(),
                        reason: format!(
                            "wrong line count: {} (expected {MAGIC_LINE_COUNT})",
                            lines.len()
                        ),
                    });
                }
                Ok(self.parse_fixed(lines))
            }
            CacheLayout::FlatHash => parse_hashed(key, lines),
            CacheLayout::Protective => {
                if lines.len() != MAGIC_LINE_COUNT {
                    return parse_hashed(key, lines);
                }
                self.parse_protective(lines)
            }
        }
    }

    fn parse_fixed(&self, lines: &[&str]) -> BTreeMap<String, String> {
        self.line_index
            .iter()
            .map(|(idx, key)| (key.to_string(), lines[*idx].trim().to_string()))
            .collect()
    }

    // Compatibility shim for hand-edited caches: a 22 line file is only
    // treated as key=value if every line looks like `KEY=`.
    fn parse_protective(&self, lines: &[&str]) -> Result<BTreeMap<String, String>> {
        let mut hashed = BTreeMap::new();
        for line in lines {
            match split_hashed(line) {
                Some((key, value)) => {
                    hashed.insert(key.to_string(), value.to_string());
                }
                None => return Ok(self.parse_fixed(lines)),
            }
        }
        Ok(hashed)
    }

    fn check_schema(&self, key: &str, record: &MetadataRecord) -> Result<()> {
        for (field, _) in record.fields() {
            if !self.accepts(field) {
                return Err(Error::UnknownField {
                    key: key.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    fn serialize(&self, record: &MetadataRecord) -> String {
        let mut values: BTreeMap<&str, String> = record
            .fields()
            .map(|(k, v)| (k, sanitize(v)))
            .collect();

        match self.layout {
            CacheLayout::FlatList => {
                if let Some(chain) = &record.eclasses {
                    values.insert("INHERITED", chain.to_inherited());
                }
                let mut out = String::new();
                for idx in 0..MAGIC_LINE_COUNT {
                    if let Some(key) = AUXDB_KEYS.get(idx) {
                        if let Some(value) = values.get(key) {
                            out.push_str(value);
                        }
                    }
                    out.push('\n');
                }
                out
            }
            CacheLayout::Protective => {
                if let Some(chain) = &record.eclasses {
                    values.insert("INHERITED", chain.to_inherited());
                }
                format_hashed(&values, None)
            }
            CacheLayout::FlatHash => format_hashed(&values, record.eclasses.as_ref()),
        }
    }

    fn target_mtime(&self, record: &MetadataRecord) -> Option<i64> {
        match self.layout {
            // INHERITED loses the eclass mtimes, so the entry has to be at
            // least as new as the newest eclass.
            CacheLayout::FlatList | CacheLayout::Protective => {
                let eclass_mtime = record.eclasses.as_ref().and_then(EclassChain::max_mtime);
                match (record.mtime, eclass_mtime) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            }
            CacheLayout::FlatHash => record.mtime,
        }
    }

    fn write_atomic(&self, key: &str, contents: &str, mtime: Option<i64>) -> Result<()> {
        let corruption = |source: io::Error| Error::CacheCorruption {
            key: key.to_string(),
            source,
        };

        let (dir, name) = match key.rfind('/') {
            Some(s) => (self.location.join(&key[..s]), &key[s + 1..]),
            None => (self.location.clone(), key),
        };
        let seq = UPDATE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".update.{}.{seq}.{name}", std::process::id()));

        let mut file = match File::create(&tmp) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir).map_err(corruption)?;
                File::create(&tmp).map_err(corruption)?
            }
            Err(e) => return Err(corruption(e)),
        };

        let written = file
            .write_all(contents.as_bytes())
            .and_then(|()| file.sync_all());
        drop(file);
        let finished = written.and_then(|()| match mtime {
            Some(mtime) => filetime::set_file_mtime(&tmp, FileTime::from_unix_time(mtime, 0)),
            None => Ok(()),
        });
        if let Err(e) = finished {
            let _ = fs::remove_file(&tmp);
            return Err(corruption(e));
        }

        if let Err(e) = fs::rename(&tmp, self.location.join(key)) {
            let _ = fs::remove_file(&tmp);
            return Err(corruption(e));
        }
        Ok(())
    }
}

impl CacheStore for MetadataCache {
    fn label(&self) -> &str {
        &self.label
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn accepts(&self, field: &str) -> bool {
        match self.layout {
            CacheLayout::FlatList => self.line_index.iter().any(|(_, key)| *key == field),
            CacheLayout::FlatHash | CacheLayout::Protective => {
                field != "INHERITED" && hashed_key_len(&format!("{field}=")) == Some(field.len())
            }
        }
    }

    fn get(&self, key: &str) -> Result<Option<MetadataRecord>> {
        let path = self.location.join(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(Error::GeneralCacheCorruption {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(source) => return Err(Error::Io { path, source }),
        };
        let mtime = file_mtime(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        let lines: Vec<&str> = contents.lines().collect();
        let mut raw = self.parse_lines(key, &lines)?;
        raw.remove(MTIME_KEY);
        let serialized_chain = raw.remove(ECLASSES_KEY);
        let inherited = raw.remove("INHERITED");

        let eclasses = match (serialized_chain, inherited) {
            (Some(serialized), _) => Some(EclassChain::deserialize(&serialized).map_err(
                |reason| Error::GeneralCacheCorruption {
                    key: key.to_string(),
                    reason,
                },
            )?),
            (None, Some(inherited)) => Some(
                self.eclasses
                    .get_eclass_data(inherited.split_whitespace())
                    .map_err(|e| Error::GeneralCacheCorruption {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?,
            ),
            (None, None) => None,
        };

        let mut record = MetadataRecord::from_fields(raw);
        record.mtime = Some(mtime);
        record.eclasses = eclasses;
        Ok(Some(record))
    }

    fn set(&self, key: &str, record: &MetadataRecord) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnlyCache(self.label.clone()));
        }
        self.check_schema(key, record)?;
        let contents = self.serialize(record);
        self.write_atomic(key, &contents, self.target_mtime(record))
    }
}

/// Length of the `KEY` part if `line` starts with an uppercase identifier
/// followed by `=`.
fn hashed_key_len(line: &str) -> Option<usize> {
    #[derive(Clone, Copy)]
    enum Scan {
        Start,
        Key,
    }

    let mut state = Scan::Start;
    for (idx, c) in line.char_indices() {
        state = match (state, c) {
            (Scan::Key, '=') => return Some(idx),
            (_, 'A'..='Z' | '0'..='9' | '_') => Scan::Key,
            _ => return None,
        };
    }
    None
}

fn split_hashed(line: &str) -> Option<(&str, &str)> {
    for reserved in [ECLASSES_KEY, MTIME_KEY] {
        if let Some(value) = line
            .strip_prefix(reserved)
            .and_then(|rest| rest.strip_prefix('='))
        {
            return Some((reserved, value));
        }
    }
    let idx = hashed_key_len(line)?;
    Some((&line[..idx], &line[idx + 1..]))
}

fn parse_hashed(key: &str, lines: &[&str]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (lineno, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (k, v) = split_hashed(line).ok_or_else(|| Error::GeneralCacheCorruption {
            key: key.to_string(),
            reason: format!("line {} is not a KEY=value pair", lineno + 1),
        })?;
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

fn format_hashed(values: &BTreeMap<&str, String>, eclasses: Option<&EclassChain>) -> String {
    let mut out = String::new();
    for (key, value) in values {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    if let Some(chain) = eclasses {
        out.push_str(ECLASSES_KEY);
        out.push('=');
        out.push_str(&chain.serialize());
        out.push('\n');
    }
    out
}

/// Values are single line in every layout.
fn sanitize(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

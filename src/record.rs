use std::collections::BTreeMap;

use crate::eclass::{EclassCache, EclassChain};

/// Field names of the legacy metadata schema, in flat-list line order.
pub const AUXDB_KEYS: [&str; 15] = [
    "DEPEND",
    "RDEPEND",
    "SLOT",
    "SRC_URI",
    "RESTRICT",
    "HOMEPAGE",
    "LICENSE",
    "DESCRIPTION",
    "KEYWORDS",
    "INHERITED",
    "IUSE",
    "CDEPEND",
    "PDEPEND",
    "PROVIDE",
    "EAPI",
];

/// Reserved key carrying the source mtime in key=value records.
pub const MTIME_KEY: &str = "_mtime_";

/// Reserved key carrying the serialized eclass chain in key=value records.
pub const ECLASSES_KEY: &str = "_eclasses_";

/// Raw metadata of one package version, as stored in a cache entry.
///
/// Holds plain string fields plus the two reserved values: the source
/// mtime at derivation time and the eclass chain. A record with no chain
/// (`eclasses == None`) comes from a cache that only knows `INHERITED`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    fields: BTreeMap<String, String>,
    /// Ebuild mtime (`_mtime_`) at derivation time.
    pub mtime: Option<i64>,
    /// Inherited eclasses (`_eclasses_`).
    pub eclasses: Option<EclassChain>,
}

impl MetadataRecord {
    /// An empty record with no mtime and no eclass chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(field, value)` pairs.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        MetadataRecord {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            mtime: None,
            eclasses: None,
        }
    }

    /// Raw value of a plain field. Reserved keys are not fields.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Remove a field, returning its value if it was present.
    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.fields.remove(field)
    }

    /// Remove a field, returning an empty string if it was absent.
    pub fn take(&mut self, field: &str) -> String {
        self.fields.remove(field).unwrap_or_default()
    }

    /// Whether the field is present, even with an empty value.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Plain fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the record has no plain fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Keep only the fields for which `keep` returns true, returning the
    /// names of the dropped ones.
    pub fn retain_fields<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let mut dropped = Vec::new();
        self.fields.retain(|field, _| {
            let kept = keep(field);
            if !kept {
                dropped.push(field.clone());
            }
            kept
        });
        dropped
    }

    /// Whether this record may be used for an ebuild with mtime `source_mtime`.
    ///
    /// Requires an exact mtime match, and, when an eclass chain is present,
    /// every eclass in it must still fingerprint identically.
    pub fn is_fresh(&self, source_mtime: i64, eclasses: &EclassCache) -> bool {
        if self.mtime != Some(source_mtime) {
            return false;
        }
        match &self.eclasses {
            Some(chain) => eclasses.is_valid(chain),
            None => true,
        }
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::depset::{DepSet, DepSetParser};
use crate::error::{Error, Result};

/// Checksum type (e.g. `SHA512`) to hex digest.
pub type Checksums = BTreeMap<String, String>;

/// Per-package digest data: distfile name to checksums.
pub type Digests = HashMap<String, Checksums>;

/// A named group of mirror base URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    name: String,
    urls: Vec<String>,
}

impl Mirror {
    /// A mirror group named `name` with base URLs in preference order.
    pub fn new<I, S>(name: impl Into<String>, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Mirror {
            name: name.into(),
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    /// Tier name, as used in `mirror://<name>/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URLs, each joined with the distfile path on expansion.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Mirror tiers addressable through `mirror://<tier>/` plus optional
/// default mirrors tried for every distfile.
#[derive(Debug, Clone, Default)]
pub struct MirrorConfig {
    tiers: HashMap<String, Arc<Mirror>>,
    default_mirrors: Option<Arc<Mirror>>,
}

impl MirrorConfig {
    /// No tiers and no default mirrors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a mirror tier.
    pub fn with_tier<I, S>(mut self, tier: &str, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tiers
            .insert(tier.to_string(), Arc::new(Mirror::new(tier, urls)));
        self
    }

    /// Set the default mirrors.
    pub fn with_default_mirrors<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mirror = Mirror::new("default", urls);
        self.default_mirrors = if mirror.urls.is_empty() {
            None
        } else {
            Some(Arc::new(mirror))
        };
        self
    }

    /// Parse the `profiles/thirdpartymirrors` format: one
    /// `tier url [url...]` per line, `#` starts a comment.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_cache::MirrorConfig;
    ///
    /// let mirrors = MirrorConfig::parse_thirdpartymirrors(
    ///     "# tiers\ngnu http://ftp.gnu.org/gnu http://ftpmirror.gnu.org\n",
    /// );
    /// assert_eq!(mirrors.get("gnu").unwrap().urls().len(), 2);
    /// ```
    pub fn parse_thirdpartymirrors(input: &str) -> Self {
        let mut config = MirrorConfig::new();
        for line in input.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let Some(tier) = fields.next() else {
                continue;
            };
            let urls: Vec<&str> = fields.collect();
            if urls.is_empty() {
                continue;
            }
            config = config.with_tier(tier, urls);
        }
        config
    }

    /// Read a `thirdpartymirrors` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse_thirdpartymirrors(&text))
    }

    /// Look up a `mirror://` tier.
    pub fn get(&self, tier: &str) -> Option<&Arc<Mirror>> {
        self.tiers.get(tier)
    }

    /// Mirrors tried for every distfile unless restricted.
    pub fn default_mirrors(&self) -> Option<&Arc<Mirror>> {
        self.default_mirrors.as_ref()
    }
}

/// Where a distfile may be retrieved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriSource {
    /// A literal URI.
    Direct(String),
    /// `path` below every base URL of a mirror group.
    Mirror { mirror: Arc<Mirror>, path: String },
}

/// Ordered, duplicate free retrieval locations for one distfile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriList {
    sources: Vec<UriSource>,
}

impl UriList {
    /// Append a literal URI.
    pub fn add_uri(&mut self, uri: &str) {
        let source = UriSource::Direct(uri.to_string());
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    /// Append a mirror group serving `path`.
    pub fn add_mirror(&mut self, mirror: &Arc<Mirror>, path: &str) {
        let source = UriSource::Mirror {
            mirror: Arc::clone(mirror),
            path: path.to_string(),
        };
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    /// Sources in the order they were added.
    pub fn sources(&self) -> &[UriSource] {
        &self.sources
    }

    /// Expand mirror groups into concrete URLs, in priority order.
    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        self.sources.iter().flat_map(|source| match source {
            UriSource::Direct(uri) => vec![uri.clone()],
            UriSource::Mirror { mirror, path } => mirror
                .urls()
                .iter()
                .map(|base| format!("{}/{}", base.trim_end_matches('/'), path))
                .collect(),
        })
    }

    /// Whether no source was added.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// A distfile with its checksums and candidate locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetchable {
    pub filename: String,
    pub uris: UriList,
    pub chksums: Checksums,
}

impl fmt::Display for Fetchable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.filename)
    }
}

/// Builds [`Fetchable`]s for the URI tokens of one `SRC_URI` depset.
///
/// Repeated references to the same filename share one fetchable and merge
/// their URIs.
pub struct FetchableResolver<'a> {
    digests: &'a Digests,
    mirrors: &'a MirrorConfig,
    restrict: &'a BTreeSet<String>,
    files: Vec<Fetchable>,
    index: HashMap<String, usize>,
}

impl<'a> FetchableResolver<'a> {
    /// `restrict` holds the package's normalized `RESTRICT` tokens.
    pub fn new(
        digests: &'a Digests,
        mirrors: &'a MirrorConfig,
        restrict: &'a BTreeSet<String>,
    ) -> Self {
        FetchableResolver {
            digests,
            mirrors,
            restrict,
            files: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Parse and resolve a whole `SRC_URI` value.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::BTreeSet;
    /// use portage_cache::{Digests, FetchableResolver, MirrorConfig};
    ///
    /// let mirrors = MirrorConfig::new().with_tier("gentoo", ["http://distfiles.gentoo.org/distfiles"]);
    /// let mut digests = Digests::new();
    /// digests.insert("a.tar.gz".into(), [("MD5".to_string(), "00".to_string())].into());
    /// let restrict = BTreeSet::new();
    ///
    /// let set = FetchableResolver::new(&digests, &mirrors, &restrict)
    ///     .resolve("mirror://gentoo/a.tar.gz http://example.com/a.tar.gz")
    ///     .unwrap();
    /// let files = set.leaves();
    /// assert_eq!(files.len(), 2);
    /// assert!(std::sync::Arc::ptr_eq(files[0], files[1]));
    /// ```
    pub fn resolve(mut self, src_uri: &str) -> Result<DepSet<Arc<Fetchable>>> {
        let set = DepSetParser::without_any_of().parse(src_uri, |uri| self.add(uri))?;
        let shared: Vec<Arc<Fetchable>> = self.files.into_iter().map(Arc::new).collect();
        Ok(set.map(|idx| Arc::clone(&shared[idx])))
    }

    /// Register one URI token, returning the index of its fetchable.
    fn add(&mut self, uri: &str) -> Result<usize> {
        let filename = uri.rsplit('/').next().unwrap_or(uri);
        if filename.is_empty() {
            return Err(Error::InvalidDepSet(format!("no filename in uri {uri}")));
        }

        let (idx, preexisting) = match self.index.get(filename) {
            Some(idx) => (*idx, true),
            None => {
                let chksums = self
                    .digests
                    .get(filename)
                    .ok_or_else(|| Error::MissingChksum(filename.to_string()))?;
                self.files.push(Fetchable {
                    filename: filename.to_string(),
                    uris: UriList::default(),
                    chksums: chksums.clone(),
                });
                self.index.insert(filename.to_string(), self.files.len() - 1);
                (self.files.len() - 1, false)
            }
        };

        let mirrors = self.mirrors;
        let restrict_mirror = self.restrict.contains("mirror");
        let primary_first = self.restrict.contains("primaryuri");
        let uris = &mut self.files[idx].uris;

        if filename == uri {
            uris.add_uri(filename);
            if !preexisting && !restrict_mirror {
                if let Some(defaults) = mirrors.default_mirrors() {
                    uris.add_mirror(defaults, filename);
                }
            }
            return Ok(idx);
        }

        let mirror_path = uri.strip_prefix("mirror://");
        if !preexisting {
            if primary_first && mirror_path.is_none() {
                uris.add_uri(uri);
            }
            if !restrict_mirror {
                if let Some(defaults) = mirrors.default_mirrors() {
                    uris.add_mirror(defaults, filename);
                }
            }
        }

        match mirror_path {
            Some(rest) => {
                let (tier, path) = rest
                    .split_once('/')
                    .ok_or_else(|| Error::InvalidDepSet(format!("malformed mirror uri {uri}")))?;
                let mirror = mirrors.get(tier).ok_or_else(|| Error::UnknownMirror {
                    tier: tier.to_string(),
                    path: path.to_string(),
                })?;
                uris.add_mirror(mirror, path);
            }
            None => uris.add_uri(uri),
        }
        Ok(idx)
    }
}

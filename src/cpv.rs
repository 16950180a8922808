use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A `category/package[-version[-rN]]` identity.
///
/// Used as the cache key and as the file path suffix below a cache
/// directory. Only the split into components is done here; version
/// comparison belongs to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cpv {
    /// Category (e.g. `dev-libs`).
    pub category: String,
    /// Package name (e.g. `openssl`).
    pub package: String,
    /// Version without revision (e.g. `1.0.2`).
    pub version: Option<String>,
    /// Revision number without the `r` (e.g. `3` for `-r3`).
    pub revision: Option<String>,
}

impl Cpv {
    /// Parse a cpv string.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_cache::Cpv;
    ///
    /// let cpv = Cpv::parse("dev-libs/openssl-1.0.2-r3").unwrap();
    /// assert_eq!(cpv.package, "openssl");
    /// assert_eq!(cpv.fullver().as_deref(), Some("1.0.2-r3"));
    ///
    /// let unversioned = Cpv::parse("virtual/libc").unwrap();
    /// assert!(unversioned.version.is_none());
    /// ```
    pub fn parse(input: &str) -> Result<Cpv> {
        let (category, rest) = input
            .split_once('/')
            .ok_or_else(|| Error::InvalidCpv(input.to_string()))?;
        if category.is_empty() || rest.is_empty() || rest.contains('/') {
            return Err(Error::InvalidCpv(input.to_string()));
        }
        if rest.contains(char::is_whitespace) || category.contains(char::is_whitespace) {
            return Err(Error::InvalidCpv(input.to_string()));
        }

        let (package, version, revision) = split_version(rest);
        Ok(Cpv {
            category: category.to_string(),
            package: package.to_string(),
            version: version.map(str::to_string),
            revision: revision.map(str::to_string),
        })
    }

    /// Version including the revision suffix, if any.
    pub fn fullver(&self) -> Option<String> {
        let version = self.version.as_ref()?;
        Some(match &self.revision {
            Some(rev) => format!("{version}-r{rev}"),
            None => version.clone(),
        })
    }

    /// Return a copy carrying `fullver` as its version.
    pub fn with_fullver(&self, fullver: &str) -> Result<Cpv> {
        Cpv::parse(&format!("{}/{}-{}", self.category, self.package, fullver))
    }

    /// `category/package` without version.
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.package)
    }

    /// Package name (`PN`).
    pub fn pn(&self) -> &str {
        &self.package
    }

    /// Name and version without revision (`P`), e.g. `glib-2.12.4`.
    pub fn p(&self) -> String {
        match &self.version {
            Some(version) => format!("{}-{version}", self.package),
            None => self.package.clone(),
        }
    }

    /// Name and full version (`PF`), e.g. `glib-2.12.4-r1`.
    pub fn pf(&self) -> String {
        match self.fullver() {
            Some(fullver) => format!("{}-{fullver}", self.package),
            None => self.package.clone(),
        }
    }

    /// Revision (`PR`), `r0` when there is none.
    pub fn pr(&self) -> String {
        format!("r{}", self.revision.as_deref().unwrap_or("0"))
    }

    /// `=category/package-version` atom string.
    pub fn versioned_atom(&self) -> String {
        format!("={self}")
    }
}

impl FromStr for Cpv {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Cpv::parse(s)
    }
}

impl fmt::Display for Cpv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.package)?;
        if let Some(fullver) = self.fullver() {
            write!(f, "-{fullver}")?;
        }
        Ok(())
    }
}

fn is_revision(s: &str) -> bool {
    s.strip_prefix('r')
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn is_version(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_'))
}

fn split_version(rest: &str) -> (&str, Option<&str>, Option<&str>) {
    let (base, revision) = match rest.rsplit_once('-') {
        Some((base, rev)) if is_revision(rev) => (base, Some(&rev[1..])),
        _ => (rest, None),
    };
    match base.rsplit_once('-') {
        Some((package, version)) if !package.is_empty() && is_version(version) => {
            (package, Some(version), revision)
        }
        _ => (rest, None, None),
    }
}

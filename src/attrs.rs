use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use portage_atom::{DepEntry, Slot};

use crate::cpv::Cpv;
use crate::depset::{DepSet, DepSetParser};
use crate::error::{Error, Result};
use crate::fetchable::{Digests, Fetchable, FetchableResolver, MirrorConfig};

/// EAPI of a package as recorded in its metadata.
///
/// Empty or missing means EAPI 0. Values that are not integers are kept as
/// [`Eapi::Unknown`] so callers can refuse the package instead of failing
/// metadata access.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Eapi {
    Known(u32),
    Unknown(String),
}

impl Eapi {
    /// Parse a raw `EAPI` value.
    pub fn parse(raw: &str) -> Eapi {
        let raw = raw.trim();
        if raw.is_empty() {
            return Eapi::Known(0);
        }
        raw.parse()
            .map(Eapi::Known)
            .unwrap_or_else(|_| Eapi::Unknown(raw.to_string()))
    }
}

impl fmt::Display for Eapi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Eapi::Known(n) => write!(f, "{n}"),
            Eapi::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

/// Source of raw metadata for the derivations below.
pub(crate) trait DeriveContext {
    fn cpv(&self) -> &Cpv;

    /// Read a raw field, loading the record on first use.
    fn field(&self, field: &str) -> Result<Option<String>>;

    /// Drop a raw field whose attribute has been derived.
    fn consume(&self, field: &str);

    fn digests(&self) -> Result<Arc<Digests>>;

    fn mirrors(&self) -> &MirrorConfig;
}

/// Parse a single dependency atom token.
pub fn parse_atom(token: &str) -> Result<DepEntry> {
    let mut entries =
        DepEntry::parse(token).map_err(|e| Error::InvalidAtom(format!("{token}: {e}")))?;
    match entries.len() {
        1 => Ok(entries.remove(0)),
        _ => Err(Error::InvalidAtom(token.to_string())),
    }
}

/// Validate a single license token.
pub fn parse_license(token: &str) -> Result<String> {
    let valid = !token.starts_with(['-', '.', '+'])
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'));
    if valid {
        Ok(token.to_string())
    } else {
        Err(Error::InvalidLicense(token.to_string()))
    }
}

/// Normalize `RESTRICT` tokens, `nofoo` meaning `foo`.
pub fn rewrite_restrict(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace()
        .map(|token| token.strip_prefix("no").unwrap_or(token).to_string())
        .collect()
}

/// One-shot derived attributes of a package.
///
/// Each attribute consumes its raw field once it has been derived and keeps
/// the typed value. A failed derivation leaves the field in place, so the
/// next access reports the same error.
#[derive(Default)]
pub(crate) struct Attributes {
    depends: OnceCell<DepSet<DepEntry>>,
    rdepends: OnceCell<DepSet<DepEntry>>,
    post_rdepends: OnceCell<DepSet<DepEntry>>,
    license: OnceCell<DepSet<String>>,
    fetchables: OnceCell<DepSet<Arc<Fetchable>>>,
    keywords: OnceCell<Vec<String>>,
    restrict: OnceCell<BTreeSet<String>>,
    eapi: OnceCell<Eapi>,
    slot: OnceCell<Slot>,
    description: OnceCell<String>,
    homepage: OnceCell<String>,
    iuse: OnceCell<Vec<String>>,
}

impl Attributes {
    /// Attributes with run-time dependencies and slot fixed up front.
    pub(crate) fn with_overrides(rdepends: DepSet<DepEntry>, slot: Slot) -> Self {
        Attributes {
            rdepends: OnceCell::with_value(rdepends),
            slot: OnceCell::with_value(slot),
            ..Default::default()
        }
    }

    pub(crate) fn depends(&self, cx: &dyn DeriveContext) -> Result<&DepSet<DepEntry>> {
        self.depends.get_or_try_init(|| atoms(cx, "DEPEND"))
    }

    pub(crate) fn rdepends(&self, cx: &dyn DeriveContext) -> Result<&DepSet<DepEntry>> {
        self.rdepends.get_or_try_init(|| atoms(cx, "RDEPEND"))
    }

    pub(crate) fn post_rdepends(&self, cx: &dyn DeriveContext) -> Result<&DepSet<DepEntry>> {
        self.post_rdepends.get_or_try_init(|| atoms(cx, "PDEPEND"))
    }

    pub(crate) fn license(&self, cx: &dyn DeriveContext) -> Result<&DepSet<String>> {
        self.license.get_or_try_init(|| {
            derive_from(cx, "LICENSE", |raw| {
                DepSetParser::new()
                    .parse(&raw.unwrap_or_default(), parse_license)
                    .map_err(|e| e.in_field(&cx.cpv().to_string(), "LICENSE"))
            })
        })
    }

    pub(crate) fn fetchables(&self, cx: &dyn DeriveContext) -> Result<&DepSet<Arc<Fetchable>>> {
        self.fetchables.get_or_try_init(|| {
            let restrict = self.restrict(cx)?;
            derive_from(cx, "SRC_URI", |raw| {
                let raw = raw.unwrap_or_default();
                if raw.trim().is_empty() {
                    return Ok(DepSet::default());
                }
                let digests = cx.digests()?;
                FetchableResolver::new(&digests, cx.mirrors(), restrict)
                    .resolve(&raw)
                    .map_err(|e| e.in_field(&cx.cpv().to_string(), "SRC_URI"))
            })
        })
    }

    pub(crate) fn keywords(&self, cx: &dyn DeriveContext) -> Result<&[String]> {
        self.keywords
            .get_or_try_init(|| derive_from(cx, "KEYWORDS", |raw| Ok(split(raw))))
            .map(Vec::as_slice)
    }

    pub(crate) fn restrict(&self, cx: &dyn DeriveContext) -> Result<&BTreeSet<String>> {
        self.restrict.get_or_try_init(|| {
            derive_from(cx, "RESTRICT", |raw| {
                Ok(rewrite_restrict(&raw.unwrap_or_default()))
            })
        })
    }

    pub(crate) fn eapi(&self, cx: &dyn DeriveContext) -> Result<&Eapi> {
        self.eapi.get_or_try_init(|| {
            derive_from(cx, "EAPI", |raw| Ok(Eapi::parse(&raw.unwrap_or_default())))
        })
    }

    pub(crate) fn slot(&self, cx: &dyn DeriveContext) -> Result<&Slot> {
        self.slot.get_or_try_init(|| {
            derive_from(cx, "SLOT", |raw| {
                let raw = raw.unwrap_or_else(|| "0".to_string());
                let raw = raw.trim();
                if raw.is_empty() {
                    return Err(Error::InvalidSlot(cx.cpv().to_string()));
                }
                Ok(match raw.split_once('/') {
                    Some((slot, subslot)) => Slot::with_subslot(slot, subslot),
                    None => Slot::new(raw),
                })
            })
        })
    }

    pub(crate) fn description(&self, cx: &dyn DeriveContext) -> Result<&str> {
        self.description
            .get_or_try_init(|| derive_from(cx, "DESCRIPTION", |raw| Ok(trimmed(raw))))
            .map(String::as_str)
    }

    pub(crate) fn homepage(&self, cx: &dyn DeriveContext) -> Result<&str> {
        self.homepage
            .get_or_try_init(|| derive_from(cx, "HOMEPAGE", |raw| Ok(trimmed(raw))))
            .map(String::as_str)
    }

    pub(crate) fn iuse(&self, cx: &dyn DeriveContext) -> Result<&[String]> {
        self.iuse
            .get_or_try_init(|| derive_from(cx, "IUSE", |raw| Ok(split(raw))))
            .map(Vec::as_slice)
    }
}

/// Derive a value from one raw field. The field is dropped only when `derive`
/// succeeds, so a failed attribute fails the same way on every access.
pub(crate) fn derive_from<T, F>(cx: &dyn DeriveContext, field: &str, derive: F) -> Result<T>
where
    F: FnOnce(Option<String>) -> Result<T>,
{
    let value = derive(cx.field(field)?)?;
    cx.consume(field);
    Ok(value)
}

fn split(raw: Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn trimmed(raw: Option<String>) -> String {
    raw.as_deref().unwrap_or_default().trim().to_string()
}

fn atoms(cx: &dyn DeriveContext, field: &str) -> Result<DepSet<DepEntry>> {
    derive_from(cx, field, |raw| {
        DepSetParser::new()
            .parse(&raw.unwrap_or_default(), parse_atom)
            .map_err(|e| e.in_field(&cx.cpv().to_string(), field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchable::Checksums;
    use crate::record::MetadataRecord;
    use parking_lot::Mutex;
    use std::cell::Cell;

    struct Raw {
        cpv: Cpv,
        record: Mutex<MetadataRecord>,
        mirrors: MirrorConfig,
        digest_loads: Cell<usize>,
    }

    impl Raw {
        fn new(fields: &[(&str, &str)]) -> Self {
            Raw {
                cpv: Cpv::parse("app-misc/foo-1.0").unwrap(),
                record: Mutex::new(MetadataRecord::from_fields(fields.iter().copied())),
                mirrors: MirrorConfig::new().with_tier("gentoo", ["http://mirror"]),
                digest_loads: Cell::new(0),
            }
        }
    }

    impl DeriveContext for Raw {
        fn cpv(&self) -> &Cpv {
            &self.cpv
        }

        fn field(&self, field: &str) -> Result<Option<String>> {
            Ok(self.record.lock().get(field).map(str::to_string))
        }

        fn consume(&self, field: &str) {
            self.record.lock().remove(field);
        }

        fn digests(&self) -> Result<Arc<Digests>> {
            self.digest_loads.set(self.digest_loads.get() + 1);
            let mut digests = Digests::new();
            digests.insert(
                "foo-1.0.tar.gz".to_string(),
                Checksums::from([("MD5".to_string(), "abc".to_string())]),
            );
            Ok(Arc::new(digests))
        }

        fn mirrors(&self) -> &MirrorConfig {
            &self.mirrors
        }
    }

    #[test]
    fn derivation_consumes_field_once() {
        let raw = Raw::new(&[("KEYWORDS", "x86 ~amd64"), ("DESCRIPTION", "  Foo  ")]);
        let attrs = Attributes::default();
        assert_eq!(attrs.keywords(&raw).unwrap(), ["x86", "~amd64"]);
        assert!(!raw.record.lock().contains("KEYWORDS"));
        assert_eq!(attrs.keywords(&raw).unwrap().len(), 2);
        assert_eq!(attrs.description(&raw).unwrap(), "Foo");
        assert!(raw.record.lock().is_empty());
    }

    #[test]
    fn failed_derivation_fails_again() {
        let raw = Raw::new(&[
            ("DEPEND", "ssl? ( dev-libs/openssl"),
            ("LICENSE", "-GPL"),
            ("SRC_URI", "http://a/other.tar.gz"),
            ("SLOT", ""),
        ]);
        let attrs = Attributes::default();
        for _ in 0..2 {
            assert!(matches!(
                attrs.depends(&raw),
                Err(Error::Metadata { ref field, .. }) if field == "DEPEND"
            ));
            assert!(matches!(
                attrs.license(&raw),
                Err(Error::Metadata { ref field, .. }) if field == "LICENSE"
            ));
            assert!(matches!(attrs.fetchables(&raw), Err(Error::MissingChksum(_))));
            assert!(matches!(attrs.slot(&raw), Err(Error::InvalidSlot(_))));
        }
        let record = raw.record.lock();
        for field in ["DEPEND", "LICENSE", "SRC_URI", "SLOT"] {
            assert!(record.contains(field), "{field} was dropped");
        }
    }

    #[test]
    fn eapi_values() {
        assert_eq!(Eapi::parse(""), Eapi::Known(0));
        assert_eq!(Eapi::parse(" 1 "), Eapi::Known(1));
        assert_eq!(Eapi::parse("prefix"), Eapi::Unknown("prefix".to_string()));
        let raw = Raw::new(&[]);
        assert_eq!(Attributes::default().eapi(&raw).unwrap(), &Eapi::Known(0));
    }

    #[test]
    fn slot_defaults_and_errors() {
        let raw = Raw::new(&[]);
        assert_eq!(Attributes::default().slot(&raw).unwrap().slot, "0");

        let raw = Raw::new(&[("SLOT", "2/2.1")]);
        let attrs = Attributes::default();
        let slot = attrs.slot(&raw).unwrap();
        assert_eq!(slot.slot, "2");
        assert_eq!(slot.subslot, Some("2.1".to_string()));

        let raw = Raw::new(&[("SLOT", "  ")]);
        assert!(matches!(
            Attributes::default().slot(&raw),
            Err(Error::InvalidSlot(_))
        ));
    }

    #[test]
    fn restrict_rewrite() {
        let set = rewrite_restrict("nomirror fetch primaryuri");
        assert!(set.contains("mirror"));
        assert!(set.contains("fetch"));
        assert!(set.contains("primaryuri"));
        assert!(!set.contains("nomirror"));
    }

    #[test]
    fn license_tree() {
        let raw = Raw::new(&[("LICENSE", "|| ( MIT GPL-2 ) ssl? ( openssl )")]);
        let attrs = Attributes::default();
        let license = attrs.license(&raw).unwrap();
        assert_eq!(license.leaves(), vec!["MIT", "GPL-2", "openssl"]);
    }

    #[test]
    fn bad_license_is_metadata_error() {
        let raw = Raw::new(&[("LICENSE", "-GPL")]);
        let err = Attributes::default().license(&raw).unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata { ref package, ref field, .. }
                if package == "app-misc/foo-1.0" && field == "LICENSE"
        ));
    }

    #[test]
    fn unbalanced_depend_is_metadata_error() {
        let raw = Raw::new(&[("DEPEND", "ssl? ( dev-libs/openssl")]);
        let err = Attributes::default().depends(&raw).unwrap_err();
        assert!(matches!(err, Error::Metadata { ref field, .. } if field == "DEPEND"));
    }

    #[test]
    fn depends_tree() {
        let raw = Raw::new(&[("RDEPEND", "ssl? ( dev-libs/openssl ) || ( a/b c/d )")]);
        let attrs = Attributes::default();
        let rdepends = attrs.rdepends(&raw).unwrap();
        assert_eq!(rdepends.leaves().len(), 3);
        assert_eq!(rdepends.leaves()[0].to_string(), "dev-libs/openssl");
    }

    #[test]
    fn fetchables_respect_restrict() {
        let raw = Raw::new(&[
            ("SRC_URI", "mirror://gentoo/foo-1.0.tar.gz"),
            ("RESTRICT", "nomirror"),
        ]);
        let attrs = Attributes::default();
        let files = attrs.fetchables(&raw).unwrap();
        assert_eq!(files.leaves()[0].filename, "foo-1.0.tar.gz");
        assert!(attrs.restrict(&raw).unwrap().contains("mirror"));
    }

    #[test]
    fn empty_src_uri_skips_digests() {
        let raw = Raw::new(&[]);
        let attrs = Attributes::default();
        assert!(attrs.fetchables(&raw).unwrap().is_empty());
        assert_eq!(raw.digest_loads.get(), 0);
    }

    #[test]
    fn missing_checksum_is_not_wrapped() {
        let raw = Raw::new(&[("SRC_URI", "http://a/other.tar.gz")]);
        let err = Attributes::default().fetchables(&raw).unwrap_err();
        assert!(matches!(err, Error::MissingChksum(ref f) if f == "other.tar.gz"));
    }

    #[test]
    fn overrides_win() {
        let raw = Raw::new(&[("SLOT", "9"), ("RDEPEND", "x/y")]);
        let attrs = Attributes::with_overrides(DepSet::default(), Slot::new("1.0"));
        assert_eq!(attrs.slot(&raw).unwrap().slot, "1.0");
        assert!(attrs.rdepends(&raw).unwrap().is_empty());
        assert!(raw.record.lock().contains("SLOT"));
    }
}

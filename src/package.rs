use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use portage_atom::{DepEntry, Slot};

use crate::attrs::{derive_from, parse_atom, Attributes, DeriveContext, Eapi};
use crate::cpv::Cpv;
use crate::depset::{DepNode, DepSet, DepSetParser};
use crate::error::Result;
use crate::factory::{FactoryInner, SharedPkgData};
use crate::fetchable::{Digests, Fetchable, MirrorConfig};
use crate::pkg_metadata::Maintainer;
use crate::record::MetadataRecord;
use crate::virtual_pkg::VirtualPackage;

/// The derived attributes of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    Depends,
    Rdepends,
    PostRdepends,
    Provides,
    License,
    Fetchables,
    Keywords,
    Restrict,
    Eapi,
    Slot,
    Description,
    Homepage,
    Iuse,
}

impl Attr {
    pub const ALL: [Attr; 13] = [
        Attr::Depends,
        Attr::Rdepends,
        Attr::PostRdepends,
        Attr::Provides,
        Attr::License,
        Attr::Fetchables,
        Attr::Keywords,
        Attr::Restrict,
        Attr::Eapi,
        Attr::Slot,
        Attr::Description,
        Attr::Homepage,
        Attr::Iuse,
    ];

    /// Raw metadata field the attribute is derived from.
    pub fn field(self) -> &'static str {
        match self {
            Attr::Depends => "DEPEND",
            Attr::Rdepends => "RDEPEND",
            Attr::PostRdepends => "PDEPEND",
            Attr::Provides => "PROVIDE",
            Attr::License => "LICENSE",
            Attr::Fetchables => "SRC_URI",
            Attr::Keywords => "KEYWORDS",
            Attr::Restrict => "RESTRICT",
            Attr::Eapi => "EAPI",
            Attr::Slot => "SLOT",
            Attr::Description => "DESCRIPTION",
            Attr::Homepage => "HOMEPAGE",
            Attr::Iuse => "IUSE",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Attr::Depends => "depends",
            Attr::Rdepends => "rdepends",
            Attr::PostRdepends => "post_rdepends",
            Attr::Provides => "provides",
            Attr::License => "license",
            Attr::Fetchables => "fetchables",
            Attr::Keywords => "keywords",
            Attr::Restrict => "restrict",
            Attr::Eapi => "eapi",
            Attr::Slot => "slot",
            Attr::Description => "description",
            Attr::Homepage => "homepage",
            Attr::Iuse => "iuse",
        })
    }
}

/// Dependency trees collapsed under one USE configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedDeps {
    pub depends: DepSet<DepEntry>,
    pub rdepends: DepSet<DepEntry>,
    pub post_rdepends: DepSet<DepEntry>,
}

/// A package version whose metadata is derived on demand.
///
/// Obtained from [`crate::MetadataFactory::new_package`]. The raw record is
/// loaded on first attribute access; each attribute consumes its field once
/// derived and keeps the typed value.
pub struct Package {
    cpv: Cpv,
    me: Weak<Package>,
    factory: Arc<FactoryInner>,
    shared: Arc<SharedPkgData>,
    data: OnceCell<Mutex<MetadataRecord>>,
    attrs: Attributes,
    provides: OnceCell<DepSet<Arc<VirtualPackage>>>,
}

impl Package {
    pub(crate) fn new(
        cpv: Cpv,
        factory: Arc<FactoryInner>,
        shared: Arc<SharedPkgData>,
    ) -> Arc<Package> {
        Arc::new_cyclic(|me| Package {
            cpv,
            me: me.clone(),
            factory,
            shared,
            data: OnceCell::new(),
            attrs: Attributes::default(),
            provides: OnceCell::new(),
        })
    }

    /// Identity of this package version.
    pub fn cpv(&self) -> &Cpv {
        &self.cpv
    }

    /// Data shared with the other versions of this `category/package`.
    pub fn shared_data(&self) -> &Arc<SharedPkgData> {
        &self.shared
    }

    /// Maintainers from the package's `metadata.xml`.
    pub fn maintainers(&self) -> Result<&[Maintainer]> {
        Ok(&self.shared.metadata(&*self.factory.repo)?.maintainers)
    }

    /// Herds from `metadata.xml`.
    pub fn herds(&self) -> Result<&[String]> {
        Ok(&self.shared.metadata(&*self.factory.repo)?.herds)
    }

    /// Long description from `metadata.xml`, whitespace collapsed.
    pub fn longdescription(&self) -> Result<Option<&str>> {
        Ok(self
            .shared
            .metadata(&*self.factory.repo)?
            .longdescription
            .as_deref())
    }

    /// Path of the build script this metadata derives from.
    pub fn ebuild_path(&self) -> PathBuf {
        self.factory.repo.ebuild_path(&self.cpv)
    }

    /// Modification time recorded for the loaded metadata.
    pub fn mtime(&self) -> Result<Option<i64>> {
        Ok(self.record()?.lock().mtime)
    }

    /// Build-time dependencies (`DEPEND`).
    pub fn depends(&self) -> Result<&DepSet<DepEntry>> {
        self.attrs.depends(self)
    }

    /// Run-time dependencies (`RDEPEND`).
    pub fn rdepends(&self) -> Result<&DepSet<DepEntry>> {
        self.attrs.rdepends(self)
    }

    /// Post-merge dependencies (`PDEPEND`).
    pub fn post_rdepends(&self) -> Result<&DepSet<DepEntry>> {
        self.attrs.post_rdepends(self)
    }

    /// License tree (`LICENSE`).
    pub fn license(&self) -> Result<&DepSet<String>> {
        self.attrs.license(self)
    }

    /// Distfiles with their URIs and checksums (`SRC_URI`).
    pub fn fetchables(&self) -> Result<&DepSet<Arc<Fetchable>>> {
        self.attrs.fetchables(self)
    }

    /// `KEYWORDS` tokens.
    pub fn keywords(&self) -> Result<&[String]> {
        self.attrs.keywords(self)
    }

    /// `RESTRICT` tokens with `no` prefixes stripped.
    pub fn restrict(&self) -> Result<&BTreeSet<String>> {
        self.attrs.restrict(self)
    }

    /// `EAPI`, 0 when unset.
    pub fn eapi(&self) -> Result<&Eapi> {
        self.attrs.eapi(self)
    }

    /// `SLOT`, `0` when unset; blank is an error.
    pub fn slot(&self) -> Result<&Slot> {
        self.attrs.slot(self)
    }

    /// `DESCRIPTION`, trimmed.
    pub fn description(&self) -> Result<&str> {
        self.attrs.description(self)
    }

    /// `HOMEPAGE`, trimmed.
    pub fn homepage(&self) -> Result<&str> {
        self.attrs.homepage(self)
    }

    /// `IUSE` tokens, defaults included.
    pub fn iuse(&self) -> Result<&[String]> {
        self.attrs.iuse(self)
    }

    /// Virtual packages synthesized from `PROVIDE`.
    pub fn provides(&self) -> Result<&DepSet<Arc<VirtualPackage>>> {
        self.provides.get_or_try_init(|| {
            derive_from(self, "PROVIDE", |raw| {
                let raw = raw.unwrap_or_default();
                if raw.trim().is_empty() {
                    return Ok(DepSet::default());
                }
                let slot = self.slot()?.clone();
                let rdepends = self.self_restriction()?;
                let fullver = self.cpv.fullver();
                DepSetParser::new()
                    .parse(&raw, |token| {
                        VirtualPackage::new(
                            token,
                            self.me.clone(),
                            fullver.as_deref(),
                            rdepends.clone(),
                            slot.clone(),
                        )
                        .map(Arc::new)
                    })
                    .map_err(|e| e.in_field(&self.cpv.to_string(), "PROVIDE"))
            })
        })
    }

    /// Derive one attribute, discarding the value.
    pub fn derive(&self, attr: Attr) -> Result<()> {
        match attr {
            Attr::Depends => self.depends().map(drop),
            Attr::Rdepends => self.rdepends().map(drop),
            Attr::PostRdepends => self.post_rdepends().map(drop),
            Attr::Provides => self.provides().map(drop),
            Attr::License => self.license().map(drop),
            Attr::Fetchables => self.fetchables().map(drop),
            Attr::Keywords => self.keywords().map(drop),
            Attr::Restrict => self.restrict().map(drop),
            Attr::Eapi => self.eapi().map(drop),
            Attr::Slot => self.slot().map(drop),
            Attr::Description => self.description().map(drop),
            Attr::Homepage => self.homepage().map(drop),
            Attr::Iuse => self.iuse().map(drop),
        }
    }

    /// Collapse the dependency trees under the given USE flags.
    ///
    /// Works from the already derived trees; the cache is not consulted
    /// again.
    pub fn evaluate_depends<F>(&self, enabled: F) -> Result<EvaluatedDeps>
    where
        F: Fn(&str) -> bool,
    {
        Ok(EvaluatedDeps {
            depends: self.depends()?.evaluate(&enabled),
            rdepends: self.rdepends()?.evaluate(&enabled),
            post_rdepends: self.post_rdepends()?.evaluate(&enabled),
        })
    }

    /// `=cat/pkg-ver` restriction on exactly this package.
    fn self_restriction(&self) -> Result<DepSet<DepEntry>> {
        let atom = match self.cpv.version {
            Some(_) => self.cpv.versioned_atom(),
            None => self.cpv.key(),
        };
        Ok(DepSet::new(vec![DepNode::Leaf(parse_atom(&atom)?)]))
    }

    fn record(&self) -> Result<&Mutex<MetadataRecord>> {
        self.data
            .get_or_try_init(|| self.factory.get_metadata(&self.cpv).map(Mutex::new))
    }
}

impl DeriveContext for Package {
    fn cpv(&self) -> &Cpv {
        &self.cpv
    }

    fn field(&self, field: &str) -> Result<Option<String>> {
        Ok(self.record()?.lock().get(field).map(str::to_string))
    }

    fn consume(&self, field: &str) {
        if let Some(data) = self.data.get() {
            data.lock().remove(field);
        }
    }

    fn digests(&self) -> Result<Arc<Digests>> {
        self.shared.digests(&*self.factory.repo)
    }

    fn mirrors(&self) -> &MirrorConfig {
        &self.factory.mirrors
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Package").field("cpv", &self.cpv).finish()
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.cpv, f)
    }
}

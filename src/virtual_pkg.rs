use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use portage_atom::{DepEntry, Slot};

use crate::attrs::{Attributes, DeriveContext, Eapi};
use crate::cpv::Cpv;
use crate::depset::DepSet;
use crate::error::Result;
use crate::fetchable::{Digests, Fetchable, MirrorConfig};
use crate::package::Package;
use crate::record::MetadataRecord;

/// A package synthesized from another package's `PROVIDE`.
///
/// Run-time dependencies and slot are bound to the providing package; every
/// other attribute derives from an empty record.
pub struct VirtualPackage {
    cpv: Cpv,
    actual: Weak<Package>,
    data: Mutex<MetadataRecord>,
    attrs: Attributes,
    mirrors: MirrorConfig,
}

impl VirtualPackage {
    /// Build from a `PROVIDE` token.
    ///
    /// An unversioned token takes `fullver` from the providing package.
    pub(crate) fn new(
        token: &str,
        actual: Weak<Package>,
        fullver: Option<&str>,
        rdepends: DepSet<DepEntry>,
        slot: Slot,
    ) -> Result<VirtualPackage> {
        let mut cpv = Cpv::parse(token)?;
        if cpv.version.is_none() {
            if let Some(fullver) = fullver {
                cpv = cpv.with_fullver(fullver)?;
            }
        }
        Ok(VirtualPackage {
            cpv,
            actual,
            data: Mutex::new(MetadataRecord::new()),
            attrs: Attributes::with_overrides(rdepends, slot),
            mirrors: MirrorConfig::default(),
        })
    }

    /// Identity of the virtual, versioned after the provider.
    pub fn cpv(&self) -> &Cpv {
        &self.cpv
    }

    /// The providing package, if it is still alive.
    pub fn actual_pkg(&self) -> Option<Arc<Package>> {
        self.actual.upgrade()
    }

    /// Always empty.
    pub fn depends(&self) -> Result<&DepSet<DepEntry>> {
        self.attrs.depends(self)
    }

    /// Restriction on exactly the providing package version.
    pub fn rdepends(&self) -> Result<&DepSet<DepEntry>> {
        self.attrs.rdepends(self)
    }

    /// Always empty.
    pub fn post_rdepends(&self) -> Result<&DepSet<DepEntry>> {
        self.attrs.post_rdepends(self)
    }

    /// Always empty.
    pub fn license(&self) -> Result<&DepSet<String>> {
        self.attrs.license(self)
    }

    /// Always empty.
    pub fn fetchables(&self) -> Result<&DepSet<Arc<Fetchable>>> {
        self.attrs.fetchables(self)
    }

    /// Always empty.
    pub fn keywords(&self) -> Result<&[String]> {
        self.attrs.keywords(self)
    }

    /// Always empty.
    pub fn restrict(&self) -> Result<&BTreeSet<String>> {
        self.attrs.restrict(self)
    }

    /// Always EAPI 0.
    pub fn eapi(&self) -> Result<&Eapi> {
        self.attrs.eapi(self)
    }

    /// Slot of the providing package.
    pub fn slot(&self) -> Result<&Slot> {
        self.attrs.slot(self)
    }

    /// Always empty.
    pub fn description(&self) -> Result<&str> {
        self.attrs.description(self)
    }

    /// Always empty.
    pub fn homepage(&self) -> Result<&str> {
        self.attrs.homepage(self)
    }

    /// Always empty.
    pub fn iuse(&self) -> Result<&[String]> {
        self.attrs.iuse(self)
    }
}

impl DeriveContext for VirtualPackage {
    fn cpv(&self) -> &Cpv {
        &self.cpv
    }

    fn field(&self, field: &str) -> Result<Option<String>> {
        Ok(self.data.lock().get(field).map(str::to_string))
    }

    fn consume(&self, field: &str) {
        self.data.lock().remove(field);
    }

    fn digests(&self) -> Result<Arc<Digests>> {
        Ok(Arc::default())
    }

    fn mirrors(&self) -> &MirrorConfig {
        &self.mirrors
    }
}

impl fmt::Debug for VirtualPackage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VirtualPackage")
            .field("cpv", &self.cpv)
            .finish()
    }
}

impl fmt::Display for VirtualPackage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.cpv, f)
    }
}

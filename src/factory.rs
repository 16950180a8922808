use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::cache::CacheStore;
use crate::cpv::Cpv;
use crate::eclass::{file_mtime, EclassCache};
use crate::error::{Error, Result};
use crate::evaluator::{EvaluatorGuard, EvaluatorPool};
use crate::fetchable::{Digests, MirrorConfig};
use crate::package::Package;
use crate::pkg_metadata::PkgMetadata;
use crate::record::{MetadataRecord, ECLASSES_KEY, MTIME_KEY};

/// Repository lookups the factory needs.
pub trait Repository: Send + Sync {
    /// Path of the build script for `cpv`; its mtime drives cache validity.
    fn ebuild_path(&self, cpv: &Cpv) -> PathBuf;

    /// Digest data for every distfile of `category/package`.
    fn manifest(&self, category: &str, package: &str) -> Result<Digests>;

    /// Parsed `metadata.xml` of `category/package`. Repositories without
    /// one report empty data.
    fn pkg_metadata(&self, _category: &str, _package: &str) -> Result<PkgMetadata> {
        Ok(PkgMetadata::default())
    }
}

/// Data shared by all versions of one `category/package`.
pub struct SharedPkgData {
    category: String,
    package: String,
    digests: OnceCell<Arc<Digests>>,
    metadata: OnceCell<PkgMetadata>,
}

impl SharedPkgData {
    fn new(category: &str, package: &str) -> Self {
        SharedPkgData {
            category: category.to_string(),
            package: package.to_string(),
            digests: OnceCell::new(),
            metadata: OnceCell::new(),
        }
    }

    /// Category shared by the versions.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Package name shared by the versions.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Digest data, read from the repository once.
    pub fn digests(&self, repo: &dyn Repository) -> Result<Arc<Digests>> {
        self.digests
            .get_or_try_init(|| repo.manifest(&self.category, &self.package).map(Arc::new))
            .cloned()
    }

    /// `metadata.xml` data, read from the repository once.
    pub fn metadata(&self, repo: &dyn Repository) -> Result<&PkgMetadata> {
        self.metadata
            .get_or_try_init(|| repo.pkg_metadata(&self.category, &self.package))
    }
}

impl fmt::Debug for SharedPkgData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SharedPkgData({}/{})", self.category, self.package)
    }
}

pub(crate) struct FactoryInner {
    caches: Vec<Arc<dyn CacheStore>>,
    eclasses: Arc<EclassCache>,
    pub(crate) mirrors: MirrorConfig,
    pub(crate) repo: Arc<dyn Repository>,
    evaluators: Arc<dyn EvaluatorPool>,
}

impl FactoryInner {
    fn ebuild_mtime(&self, cpv: &Cpv) -> Result<i64> {
        let path = self.repo.ebuild_path(cpv);
        file_mtime(&path).map_err(|source| Error::Io { path, source })
    }

    pub(crate) fn get_metadata(&self, cpv: &Cpv) -> Result<MetadataRecord> {
        let mtime = self.ebuild_mtime(cpv)?;
        let key = cpv.to_string();
        for cache in &self.caches {
            match cache.get(&key) {
                Ok(Some(record)) if record.is_fresh(mtime, &self.eclasses) => return Ok(record),
                Ok(Some(_)) => {
                    tracing::debug!(cache = cache.label(), package = %key, "stale cache entry")
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(cache = cache.label(), package = %key, error = %e, "unusable cache entry")
                }
            }
        }
        self.update_metadata(cpv, &key, mtime)
    }

    fn update_metadata(&self, cpv: &Cpv, key: &str, mtime: i64) -> Result<MetadataRecord> {
        tracing::debug!(package = %key, "regenerating metadata");
        let fields = {
            let mut evaluator = EvaluatorGuard::checkout(&*self.evaluators)?;
            evaluator.get_keys(cpv, &self.eclasses)?
        };

        let mut record = MetadataRecord::from_fields(
            fields
                .into_iter()
                .filter(|(k, _)| k != MTIME_KEY && k != ECLASSES_KEY),
        );
        record.mtime = Some(mtime);
        let inherited = record.remove("INHERITED").unwrap_or_default();
        record.eclasses = Some(self.eclasses.get_eclass_data(inherited.split_whitespace())?);

        if let Some(cache) = self.caches.iter().find(|c| !c.readonly()) {
            let dropped = record.retain_fields(|field| cache.accepts(field));
            if !dropped.is_empty() {
                tracing::debug!(cache = cache.label(), package = %key, fields = ?dropped, "dropping fields the cache cannot store");
            }
            if let Err(e) = cache.set(key, &record) {
                tracing::warn!(cache = cache.label(), package = %key, error = %e, "failed to update metadata cache");
            }
        }
        Ok(record)
    }
}

const MIN_SWEEP: usize = 64;

/// Weak-valued map that drops dead entries as it grows.
struct WeakCache<K, V> {
    entries: HashMap<K, Weak<V>>,
    sweep_at: usize,
}

impl<K: Eq + Hash, V> WeakCache<K, V> {
    fn new() -> Self {
        WeakCache {
            entries: HashMap::new(),
            sweep_at: MIN_SWEEP,
        }
    }

    fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> Arc<V>) -> Arc<V> {
        if let Some(live) = self.entries.get(&key).and_then(Weak::upgrade) {
            return live;
        }
        let value = make();
        self.entries.insert(key, Arc::downgrade(&value));
        if self.entries.len() >= self.sweep_at {
            self.entries.retain(|_, v| v.strong_count() > 0);
            self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP);
        }
        value
    }

    fn live(&self) -> usize {
        self.entries.values().filter(|v| v.strong_count() > 0).count()
    }
}

/// Builder for [`MetadataFactory`].
pub struct FactoryBuilder {
    caches: Vec<Arc<dyn CacheStore>>,
    eclasses: Arc<EclassCache>,
    mirrors: MirrorConfig,
    repo: Arc<dyn Repository>,
    evaluators: Arc<dyn EvaluatorPool>,
}

impl FactoryBuilder {
    /// Append a cache store; stores are consulted in the order added.
    pub fn cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.caches.push(store);
        self
    }

    /// Mirror tiers used to expand `mirror://` URIs.
    pub fn mirrors(mut self, mirrors: MirrorConfig) -> Self {
        self.mirrors = mirrors;
        self
    }

    /// Finish the factory. No cache is required.
    pub fn build(self) -> MetadataFactory {
        MetadataFactory {
            inner: Arc::new(FactoryInner {
                caches: self.caches,
                eclasses: self.eclasses,
                mirrors: self.mirrors,
                repo: self.repo,
                evaluators: self.evaluators,
            }),
            instances: Mutex::new(WeakCache::new()),
            shared: Mutex::new(WeakCache::new()),
        }
    }
}

/// Loads package metadata from caches or the evaluator and hands out
/// [`Package`] instances.
///
/// One instance per cpv is shared while any caller holds it.
pub struct MetadataFactory {
    inner: Arc<FactoryInner>,
    instances: Mutex<WeakCache<Cpv, Package>>,
    shared: Mutex<WeakCache<(String, String), SharedPkgData>>,
}

impl MetadataFactory {
    /// Start a factory over `repo`, validating chains against `eclasses`
    /// and regenerating through `evaluators`.
    pub fn builder(
        repo: Arc<dyn Repository>,
        eclasses: Arc<EclassCache>,
        evaluators: Arc<dyn EvaluatorPool>,
    ) -> FactoryBuilder {
        FactoryBuilder {
            caches: Vec::new(),
            eclasses,
            mirrors: MirrorConfig::default(),
            repo,
            evaluators,
        }
    }

    /// Eclass table chains are validated against.
    pub fn eclasses(&self) -> &Arc<EclassCache> {
        &self.inner.eclasses
    }

    /// Mirror tiers handed to every package.
    pub fn mirrors(&self) -> &MirrorConfig {
        &self.inner.mirrors
    }

    /// Raw metadata for `cpv`: the first fresh cache entry, or a
    /// regenerated record written back to the first writable cache.
    pub fn get_metadata(&self, cpv: &Cpv) -> Result<MetadataRecord> {
        self.inner.get_metadata(cpv)
    }

    /// The package instance for `cpv`. Metadata is not loaded until an
    /// attribute is accessed.
    pub fn new_package(&self, cpv: &Cpv) -> Arc<Package> {
        let mut instances = self.instances.lock();
        instances.get_or_insert_with(cpv.clone(), || {
            let shared = self.shared_pkg_data(&cpv.category, &cpv.package);
            Package::new(cpv.clone(), self.inner.clone(), shared)
        })
    }

    /// Data shared by the live versions of `category/package`.
    pub fn shared_pkg_data(&self, category: &str, package: &str) -> Arc<SharedPkgData> {
        self.shared
            .lock()
            .get_or_insert_with((category.to_string(), package.to_string()), || {
                Arc::new(SharedPkgData::new(category, package))
            })
    }

    /// Number of package instances still referenced.
    pub fn live_packages(&self) -> usize {
        self.instances.lock().live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheLayout, MetadataCache};
    use crate::eclass::EclassData;
    use crate::evaluator::{BoundedPool, Evaluator};
    use crate::fetchable::Checksums;
    use crate::pkg_metadata::Maintainer;
    use filetime::{set_file_mtime, FileTime};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestRepo {
        root: PathBuf,
        manifest_reads: AtomicUsize,
        metadata_reads: AtomicUsize,
    }

    impl Repository for TestRepo {
        fn ebuild_path(&self, cpv: &Cpv) -> PathBuf {
            self.root.join(format!("{}/{}/{}.ebuild", cpv.category, cpv.package, cpv))
        }

        fn manifest(&self, _category: &str, _package: &str) -> Result<Digests> {
            self.manifest_reads.fetch_add(1, Ordering::SeqCst);
            Ok(Digests::from([(
                "foo-1.0.tar.gz".to_string(),
                Checksums::from([("SHA512".to_string(), "ff".to_string())]),
            )]))
        }

        fn pkg_metadata(&self, _category: &str, package: &str) -> Result<PkgMetadata> {
            self.metadata_reads.fetch_add(1, Ordering::SeqCst);
            let mut maintainer = Maintainer::with_email(format!("{package}@gentoo.org"));
            maintainer.maint_type = Some("person".to_string());
            Ok(PkgMetadata {
                maintainers: vec![maintainer],
                herds: vec!["base-system".to_string()],
                longdescription: None,
            }
            .with_longdescription("  Does\n foo things. "))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        base: PathBuf,
        repo: Arc<TestRepo>,
        runs: Arc<AtomicUsize>,
        factory: MetadataFactory,
    }

    fn write_ebuild(repo: &TestRepo, cpv: &Cpv, mtime: i64) {
        let path = repo.ebuild_path(cpv);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "EAPI=0\n").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn eclasses(dir: &Path) -> Arc<EclassCache> {
        Arc::new(EclassCache::from_entries(
            dir.join("eclass"),
            [(
                "eutils",
                EclassData {
                    path: dir.join("eclass"),
                    mtime: 500,
                },
            )],
        ))
    }

    fn fixture(fields: &'static [(&'static str, &'static str)], caches: &[CacheLayout]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let repo = Arc::new(TestRepo {
            root: base.join("tree"),
            manifest_reads: AtomicUsize::new(0),
            metadata_reads: AtomicUsize::new(0),
        });
        let eclasses = eclasses(&base);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let pool = BoundedPool::new(1, move || {
            let counter = counter.clone();
            let evaluator = move |_: &Cpv, _: &EclassCache| -> Result<BTreeMap<String, String>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect())
            };
            Ok(Box::new(evaluator) as Box<dyn Evaluator>)
        });

        let mut builder = MetadataFactory::builder(repo.clone(), eclasses.clone(), Arc::new(pool))
            .mirrors(MirrorConfig::new().with_tier("gentoo", ["http://distfiles.gentoo.org"]));
        for (i, layout) in caches.iter().enumerate() {
            let config = CacheConfig::new(&base, format!("cache{i}")).layout(*layout);
            builder = builder.cache(Arc::new(MetadataCache::new(config, eclasses.clone())));
        }
        Fixture {
            base,
            repo,
            runs,
            factory: builder.build(),
            _dir: dir,
        }
    }

    const FOO: &[(&str, &str)] = &[
        ("DEPEND", "ssl? ( dev-libs/openssl ) sys-libs/zlib"),
        ("RDEPEND", "sys-libs/zlib"),
        ("SLOT", "1"),
        ("SRC_URI", "mirror://gentoo/foo-1.0.tar.gz"),
        ("LICENSE", "GPL-2"),
        ("KEYWORDS", "x86 ~amd64"),
        ("DESCRIPTION", "foo"),
        ("INHERITED", "eutils"),
        ("PROVIDE", "virtual/foo"),
    ];

    #[test]
    fn regenerates_and_writes_back() {
        let fx = fixture(FOO, &[CacheLayout::FlatHash]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        let record = fx.factory.get_metadata(&cpv).unwrap();
        assert_eq!(record.mtime, Some(1000));
        assert!(record.eclasses.as_ref().unwrap().get("eutils").is_some());
        assert!(!record.contains("INHERITED"));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        assert!(fx
            .base
            .join("metadata/cache/app-misc/foo-1.0")
            .exists());

        fx.factory.get_metadata(&cpv).unwrap();
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
    }

    const PHASES: &[(&str, &str)] = &[
        ("SLOT", "0"),
        ("DESCRIPTION", "two  spaces"),
        ("DEFINED_PHASES", "compile install"),
    ];

    #[test]
    fn extra_evaluator_fields_are_cached() {
        let fx = fixture(PHASES, &[CacheLayout::FlatHash]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        for _ in 0..3 {
            let record = fx.factory.get_metadata(&cpv).unwrap();
            assert_eq!(record.get("DEFINED_PHASES"), Some("compile install"));
            assert_eq!(record.get("DESCRIPTION"), Some("two  spaces"));
        }
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        assert!(fx.base.join("metadata/cache/app-misc/foo-1.0").exists());
    }

    #[test]
    fn flat_list_write_back_drops_extra_fields() {
        let fx = fixture(PHASES, &[CacheLayout::FlatList]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        for _ in 0..3 {
            let record = fx.factory.get_metadata(&cpv).unwrap();
            assert!(!record.contains("DEFINED_PHASES"));
            assert_eq!(record.get("SLOT"), Some("0"));
        }
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_entry_regenerates() {
        let fx = fixture(FOO, &[CacheLayout::FlatHash]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);
        fx.factory.get_metadata(&cpv).unwrap();

        write_ebuild(&fx.repo, &cpv, 2000);
        let record = fx.factory.get_metadata(&cpv).unwrap();
        assert_eq!(record.mtime, Some(2000));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn corrupt_entry_regenerates() {
        let fx = fixture(FOO, &[CacheLayout::FlatList]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);
        let path = fx.base.join("metadata/cache/app-misc/foo-1.0");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "only\nthree\nlines\n").unwrap();

        fx.factory.get_metadata(&cpv).unwrap();
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 22);
    }

    #[test]
    fn unknown_inherited_eclass_fails() {
        const BAD: &[(&str, &str)] = &[("INHERITED", "gnome2")];
        let fx = fixture(BAD, &[]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);
        let err = fx.factory.get_metadata(&cpv).unwrap_err();
        assert!(matches!(err, Error::UnknownEclass(ref name) if name == "gnome2"));
    }

    #[test]
    fn missing_ebuild() {
        let fx = fixture(FOO, &[]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        assert!(matches!(
            fx.factory.get_metadata(&cpv),
            Err(Error::Io { .. })
        ));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_back_failure_still_returns_record() {
        let fx = fixture(FOO, &[CacheLayout::FlatHash]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);
        // A file where the category directory should be.
        let cache_root = fx.base.join("metadata/cache");
        fs::create_dir_all(&cache_root).unwrap();
        fs::write(cache_root.join("app-misc"), "").unwrap();

        let record = fx.factory.get_metadata(&cpv).unwrap();
        assert_eq!(record.get("DESCRIPTION"), Some("foo"));
    }

    #[test]
    fn package_attributes() {
        let fx = fixture(FOO, &[CacheLayout::FlatHash]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        let pkg = fx.factory.new_package(&cpv);
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert_eq!(pkg.slot().unwrap().slot, "1");
        assert_eq!(pkg.keywords().unwrap(), ["x86", "~amd64"]);
        assert_eq!(pkg.license().unwrap().to_string(), "GPL-2");
        assert_eq!(pkg.depends().unwrap().leaves().len(), 2);
        assert_eq!(pkg.mtime().unwrap(), Some(1000));

        let files = pkg.fetchables().unwrap();
        let uris: Vec<String> = files.leaves()[0].uris.iter().collect();
        assert_eq!(uris, ["http://distfiles.gentoo.org/foo-1.0.tar.gz"]);
        assert_eq!(fx.repo.manifest_reads.load(Ordering::SeqCst), 1);

        let deps = pkg.evaluate_depends(|_| false).unwrap();
        assert_eq!(deps.depends.to_string(), "sys-libs/zlib");
    }

    #[test]
    fn provides_virtuals() {
        let fx = fixture(FOO, &[]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        let pkg = fx.factory.new_package(&cpv);
        let provides = pkg.provides().unwrap();
        let vpkg = provides.leaves()[0].clone();
        assert_eq!(vpkg.cpv().to_string(), "virtual/foo-1.0");
        assert_eq!(vpkg.rdepends().unwrap().to_string(), "=app-misc/foo-1.0");
        assert_eq!(vpkg.slot().unwrap().slot, "1");
        assert!(Arc::ptr_eq(&vpkg.actual_pkg().unwrap(), &pkg));
    }

    #[test]
    fn metadata_error_names_field() {
        const BAD: &[(&str, &str)] = &[("RDEPEND", "|| ( a/b")];
        let fx = fixture(BAD, &[]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        let pkg = fx.factory.new_package(&cpv);
        assert!(pkg.derive(crate::package::Attr::Slot).is_ok());
        let err = pkg.rdepends().unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata { ref package, ref field, .. }
                if package == "app-misc/foo-1.0" && field == "RDEPEND"
        ));
    }

    #[test]
    fn derive_every_attribute() {
        let fx = fixture(FOO, &[CacheLayout::Protective]);
        let cpv = Cpv::parse("app-misc/foo-1.0").unwrap();
        write_ebuild(&fx.repo, &cpv, 1000);

        let pkg = fx.factory.new_package(&cpv);
        for attr in crate::package::Attr::ALL {
            pkg.derive(attr)
                .unwrap_or_else(|e| panic!("{attr} ({}): {e}", attr.field()));
        }
        assert_eq!(pkg.homepage().unwrap(), "");
        assert_eq!(pkg.provides().unwrap().leaves().len(), 1);
    }

    #[test]
    fn maintainers_come_from_shared_data() {
        let fx = fixture(FOO, &[]);
        let a = fx.factory.new_package(&Cpv::parse("app-misc/foo-1.0").unwrap());
        let b = fx.factory.new_package(&Cpv::parse("app-misc/foo-2.0").unwrap());

        assert_eq!(a.maintainers().unwrap()[0].to_string(), "foo@gentoo.org");
        assert_eq!(a.herds().unwrap(), ["base-system"]);
        assert_eq!(b.longdescription().unwrap(), Some("Does foo things."));
        assert_eq!(b.maintainers().unwrap()[0].maint_type.as_deref(), Some("person"));
        assert_eq!(fx.repo.metadata_reads.load(Ordering::SeqCst), 1);
        // No ebuild exists, so nothing was evaluated.
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn instances_are_shared_while_alive() {
        let fx = fixture(FOO, &[]);
        let a = Cpv::parse("app-misc/foo-1.0").unwrap();
        let b = Cpv::parse("app-misc/foo-2.0").unwrap();

        let first = fx.factory.new_package(&a);
        let again = fx.factory.new_package(&a);
        assert!(Arc::ptr_eq(&first, &again));

        let other = fx.factory.new_package(&b);
        assert!(Arc::ptr_eq(first.shared_data(), other.shared_data()));
        assert_eq!(fx.factory.live_packages(), 2);

        drop(first);
        drop(again);
        assert_eq!(fx.factory.live_packages(), 1);
    }

    #[test]
    fn dead_instances_are_swept() {
        let fx = fixture(FOO, &[]);
        for i in 0..(MIN_SWEEP * 3) {
            let cpv = Cpv::parse(&format!("app-misc/foo-{i}")).unwrap();
            drop(fx.factory.new_package(&cpv));
        }
        assert!(fx.factory.instances.lock().entries.len() < MIN_SWEEP);
    }
}

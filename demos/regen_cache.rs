use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use portage_cache::{
    BoundedPool, CacheConfig, CacheLayout, Checksums, Cpv, Digests, EclassCache, Evaluator,
    MetadataCache, MetadataFactory, MirrorConfig, Repository, Result,
};

const THIRDPARTYMIRRORS: &str = "\
# tier url...
gentoo http://distfiles.gentoo.org/distfiles https://gentoo.osuosl.org/distfiles
";

struct Tree {
    root: PathBuf,
}

impl Repository for Tree {
    fn ebuild_path(&self, cpv: &Cpv) -> PathBuf {
        self.root
            .join(&cpv.category)
            .join(&cpv.package)
            .join(format!("{}-{}.ebuild", cpv.package, cpv.fullver().unwrap_or_default()))
    }

    fn manifest(&self, _category: &str, _package: &str) -> Result<Digests> {
        Ok(Digests::from([(
            "clang-10.0.0.tar.xz".to_string(),
            Checksums::from([("BLAKE2B".to_string(), "4e92abc123".to_string())]),
        )]))
    }
}

fn evaluate(cpv: &Cpv, _: &EclassCache) -> Result<BTreeMap<String, String>> {
    println!("evaluating {cpv}");
    Ok([
        ("EAPI", "7"),
        ("DESCRIPTION", "C language family frontend for LLVM"),
        ("HOMEPAGE", "https://llvm.org/"),
        ("SLOT", "10/10.0"),
        ("KEYWORDS", "~amd64 ~x86"),
        ("IUSE", "debug static-analyzer"),
        ("LICENSE", "Apache-2.0-with-LLVM-exceptions UoI-NCSA"),
        ("DEPEND", "sys-devel/llvm:10 static-analyzer? ( dev-lang/perl )"),
        ("RDEPEND", "sys-devel/llvm:10"),
        ("SRC_URI", "mirror://gentoo/clang-10.0.0.tar.xz"),
        ("RESTRICT", "nomirror"),
        ("PROVIDE", "virtual/c-compiler"),
        ("INHERITED", "llvm"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect())
}

fn main() {
    let dir = tempfile::tempdir().expect("failed to create temporary tree");
    let base = dir.path();
    let tree = Arc::new(Tree {
        root: base.join("tree"),
    });

    let cpv = Cpv::parse("sys-devel/clang-10.0.0").expect("valid cpv");
    let ebuild = tree.ebuild_path(&cpv);
    fs::create_dir_all(ebuild.parent().expect("ebuild has a parent")).expect("mkdir");
    fs::write(&ebuild, "EAPI=7\ninherit llvm\n").expect("write ebuild");
    fs::create_dir_all(base.join("eclass")).expect("mkdir eclass");
    fs::write(base.join("eclass/llvm.eclass"), "# llvm\n").expect("write eclass");

    let eclasses = Arc::new(EclassCache::scan(base.join("eclass")).expect("scan eclasses"));
    let cache = MetadataCache::new(
        CacheConfig::new(base, "local").layout(CacheLayout::FlatHash),
        eclasses.clone(),
    );
    let pool = BoundedPool::new(2, || Ok(Box::new(evaluate) as Box<dyn Evaluator>));
    let factory = MetadataFactory::builder(tree.clone(), eclasses, Arc::new(pool))
        .cache(Arc::new(cache))
        .mirrors(MirrorConfig::parse_thirdpartymirrors(THIRDPARTYMIRRORS))
        .build();

    let pkg = factory.new_package(&cpv);
    let describe = || -> Result<()> {
        println!("=== {} ===", pkg);
        println!("EAPI:         {}", pkg.eapi()?);
        println!("Description:  {}", pkg.description()?);
        println!("Slot:         {}", pkg.slot()?);
        println!("Keywords:     {}", pkg.keywords()?.join(" "));
        println!("IUSE:         {}", pkg.iuse()?.join(" "));
        println!("License:      {}", pkg.license()?);
        println!("DEPEND:       {}", pkg.depends()?);
        println!("RDEPEND:      {}", pkg.rdepends()?);
        for file in pkg.fetchables()?.leaves() {
            println!("Distfile:     {file}");
            for uri in file.uris.iter() {
                println!("  {uri}");
            }
        }
        for vpkg in pkg.provides()?.leaves() {
            println!("Provides:     {} (RDEPEND {})", vpkg, vpkg.rdepends()?);
        }
        let deps = pkg.evaluate_depends(|flag| flag == "static-analyzer")?;
        println!("DEPEND[static-analyzer]: {}", deps.depends);
        Ok(())
    };
    describe().expect("metadata derivation failed");

    let entry = base.join("metadata/cache").join(cpv.to_string());
    println!("\n=== Cache entry ===");
    print!("{}", fs::read_to_string(entry).expect("cache entry written"));

    // A second lookup is served from the cache.
    let record = factory.get_metadata(&cpv).expect("cached metadata");
    println!("\ncached DESCRIPTION: {}", record.get("DESCRIPTION").unwrap_or(""));
}

//! Metadata cache and lazy metadata derivation for Gentoo ebuild trees.
//!
//! Evaluating an ebuild means running a shell, so package managers keep the
//! evaluated variables in an on-disk cache below `metadata/cache/` and only
//! regenerate an entry when the ebuild or one of its inherited eclasses
//! changed. This crate implements that cache and the layer above it that
//! turns raw cache records into typed package attributes.
//!
//! # Overview
//!
//! - [`MetadataCache`] reads and writes cache entries in the fixed-line
//!   (`FlatList`), `KEY=value` (`FlatHash`) or lenient (`Protective`) layouts.
//! - [`EclassCache`] and [`EclassChain`] fingerprint eclasses so entries can
//!   be invalidated when an eclass changes.
//! - [`DepSetParser`] parses the conditional depset grammar shared by
//!   `DEPEND`, `LICENSE`, `SRC_URI` and `PROVIDE`.
//! - [`FetchableResolver`] turns `SRC_URI` into distfiles with mirrors and
//!   checksums.
//! - [`MetadataFactory`] ties it together: it validates cache entries,
//!   falls back to an external [`Evaluator`], writes back, and hands out
//!   [`Package`]s whose attributes are derived on first access.
//!
//! # Examples
//!
//! Parse a dependency string:
//!
//! ```
//! use portage_cache::DepSetParser;
//!
//! let deps = DepSetParser::new()
//!     .parse("a/b? ( cat/pkg1 ) || ( cat/pkg2 cat/pkg3 )", |t| Ok(t.to_string()))
//!     .unwrap();
//! assert_eq!(deps.leaves(), vec!["cat/pkg1", "cat/pkg2", "cat/pkg3"]);
//! ```

mod attrs;
mod cache;
mod cpv;
mod depset;
mod eclass;
mod error;
mod evaluator;
mod factory;
mod fetchable;
mod package;
mod pkg_metadata;
mod record;
mod virtual_pkg;

// Re-export public types
pub use attrs::{parse_atom, parse_license, rewrite_restrict, Eapi};
pub use cache::{CacheConfig, CacheLayout, CacheStore, MetadataCache, MAGIC_LINE_COUNT};
pub use cpv::Cpv;
pub use depset::{DepNode, DepSet, DepSetParser};
pub use eclass::{EclassCache, EclassChain, EclassData};
pub use error::{Error, Result};
pub use evaluator::{BoundedPool, Evaluator, EvaluatorGuard, EvaluatorPool};
pub use factory::{FactoryBuilder, MetadataFactory, Repository, SharedPkgData};
pub use fetchable::{
    Checksums, Digests, Fetchable, FetchableResolver, Mirror, MirrorConfig, UriList, UriSource,
};
pub use package::{Attr, EvaluatedDeps, Package};
pub use pkg_metadata::{Maintainer, PkgMetadata};
pub use record::{MetadataRecord, AUXDB_KEYS, ECLASSES_KEY, MTIME_KEY};
pub use virtual_pkg::VirtualPackage;

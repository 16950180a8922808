use std::io;
use std::path::PathBuf;

/// Error type for cache access and metadata derivation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cache entry exists but cannot be interpreted.
    ///
    /// Readers treat this as a cache miss.
    #[error("corrupt cache entry {key}: {reason}")]
    GeneralCacheCorruption {
        /// Package key of the entry.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Creating, writing or renaming a cache record failed.
    #[error("cache corruption writing {key}: {source}")]
    CacheCorruption {
        /// Package key of the entry.
        key: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// A write was attempted on a read-only cache.
    #[error("cache {0} is read-only")]
    ReadOnlyCache(String),

    /// A record carries a field the cache layout cannot store.
    #[error("cache entry {key}: field {field} is not part of the cache schema")]
    UnknownField {
        /// Package key of the entry.
        key: String,
        /// Offending field name.
        field: String,
    },

    /// A metadata field of a package failed to parse.
    #[error("metadata exception for {package}, field {field}: {message}")]
    Metadata {
        /// Package identity (`category/name-version`).
        package: String,
        /// Raw field name (e.g. `DEPEND`).
        field: String,
        /// Underlying parse error.
        message: String,
    },

    /// Malformed depset grammar.
    #[error("invalid depset: {0}")]
    InvalidDepSet(String),

    /// A dependency atom was rejected.
    #[error("invalid atom: {0}")]
    InvalidAtom(String),

    /// A license token was rejected.
    #[error("invalid license: {0}")]
    InvalidLicense(String),

    /// Not a `category/name-version` string.
    #[error("invalid cpv: {0}")]
    InvalidCpv(String),

    /// A `SRC_URI` file has no digest entry.
    #[error("missing checksum for {0}")]
    MissingChksum(String),

    /// A `mirror://` tier is not configured.
    #[error("unknown mirror tier {tier} (for {path})")]
    UnknownMirror {
        /// Requested mirror group.
        tier: String,
        /// Path below the mirror.
        path: String,
    },

    /// An inherited eclass is not present in the eclass directory.
    #[error("unknown eclass: {0}")]
    UnknownEclass(String),

    /// `SLOT` was set but empty.
    #[error("SLOT cannot be unset for {0}")]
    InvalidSlot(String),

    /// The external evaluator failed to produce metadata.
    #[error("metadata evaluation failed for {package}: {message}")]
    Evaluator {
        /// Package identity.
        package: String,
        /// Evaluator diagnostic.
        message: String,
    },

    /// Filesystem failure outside of a cache write.
    #[error("{}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Attach package and field context to grammar failures.
    ///
    /// Resolution errors (`MissingChksum`, `UnknownMirror`) keep their own
    /// type so callers can tell them apart.
    pub(crate) fn in_field(self, package: &str, field: &str) -> Error {
        match self {
            Error::InvalidDepSet(message)
            | Error::InvalidAtom(message)
            | Error::InvalidLicense(message)
            | Error::InvalidCpv(message) => Error::Metadata {
                package: package.to_string(),
                field: field.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Result type for portage-cache operations.
pub type Result<T> = std::result::Result<T, Error>;

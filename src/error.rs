use std::error::Error as StdError;
use std::fmt;

/// Crate error type covering the geometry codec, the working-copy engines, and
/// the two external collaborators (the SQL engine and the object store) that
/// this crate cannot avoid observing.
#[derive(Debug)]
pub enum RepoError {
    /// Wraps errors returned by `rusqlite`.
    Sql(rusqlite::Error),
    /// Wraps errors returned by `git2`.
    Git(git2::Error),
    /// Wraps errors returned by the `wkb` crate.
    Wkb(wkb::error::WkbError),
    /// Wraps `std::io::Error` (pointer-file / LFS cache I/O).
    Io(std::io::Error),

    /// The directory is missing the object-store metadata, or it is not bare.
    RepoNotFound { path: String },
    /// `__kxg_meta.tree` does not match the expected tree id.
    WorkingCopyMismatch {
        expected: String,
        found: String,
    },
    /// A state-mutating operation requires a clean working copy.
    DirtyWorkingCopy { layer: String },
    /// GPB magic/version/flags failed validation.
    BadGeometry(String),
    /// A feature is recognized but deliberately unimplemented (extended GPB,
    /// meta/schema diffs, unsupported tree-delta kinds).
    Unsupported(String),
    /// The table has no usable primary key.
    NotAGeoPackageLayer { layer: String },
    /// No working copy is configured for this repository.
    MissingWorkingCopy,
    /// A commit was requested but nothing changed.
    NoChanges,
    /// A merge could not be completed automatically.
    MergeConflict(String),
    /// A point-cloud tile was committed in a format that requires conversion
    /// but no conversion was requested.
    FormatRejected { tile: String },

    /// A column type declared in SQLite metadata is not supported by this crate.
    UnsupportedColumnType {
        column: String,
        declared_type: String,
    },
    /// Invalid or mixed `z` / `m` dimension flags in GeoPackage metadata.
    InvalidDimension { z: i8, m: i8 },
    /// A geometry type in metadata could not be mapped to a supported WKB geometry type.
    UnsupportedGeometryType(String),
    /// Invalid GeoPackage geometry flags byte.
    InvalidGpkgGeometryFlags(u8),
    /// GeoPackage geometry blob is too short for the fixed header.
    InvalidGpkgGeometryLength { len: usize, minimum: usize },
    /// GeoPackage geometry blob is too short for the declared envelope payload.
    InvalidGpkgGeometryEnvelope { len: usize, required: usize },
    /// A pointer file was missing a required field or had a malformed `oid`.
    InvalidPointerFile { reason: String },
    /// Dynamic `Value` type did not match the expected conversion target.
    ValueTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// Requested feature property does not exist in the feature.
    MissingProperty { property: String },
    /// A layer with the same name already exists.
    LayerAlreadyExists { layer_name: String },
    /// Layer schema has multiple primary key columns, which is unsupported.
    CompositePrimaryKeyUnsupported { layer_name: String },
    /// Layer schema has no primary key column.
    MissingPrimaryKeyColumn { layer_name: String },
    /// Connection is read-only but a write was attempted.
    ReadOnly,
    /// Generic message for conditions that don't warrant their own variant.
    Message(String),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(err) => write!(f, "{err}"),
            Self::Git(err) => write!(f, "{err}"),
            Self::Wkb(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::RepoNotFound { path } => {
                write!(f, "not an existing repository: {path}")
            }
            Self::WorkingCopyMismatch { expected, found } => write!(
                f,
                "working copy tree {found} does not match expected tree {expected}"
            ),
            Self::DirtyWorkingCopy { layer } => {
                write!(f, "uncommitted changes in layer '{layer}'")
            }
            Self::BadGeometry(reason) => write!(f, "bad geometry: {reason}"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
            Self::NotAGeoPackageLayer { layer } => {
                write!(f, "'{layer}' is not a valid GeoPackage layer (no primary key)")
            }
            Self::MissingWorkingCopy => write!(f, "no working copy configured"),
            Self::NoChanges => write!(f, "no changes to commit"),
            Self::MergeConflict(detail) => write!(f, "merge conflict: {detail}"),
            Self::FormatRejected { tile } => write!(
                f,
                "'{tile}' is not in the dataset's native tile format; pass --convert-to-dataset-format to convert it"
            ),
            Self::UnsupportedColumnType {
                column,
                declared_type,
            } => write!(
                f,
                "unsupported column type for column '{column}': {declared_type}"
            ),
            Self::InvalidDimension { z, m } => {
                write!(f, "invalid or mixed geometry dimension (z={z}, m={m})")
            }
            Self::UnsupportedGeometryType(ty) => write!(f, "unsupported geometry type: {ty}"),
            Self::InvalidGpkgGeometryFlags(flags) => {
                write!(f, "invalid gpkg geometry flags: {flags:#04x}")
            }
            Self::InvalidGpkgGeometryLength { len, minimum } => write!(
                f,
                "invalid gpkg geometry length: got {len} bytes, expected at least {minimum}"
            ),
            Self::InvalidGpkgGeometryEnvelope { len, required } => write!(
                f,
                "invalid gpkg geometry envelope length: got {len} bytes, required {required}"
            ),
            Self::InvalidPointerFile { reason } => write!(f, "invalid pointer file: {reason}"),
            Self::ValueTypeMismatch { expected, actual } => {
                write!(f, "expected {expected}, got {actual}")
            }
            Self::MissingProperty { property } => write!(f, "missing property: {property}"),
            Self::LayerAlreadyExists { layer_name } => {
                write!(f, "layer already exists: {layer_name}")
            }
            Self::CompositePrimaryKeyUnsupported { layer_name } => write!(
                f,
                "composite primary keys are not supported yet for layer: {layer_name}"
            ),
            Self::MissingPrimaryKeyColumn { layer_name } => {
                write!(f, "no primary key column found for layer: {layer_name}")
            }
            Self::ReadOnly => write!(f, "operation not allowed on read-only connection"),
            Self::Message(msg) => write!(f, "{msg}"),
        }
    }
}

impl StdError for RepoError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Sql(err) => Some(err),
            Self::Git(err) => Some(err),
            Self::Wkb(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<git2::Error> for RepoError {
    fn from(err: git2::Error) -> Self {
        Self::Git(err)
    }
}

impl From<wkb::error::WkbError> for RepoError {
    fn from(err: wkb::error::WkbError) -> Self {
        Self::Wkb(err)
    }
}

impl From<std::io::Error> for RepoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;

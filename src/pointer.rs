//! Pointer-file codec and large-file cache path resolution for point-cloud
//! tiles (see `pointcloud` for the dataset logic built on top of this).
//!
//! A pointer file never holds tile bytes itself; it is a small text blob
//! checked into the tree, while the actual tile sits in the local cache
//! keyed by its sha256.

use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::error::{RepoError, Result};

pub const POINTER_FILE_VERSION: &str = "https://git-lfs.github.com/spec/v1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pointer {
    pub version: String,
    pub oid_sha256: String,
    pub size: u64,
}

fn oid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^oid sha256:([0-9a-f]{64})$").unwrap())
}

impl Pointer {
    pub fn new(oid_sha256: String, size: u64) -> Self {
        Self {
            version: POINTER_FILE_VERSION.to_string(),
            oid_sha256,
            size,
        }
    }

    /// Render the pointer file's on-disk bytes: three `key value` lines.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "version {}\noid sha256:{}\nsize {}\n",
            self.version, self.oid_sha256, self.size
        )
        .into_bytes()
    }

    /// Parse a pointer file. The hash is pulled with a single anchored regex
    /// as specified, independent of the other keys' exact positions; `size`
    /// must still parse as a plain decimal integer.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| RepoError::InvalidPointerFile {
                reason: "not valid utf-8".to_string(),
            })?;

        let oid_sha256 = oid_regex()
            .captures(text)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| RepoError::InvalidPointerFile {
                reason: "missing or malformed 'oid sha256:<64 hex>' line".to_string(),
            })?;

        let mut version = None;
        let mut size = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            match key {
                "version" => version = Some(value.to_string()),
                "size" => {
                    size = Some(value.trim().parse::<u64>().map_err(|_| {
                        RepoError::InvalidPointerFile {
                            reason: format!("invalid size field: {value}"),
                        }
                    })?)
                }
                _ => {}
            }
        }

        Ok(Self {
            version: version.ok_or_else(|| RepoError::InvalidPointerFile {
                reason: "missing 'version' line".to_string(),
            })?,
            oid_sha256,
            size: size.ok_or_else(|| RepoError::InvalidPointerFile {
                reason: "missing 'size' line".to_string(),
            })?,
        })
    }
}

/// Resolve the on-disk cache path for a tile hash: `<gitdir>/lfs/objects/H[0:2]/H[2:4]/H`.
pub fn cache_path(gitdir: &Path, sha256_hex: &str) -> PathBuf {
    gitdir
        .join("lfs")
        .join("objects")
        .join(&sha256_hex[0..2])
        .join(&sha256_hex[2..4])
        .join(sha256_hex)
}

/// Copy `src` into the local cache, computing its sha256 while copying, and
/// return the resulting pointer. Idempotent: re-copying an already-cached
/// tile is a cheap no-op once the destination exists.
pub fn store_tile(gitdir: &Path, src: &Path) -> Result<Pointer> {
    let bytes = std::fs::read(src)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = hex::encode(hasher.finalize());

    let dest = cache_path(gitdir, &hash);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !dest.exists() {
        std::fs::write(&dest, &bytes)?;
    }

    Ok(Pointer::new(hash, bytes.len() as u64))
}

/// Hash of the first two hex characters of a deterministic 64-bit hash of the
/// tile name, used to shard the `tile/<hh>/<name>` tree layout.
pub fn tile_shard(tilename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tilename.as_bytes());
    hex::encode(&hasher.finalize()[0..1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_round_trips_through_bytes() {
        let pointer = Pointer::new("a".repeat(64), 1234);
        let bytes = pointer.to_bytes();
        let parsed = Pointer::parse(&bytes).unwrap();
        assert_eq!(parsed, pointer);
    }

    #[test]
    fn parse_rejects_missing_oid() {
        let bytes = b"version 1\nsize 10\n";
        assert!(matches!(
            Pointer::parse(bytes),
            Err(RepoError::InvalidPointerFile { .. })
        ));
    }

    #[test]
    fn parse_rejects_short_hash() {
        let bytes = b"version 1\noid sha256:deadbeef\nsize 10\n";
        assert!(matches!(
            Pointer::parse(bytes),
            Err(RepoError::InvalidPointerFile { .. })
        ));
    }

    #[test]
    fn store_tile_writes_cache_entry_and_matches_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let tile_path = dir.path().join("tile.las");
        std::fs::write(&tile_path, b"lidar bytes").unwrap();

        let pointer = store_tile(dir.path(), &tile_path).unwrap();
        assert_eq!(pointer.size, "lidar bytes".len() as u64);

        let cached = cache_path(dir.path(), &pointer.oid_sha256);
        assert!(cached.exists());
        assert_eq!(std::fs::read(cached).unwrap(), b"lidar bytes");
    }

    #[test]
    fn tile_shard_is_stable() {
        assert_eq!(tile_shard("tile_0001.laz"), tile_shard("tile_0001.laz"));
    }
}

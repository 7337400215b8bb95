//! Point-cloud tile dataset: the variant of a layer where features are
//! replaced by pointer-file blobs referencing out-of-band binary tiles
//! cached under `<gitdir>/lfs/objects`. The diff here walks a real directory
//! of tile files rather than joining `__kxg_map` against a user table.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};
use sha2::{Digest, Sha256};

use crate::error::{RepoError, Result};
use crate::pointer::{self, Pointer};
use crate::repo as repo_facade;

const DATASET_DIR: &str = ".point-cloud-dataset.v1";

#[derive(Clone, Debug, PartialEq)]
pub enum TileChange {
    Insert {
        tilename: String,
        path: PathBuf,
    },
    Update {
        tilename: String,
        path: PathBuf,
        old_pointer: Pointer,
    },
    Delete {
        tilename: String,
        old_pointer: Pointer,
    },
}

/// A pluggable conversion from a foreign tile format to this dataset's
/// native format, returning the path to the converted file.
pub type ConvertFn<'a> = dyn Fn(&Path) -> Result<PathBuf> + 'a;

fn is_tile_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".las") || lower.ends_with(".laz") || lower.ends_with(".copc.laz")
}

fn is_native_format(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".laz") || lower.ends_with(".copc.laz")
}

fn tile_path(layer: &str, tilename: &str) -> String {
    format!(
        "{layer}/{DATASET_DIR}/tile/{}/{tilename}",
        pointer::tile_shard(tilename)
    )
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn read_tile_pointer(repo: &Repository, tree: &Tree<'_>, layer: &str, tilename: &str) -> Result<Option<Pointer>> {
    let path = tile_path(layer, tilename);
    match repo_facade::read_path(repo, tree, &path)? {
        Some(bytes) => Ok(Some(Pointer::parse(&bytes)?)),
        None => Ok(None),
    }
}

/// Tile names recorded under a layer's tile directory in `tree`.
fn list_tree_tilenames(repo: &Repository, tree: &Tree<'_>, layer: &str) -> Result<BTreeSet<String>> {
    let prefix = format!("{layer}/{DATASET_DIR}/tile/");
    let mut out = BTreeSet::new();
    let mut walk_err: Option<git2::Error> = None;

    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if walk_err.is_some() {
            return TreeWalkResult::Abort;
        }
        if root.starts_with(&prefix) && entry.kind() == Some(git2::ObjectType::Blob) {
            if let Some(name) = entry.name() {
                out.insert(name.to_string());
            }
        }
        TreeWalkResult::Ok
    })
    .map_err(|err| {
        walk_err = Some(err);
    })
    .ok();

    if let Some(err) = walk_err {
        return Err(err.into());
    }
    let _ = repo;
    Ok(out)
}

/// Diff a working-copy directory of raw tile files against the tile
/// pointers recorded in `tree`. A tile is unchanged if its sha256 equals the
/// hash encoded in its recorded pointer.
pub fn working_copy_diff(repo: &Repository, tree: &Tree<'_>, layer: &str, working_dir: &Path) -> Result<Vec<TileChange>> {
    let mut changes = Vec::new();
    let mut seen = BTreeSet::new();

    for entry in std::fs::read_dir(working_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let tilename = entry.file_name().to_string_lossy().into_owned();
        if !is_tile_file(&tilename) {
            continue;
        }
        seen.insert(tilename.clone());

        match read_tile_pointer(repo, tree, layer, &tilename)? {
            None => changes.push(TileChange::Insert {
                tilename,
                path: entry.path(),
            }),
            Some(old_pointer) => {
                let sha256 = sha256_file(&entry.path())?;
                if sha256 != old_pointer.oid_sha256 {
                    changes.push(TileChange::Update {
                        tilename,
                        path: entry.path(),
                        old_pointer,
                    });
                }
            }
        }
    }

    for tilename in list_tree_tilenames(repo, tree, layer)? {
        if seen.contains(&tilename) {
            continue;
        }
        if let Some(old_pointer) = read_tile_pointer(repo, tree, layer, &tilename)? {
            changes.push(TileChange::Delete { tilename, old_pointer });
        }
    }

    Ok(changes)
}

/// Cache a tile file (converting it first if it isn't in the dataset's
/// native format) and return its pointer.
fn commit_tile_file(gitdir: &Path, tilename: &str, path: &Path, convert: Option<&ConvertFn>) -> Result<Pointer> {
    if is_native_format(tilename) {
        return pointer::store_tile(gitdir, path);
    }
    let Some(convert) = convert else {
        return Err(RepoError::FormatRejected {
            tile: tilename.to_string(),
        });
    };
    let converted_path = convert(path)?;
    pointer::store_tile(gitdir, &converted_path)
}

/// Apply one tile change to `base_tree`, returning the id of the resulting
/// top-level tree. Inserts and updates cache the tile (converting foreign
/// formats via `convert`, if given) and write its pointer blob; deletes
/// remove the pointer blob.
pub fn apply_tile_change(
    repo: &Repository,
    base_tree: &Tree<'_>,
    gitdir: &Path,
    layer: &str,
    change: &TileChange,
    convert: Option<&ConvertFn>,
) -> Result<Oid> {
    match change {
        TileChange::Delete { tilename, .. } => {
            let path = tile_path(layer, tilename);
            repo_facade::remove_path(repo, base_tree, &path)
        }
        TileChange::Insert { tilename, path } => {
            let pointer = commit_tile_file(gitdir, tilename, path, convert)?;
            let tree_path = tile_path(layer, tilename);
            repo_facade::set_path(repo, Some(base_tree), &tree_path, &pointer.to_bytes())
        }
        TileChange::Update { tilename, path, .. } => {
            let pointer = commit_tile_file(gitdir, tilename, path, convert)?;
            let tree_path = tile_path(layer, tilename);
            repo_facade::set_path(repo, Some(base_tree), &tree_path, &pointer.to_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use tempfile::tempdir;

    fn init_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn working_copy_diff_reports_untracked_tile_as_insert() {
        let (dir, repo) = init_repo();
        let empty_tree_oid = repo.treebuilder(None).unwrap().write().unwrap();
        let tree = repo.find_tree(empty_tree_oid).unwrap();

        let wc = tempdir().unwrap();
        std::fs::write(wc.path().join("a.laz"), b"lidar").unwrap();

        let changes = working_copy_diff(&repo, &tree, "scan", wc.path()).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], TileChange::Insert { tilename, .. } if tilename == "a.laz"));
        let _ = dir;
    }

    #[test]
    fn working_copy_diff_reports_deletion_when_tile_missing_on_disk() {
        let (dir, repo) = init_repo();
        let pointer = Pointer::new("b".repeat(64), 5);
        let tree_oid = repo_facade::set_path(&repo, None, "scan/.point-cloud-dataset.v1/tile/x/a.laz", &pointer.to_bytes()).unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();

        let wc = tempdir().unwrap();
        let changes = working_copy_diff(&repo, &tree, "scan", wc.path()).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], TileChange::Delete { tilename, .. } if tilename == "a.laz"));
        let _ = dir;
    }

    #[test]
    fn committing_raw_las_without_conversion_is_rejected() {
        let (dir, _repo) = init_repo();
        let path = dir.path().join("tile.las");
        std::fs::write(&path, b"raw lidar").unwrap();

        let err = commit_tile_file(dir.path(), "tile.las", &path, None).unwrap_err();
        assert!(matches!(err, RepoError::FormatRejected { .. }));
    }

    #[test]
    fn committing_raw_las_with_conversion_caches_the_converted_output() {
        let (dir, _repo) = init_repo();
        let path = dir.path().join("tile.las");
        std::fs::write(&path, b"raw lidar").unwrap();

        let converted_path = dir.path().join("tile.laz");
        std::fs::write(&converted_path, b"converted lidar").unwrap();
        let convert: &ConvertFn = &|_: &Path| Ok(converted_path.clone());

        let pointer = commit_tile_file(dir.path(), "tile.las", &path, Some(convert)).unwrap();
        let cached = pointer::cache_path(dir.path(), &pointer.oid_sha256);
        assert_eq!(std::fs::read(cached).unwrap(), b"converted lidar");
    }

    #[test]
    fn apply_tile_change_insert_writes_a_pointer_blob() {
        let (dir, repo) = init_repo();
        let empty_tree_oid = repo.treebuilder(None).unwrap().write().unwrap();
        let tree = repo.find_tree(empty_tree_oid).unwrap();

        let tile_path_on_disk = dir.path().join("a.laz");
        std::fs::write(&tile_path_on_disk, b"lidar bytes").unwrap();
        let change = TileChange::Insert {
            tilename: "a.laz".to_string(),
            path: tile_path_on_disk,
        };

        let new_tree_oid = apply_tile_change(&repo, &tree, dir.path(), "scan", &change, None).unwrap();
        let new_tree = repo.find_tree(new_tree_oid).unwrap();
        let blob = repo_facade::read_path(&repo, &new_tree, &tile_path("scan", "a.laz")).unwrap();
        assert!(blob.is_some());
        let pointer = Pointer::parse(&blob.unwrap()).unwrap();
        assert_eq!(pointer.size, "lidar bytes".len() as u64);
    }
}

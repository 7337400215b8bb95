//! Thin facade over the object store (`git2`/libgit2), exposing exactly the
//! primitives the working-copy engines need: open, peel HEAD to a tree, read
//! a blob or tree entry by path, build a tree, create a blob, create a
//! commit. Everything else about the object store (remotes, branches, log)
//! is delegated straight to `git2` or to the `cli` pass-through verbs.

use std::path::Path;

use git2::{Commit, ObjectType, Oid, Repository, Signature, Tree, TreeBuilder};

use crate::error::{RepoError, Result};

/// Open an existing repository, discovering upward from `path` the way `git`
/// itself would (so callers can run commands from a working-copy subdir).
pub fn discover(path: &Path) -> Result<Repository> {
    Repository::discover(path).map_err(|err| {
        if err.code() == git2::ErrorCode::NotFound {
            RepoError::RepoNotFound {
                path: path.display().to_string(),
            }
        } else {
            err.into()
        }
    })
}

/// Initialize a fresh bare repository at `path` (used by `clone`/init flows).
pub fn init_bare(path: &Path) -> Result<Repository> {
    Ok(Repository::init_bare(path)?)
}

/// Peel `HEAD` to its commit, then to its tree.
pub fn head_commit(repo: &Repository) -> Result<Commit<'_>> {
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    Ok(commit)
}

pub fn head_tree(repo: &Repository) -> Result<Tree<'_>> {
    Ok(head_commit(repo)?.tree()?)
}

/// Look up a tree entry by a `/`-separated path rooted at `tree`, returning
/// its object id and kind. Returns `None` if any path segment is missing.
pub fn lookup_path(repo: &Repository, tree: &Tree<'_>, path: &str) -> Result<Option<(Oid, ObjectType)>> {
    match tree.get_path(Path::new(path)) {
        Ok(entry) => Ok(Some((entry.id(), entry.kind().unwrap_or(ObjectType::Blob)))),
        Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Read a blob's bytes given its object id.
pub fn read_blob(repo: &Repository, oid: Oid) -> Result<Vec<u8>> {
    let blob = repo.find_blob(oid)?;
    Ok(blob.content().to_vec())
}

/// Read the bytes at a `/`-separated path rooted at `tree`, if it names a blob.
pub fn read_path(repo: &Repository, tree: &Tree<'_>, path: &str) -> Result<Option<Vec<u8>>> {
    match lookup_path(repo, tree, path)? {
        Some((oid, ObjectType::Blob)) => Ok(Some(read_blob(repo, oid)?)),
        Some((_, _)) => Err(RepoError::Message(format!("{path} is not a blob"))),
        None => Ok(None),
    }
}

/// Create a blob object from raw bytes, returning its id.
pub fn write_blob(repo: &Repository, bytes: &[u8]) -> Result<Oid> {
    Ok(repo.blob(bytes)?)
}

/// Start a `TreeBuilder` seeded from an existing tree (or empty, if `None`).
pub fn tree_builder<'repo>(
    repo: &'repo Repository,
    base: Option<&Tree<'_>>,
) -> Result<TreeBuilder<'repo>> {
    Ok(repo.treebuilder(base)?)
}

/// Write a tree builder's contents as a tree object.
pub fn write_tree(builder: &mut TreeBuilder<'_>) -> Result<Oid> {
    Ok(builder.write()?)
}

/// Create a commit against the given reference (typically `HEAD`), signed by
/// `signature`, with a single parent (the previous `HEAD` commit, if any).
pub fn commit_tree(
    repo: &Repository,
    update_ref: &str,
    signature: &Signature<'_>,
    message: &str,
    tree_oid: Oid,
    parents: &[&Commit<'_>],
) -> Result<Oid> {
    let tree = repo.find_tree(tree_oid)?;
    Ok(repo.commit(Some(update_ref), signature, signature, message, &tree, parents)?)
}

/// Default author/committer signature, honouring `user.name`/`user.email` if
/// configured, matching `git2::Repository::signature`'s own fallback chain.
pub fn default_signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo.signature()?)
}

fn child_tree<'repo>(repo: &'repo Repository, base: Option<&Tree<'_>>, name: &str) -> Result<Option<Tree<'repo>>> {
    let Some(base) = base else { return Ok(None) };
    match base.get_name(name) {
        Some(entry) if entry.kind() == Some(ObjectType::Tree) => Ok(Some(repo.find_tree(entry.id())?)),
        _ => Ok(None),
    }
}

/// Write (or overwrite) the blob at a `/`-separated path rooted at `base`,
/// returning the id of the resulting top-level tree. Intermediate trees are
/// created as needed; `base` may be `None` to build the path from scratch.
pub fn set_path(repo: &Repository, base: Option<&Tree<'_>>, path: &str, bytes: &[u8]) -> Result<Oid> {
    let segments: Vec<&str> = path.split('/').collect();
    set_path_segments(repo, base, &segments, Some(bytes))
}

/// Remove the entry at `path` from `base`, pruning any intermediate tree left
/// empty by the removal. Returns the id of the resulting top-level tree.
pub fn remove_path(repo: &Repository, base: &Tree<'_>, path: &str) -> Result<Oid> {
    let segments: Vec<&str> = path.split('/').collect();
    set_path_segments(repo, Some(base), &segments, None)
}

fn set_path_segments(repo: &Repository, base: Option<&Tree<'_>>, segments: &[&str], content: Option<&[u8]>) -> Result<Oid> {
    let head = segments[0];
    let mut builder = repo.treebuilder(base)?;

    if segments.len() == 1 {
        match content {
            Some(bytes) => {
                let blob = write_blob(repo, bytes)?;
                builder.insert(head, blob, 0o100644)?;
            }
            None => {
                builder.remove(head).ok();
            }
        }
        return Ok(builder.write()?);
    }

    let child_base = child_tree(repo, base, head)?;
    let child_oid = set_path_segments(repo, child_base.as_ref(), &segments[1..], content)?;
    let child = repo.find_tree(child_oid)?;
    if child.iter().next().is_none() {
        builder.remove(head).ok();
    } else {
        builder.insert(head, child_oid, 0o040000)?;
    }
    Ok(builder.write()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn discover_reports_repo_not_found_outside_a_repo() {
        let dir = tempdir().unwrap();
        let err = discover(dir.path()).unwrap_err();
        assert!(matches!(err, RepoError::RepoNotFound { .. }));
    }

    #[test]
    fn write_blob_and_read_it_back() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let oid = write_blob(&repo, b"hello").unwrap();
        assert_eq!(read_blob(&repo, oid).unwrap(), b"hello");
    }

    #[test]
    fn tree_builder_roundtrips_a_single_blob() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let blob_oid = write_blob(&repo, b"hello").unwrap();

        let mut builder = tree_builder(&repo, None).unwrap();
        builder.insert("greeting", blob_oid, 0o100644).unwrap();
        let tree_oid = write_tree(&mut builder).unwrap();

        let tree = repo.find_tree(tree_oid).unwrap();
        let (oid, kind) = lookup_path(&repo, &tree, "greeting").unwrap().unwrap();
        assert_eq!(oid, blob_oid);
        assert_eq!(kind, ObjectType::Blob);
    }

    #[test]
    fn set_path_creates_intermediate_trees() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree_oid = set_path(&repo, None, "a/b/c.txt", b"hi").unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        assert_eq!(read_path(&repo, &tree, "a/b/c.txt").unwrap(), Some(b"hi".to_vec()));
    }

    #[test]
    fn remove_path_prunes_empty_parent_trees() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree_oid = set_path(&repo, None, "a/b/c.txt", b"hi").unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();

        let tree_oid = remove_path(&repo, &tree, "a/b/c.txt").unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        assert_eq!(lookup_path(&repo, &tree, "a").unwrap(), None);
    }

    #[test]
    fn set_path_preserves_siblings() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree_oid = set_path(&repo, None, "a/one.txt", b"1").unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        let tree_oid = set_path(&repo, Some(&tree), "a/two.txt", b"2").unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        assert_eq!(read_path(&repo, &tree, "a/one.txt").unwrap(), Some(b"1".to_vec()));
        assert_eq!(read_path(&repo, &tree, "a/two.txt").unwrap(), Some(b"2".to_vec()));
    }
}

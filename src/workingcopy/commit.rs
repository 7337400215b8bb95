//! Commit engine: builds a new tree from the current working copy by
//! applying the working-copy diff (and the meta-diff) onto the previous
//! tree, then advances `HEAD` and `__kxg_meta.tree`.

use std::collections::BTreeMap;

use git2::{Oid, Repository, Tree};
use rusqlite::Connection;
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::error::{RepoError, Result};
use crate::meta;
use crate::repo as repo_facade;
use crate::types::{ColumnSpec, ColumnType, Value};

use super::diff::{self as wc_diff, feature_path, feature_shard, FeatureChange};
use super::schema;

pub(crate) fn column_type_of(name: &str, pk_column: &str, columns: &[ColumnSpec]) -> ColumnType {
    if name == pk_column {
        ColumnType::Integer
    } else {
        columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type)
            .unwrap_or(ColumnType::Varchar)
    }
}

pub(crate) fn encode_column_value(column_type: ColumnType, value: &Value) -> Result<Vec<u8>> {
    match (column_type, value) {
        (ColumnType::Geometry, Value::Blob(bytes)) => Ok(bytes.clone()),
        (ColumnType::Geometry, Value::Null) => Ok(Vec::new()),
        (ColumnType::Geometry, other) => Err(RepoError::Message(format!(
            "expected a geometry blob, got {other:?}"
        ))),
        (_, value) => Ok(serde_json::to_vec(&value.to_json()).expect("json values never fail to serialize")),
    }
}

/// Read a layer's meta-items out of `tree`, decoding whatever blobs are present.
fn read_tree_meta(repo: &Repository, tree: &Tree<'_>, layer: &str) -> Result<Map<String, Json>> {
    let mut items = Map::new();
    for (name, _) in meta::META_ITEM_NAMES {
        let path = format!("{layer}/meta/{name}");
        if let Some(bytes) = repo_facade::read_path(repo, tree, &path)? {
            items.insert((*name).to_string(), meta::decode(&bytes)?);
        }
    }
    Ok(items)
}

/// Write every column blob for one feature, threading the growing tree
/// through each write.
fn write_feature_blobs(
    repo: &Repository,
    base_tree: &Tree<'_>,
    layer: &str,
    feature_key: &str,
    values: &BTreeMap<String, Value>,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<Oid> {
    let mut tree_oid = base_tree.id();
    let mut tree = repo.find_tree(tree_oid)?;
    for (name, value) in values {
        let column_type = column_type_of(name, pk_column, columns);
        let bytes = encode_column_value(column_type, value)?;
        let path = feature_path(layer, feature_key, name);
        tree_oid = repo_facade::set_path(repo, Some(&tree), &path, &bytes)?;
        tree = repo.find_tree(tree_oid)?;
    }
    Ok(tree_oid)
}

/// Write the columns that changed between `old` and `new`, and remove any
/// column present in `old` but absent from `new` entirely.
fn write_feature_update(
    repo: &Repository,
    base_tree: &Tree<'_>,
    layer: &str,
    feature_key: &str,
    old: &BTreeMap<String, Value>,
    new: &BTreeMap<String, Value>,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<Oid> {
    let mut tree_oid = base_tree.id();
    let mut tree = repo.find_tree(tree_oid)?;

    let mut names: Vec<&String> = old.keys().chain(new.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let path = feature_path(layer, feature_key, name);
        match new.get(name) {
            Some(value) if old.get(name) != Some(value) => {
                let column_type = column_type_of(name, pk_column, columns);
                let bytes = encode_column_value(column_type, value)?;
                tree_oid = repo_facade::set_path(repo, Some(&tree), &path, &bytes)?;
                tree = repo.find_tree(tree_oid)?;
            }
            Some(_) => {}
            None => {
                tree_oid = repo_facade::remove_path(repo, &tree, &path)?;
                tree = repo.find_tree(tree_oid)?;
            }
        }
    }
    Ok(tree_oid)
}

/// Commit the working copy's pending edits, producing a new commit whose
/// tree reflects the current state of `layer`. Returns `NoChanges` and
/// performs no writes if there is nothing to commit.
pub fn commit(
    conn: &mut Connection,
    repo: &Repository,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
    message: &str,
) -> Result<Oid> {
    let head_commit = repo_facade::head_commit(repo)?;
    let head_tree = head_commit.tree()?;

    let recorded = schema::read_tree_id(conn, layer)?.ok_or(RepoError::MissingWorkingCopy)?;
    if recorded != head_tree.id().to_string() {
        return Err(RepoError::WorkingCopyMismatch {
            expected: head_tree.id().to_string(),
            found: recorded,
        });
    }

    let feature_changes = wc_diff::working_copy_diff(conn, repo, &head_tree, layer, pk_column, columns)?;
    let db_meta = meta::read_all(conn, layer)?;
    let tree_meta = read_tree_meta(repo, &head_tree, layer)?;
    let meta_changes = wc_diff::meta_diff(&db_meta, &tree_meta);

    if feature_changes.is_empty() && meta_changes.is_empty() {
        return Err(RepoError::NoChanges);
    }

    let txn = conn.transaction()?;
    txn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;

    let mut tree_oid = head_tree.id();
    let mut tree = repo.find_tree(tree_oid)?;

    for change in &meta_changes {
        let path = format!("{layer}/meta/{}", change.name);
        tree_oid = match &change.new {
            Some(value) => repo_facade::set_path(repo, Some(&tree), &path, &meta::encode(value))?,
            None => repo_facade::remove_path(repo, &tree, &path)?,
        };
        tree = repo.find_tree(tree_oid)?;
    }

    for change in feature_changes.iter().filter(|c| matches!(c, FeatureChange::Delete { .. })) {
        let FeatureChange::Delete { feature_key, .. } = change else { unreachable!() };
        let path = format!("{layer}/features/{}/{feature_key}", feature_shard(feature_key));
        tree_oid = repo_facade::remove_path(repo, &tree, &path)?;
        tree = repo.find_tree(tree_oid)?;
        txn.execute(
            "DELETE FROM __kxg_map WHERE table_name = ?1 AND feature_key = ?2",
            rusqlite::params![layer, feature_key],
        )?;
    }

    for change in feature_changes.iter().filter(|c| matches!(c, FeatureChange::Update { .. })) {
        let FeatureChange::Update { feature_key, old, new } = change else { unreachable!() };
        tree_oid = write_feature_update(repo, &tree, layer, feature_key, old, new, pk_column, columns)?;
        tree = repo.find_tree(tree_oid)?;
    }

    for change in feature_changes.iter().filter(|c| matches!(c, FeatureChange::Insert { .. })) {
        let FeatureChange::Insert { new, .. } = change else { unreachable!() };
        let fk = Uuid::new_v4().to_string();
        let pk_value = match new.get(pk_column) {
            Some(Value::Integer(i)) => *i,
            other => {
                return Err(RepoError::Message(format!(
                    "expected integer primary key '{pk_column}', got {other:?}"
                )))
            }
        };
        tree_oid = write_feature_blobs(repo, &tree, layer, &fk, new, pk_column, columns)?;
        tree = repo.find_tree(tree_oid)?;
        txn.execute(
            "UPDATE __kxg_map SET feature_key = ?1, state = 0
             WHERE table_name = ?2 AND feature_key IS NULL AND feature_id = ?3",
            rusqlite::params![fk, layer, pk_value],
        )?;
    }

    txn.execute("UPDATE __kxg_map SET state = 0 WHERE table_name = ?1", [layer])?;
    txn.execute(
        "DELETE FROM __kxg_map WHERE table_name = ?1 AND feature_key IS NULL",
        [layer],
    )?;

    let signature = repo_facade::default_signature(repo)?;
    let commit_oid = repo_facade::commit_tree(repo, "HEAD", &signature, message, tree_oid, &[&head_commit])?;
    schema::write_tree_id(&txn, layer, &tree_oid.to_string())?;

    txn.pragma_update(None, "locking_mode", "NORMAL")?;
    let _: i64 = txn.query_row("SELECT 1", [], |row| row.get(0))?;
    txn.commit()?;

    Ok(commit_oid)
}

#[cfg(test)]
mod tests {
    use super::super::checkout;
    use super::*;
    use crate::gpkg::Gpkg;
    use git2::Repository;
    use serde_json::json;
    use tempfile::tempdir;

    /// Build a tiny one-layer tree (no geometry column, to keep the fixture
    /// small) with a single feature, and commit it so `HEAD` points at it.
    fn seed_repo() -> (tempfile::TempDir, Repository, String) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let table_info = json!([
            {"cid": 0, "name": "fid", "type": "INTEGER", "notnull": 1, "dflt_value": null, "pk": 1},
            {"cid": 1, "name": "name", "type": "TEXT", "notnull": 0, "dflt_value": null, "pk": 0},
        ]);
        let contents = json!({
            "table_name": "points", "data_type": "attributes",
            "identifier": "points", "description": null, "srs_id": 4326,
        });

        let mut tree_oid = repo_facade::set_path(&repo, None, "points/meta/sqlite_table_info", &meta::encode(&table_info)).unwrap();
        let mut tree = repo.find_tree(tree_oid).unwrap();
        tree_oid = repo_facade::set_path(&repo, Some(&tree), "points/meta/gpkg_contents", &meta::encode(&contents)).unwrap();
        tree = repo.find_tree(tree_oid).unwrap();

        let feature_key = "aaaaaaaa-0000-0000-0000-000000000001".to_string();
        tree_oid = repo_facade::set_path(&repo, Some(&tree), &format!("points/features/aaaa/{feature_key}/fid"), b"1").unwrap();
        tree = repo.find_tree(tree_oid).unwrap();
        tree_oid = repo_facade::set_path(&repo, Some(&tree), &format!("points/features/aaaa/{feature_key}/name"), b"\"hello\"").unwrap();

        let signature = repo.signature().unwrap_or_else(|_| git2::Signature::now("test", "test@example.com").unwrap());
        let tree_obj = repo.find_tree(tree_oid).unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "seed", &tree_obj, &[]).unwrap();

        (dir, repo, feature_key)
    }

    fn open_checked_out(repo: &Repository) -> (Gpkg, String, Vec<ColumnSpec>) {
        let head_tree = repo_facade::head_tree(repo).unwrap();
        let head_oid = head_tree.id();
        let mut gpkg = Gpkg::create_in_memory().unwrap();
        checkout::checkout_new_into(gpkg.connection_mut(), repo, &head_tree, head_oid, "points").unwrap();
        let columns = vec![ColumnSpec {
            name: "name".to_string(),
            column_type: ColumnType::Varchar,
            primary_key: false,
            not_null: false,
        }];
        (gpkg, "fid".to_string(), columns)
    }

    #[test]
    fn commit_with_no_edits_is_a_no_op_and_reports_no_changes() {
        let (_dir, repo, _fk) = seed_repo();
        let (mut gpkg, pk_column, columns) = open_checked_out(&repo);

        let err = commit(gpkg.connection_mut(), &repo, "points", &pk_column, &columns, "nothing").unwrap_err();
        assert!(matches!(err, RepoError::NoChanges));
    }

    #[test]
    fn commit_mints_a_feature_key_for_an_insert() {
        let (_dir, repo, _fk) = seed_repo();
        let (mut gpkg, pk_column, columns) = open_checked_out(&repo);
        gpkg.connection()
            .execute("INSERT INTO points (fid, name) VALUES (42, 'new')", [])
            .unwrap();

        let commit_oid = commit(gpkg.connection_mut(), &repo, "points", &pk_column, &columns, "add 42").unwrap();
        let commit = repo.find_commit(commit_oid).unwrap();
        assert_eq!(commit.parent_count(), 1);

        let (feature_key, state): (Option<String>, i64) = gpkg
            .connection()
            .query_row(
                "SELECT feature_key, state FROM __kxg_map WHERE feature_id = 42",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(feature_key.is_some());
        assert_eq!(state, 0);

        let tree = commit.tree().unwrap();
        let fk = feature_key.unwrap();
        let path = format!("points/features/{}/{fk}/name", &fk[0..4]);
        assert_eq!(
            repo_facade::read_path(&repo, &tree, &path).unwrap(),
            Some(br#""new""#.to_vec())
        );
    }

    #[test]
    fn commit_removes_tree_entry_for_a_delete() {
        let (_dir, repo, feature_key) = seed_repo();
        let (mut gpkg, pk_column, columns) = open_checked_out(&repo);
        gpkg.connection().execute("DELETE FROM points WHERE fid = 1", []).unwrap();

        let commit_oid = commit(gpkg.connection_mut(), &repo, "points", &pk_column, &columns, "delete 1").unwrap();
        let commit = repo.find_commit(commit_oid).unwrap();
        let tree = commit.tree().unwrap();
        let path = format!("points/features/{}/{feature_key}/name", &feature_key[0..4]);
        assert_eq!(repo_facade::read_path(&repo, &tree, &path).unwrap(), None);

        let count: i64 = gpkg
            .connection()
            .query_row("SELECT COUNT(*) FROM __kxg_map", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn commit_writes_only_changed_columns_for_an_update() {
        let (_dir, repo, feature_key) = seed_repo();
        let (mut gpkg, pk_column, columns) = open_checked_out(&repo);
        gpkg.connection()
            .execute("UPDATE points SET name = 'renamed' WHERE fid = 1", [])
            .unwrap();

        let commit_oid = commit(gpkg.connection_mut(), &repo, "points", &pk_column, &columns, "rename").unwrap();
        let commit = repo.find_commit(commit_oid).unwrap();
        let tree = commit.tree().unwrap();
        let path = format!("points/features/{}/{feature_key}/name", &feature_key[0..4]);
        assert_eq!(
            repo_facade::read_path(&repo, &tree, &path).unwrap(),
            Some(br#""renamed""#.to_vec())
        );

        let state: i64 = gpkg
            .connection()
            .query_row("SELECT state FROM __kxg_map WHERE feature_id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(state, 0);
    }
}

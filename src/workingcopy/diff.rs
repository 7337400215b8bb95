//! Diff engine: the working-copy diff (join `__kxg_map` with the user table)
//! and the tree-to-tree diff (used by checkout and the point-cloud dataset).

use std::collections::BTreeMap;

use git2::{Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};
use rusqlite::Connection;
use serde_json::{Map, Value as Json};

use crate::error::{RepoError, Result};
use crate::repo as repo_facade;
use crate::types::{ColumnSpec, ColumnType, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum FeatureChange {
    /// `feature_key` is `None` for a not-yet-committed working-copy insert,
    /// and `Some` when read directly out of a tree (tree-to-tree diff).
    Insert {
        feature_key: Option<String>,
        new: BTreeMap<String, Value>,
    },
    Update {
        feature_key: String,
        old: BTreeMap<String, Value>,
        new: BTreeMap<String, Value>,
    },
    Delete {
        feature_key: String,
        old: BTreeMap<String, Value>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetaChange {
    pub name: String,
    pub old: Option<Json>,
    pub new: Option<Json>,
}

/// Compute set-difference meta changes between the value the database
/// currently reports and the value the tree currently holds, per item name.
pub fn meta_diff(db_items: &Map<String, Json>, tree_items: &Map<String, Json>) -> Vec<MetaChange> {
    let mut names: Vec<&String> = db_items.keys().chain(tree_items.keys()).collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .filter_map(|name| {
            let db_value = db_items.get(name);
            let tree_value = tree_items.get(name);
            if db_value == tree_value {
                return None;
            }
            Some(MetaChange {
                name: name.clone(),
                old: tree_value.cloned(),
                new: db_value.cloned(),
            })
        })
        .collect()
}

pub(crate) fn feature_shard(feature_key: &str) -> &str {
    &feature_key[0..4]
}

pub(crate) fn feature_path(layer: &str, feature_key: &str, column: &str) -> String {
    format!(
        "{layer}/features/{}/{feature_key}/{column}",
        feature_shard(feature_key)
    )
}

/// Read one feature's columns (pk + others) out of a tree, decoding each
/// blob per its declared column type (raw bytes for geometry, JSON for
/// everything else).
pub(crate) fn read_feature_from_tree(
    repo: &Repository,
    tree: &Tree<'_>,
    layer: &str,
    feature_key: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    let all_columns = std::iter::once(&ColumnSpec {
        name: pk_column.to_string(),
        column_type: ColumnType::Integer,
        primary_key: true,
        not_null: true,
    })
    .cloned()
    .collect::<Vec<_>>()
    .into_iter()
    .chain(columns.iter().cloned());

    for column in all_columns {
        let path = feature_path(layer, feature_key, &column.name);
        let Some(bytes) = repo_facade::read_path(repo, tree, &path)? else {
            continue;
        };
        let value = match column.column_type {
            ColumnType::Geometry => Value::Blob(bytes),
            other => {
                let json: Json = serde_json::from_slice(&bytes)
                    .map_err(|err| RepoError::Message(format!("bad json at {path}: {err}")))?;
                Value::from_json(&json, other)?
            }
        };
        out.insert(column.name, value);
    }
    Ok(out)
}

pub(crate) fn read_user_row(
    conn: &Connection,
    layer: &str,
    pk_column: &str,
    pk_value: i64,
    columns: &[ColumnSpec],
) -> Result<BTreeMap<String, Value>> {
    let column_list = std::iter::once(pk_column)
        .chain(columns.iter().map(|c| c.name.as_str()))
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {column_list} FROM \"{layer}\" WHERE \"{pk_column}\" = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let all_names: Vec<&str> = std::iter::once(pk_column)
        .chain(columns.iter().map(|c| c.name.as_str()))
        .collect();

    stmt.query_row([pk_value], |row| {
        let mut out = BTreeMap::new();
        for (i, name) in all_names.iter().enumerate() {
            let value: Value = row.get_ref(i)?.into();
            out.insert((*name).to_string(), value);
        }
        Ok(out)
    })
    .map_err(Into::into)
}

/// Working-copy diff: join `__kxg_map` with the user table on primary key.
pub fn working_copy_diff(
    conn: &Connection,
    repo: &Repository,
    base_tree: &Tree<'_>,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<Vec<FeatureChange>> {
    let mut stmt = conn.prepare(
        "SELECT feature_key, feature_id, state FROM __kxg_map
         WHERE table_name = ?1 AND state != 0",
    )?;
    let rows = stmt.query_map([layer], |row| {
        let feature_key: Option<String> = row.get(0)?;
        let feature_id: i64 = row.get(1)?;
        let state: i64 = row.get(2)?;
        Ok((feature_key, feature_id, state))
    })?;

    let mut changes = Vec::new();
    for row in rows {
        let (feature_key, feature_id, state) = row?;
        match (state, feature_key) {
            (1, None) => {
                let new = read_user_row(conn, layer, pk_column, feature_id, columns)?;
                changes.push(FeatureChange::Insert {
                    feature_key: None,
                    new,
                });
            }
            (1, Some(feature_key)) => {
                let new = read_user_row(conn, layer, pk_column, feature_id, columns)?;
                let old =
                    read_feature_from_tree(repo, base_tree, layer, &feature_key, pk_column, columns)?;
                changes.push(FeatureChange::Update {
                    feature_key,
                    old,
                    new,
                });
            }
            (-1, Some(feature_key)) => {
                let old =
                    read_feature_from_tree(repo, base_tree, layer, &feature_key, pk_column, columns)?;
                changes.push(FeatureChange::Delete { feature_key, old });
            }
            (-1, None) => {
                // An insert that was later deleted before ever being committed: drop silently.
            }
            _ => {}
        }
    }
    Ok(changes)
}

/// The set of feature keys present under a layer's `features` directory in
/// `tree`, used by the integrity verifier to compare against `__kxg_map`.
pub(crate) fn tree_feature_keys(repo: &Repository, tree: &Tree<'_>, layer: &str) -> Result<std::collections::BTreeSet<String>> {
    Ok(list_feature_subtrees(repo, tree, layer)?.into_keys().collect())
}

/// Enumerate the feature-key -> subtree-oid map for a layer's `features`
/// directory in `tree`.
fn list_feature_subtrees(repo: &Repository, tree: &Tree<'_>, layer: &str) -> Result<BTreeMap<String, Oid>> {
    let prefix = format!("{layer}/features/");
    let mut out = BTreeMap::new();
    let mut walk_err: Option<git2::Error> = None;

    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if walk_err.is_some() {
            return TreeWalkResult::Abort;
        }
        if root.starts_with(&prefix)
            && root.len() == prefix.len() + 5
            && entry.kind() == Some(git2::ObjectType::Tree)
        {
            if let Some(name) = entry.name() {
                out.insert(name.to_string(), entry.id());
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
    let _ = repo; // kept for API symmetry / future use (e.g. submodule entries)
    Ok(out)
}

/// Tree-to-tree diff over a layer's features. Only added/deleted/modified are
/// supported, matching the subset of delta kinds this system recognizes.
pub fn tree_to_tree_feature_diff(
    repo: &Repository,
    old_tree: &Tree<'_>,
    new_tree: &Tree<'_>,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<Vec<FeatureChange>> {
    let old_keys = list_feature_subtrees(repo, old_tree, layer)?;
    let new_keys = list_feature_subtrees(repo, new_tree, layer)?;

    let mut changes = Vec::new();
    for (fk, new_oid) in &new_keys {
        match old_keys.get(fk) {
            None => {
                let new = read_feature_from_tree(repo, new_tree, layer, fk, pk_column, columns)?;
                changes.push(FeatureChange::Insert {
                    feature_key: Some(fk.clone()),
                    new,
                });
            }
            Some(old_oid) if old_oid != new_oid => {
                let old = read_feature_from_tree(repo, old_tree, layer, fk, pk_column, columns)?;
                let new = read_feature_from_tree(repo, new_tree, layer, fk, pk_column, columns)?;
                changes.push(FeatureChange::Update {
                    feature_key: fk.clone(),
                    old,
                    new,
                });
            }
            Some(_) => {}
        }
    }
    for (fk, _) in &old_keys {
        if !new_keys.contains_key(fk) {
            let old = read_feature_from_tree(repo, old_tree, layer, fk, pk_column, columns)?;
            changes.push(FeatureChange::Delete {
                feature_key: fk.clone(),
                old,
            });
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_diff_is_empty_when_identical() {
        let mut a = Map::new();
        a.insert("gpkg_contents".into(), Json::from(1));
        let diff = meta_diff(&a, &a.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn meta_diff_reports_changed_and_added_items() {
        let mut db = Map::new();
        db.insert("gpkg_contents".into(), Json::from(2));
        db.insert("gpkg_metadata".into(), Json::from("x"));
        let mut tree = Map::new();
        tree.insert("gpkg_contents".into(), Json::from(1));

        let diff = meta_diff(&db, &tree);
        assert_eq!(diff.len(), 2);
        assert!(diff.iter().any(|c| c.name == "gpkg_contents" && c.old == Some(Json::from(1))));
        assert!(diff.iter().any(|c| c.name == "gpkg_metadata" && c.old.is_none()));
    }
}

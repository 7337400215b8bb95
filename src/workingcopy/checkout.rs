//! Checkout engine: materializes a tree into a fresh or existing working
//! copy. New checkout builds the GeoPackage layer from scratch; update
//! checkout applies a tree-to-tree diff onto an already-materialized layer.

use std::collections::BTreeMap;
use std::path::Path;

use git2::{Oid, Repository, Tree};
use rusqlite::Connection;
use serde_json::Value as Json;

use crate::error::{RepoError, Result};
use crate::gpkg::Gpkg;
use crate::ogc_sql;
use crate::repo as repo_facade;
use crate::types::{ColumnSpec, ColumnType, Value};
use crate::{conversions::column_type_from_str, meta};

use super::diff::{self, FeatureChange};
use super::schema::{self, TriggerSuspendGuard};

const FEATURE_BATCH_SIZE: usize = 1_000;

fn meta_blob(repo: &Repository, tree: &Tree<'_>, layer: &str, name: &str) -> Result<Option<Json>> {
    let path = format!("{layer}/meta/{name}");
    match repo_facade::read_path(repo, tree, &path)? {
        Some(bytes) => Ok(Some(meta::decode(&bytes)?)),
        None => Ok(None),
    }
}

fn as_array<'a>(value: &'a Json) -> &'a [Json] {
    value.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn str_field(obj: &Json, field: &str) -> Result<String> {
    obj.get(field)
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| RepoError::MissingProperty {
            property: field.to_string(),
        })
}

fn opt_str_field(obj: &Json, field: &str) -> Option<String> {
    obj.get(field).and_then(Json::as_str).map(str::to_string)
}

fn i64_field(obj: &Json, field: &str) -> Result<i64> {
    obj.get(field)
        .and_then(Json::as_i64)
        .ok_or_else(|| RepoError::MissingProperty {
            property: field.to_string(),
        })
}

fn opt_i64_field(obj: &Json, field: &str) -> Option<i64> {
    obj.get(field).and_then(Json::as_i64)
}

/// Insert the rows described by this layer's meta blobs into the relevant
/// system tables. Skips anything the meta serializer itself skipped.
fn materialize_meta_rows(conn: &Connection, layer: &str, repo: &Repository, tree: &Tree<'_>) -> Result<()> {
    if let Some(srs_rows) = meta_blob(repo, tree, layer, "gpkg_spatial_ref_sys")? {
        for row in as_array(&srs_rows) {
            conn.execute(
                "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                 (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    str_field(row, "srs_name")?,
                    i64_field(row, "srs_id")?,
                    str_field(row, "organization")?,
                    i64_field(row, "organization_coordsys_id")?,
                    str_field(row, "definition")?,
                    opt_str_field(row, "description"),
                ],
            )?;
        }
    }

    if let Some(contents) = meta_blob(repo, tree, layer, "gpkg_contents")? {
        conn.execute(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, description, srs_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                str_field(&contents, "table_name")?,
                str_field(&contents, "data_type")?,
                opt_str_field(&contents, "identifier"),
                opt_str_field(&contents, "description").unwrap_or_default(),
                opt_i64_field(&contents, "srs_id"),
            ],
        )?;
    }

    if let Some(geom_cols) = meta_blob(repo, tree, layer, "gpkg_geometry_columns")? {
        conn.execute(
            "INSERT INTO gpkg_geometry_columns
             (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                layer,
                str_field(&geom_cols, "column_name")?,
                str_field(&geom_cols, "geometry_type_name")?,
                i64_field(&geom_cols, "srs_id")?,
                i64_field(&geom_cols, "z")?,
                i64_field(&geom_cols, "m")?,
            ],
        )?;
    }

    if let Some(metadata) = meta_blob(repo, tree, layer, "gpkg_metadata")? {
        for row in as_array(&metadata) {
            conn.execute(
                "INSERT OR IGNORE INTO gpkg_metadata (id, md_scope, md_standard_uri, mime_type, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    i64_field(row, "id")?,
                    str_field(row, "md_scope")?,
                    str_field(row, "md_standard_uri")?,
                    str_field(row, "mime_type")?,
                    str_field(row, "metadata")?,
                ],
            )?;
        }
    }
    if let Some(metadata_ref) = meta_blob(repo, tree, layer, "gpkg_metadata_reference")? {
        for row in as_array(&metadata_ref) {
            conn.execute(
                "INSERT INTO gpkg_metadata_reference (reference_scope, table_name, md_file_id, md_parent_id)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    str_field(row, "reference_scope")?,
                    layer,
                    i64_field(row, "md_file_id")?,
                    opt_i64_field(row, "md_parent_id"),
                ],
            )?;
        }
    }

    // Defensive: an OGR-produced GeoPackage leaves a placeholder row behind;
    // this crate never creates one, but a tree imported from such a tool
    // might still carry it in its meta blobs.
    conn.execute(
        "DELETE FROM gpkg_contents WHERE table_name = 'ogr_empty_table'",
        [],
    )?;
    conn.execute(
        "DELETE FROM gpkg_geometry_columns WHERE table_name = 'ogr_empty_table'",
        [],
    )?;
    Ok(())
}

fn create_user_table(conn: &Connection, layer: &str, table_info: &[Json]) -> Result<()> {
    let mut defs = Vec::new();
    for column in table_info {
        let name = str_field(column, "name")?;
        let ty = str_field(column, "type")?;
        let not_null = i64_field(column, "notnull")? != 0;
        let pk = i64_field(column, "pk")? != 0;
        let mut def = format!("\"{name}\" {ty}");
        if pk {
            def.push_str(" PRIMARY KEY");
        }
        if not_null && !pk {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
    }
    conn.execute_batch(&ogc_sql::sql_create_table(layer, &defs.join(", ")))?;
    Ok(())
}

fn column_specs_from_table_info(table_info: &[Json], geom_column: Option<&str>) -> Result<(String, Vec<ColumnSpec>)> {
    let mut pk_column = None;
    let mut columns = Vec::new();
    for column in table_info {
        let name = str_field(column, "name")?;
        let declared_type = str_field(column, "type")?;
        let not_null = i64_field(column, "notnull")? != 0;
        let is_pk = i64_field(column, "pk")? != 0;
        if is_pk {
            pk_column = Some(name.clone());
            continue;
        }
        let column_type = if Some(name.as_str()) == geom_column {
            ColumnType::Geometry
        } else {
            column_type_from_str(&declared_type).ok_or_else(|| RepoError::UnsupportedColumnType {
                column: name.clone(),
                declared_type,
            })?
        };
        columns.push(ColumnSpec {
            name,
            column_type,
            primary_key: false,
            not_null,
        });
    }
    let pk_column = pk_column.ok_or(RepoError::Message(
        "sqlite_table_info meta item has no primary key column".to_string(),
    ))?;
    Ok((pk_column, columns))
}

fn insert_feature_row(
    conn: &Connection,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
    feature_key: &str,
    values: &BTreeMap<String, Value>,
) -> Result<()> {
    let mut names = vec![pk_column.to_string()];
    names.extend(columns.iter().map(|c| c.name.clone()));
    let placeholders = (1..=names.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let column_list = names.iter().map(|n| format!("\"{n}\"")).collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{layer}\" ({column_list}) VALUES ({placeholders})");

    let params: Vec<&Value> = names
        .iter()
        .map(|n| values.get(n).unwrap_or(&Value::Null))
        .collect();
    conn.execute(&sql, rusqlite::params_from_iter(params))?;

    let pk_value = pk_of(values, pk_column)?;
    conn.execute(
        "INSERT INTO __kxg_map (table_name, feature_key, feature_id, state) VALUES (?1, ?2, ?3, 0)",
        rusqlite::params![layer, feature_key, pk_value],
    )?;
    Ok(())
}

fn pk_of(values: &BTreeMap<String, Value>, pk_column: &str) -> Result<i64> {
    match values.get(pk_column) {
        Some(Value::Integer(i)) => Ok(*i),
        other => Err(RepoError::Message(format!(
            "expected integer primary key '{pk_column}', got {other:?}"
        ))),
    }
}

/// New checkout: create a fresh GeoPackage file, populate system tables,
/// create the user table, install side tables/triggers, and stream features.
pub fn checkout_new(path: &Path, repo: &Repository, tree: &Tree<'_>, tree_id: Oid, layer: &str) -> Result<()> {
    let mut gpkg = if path == Path::new(":memory:") {
        Gpkg::create_in_memory()?
    } else {
        Gpkg::create(path)?
    };
    checkout_new_into(gpkg.connection_mut(), repo, tree, tree_id, layer)
}

/// Same as `checkout_new` but against an already-open connection; used
/// directly by `fsck --reset-layer`, which drops only the layer's own rows
/// and table before calling back in here rather than recreating the whole
/// file.
pub(crate) fn checkout_new_into(
    conn: &mut Connection,
    repo: &Repository,
    tree: &Tree<'_>,
    tree_id: Oid,
    layer: &str,
) -> Result<()> {
    let txn = conn.transaction()?;
    txn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;

    materialize_meta_rows(&txn, layer, repo, tree)?;

    let table_info_json = meta_blob(repo, tree, layer, "sqlite_table_info")?
        .ok_or_else(|| RepoError::Message(format!("layer '{layer}' has no sqlite_table_info meta item")))?;
    let table_info = as_array(&table_info_json).to_vec();
    create_user_table(&txn, layer, &table_info)?;

    let geom_meta = meta_blob(repo, tree, layer, "gpkg_geometry_columns")?;
    let geom_column = geom_meta
        .as_ref()
        .and_then(|v| v.get("column_name"))
        .and_then(Json::as_str)
        .map(str::to_string);
    let (pk_column, columns) = column_specs_from_table_info(&table_info, geom_column.as_deref())?;

    schema::ensure_side_tables(&txn)?;
    schema::write_tree_id(&txn, layer, &tree_id.to_string())?;

    let feature_changes =
        diff::tree_to_tree_feature_diff(repo, &repo.find_tree(empty_tree(repo)?)?, tree, layer, &pk_column, &columns)?;
    for chunk in feature_changes.chunks(FEATURE_BATCH_SIZE) {
        for change in chunk {
            if let FeatureChange::Insert { feature_key: Some(fk), new } = change {
                insert_feature_row(&txn, layer, &pk_column, &columns, fk, new)?;
            }
        }
    }

    schema::install_triggers(&txn, layer, &pk_column)?;

    txn.execute(
        "UPDATE gpkg_contents SET last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE table_name = ?1",
        [layer],
    )?;
    if let Some(geom_column) = geom_column {
        ogc_sql::execute_rtree_sqls(&txn, layer, &geom_column, &pk_column)?;
        ogc_sql::refresh_bounding_box(&txn, layer, &geom_column)?;
    }

    txn.pragma_update(None, "locking_mode", "NORMAL")?;
    let _: i64 = txn.query_row("SELECT 1", [], |row| row.get(0))?;
    txn.commit()?;
    Ok(())
}

fn empty_tree(repo: &Repository) -> Result<Oid> {
    let mut builder = repo.treebuilder(None)?;
    Ok(builder.write()?)
}

/// Compares each of this layer's meta blobs, byte-for-byte, between two
/// trees. Any difference means a schema/meta change that this crate refuses
/// to reconcile during checkout.
fn tree_meta_differs(repo: &Repository, base_tree: &Tree<'_>, new_tree: &Tree<'_>, layer: &str) -> Result<bool> {
    for (name, _) in meta::META_ITEM_NAMES {
        let path = format!("{layer}/meta/{name}");
        let old = repo_facade::read_path(repo, base_tree, &path)?;
        let new = repo_facade::read_path(repo, new_tree, &path)?;
        if old != new {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Update checkout: require the working copy's recorded tree matches
/// `base_tree` (or `force`), refuse if dirty and not forcing, then apply the
/// tree-to-tree diff between `base_tree` and `new_tree`.
pub fn checkout_update(
    conn: &mut Connection,
    repo: &Repository,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
    base_tree: &Tree<'_>,
    new_tree: &Tree<'_>,
    new_tree_id: Oid,
    force: bool,
) -> Result<()> {
    let recorded = schema::read_tree_id(conn, layer)?
        .ok_or(RepoError::MissingWorkingCopy)?;
    if recorded != base_tree.id().to_string() && !force {
        return Err(RepoError::WorkingCopyMismatch {
            expected: base_tree.id().to_string(),
            found: recorded,
        });
    }

    if tree_meta_differs(repo, base_tree, new_tree, layer)? {
        return Err(RepoError::Unsupported(
            "no way to do changeset/meta/schema updates yet".to_string(),
        ));
    }

    let txn = conn.transaction()?;
    txn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;

    let dirty: i64 = txn.query_row(
        "SELECT COUNT(*) FROM __kxg_map WHERE table_name = ?1 AND state != 0",
        [layer],
        |row| row.get(0),
    )?;
    if dirty > 0 {
        if !force {
            return Err(RepoError::DirtyWorkingCopy {
                layer: layer.to_string(),
            });
        }
        revert_working_copy_edits(&txn, repo, base_tree, layer, pk_column, columns)?;
    }

    let guard = TriggerSuspendGuard::acquire(&txn, layer, pk_column)?;
    let changes = diff::tree_to_tree_feature_diff(repo, base_tree, new_tree, layer, pk_column, columns)?;

    // Deletions before modifications: a re-inserted row can otherwise
    // collide on a primary key that a deletion was about to free up.
    for change in changes.iter().filter(|c| matches!(c, FeatureChange::Delete { .. })) {
        apply_delete(&txn, layer, pk_column, change)?;
    }
    for change in changes.iter().filter(|c| matches!(c, FeatureChange::Update { .. })) {
        apply_update(&txn, layer, pk_column, columns, change)?;
    }
    for change in changes.iter().filter(|c| matches!(c, FeatureChange::Insert { .. })) {
        if let FeatureChange::Insert { feature_key: Some(fk), new } = change {
            insert_feature_row(&txn, layer, pk_column, columns, fk, new)?;
        }
    }
    drop(guard);

    schema::write_tree_id(&txn, layer, &new_tree_id.to_string())?;
    txn.execute(
        "UPDATE gpkg_contents SET last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE table_name = ?1",
        [layer],
    )?;
    if let Some((geom_column, _)) = crate::gpkg::get_geometry_column_and_srs_id(&txn, layer)? {
        ogc_sql::refresh_bounding_box(&txn, layer, &geom_column)?;
    }

    txn.pragma_update(None, "locking_mode", "NORMAL")?;
    let _: i64 = txn.query_row("SELECT 1", [], |row| row.get(0))?;
    txn.commit()?;
    Ok(())
}

fn revert_working_copy_edits(
    conn: &Connection,
    repo: &Repository,
    base_tree: &Tree<'_>,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<()> {
    let changes = diff::working_copy_diff(conn, repo, base_tree, layer, pk_column, columns)?;
    let guard = TriggerSuspendGuard::acquire(conn, layer, pk_column)?;
    for change in &changes {
        match change {
            FeatureChange::Insert { new, .. } => {
                let pk = pk_of(new, pk_column)?;
                conn.execute(&format!("DELETE FROM \"{layer}\" WHERE \"{pk_column}\" = ?1"), [pk])?;
                conn.execute(
                    "DELETE FROM __kxg_map WHERE table_name = ?1 AND feature_id = ?2 AND feature_key IS NULL",
                    rusqlite::params![layer, pk],
                )?;
            }
            FeatureChange::Update { feature_key, old, new } => {
                restore_row(conn, layer, pk_column, columns, new, old)?;
                conn.execute(
                    "UPDATE __kxg_map SET state = 0 WHERE table_name = ?1 AND feature_key = ?2",
                    rusqlite::params![layer, feature_key],
                )?;
            }
            FeatureChange::Delete { feature_key, old } => {
                // insert_feature_row always stamps its own __kxg_map row; the
                // real one already exists here (the tombstone), so restore
                // the user row under a throwaway key and drop the duplicate.
                insert_feature_row(conn, layer, pk_column, columns, "__revert__", old)?;
                conn.execute(
                    "DELETE FROM __kxg_map WHERE table_name = ?1 AND feature_key = '__revert__'",
                    [layer],
                )?;
                conn.execute(
                    "UPDATE __kxg_map SET state = 0 WHERE table_name = ?1 AND feature_key = ?2",
                    rusqlite::params![layer, feature_key],
                )?;
            }
        }
    }
    drop(guard);
    Ok(())
}

fn restore_row(
    conn: &Connection,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
    current: &BTreeMap<String, Value>,
    restore_to: &BTreeMap<String, Value>,
) -> Result<()> {
    let current_pk = pk_of(current, pk_column)?;
    let assignments = columns
        .iter()
        .map(|c| format!("\"{}\" = ?", c.name))
        .chain(std::iter::once(format!("\"{pk_column}\" = ?")))
        .collect::<Vec<_>>()
        .join(", ");
    let mut params: Vec<&Value> = columns
        .iter()
        .map(|c| restore_to.get(&c.name).unwrap_or(&Value::Null))
        .collect();
    let restored_pk = restore_to.get(pk_column).unwrap_or(&Value::Null);
    params.push(restored_pk);
    let sql = format!("UPDATE \"{layer}\" SET {assignments} WHERE \"{pk_column}\" = ?");
    let current_pk_value = Value::Integer(current_pk);
    params.push(&current_pk_value);
    conn.execute(&sql, rusqlite::params_from_iter(params))?;
    Ok(())
}

fn apply_delete(conn: &Connection, layer: &str, pk_column: &str, change: &FeatureChange) -> Result<()> {
    let FeatureChange::Delete { feature_key, old } = change else {
        return Ok(());
    };
    let pk = pk_of(old, pk_column)?;
    conn.execute(&format!("DELETE FROM \"{layer}\" WHERE \"{pk_column}\" = ?1"), [pk])?;
    conn.execute(
        "DELETE FROM __kxg_map WHERE table_name = ?1 AND feature_key = ?2",
        rusqlite::params![layer, feature_key],
    )?;
    Ok(())
}

fn apply_update(
    conn: &Connection,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
    change: &FeatureChange,
) -> Result<()> {
    let FeatureChange::Update { feature_key, old, new } = change else {
        return Ok(());
    };
    let old_pk = pk_of(old, pk_column)?;
    let new_pk = pk_of(new, pk_column)?;

    let assignments = columns
        .iter()
        .map(|c| format!("\"{}\" = ?", c.name))
        .chain(std::iter::once(format!("\"{pk_column}\" = ?")))
        .collect::<Vec<_>>()
        .join(", ");
    let mut params: Vec<&Value> = columns
        .iter()
        .map(|c| new.get(&c.name).unwrap_or(&Value::Null))
        .collect();
    let new_pk_value = new.get(pk_column).cloned().unwrap_or(Value::Null);
    params.push(&new_pk_value);
    let sql = format!("UPDATE \"{layer}\" SET {assignments} WHERE \"{pk_column}\" = ?");
    let old_pk_value = Value::Integer(old_pk);
    params.push(&old_pk_value);
    conn.execute(&sql, rusqlite::params_from_iter(params))?;

    conn.execute(
        "UPDATE __kxg_map SET feature_id = ?1 WHERE table_name = ?2 AND feature_key = ?3",
        rusqlite::params![new_pk, layer, feature_key],
    )?;
    Ok(())
}

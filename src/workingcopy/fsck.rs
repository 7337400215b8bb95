//! Integrity verifier: cross-checks the working copy's recorded tree,
//! `__kxg_map`, and the user table against the repository tree. `reset_layer`
//! tears the layer's system-table rows and user table down and re-runs
//! new-checkout against `HEAD` to repair it.

use git2::Repository;
use rusqlite::Connection;

use crate::error::Result;
use crate::ogc_sql;
use crate::repo as repo_facade;
use crate::types::ColumnSpec;

use super::checkout;
use super::commit::{column_type_of, encode_column_value};
use super::diff;
use super::schema;

/// Everything wrong with a layer, as found by [`fsck`]. An empty report
/// (`is_clean() == true`) means the layer passed every check.
#[derive(Debug, Default)]
pub struct FsckReport {
    /// `(HEAD tree id, recorded tree id)` when they differ.
    pub tree_mismatch: Option<(String, String)>,
    /// `(user table row count, live __kxg_map row count)` when they differ.
    pub row_count_mismatch: Option<(i64, i64)>,
    /// Feature keys present in the working copy's clean rows but not the
    /// tree, or vice versa.
    pub index_mismatch: Vec<String>,
    /// `(feature_key, column)` pairs whose stored blob does not match the
    /// value currently in the user table.
    pub column_mismatches: Vec<(String, String)>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.tree_mismatch.is_none()
            && self.row_count_mismatch.is_none()
            && self.index_mismatch.is_empty()
            && self.column_mismatches.is_empty()
    }
}

pub fn fsck(
    conn: &Connection,
    repo: &Repository,
    layer: &str,
    pk_column: &str,
    columns: &[ColumnSpec],
) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let head_tree = repo_facade::head_tree(repo)?;

    let recorded = schema::read_tree_id(conn, layer)?.unwrap_or_default();
    if recorded != head_tree.id().to_string() {
        report.tree_mismatch = Some((head_tree.id().to_string(), recorded));
    }

    let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{layer}\""), [], |row| row.get(0))?;
    let total_map: i64 = conn.query_row(
        "SELECT COUNT(*) FROM __kxg_map WHERE table_name = ?1",
        [layer],
        |row| row.get(0),
    )?;
    let tombstones: i64 = conn.query_row(
        "SELECT COUNT(*) FROM __kxg_map WHERE table_name = ?1 AND state = -1",
        [layer],
        |row| row.get(0),
    )?;
    let live = total_map - tombstones;
    if row_count != live {
        report.row_count_mismatch = Some((row_count, live));
    }

    let mut db_keys = std::collections::BTreeSet::new();
    {
        let mut stmt = conn.prepare(
            "SELECT feature_key FROM __kxg_map
             WHERE table_name = ?1 AND state = 0 AND feature_key IS NOT NULL",
        )?;
        let rows = stmt.query_map([layer], |row| row.get::<_, String>(0))?;
        for row in rows {
            db_keys.insert(row?);
        }
    }
    let tree_keys = diff::tree_feature_keys(repo, &head_tree, layer)?;
    report.index_mismatch = db_keys.symmetric_difference(&tree_keys).cloned().collect();

    for fk in db_keys.intersection(&tree_keys) {
        let pk_value: i64 = conn.query_row(
            "SELECT feature_id FROM __kxg_map WHERE table_name = ?1 AND feature_key = ?2",
            rusqlite::params![layer, fk],
            |row| row.get(0),
        )?;
        let row = diff::read_user_row(conn, layer, pk_column, pk_value, columns)?;
        for (name, value) in &row {
            let column_type = column_type_of(name, pk_column, columns);
            let expected = encode_column_value(column_type, value)?;
            let path = format!("{layer}/features/{}/{fk}/{name}", &fk[0..4]);
            let actual = repo_facade::read_path(repo, &head_tree, &path)?;
            if actual.as_deref() != Some(expected.as_slice()) {
                report.column_mismatches.push((fk.clone(), name.clone()));
            }
        }
    }

    Ok(report)
}

/// Tear down a layer's system-table rows and user table, then re-checkout
/// fresh from `HEAD`. The GeoPackage file itself is left in place.
pub fn reset_layer(conn: &mut Connection, repo: &Repository, layer: &str) -> Result<()> {
    {
        let txn = conn.transaction()?;
        txn.execute("DELETE FROM __kxg_meta WHERE table_name = ?1", [layer])?;
        txn.execute("DELETE FROM __kxg_map WHERE table_name = ?1", [layer])?;

        let orphan_metadata_ids: Vec<i64> = {
            let mut stmt = txn.prepare(
                "SELECT DISTINCT md_file_id FROM gpkg_metadata_reference
                 WHERE table_name = ?1
                 AND md_file_id NOT IN (
                    SELECT md_file_id FROM gpkg_metadata_reference WHERE table_name != ?1
                 )",
            )?;
            let rows = stmt.query_map([layer], |row| row.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for id in orphan_metadata_ids {
            txn.execute("DELETE FROM gpkg_metadata WHERE id = ?1", [id])?;
        }
        txn.execute("DELETE FROM gpkg_metadata_reference WHERE table_name = ?1", [layer])?;

        if let Some((geom_column, _)) = crate::gpkg::get_geometry_column_and_srs_id(&txn, layer)? {
            txn.execute_batch(&ogc_sql::gpkg_rtree_drop_sql(layer, &geom_column))?;
        }
        txn.execute("DELETE FROM gpkg_geometry_columns WHERE table_name = ?1", [layer])?;
        txn.execute("DELETE FROM gpkg_contents WHERE table_name = ?1", [layer])?;
        txn.execute_batch(&ogc_sql::sql_drop_table(layer))?;
        txn.commit()?;
    }

    let head_tree = repo_facade::head_tree(repo)?;
    let head_oid = head_tree.id();
    checkout::checkout_new_into(conn, repo, &head_tree, head_oid, layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpkg::Gpkg;
    use crate::types::ColumnType;
    use git2::Repository;
    use serde_json::json;
    use tempfile::tempdir;

    fn seed_repo() -> (tempfile::TempDir, Repository) {
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

        let mut tree_oid = repo_facade::set_path(&repo, None, "points/meta/sqlite_table_info", &crate::meta::encode(&table_info)).unwrap();
        let mut tree = repo.find_tree(tree_oid).unwrap();
        tree_oid = repo_facade::set_path(&repo, Some(&tree), "points/meta/gpkg_contents", &crate::meta::encode(&contents)).unwrap();
        tree = repo.find_tree(tree_oid).unwrap();

        let fk = "aaaaaaaa-0000-0000-0000-000000000001";
        tree_oid = repo_facade::set_path(&repo, Some(&tree), &format!("points/features/aaaa/{fk}/fid"), b"1").unwrap();
        tree = repo.find_tree(tree_oid).unwrap();
        tree_oid = repo_facade::set_path(&repo, Some(&tree), &format!("points/features/aaaa/{fk}/name"), b"\"hello\"").unwrap();

        let signature = repo.signature().unwrap_or_else(|_| git2::Signature::now("test", "test@example.com").unwrap());
        let tree_obj = repo.find_tree(tree_oid).unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "seed", &tree_obj, &[]).unwrap();
        (dir, repo)
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
    fn fsck_is_clean_right_after_checkout() {
        let (_dir, repo) = seed_repo();
        let (gpkg, pk_column, columns) = open_checked_out(&repo);
        let report = fsck(gpkg.connection(), &repo, "points", &pk_column, &columns).unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn fsck_reports_column_hash_mismatch_after_raw_sql_tamper() {
        let (_dir, repo) = seed_repo();
        let (gpkg, pk_column, columns) = open_checked_out(&repo);

        let guard = schema::TriggerSuspendGuard::acquire(gpkg.connection(), "points", "fid").unwrap();
        gpkg.connection()
            .execute("UPDATE points SET name = 'tampered' WHERE fid = 1", [])
            .unwrap();
        drop(guard);

        let report = fsck(gpkg.connection(), &repo, "points", &pk_column, &columns).unwrap();
        assert!(!report.column_mismatches.is_empty());
    }

    #[test]
    fn fsck_reports_tree_mismatch_after_corrupting_recorded_tree() {
        let (_dir, repo) = seed_repo();
        let (gpkg, pk_column, columns) = open_checked_out(&repo);
        gpkg.connection()
            .execute(
                "UPDATE __kxg_meta SET value = '0000000000000000000000000000000000000000' WHERE table_name = 'points' AND key = 'tree'",
                [],
            )
            .unwrap();

        let report = fsck(gpkg.connection(), &repo, "points", &pk_column, &columns).unwrap();
        assert!(report.tree_mismatch.is_some());
    }

    #[test]
    fn reset_layer_restores_a_tampered_layer_to_a_clean_state() {
        let (_dir, repo) = seed_repo();
        let (mut gpkg, pk_column, columns) = open_checked_out(&repo);

        let guard = schema::TriggerSuspendGuard::acquire(gpkg.connection(), "points", "fid").unwrap();
        gpkg.connection()
            .execute("UPDATE points SET name = 'tampered' WHERE fid = 1", [])
            .unwrap();
        drop(guard);

        reset_layer(gpkg.connection_mut(), &repo, "points").unwrap();

        let report = fsck(gpkg.connection(), &repo, "points", &pk_column, &columns).unwrap();
        assert!(report.is_clean(), "{report:?}");
        let name: String = gpkg
            .connection()
            .query_row("SELECT name FROM points WHERE fid = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "hello");
    }
}

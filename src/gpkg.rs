//! Low-level GeoPackage connection wrapper: opening a file (or an in-memory
//! database for tests), and introspecting a layer's schema from the standard
//! system tables. The working-copy engines in `workingcopy` build on top of
//! this; this module knows nothing about trees, commits, or side tables.

use std::path::Path;

use rusqlite::Connection;

use crate::conversions::column_type_from_str;
use crate::error::{RepoError, Result};
use crate::ogc_sql::{self, initialize_gpkg};
use crate::sql_functions::register_spatial_functions;
use crate::types::{ColumnSpec, ColumnSpecs};

/// An open GeoPackage connection. Thin wrapper; all layer-specific logic
/// lives in free functions taking `&Connection` so the working-copy modules
/// can operate inside an already-open transaction without re-borrowing this
/// struct.
pub struct Gpkg {
    conn: Connection,
}

/// Per-statement trace callback wired up when `_SNO_SQLITE_TRACE` is set in
/// the environment; emits one debug line per statement SQLite executes.
fn trace_sql_statement(sql: &str) {
    tracing::debug!(sql, "sqlite statement");
}

/// Install the trace callback above iff `_SNO_SQLITE_TRACE` is set. Checked
/// per-connection (not once globally) since each `Gpkg` owns its own
/// `Connection` and `rusqlite`'s trace hook is per-connection state.
fn maybe_install_sql_trace(conn: &mut Connection) {
    if std::env::var_os("_SNO_SQLITE_TRACE").is_some() {
        conn.trace(Some(trace_sql_statement));
    }
}

impl Gpkg {
    /// Open an existing GeoPackage file for read/write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        maybe_install_sql_trace(&mut conn);
        register_spatial_functions(&conn)?;
        Ok(Self { conn })
    }

    /// Create a brand-new GeoPackage file and initialize its system tables.
    /// Errors if a file already exists at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(RepoError::Message(format!(
                "refusing to overwrite existing file: {}",
                path.display()
            )));
        }
        let mut conn = Connection::open(path)?;
        maybe_install_sql_trace(&mut conn);
        register_spatial_functions(&conn)?;
        initialize_gpkg(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory GeoPackage, used by tests and by `--working-copy :memory:`.
    pub fn create_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        maybe_install_sql_trace(&mut conn);
        register_spatial_functions(&conn)?;
        initialize_gpkg(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn list_layers(&self) -> Result<Vec<String>> {
        list_layers(&self.conn)
    }
}

pub(crate) fn list_layers(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(ogc_sql::SQL_LIST_LAYERS)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut layers = Vec::new();
    for row in rows {
        layers.push(row?);
    }
    Ok(layers)
}

/// Read a layer's full column schema from `pragma_table_info`, identifying
/// the primary key column. Fails with `NotAGeoPackageLayer` if there is no
/// usable single-column primary key, and `CompositePrimaryKeyUnsupported` if
/// more than one column is flagged `pk`.
pub(crate) fn get_column_specs(conn: &Connection, layer_name: &str) -> Result<ColumnSpecs> {
    let mut stmt = conn.prepare(&ogc_sql::sql_table_columns(layer_name))?;
    let geometry_column = get_geometry_column_name(conn, layer_name)?;

    let rows = stmt.query_map([], |row| {
        let name: String = row.get(0)?;
        let declared_type: String = row.get(1)?;
        let not_null: i64 = row.get(2)?;
        let pk: i64 = row.get(3)?;
        Ok((name, declared_type, not_null != 0, pk != 0))
    })?;

    let mut columns = Vec::new();
    let mut primary_keys = Vec::new();
    for row in rows {
        let (name, declared_type, not_null, is_pk) = row?;
        let column_type = if Some(name.as_str()) == geometry_column.as_deref() {
            crate::types::ColumnType::Geometry
        } else {
            column_type_from_str(&declared_type).ok_or_else(|| RepoError::UnsupportedColumnType {
                column: name.clone(),
                declared_type: declared_type.clone(),
            })?
        };
        if is_pk {
            primary_keys.push(name.clone());
        }
        columns.push(ColumnSpec {
            name,
            column_type,
            primary_key: is_pk,
            not_null,
        });
    }

    if primary_keys.len() > 1 {
        return Err(RepoError::CompositePrimaryKeyUnsupported {
            layer_name: layer_name.to_string(),
        });
    }
    let primary_key = primary_keys.into_iter().next().ok_or_else(|| {
        RepoError::MissingPrimaryKeyColumn {
            layer_name: layer_name.to_string(),
        }
    })?;

    let other_columns = columns
        .into_iter()
        .filter(|c| c.name != primary_key)
        .collect();

    Ok(ColumnSpecs {
        primary_key,
        other_columns,
    })
}

fn get_geometry_column_name(conn: &Connection, layer_name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT column_name FROM gpkg_geometry_columns WHERE table_name = ?1",
            [layer_name],
            |row| row.get::<_, String>(0),
        )
        .ok())
}

/// Read the geometry column name and its SRID for a layer, if it has one.
pub(crate) fn get_geometry_column_and_srs_id(
    conn: &Connection,
    layer_name: &str,
) -> Result<Option<(String, i32)>> {
    Ok(conn
        .query_row(
            "SELECT column_name, srs_id FROM gpkg_geometry_columns WHERE table_name = ?1",
            [layer_name],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)),
        )
        .ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_in_memory_initializes_system_tables() {
        let gpkg = Gpkg::create_in_memory().unwrap();
        assert!(gpkg.list_layers().unwrap().is_empty());
    }

    #[test]
    fn get_column_specs_identifies_primary_key_and_geometry_column() {
        let gpkg = Gpkg::create_in_memory().unwrap();
        let conn = gpkg.connection();
        conn.execute_batch(
            r#"CREATE TABLE "points" (fid INTEGER PRIMARY KEY, name TEXT, geom BLOB);"#,
        )
        .unwrap();
        conn.execute(
            "INSERT INTO gpkg_geometry_columns (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES ('points', 'geom', 'POINT', 4326, 0, 0)",
            [],
        )
        .unwrap();

        let specs = get_column_specs(conn, "points").unwrap();
        assert_eq!(specs.primary_key, "fid");
        assert_eq!(specs.other_columns.len(), 2);
        let geom_col = specs
            .other_columns
            .iter()
            .find(|c| c.name == "geom")
            .unwrap();
        assert_eq!(geom_col.column_type, crate::types::ColumnType::Geometry);
    }

    #[test]
    fn get_column_specs_rejects_missing_primary_key() {
        let gpkg = Gpkg::create_in_memory().unwrap();
        let conn = gpkg.connection();
        conn.execute_batch(r#"CREATE TABLE "points" (name TEXT);"#).unwrap();

        let err = get_column_specs(conn, "points").unwrap_err();
        assert!(matches!(err, RepoError::MissingPrimaryKeyColumn { .. }));
    }
}

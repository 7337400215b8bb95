//! Meta-item serializer: reads a layer's schema/catalog metadata out of the
//! standard GeoPackage system tables and yields a fixed, named set of
//! meta-items, each a stable (field-sorted) JSON encoding suitable for
//! storing as a tree blob at `<layer>/meta/<name>`.

use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::Result;

/// The static meta-item registry: name -> whether the item is a single
/// object (`true`) or a list of row-objects (`false`). Not a class hierarchy,
/// just the fixed catalog this format recognizes.
pub const META_ITEM_NAMES: &[(&str, bool)] = &[
    ("gpkg_contents", true),
    ("gpkg_geometry_columns", true),
    ("sqlite_table_info", false),
    ("gpkg_metadata", false),
    ("gpkg_metadata_reference", false),
    ("gpkg_spatial_ref_sys", false),
];

/// Read every meta-item for `table`, skipping any item whose underlying rows
/// are absent. Returned as an ordered map so JSON encoding is deterministic.
pub fn read_all(conn: &Connection, table: &str) -> Result<Map<String, Value>> {
    let mut items = Map::new();
    if let Some(v) = read_gpkg_contents(conn, table)? {
        items.insert("gpkg_contents".to_string(), v);
    }
    if let Some(v) = read_gpkg_geometry_columns(conn, table)? {
        items.insert("gpkg_geometry_columns".to_string(), v);
    }
    let table_info = read_sqlite_table_info(conn, table)?;
    if !table_info.is_empty() {
        items.insert("sqlite_table_info".to_string(), Value::Array(table_info));
    }
    let metadata = read_gpkg_metadata(conn, table)?;
    if !metadata.is_empty() {
        items.insert("gpkg_metadata".to_string(), Value::Array(metadata));
    }
    let metadata_ref = read_gpkg_metadata_reference(conn, table)?;
    if !metadata_ref.is_empty() {
        items.insert(
            "gpkg_metadata_reference".to_string(),
            Value::Array(metadata_ref),
        );
    }
    let srs = read_gpkg_spatial_ref_sys(conn, table)?;
    if !srs.is_empty() {
        items.insert("gpkg_spatial_ref_sys".to_string(), Value::Array(srs));
    }
    Ok(items)
}

/// Encode a single meta-item value as its canonical (sorted-key) JSON bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    // serde_json::Map is a BTreeMap by default (no `preserve_order` feature),
    // so field names come out sorted without any extra work here.
    serde_json::to_vec(value).expect("json values never fail to serialize")
}

pub fn decode(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)
        .map_err(|err| crate::error::RepoError::Message(format!("invalid meta-item json: {err}")))?)
}

fn read_gpkg_contents(conn: &Connection, table: &str) -> Result<Option<Value>> {
    conn.query_row(
        "SELECT table_name, data_type, identifier, description, srs_id
         FROM gpkg_contents WHERE table_name = ?1",
        [table],
        |row| {
            let mut map = Map::new();
            map.insert("table_name".into(), Value::String(row.get(0)?));
            map.insert("data_type".into(), Value::String(row.get(1)?));
            insert_opt_string(&mut map, "identifier", row.get(2)?);
            insert_opt_string(&mut map, "description", row.get(3)?);
            map.insert("srs_id".into(), Value::from(row.get::<_, i64>(4)?));
            Ok(Value::Object(map))
        },
    )
    .optional()
    .map_err(Into::into)
}

fn read_gpkg_geometry_columns(conn: &Connection, table: &str) -> Result<Option<Value>> {
    conn.query_row(
        "SELECT column_name, geometry_type_name, srs_id, z, m
         FROM gpkg_geometry_columns WHERE table_name = ?1",
        [table],
        |row| {
            let mut map = Map::new();
            map.insert("table_name".into(), Value::String(table.to_string()));
            map.insert("column_name".into(), Value::String(row.get(0)?));
            map.insert("geometry_type_name".into(), Value::String(row.get(1)?));
            map.insert("srs_id".into(), Value::from(row.get::<_, i64>(2)?));
            map.insert("z".into(), Value::from(row.get::<_, i64>(3)?));
            map.insert("m".into(), Value::from(row.get::<_, i64>(4)?));
            Ok(Value::Object(map))
        },
    )
    .optional()
    .map_err(Into::into)
}

fn read_sqlite_table_info(conn: &Connection, table: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| {
        let mut map = Map::new();
        map.insert("cid".into(), Value::from(row.get::<_, i64>(0)?));
        map.insert("name".into(), Value::String(row.get(1)?));
        map.insert("type".into(), Value::String(row.get(2)?));
        map.insert("notnull".into(), Value::from(row.get::<_, i64>(3)?));
        insert_opt_string(&mut map, "dflt_value", row.get(4)?);
        map.insert("pk".into(), Value::from(row.get::<_, i64>(5)?));
        Ok(Value::Object(map))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn read_gpkg_metadata(conn: &Connection, table: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.md_scope, m.md_standard_uri, m.mime_type, m.metadata
         FROM gpkg_metadata m
         JOIN gpkg_metadata_reference r ON r.md_file_id = m.id
         WHERE r.table_name = ?1 AND r.column_name IS NULL AND r.row_id_value IS NULL",
    )?;
    let rows = stmt.query_map([table], |row| {
        let mut map = Map::new();
        map.insert("id".into(), Value::from(row.get::<_, i64>(0)?));
        map.insert("md_scope".into(), Value::String(row.get(1)?));
        map.insert("md_standard_uri".into(), Value::String(row.get(2)?));
        map.insert("mime_type".into(), Value::String(row.get(3)?));
        map.insert("metadata".into(), Value::String(row.get(4)?));
        Ok(Value::Object(map))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn read_gpkg_metadata_reference(conn: &Connection, table: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT reference_scope, table_name, md_file_id, md_parent_id
         FROM gpkg_metadata_reference
         WHERE table_name = ?1 AND column_name IS NULL AND row_id_value IS NULL",
    )?;
    let rows = stmt.query_map([table], |row| {
        let mut map = Map::new();
        map.insert("reference_scope".into(), Value::String(row.get(0)?));
        map.insert("table_name".into(), Value::String(row.get(1)?));
        map.insert("md_file_id".into(), Value::from(row.get::<_, i64>(2)?));
        let parent: Option<i64> = row.get(3)?;
        map.insert(
            "md_parent_id".into(),
            parent.map(Value::from).unwrap_or(Value::Null),
        );
        Ok(Value::Object(map))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn read_gpkg_spatial_ref_sys(conn: &Connection, table: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT srs_name, srs_id, organization, organization_coordsys_id, definition, description
         FROM gpkg_spatial_ref_sys
         WHERE srs_id IN (
            SELECT srs_id FROM gpkg_contents WHERE table_name = ?1
            UNION
            SELECT srs_id FROM gpkg_geometry_columns WHERE table_name = ?1
         )
         ORDER BY srs_id",
    )?;
    let rows = stmt.query_map([table], |row| {
        let mut map = Map::new();
        map.insert("srs_name".into(), Value::String(row.get(0)?));
        map.insert("srs_id".into(), Value::from(row.get::<_, i64>(1)?));
        map.insert("organization".into(), Value::String(row.get(2)?));
        map.insert(
            "organization_coordsys_id".into(),
            Value::from(row.get::<_, i64>(3)?),
        );
        map.insert("definition".into(), Value::String(row.get(4)?));
        insert_opt_string(&mut map, "description", row.get(5)?);
        Ok(Value::Object(map))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn insert_opt_string(map: &mut Map<String, Value>, key: &str, value: Option<String>) {
    map.insert(
        key.to_string(),
        value.map(Value::String).unwrap_or(Value::Null),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpkg::Gpkg;

    fn sample_conn() -> Gpkg {
        let gpkg = Gpkg::create_in_memory().unwrap();
        let conn = gpkg.connection();
        conn.execute_batch(
            r#"CREATE TABLE "points" (fid INTEGER PRIMARY KEY, geom BLOB);"#,
        )
        .unwrap();
        conn.execute(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id) VALUES ('points', 'features', 'points', 4326)",
            [],
        ).unwrap();
        conn.execute(
            "INSERT INTO gpkg_geometry_columns (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES ('points', 'geom', 'POINT', 4326, 0, 0)",
            [],
        ).unwrap();
        gpkg
    }

    #[test]
    fn read_all_skips_absent_items_and_finds_present_ones() {
        let gpkg = sample_conn();
        let items = read_all(gpkg.connection(), "points").unwrap();
        assert!(items.contains_key("gpkg_contents"));
        assert!(items.contains_key("gpkg_geometry_columns"));
        assert!(items.contains_key("sqlite_table_info"));
        assert!(items.contains_key("gpkg_spatial_ref_sys"));
        assert!(!items.contains_key("gpkg_metadata"));
    }

    #[test]
    fn gpkg_contents_omits_volatile_fields() {
        let gpkg = sample_conn();
        let items = read_all(gpkg.connection(), "points").unwrap();
        let contents = items.get("gpkg_contents").unwrap().as_object().unwrap();
        assert!(!contents.contains_key("last_change"));
        assert!(!contents.contains_key("min_x"));
    }

    #[test]
    fn encode_is_stable_across_runs() {
        let gpkg = sample_conn();
        let items_a = read_all(gpkg.connection(), "points").unwrap();
        let items_b = read_all(gpkg.connection(), "points").unwrap();
        let bytes_a = encode(&Value::Object(items_a));
        let bytes_b = encode(&Value::Object(items_b));
        assert_eq!(bytes_a, bytes_b);
    }
}

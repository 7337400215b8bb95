//! Side tables (`__kxg_meta`, `__kxg_map`) and the AFTER-DML triggers that
//! mirror user mutations into `__kxg_map`, plus the suspend/resume guard used
//! around every internal DML path (checkout, fsck reset) so re-materializing
//! a layer doesn't record itself as a user edit.

use rusqlite::Connection;

use crate::error::Result;

pub(crate) const SQL_CREATE_KXG_META: &str = "
CREATE TABLE IF NOT EXISTS __kxg_meta (
  table_name TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT,
  PRIMARY KEY (table_name, key)
);
";

pub(crate) const SQL_CREATE_KXG_MAP: &str = "
CREATE TABLE IF NOT EXISTS __kxg_map (
  table_name TEXT NOT NULL,
  feature_key TEXT,
  feature_id INTEGER NOT NULL,
  state INTEGER NOT NULL DEFAULT 0
);
";

pub(crate) fn ensure_side_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(SQL_CREATE_KXG_META)?;
    conn.execute_batch(SQL_CREATE_KXG_MAP)?;
    Ok(())
}

pub(crate) fn read_tree_id(conn: &Connection, table: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM __kxg_meta WHERE table_name = ?1 AND key = 'tree'",
            [table],
            |row| row.get(0),
        )
        .ok())
}

pub(crate) fn write_tree_id(conn: &Connection, table: &str, tree_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO __kxg_meta (table_name, key, value) VALUES (?1, 'tree', ?2)
         ON CONFLICT(table_name, key) DO UPDATE SET value = excluded.value",
        rusqlite::params![table, tree_id],
    )?;
    Ok(())
}

fn trigger_name(table: &str, suffix: &str) -> String {
    format!("__kxg_{table}_{suffix}")
}

fn create_triggers_sql(table: &str, pk_column: &str) -> String {
    let ins = trigger_name(table, "ins");
    let upd = trigger_name(table, "upd");
    let del = trigger_name(table, "del");
    format!(
        r#"
CREATE TRIGGER "{ins}" AFTER INSERT ON "{table}"
BEGIN
  INSERT INTO __kxg_map (table_name, feature_key, feature_id, state)
  VALUES ('{table}', NULL, NEW."{pk_column}", 1);
END;

CREATE TRIGGER "{upd}" AFTER UPDATE ON "{table}"
BEGIN
  UPDATE __kxg_map SET feature_id = NEW."{pk_column}", state = 1
  WHERE table_name = '{table}' AND feature_id = OLD."{pk_column}";
END;

CREATE TRIGGER "{del}" AFTER DELETE ON "{table}"
BEGIN
  UPDATE __kxg_map SET state = -1
  WHERE table_name = '{table}' AND feature_id = OLD."{pk_column}";
END;
"#
    )
}

fn drop_triggers_sql(table: &str) -> String {
    format!(
        r#"DROP TRIGGER IF EXISTS "{ins}";
DROP TRIGGER IF EXISTS "{upd}";
DROP TRIGGER IF EXISTS "{del}";"#,
        ins = trigger_name(table, "ins"),
        upd = trigger_name(table, "upd"),
        del = trigger_name(table, "del"),
    )
}

pub(crate) fn install_triggers(conn: &Connection, table: &str, pk_column: &str) -> Result<()> {
    conn.execute_batch(&create_triggers_sql(table, pk_column))?;
    Ok(())
}

pub(crate) fn drop_triggers(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&drop_triggers_sql(table))?;
    Ok(())
}

/// Scoped guard: drops the layer's triggers on acquisition and recreates them
/// on drop (including during unwind), mirroring the suspend/resume idiom the
/// source requires around every internal DML path.
pub(crate) struct TriggerSuspendGuard<'a> {
    conn: &'a Connection,
    table: String,
    pk_column: String,
}

impl<'a> TriggerSuspendGuard<'a> {
    pub(crate) fn acquire(conn: &'a Connection, table: &str, pk_column: &str) -> Result<Self> {
        drop_triggers(conn, table)?;
        Ok(Self {
            conn,
            table: table.to_string(),
            pk_column: pk_column.to_string(),
        })
    }
}

impl Drop for TriggerSuspendGuard<'_> {
    fn drop(&mut self) {
        // Best-effort: a failure here would need a logged warning in a real
        // binary, but there is no fallible Drop, and the transaction that
        // contains this guard is what actually needs to observe the error.
        let _ = install_triggers(self.conn, &self.table, &self.pk_column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpkg::Gpkg;

    fn setup() -> Gpkg {
        let gpkg = Gpkg::create_in_memory().unwrap();
        gpkg.connection()
            .execute_batch(r#"CREATE TABLE "points" (fid INTEGER PRIMARY KEY, name TEXT);"#)
            .unwrap();
        ensure_side_tables(gpkg.connection()).unwrap();
        install_triggers(gpkg.connection(), "points", "fid").unwrap();
        gpkg
    }

    #[test]
    fn insert_trigger_records_state_plus_one_with_null_feature_key() {
        let gpkg = setup();
        let conn = gpkg.connection();
        conn.execute("INSERT INTO points (fid, name) VALUES (1, 'a')", [])
            .unwrap();

        let (feature_key, state): (Option<String>, i64) = conn
            .query_row(
                "SELECT feature_key, state FROM __kxg_map WHERE feature_id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(feature_key, None);
        assert_eq!(state, 1);
    }

    #[test]
    fn update_trigger_tracks_new_primary_key() {
        let gpkg = setup();
        let conn = gpkg.connection();
        conn.execute("INSERT INTO points (fid, name) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute(
            "UPDATE __kxg_map SET state = 0, feature_key = 'fk-1' WHERE feature_id = 1",
            [],
        )
        .unwrap();

        conn.execute("UPDATE points SET fid = 2 WHERE fid = 1", []).unwrap();

        let (feature_id, state): (i64, i64) = conn
            .query_row(
                "SELECT feature_id, state FROM __kxg_map WHERE feature_key = 'fk-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(feature_id, 2);
        assert_eq!(state, 1);
    }

    #[test]
    fn delete_trigger_sets_tombstone_state() {
        let gpkg = setup();
        let conn = gpkg.connection();
        conn.execute("INSERT INTO points (fid, name) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute(
            "UPDATE __kxg_map SET state = 0, feature_key = 'fk-1' WHERE feature_id = 1",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM points WHERE fid = 1", []).unwrap();

        let state: i64 = conn
            .query_row(
                "SELECT state FROM __kxg_map WHERE feature_key = 'fk-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(state, -1);
    }

    #[test]
    fn suspend_guard_reinstalls_triggers_on_drop() {
        let gpkg = setup();
        let conn = gpkg.connection();
        {
            let _guard = TriggerSuspendGuard::acquire(conn, "points", "fid").unwrap();
            conn.execute("INSERT INTO points (fid, name) VALUES (9, 'x')", [])
                .unwrap();
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM __kxg_map", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "suspended trigger must not fire");
        }

        conn.execute("INSERT INTO points (fid, name) VALUES (10, 'y')", [])
            .unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM __kxg_map WHERE feature_id = 10",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "trigger must be reinstalled after guard drops");
    }
}

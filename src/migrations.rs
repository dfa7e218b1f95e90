//! 数据库迁移模块

use rusqlite::{Connection, Result as SqliteResult};
use tracing::{info, warn};

use crate::schema;

/// 迁移版本
const MIGRATION_VERSION: i64 = 1;

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;
    Ok(())
}

/// 获取当前数据库版本，空表为 0
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, crate::types::current_time_ms()],
    )?;
    Ok(())
}

/// 迁移 1: 初始 schema（表、索引、完成度视图）
fn migration_001_initial_schema(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 001: Initial schema");
    conn.execute_batch(&schema::full_schema())?;
    info!("Migration 001 complete");
    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    initialize_migrations(conn)?;

    let current_version = get_current_version(conn)?;
    info!("Current database version: {}", current_version);

    if current_version >= MIGRATION_VERSION {
        return Ok(());
    }

    // 执行迁移（事务保证原子性）
    let tx = conn.unchecked_transaction()?;

    if current_version < 1 {
        if let Err(e) = migration_001_initial_schema(&tx) {
            warn!("Migration 1 failed: {}", e);
            return Err(e);
        }
        record_migration(&tx, 1)?;
    }

    tx.commit()?;

    info!("All migrations applied successfully, current version: {}", MIGRATION_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn object_exists(conn: &Connection, kind: &str, name: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
                [kind, name],
                |row| row.get(0),
            )
            .unwrap();
        count > 0
    }

    #[test]
    fn test_fresh_database_gets_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert_eq!(get_current_version(&conn).unwrap(), 1);
        for table in ["SESSION", "CHUNK", "MESSAGE", "CHANNEL", "S_USER"] {
            assert!(object_exists(&conn, "table", table), "{} missing", table);
        }
        assert!(object_exists(&conn, "view", "V_UNFINISHED_CHANNELS"));
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO SESSION (CREATED_AT, UPDATED_AT, MODE, ARGS) VALUES (1, 1, 'archive', '')",
            [],
        )
        .unwrap();

        // 再次运行不重建，数据保留
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 1);
        let sessions: i64 = conn
            .query_row("SELECT COUNT(*) FROM SESSION", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sessions, 1);
    }
}

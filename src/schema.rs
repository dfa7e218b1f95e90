//! 数据库 Schema 定义
//!
//! 每个 chunk 一行 CHUNK，负载拆成子表的多行，子表以 (CHUNK_ID, IDX) 定位。
//! 字典类实体按 "同 id 取最大 CHUNK_ID" 读取，流式实体全部可见。

/// 连接初始化
pub const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- 归档会话
CREATE TABLE IF NOT EXISTS SESSION (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    CREATED_AT INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    UPDATED_AT INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    PAR_SESSION_ID INTEGER REFERENCES SESSION(ID),
    FROM_TS INTEGER,                  -- 时间窗口 (毫秒)
    TO_TS INTEGER,
    FINISHED INTEGER NOT NULL DEFAULT 0,
    FILES_ENABLED INTEGER NOT NULL DEFAULT 0,
    AVATARS_ENABLED INTEGER NOT NULL DEFAULT 0,
    MODE TEXT NOT NULL DEFAULT '',
    ARGS TEXT NOT NULL DEFAULT ''
);

-- chunk
CREATE TABLE IF NOT EXISTS CHUNK (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    SESSION_ID INTEGER NOT NULL REFERENCES SESSION(ID),
    UNIX_TS INTEGER NOT NULL,         -- 纳秒
    TYPE_ID INTEGER NOT NULL,
    NUM_RECORDS INTEGER NOT NULL DEFAULT 0,
    NUM_THREADS INTEGER NOT NULL DEFAULT 0,
    CHANNEL_ID TEXT,
    THREAD_TS TEXT,
    SEARCH_QUERY TEXT,
    FINAL INTEGER NOT NULL DEFAULT 0,
    THREAD_ONLY INTEGER NOT NULL DEFAULT 0
);

-- 消息（流式）
CREATE TABLE IF NOT EXISTS MESSAGE (
    ID INTEGER NOT NULL,              -- ts 的微秒表示
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    CHANNEL_ID TEXT NOT NULL,
    TS TEXT NOT NULL,
    PARENT_ID INTEGER,                -- 线程父消息的 ID
    THREAD_TS TEXT,
    IS_PARENT INTEGER NOT NULL DEFAULT 0,
    IDX INTEGER NOT NULL,
    NUM_FILES INTEGER NOT NULL DEFAULT 0,
    TXT TEXT,
    DATA TEXT NOT NULL,
    PRIMARY KEY (ID, CHUNK_ID)
);

-- 文件（流式）
CREATE TABLE IF NOT EXISTS FILE (
    ID TEXT NOT NULL,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    CHANNEL_ID TEXT NOT NULL,
    MESSAGE_ID INTEGER,
    THREAD_ID INTEGER,
    IDX INTEGER NOT NULL,
    FILENAME TEXT,
    URL TEXT,
    DATA TEXT NOT NULL,
    PRIMARY KEY (ID, CHUNK_ID)
);

-- 用户（字典）
CREATE TABLE IF NOT EXISTS S_USER (
    ID TEXT NOT NULL,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    USERNAME TEXT,
    IDX INTEGER NOT NULL,
    DATA TEXT NOT NULL,
    PRIMARY KEY (ID, CHUNK_ID)
);

-- 频道（字典）
CREATE TABLE IF NOT EXISTS CHANNEL (
    ID TEXT NOT NULL,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    NAME TEXT,
    IDX INTEGER NOT NULL,
    DATA TEXT NOT NULL,
    PRIMARY KEY (ID, CHUNK_ID)
);

-- 工作区信息（字典，只有一条）
CREATE TABLE IF NOT EXISTS WORKSPACE (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    TEAM_ID TEXT,
    TEAM TEXT,
    USER_ID TEXT,
    ENTERPRISE_ID TEXT,
    URL TEXT,
    DATA TEXT NOT NULL
);

-- 频道成员（字典，按频道取最新）
CREATE TABLE IF NOT EXISTS CHANNEL_USER (
    CHANNEL_ID TEXT NOT NULL,
    USER_ID TEXT NOT NULL,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    IDX INTEGER NOT NULL,
    PRIMARY KEY (CHANNEL_ID, USER_ID, CHUNK_ID)
);

-- 搜索结果（流式）
CREATE TABLE IF NOT EXISTS SEARCH_MESSAGE (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    CHANNEL_ID TEXT NOT NULL,
    CHANNEL_NAME TEXT,
    TS TEXT NOT NULL,
    TXT TEXT,
    IDX INTEGER NOT NULL,
    DATA TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS SEARCH_FILE (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    CHUNK_ID INTEGER NOT NULL REFERENCES CHUNK(ID),
    FILE_ID TEXT NOT NULL,
    IDX INTEGER NOT NULL,
    DATA TEXT NOT NULL
);

-- 索引
CREATE INDEX IF NOT EXISTS IDX_CHUNK_SESSION ON CHUNK(SESSION_ID);
CREATE INDEX IF NOT EXISTS IDX_CHUNK_CHANNEL ON CHUNK(CHANNEL_ID, TYPE_ID);
CREATE INDEX IF NOT EXISTS IDX_MESSAGE_CHANNEL ON MESSAGE(CHANNEL_ID, ID);
CREATE INDEX IF NOT EXISTS IDX_MESSAGE_PARENT ON MESSAGE(CHANNEL_ID, PARENT_ID);
CREATE INDEX IF NOT EXISTS IDX_FILE_CHANNEL ON FILE(CHANNEL_ID);
CREATE INDEX IF NOT EXISTS IDX_CHANNEL_USER_CHANNEL ON CHANNEL_USER(CHANNEL_ID, CHUNK_ID);
"#;

/// 视图：每个频道的剩余引用计数
///
/// 1（频道本身）+ 频道消息页发现的线程数 - 已完成的最后一页（频道或非专属线程）。
/// 计数 <= 0 表示该频道已完成。
pub const VIEWS_SQL: &str = r#"
CREATE VIEW IF NOT EXISTS V_UNFINISHED_CHANNELS AS
SELECT
    CH.SESSION_ID AS SESSION_ID,
    CH.CHANNEL_ID AS CHANNEL_ID,
    1 + SUM(CASE WHEN CH.TYPE_ID = 0 THEN CH.NUM_THREADS ELSE 0 END)
      - SUM(CASE WHEN CH.TYPE_ID IN (0, 1) AND CH.FINAL = 1 THEN 1 ELSE 0 END) AS REF_COUNT
FROM CHUNK AS CH
WHERE CH.TYPE_ID IN (0, 1) AND CH.THREAD_ONLY = 0
GROUP BY CH.SESSION_ID, CH.CHANNEL_ID;
"#;

/// 获取完整 Schema
pub fn full_schema() -> String {
    let mut schema = SCHEMA_SQL.to_string();
    schema.push_str(VIEWS_SQL);
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_applies() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&full_schema()).unwrap();
        // 再执行一次也没问题
        conn.execute_batch(&full_schema()).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('SESSION','CHUNK','MESSAGE','FILE','S_USER','CHANNEL','WORKSPACE',\
                  'CHANNEL_USER','SEARCH_MESSAGE','SEARCH_FILE')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 10);

        let views: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = 'V_UNFINISHED_CHANNELS'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(views, 1);
    }
}

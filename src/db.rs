//! 关系型后端（写入端）
//!
//! 每次打开创建一个 SESSION，之后写入的 chunk 都属于这个会话。
//! 一个 chunk 的 CHUNK 行和全部子表行在同一个事务里写入，失败整体回滚。
//! SQLite 不支持并发写，所有写入经过同一把连接锁。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, FileKey, Payload};
use crate::config::{ConnectionMode, DbConfig, SessionInfo};
use crate::error::{Error, Result};
use crate::migrations;
use crate::reader::ArchiveReader;
use crate::schema;
use crate::storage::ChunkStore;
use crate::types::{current_time_ms, ts_to_micros, Message, Session};

/// SESSION 表的列（与 `session_from_row` 对应）
pub(crate) const SESSION_COLUMNS: &str = "ID, CREATED_AT, UPDATED_AT, PAR_SESSION_ID, FROM_TS, TO_TS, \
     FINISHED, FILES_ENABLED, AVATARS_ENABLED, MODE, ARGS";

pub(crate) fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        parent_id: row.get(3)?,
        from_ts: row.get(4)?,
        to_ts: row.get(5)?,
        finished: row.get(6)?,
        files_enabled: row.get(7)?,
        avatars_enabled: row.get(8)?,
        mode: row.get(9)?,
        args: row.get(10)?,
    })
}

/// 关系型 chunk 存储
pub struct ChunkDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
    config: DbConfig,
    session_id: i64,
    closed: AtomicBool,
}

impl ChunkDB {
    /// 打开数据库并创建新会话
    pub fn open(config: DbConfig, info: &SessionInfo) -> Result<Self> {
        match config.mode {
            ConnectionMode::Local => Self::open_local(&config, info),
            ConnectionMode::Remote => Err(Error::Config("远程连接暂不支持".into())),
        }
    }

    fn open_local(config: &DbConfig, info: &SessionInfo) -> Result<Self> {
        info.validate()?;
        let path = Path::new(&config.url);

        // 确保目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(schema::PRAGMA_SQL)?;

        // 建表由迁移完成
        migrations::run_migrations(&conn)?;

        let session_id = create_session(&conn, info)?;
        info!(path = ?path, session = session_id, "数据库已连接");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: config.clone(),
            session_id,
            closed: AtomicBool::new(false),
        })
    }

    /// 当前会话 id
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// 数据库文件路径
    pub fn path(&self) -> Option<PathBuf> {
        self.config.path()
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== 写入 ====================

    /// 写入一个 chunk，返回 CHUNK.ID
    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<i64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("数据库会话已结束".into()));
        }
        chunk.validate()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let chunk_id = insert_chunk_tx(&tx, self.session_id, chunk)?;
        tx.commit()?;

        debug!(
            chunk_id,
            chunk_type = %chunk.chunk_type(),
            channel = %chunk.channel_id,
            records = chunk.count,
            "chunk inserted"
        );
        Ok(chunk_id)
    }

    // ==================== 完成度 ====================

    /// 当前会话中频道（及其非专属线程）是否全部完成
    pub fn is_finalised(&self, channel_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let done: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM V_UNFINISHED_CHANNELS \
             WHERE SESSION_ID = ?1 AND CHANNEL_ID = ?2 AND REF_COUNT <= 0)",
            params![self.session_id, channel_id],
            |row| row.get(0),
        )?;
        Ok(done)
    }

    /// 当前会话中线程专属归档是否完成
    pub fn is_finalised_thread(&self, channel_id: &str, thread_ts: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let done: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM CHUNK WHERE SESSION_ID = ?1 AND CHANNEL_ID = ?2 \
             AND THREAD_TS = ?3 AND TYPE_ID = 1 AND THREAD_ONLY = 1 AND FINAL = 1)",
            params![self.session_id, channel_id, thread_ts],
            |row| row.get(0),
        )?;
        Ok(done)
    }

    // ==================== 会话 ====================

    /// 按 id 获取会话
    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM SESSION WHERE ID = ?1", SESSION_COLUMNS),
            [id],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 最近一个会话，可按是否完成过滤
    pub fn last_session(&self, finished: Option<bool>) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM SESSION WHERE (?1 IS NULL OR FINISHED = ?1) ORDER BY ID DESC LIMIT 1",
            SESSION_COLUMNS
        );
        conn.query_row(&sql, params![finished], session_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// 当前会话写入的 chunk 数
    pub fn count_chunks(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM CHUNK WHERE SESSION_ID = ?1",
            [self.session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 只读视图（独立连接）
    pub fn reader(&self) -> Result<ArchiveReader> {
        let path = self
            .path()
            .ok_or_else(|| Error::Config("远程连接暂不支持".into()))?;
        ArchiveReader::open(path)
    }

    /// 结束会话，只生效一次
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE SESSION SET FINISHED = 1, UPDATED_AT = ?1 WHERE ID = ?2",
            params![current_time_ms(), self.session_id],
        )?;
        info!(session = self.session_id, "会话已结束");
        Ok(())
    }
}

impl Drop for ChunkDB {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(session = self.session_id, "数据库未正常关闭，会话保持未完成");
        }
    }
}

fn create_session(conn: &Connection, info: &SessionInfo) -> Result<i64> {
    if let Some(parent) = info.parent_id {
        let exists = conn
            .query_row("SELECT 1 FROM SESSION WHERE ID = ?1", [parent], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(Error::Config(format!("父会话不存在: {}", parent)));
        }
    }

    let now = current_time_ms();
    conn.execute(
        "INSERT INTO SESSION (CREATED_AT, UPDATED_AT, PAR_SESSION_ID, FROM_TS, TO_TS, FINISHED, \
         FILES_ENABLED, AVATARS_ENABLED, MODE, ARGS) VALUES (?1, ?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8)",
        params![
            now,
            info.parent_id,
            info.from_ts.map(|t| t.timestamp_millis()),
            info.to_ts.map(|t| t.timestamp_millis()),
            info.files_enabled,
            info.avatars_enabled,
            info.mode,
            info.args,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn message_id(chunk: &Chunk, ts: &str) -> Result<i64> {
    ts_to_micros(ts).ok_or_else(|| Error::InvalidPayload {
        chunk_type: chunk.chunk_type().to_string(),
        channel_id: chunk.channel_id.clone(),
        reason: format!("无效的消息时间戳 {:?}", ts),
    })
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn insert_chunk_tx(tx: &Transaction, session_id: i64, chunk: &Chunk) -> Result<i64> {
    tx.execute(
        "INSERT INTO CHUNK (SESSION_ID, UNIX_TS, TYPE_ID, NUM_RECORDS, NUM_THREADS, CHANNEL_ID, \
         THREAD_TS, SEARCH_QUERY, FINAL, THREAD_ONLY) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session_id,
            chunk.timestamp,
            chunk.chunk_type().id(),
            chunk.count as i64,
            chunk.num_threads as i64,
            non_empty(&chunk.channel_id),
            chunk.thread_ts,
            chunk.search_query,
            chunk.is_last,
            chunk.thread_only,
        ],
    )?;
    let chunk_id = tx.last_insert_rowid();

    match &chunk.payload {
        Payload::Messages(messages) => {
            insert_messages(tx, chunk, chunk_id, None, messages.iter())?;
        }
        Payload::ThreadMessages { parent, messages } => {
            let parent_id = message_id(chunk, &parent.ts)?;
            insert_messages(
                tx,
                chunk,
                chunk_id,
                Some(parent_id),
                std::iter::once(parent).chain(messages.iter()),
            )?;
        }
        Payload::Files {
            channel,
            parent,
            files,
        } => {
            let message_id = ts_to_micros(&parent.ts);
            let thread_id = parent.thread_ts.as_deref().and_then(ts_to_micros);
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO FILE (ID, CHUNK_ID, CHANNEL_ID, MESSAGE_ID, THREAD_ID, IDX, FILENAME, URL, DATA) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (idx, f) in files.iter().enumerate() {
                stmt.execute(params![
                    f.id,
                    chunk_id,
                    channel.id,
                    message_id,
                    thread_id,
                    idx as i64,
                    f.name,
                    f.url_private,
                    serde_json::to_string(f)?,
                ])?;
            }
        }
        Payload::Users(users) => {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO S_USER (ID, CHUNK_ID, USERNAME, IDX, DATA) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (idx, u) in users.iter().enumerate() {
                stmt.execute(params![u.id, chunk_id, u.name, idx as i64, serde_json::to_string(u)?])?;
            }
        }
        Payload::Channels(channels) => {
            insert_channels(tx, chunk_id, channels.iter())?;
        }
        Payload::ChannelInfo(channel) => {
            insert_channels(tx, chunk_id, std::iter::once(channel))?;
        }
        Payload::WorkspaceInfo(w) => {
            tx.execute(
                "INSERT INTO WORKSPACE (CHUNK_ID, TEAM_ID, TEAM, USER_ID, ENTERPRISE_ID, URL, DATA) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chunk_id,
                    w.team_id,
                    w.team,
                    w.user_id,
                    w.enterprise_id,
                    w.url,
                    serde_json::to_string(w)?,
                ],
            )?;
        }
        Payload::ChannelUsers(users) => {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO CHANNEL_USER (CHANNEL_ID, USER_ID, CHUNK_ID, IDX) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (idx, u) in users.iter().enumerate() {
                stmt.execute(params![chunk.channel_id, u, chunk_id, idx as i64])?;
            }
        }
        Payload::SearchMessages(messages) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO SEARCH_MESSAGE (CHUNK_ID, CHANNEL_ID, CHANNEL_NAME, TS, TXT, IDX, DATA) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (idx, m) in messages.iter().enumerate() {
                stmt.execute(params![
                    chunk_id,
                    m.channel_id,
                    m.channel_name,
                    m.ts,
                    m.text,
                    idx as i64,
                    serde_json::to_string(m)?,
                ])?;
            }
        }
        Payload::SearchFiles(files) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO SEARCH_FILE (CHUNK_ID, FILE_ID, IDX, DATA) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (idx, f) in files.iter().enumerate() {
                stmt.execute(params![chunk_id, f.id, idx as i64, serde_json::to_string(f)?])?;
            }
        }
    }

    Ok(chunk_id)
}

fn insert_messages<'a>(
    tx: &Transaction,
    chunk: &Chunk,
    chunk_id: i64,
    parent_id: Option<i64>,
    messages: impl Iterator<Item = &'a Message>,
) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO MESSAGE (ID, CHUNK_ID, CHANNEL_ID, TS, PARENT_ID, THREAD_TS, IS_PARENT, \
         IDX, NUM_FILES, TXT, DATA) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for (idx, m) in messages.enumerate() {
        let id = message_id(chunk, &m.ts)?;
        let thread_ts = m.thread_ts.as_deref().or(chunk.thread_ts.as_deref());
        let parent = match parent_id {
            Some(p) => Some(p),
            None => m.thread_ts.as_deref().and_then(ts_to_micros),
        };
        stmt.execute(params![
            id,
            chunk_id,
            chunk.channel_id,
            m.ts,
            parent,
            thread_ts,
            m.is_thread_parent(),
            idx as i64,
            m.files.len() as i64,
            m.text,
            serde_json::to_string(m)?,
        ])?;
    }
    Ok(())
}

fn insert_channels<'a>(
    tx: &Transaction,
    chunk_id: i64,
    channels: impl Iterator<Item = &'a crate::types::Channel>,
) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO CHANNEL (ID, CHUNK_ID, NAME, IDX, DATA) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (idx, c) in channels.enumerate() {
        stmt.execute(params![c.id, chunk_id, c.name, idx as i64, serde_json::to_string(c)?])?;
    }
    Ok(())
}

impl ChunkStore for ChunkDB {
    /// 行在写入时创建，无需打开
    fn open(&self, _key: &FileKey) -> Result<()> {
        Ok(())
    }

    fn write(&self, _key: &FileKey, chunk: &Chunk) -> Result<()> {
        self.insert_chunk(chunk).map(|_| ())
    }

    /// 与数据库中的完成度核对
    fn finalise(&self, key: &FileKey) -> Result<()> {
        if key.is_dictionary() {
            return Ok(());
        }
        let done = match key.thread_ts() {
            Some(ts) => self.is_finalised_thread(key.entity_id(), ts)?,
            None => self.is_finalised(key.entity_id())?,
        };
        if !done {
            warn!(key = %key, "unit finalised in memory but not in database");
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        ChunkDB::close(self)
    }
}

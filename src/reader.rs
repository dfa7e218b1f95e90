//! 关系型后端（读取端）
//!
//! 独立的只读连接，写入进行中也能读取已提交的数据。
//!
//! - 字典类（频道、用户、工作区信息、频道成员）：同 id 取 CHUNK_ID 最大的版本
//! - 流式（消息、文件、搜索结果）：所有 chunk 的行都可见
//!
//! 列表查询返回 `Rows<T>`：惰性、单次、按页从数据库读取。

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::chunk::ChunkType;
use crate::db::{session_from_row, SESSION_COLUMNS};
use crate::error::{Error, Result};
use crate::storage::Source;
use crate::types::{
    ts_to_micros, Channel, File, Message, SearchMessage, Session, User, WorkspaceInfo,
};

/// 每页行数
const PAGE_SIZE: i64 = 500;

/// 续页条件：严格大于上一页最后一行的 (ID, CHUNK_ID)
const AFTER_CURSOR: &str = " AND (T.ID, T.CHUNK_ID) > (?, ?)";

/// 首页与续页两条语句，除游标条件外完全一致
struct PageQuery {
    first: String,
    next: String,
}

impl PageQuery {
    fn build(make: impl Fn(&str) -> String) -> Self {
        Self {
            first: make(""),
            next: make(AFTER_CURSOR),
        }
    }
}

/// 惰性行序列
///
/// 按 (ID, CHUNK_ID) 键集分页，每页记下最后一行的键，
/// 读取过程中有新写入也不会重复或漏掉已越过的行。
/// 出错后序列结束。需要多次遍历时先 `collect`。
pub struct Rows<'r, T> {
    conn: &'r Mutex<Connection>,
    query: PageQuery,
    binds: Vec<Value>,
    cursor: Option<(Value, i64)>,
    page: VecDeque<String>,
    exhausted: bool,
    failed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'r, T: DeserializeOwned> Rows<'r, T> {
    fn new(conn: &'r Mutex<Connection>, query: PageQuery, binds: Vec<Value>) -> Self {
        Self {
            conn,
            query,
            binds,
            cursor: None,
            page: VecDeque::new(),
            exhausted: false,
            failed: false,
            _marker: PhantomData,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        let page = {
            let conn = self.conn.lock();
            let (sql, mut tail) = match &self.cursor {
                None => (&self.query.first, Vec::with_capacity(1)),
                Some((id, chunk_id)) => (
                    &self.query.next,
                    vec![id.clone(), Value::Integer(*chunk_id)],
                ),
            };
            tail.push(Value::Integer(PAGE_SIZE));
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params_from_iter(self.binds.iter().chain(tail.iter())), |row| {
                Ok((
                    row.get::<_, Value>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        if (page.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((id, chunk_id, _)) = page.last() {
            self.cursor = Some((id.clone(), *chunk_id));
        }
        self.page.extend(page.into_iter().map(|(_, _, data)| data));
        Ok(())
    }
}

impl<T: DeserializeOwned> Iterator for Rows<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let data = self.page.pop_front()?;
        match serde_json::from_str(&data) {
            Ok(v) => Some(Ok(v)),
            Err(e) => {
                self.failed = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// "最新版本" 查询：同 id 取 CHUNK_ID 最大的行
fn latest_sql(table: &str, types: &[ChunkType], filter: &str) -> PageQuery {
    let type_filter = if types.is_empty() {
        String::new()
    } else {
        let ids: Vec<String> = types.iter().map(|t| t.id().to_string()).collect();
        format!(" AND CH.TYPE_ID IN ({})", ids.join(","))
    };
    PageQuery::build(|cursor| {
        format!(
            "WITH LATEST AS (\
                SELECT T.ID, MAX(T.CHUNK_ID) AS CHUNK_ID \
                FROM {table} AS T JOIN CHUNK AS CH ON CH.ID = T.CHUNK_ID \
                WHERE 1 = 1{type_filter}{filter} \
                GROUP BY T.ID) \
             SELECT T.ID, T.CHUNK_ID, T.DATA FROM {table} AS T \
             JOIN LATEST AS L ON L.ID = T.ID AND L.CHUNK_ID = T.CHUNK_ID \
             WHERE 1 = 1{cursor} \
             ORDER BY T.ID, T.CHUNK_ID LIMIT ?"
        )
    })
}

/// 流式查询：全部行，按 (ID, CHUNK_ID) 排序
fn stream_sql(table: &str, chunk_type: ChunkType, filter: &str) -> PageQuery {
    let type_id = chunk_type.id();
    PageQuery::build(|cursor| {
        format!(
            "SELECT T.ID, T.CHUNK_ID, T.DATA FROM {table} AS T JOIN CHUNK AS CH ON CH.ID = T.CHUNK_ID \
             WHERE CH.TYPE_ID = {type_id}{filter}{cursor} \
             ORDER BY T.ID, T.CHUNK_ID LIMIT ?"
        )
    })
}

/// 只读访问
pub struct ArchiveReader {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ArchiveReader {
    /// 以只读方式打开
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound(format!("数据库: {:?}", path)));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rows<T: DeserializeOwned>(&self, query: PageQuery, binds: Vec<Value>) -> Rows<'_, T> {
        Rows::new(&self.conn, query, binds)
    }

    // ==================== 字典类 ====================

    /// 所有频道（列表和频道信息两种 chunk）
    pub fn channels(&self) -> Rows<'_, Channel> {
        self.channels_of_type(&[])
    }

    /// 按 chunk 类型过滤的频道
    pub fn channels_of_type(&self, types: &[ChunkType]) -> Rows<'_, Channel> {
        self.rows(latest_sql("CHANNEL", types, ""), vec![])
    }

    pub fn users(&self) -> Rows<'_, User> {
        self.rows(latest_sql("S_USER", &[ChunkType::Users], ""), vec![])
    }

    pub fn channel_info(&self, channel_id: &str) -> Result<Option<Channel>> {
        let mut rows = self.rows(
            latest_sql("CHANNEL", &[], " AND T.ID = ?"),
            vec![Value::Text(channel_id.to_string())],
        );
        rows.next().transpose()
    }

    pub fn workspace_info(&self) -> Result<Option<WorkspaceInfo>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT DATA FROM WORKSPACE ORDER BY CHUNK_ID DESC, ID DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }

    /// 最新的频道成员列表
    pub fn channel_users(&self, channel_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT USER_ID FROM CHANNEL_USER WHERE CHANNEL_ID = ?1 AND CHUNK_ID = \
             (SELECT MAX(CHUNK_ID) FROM CHANNEL_USER WHERE CHANNEL_ID = ?1) ORDER BY IDX",
        )?;
        let rows = stmt.query_map([channel_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 流式 ====================

    /// 频道消息（不含线程页）
    pub fn all_messages(&self, channel_id: &str) -> Rows<'_, Message> {
        self.rows(
            stream_sql("MESSAGE", ChunkType::Messages, " AND T.CHANNEL_ID = ?"),
            vec![Value::Text(channel_id.to_string())],
        )
    }

    /// 线程页中的消息（每页都带父消息）
    pub fn all_thread_messages(&self, channel_id: &str, thread_ts: &str) -> Result<Rows<'_, Message>> {
        let parent_id = ts_to_micros(thread_ts)
            .ok_or_else(|| Error::Config(format!("无效的 thread_ts: {:?}", thread_ts)))?;
        Ok(self.rows(
            stream_sql(
                "MESSAGE",
                ChunkType::ThreadMessages,
                " AND T.CHANNEL_ID = ? AND T.PARENT_ID = ?",
            ),
            vec![
                Value::Text(channel_id.to_string()),
                Value::Integer(parent_id),
            ],
        ))
    }

    pub fn all_files(&self, channel_id: &str) -> Rows<'_, File> {
        self.rows(
            stream_sql("FILE", ChunkType::Files, " AND T.CHANNEL_ID = ?"),
            vec![Value::Text(channel_id.to_string())],
        )
    }

    pub fn search_messages(&self) -> Rows<'_, SearchMessage> {
        self.rows(
            stream_sql("SEARCH_MESSAGE", ChunkType::SearchMessages, ""),
            vec![],
        )
    }

    pub fn search_files(&self) -> Rows<'_, File> {
        self.rows(stream_sql("SEARCH_FILE", ChunkType::SearchFiles, ""), vec![])
    }

    // ==================== 会话 ====================

    pub fn sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM SESSION ORDER BY ID", SESSION_COLUMNS))?;
        let rows = stmt.query_map([], session_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 某个会话写入的 chunk 数
    pub fn count_chunks(&self, session_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM CHUNK WHERE SESSION_ID = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl Source for ArchiveReader {
    fn channel_info(&self, channel_id: &str) -> Result<Option<Channel>> {
        ArchiveReader::channel_info(self, channel_id)
    }

    fn all_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        ArchiveReader::all_messages(self, channel_id).collect()
    }

    /// 同一条消息可能出现在多页中，按 ts 去重
    fn all_thread_messages(&self, channel_id: &str, thread_ts: &str) -> Result<Vec<Message>> {
        let mut by_ts = BTreeMap::new();
        for m in ArchiveReader::all_thread_messages(self, channel_id, thread_ts)? {
            let m = m?;
            by_ts
                .entry(ts_to_micros(&m.ts).unwrap_or(0))
                .or_insert(m);
        }
        Ok(by_ts.into_values().collect())
    }
}

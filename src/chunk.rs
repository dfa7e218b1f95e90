//! Chunk 模型
//!
//! Chunk 是一次 API 分页结果的不可变记录：类型、时间戳、所属频道、记录数、
//! 是否最后一页，以及唯一的一份负载。负载用枚举表达，因此
//! "每种类型只有一个负载" 在类型层面成立。
//!
//! `FileKey` 决定 chunk 落到哪个存储分段，也是引用计数的键。

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Channel, File, Message, SearchMessage, User, WorkspaceInfo};

/// Chunk 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkType {
    Messages = 0,
    ThreadMessages = 1,
    Files = 2,
    Users = 3,
    Channels = 4,
    ChannelInfo = 5,
    WorkspaceInfo = 6,
    ChannelUsers = 7,
    SearchMessages = 8,
    SearchFiles = 9,
}

impl ChunkType {
    pub const ALL: [ChunkType; 10] = [
        ChunkType::Messages,
        ChunkType::ThreadMessages,
        ChunkType::Files,
        ChunkType::Users,
        ChunkType::Channels,
        ChunkType::ChannelInfo,
        ChunkType::WorkspaceInfo,
        ChunkType::ChannelUsers,
        ChunkType::SearchMessages,
        ChunkType::SearchFiles,
    ];

    /// 数据库中的 TYPE_ID
    pub fn id(self) -> i64 {
        self as u8 as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }

    /// 字典类实体：只有最新版本有效
    pub fn is_dictionary(self) -> bool {
        matches!(
            self,
            ChunkType::Users
                | ChunkType::Channels
                | ChunkType::ChannelInfo
                | ChunkType::WorkspaceInfo
                | ChunkType::ChannelUsers
        )
    }

    /// 流式实体：只追加，不覆盖
    pub fn is_stream(self) -> bool {
        !self.is_dictionary()
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkType::Messages => "messages",
            ChunkType::ThreadMessages => "thread_messages",
            ChunkType::Files => "files",
            ChunkType::Users => "users",
            ChunkType::Channels => "channels",
            ChunkType::ChannelInfo => "channel_info",
            ChunkType::WorkspaceInfo => "workspace_info",
            ChunkType::ChannelUsers => "channel_users",
            ChunkType::SearchMessages => "search_messages",
            ChunkType::SearchFiles => "search_files",
        };
        f.write_str(s)
    }
}

/// Chunk 负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum Payload {
    Messages(Vec<Message>),
    ThreadMessages {
        parent: Message,
        messages: Vec<Message>,
    },
    Files {
        channel: Channel,
        parent: Message,
        files: Vec<File>,
    },
    Users(Vec<User>),
    Channels(Vec<Channel>),
    ChannelInfo(Channel),
    WorkspaceInfo(WorkspaceInfo),
    ChannelUsers(Vec<String>),
    SearchMessages(Vec<SearchMessage>),
    SearchFiles(Vec<File>),
}

impl Payload {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Payload::Messages(_) => ChunkType::Messages,
            Payload::ThreadMessages { .. } => ChunkType::ThreadMessages,
            Payload::Files { .. } => ChunkType::Files,
            Payload::Users(_) => ChunkType::Users,
            Payload::Channels(_) => ChunkType::Channels,
            Payload::ChannelInfo(_) => ChunkType::ChannelInfo,
            Payload::WorkspaceInfo(_) => ChunkType::WorkspaceInfo,
            Payload::ChannelUsers(_) => ChunkType::ChannelUsers,
            Payload::SearchMessages(_) => ChunkType::SearchMessages,
            Payload::SearchFiles(_) => ChunkType::SearchFiles,
        }
    }

    /// 负载中的记录数
    pub fn len(&self) -> usize {
        match self {
            Payload::Messages(m) => m.len(),
            Payload::ThreadMessages { messages, .. } => messages.len(),
            Payload::Files { files, .. } => files.len(),
            Payload::Users(u) => u.len(),
            Payload::Channels(c) => c.len(),
            Payload::ChannelInfo(_) | Payload::WorkspaceInfo(_) => 1,
            Payload::ChannelUsers(u) => u.len(),
            Payload::SearchMessages(m) => m.len(),
            Payload::SearchFiles(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// 创建时间 (纳秒)
    #[serde(rename = "ts")]
    pub timestamp: i64,
    /// 所属频道，字典类 chunk 可为空
    #[serde(rename = "id", default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(rename = "n")]
    pub count: usize,
    /// 本页发现的线程数（仅 Messages）
    #[serde(rename = "nt", default, skip_serializing_if = "is_zero")]
    pub num_threads: usize,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(rename = "l", default)]
    pub is_last: bool,
    #[serde(rename = "to", default, skip_serializing_if = "is_false")]
    pub thread_only: bool,
    #[serde(rename = "sq", default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    #[serde(rename = "p")]
    pub payload: Payload,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros() * 1000)
}

impl Chunk {
    fn with_payload(channel_id: &str, payload: Payload) -> Self {
        Self {
            timestamp: now_nanos(),
            channel_id: channel_id.to_string(),
            count: payload.len(),
            num_threads: 0,
            thread_ts: None,
            is_last: false,
            thread_only: false,
            search_query: None,
            payload,
        }
    }

    /// 频道消息页
    pub fn messages(
        channel_id: &str,
        num_threads: usize,
        is_last: bool,
        messages: Vec<Message>,
    ) -> Self {
        let mut c = Self::with_payload(channel_id, Payload::Messages(messages));
        c.num_threads = num_threads;
        c.is_last = is_last;
        c
    }

    /// 线程消息页
    pub fn thread_messages(
        channel_id: &str,
        parent: Message,
        thread_only: bool,
        is_last: bool,
        messages: Vec<Message>,
    ) -> Self {
        let thread_ts = parent.ts.clone();
        let mut c = Self::with_payload(channel_id, Payload::ThreadMessages { parent, messages });
        c.thread_ts = Some(thread_ts);
        c.thread_only = thread_only;
        c.is_last = is_last;
        c
    }

    /// 消息附带的文件
    pub fn files(channel: Channel, parent: Message, files: Vec<File>) -> Self {
        let channel_id = channel.id.clone();
        let thread_ts = parent.thread_ts.clone();
        let mut c = Self::with_payload(
            &channel_id,
            Payload::Files {
                channel,
                parent,
                files,
            },
        );
        c.thread_ts = thread_ts;
        c
    }

    pub fn users(users: Vec<User>) -> Self {
        Self::with_payload("", Payload::Users(users))
    }

    pub fn channels(channels: Vec<Channel>) -> Self {
        Self::with_payload("", Payload::Channels(channels))
    }

    /// 单个频道信息，线程专属归档时带 thread_ts
    pub fn channel_info(channel: Channel, thread_ts: Option<&str>) -> Self {
        let channel_id = channel.id.clone();
        let mut c = Self::with_payload(&channel_id, Payload::ChannelInfo(channel));
        c.thread_ts = thread_ts.map(str::to_string);
        c.thread_only = thread_ts.is_some();
        c
    }

    pub fn workspace_info(info: WorkspaceInfo) -> Self {
        Self::with_payload("", Payload::WorkspaceInfo(info))
    }

    pub fn channel_users(channel_id: &str, thread_ts: Option<&str>, users: Vec<String>) -> Self {
        let mut c = Self::with_payload(channel_id, Payload::ChannelUsers(users));
        c.thread_ts = thread_ts.map(str::to_string);
        c.thread_only = thread_ts.is_some();
        c
    }

    pub fn search_messages(query: &str, messages: Vec<SearchMessage>) -> Self {
        let mut c = Self::with_payload("", Payload::SearchMessages(messages));
        c.search_query = Some(query.to_string());
        c
    }

    pub fn search_files(query: &str, files: Vec<File>) -> Self {
        let mut c = Self::with_payload("", Payload::SearchFiles(files));
        c.search_query = Some(query.to_string());
        c
    }

    pub fn chunk_type(&self) -> ChunkType {
        self.payload.chunk_type()
    }

    /// chunk 所属分段
    pub fn file_key(&self) -> FileKey {
        match self.chunk_type() {
            ChunkType::Users => FileKey::users(),
            ChunkType::Channels => FileKey::channels(),
            ChunkType::WorkspaceInfo => FileKey::workspace(),
            ChunkType::SearchMessages | ChunkType::SearchFiles => FileKey::search(),
            _ => match self.thread_ts.as_deref() {
                Some(ts) if self.thread_only => FileKey::thread(&self.channel_id, ts, true),
                _ => FileKey::channel(&self.channel_id),
            },
        }
    }

    /// 基本一致性检查
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidPayload {
            chunk_type: self.chunk_type().to_string(),
            channel_id: self.channel_id.clone(),
            reason: reason.to_string(),
        };
        if self.count != self.payload.len() {
            return Err(invalid("记录数与负载不一致"));
        }
        match self.chunk_type() {
            ChunkType::Messages
            | ChunkType::ThreadMessages
            | ChunkType::Files
            | ChunkType::ChannelInfo
            | ChunkType::ChannelUsers
                if self.channel_id.is_empty() =>
            {
                Err(invalid("缺少频道 id"))
            }
            ChunkType::ThreadMessages if self.thread_ts.is_none() => Err(invalid("缺少 thread_ts")),
            _ => Ok(()),
        }
    }
}

/// 存储分段 / 引用计数的键
///
/// 普通频道与其下的非专属线程共用频道的键；线程专属归档有自己的键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    entity_id: String,
    thread_ts: Option<String>,
}

const USERS_KEY: &str = "users";
const CHANNELS_KEY: &str = "channels";
const WORKSPACE_KEY: &str = "workspace";
const SEARCH_KEY: &str = "search";

impl FileKey {
    pub fn channel(channel_id: &str) -> Self {
        Self {
            entity_id: channel_id.to_string(),
            thread_ts: None,
        }
    }

    /// 线程的键：非专属线程归并到频道
    pub fn thread(channel_id: &str, thread_ts: &str, thread_only: bool) -> Self {
        if thread_only {
            Self {
                entity_id: channel_id.to_string(),
                thread_ts: Some(thread_ts.to_string()),
            }
        } else {
            Self::channel(channel_id)
        }
    }

    pub fn users() -> Self {
        Self::channel(USERS_KEY)
    }

    pub fn channels() -> Self {
        Self::channel(CHANNELS_KEY)
    }

    pub fn workspace() -> Self {
        Self::channel(WORKSPACE_KEY)
    }

    pub fn search() -> Self {
        Self::channel(SEARCH_KEY)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn thread_ts(&self) -> Option<&str> {
        self.thread_ts.as_deref()
    }

    pub fn is_thread_only(&self) -> bool {
        self.thread_ts.is_some()
    }

    /// 字典分段（users / channels / workspace / search）
    pub fn is_dictionary(&self) -> bool {
        self.thread_ts.is_none()
            && matches!(
                self.entity_id.as_str(),
                USERS_KEY | CHANNELS_KEY | WORKSPACE_KEY | SEARCH_KEY
            )
    }

    /// 分段文件名（不含扩展名）
    pub fn file_name(&self) -> String {
        match &self.thread_ts {
            Some(ts) => format!("{}-{}", self.entity_id, ts),
            None => self.entity_id.clone(),
        }
    }

    /// 从分段文件名还原
    pub fn from_file_name(name: &str) -> Self {
        match name.split_once('-') {
            Some((id, ts)) if !id.is_empty() && !ts.is_empty() => Self {
                entity_id: id.to_string(),
                thread_ts: Some(ts.to_string()),
            },
            _ => Self::channel(name),
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(ts: &str) -> Message {
        let mut m = Message::new(ts, "U1", "parent");
        m.thread_ts = Some(ts.to_string());
        m.reply_count = 1;
        m
    }

    #[test]
    fn test_chunk_type_ids() {
        for t in ChunkType::ALL {
            assert_eq!(ChunkType::from_id(t.id()), Some(t));
        }
        assert_eq!(ChunkType::from_id(42), None);
        assert!(ChunkType::Channels.is_dictionary());
        assert!(ChunkType::Messages.is_stream());
        assert!(ChunkType::SearchFiles.is_stream());
    }

    #[test]
    fn test_thread_key_normalises_to_channel() {
        let shared = FileKey::thread("C1", "100.000001", false);
        assert_eq!(shared, FileKey::channel("C1"));

        let own = FileKey::thread("C1", "100.000001", true);
        assert_ne!(own, FileKey::channel("C1"));
        assert!(own.is_thread_only());
        assert_eq!(own.file_name(), "C1-100.000001");
        assert_eq!(FileKey::from_file_name("C1-100.000001"), own);
        assert_eq!(FileKey::from_file_name("C1"), FileKey::channel("C1"));
    }

    #[test]
    fn test_chunk_file_keys() {
        let c = Chunk::messages("C1", 2, false, vec![Message::new("1.0", "U1", "a")]);
        assert_eq!(c.file_key(), FileKey::channel("C1"));
        assert_eq!(c.count, 1);

        let t = Chunk::thread_messages("C1", parent("5.0"), false, true, vec![]);
        assert_eq!(t.file_key(), FileKey::channel("C1"));

        let t = Chunk::thread_messages("C1", parent("5.0"), true, true, vec![]);
        assert_eq!(t.file_key(), FileKey::thread("C1", "5.0", true));

        assert_eq!(Chunk::users(vec![]).file_key(), FileKey::users());
        assert!(FileKey::users().is_dictionary());
        assert_eq!(
            Chunk::search_files("q", vec![]).file_key(),
            FileKey::search()
        );
    }

    #[test]
    fn test_chunk_json_shape() {
        let c = Chunk::channel_info(Channel::new("C1", "general"), None);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["id"], "C1");
        assert_eq!(v["p"]["t"], "channel_info");
        assert_eq!(v["p"]["d"]["name"], "general");

        let back: Chunk = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_validate() {
        let mut c = Chunk::messages("C1", 0, true, vec![Message::new("1.0", "U1", "a")]);
        assert!(c.validate().is_ok());

        c.count = 3;
        assert!(matches!(c.validate(), Err(Error::InvalidPayload { .. })));

        let c = Chunk::messages("", 0, true, vec![]);
        assert!(c.validate().is_err());
    }
}

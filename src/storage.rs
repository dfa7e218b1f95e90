//! 存储接口
//!
//! 目录后端 (`ChunkDirectory`) 和关系型后端 (`ChunkDB`) 都实现 `ChunkStore`，
//! 同一套记录器与控制器可以驱动任意一个。`Source` 是转换时的只读视图。

use crate::chunk::{Chunk, FileKey};
use crate::error::Result;
use crate::types::{Channel, Message};

/// chunk 写入端
pub trait ChunkStore: Send + Sync {
    /// 打开分段（幂等）
    fn open(&self, key: &FileKey) -> Result<()>;

    /// 按到达顺序追加 chunk
    fn write(&self, key: &FileKey, chunk: &Chunk) -> Result<()>;

    /// 单元完成：关闭分段并标记为可回放
    fn finalise(&self, key: &FileKey) -> Result<()>;

    /// 关闭后端，未完成的分段保留但不标记完成
    fn close(&self) -> Result<()>;
}

/// 转换时读取的数据源
pub trait Source: Send + Sync {
    fn channel_info(&self, channel_id: &str) -> Result<Option<Channel>>;

    /// 频道消息（不含线程回复）
    fn all_messages(&self, channel_id: &str) -> Result<Vec<Message>>;

    /// 线程消息（含父消息）
    fn all_thread_messages(&self, channel_id: &str, thread_ts: &str) -> Result<Vec<Message>>;
}
